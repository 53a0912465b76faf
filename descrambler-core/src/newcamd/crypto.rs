//! Key derivation and message encryption of the newcamd protocol.

use des::cipher::generic_array::GenericArray;
use des::cipher::{BlockDecrypt, BlockEncrypt, KeyInit};
use des::TdesEde2;

use crate::client::{ClientError, ClientResult};

/// Largest message on the wire, length prefix included.
pub const MAX_MESSAGE: usize = 1024;

const BLOCK: usize = 8;

/// Expands 14 key bytes into two DES keys with odd parity.
pub fn spread_key(normal: &[u8; 14]) -> [u8; 16] {
    let n = normal;
    let mut spread = [
        n[0] & 0xfe,
        ((n[0] << 7) | (n[1] >> 1)) & 0xfe,
        ((n[1] << 6) | (n[2] >> 2)) & 0xfe,
        ((n[2] << 5) | (n[3] >> 3)) & 0xfe,
        ((n[3] << 4) | (n[4] >> 4)) & 0xfe,
        ((n[4] << 3) | (n[5] >> 5)) & 0xfe,
        ((n[5] << 2) | (n[6] >> 6)) & 0xfe,
        n[6] << 1,
        n[7] & 0xfe,
        ((n[7] << 7) | (n[8] >> 1)) & 0xfe,
        ((n[8] << 6) | (n[9] >> 2)) & 0xfe,
        ((n[9] << 5) | (n[10] >> 3)) & 0xfe,
        ((n[10] << 4) | (n[11] >> 4)) & 0xfe,
        ((n[11] << 3) | (n[12] >> 5)) & 0xfe,
        ((n[12] << 2) | (n[13] >> 6)) & 0xfe,
        n[13] << 1,
    ];
    for byte in &mut spread {
        // the low bit makes the number of set bits odd
        if (*byte >> 1).count_ones() % 2 == 0 {
            *byte |= 1;
        }
    }
    spread
}

/// Triple DES (two keys) in CBC mode over the message body.
#[derive(Clone)]
pub struct MessageCipher {
    cipher: TdesEde2,
}

impl MessageCipher {
    fn from_key14(key: &[u8; 14]) -> ClientResult<Self> {
        let spread = spread_key(key);
        let cipher = TdesEde2::new_from_slice(&spread)
            .map_err(|_| ClientError::HandshakeFailed("invalid DES key".to_string()))?;
        Ok(Self { cipher })
    }

    /// Key for the login exchange: the configured key mixed with the 14
    /// random bytes the server sends on connect.
    pub fn login(deskey: &[u8; 14], random: &[u8; 14]) -> ClientResult<Self> {
        let mut key = *deskey;
        for (k, r) in key.iter_mut().zip(random) {
            *k ^= r;
        }
        Self::from_key14(&key)
    }

    /// Key for the rest of the session: the configured key mixed with the
    /// crypted password.
    pub fn session(deskey: &[u8; 14], crypted_password: &str) -> ClientResult<Self> {
        let mut key = *deskey;
        for (i, b) in crypted_password.bytes().enumerate() {
            key[i % key.len()] ^= b;
        }
        Self::from_key14(&key)
    }

    /// Pads `buf[2..]` to whole blocks, appends the XOR checksum, encrypts
    /// it and appends the random IV. The first two bytes are left alone.
    pub fn seal(&self, buf: &mut Vec<u8>) -> ClientResult<()> {
        self.seal_with(buf, rand::random(), rand::random())
    }

    /// [`MessageCipher::seal`] with the padding bytes and IV supplied.
    fn seal_with(&self, buf: &mut Vec<u8>, filler: [u8; BLOCK], iv: [u8; BLOCK]) -> ClientResult<()> {
        let len = buf.len();
        if len < 2 {
            return Err(ClientError::Framing("message without length prefix".to_string()));
        }
        let pad = (BLOCK - (len - 1) % BLOCK) % BLOCK;
        if len + pad + 1 >= MAX_MESSAGE - BLOCK {
            return Err(ClientError::Oversize(len));
        }
        buf.extend_from_slice(&filler[..pad]);
        let checksum = buf[2..].iter().fold(0u8, |acc, b| acc ^ b);
        buf.push(checksum);

        let mut chain = iv;
        for chunk in buf[2..].chunks_exact_mut(BLOCK) {
            for (b, c) in chunk.iter_mut().zip(&chain) {
                *b ^= c;
            }
            self.cipher.encrypt_block(GenericArray::from_mut_slice(chunk));
            chain.copy_from_slice(chunk);
        }
        buf.extend_from_slice(&iv);
        Ok(())
    }

    /// Reverses [`MessageCipher::seal`] in place and returns the length of
    /// the decrypted part, length prefix included.
    pub fn open(&self, buf: &mut [u8]) -> ClientResult<usize> {
        let len = buf.len();
        if len < 2 || (len - 2) % BLOCK != 0 || len - 2 < 2 * BLOCK {
            return Err(ClientError::Framing(format!("bad encrypted length {len}")));
        }
        let end = len - BLOCK;
        let mut chain = [0u8; BLOCK];
        chain.copy_from_slice(&buf[end..]);
        for chunk in buf[2..end].chunks_exact_mut(BLOCK) {
            let mut next = [0u8; BLOCK];
            next.copy_from_slice(chunk);
            self.cipher.decrypt_block(GenericArray::from_mut_slice(chunk));
            for (b, c) in chunk.iter_mut().zip(&chain) {
                *b ^= c;
            }
            chain = next;
        }
        if buf[2..end].iter().fold(0u8, |acc, b| acc ^ b) != 0 {
            return Err(ClientError::Checksum);
        }
        Ok(end)
    }
}

const ITOA64: &[u8; 64] = b"./0123456789ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz";

/// MD5-based `crypt(3)` as used for newcamd passwords, e.g.
/// `md5_crypt("secret", "$1$abcdefgh$")`.
pub fn md5_crypt(password: &str, salt: &str) -> String {
    const MAGIC: &str = "$1$";
    let pw = password.as_bytes();
    let salt = salt.strip_prefix(MAGIC).unwrap_or(salt);
    let salt = salt.split('$').next().unwrap_or_default();
    let salt = &salt.as_bytes()[..salt.len().min(8)];

    let mut alt = md5::Context::new();
    alt.consume(pw);
    alt.consume(salt);
    alt.consume(pw);
    let alt = alt.compute();

    let mut ctx = md5::Context::new();
    ctx.consume(pw);
    ctx.consume(MAGIC.as_bytes());
    ctx.consume(salt);
    let mut remaining = pw.len();
    while remaining > 0 {
        let n = remaining.min(16);
        ctx.consume(&alt.0[..n]);
        remaining -= n;
    }
    let mut i = pw.len();
    while i > 0 {
        if i & 1 == 1 {
            ctx.consume([0u8]);
        } else {
            ctx.consume(&pw[..1]);
        }
        i >>= 1;
    }
    let mut fin = ctx.compute().0;

    for round in 0..1000 {
        let mut ctx = md5::Context::new();
        if round & 1 == 1 {
            ctx.consume(pw);
        } else {
            ctx.consume(fin);
        }
        if round % 3 != 0 {
            ctx.consume(salt);
        }
        if round % 7 != 0 {
            ctx.consume(pw);
        }
        if round & 1 == 1 {
            ctx.consume(fin);
        } else {
            ctx.consume(pw);
        }
        fin = ctx.compute().0;
    }

    let mut out = String::with_capacity(34);
    out.push_str(MAGIC);
    out.push_str(&String::from_utf8_lossy(salt));
    out.push('$');
    let mut to64 = |mut v: u32, n: usize| {
        for _ in 0..n {
            out.push(ITOA64[(v & 0x3f) as usize] as char);
            v >>= 6;
        }
    };
    let f = |i: usize| u32::from(fin[i]);
    to64(f(0) << 16 | f(6) << 8 | f(12), 4);
    to64(f(1) << 16 | f(7) << 8 | f(13), 4);
    to64(f(2) << 16 | f(8) << 8 | f(14), 4);
    to64(f(3) << 16 | f(9) << 8 | f(15), 4);
    to64(f(4) << 16 | f(10) << 8 | f(5), 4);
    to64(f(11), 2);
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    const DESKEY: [u8; 14] = [0, 1, 2, 3, 4, 5, 6, 7, 8, 9, 10, 11, 12, 13];

    #[test]
    fn test_md5_crypt() {
        assert_eq!(md5_crypt("secret", "$1$abcdefgh$"), "$1$abcdefgh$cHJi5PXp/ki/ktXzqlk6I1");
        assert_eq!(
            md5_crypt("a-much-longer-password-over-16", "$1$abcdefgh$"),
            "$1$abcdefgh$9gMvQHMrf0myrbxnuyWoe0"
        );
    }

    #[test]
    fn test_spread_key_parity() {
        let spread = spread_key(&DESKEY);
        assert!(spread.iter().all(|b| b.count_ones() % 2 == 1));
        assert_eq!(spread[0], 0x01);
        // bit 0 of byte 0 moves to the top of byte 1
        let mut key = [0u8; 14];
        key[0] = 0x01;
        assert_eq!(spread_key(&key)[1] & 0xfe, 0x80);
    }

    const SEED: [u8; 14] = [7, 1, 9, 3, 5, 2, 8, 4, 6, 0, 11, 13, 12, 10];

    #[test]
    fn test_spread_key_reference() {
        let mut key = DESKEY;
        for (k, r) in key.iter_mut().zip(&SEED) {
            *k ^= r;
        }
        assert_eq!(
            spread_key(&key),
            [
                0x07, 0x80, 0x02, 0x61, 0x01, 0x08, 0x1c, 0x1c, 0x02, 0x86, 0x83, 0x20, 0x10, 0x31, 0x01, 0x0e
            ]
        );
    }

    /// Login frame `user\0` under the login key, five pad bytes, IV last.
    const LOGIN_PLAIN: [u8; 26] = [
        0x00, 0x00, 0x00, 0x00, 0x65, 0x02, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0xe0, 0x00, 0x05, 0x75, 0x73, 0x65,
        0x72, 0x00, 0xa1, 0xa2, 0xa3, 0xa4, 0xa5, 0x32,
    ];
    const LOGIN_SEALED: [u8; 34] = [
        0x00, 0x00, 0xee, 0xa4, 0x5c, 0x51, 0x7f, 0x05, 0xdf, 0x9a, 0x8e, 0x40, 0x29, 0x1e, 0xa4, 0xd4, 0x49, 0x8b,
        0xc5, 0xde, 0x96, 0x51, 0xab, 0x4f, 0x0d, 0x04, 0x10, 0x32, 0x54, 0x76, 0x98, 0xba, 0xdc, 0xfe,
    ];

    #[test]
    fn test_login_cipher_reference() {
        let cipher = MessageCipher::login(&DESKEY, &SEED).unwrap();
        let mut buf = LOGIN_PLAIN[..20].to_vec();
        let filler = [0xa1, 0xa2, 0xa3, 0xa4, 0xa5, 0xa6, 0xa7, 0xa8];
        let iv = [0x10, 0x32, 0x54, 0x76, 0x98, 0xba, 0xdc, 0xfe];
        cipher.seal_with(&mut buf, filler, iv).unwrap();
        assert_eq!(buf, LOGIN_SEALED);

        let mut sealed = LOGIN_SEALED;
        assert_eq!(cipher.open(&mut sealed).unwrap(), LOGIN_PLAIN.len());
        assert_eq!(&sealed[..LOGIN_PLAIN.len()], &LOGIN_PLAIN[..]);
    }

    #[test]
    fn test_seal_then_open() {
        let cipher = MessageCipher::session(&DESKEY, "$1$abcdefgh$cHJi5PXp/ki/ktXzqlk6I1").unwrap();
        let mut buf = vec![0, 0, 0, 1, 0, 0, 0x05, 0x00, 0, 0, 0, 0, 0xe3, 0, 0];
        let plain = buf.clone();
        cipher.seal(&mut buf).unwrap();
        assert_eq!((buf.len() - 2) % 8, 0);
        assert_ne!(&buf[2..15], &plain[2..]);

        let end = cipher.open(&mut buf).unwrap();
        assert_eq!(&buf[2..15], &plain[2..]);
        assert_eq!(end, buf.len() - 8);
    }

    #[test]
    fn test_open_rejects_corruption() {
        let cipher = MessageCipher::login(&DESKEY, &[0x55; 14]).unwrap();
        let mut buf = vec![0u8; 2];
        buf.extend_from_slice(&[0x11; 20]);
        cipher.seal(&mut buf).unwrap();
        // a flipped IV bit flips the same bit of the first plain block
        let last = buf.len() - 1;
        buf[last] ^= 0x04;
        assert!(matches!(cipher.open(&mut buf), Err(ClientError::Checksum)));
        assert!(matches!(cipher.open(&mut [0u8; 11]), Err(ClientError::Framing(_))));
    }
}
