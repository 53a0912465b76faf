//! Stream cipher and key derivation of the CCcam protocol.

use sha1::{Digest, Sha1};

pub const MAGIC: &[u8; 6] = b"CCcam\0";

/// One direction of the connection cipher. The state advances with every
/// byte and is never reset during a session.
#[derive(Clone)]
pub struct CryptBlock {
    table: [u8; 256],
    state: u8,
    counter: u8,
    sum: u8,
}

impl CryptBlock {
    pub fn new(key: &[u8]) -> Self {
        let mut table = [0u8; 256];
        for (i, t) in table.iter_mut().enumerate() {
            *t = i as u8;
        }
        let mut j = 0u8;
        if !key.is_empty() {
            for i in 0..256 {
                j = j.wrapping_add(key[i % key.len()]).wrapping_add(table[i]);
                table.swap(i, usize::from(j));
            }
        }
        Self {
            table,
            state: key.first().copied().unwrap_or_default(),
            counter: 0,
            sum: 0,
        }
    }

    fn keystream(&mut self) -> u8 {
        self.counter = self.counter.wrapping_add(1);
        self.sum = self.sum.wrapping_add(self.table[usize::from(self.counter)]);
        self.table.swap(usize::from(self.counter), usize::from(self.sum));
        let k = self.table[usize::from(self.counter)].wrapping_add(self.table[usize::from(self.sum)]);
        self.table[usize::from(k)]
    }

    pub fn decrypt(&mut self, data: &mut [u8]) {
        for b in data {
            *b ^= self.keystream() ^ self.state;
            self.state ^= *b;
        }
    }

    pub fn encrypt(&mut self, data: &mut [u8]) {
        for b in data {
            let plain = *b;
            *b ^= self.keystream() ^ self.state;
            self.state ^= plain;
        }
    }
}

/// Whether the server seed carries the checksum oscam servers put in its
/// last two bytes.
pub fn is_oscam_seed(seed: &[u8; 16]) -> bool {
    let sum = seed[..14]
        .iter()
        .fold(0x1234u16, |acc, b| acc.wrapping_add(u16::from(*b)));
    sum == u16::from_be_bytes([seed[14], seed[15]])
}

fn crypt_xor(buf: &mut [u8; 16]) {
    for i in 0..8 {
        buf[i + 8] = (i as u8).wrapping_mul(buf[i]);
        if i < MAGIC.len() {
            buf[i] ^= MAGIC[i];
        }
    }
}

/// Ciphers for both directions derived from the server seed, and the
/// 20-byte answer to send back.
pub struct LoginKeys {
    pub recv: CryptBlock,
    pub send: CryptBlock,
    pub answer: [u8; 20],
}

impl LoginKeys {
    pub fn derive(seed: &[u8; 16]) -> Self {
        let mut seed = *seed;
        crypt_xor(&mut seed);
        let mut answer = [0u8; 20];
        answer.copy_from_slice(&Sha1::digest(seed));

        let mut recv = CryptBlock::new(&answer);
        recv.decrypt(&mut seed);
        let mut send = CryptBlock::new(&seed);
        send.decrypt(&mut answer);
        Self { recv, send, answer }
    }
}

/// Removes the per-card obfuscation of the 16 control-word bytes.
pub fn decrypt_cw(node_id: u64, card_id: u32, cw: &mut [u8; 16]) {
    for (i, b) in cw.iter_mut().enumerate() {
        let mut tmp = *b ^ (node_id >> (4 * i)) as u8;
        if i & 1 == 1 {
            tmp = !tmp;
        }
        *b = (card_id >> (2 * i)) as u8 ^ tmp;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encrypt_and_decrypt_pair() {
        let mut a = CryptBlock::new(b"0123456789abcdef");
        let mut b = CryptBlock::new(b"0123456789abcdef");
        let mut data = *b"user name and some more bytes";
        a.encrypt(&mut data);
        assert_ne!(&data, b"user name and some more bytes");
        b.decrypt(&mut data);
        assert_eq!(&data, b"user name and some more bytes");

        // both sides keep advancing in step
        let mut more = *b"keepalive";
        a.encrypt(&mut more);
        b.decrypt(&mut more);
        assert_eq!(&more, b"keepalive");
    }

    #[test]
    fn test_initial_state_is_first_key_byte() {
        let block = CryptBlock::new(&[0x42, 1, 2]);
        assert_eq!(block.state, 0x42);
        let mut sorted = block.table;
        sorted.sort_unstable();
        assert!(sorted.iter().enumerate().all(|(i, v)| usize::from(*v) == i));
    }

    #[test]
    fn test_oscam_seed_detection() {
        let mut seed = [1u8; 16];
        let sum = 0x1234u16 + 14;
        seed[14..].copy_from_slice(&sum.to_be_bytes());
        assert!(is_oscam_seed(&seed));
        seed[0] = 2;
        assert!(!is_oscam_seed(&seed));
    }

    #[test]
    fn test_crypt_xor() {
        let mut buf = [0u8; 16];
        buf[..8].copy_from_slice(&[1, 2, 3, 4, 5, 6, 7, 8]);
        crypt_xor(&mut buf);
        assert_eq!(&buf[8..], &[0, 2, 6, 12, 20, 30, 42, 56]);
        assert_eq!(&buf[..8], &[1 ^ b'C', 2 ^ b'C', 3 ^ b'c', 4 ^ b'a', 5 ^ b'm', 6, 7, 8]);
    }

    const SEED: [u8; 16] = [
        0x3a, 0x91, 0x07, 0xc4, 0x5e, 0x22, 0xb8, 0x6f, 0x10, 0xd3, 0x4c, 0x99, 0x01, 0xee, 0x72, 0x35,
    ];

    #[test]
    fn test_login_reference() {
        let keys = LoginKeys::derive(&SEED);
        assert_eq!(
            keys.answer,
            [
                0x47, 0x62, 0xb9, 0x2c, 0x21, 0xde, 0x80, 0xaa, 0x80, 0x18, 0x5e, 0x07, 0x38, 0xd2, 0x90, 0x30, 0x41,
                0xf6, 0x9b, 0x38
            ]
        );

        // answer, user "viewer" padded to 20, password "secret" absorbed, magic
        let mut send = keys.send;
        let mut wire = keys.answer.to_vec();
        send.encrypt(&mut wire);
        let mut user = [0u8; 20];
        user[..6].copy_from_slice(b"viewer");
        send.encrypt(&mut user);
        wire.extend_from_slice(&user);
        send.encrypt(&mut b"secret".to_vec());
        let mut magic = *MAGIC;
        send.encrypt(&mut magic);
        wire.extend_from_slice(&magic);
        assert_eq!(
            wire,
            [
                0x81, 0x05, 0xb7, 0xf2, 0x09, 0xca, 0xca, 0x56, 0xd3, 0x84, 0xfc, 0x95, 0xcd, 0xe6, 0xe4, 0x43, 0xac,
                0x99, 0xe0, 0x36, 0x60, 0x9b, 0xfb, 0xa7, 0x38, 0x61, 0xde, 0xa3, 0x37, 0xa8, 0x14, 0xb9, 0xa0, 0xbe,
                0xda, 0x84, 0xbe, 0xc1, 0xeb, 0x4e, 0x32, 0xf0, 0xb1, 0x67, 0x74, 0x7c
            ]
        );

        // the server's password acknowledgement
        let mut recv = keys.recv;
        let mut ack = [
            0x5b, 0x65, 0xdd, 0x58, 0x2b, 0x0b, 0x90, 0x12, 0x75, 0xb8, 0x26, 0xa4, 0x03, 0x8f, 0x37, 0x92, 0x37, 0xc4,
            0x56, 0x3d,
        ];
        recv.decrypt(&mut ack);
        let mut expected = [0u8; 20];
        expected[..6].copy_from_slice(MAGIC);
        assert_eq!(ack, expected);
    }

    #[test]
    fn test_decrypt_cw_is_an_involution() {
        let mut cw = [0x11u8; 16];
        decrypt_cw(0x0102_0304_0506_0708, 0xdead_beef, &mut cw);
        assert_ne!(cw, [0x11; 16]);
        decrypt_cw(0x0102_0304_0506_0708, 0xdead_beef, &mut cw);
        assert_eq!(cw, [0x11; 16]);

        let mut zero = [0u8; 16];
        decrypt_cw(0, 0, &mut zero);
        assert_eq!(zero[0], 0);
        assert_eq!(zero[1], 0xff);
    }
}
