//! DVB Common Scrambling Algorithm.
//!
//! Scalar implementation: a 64-bit block cipher run in reverse-CBC over the
//! complete 8-byte blocks of the payload, whitened by a stream cipher seeded
//! with the first ciphertext block. Residual bytes are XORed with the stream.

use zeroize::Zeroize;

const BLOCK: usize = 8;
const ROUNDS: usize = 56;

const KEY_PERM: [u8; 64] = [
    0x12, 0x24, 0x09, 0x07, 0x2A, 0x31, 0x1D, 0x15, 0x1C, 0x36, 0x3E, 0x32, 0x13, 0x21, 0x3B, 0x40,
    0x18, 0x14, 0x25, 0x27, 0x02, 0x35, 0x1B, 0x01, 0x22, 0x04, 0x0D, 0x0E, 0x39, 0x28, 0x1A, 0x29,
    0x33, 0x23, 0x34, 0x0C, 0x16, 0x30, 0x1E, 0x3A, 0x2D, 0x1F, 0x08, 0x19, 0x17, 0x2F, 0x3D, 0x11,
    0x3C, 0x05, 0x38, 0x2B, 0x0B, 0x06, 0x0A, 0x2C, 0x20, 0x3F, 0x2E, 0x0F, 0x03, 0x26, 0x10, 0x37,
];

const BLOCK_SBOX: [u8; 256] = [
    0x3A, 0xEA, 0x68, 0xFE, 0x33, 0xE9, 0x88, 0x1A, 0x83, 0xCF, 0xE1, 0x7F, 0xBA, 0xE2, 0x38, 0x12,
    0xE8, 0x27, 0x61, 0x95, 0x0C, 0x36, 0xE5, 0x70, 0xA2, 0x06, 0x82, 0x7C, 0x17, 0xA3, 0x26, 0x49,
    0xBE, 0x7A, 0x6D, 0x47, 0xC1, 0x51, 0x8F, 0xF3, 0xCC, 0x5B, 0x67, 0xBD, 0xCD, 0x18, 0x08, 0xC9,
    0xFF, 0x69, 0xEF, 0x03, 0x4E, 0x48, 0x4A, 0x84, 0x3F, 0xB4, 0x10, 0x04, 0xDC, 0xF5, 0x5C, 0xC6,
    0x16, 0xAB, 0xAC, 0x4C, 0xF1, 0x6A, 0x2F, 0x3C, 0x3B, 0xD4, 0xD5, 0x94, 0xD0, 0xC4, 0x63, 0x62,
    0x71, 0xA1, 0xF9, 0x4F, 0x2E, 0xAA, 0xC5, 0x56, 0xE3, 0x39, 0x93, 0xCE, 0x65, 0x64, 0xE4, 0x58,
    0x6C, 0x19, 0x42, 0x79, 0xDD, 0xEE, 0x96, 0xF6, 0x8A, 0xEC, 0x1E, 0x85, 0x53, 0x45, 0xDE, 0xBB,
    0x7E, 0x0A, 0x9A, 0x13, 0x2A, 0x9D, 0xC2, 0x5E, 0x5A, 0x1F, 0x32, 0x35, 0x9C, 0xA8, 0x73, 0x30,
    0x29, 0x3D, 0xE7, 0x92, 0x87, 0x1B, 0x2B, 0x4B, 0xA5, 0x57, 0x97, 0x40, 0x15, 0xE6, 0xBC, 0x0E,
    0xEB, 0xC3, 0x34, 0x2D, 0xB8, 0x44, 0x25, 0xA4, 0x1C, 0xC7, 0x23, 0xED, 0x90, 0x6E, 0x50, 0x00,
    0x99, 0x9E, 0x4D, 0xD9, 0xDA, 0x8D, 0x6F, 0x5F, 0x3E, 0xD7, 0x21, 0x74, 0x86, 0xDF, 0x6B, 0x05,
    0x8E, 0x5D, 0x37, 0x11, 0xD2, 0x28, 0x75, 0xD6, 0xA7, 0x77, 0x24, 0xBF, 0xF0, 0xB0, 0x02, 0xB7,
    0xF8, 0xFC, 0x81, 0x09, 0xB1, 0x01, 0x76, 0x91, 0x7D, 0x0F, 0xC8, 0xA0, 0xF2, 0xCB, 0x78, 0x60,
    0xD1, 0xF7, 0xE0, 0xB5, 0x98, 0x22, 0xB3, 0x20, 0x1D, 0xA6, 0xDB, 0x7B, 0x59, 0x9F, 0xAE, 0x31,
    0xFB, 0xD3, 0xB6, 0xCA, 0x43, 0x72, 0x07, 0xF4, 0xD8, 0x41, 0x14, 0x55, 0x0D, 0x54, 0x8B, 0xB9,
    0xAD, 0x46, 0x0B, 0xAF, 0x80, 0x52, 0x2C, 0xFA, 0x8C, 0x89, 0x66, 0xFD, 0xB2, 0xA9, 0x9B, 0xC0,
];

// Stream cipher s-boxes: 5 input bits, 2 output bits.
const SBOX1: [u8; 32] = [2, 0, 1, 1, 2, 3, 3, 0, 3, 2, 2, 0, 1, 1, 0, 3, 0, 3, 3, 0, 2, 2, 1, 1, 2, 2, 0, 3, 1, 1, 3, 0];
const SBOX2: [u8; 32] = [3, 1, 0, 2, 2, 3, 3, 0, 1, 3, 2, 1, 0, 0, 1, 2, 3, 1, 0, 3, 3, 2, 0, 2, 0, 0, 1, 2, 2, 1, 3, 1];
const SBOX3: [u8; 32] = [2, 0, 1, 2, 2, 3, 3, 1, 1, 1, 0, 3, 3, 0, 2, 0, 1, 3, 0, 1, 3, 0, 2, 2, 2, 0, 1, 2, 0, 3, 3, 1];
const SBOX4: [u8; 32] = [3, 1, 2, 3, 0, 2, 1, 2, 1, 2, 0, 1, 3, 0, 0, 3, 1, 0, 3, 1, 2, 3, 0, 3, 0, 3, 2, 0, 1, 2, 2, 1];
const SBOX5: [u8; 32] = [2, 0, 0, 1, 3, 2, 3, 2, 0, 1, 3, 3, 1, 0, 2, 1, 2, 3, 2, 0, 0, 3, 1, 1, 1, 0, 3, 2, 3, 1, 0, 2];
const SBOX6: [u8; 32] = [0, 1, 2, 3, 1, 2, 2, 0, 0, 1, 3, 0, 2, 3, 1, 3, 2, 3, 0, 2, 3, 0, 1, 1, 2, 1, 1, 2, 0, 3, 3, 0];
const SBOX7: [u8; 32] = [0, 3, 2, 2, 3, 0, 0, 1, 3, 0, 1, 3, 1, 2, 2, 1, 1, 0, 3, 3, 0, 1, 1, 2, 2, 3, 1, 0, 2, 3, 0, 2];

/// Expanded control word: the raw key feeds the stream cipher, the 56-byte
/// schedule feeds the block cipher.
#[derive(Clone)]
pub struct CsaKey {
    cw: [u8; 8],
    schedule: [u8; ROUNDS],
}

impl CsaKey {
    pub fn new(cw: [u8; 8]) -> Self {
        Self { cw, schedule: key_schedule(&cw) }
    }

    pub fn decrypt(&self, payload: &mut [u8]) {
        let blocks = payload.len() / BLOCK;
        if blocks == 0 {
            return;
        }
        let (body, residue) = payload.split_at_mut(blocks * BLOCK);

        let mut stream = StreamCipher::new(&self.cw);
        let mut chain = [0u8; BLOCK];
        chain.copy_from_slice(&body[..BLOCK]);
        stream.init(&chain);

        for i in 0..blocks {
            let plain = block_decipher(&self.schedule, &chain);
            if i + 1 < blocks {
                let ks = stream.generate();
                for (j, c) in chain.iter_mut().enumerate() {
                    *c = body[(i + 1) * BLOCK + j] ^ ks[j];
                }
            } else {
                chain = [0u8; BLOCK];
            }
            for (j, b) in body[i * BLOCK..(i + 1) * BLOCK].iter_mut().enumerate() {
                *b = chain[j] ^ plain[j];
            }
        }

        if !residue.is_empty() {
            let ks = stream.generate();
            residue.iter_mut().zip(ks).for_each(|(b, k)| *b ^= k);
        }
    }

    pub fn encrypt(&self, payload: &mut [u8]) {
        let blocks = payload.len() / BLOCK;
        if blocks == 0 {
            return;
        }
        let (body, residue) = payload.split_at_mut(blocks * BLOCK);

        // Chain values are produced back to front; the first one seeds the stream.
        let mut chains = vec![[0u8; BLOCK]; blocks + 1];
        for i in (0..blocks).rev() {
            let mut input = [0u8; BLOCK];
            for (j, v) in input.iter_mut().enumerate() {
                *v = body[i * BLOCK + j] ^ chains[i + 1][j];
            }
            chains[i] = block_encipher(&self.schedule, &input);
        }

        let mut stream = StreamCipher::new(&self.cw);
        stream.init(&chains[0]);
        body[..BLOCK].copy_from_slice(&chains[0]);
        for i in 1..blocks {
            let ks = stream.generate();
            for j in 0..BLOCK {
                body[i * BLOCK + j] = chains[i][j] ^ ks[j];
            }
        }

        if !residue.is_empty() {
            let ks = stream.generate();
            residue.iter_mut().zip(ks).for_each(|(b, k)| *b ^= k);
        }
    }
}

impl Zeroize for CsaKey {
    fn zeroize(&mut self) {
        self.cw.zeroize();
        self.schedule.zeroize();
    }
}

impl Drop for CsaKey {
    fn drop(&mut self) {
        self.zeroize();
    }
}

impl std::fmt::Debug for CsaKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CsaKey").finish_non_exhaustive()
    }
}

fn key_schedule(cw: &[u8; 8]) -> [u8; ROUNDS] {
    let mut kb = [[0u8; 8]; 7];
    kb[6] = *cw;
    for i in (0..6).rev() {
        let mut bits = [0u8; 64];
        for j in 0..8 {
            for k in 0..8 {
                let bit = (kb[i + 1][j] >> (7 - k)) & 1;
                bits[usize::from(KEY_PERM[j * 8 + k]) - 1] = bit;
            }
        }
        for j in 0..8 {
            kb[i][j] = (0..8).fold(0u8, |acc, k| acc | (bits[j * 8 + k] << (7 - k)));
        }
    }

    let mut schedule = [0u8; ROUNDS];
    for i in 0..7 {
        for j in 0..8 {
            schedule[i * 8 + j] = kb[i][j] ^ i as u8;
        }
    }
    schedule
}

fn block_perm(x: u8) -> u8 {
    ((x & 0x29) << 1) | ((x & 0x02) << 6) | ((x & 0x04) << 3) | ((x & 0x10) >> 2) | ((x & 0x40) >> 6) | ((x & 0x80) >> 4)
}

fn block_decipher(schedule: &[u8; ROUNDS], input: &[u8; BLOCK]) -> [u8; BLOCK] {
    let mut r = *input;
    for i in (0..ROUNDS).rev() {
        let s = BLOCK_SBOX[usize::from(schedule[i] ^ r[6])];
        let next7 = r[6];
        r[6] = r[5] ^ block_perm(s);
        r[5] = r[4];
        r[4] = r[3] ^ r[7] ^ s;
        r[3] = r[2] ^ r[7] ^ s;
        r[2] = r[1] ^ r[7] ^ s;
        r[1] = r[0];
        r[0] = r[7] ^ s;
        r[7] = next7;
    }
    r
}

fn block_encipher(schedule: &[u8; ROUNDS], input: &[u8; BLOCK]) -> [u8; BLOCK] {
    let mut r = *input;
    for &k in schedule.iter() {
        let s = BLOCK_SBOX[usize::from(k ^ r[7])];
        let next0 = r[1];
        r[1] = r[2] ^ r[0];
        r[2] = r[3] ^ r[0];
        r[3] = r[4] ^ r[0];
        r[4] = r[5];
        r[5] = r[6] ^ block_perm(s);
        r[6] = r[7];
        r[7] = r[0] ^ s;
        r[0] = next0;
    }
    r
}

/// Nibble-oriented stream cipher state. Registers `a` and `b` hold ten
/// 4-bit cells each.
struct StreamCipher {
    a: [u8; 10],
    b: [u8; 10],
    x: u8,
    y: u8,
    z: u8,
    d: u8,
    e: u8,
    f: u8,
    p: u8,
    q: u8,
    r: u8,
}

fn bit(v: u8, n: u8) -> u8 {
    (v >> n) & 1
}

impl StreamCipher {
    fn new(cw: &[u8; 8]) -> Self {
        let mut a = [0u8; 10];
        let mut b = [0u8; 10];
        for i in 0..4 {
            a[2 * i] = cw[i] >> 4;
            a[2 * i + 1] = cw[i] & 0x0f;
            b[2 * i] = cw[4 + i] >> 4;
            b[2 * i + 1] = cw[4 + i] & 0x0f;
        }
        Self { a, b, x: 0, y: 0, z: 0, d: 0, e: 0, f: 0, p: 0, q: 0, r: 0 }
    }

    /// 32 initialisation rounds driven by the first ciphertext block.
    fn init(&mut self, iv: &[u8; BLOCK]) {
        for &byte in iv {
            let in1 = byte >> 4;
            let in2 = byte & 0x0f;
            for j in 0..4 {
                let (ina, inb) = if j % 2 == 1 { (in2, in1) } else { (in1, in2) };
                self.clock(Some((ina, inb)));
            }
        }
    }

    fn generate(&mut self) -> [u8; BLOCK] {
        let mut out = [0u8; BLOCK];
        for o in &mut out {
            let mut op = 0u8;
            for _ in 0..4 {
                let d = self.clock(None);
                let dd = d ^ (d >> 1);
                op = (op << 2) ^ (((dd >> 1) & 2) | (dd & 1));
            }
            *o = op;
        }
        out
    }

    /// One round; returns the new value of `d`.
    fn clock(&mut self, input: Option<(u8, u8)>) -> u8 {
        let a = &self.a;
        let s1 = SBOX1[usize::from(bit(a[3], 0) << 4 | bit(a[0], 2) << 3 | bit(a[5], 1) << 2 | bit(a[6], 3) << 1 | bit(a[8], 0))];
        let s2 = SBOX2[usize::from(bit(a[1], 1) << 4 | bit(a[2], 2) << 3 | bit(a[5], 3) << 2 | bit(a[6], 0) << 1 | bit(a[8], 1))];
        let s3 = SBOX3[usize::from(bit(a[0], 3) << 4 | bit(a[1], 0) << 3 | bit(a[4], 1) << 2 | bit(a[4], 3) << 1 | bit(a[5], 2))];
        let s4 = SBOX4[usize::from(bit(a[2], 3) << 4 | bit(a[0], 1) << 3 | bit(a[1], 3) << 2 | bit(a[3], 2) << 1 | bit(a[7], 0))];
        let s5 = SBOX5[usize::from(bit(a[4], 2) << 4 | bit(a[3], 3) << 3 | bit(a[5], 0) << 2 | bit(a[7], 1) << 1 | bit(a[8], 2))];
        let s6 = SBOX6[usize::from(bit(a[2], 1) << 4 | bit(a[3], 1) << 3 | bit(a[4], 0) << 2 | bit(a[6], 2) << 1 | bit(a[8], 3))];
        let s7 = SBOX7[usize::from(bit(a[1], 2) << 4 | bit(a[2], 0) << 3 | bit(a[6], 1) << 2 | bit(a[7], 2) << 1 | bit(a[7], 3))];

        let b = &self.b;
        let extra_b = ((bit(b[2], 0) ^ bit(b[5], 1) ^ bit(b[6], 2) ^ bit(b[8], 3)) << 3)
            | ((bit(b[5], 0) ^ bit(b[7], 1) ^ bit(b[2], 3) ^ bit(b[3], 2)) << 2)
            | ((bit(b[4], 3) ^ bit(b[7], 2) ^ bit(b[3], 0) ^ bit(b[4], 1)) << 1)
            | (bit(b[8], 2) ^ bit(b[5], 3) ^ bit(b[2], 1) ^ bit(b[7], 0));

        let mut next_a = self.a[9] ^ self.x;
        let mut next_b = self.b[6] ^ self.b[9] ^ self.y;
        if let Some((ina, inb)) = input {
            next_a ^= self.d ^ ina;
            next_b ^= inb;
        }
        if self.p != 0 {
            next_b = ((next_b << 1) | (next_b >> 3)) & 0x0f;
        }

        self.d = self.e ^ self.z ^ extra_b;

        let next_e = self.f;
        if self.q != 0 {
            let sum = self.z + self.e + self.r;
            self.r = (sum >> 4) & 1;
            self.f = sum & 0x0f;
        } else {
            self.f = self.e;
        }
        self.e = next_e;

        self.a.copy_within(0..9, 1);
        self.b.copy_within(0..9, 1);
        self.a[0] = next_a & 0x0f;
        self.b[0] = next_b;

        self.x = ((s4 & 1) << 3) | ((s3 & 1) << 2) | (s2 & 2) | ((s1 & 2) >> 1);
        self.y = ((s6 & 1) << 3) | ((s5 & 1) << 2) | (s4 & 2) | ((s3 & 2) >> 1);
        self.z = ((s2 & 1) << 3) | ((s1 & 1) << 2) | (s6 & 2) | ((s5 & 2) >> 1);
        self.p = (s7 & 2) >> 1;
        self.q = s7 & 1;

        self.d
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const CW: [u8; 8] = [0x11, 0x22, 0x33, 0x66, 0x44, 0x55, 0x66, 0xff];

    #[test]
    fn test_zeroize_wipes_key_material() {
        let mut key = CsaKey::new(CW);
        assert_eq!(key.schedule, key_schedule(&CW));
        key.zeroize();
        assert_eq!(key.cw, [0; 8]);
        assert_eq!(key.schedule, [0; ROUNDS]);
    }

    #[test]
    fn test_block_cipher_inverse() {
        let schedule = key_schedule(&CW);
        let block = [0x01, 0x23, 0x45, 0x67, 0x89, 0xab, 0xcd, 0xef];
        let enc = block_encipher(&schedule, &block);
        assert_ne!(enc, block);
        assert_eq!(block_decipher(&schedule, &enc), block);
    }

    #[test]
    fn test_block_perm_is_permutation() {
        let mut seen = [false; 256];
        for x in 0..=255u8 {
            let y = block_perm(x);
            assert!(!seen[usize::from(y)]);
            seen[usize::from(y)] = true;
        }
    }

    #[test]
    fn test_payload_round_trip_with_residue() {
        let key = CsaKey::new(CW);
        let original: Vec<u8> = (0..184u32).map(|i| (i * 13 + 5) as u8).collect();
        let mut data = original.clone();
        key.encrypt(&mut data);
        assert_ne!(data, original);
        key.decrypt(&mut data);
        assert_eq!(data, original);
    }

    #[test]
    fn test_decrypt_reference_vector() {
        let key = CsaKey::new(CW);
        let mut data: Vec<u8> = (0..20u32).map(|i| (i * 29 + 3) as u8).collect();
        key.decrypt(&mut data);
        assert_eq!(hex::encode(&data), "6846ef946bb67ab494819a57936e977e57a460c0");
    }

    #[test]
    fn test_short_payload_left_clear() {
        let key = CsaKey::new(CW);
        let mut data = [1u8, 2, 3, 4, 5];
        key.encrypt(&mut data);
        assert_eq!(data, [1, 2, 3, 4, 5]);
    }

    #[test]
    fn test_wrong_key_corrupts() {
        let key = CsaKey::new(CW);
        let other = CsaKey::new([0x10, 0x22, 0x33, 0x65, 0x44, 0x55, 0x66, 0xff]);
        let original = vec![0xa5u8; 176];
        let mut data = original.clone();
        key.encrypt(&mut data);
        other.decrypt(&mut data);
        assert_ne!(data, original);
    }
}
