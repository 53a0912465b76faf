//! ECB block ciphers applied in place to transport payloads.
//!
//! Only complete blocks are processed; a trailing partial block stays clear.

use aes::Aes128;
use des::cipher::generic_array::GenericArray;
use des::cipher::{BlockDecrypt, BlockEncrypt, KeyInit};
use des::Des;
use zeroize::Zeroizing;

use super::CipherError;

#[derive(Clone)]
pub struct DesEcb {
    cipher: Des,
}

impl DesEcb {
    pub fn new(key: &[u8]) -> Result<Self, CipherError> {
        let cipher = Des::new_from_slice(key).map_err(|_| CipherError::KeyLength {
            expected: 8,
            actual: key.len(),
        })?;
        Ok(Self { cipher })
    }

    pub fn decrypt(&self, payload: &mut [u8]) {
        for chunk in payload.chunks_exact_mut(8) {
            self.cipher.decrypt_block(GenericArray::from_mut_slice(chunk));
        }
    }

    pub fn encrypt(&self, payload: &mut [u8]) {
        for chunk in payload.chunks_exact_mut(8) {
            self.cipher.encrypt_block(GenericArray::from_mut_slice(chunk));
        }
    }
}

#[derive(Clone)]
pub struct AesEcb {
    cipher: Aes128,
}

impl AesEcb {
    /// Accepts a full 16-byte key, or an 8-byte key that is zero-extended.
    pub fn new(key: &[u8]) -> Result<Self, CipherError> {
        let mut material = Zeroizing::new([0u8; 16]);
        match key.len() {
            8 | 16 => material[..key.len()].copy_from_slice(key),
            actual => return Err(CipherError::KeyLength { expected: 16, actual }),
        }
        Ok(Self { cipher: Aes128::new(GenericArray::from_slice(&material[..])) })
    }

    pub fn decrypt(&self, payload: &mut [u8]) {
        for chunk in payload.chunks_exact_mut(16) {
            self.cipher.decrypt_block(GenericArray::from_mut_slice(chunk));
        }
    }

    pub fn encrypt(&self, payload: &mut [u8]) {
        for chunk in payload.chunks_exact_mut(16) {
            self.cipher.encrypt_block(GenericArray::from_mut_slice(chunk));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_des_known_answer() {
        // FIPS 81 example: "Now is t" under 0123456789abcdef
        let des = DesEcb::new(&hex::decode("0123456789abcdef").unwrap()).unwrap();
        let mut block = *b"Now is t";
        des.encrypt(&mut block);
        assert_eq!(hex::encode(block), "3fa40e8a984d4815");
        des.decrypt(&mut block);
        assert_eq!(&block, b"Now is t");
    }

    #[test]
    fn test_aes_known_answer() {
        // FIPS 197 appendix C.1
        let aes = AesEcb::new(&hex::decode("000102030405060708090a0b0c0d0e0f").unwrap()).unwrap();
        let mut block = hex::decode("00112233445566778899aabbccddeeff").unwrap();
        aes.encrypt(&mut block);
        assert_eq!(hex::encode(&block), "69c4e0d86a7b0430d8cdb78070b4c55a");
    }

    #[test]
    fn test_short_aes_key_is_zero_extended() {
        let short = AesEcb::new(&[0x42u8; 8]).unwrap();
        let mut long_key = [0u8; 16];
        long_key[..8].copy_from_slice(&[0x42u8; 8]);
        let long = AesEcb::new(&long_key).unwrap();
        let mut a = [0x11u8; 16];
        let mut b = a;
        short.encrypt(&mut a);
        long.encrypt(&mut b);
        assert_eq!(a, b);
    }

    #[test]
    fn test_residue_left_clear() {
        let aes = AesEcb::new(&[7u8; 8]).unwrap();
        let mut data = vec![0x55u8; 20];
        aes.encrypt(&mut data);
        assert_ne!(&data[..16], &[0x55u8; 16]);
        assert_eq!(&data[16..], &[0x55u8; 4]);
    }

    #[test]
    fn test_bad_key_length() {
        assert!(DesEcb::new(&[0u8; 7]).is_err());
        assert!(AesEcb::new(&[0u8; 12]).is_err());
    }
}
