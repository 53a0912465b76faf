//! Key-slot cipher contexts.
//!
//! A [`CipherContext`] holds the even and odd key halves for one cipher type
//! and descrambles transport packets in place according to their parity bits.

mod block;
mod csa;

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;

pub use block::{AesEcb, DesEcb};
pub use csa::CsaKey;

use crate::ts::{self, Parity};

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CipherError {
    #[error("invalid key length: expected {expected}, got {actual}")]
    KeyLength { expected: usize, actual: usize },

    #[error("unknown cipher type: {0}")]
    UnknownType(String),
}

/// Scrambling algorithm a key pair is meant for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CipherType {
    Csa,
    DesNcb,
    AesEcb,
    Aes128Ecb,
}

impl CipherType {
    pub fn key_size(self) -> usize {
        match self {
            Self::Csa | Self::DesNcb | Self::AesEcb => 8,
            Self::Aes128Ecb => 16,
        }
    }

    /// Wire identifier used by card servers and descrambler hardware.
    pub fn id(self) -> u8 {
        match self {
            Self::Csa => 1,
            Self::DesNcb => 2,
            Self::AesEcb => 3,
            Self::Aes128Ecb => 16,
        }
    }

    pub fn from_id(id: u8) -> Option<Self> {
        match id {
            1 => Some(Self::Csa),
            2 => Some(Self::DesNcb),
            3 => Some(Self::AesEcb),
            16 => Some(Self::Aes128Ecb),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Csa => "csa",
            Self::DesNcb => "des_ncb",
            Self::AesEcb => "aes_ecb",
            Self::Aes128Ecb => "aes128_ecb",
        }
    }
}

impl fmt::Display for CipherType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for CipherType {
    type Err = CipherError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "csa" | "csa_cbc" => Ok(Self::Csa),
            "des" | "des_ncb" => Ok(Self::DesNcb),
            "aes" | "aes_ecb" => Ok(Self::AesEcb),
            "aes128" | "aes128_ecb" => Ok(Self::Aes128Ecb),
            other => Err(CipherError::UnknownType(other.to_string())),
        }
    }
}

#[derive(Clone)]
enum KeyEngine {
    Csa(CsaKey),
    Des(DesEcb),
    Aes(AesEcb),
}

impl KeyEngine {
    fn new(kind: CipherType, key: &[u8]) -> Result<Self, CipherError> {
        if key.len() != kind.key_size() {
            return Err(CipherError::KeyLength {
                expected: kind.key_size(),
                actual: key.len(),
            });
        }
        Ok(match kind {
            CipherType::Csa => {
                let mut cw = [0u8; 8];
                cw.copy_from_slice(key);
                Self::Csa(CsaKey::new(cw))
            }
            CipherType::DesNcb => Self::Des(DesEcb::new(key)?),
            CipherType::AesEcb | CipherType::Aes128Ecb => Self::Aes(AesEcb::new(key)?),
        })
    }

    fn decrypt(&self, payload: &mut [u8]) {
        match self {
            Self::Csa(k) => k.decrypt(payload),
            Self::Des(k) => k.decrypt(payload),
            Self::Aes(k) => k.decrypt(payload),
        }
    }

    fn encrypt(&self, payload: &mut [u8]) {
        match self {
            Self::Csa(k) => k.encrypt(payload),
            Self::Des(k) => k.encrypt(payload),
            Self::Aes(k) => k.encrypt(payload),
        }
    }
}

/// Even/odd key pair for one cipher type.
#[derive(Clone)]
pub struct CipherContext {
    kind: CipherType,
    halves: [Option<KeyEngine>; 2],
}

impl CipherContext {
    pub fn new(kind: CipherType) -> Self {
        Self { kind, halves: [None, None] }
    }

    pub fn kind(&self) -> CipherType {
        self.kind
    }

    pub fn set_key(&mut self, parity: Parity, key: &[u8]) -> Result<(), CipherError> {
        self.halves[parity.index()] = Some(KeyEngine::new(self.kind, key)?);
        Ok(())
    }

    pub fn has_key(&self, parity: Parity) -> bool {
        self.halves[parity.index()].is_some()
    }

    /// Drops one half. Engines wipe their key schedules when dropped.
    pub fn clear(&mut self, parity: Parity) {
        drop(self.halves[parity.index()].take());
    }

    pub fn flush(&mut self) {
        self.halves.iter_mut().for_each(|half| drop(half.take()));
    }

    /// Descrambles a packet with the half matching its parity bits and clears
    /// the bits. Returns `false` (packet untouched) when the packet is not
    /// scrambled or the matching half is missing.
    pub fn decrypt_packet(&self, packet: &mut [u8]) -> bool {
        let Some(parity) = ts::parity(packet) else {
            return false;
        };
        let Some(engine) = &self.halves[parity.index()] else {
            return false;
        };
        if let Some(offset) = ts::payload_offset(packet) {
            engine.decrypt(&mut packet[offset..]);
        }
        ts::clear_scrambling(packet);
        true
    }

    /// Scrambles a clear packet with the given half and sets the parity bits.
    pub fn encrypt_packet(&self, packet: &mut [u8], parity: Parity) -> bool {
        let Some(engine) = &self.halves[parity.index()] else {
            return false;
        };
        if let Some(offset) = ts::payload_offset(packet) {
            engine.encrypt(&mut packet[offset..]);
        }
        ts::set_scrambling(packet, parity);
        true
    }
}

impl fmt::Debug for CipherContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CipherContext")
            .field("kind", &self.kind)
            .field("even", &self.has_key(Parity::Even))
            .field("odd", &self.has_key(Parity::Odd))
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ts::test_packet;

    fn keyed(kind: CipherType) -> CipherContext {
        let size = kind.key_size();
        let even: Vec<u8> = (0..size as u8).map(|i| i.wrapping_mul(17).wrapping_add(1)).collect();
        let odd: Vec<u8> = (0..size as u8).map(|i| i.wrapping_mul(31).wrapping_add(9)).collect();
        let mut ctx = CipherContext::new(kind);
        ctx.set_key(Parity::Even, &even).unwrap();
        ctx.set_key(Parity::Odd, &odd).unwrap();
        ctx
    }

    #[test]
    fn test_round_trip_all_types_and_parities() {
        for kind in [CipherType::Csa, CipherType::DesNcb, CipherType::AesEcb, CipherType::Aes128Ecb] {
            let ctx = keyed(kind);
            for parity in [Parity::Even, Parity::Odd] {
                let original = test_packet(0x100, 5);
                let mut pkt = original.clone();
                assert!(ctx.encrypt_packet(&mut pkt, parity));
                assert_eq!(ts::parity(&pkt), Some(parity));
                assert_ne!(pkt[4..], original[4..]);
                assert!(ctx.decrypt_packet(&mut pkt));
                assert_eq!(pkt, original, "{kind} {parity:?}");
            }
        }
    }

    #[test]
    fn test_wrong_parity_key_corrupts() {
        for kind in [CipherType::Csa, CipherType::DesNcb, CipherType::Aes128Ecb] {
            let ctx = keyed(kind);
            let original = test_packet(0x100, 5);
            let mut pkt = original.clone();
            ctx.encrypt_packet(&mut pkt, Parity::Even);
            // relabel as odd so the other half is used
            ts::set_scrambling(&mut pkt, Parity::Odd);
            assert!(ctx.decrypt_packet(&mut pkt));
            assert_ne!(pkt[4..], original[4..], "{kind}");
        }
    }

    #[test]
    fn test_missing_half_leaves_packet() {
        let mut ctx = keyed(CipherType::Csa);
        let mut pkt = test_packet(0x100, 1);
        ctx.encrypt_packet(&mut pkt, Parity::Odd);
        ctx.clear(Parity::Odd);
        let before = pkt.clone();
        assert!(!ctx.decrypt_packet(&mut pkt));
        assert_eq!(pkt, before);
    }

    #[test]
    fn test_flush_forgets_both_halves() {
        let mut ctx = keyed(CipherType::Aes128Ecb);
        let mut pkt = test_packet(0x100, 2);
        ctx.encrypt_packet(&mut pkt, Parity::Even);
        ctx.flush();
        assert!(!ctx.has_key(Parity::Even));
        assert!(!ctx.has_key(Parity::Odd));
        let before = pkt.clone();
        assert!(!ctx.decrypt_packet(&mut pkt));
        assert_eq!(pkt, before);
        assert!(!ctx.encrypt_packet(&mut pkt, Parity::Odd));
    }

    #[test]
    fn test_key_length_checked() {
        let mut ctx = CipherContext::new(CipherType::Aes128Ecb);
        assert_eq!(
            ctx.set_key(Parity::Even, &[0u8; 8]),
            Err(CipherError::KeyLength { expected: 16, actual: 8 })
        );
    }

    #[test]
    fn test_cipher_type_names() {
        assert_eq!("csa".parse::<CipherType>().unwrap(), CipherType::Csa);
        assert_eq!("AES128_ECB".parse::<CipherType>().unwrap(), CipherType::Aes128Ecb);
        assert!("rot13".parse::<CipherType>().is_err());
        assert_eq!(CipherType::from_id(16), Some(CipherType::Aes128Ecb));
        assert_eq!(CipherType::DesNcb.id(), 2);
    }
}
