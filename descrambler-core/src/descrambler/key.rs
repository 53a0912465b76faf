use std::time::Duration;

use tokio::time::Instant;
use zeroize::Zeroize;

use crate::cipher::{CipherContext, CipherError, CipherType};
use crate::ts::Parity;

const MAX_KEY_SIZE: usize = 16;

/// Even/odd key material for one PID (0 = every stream without its own slot)
/// plus the rotation bookkeeping derived from it.
#[derive(Debug)]
pub(crate) struct KeySlot {
    pub pid: u16,
    pub cipher: CipherContext,
    key: [[u8; MAX_KEY_SIZE]; 2],
    pub valid: [bool; 2],
    pub timestamp: [Option<Instant>; 2],
    /// Parity committed by the last corroborated switch.
    pub active: Option<Parity>,
    pub interval: Duration,
    pub last_switch: Option<Instant>,
    /// Fixed keys never go stale.
    pub constant: bool,
}

impl KeySlot {
    pub fn new(pid: u16, kind: CipherType, interval: Duration) -> Self {
        Self {
            pid,
            cipher: CipherContext::new(kind),
            key: [[0; MAX_KEY_SIZE]; 2],
            valid: [false; 2],
            timestamp: [None; 2],
            active: None,
            interval,
            last_switch: None,
            constant: false,
        }
    }

    pub fn kind(&self) -> CipherType {
        self.cipher.kind()
    }

    /// Switches the slot to another cipher type, forgetting both halves.
    pub fn reset_kind(&mut self, kind: CipherType) {
        self.cipher = CipherContext::new(kind);
        self.key.zeroize();
        self.valid = [false; 2];
        self.timestamp = [None; 2];
        self.active = None;
    }

    pub fn is_valid(&self, parity: Parity) -> bool {
        self.valid[parity.index()]
    }

    pub fn any_valid(&self) -> bool {
        self.valid.iter().any(|v| *v)
    }

    pub fn same_key(&self, parity: Parity, key: &[u8]) -> bool {
        self.key[parity.index()].get(..key.len()) == Some(key)
    }

    pub fn install(&mut self, parity: Parity, key: &[u8], at: Instant) -> Result<(), CipherError> {
        self.cipher.set_key(parity, key)?;
        let slot = &mut self.key[parity.index()];
        slot.zeroize();
        slot[..key.len()].copy_from_slice(key);
        self.valid[parity.index()] = true;
        self.timestamp[parity.index()] = Some(at);
        Ok(())
    }

    pub fn invalidate(&mut self, parity: Parity) {
        self.valid[parity.index()] = false;
        self.key[parity.index()].zeroize();
        self.cipher.clear(parity);
    }

    pub fn decrypt(&self, packet: &mut [u8]) -> bool {
        self.cipher.decrypt_packet(packet)
    }
}

impl Drop for KeySlot {
    fn drop(&mut self) {
        self.key.zeroize();
        self.cipher.flush();
    }
}

pub(crate) fn is_zero_key(key: &[u8]) -> bool {
    key.iter().all(|b| *b == 0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_install_and_invalidate() {
        let now = Instant::now();
        let mut slot = KeySlot::new(0, CipherType::Csa, Duration::from_secs(10));
        assert!(!slot.any_valid());
        slot.install(Parity::Odd, &[1, 2, 3, 4, 5, 6, 7, 8], now).unwrap();
        assert!(slot.is_valid(Parity::Odd));
        assert!(slot.same_key(Parity::Odd, &[1, 2, 3, 4, 5, 6, 7, 8]));
        assert!(!slot.same_key(Parity::Even, &[1, 2, 3, 4, 5, 6, 7, 8]));
        slot.invalidate(Parity::Odd);
        assert!(!slot.any_valid());
        assert!(!slot.cipher.has_key(Parity::Odd));
        assert_eq!(slot.key[Parity::Odd.index()], [0; MAX_KEY_SIZE]);
        assert!(!slot.same_key(Parity::Odd, &[1, 2, 3, 4, 5, 6, 7, 8]));
    }

    #[test]
    fn test_shorter_key_overwrites_whole_half() {
        let now = Instant::now();
        let mut slot = KeySlot::new(0, CipherType::Aes128Ecb, Duration::from_secs(10));
        slot.install(Parity::Even, &[0xff; 16], now).unwrap();
        slot.reset_kind(CipherType::Csa);
        assert_eq!(slot.key, [[0; MAX_KEY_SIZE]; 2]);
        slot.install(Parity::Even, &[3; 8], now).unwrap();
        assert_eq!(&slot.key[Parity::Even.index()][8..], &[0; 8]);
    }

    #[test]
    fn test_reset_kind_forgets_keys() {
        let mut slot = KeySlot::new(0, CipherType::Csa, Duration::from_secs(10));
        slot.install(Parity::Even, &[9; 8], Instant::now()).unwrap();
        slot.reset_kind(CipherType::Aes128Ecb);
        assert!(!slot.any_valid());
        assert!(slot.install(Parity::Even, &[9; 8], Instant::now()).is_err());
        assert!(slot.install(Parity::Even, &[9; 16], Instant::now()).is_ok());
    }

    #[test]
    fn test_zero_key() {
        assert!(is_zero_key(&[0; 8]));
        assert!(!is_zero_key(&[0, 0, 1, 0]));
    }
}
