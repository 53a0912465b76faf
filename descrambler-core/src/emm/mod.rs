//! EMM filtering for one card: address matching per vendor, merging of
//! split messages and suppression of recently forwarded duplicates.

mod cache;
mod nanos;
mod vendor;

use thiserror::Error;
use tracing::trace;

use crate::caid::CardType;
use crate::ts::section_crc;

pub use cache::{EmmCache, EMM_CACHE_SIZE};
pub use nanos::sort_nanos;
pub use vendor::{EmmClass, EmmProvider, Forward};

use vendor::{Addressing, EmmVendor};

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum EmmError {
    #[error("truncated nano at offset {0}")]
    TruncatedNano(usize),
}

/// Per-card EMM state.
#[derive(Debug, Clone)]
pub struct EmmReassembler {
    caid: u16,
    vendor: EmmVendor,
    addressing: Addressing,
    cache: EmmCache,
}

impl EmmReassembler {
    pub fn new(caid: u16, ua: [u8; 8], providers: Vec<EmmProvider>) -> Self {
        Self {
            caid,
            vendor: EmmVendor::for_card(CardType::detect(caid)),
            addressing: Addressing { ua, providers },
            cache: EmmCache::default(),
        }
    }

    pub fn caid(&self) -> u16 {
        self.caid
    }

    pub fn unique_address(&self) -> &[u8; 8] {
        &self.addressing.ua
    }

    pub fn providers(&self) -> &[EmmProvider] {
        &self.addressing.providers
    }

    /// Replaces the card address and provider table. The duplicate cache is
    /// kept.
    pub fn set_card(&mut self, ua: [u8; 8], providers: Vec<EmmProvider>) {
        self.addressing = Addressing { ua, providers };
    }

    pub fn is_known_vendor(&self) -> bool {
        !matches!(self.vendor, EmmVendor::Unsupported)
    }

    /// Whether EMMs can be matched at all: a known vendor and a card address.
    pub fn is_active(&self) -> bool {
        self.is_known_vendor() && self.addressing.ua.iter().any(|b| *b != 0)
    }

    /// Returns the message to forward to the card, if `data` addresses it and
    /// was not forwarded recently.
    pub fn filter(&mut self, data: &[u8], mux: u32) -> Option<Vec<u8>> {
        let forward = self.vendor.process(&mut self.addressing, data, mux)?;
        let crc = section_crc(&forward.data);
        if self.cache.contains(crc) {
            trace!(caid = format_args!("{:04X}", self.caid), crc, "duplicate EMM");
            return None;
        }
        self.cache.insert(crc);
        trace!(
            caid = format_args!("{:04X}", self.caid),
            class = ?forward.class,
            len = forward.data.len(),
            "forwarding EMM"
        );
        Some(forward.data.into_owned())
    }
}
