//! Per-vendor EMM address matching and fragment merging.

use std::borrow::Cow;

use tracing::{debug, trace};

use super::nanos::sort_nanos;
use crate::caid::CardType;

/// Addressing mode of an EMM.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EmmClass {
    /// Addressed to this card's unique address.
    Unique,
    /// Addressed to a provider group containing this card.
    Shared,
    Global,
}

/// A message the card should see.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Forward<'a> {
    pub class: EmmClass,
    pub data: Cow<'a, [u8]>,
}

impl<'a> Forward<'a> {
    fn borrowed(class: EmmClass, data: &'a [u8]) -> Self {
        Self {
            class,
            data: Cow::Borrowed(data),
        }
    }
}

/// Fragment kept until its counterpart arrives on the same mux.
#[derive(Debug, Clone)]
pub(crate) struct SharedEmm {
    pub data: Vec<u8>,
    pub mux: u32,
}

/// One provider on a card: its id and shared address.
#[derive(Debug, Clone)]
pub struct EmmProvider {
    pub id: u32,
    pub sa: [u8; 8],
    viaccess_shared: [Option<SharedEmm>; 2],
}

impl EmmProvider {
    pub fn new(id: u32, sa: [u8; 8]) -> Self {
        Self {
            id,
            sa,
            viaccess_shared: [None, None],
        }
    }
}

/// Card addressing the vendor rules compare against.
#[derive(Debug, Clone)]
pub(crate) struct Addressing {
    pub ua: [u8; 8],
    pub providers: Vec<EmmProvider>,
}

fn bytes_at(data: &[u8], at: usize, expected: &[u8]) -> bool {
    data.get(at..at + expected.len()) == Some(expected)
}

#[derive(Debug, Clone)]
pub(crate) enum EmmVendor {
    Conax,
    Irdeto,
    Seca,
    Viaccess,
    Dre,
    StreamGuard,
    Nagra,
    Nds,
    Cryptoworks { shared: Option<SharedEmm> },
    Bulcrypt,
    Griffin,
    Unsupported,
}

impl EmmVendor {
    pub fn for_card(card: CardType) -> Self {
        match card {
            CardType::Conax => Self::Conax,
            CardType::Irdeto => Self::Irdeto,
            CardType::Seca => Self::Seca,
            CardType::Viaccess => Self::Viaccess,
            CardType::Dre => Self::Dre,
            CardType::StreamGuard => Self::StreamGuard,
            CardType::Nagra => Self::Nagra,
            CardType::Nds => Self::Nds,
            CardType::Cryptoworks => Self::Cryptoworks { shared: None },
            CardType::Bulcrypt => Self::Bulcrypt,
            CardType::Griffin => Self::Griffin,
            CardType::Unknown => Self::Unsupported,
        }
    }

    /// Decides whether `data` addresses this card and returns what to send.
    pub fn process<'a>(&mut self, addr: &mut Addressing, data: &'a [u8], mux: u32) -> Option<Forward<'a>> {
        match self {
            Self::Conax => conax(addr, data),
            Self::Irdeto => irdeto(addr, data),
            Self::Seca => seca(addr, data),
            Self::Viaccess => viaccess(addr, data, mux),
            Self::Dre => dre(addr, data),
            Self::StreamGuard => dre(addr, data),
            Self::Nagra => nagra(addr, data),
            Self::Nds => nds(addr, data),
            Self::Cryptoworks { shared } => cryptoworks(addr, shared, data, mux),
            Self::Bulcrypt => bulcrypt(addr, data),
            Self::Griffin => griffin(addr, data),
            Self::Unsupported => None,
        }
    }
}

fn conax<'a>(addr: &Addressing, data: &'a [u8]) -> Option<Forward<'a>> {
    if data.len() < 10 || data[0] != 0x82 {
        return None;
    }
    addr.providers
        .iter()
        .any(|ep| bytes_at(data, 3, &ep.sa[1..8]))
        .then(|| Forward::borrowed(EmmClass::Shared, data))
}

fn irdeto<'a>(addr: &Addressing, data: &'a [u8]) -> Option<Forward<'a>> {
    let mode_byte = *data.get(3)?;
    let mode = mode_byte >> 3;
    let len = usize::from(mode_byte & 0x07);
    if 4 + len > data.len() {
        return None;
    }
    let matches = |address: &[u8; 8]| {
        mode == address[4] && (len == 0 || data.get(4..4 + len) == address.get(5..5 + len))
    };
    if mode & 0x10 != 0 {
        matches(&addr.ua).then(|| Forward::borrowed(EmmClass::Unique, data))
    } else {
        addr.providers
            .iter()
            .any(|ep| matches(&ep.sa))
            .then(|| Forward::borrowed(EmmClass::Shared, data))
    }
}

fn seca<'a>(addr: &Addressing, data: &'a [u8]) -> Option<Forward<'a>> {
    match *data.first()? {
        0x82 if data.len() >= 9 => {
            bytes_at(data, 3, &addr.ua[2..8]).then(|| Forward::borrowed(EmmClass::Unique, data))
        }
        0x84 if data.len() >= 8 => addr
            .providers
            .iter()
            .any(|ep| bytes_at(data, 5, &ep.sa[5..8]))
            .then(|| Forward::borrowed(EmmClass::Shared, data)),
        0x83 => Some(Forward::borrowed(EmmClass::Global, data)),
        _ => None,
    }
}

// Offset of the first nano after the Viaccess EMM header.
fn viaccess_nano_start(data: &[u8]) -> Option<usize> {
    let start = match *data.first()? {
        0x88 => 8,
        0x8e => 7,
        0x8c | 0x8d => 3,
        0x80 | 0x81 => 4,
        _ => return None,
    };
    (start < data.len()).then_some(start)
}

/// Provider id carried in the leading nano 0x90 of a Viaccess EMM.
fn viaccess_provider_id(data: &[u8]) -> u32 {
    let Some(start) = viaccess_nano_start(data) else {
        return 0;
    };
    match &data[start..] {
        [0x90, 0x03, a, b, c, ..] => u32::from(*a) << 16 | u32::from(*b) << 8 | u32::from(c & 0xf0),
        _ => 0,
    }
}

fn viaccess<'a>(addr: &mut Addressing, data: &'a [u8], mux: u32) -> Option<Forward<'a>> {
    if data.len() < 3 {
        return None;
    }
    let len = 3 + (usize::from(data[1] & 0x0f) << 8) + usize::from(data[2]);
    let data = data.get(..len)?;

    match data[0] {
        0x8c | 0x8d => {
            let id = viaccess_provider_id(data);
            if id == 0 {
                return None;
            }
            let ep = addr.providers.iter_mut().find(|ep| ep.id == id)?;
            let idx = usize::from(data[0] - 0x8c);
            trace!(provider = id, idx, "caching viaccess shared EMM");
            ep.viaccess_shared[idx] = Some(SharedEmm {
                data: data.to_vec(),
                mux,
            });
            None
        }
        0x8e if data.len() >= 7 => {
            if data[6] & 0x02 != 0 {
                return None;
            }
            let (ep, idx) = addr.providers.iter_mut().find_map(|ep| {
                if !bytes_at(data, 3, &ep.sa[4..7]) {
                    return None;
                }
                let id = ep.id;
                let idx = ep.viaccess_shared.iter().position(|shared| {
                    shared
                        .as_ref()
                        .is_some_and(|s| s.mux == mux && viaccess_provider_id(&s.data) == id)
                })?;
                Some((ep, idx))
            })?;
            let shared = ep.viaccess_shared[idx].take()?;

            let start = viaccess_nano_start(data)?;
            let body = &data[start..];
            let addrlen = body.len().checked_sub(8)?;
            let shared_start = viaccess_nano_start(&shared.data)?;

            let mut nanos = Vec::with_capacity(body.len() + 4 + shared.data.len());
            nanos.extend_from_slice(&[0x9e, addrlen as u8]);
            nanos.extend_from_slice(&body[..addrlen]);
            nanos.extend_from_slice(&[0xf0, 0x08]);
            nanos.extend_from_slice(&body[addrlen..]);
            nanos.extend_from_slice(&shared.data[shared_start..]);

            let sorted = match sort_nanos(&nanos) {
                Ok(sorted) => sorted,
                Err(e) => {
                    debug!(error = %e, "dropping viaccess EMM");
                    return None;
                }
            };
            let mut merged = Vec::with_capacity(7 + sorted.len());
            merged.extend_from_slice(&data[..7]);
            merged.extend_from_slice(&sorted);
            let section_len = sorted.len() + 4;
            merged[1] = ((section_len >> 8) as u8) | 0x70;
            merged[2] = section_len as u8;
            Some(Forward {
                class: EmmClass::Unique,
                data: Cow::Owned(merged),
            })
        }
        _ => None,
    }
}

fn dre<'a>(addr: &Addressing, data: &'a [u8]) -> Option<Forward<'a>> {
    match *data.first()? {
        0x87 if data.len() >= 7 => {
            bytes_at(data, 3, &addr.ua[4..8]).then(|| Forward::borrowed(EmmClass::Unique, data))
        }
        0x86 => addr
            .providers
            .iter()
            .any(|ep| bytes_at(data, 40, &ep.sa[4..8]))
            .then(|| Forward::borrowed(EmmClass::Shared, data)),
        _ => None,
    }
}

fn nagra<'a>(addr: &Addressing, data: &'a [u8]) -> Option<Forward<'a>> {
    match *data.first()? {
        0x83 if data.len() >= 8 => {
            let serial = [data[5], data[4], data[3], data[6]];
            let (class, len) = if data[7] == 0x10 {
                (EmmClass::Shared, 3)
            } else {
                (EmmClass::Unique, 4)
            };
            (serial[..len] == addr.ua[4..4 + len]).then(|| Forward::borrowed(class, data))
        }
        0x82 => Some(Forward::borrowed(EmmClass::Global, data)),
        _ => None,
    }
}

fn nds<'a>(addr: &Addressing, data: &'a [u8]) -> Option<Forward<'a>> {
    let mode = *data.get(3)?;
    let serials = usize::from((mode >> 4) & 0x03) + 1;
    match (mode & 0xc0) >> 6 {
        0 => Some(Forward::borrowed(EmmClass::Global, data)),
        kind @ (1 | 2) => {
            let len = 5 - usize::from(kind);
            let class = if kind == 1 { EmmClass::Unique } else { EmmClass::Shared };
            (0..serials)
                .any(|i| bytes_at(data, 4 + i * 4, &addr.ua[4..4 + len]))
                .then(|| Forward::borrowed(class, data))
        }
        _ => None,
    }
}

fn cryptoworks<'a>(
    addr: &Addressing,
    shared: &mut Option<SharedEmm>,
    data: &'a [u8],
    mux: u32,
) -> Option<Forward<'a>> {
    match *data.first()? {
        0x82 if data.len() >= 10 => {
            bytes_at(data, 5, &addr.ua[3..8]).then(|| Forward::borrowed(EmmClass::Unique, data))
        }
        0x84 => {
            if data.len() >= 12 && bytes_at(data, 5, &addr.ua[3..7]) {
                *shared = Some(SharedEmm {
                    data: data.to_vec(),
                    mux,
                });
            }
            None
        }
        0x86 if data.len() >= 5 => {
            if shared.as_ref().map_or(true, |sh| sh.mux != mux) {
                return None;
            }
            let sh = shared.take()?;
            // header of the shared part, then the nanos of both parts
            let mut nanos = data[5..].to_vec();
            nanos.extend_from_slice(&sh.data[12..]);
            let sorted = match sort_nanos(&nanos) {
                Ok(sorted) => sorted,
                Err(e) => {
                    debug!(error = %e, "dropping cryptoworks EMM");
                    return None;
                }
            };
            let mut composed = Vec::with_capacity(12 + sorted.len());
            composed.extend_from_slice(&sh.data[..12]);
            composed.extend_from_slice(&sorted);
            let section_len = sorted.len() + 9;
            composed[1] = ((section_len >> 8) as u8) | 0x70;
            composed[2] = section_len as u8;
            Some(Forward {
                class: EmmClass::Shared,
                data: Cow::Owned(composed),
            })
        }
        0x88 | 0x89 => Some(Forward::borrowed(EmmClass::Global, data)),
        _ => None,
    }
}

fn bulcrypt<'a>(addr: &Addressing, data: &'a [u8]) -> Option<Forward<'a>> {
    if data.len() < 10 {
        return None;
    }
    match data[0] {
        // bulcrypt and polaris, one or four cards
        0x82 | 0x8a | 0x85 | 0x8b => {
            bytes_at(data, 3, &addr.ua[2..5]).then(|| Forward::borrowed(EmmClass::Unique, data))
        }
        0x84 => bytes_at(data, 3, &addr.ua[2..4]).then(|| Forward::borrowed(EmmClass::Shared, data)),
        _ => None,
    }
}

fn griffin<'a>(addr: &Addressing, data: &'a [u8]) -> Option<Forward<'a>> {
    match *data.first()? {
        0x82 | 0x83 => addr
            .providers
            .iter()
            .any(|ep| bytes_at(data, 3, &ep.sa[..4]))
            .then(|| Forward::borrowed(EmmClass::Shared, data)),
        _ => None,
    }
}
