//! CA system identifier table.
//!
//! Maps 16-bit CA system ids to vendor names, detects the vendor family used
//! for EMM filtering and parses CA descriptors out of PMT/CAT descriptor loops.

use std::fmt;

struct CaidEntry {
    name: &'static str,
    id: u16,
    mask: u16,
}

const CAID_TABLE: &[CaidEntry] = &[
    CaidEntry { name: "Seca", id: 0x0100, mask: 0xff00 },
    CaidEntry { name: "CCETT", id: 0x0200, mask: 0xff00 },
    CaidEntry { name: "Deutsche Telekom", id: 0x0300, mask: 0xff00 },
    CaidEntry { name: "Eurodec", id: 0x0400, mask: 0xff00 },
    CaidEntry { name: "Viaccess", id: 0x0500, mask: 0xff00 },
    CaidEntry { name: "Irdeto", id: 0x0600, mask: 0xff00 },
    CaidEntry { name: "Jerroldgi", id: 0x0700, mask: 0xff00 },
    CaidEntry { name: "Matra", id: 0x0800, mask: 0xff00 },
    CaidEntry { name: "NDS", id: 0x0900, mask: 0xff00 },
    CaidEntry { name: "Nokia", id: 0x0A00, mask: 0xff00 },
    CaidEntry { name: "Conax", id: 0x0B00, mask: 0xff00 },
    CaidEntry { name: "NTL", id: 0x0C00, mask: 0xff00 },
    CaidEntry { name: "CryptoWorks", id: 0x0D00, mask: 0xff80 },
    CaidEntry { name: "CryptoWorks ICE", id: 0x0D80, mask: 0xff80 },
    CaidEntry { name: "PowerVu", id: 0x0E00, mask: 0xff00 },
    CaidEntry { name: "Sony", id: 0x0F00, mask: 0xff00 },
    CaidEntry { name: "Tandberg", id: 0x1000, mask: 0xff00 },
    CaidEntry { name: "Thompson", id: 0x1100, mask: 0xff00 },
    CaidEntry { name: "TV-Com", id: 0x1200, mask: 0xff00 },
    CaidEntry { name: "HPT", id: 0x1300, mask: 0xff00 },
    CaidEntry { name: "HRT", id: 0x1400, mask: 0xff00 },
    CaidEntry { name: "IBM", id: 0x1500, mask: 0xff00 },
    CaidEntry { name: "Nera", id: 0x1600, mask: 0xff00 },
    CaidEntry { name: "BetaCrypt", id: 0x1700, mask: 0xff00 },
    CaidEntry { name: "NagraVision", id: 0x1800, mask: 0xff00 },
    CaidEntry { name: "Titan", id: 0x1900, mask: 0xff00 },
    CaidEntry { name: "Telefonica", id: 0x2000, mask: 0xff00 },
    CaidEntry { name: "Stentor", id: 0x2100, mask: 0xff00 },
    CaidEntry { name: "Tadiran Scopus", id: 0x2200, mask: 0xff00 },
    CaidEntry { name: "BARCO AS", id: 0x2300, mask: 0xff00 },
    CaidEntry { name: "StarGuide", id: 0x2400, mask: 0xff00 },
    CaidEntry { name: "Mentor", id: 0x2500, mask: 0xff00 },
    CaidEntry { name: "EBU", id: 0x2600, mask: 0xff00 },
    CaidEntry { name: "GI", id: 0x4700, mask: 0xff00 },
    CaidEntry { name: "Telemann", id: 0x4800, mask: 0xff00 },
    CaidEntry { name: "DGCrypt", id: 0x4abf, mask: 0xffff },
    CaidEntry { name: "StreamGuard", id: 0x4ad2, mask: 0xffff },
    CaidEntry { name: "DRECrypt", id: 0x4ae0, mask: 0xffff },
    CaidEntry { name: "DRECrypt2", id: 0x4ae1, mask: 0xffff },
    CaidEntry { name: "Bulcrypt", id: 0x4aee, mask: 0xffff },
    CaidEntry { name: "TongFang", id: 0x4b00, mask: 0xff00 },
    CaidEntry { name: "Griffin", id: 0x5500, mask: 0xffe0 },
    CaidEntry { name: "Bulcrypt", id: 0x5581, mask: 0xffff },
    CaidEntry { name: "Verimatrix", id: 0x5601, mask: 0xffff },
    CaidEntry { name: "DRECrypt", id: 0x7be0, mask: 0xffff },
    CaidEntry { name: "DRECrypt2", id: 0x7be1, mask: 0xffff },
];

/// Vendor name for a CA system id, or its hex form when unknown.
pub fn caid_to_name(caid: u16) -> String {
    CAID_TABLE
        .iter()
        .find(|e| e.id == caid & e.mask)
        .map_or_else(|| format!("{caid:#x}"), |e| e.name.to_string())
}

/// Reverse lookup by vendor name (case-insensitive); falls back to parsing
/// a decimal or `0x`-prefixed hex number.
pub fn name_to_caid(name: &str) -> Option<u16> {
    let name = name.trim();
    if let Some(entry) = CAID_TABLE.iter().find(|e| e.name.eq_ignore_ascii_case(name)) {
        return Some(entry.id);
    }
    match name.strip_prefix("0x").or_else(|| name.strip_prefix("0X")) {
        Some(hex) => u16::from_str_radix(hex, 16).ok(),
        None => name.parse().ok(),
    }
}

/// Card vendor family, used to select the EMM filtering rules.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CardType {
    Unknown,
    Irdeto,
    Viaccess,
    Conax,
    Seca,
    Dre,
    StreamGuard,
    Nagra,
    Nds,
    Cryptoworks,
    Bulcrypt,
    Griffin,
}

impl CardType {
    pub fn detect(caid: u16) -> Self {
        match caid {
            0x4ad2 => return Self::StreamGuard,
            0x5581 | 0x4aee => return Self::Bulcrypt,
            0x5500..=0x551a => return Self::Griffin,
            _ => {}
        }
        match caid >> 8 {
            0x17 | 0x06 => Self::Irdeto,
            0x05 => Self::Viaccess,
            0x0b => Self::Conax,
            0x01 => Self::Seca,
            0x4a => Self::Dre,
            0x18 => Self::Nagra,
            0x09 => Self::Nds,
            0x0d => Self::Cryptoworks,
            _ => Self::Unknown,
        }
    }

    pub fn is_known(self) -> bool {
        self != Self::Unknown
    }
}

impl fmt::Display for CardType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Unknown => "unknown",
            Self::Irdeto => "irdeto",
            Self::Viaccess => "viaccess",
            Self::Conax => "conax",
            Self::Seca => "seca",
            Self::Dre => "dre",
            Self::StreamGuard => "streamguard",
            Self::Nagra => "nagra",
            Self::Nds => "nds",
            Self::Cryptoworks => "cryptoworks",
            Self::Bulcrypt => "bulcrypt",
            Self::Griffin => "griffin",
        };
        f.write_str(name)
    }
}

/// One CA descriptor: the CA system, the provider it names (0 when the
/// descriptor carries none) and the PID carrying its ECMs or EMMs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CaDescriptor {
    pub caid: u16,
    pub provider_id: u32,
    pub pid: u16,
}

const CA_DESCRIPTOR_TAG: u8 = 0x09;

/// Walks a PMT/CAT descriptor loop and returns every CA descriptor in it.
/// Truncated descriptors end the walk.
pub fn ca_descriptors(mut data: &[u8]) -> Vec<CaDescriptor> {
    let mut out = Vec::new();
    while data.len() >= 2 {
        let tag = data[0];
        let len = data[1] as usize;
        let Some(body) = data.get(2..2 + len) else {
            break;
        };
        if tag == CA_DESCRIPTOR_TAG {
            if let Some(desc) = parse_ca_descriptor(body) {
                out.push(desc);
            }
        }
        data = &data[2 + len..];
    }
    out
}

fn parse_ca_descriptor(body: &[u8]) -> Option<CaDescriptor> {
    if body.len() < 4 {
        return None;
    }
    let caid = u16::from_be_bytes([body[0], body[1]]);
    let pid = u16::from_be_bytes([body[2], body[3]]) & 0x1fff;
    let provider_id = match caid & 0xff00 {
        0x0100 if body.len() >= 6 => u32::from(u16::from_be_bytes([body[4], body[5]])),
        0x0500 => viaccess_provider(&body[4..]),
        0x4a00 if body.len() >= 5 => u32::from(body[4]),
        _ => 0,
    };
    Some(CaDescriptor { caid, provider_id, pid })
}

// Viaccess puts the provider in a nano 0x14 inside the private data.
fn viaccess_provider(mut private: &[u8]) -> u32 {
    while private.len() >= 2 {
        let nano = private[0];
        let len = private[1] as usize;
        let Some(value) = private.get(2..2 + len) else {
            break;
        };
        if nano == 0x14 && value.len() >= 3 {
            return (u32::from(value[0]) << 16) | (u32::from(value[1]) << 8) | u32::from(value[2] & 0xf0);
        }
        private = &private[2 + len..];
    }
    0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_caid_to_name() {
        assert_eq!(caid_to_name(0x0500), "Viaccess");
        assert_eq!(caid_to_name(0x0604), "Irdeto");
        assert_eq!(caid_to_name(0x0d02), "CryptoWorks");
        assert_eq!(caid_to_name(0x0d96), "CryptoWorks ICE");
        assert_eq!(caid_to_name(0x551a), "Griffin");
        assert_eq!(caid_to_name(0x4ae1), "DRECrypt2");
        assert_eq!(caid_to_name(0x4ae2), "0x4ae2");
    }

    #[test]
    fn test_name_to_caid() {
        assert_eq!(name_to_caid("conax"), Some(0x0b00));
        assert_eq!(name_to_caid("0x1802"), Some(0x1802));
        assert_eq!(name_to_caid("1280"), Some(0x0500));
        assert_eq!(name_to_caid("nope"), None);
    }

    #[test]
    fn test_detect_card_type() {
        assert_eq!(CardType::detect(0x4ad2), CardType::StreamGuard);
        assert_eq!(CardType::detect(0x4aee), CardType::Bulcrypt);
        assert_eq!(CardType::detect(0x5581), CardType::Bulcrypt);
        assert_eq!(CardType::detect(0x5510), CardType::Griffin);
        assert_eq!(CardType::detect(0x4ae0), CardType::Dre);
        assert_eq!(CardType::detect(0x1702), CardType::Irdeto);
        assert_eq!(CardType::detect(0x0d05), CardType::Cryptoworks);
        assert_eq!(CardType::detect(0x2600), CardType::Unknown);
        assert!(!CardType::detect(0x2600).is_known());
    }

    #[test]
    fn test_ca_descriptors() {
        let loop_bytes = [
            // Viaccess with provider nano
            0x09, 0x09, 0x05, 0x00, 0xe1, 0x00, 0x14, 0x03, 0x02, 0x46, 0x1f,
            // unrelated descriptor
            0x52, 0x01, 0x07,
            // Seca with provider in private data
            0x09, 0x06, 0x01, 0x00, 0xe2, 0x00, 0x00, 0x6a,
            // Conax, no private data
            0x09, 0x04, 0x0b, 0x00, 0xe3, 0x00,
        ];
        let descs = ca_descriptors(&loop_bytes);
        assert_eq!(
            descs,
            vec![
                CaDescriptor { caid: 0x0500, provider_id: 0x024610, pid: 0x100 },
                CaDescriptor { caid: 0x0100, provider_id: 0x6a, pid: 0x200 },
                CaDescriptor { caid: 0x0b00, provider_id: 0, pid: 0x300 },
            ]
        );
    }

    #[test]
    fn test_ca_descriptors_truncated() {
        let loop_bytes = [0x09, 0x04, 0x0b, 0x00, 0xe3, 0x00, 0x09, 0x08, 0x05];
        assert_eq!(ca_descriptors(&loop_bytes).len(), 1);
    }
}
