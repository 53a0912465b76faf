//! Transport packet header helpers.

use crc::{Crc, CRC_32_MPEG_2};

pub const TS_PACKET_SIZE: usize = 188;
pub const TS_SYNC_BYTE: u8 = 0x47;

const SCRAMBLING_MASK: u8 = 0xc0;
const ADAPTATION_FIELD: u8 = 0x20;
const PAYLOAD_PRESENT: u8 = 0x10;

/// Key half a scrambled packet was enciphered with.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Parity {
    Even,
    Odd,
}

impl Parity {
    pub fn other(self) -> Self {
        match self {
            Self::Even => Self::Odd,
            Self::Odd => Self::Even,
        }
    }

    pub fn index(self) -> usize {
        match self {
            Self::Even => 0,
            Self::Odd => 1,
        }
    }

    pub fn scrambling_bits(self) -> u8 {
        match self {
            Self::Even => 0x80,
            Self::Odd => 0xc0,
        }
    }
}

/// PID from the packet header.
pub fn pid(packet: &[u8]) -> Option<u16> {
    if packet.len() < 4 {
        return None;
    }
    Some(u16::from_be_bytes([packet[1] & 0x1f, packet[2]]))
}

/// Parity of a scrambled packet, `None` when the packet is clear or uses the
/// reserved scrambling value.
pub fn parity(packet: &[u8]) -> Option<Parity> {
    match packet.get(3)? & SCRAMBLING_MASK {
        0x80 => Some(Parity::Even),
        0xc0 => Some(Parity::Odd),
        _ => None,
    }
}

pub fn is_scrambled(packet: &[u8]) -> bool {
    packet.get(3).is_some_and(|b| b & 0x80 != 0)
}

/// Offset of the payload, skipping the adaptation field when present.
/// `None` for packets without payload or with a broken adaptation length.
pub fn payload_offset(packet: &[u8]) -> Option<usize> {
    let flags = *packet.get(3)?;
    if flags & PAYLOAD_PRESENT == 0 {
        return None;
    }
    let offset = if flags & ADAPTATION_FIELD != 0 {
        4 + 1 + usize::from(*packet.get(4)?)
    } else {
        4
    };
    (offset < packet.len()).then_some(offset)
}

pub fn clear_scrambling(packet: &mut [u8]) {
    if let Some(flags) = packet.get_mut(3) {
        *flags &= !SCRAMBLING_MASK;
    }
}

pub fn set_scrambling(packet: &mut [u8], parity: Parity) {
    if let Some(flags) = packet.get_mut(3) {
        *flags = (*flags & !SCRAMBLING_MASK) | parity.scrambling_bits();
    }
}

const MPEG_CRC: Crc<u32> = Crc::<u32>::new(&CRC_32_MPEG_2);

/// CRC-32/MPEG-2 over a whole section, used to detect repeated content.
pub fn section_crc(data: &[u8]) -> u32 {
    MPEG_CRC.checksum(data)
}

#[cfg(test)]
pub(crate) fn test_packet(pid: u16, counter: u8) -> Vec<u8> {
    let mut pkt = vec![0u8; TS_PACKET_SIZE];
    pkt[0] = TS_SYNC_BYTE;
    pkt[1] = ((pid >> 8) as u8) & 0x1f;
    pkt[2] = pid as u8;
    pkt[3] = PAYLOAD_PRESENT | (counter & 0x0f);
    for (i, b) in pkt[4..].iter_mut().enumerate() {
        *b = (i as u8).wrapping_mul(7).wrapping_add(counter);
    }
    pkt
}
