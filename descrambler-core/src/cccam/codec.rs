use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use bytes::{Buf, Bytes, BytesMut};
use parking_lot::Mutex;
use tokio_util::codec::{Decoder, Encoder};

use super::crypto::{decrypt_cw, CryptBlock};
use crate::client::ClientError;

/// Largest message body.
pub const MAX_BODY: usize = 0x400 - 2;
const HEADER_LEN: usize = 4;

pub const CLI_DATA: u8 = 0x00;
pub const ECM: u8 = 0x01;
pub const EMM: u8 = 0x02;
pub const CARD_REMOVED: u8 = 0x04;
pub const KEEPALIVE: u8 = 0x06;
pub const NEW_CARD: u8 = 0x07;
pub const SRV_DATA: u8 = 0x08;
pub const NEW_CARD_SIDINFO: u8 = 0x0f;
pub const ECM_NOK1: u8 = 0xfe;
pub const ECM_NOK2: u8 = 0xff;

const PARTNER: &[u8] = b"PARTNER:";

/// A framed CCcam message. For ECM replies the decoder replaces the body
/// with the de-obfuscated control words.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CccamMessage {
    pub seq: u8,
    pub cmd: u8,
    pub body: Bytes,
}

impl CccamMessage {
    pub fn new(cmd: u8, body: impl Into<Bytes>) -> Self {
        Self {
            seq: 0,
            cmd,
            body: body.into(),
        }
    }

    /// Capability announcement carried by an ECM NOK.
    pub fn is_partner(&self) -> bool {
        self.cmd == ECM_NOK1 && self.body.starts_with(PARTNER)
    }

    pub fn is_ecm_reply(&self) -> bool {
        matches!(self.cmd, ECM | ECM_NOK1 | ECM_NOK2) && !self.is_partner()
    }
}

struct CardTrack {
    last: u32,
    by_seq: [u32; 256],
}

/// Connection facts shared by the two codec halves: which card an ECM
/// reply belongs to depends on what was written last.
pub struct Link {
    node_id: u64,
    extended: AtomicBool,
    cards: Mutex<CardTrack>,
}

impl Link {
    pub fn new(node_id: [u8; 8]) -> Arc<Self> {
        Arc::new(Self {
            node_id: u64::from_be_bytes(node_id),
            extended: AtomicBool::new(false),
            cards: Mutex::new(CardTrack {
                last: 0,
                by_seq: [0; 256],
            }),
        })
    }

    pub fn is_extended(&self) -> bool {
        self.extended.load(Ordering::Acquire)
    }

    pub fn set_extended(&self, extended: bool) {
        self.extended.store(extended, Ordering::Release);
    }

    fn record_ecm(&self, seq: u8, card_id: u32) {
        let mut cards = self.cards.lock();
        cards.last = card_id;
        cards.by_seq[usize::from(seq)] = card_id;
    }

    /// Card of the request a reply with header `seq` answers.
    fn card_for(&self, seq: u8) -> u32 {
        let cards = self.cards.lock();
        if self.is_extended() {
            cards.by_seq[usize::from(seq)]
        } else {
            cards.last
        }
    }
}

pub struct CccamEncoder {
    block: CryptBlock,
    link: Arc<Link>,
}

impl CccamEncoder {
    pub fn new(block: CryptBlock, link: Arc<Link>) -> Self {
        Self { block, link }
    }

    /// Encrypts bytes without a message header, as used during login.
    pub fn encode_raw(&mut self, data: &[u8], dst: &mut BytesMut) {
        let start = dst.len();
        dst.extend_from_slice(data);
        self.block.encrypt(&mut dst[start..]);
    }

    /// Advances the cipher over `data` without producing output.
    pub fn absorb(&mut self, data: &[u8]) {
        let mut scratch = data.to_vec();
        self.block.encrypt(&mut scratch);
    }
}

impl Encoder<CccamMessage> for CccamEncoder {
    type Error = ClientError;

    fn encode(&mut self, item: CccamMessage, dst: &mut BytesMut) -> Result<(), Self::Error> {
        let len = item.body.len();
        if len > MAX_BODY {
            return Err(ClientError::Oversize(len));
        }
        if item.cmd == ECM && len >= 10 {
            let card_id = u32::from_be_bytes([item.body[6], item.body[7], item.body[8], item.body[9]]);
            self.link.record_ecm(item.seq, card_id);
        }
        let start = dst.len();
        dst.extend_from_slice(&[item.seq, item.cmd, (len >> 8) as u8, len as u8]);
        dst.extend_from_slice(&item.body);
        self.block.encrypt(&mut dst[start..]);
        Ok(())
    }
}

pub struct CccamDecoder {
    block: CryptBlock,
    link: Arc<Link>,
    header: Option<[u8; HEADER_LEN]>,
}

impl CccamDecoder {
    pub fn new(block: CryptBlock, link: Arc<Link>) -> Self {
        Self {
            block,
            link,
            header: None,
        }
    }

    /// Decrypts bytes read outside of framing, as used during login.
    pub fn decrypt_raw(&mut self, data: &mut [u8]) {
        self.block.decrypt(data);
    }
}

impl Decoder for CccamDecoder {
    type Item = CccamMessage;
    type Error = ClientError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        // the header is decrypted once; the cipher state cannot be rewound
        let header = match self.header {
            Some(header) => header,
            None => {
                if src.len() < HEADER_LEN {
                    return Ok(None);
                }
                let mut header = [0u8; HEADER_LEN];
                header.copy_from_slice(&src[..HEADER_LEN]);
                src.advance(HEADER_LEN);
                self.block.decrypt(&mut header);
                let len = usize::from(u16::from_be_bytes([header[2], header[3]]));
                if len > MAX_BODY {
                    return Err(ClientError::Oversize(len));
                }
                self.header = Some(header);
                header
            }
        };

        let len = usize::from(u16::from_be_bytes([header[2], header[3]]));
        if src.len() < len {
            src.reserve(len - src.len());
            return Ok(None);
        }
        self.header = None;
        let mut body = src.split_to(len);
        self.block.decrypt(&mut body);

        let mut msg = CccamMessage {
            seq: header[0],
            cmd: header[1],
            body: body.freeze(),
        };
        if msg.is_ecm_reply() {
            let mut body = BytesMut::from(&msg.body[..]);
            let mut cw = [0u8; 16];
            let has_cw = body.len() >= cw.len();
            if has_cw {
                cw.copy_from_slice(&body[..16]);
                decrypt_cw(self.link.node_id, self.link.card_for(msg.seq), &mut cw);
                body[..16].copy_from_slice(&cw);
            }
            // replies run through the receive cipher a second time
            self.block.decrypt(&mut body);
            msg.body = if has_cw { Bytes::copy_from_slice(&cw) } else { Bytes::new() };
        }
        Ok(Some(msg))
    }
}
