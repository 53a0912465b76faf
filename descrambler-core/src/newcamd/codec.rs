use bytes::{Buf, Bytes, BytesMut};
use tokio_util::codec::{Decoder, Encoder};
use tracing::warn;

use super::crypto::{MessageCipher, MAX_MESSAGE};
use crate::client::{ClientError, ClientResult};

/// Length prefix plus the clear header in front of every command.
const HEADER_LEN: usize = 12;

/// A newcamd message: routing header and command bytes.
///
/// `data` starts with the command byte followed by a 12-bit length; only
/// the declared length is kept on decode.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewcamdMessage {
    pub seq: u16,
    pub sid: u16,
    pub caid: u16,
    pub provider: u32,
    pub data: Bytes,
}

impl NewcamdMessage {
    /// A bare command with its length field filled in.
    pub fn command(cmd: u8, body: &[u8]) -> Self {
        let mut data = Vec::with_capacity(body.len() + 3);
        data.push(cmd);
        data.push(((body.len() >> 8) & 0x0f) as u8);
        data.push(body.len() as u8);
        data.extend_from_slice(body);
        Self {
            seq: 0,
            sid: 0,
            caid: 0,
            provider: 0,
            data: data.into(),
        }
    }

    pub fn cmd(&self) -> u8 {
        self.data.first().copied().unwrap_or_default()
    }

    /// Bytes after the command and length field.
    pub fn body(&self) -> &[u8] {
        self.data.get(3..).unwrap_or_default()
    }
}

/// Frames and encrypts newcamd messages with one session key.
#[derive(Clone)]
pub struct NewcamdCodec {
    cipher: MessageCipher,
}

impl NewcamdCodec {
    pub fn new(cipher: MessageCipher) -> Self {
        Self { cipher }
    }

    fn parse(&self, mut frame: BytesMut) -> ClientResult<NewcamdMessage> {
        let end = self.cipher.open(&mut frame)?;
        if end < HEADER_LEN + 3 {
            return Err(ClientError::Framing(format!("short message of {end} bytes")));
        }
        frame.truncate(end);
        frame.advance(2);
        let mut header = frame.split_to(HEADER_LEN - 2);
        let seq = header.get_u16();
        let sid = header.get_u16();
        let caid = header.get_u16();
        let provider = u32::from(header[0]) << 16 | u32::from(header[1]) << 8 | u32::from(header[2]) | u32::from(header[3]) << 24;
        let declared = (usize::from(frame[1] & 0x0f) << 8 | usize::from(frame[2])) + 3;
        frame.truncate(declared.min(frame.len()));
        Ok(NewcamdMessage {
            seq,
            sid,
            caid,
            provider,
            data: frame.freeze(),
        })
    }
}

impl Encoder<NewcamdMessage> for NewcamdCodec {
    type Error = ClientError;

    fn encode(&mut self, item: NewcamdMessage, dst: &mut BytesMut) -> Result<(), Self::Error> {
        if item.data.len() < 3 || item.data.len() + HEADER_LEN > MAX_MESSAGE {
            return Err(ClientError::Oversize(item.data.len()));
        }
        let mut buf = Vec::with_capacity(MAX_MESSAGE);
        buf.extend_from_slice(&[0, 0]);
        buf.extend_from_slice(&item.seq.to_be_bytes());
        buf.extend_from_slice(&item.sid.to_be_bytes());
        buf.extend_from_slice(&item.caid.to_be_bytes());
        let p = item.provider;
        buf.extend_from_slice(&[(p >> 16) as u8, (p >> 8) as u8, p as u8, (p >> 24) as u8]);
        buf.extend_from_slice(&item.data);
        self.cipher.seal(&mut buf)?;
        let len = buf.len() - 2;
        buf[0] = (len >> 8) as u8;
        buf[1] = len as u8;
        dst.extend_from_slice(&buf);
        Ok(())
    }
}

impl Decoder for NewcamdCodec {
    type Item = NewcamdMessage;
    type Error = ClientError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        loop {
            if src.len() < 2 {
                return Ok(None);
            }
            let len = usize::from(u16::from_be_bytes([src[0], src[1]]));
            if len >= MAX_MESSAGE {
                return Err(ClientError::Oversize(len));
            }
            if src.len() < len + 2 {
                src.reserve(len + 2 - src.len());
                return Ok(None);
            }
            let frame = src.split_to(len + 2);
            match self.parse(frame) {
                Ok(msg) => return Ok(Some(msg)),
                Err(ClientError::Checksum) => {
                    warn!(len, "dropping message with bad checksum");
                }
                Err(e) => return Err(e),
            }
        }
    }
}
