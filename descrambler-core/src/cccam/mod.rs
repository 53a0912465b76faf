//! CCcam card-server client.
//!
//! Each direction runs its own stream cipher seeded from a SHA1 digest of
//! the server's greeting; the cipher is never reset, so every byte must be
//! processed in socket order. Against oscam servers an extended mode can
//! be negotiated in which several ECMs are in flight at once.

mod codec;
mod crypto;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::BytesMut;
use parking_lot::Mutex;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio_util::codec::Encoder;
use tracing::{debug, info, trace, warn};

use crate::caid::caid_to_name;
use crate::cipher::CipherType;
use crate::client::{
    ClientError, ClientResult, ClientStatus, EcmAnswer, EcmRequest, EmmTarget, NetworkClient, NetworkSettings,
    Protocol, ProviderInfo, Session,
};
use crate::config::{CccamConfig, CCCAM_VERSIONS};

pub use codec::{CccamDecoder, CccamEncoder, CccamMessage, Link};
pub use crypto::{decrypt_cw, is_oscam_seed, CryptBlock, LoginKeys};

use codec::{
    CARD_REMOVED, CLI_DATA, ECM, ECM_NOK1, ECM_NOK2, EMM, KEEPALIVE, NEW_CARD, NEW_CARD_SIDINFO, SRV_DATA,
};

const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(5);
/// Silence after which the server is considered gone.
const READ_TIMEOUT: Duration = Duration::from_secs(30);
const MAX_USERNAME: usize = 127;
const BUILD: &str = "tvh";

pub type CccamClient = NetworkClient<Cccam>;

pub struct Cccam {
    node_id: [u8; 8],
    version: String,
    extended: bool,
    link: Mutex<Option<Arc<Link>>>,
    /// An EMM waits for its acknowledgement; later ones are dropped.
    emm_busy: AtomicBool,
}

/// Fields of a card announcement.
#[derive(Debug, Clone, PartialEq, Eq)]
struct CardAnnouncement {
    id: u32,
    remote_id: u32,
    caid: u16,
    hop: u8,
    reshare: u8,
    providers: Vec<ProviderInfo>,
}

fn parse_new_card(body: &[u8]) -> Option<CardAnnouncement> {
    let count = usize::from(*body.get(20)?);
    let list = body.get(21..21 + count * 7)?;
    let be32 = |b: &[u8]| u32::from_be_bytes([b[0], b[1], b[2], b[3]]);
    Some(CardAnnouncement {
        id: be32(&body[0..4]),
        remote_id: be32(&body[4..8]),
        caid: u16::from_be_bytes([body[8], body[9]]),
        hop: body[10],
        reshare: body[11],
        providers: list
            .chunks_exact(7)
            .map(|p| ProviderInfo::from_id_bytes([p[0], p[1], p[2]], None))
            .collect(),
    })
}

fn fixed<const N: usize>(text: &str) -> [u8; N] {
    let mut out = [0u8; N];
    let n = text.len().min(N);
    out[..n].copy_from_slice(&text.as_bytes()[..n]);
    out
}

impl Cccam {
    pub fn new(node_id: [u8; 8], version: &str, extended: bool) -> Self {
        Self {
            node_id,
            version: version.to_string(),
            extended,
            link: Mutex::new(None),
            emm_busy: AtomicBool::new(false),
        }
    }

    /// Builds an idle client from its configuration. A missing node id is
    /// generated at random.
    pub fn client(config: &CccamConfig) -> crate::Result<Arc<CccamClient>> {
        let node_id = config
            .node_id()
            .map_err(crate::Error::invalid_input)?
            .unwrap_or_else(rand::random);
        if !CCCAM_VERSIONS.contains(&config.version.as_str()) {
            return Err(crate::Error::invalid_input(format!(
                "unknown CCcam version {}",
                config.version
            )));
        }
        if config.username.len() > MAX_USERNAME {
            return Err(crate::Error::invalid_input("CCcam username longer than 127 bytes"));
        }
        let settings = NetworkSettings {
            name: config.common.name.clone(),
            enabled: config.common.enabled && !config.hostname.is_empty(),
            hostname: config.hostname.clone(),
            port: config.port,
            username: config.username.clone(),
            password: config.password.clone(),
            emm: config.emm,
            emmex: config.emmex,
            keepalive: (config.keepalive_interval_secs > 0)
                .then(|| Duration::from_secs(config.keepalive_interval_secs)),
            ecm_timeout: Duration::from_secs(config.ecm_timeout_secs.max(1)),
        };
        Ok(NetworkClient::new(
            settings,
            Self::new(node_id, &config.version, config.extended),
        ))
    }

    pub fn node_id(&self) -> [u8; 8] {
        self.node_id
    }

    /// Client data message: user, node id, version and build.
    fn client_data(&self, username: &str) -> CccamMessage {
        let mut body = Vec::with_capacity(93);
        body.extend_from_slice(&fixed::<20>(username));
        body.extend_from_slice(&self.node_id);
        body.push(0);
        body.extend_from_slice(&fixed::<32>(&self.version));
        body.extend_from_slice(&fixed::<32>(BUILD));
        CccamMessage::new(CLI_DATA, body)
    }

    fn partner_hello() -> CccamMessage {
        let text = format!("PARTNER: descrambler {} [EXT,SID]\0", env!("CARGO_PKG_VERSION"));
        CccamMessage::new(ECM_NOK1, text.into_bytes())
    }

    fn is_extended(&self) -> bool {
        self.link.lock().as_ref().is_some_and(|l| l.is_extended())
    }
}

#[async_trait]
impl Protocol for Cccam {
    type Request = CccamMessage;
    type Reply = CccamMessage;
    type Encoder = CccamEncoder;
    type Decoder = CccamDecoder;

    fn kind(&self) -> &'static str {
        "cccam"
    }

    async fn handshake(
        &self,
        client: &NetworkClient<Self>,
        stream: &mut TcpStream,
    ) -> ClientResult<(CccamEncoder, CccamDecoder)> {
        let settings = client.settings();
        if settings.username.len() > MAX_USERNAME {
            return Err(ClientError::LoginRejected("username too long".to_string()));
        }

        let mut seed = [0u8; 16];
        tokio::time::timeout(HANDSHAKE_TIMEOUT, stream.read_exact(&mut seed))
            .await
            .map_err(|_| ClientError::Timeout("init seed"))??;
        trace!(client = %settings.name, seed = %hex::encode(seed), "init seed received");
        let oscam = is_oscam_seed(&seed);
        if oscam {
            info!(client = %settings.name, "oscam server detected");
        }

        let keys = LoginKeys::derive(&seed);
        let link = Link::new(self.node_id);
        let mut encoder = CccamEncoder::new(keys.send, link.clone());
        let mut decoder = CccamDecoder::new(keys.recv, link.clone());

        let mut out = BytesMut::new();
        encoder.encode_raw(&keys.answer, &mut out);
        encoder.encode_raw(&fixed::<20>(&settings.username), &mut out);
        encoder.absorb(settings.password.as_bytes());
        encoder.encode_raw(crypto::MAGIC, &mut out);
        stream.write_all(&out).await?;

        let mut ack = [0u8; 20];
        tokio::time::timeout(HANDSHAKE_TIMEOUT, stream.read_exact(&mut ack))
            .await
            .map_err(|_| ClientError::Timeout("password ack"))??;
        decoder.decrypt_raw(&mut ack);
        if !ack.starts_with(&crypto::MAGIC[..5]) {
            return Err(ClientError::LoginRejected("username or password invalid".to_string()));
        }
        info!(client = %settings.name, user = %settings.username, "login succeeded");

        out.clear();
        encoder.encode(self.client_data(&settings.username), &mut out)?;
        if oscam && self.extended {
            encoder.encode(Self::partner_hello(), &mut out)?;
        }
        stream.write_all(&out).await?;

        self.emm_busy.store(false, Ordering::Release);
        *self.link.lock() = Some(link);
        Ok((encoder, decoder))
    }

    fn serialize_ecm(&self) -> bool {
        true
    }

    fn keepalive(&self) -> Option<CccamMessage> {
        Some(CccamMessage::new(KEEPALIVE, bytes::Bytes::new()))
    }

    fn read_timeout(&self, _settings: &NetworkSettings) -> Option<Duration> {
        Some(READ_TIMEOUT)
    }

    fn handle_reply(
        &self,
        client: &NetworkClient<Self>,
        session: &Session<CccamMessage>,
        reply: CccamMessage,
    ) -> ClientResult<()> {
        let name = &client.settings().name;
        if reply.is_partner() {
            let text = String::from_utf8_lossy(&reply.body);
            info!(client = %name, partner = %text.trim_end_matches('\0'), "server capabilities");
            if text.contains("EXT") {
                if let Some(link) = self.link.lock().as_ref() {
                    link.set_extended(true);
                }
                session.set_serialized_ecm(false);
                info!(client = %name, "extended mode enabled");
            }
            return Ok(());
        }

        match reply.cmd {
            ECM | ECM_NOK1 | ECM_NOK2 => {
                let seq = if self.is_extended() {
                    u32::from(reply.seq)
                } else {
                    session.last_ecm_seq()
                };
                session.ecm_answered();
                let answer = if reply.cmd == ECM && reply.body.len() >= 16 {
                    EcmAnswer::Keys {
                        cipher: CipherType::Csa,
                        even: reply.body[..8].to_vec(),
                        odd: reply.body[8..16].to_vec(),
                    }
                } else {
                    EcmAnswer::Nok
                };
                client.ecm_reply(seq, answer);
            }
            NEW_CARD | NEW_CARD_SIDINFO => match parse_new_card(&reply.body) {
                Some(card) => {
                    debug!(
                        client = %name,
                        system = %caid_to_name(card.caid),
                        id = format_args!("{:08x}", card.id),
                        remote_id = format_args!("{:08x}", card.remote_id),
                        hop = card.hop,
                        reshare = card.reshare,
                        "add card message received"
                    );
                    client.set_status(ClientStatus::Connected);
                    client.add_card(card.caid, card.id, None, &card.providers);
                }
                None => warn!(client = %name, len = reply.body.len(), "invalid card announcement"),
            },
            CARD_REMOVED => {
                if let Some(id) = reply.body.get(..4) {
                    client.remove_card(u32::from_be_bytes([id[0], id[1], id[2], id[3]]));
                }
            }
            KEEPALIVE => debug!(client = %name, "keepalive"),
            EMM => {
                self.emm_busy.store(false, Ordering::Release);
                trace!(client = %name, "EMM acknowledged");
            }
            SRV_DATA => {
                let node = reply.body.get(..8).map(hex::encode).unwrap_or_default();
                let version = reply
                    .body
                    .get(8..)
                    .map(|v| String::from_utf8_lossy(v.split(|b| *b == 0).next().unwrap_or_default()).into_owned())
                    .unwrap_or_default();
                info!(client = %name, %version, nodeid = %node, "CCcam server data");
            }
            CLI_DATA => info!(client = %name, "server authentication completed"),
            cmd => warn!(client = %name, cmd = format_args!("0x{cmd:02x}"), "unknown message received"),
        }
        Ok(())
    }

    fn ecm_request(&self, session: &Session<CccamMessage>, request: &EcmRequest<'_>) -> ClientResult<u32> {
        let len = request.data.len();
        if len > usize::from(u8::MAX) {
            return Err(ClientError::Oversize(len));
        }
        let mut body = Vec::with_capacity(13 + len);
        body.extend_from_slice(&request.caid.to_be_bytes());
        body.extend_from_slice(&request.provider.to_be_bytes());
        body.extend_from_slice(&request.card_id.to_be_bytes());
        body.extend_from_slice(&request.sid.to_be_bytes());
        body.push(len as u8);
        body.extend_from_slice(request.data);

        let seq = session.next_seq() as u8;
        let mut msg = CccamMessage::new(ECM, body);
        msg.seq = seq;
        session.send_ecm(msg, u32::from(seq))?;
        Ok(u32::from(seq))
    }

    fn emm_request(&self, session: &Session<CccamMessage>, target: &EmmTarget, data: &[u8]) -> ClientResult<()> {
        if data.len() > usize::from(u8::MAX) {
            return Err(ClientError::Oversize(data.len()));
        }
        if self.emm_busy.swap(true, Ordering::AcqRel) {
            trace!(caid = format_args!("{:04X}", target.caid), "EMM dropped, previous one unacknowledged");
            return Ok(());
        }
        let mut body = Vec::with_capacity(12 + data.len());
        body.extend_from_slice(&target.caid.to_be_bytes());
        body.push(0);
        body.extend_from_slice(&target.provider.to_be_bytes());
        body.extend_from_slice(&target.card_id.to_be_bytes());
        body.push(data.len() as u8);
        body.extend_from_slice(data);

        let mut msg = CccamMessage::new(EMM, body);
        msg.seq = session.next_seq() as u8;
        if let Err(e) = session.send(msg) {
            self.emm_busy.store(false, Ordering::Release);
            return Err(e);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_new_card() {
        let mut body = vec![0, 0, 0, 0x2a, 0, 0, 0, 0x01, 0x09, 0x63, 1, 2];
        body.extend_from_slice(&[0u8; 8]);
        body.push(2);
        body.extend_from_slice(&[0x00, 0x00, 0x00, 1, 2, 3, 4]);
        body.extend_from_slice(&[0x00, 0x12, 0x34, 0, 0, 0, 0]);

        let card = parse_new_card(&body).unwrap();
        assert_eq!(card.id, 0x2a);
        assert_eq!(card.remote_id, 1);
        assert_eq!(card.caid, 0x0963);
        assert_eq!((card.hop, card.reshare), (1, 2));
        assert_eq!(card.providers.len(), 2);
        assert_eq!(card.providers[1].id, 0x1234);
        assert_eq!(card.providers[1].sa, None);

        assert!(parse_new_card(&body[..body.len() - 1]).is_none());
        assert!(parse_new_card(&body[..20]).is_none());
    }

    #[test]
    fn test_client_data_layout() {
        let cccam = Cccam::new([1, 2, 3, 4, 5, 6, 7, 8], "2.3.0", true);
        let msg = cccam.client_data("viewer");
        assert_eq!(msg.cmd, CLI_DATA);
        assert_eq!(msg.body.len(), 93);
        assert_eq!(&msg.body[..6], b"viewer");
        assert_eq!(msg.body[6], 0);
        assert_eq!(&msg.body[20..28], &[1, 2, 3, 4, 5, 6, 7, 8]);
        assert_eq!(msg.body[28], 0);
        assert_eq!(&msg.body[29..34], b"2.3.0");
        assert_eq!(&msg.body[61..64], b"tvh");
    }

    #[test]
    fn test_partner_hello_is_recognised() {
        let hello = Cccam::partner_hello();
        assert!(hello.is_partner());
        assert!(String::from_utf8_lossy(&hello.body).contains("[EXT,SID]"));
    }

    #[test]
    fn test_emm_busy_until_acknowledged() {
        let cccam = Cccam::new([0; 8], "2.3.0", false);
        let (session, _writer) = Session::new("test", true, Duration::from_secs(5));
        let target = EmmTarget {
            caid: 0x0500,
            provider: 0x032400,
            card_id: 9,
        };
        cccam.emm_request(&session, &target, &[0x88, 0x70, 0x01, 0x00]).unwrap();
        assert!(cccam.emm_busy.load(Ordering::Acquire));
        // dropped while the first one is unanswered
        cccam.emm_request(&session, &target, &[0x88, 0x70, 0x01, 0x01]).unwrap();
        assert_eq!(session.next_seq(), 1);

        cccam.emm_busy.store(false, Ordering::Release);
        cccam.emm_request(&session, &target, &[0x88, 0x70, 0x01, 0x02]).unwrap();
        assert_eq!(session.next_seq(), 3);
    }

    #[test]
    fn test_client_from_config_validates() {
        let config = CccamConfig {
            hostname: "cardserver".to_string(),
            port: 12000,
            nodeid: "0102030405060708".to_string(),
            ..CccamConfig::default()
        };
        let client = Cccam::client(&config).unwrap();
        assert_eq!(client.protocol().node_id(), [1, 2, 3, 4, 5, 6, 7, 8]);
        assert_eq!(client.settings().keepalive, None);

        let bad_version = CccamConfig {
            version: "9.9.9".to_string(),
            ..config.clone()
        };
        assert!(Cccam::client(&bad_version).is_err());
        let long_user = CccamConfig {
            username: "u".repeat(128),
            ..config
        };
        assert!(Cccam::client(&long_user).is_err());
    }
}
