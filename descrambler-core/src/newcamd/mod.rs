//! Newcamd card-server client.
//!
//! Messages are 3DES encrypted with a key derived from the configured DES
//! key. The login uses a key mixed with 14 random bytes from the server;
//! afterwards the key is mixed with the crypted password.

mod codec;
mod crypto;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use tokio::io::AsyncReadExt;
use tokio::net::TcpStream;
use tokio_util::codec::Framed;
use tracing::{debug, trace, warn};

use crate::cipher::CipherType;
use crate::client::{
    ClientError, ClientResult, ClientStatus, EcmAnswer, EcmRequest, EmmTarget, NetworkClient, NetworkSettings,
    Protocol, ProviderInfo, Session,
};
use crate::config::{parse_des_key, NewcamdConfig};

pub use codec::{NewcamdCodec, NewcamdMessage};
pub use crypto::{md5_crypt, spread_key, MessageCipher};

const LOGIN: u8 = 0xe0;
const LOGIN_ACK: u8 = 0xe1;
const CARD_DATA_REQ: u8 = 0xe3;
const CARD_DATA: u8 = 0xe4;
const ADD_CARD: u8 = 0xd3;
const KEEPALIVE: u8 = 0xfd;

/// Service id field of the login message.
const CLIENT_ID: u16 = 0x6502;
const PASSWORD_SALT: &str = "$1$abcdefgh$";
const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(5);

pub type NewcamdClient = NetworkClient<Newcamd>;

pub struct Newcamd {
    deskey: [u8; 14],
    crypted_password: String,
}

impl Newcamd {
    pub fn new(deskey: [u8; 14], password: &str) -> Self {
        Self {
            deskey,
            crypted_password: md5_crypt(password, PASSWORD_SALT),
        }
    }

    /// Builds an idle client from its configuration.
    pub fn client(config: &NewcamdConfig) -> crate::Result<Arc<NewcamdClient>> {
        let deskey = parse_des_key(&config.deskey).map_err(crate::Error::invalid_input)?;
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
        Ok(NetworkClient::new(settings, Self::new(deskey, &config.password)))
    }

    fn login_message(&self, username: &str) -> ClientResult<NewcamdMessage> {
        let mut body = Vec::with_capacity(username.len() + self.crypted_password.len() + 2);
        body.extend_from_slice(username.as_bytes());
        body.push(0);
        body.extend_from_slice(self.crypted_password.as_bytes());
        body.push(0);
        if body.len() > 255 {
            return Err(ClientError::LoginRejected("username and password too long".to_string()));
        }
        let mut msg = NewcamdMessage::command(LOGIN, &body);
        msg.sid = CLIENT_ID;
        Ok(msg)
    }
}

async fn read_reply(framed: &mut Framed<&mut TcpStream, NewcamdCodec>, what: &'static str) -> ClientResult<NewcamdMessage> {
    match tokio::time::timeout(HANDSHAKE_TIMEOUT, framed.next()).await {
        Ok(Some(msg)) => msg,
        Ok(None) => Err(ClientError::Closed),
        Err(_) => Err(ClientError::Timeout(what)),
    }
}

/// Card announcement: CAID, unique address and the provider list with
/// shared addresses.
fn parse_card_data(body: &[u8]) -> ClientResult<(u16, [u8; 8], Vec<ProviderInfo>)> {
    if body.len() < 12 {
        return Err(ClientError::HandshakeFailed("invalid card data reply".to_string()));
    }
    let caid = u16::from_be_bytes([body[1], body[2]]);
    let mut ua = [0u8; 8];
    ua.copy_from_slice(&body[3..11]);
    let count = usize::from(body[11]);
    let list = &body[12..];
    if list.len() < count * 11 {
        return Err(ClientError::HandshakeFailed("invalid card data reply (provider list)".to_string()));
    }
    let providers = list
        .chunks_exact(11)
        .take(count)
        .map(|p| {
            let mut sa = [0u8; 8];
            sa.copy_from_slice(&p[3..11]);
            ProviderInfo::from_id_bytes([p[0], p[1], p[2]], Some(sa))
        })
        .collect();
    Ok((caid, ua, providers))
}

fn ecm_answer(body: &[u8]) -> EcmAnswer {
    match body.len() {
        0..16 => EcmAnswer::Nok,
        16..32 => EcmAnswer::Keys {
            cipher: CipherType::Csa,
            even: body[..8].to_vec(),
            odd: body[8..16].to_vec(),
        },
        _ => EcmAnswer::Keys {
            cipher: CipherType::Aes128Ecb,
            even: body[..16].to_vec(),
            odd: body[16..32].to_vec(),
        },
    }
}

#[async_trait]
impl Protocol for Newcamd {
    type Request = NewcamdMessage;
    type Reply = NewcamdMessage;
    type Encoder = NewcamdCodec;
    type Decoder = NewcamdCodec;

    fn kind(&self) -> &'static str {
        "newcamd"
    }

    async fn handshake(
        &self,
        client: &NetworkClient<Self>,
        stream: &mut TcpStream,
    ) -> ClientResult<(NewcamdCodec, NewcamdCodec)> {
        let settings = client.settings();
        let mut random = [0u8; 14];
        tokio::time::timeout(HANDSHAKE_TIMEOUT, stream.read_exact(&mut random))
            .await
            .map_err(|_| ClientError::Timeout("login key"))??;

        let login = NewcamdCodec::new(MessageCipher::login(&self.deskey, &random)?);
        let mut framed = Framed::new(stream, login);
        framed.send(self.login_message(&settings.username)?).await?;
        let reply = read_reply(&mut framed, "login response").await?;
        if reply.cmd() != LOGIN_ACK {
            return Err(ClientError::LoginRejected(format!("{}: login failed", settings.name)));
        }

        let session = NewcamdCodec::new(MessageCipher::session(&self.deskey, &self.crypted_password)?);
        *framed.codec_mut() = session.clone();
        let mut request = NewcamdMessage::command(CARD_DATA_REQ, &[]);
        request.provider = 1;
        framed.send(request).await?;
        let reply = read_reply(&mut framed, "card data").await?;
        if reply.cmd() != CARD_DATA {
            return Err(ClientError::HandshakeFailed("card data request failed".to_string()));
        }
        let (caid, ua, providers) = parse_card_data(reply.body())?;
        client.set_status(ClientStatus::Connected);
        client.add_card(caid, 0, Some(ua), &providers);

        Ok((session.clone(), session))
    }

    fn keepalive(&self) -> Option<NewcamdMessage> {
        Some(NewcamdMessage::command(KEEPALIVE, &[]))
    }

    fn read_timeout(&self, settings: &NetworkSettings) -> Option<Duration> {
        settings.keepalive.map(|interval| interval * 2)
    }

    fn handle_reply(
        &self,
        client: &NetworkClient<Self>,
        _session: &Session<NewcamdMessage>,
        reply: NewcamdMessage,
    ) -> ClientResult<()> {
        match reply.cmd() {
            0x80 | 0x81 => client.ecm_reply(u32::from(reply.seq), ecm_answer(reply.body())),
            ADD_CARD if reply.caid != 0 => {
                client.set_status(ClientStatus::Connected);
                let provider = ProviderInfo {
                    id: reply.provider & 0x00ff_ffff,
                    sa: None,
                };
                client.add_card(reply.caid, 0, None, &[provider]);
            }
            KEEPALIVE => trace!(client = %client.settings().name, "keepalive answered"),
            cmd => debug!(client = %client.settings().name, cmd = format_args!("0x{cmd:02x}"), "ignoring message"),
        }
        Ok(())
    }

    fn ecm_request(&self, session: &Session<NewcamdMessage>, request: &EcmRequest<'_>) -> ClientResult<u32> {
        let seq = session.next_seq() as u16;
        let msg = NewcamdMessage {
            seq,
            sid: request.sid,
            caid: request.caid,
            provider: request.provider,
            data: request.data.to_vec().into(),
        };
        session.send_ecm(msg, u32::from(seq))?;
        Ok(u32::from(seq))
    }

    fn emm_request(&self, session: &Session<NewcamdMessage>, target: &EmmTarget, data: &[u8]) -> ClientResult<()> {
        if data.len() < 3 {
            warn!(caid = format_args!("{:04X}", target.caid), "dropping short EMM");
            return Ok(());
        }
        let msg = NewcamdMessage {
            seq: session.next_seq() as u16,
            sid: 0,
            caid: 0,
            provider: 0,
            data: data.to_vec().into(),
        };
        session.send(msg)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_card_data_parsing() {
        let mut body = vec![0x00, 0x05, 0x00];
        body.extend_from_slice(&[0, 0, 0, 0, 0x11, 0x22, 0x33, 0x44]);
        body.push(2);
        body.extend_from_slice(&[0x00, 0x00, 0x21, 0, 0, 0, 0, 0x55, 0x66, 0x77, 0x00]);
        body.extend_from_slice(&[0x03, 0x24, 0x10, 0, 0, 0, 0, 0, 0, 0, 0]);

        let (caid, ua, providers) = parse_card_data(&body).unwrap();
        assert_eq!(caid, 0x0500);
        assert_eq!(ua, [0, 0, 0, 0, 0x11, 0x22, 0x33, 0x44]);
        assert_eq!(providers.len(), 2);
        assert_eq!(providers[0].id, 0x21);
        assert_eq!(providers[0].sa, Some([0, 0, 0, 0, 0x55, 0x66, 0x77, 0x00]));
        assert_eq!(providers[1].id, 0x032410);

        body.truncate(body.len() - 1);
        assert!(parse_card_data(&body).is_err());
    }

    #[test]
    fn test_ecm_answer_key_sizes() {
        assert_eq!(ecm_answer(&[]), EcmAnswer::Nok);
        let csa: Vec<u8> = (0..16).collect();
        assert_eq!(
            ecm_answer(&csa),
            EcmAnswer::Keys {
                cipher: CipherType::Csa,
                even: (0..8).collect(),
                odd: (8..16).collect(),
            }
        );
        let aes: Vec<u8> = (0..32).collect();
        match ecm_answer(&aes) {
            EcmAnswer::Keys { cipher, even, odd } => {
                assert_eq!(cipher, CipherType::Aes128Ecb);
                assert_eq!(even.len(), 16);
                assert_eq!(odd[0], 16);
            }
            EcmAnswer::Nok => panic!("expected keys"),
        }
    }

    #[test]
    fn test_login_message_layout() {
        let newcamd = Newcamd::new([0; 14], "secret");
        let msg = newcamd.login_message("user").unwrap();
        assert_eq!(msg.cmd(), LOGIN);
        assert_eq!(msg.sid, CLIENT_ID);
        assert_eq!(msg.body(), b"user\0$1$abcdefgh$cHJi5PXp/ki/ktXzqlk6I1\0");

        let long = "u".repeat(250);
        assert!(newcamd.login_message(&long).is_err());
    }

    #[test]
    fn test_client_from_config() {
        let config = NewcamdConfig {
            hostname: "cardserver".to_string(),
            port: 15000,
            keepalive_interval_secs: 0,
            ..NewcamdConfig::default()
        };
        let client = Newcamd::client(&config).unwrap();
        assert_eq!(client.settings().keepalive, None);
        assert_eq!(client.protocol().read_timeout(client.settings()), None);

        let bad = NewcamdConfig {
            deskey: String::new(),
            ..NewcamdConfig::default()
        };
        assert!(Newcamd::client(&bad).is_err());
    }
}
