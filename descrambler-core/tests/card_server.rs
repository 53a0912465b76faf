//! End-to-end tests against in-process newcamd card servers.
//!
//! Run with: cargo test --test card_server

use std::sync::Arc;
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use tokio::io::AsyncWriteExt;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_util::codec::Framed;

use descrambler_core::caid::CaDescriptor;
use descrambler_core::cipher::{CipherContext, CipherType};
use descrambler_core::client::ClientStatus;
use descrambler_core::config::{
    parse_des_key, ClientCommon, ClientConfig, ConstcwConfig, DescramblerConfig, NewcamdConfig,
};
use descrambler_core::descrambler::{KeyState, Outcome};
use descrambler_core::newcamd::{md5_crypt, MessageCipher, NewcamdCodec, NewcamdMessage};
use descrambler_core::ts::{Parity, TS_PACKET_SIZE, TS_SYNC_BYTE};
use descrambler_core::{ClientManager, Config, Service, ServiceInfo};

const USERNAME: &str = "viewer";
const PASSWORD: &str = "secret";
const RANDOM: [u8; 14] = [7, 1, 9, 3, 5, 2, 8, 4, 6, 0, 11, 13, 12, 10];
const EVEN: [u8; 8] = [1, 2, 3, 6, 5, 6, 7, 18];
const ODD: [u8; 8] = [8, 9, 10, 27, 12, 13, 14, 39];
const SLOW_EVEN: [u8; 8] = [0x21, 0x22, 0x23, 0x66, 0x25, 0x26, 0x27, 0x72];
const SLOW_ODD: [u8; 8] = [0x31, 0x32, 0x33, 0x96, 0x35, 0x36, 0x37, 0xa2];
const ECM_PID: u16 = 0x100;
const ECM: [u8; 7] = [0x80, 0x70, 0x04, 0xaa, 0xbb, 0xcc, 0xdd];

/// Accepts connections until the test ends, answering every ECM with the
/// `keys` pair. Each answered ECM is reported on the returned channel.
async fn spawn_server(
    accept_login: bool,
    reply_delay: Duration,
    keys: ([u8; 8], [u8; 8]),
) -> (u16, mpsc::UnboundedReceiver<NewcamdMessage>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    let (tx, rx) = mpsc::unbounded_channel();
    tokio::spawn(async move {
        while let Ok((sock, _)) = listener.accept().await {
            let tx = tx.clone();
            tokio::spawn(async move {
                let _ = serve_client(sock, accept_login, reply_delay, keys, tx).await;
            });
        }
    });
    (port, rx)
}

async fn serve_client(
    mut sock: TcpStream,
    accept_login: bool,
    reply_delay: Duration,
    (even, odd): ([u8; 8], [u8; 8]),
    ecms: mpsc::UnboundedSender<NewcamdMessage>,
) -> anyhow::Result<()> {
    let deskey = parse_des_key(&NewcamdConfig::default().deskey).map_err(anyhow::Error::msg)?;
    sock.write_all(&RANDOM).await?;

    let mut framed = Framed::new(sock, NewcamdCodec::new(MessageCipher::login(&deskey, &RANDOM)?));
    let Some(login) = framed.next().await.transpose()? else {
        return Ok(());
    };
    anyhow::ensure!(login.cmd() == 0xe0, "expected login, got 0x{:02x}", login.cmd());
    anyhow::ensure!(login.body().starts_with(USERNAME.as_bytes()), "unexpected username");
    if !accept_login {
        framed.send(NewcamdMessage::command(0xe2, &[])).await?;
        return Ok(());
    }
    framed.send(NewcamdMessage::command(0xe1, &[])).await?;

    let crypted = md5_crypt(PASSWORD, "$1$abcdefgh$");
    *framed.codec_mut() = NewcamdCodec::new(MessageCipher::session(&deskey, &crypted)?);
    let Some(request) = framed.next().await.transpose()? else {
        return Ok(());
    };
    anyhow::ensure!(request.cmd() == 0xe3, "expected card data request");
    // Conax card, no providers
    let mut card = vec![0x00, 0x0b, 0x00];
    card.extend_from_slice(&[0, 0, 0, 0, 0x12, 0x34, 0x56, 0x78]);
    card.push(0);
    framed.send(NewcamdMessage::command(0xe4, &card)).await?;

    while let Some(msg) = framed.next().await {
        let msg = msg?;
        if matches!(msg.cmd(), 0x80 | 0x81) {
            tokio::time::sleep(reply_delay).await;
            let mut keys = even.to_vec();
            keys.extend_from_slice(&odd);
            let mut reply = NewcamdMessage::command(msg.cmd(), &keys);
            reply.seq = msg.seq;
            reply.sid = msg.sid;
            reply.caid = msg.caid;
            framed.send(reply).await?;
            let _ = ecms.send(msg);
        }
    }
    Ok(())
}

fn newcamd_client(name: &str, port: u16) -> ClientConfig {
    ClientConfig::Newcamd(NewcamdConfig {
        common: ClientCommon {
            name: name.to_string(),
            ..ClientCommon::default()
        },
        hostname: "127.0.0.1".to_string(),
        port,
        username: USERNAME.to_string(),
        password: PASSWORD.to_string(),
        ..NewcamdConfig::default()
    })
}

fn conax_service() -> Arc<Service> {
    let service = Service::new(
        ServiceInfo {
            sid: 0x0101,
            tsid: 1,
            mux_id: 3,
            name: "News HD".to_string(),
            ..ServiceInfo::default()
        },
        &DescramblerConfig::default(),
    );
    service.set_ca_descriptors(vec![CaDescriptor {
        caid: 0x0b00,
        provider_id: 0,
        pid: ECM_PID,
    }]);
    service
}

fn state_of(service: &Service, prefix: &str) -> Option<KeyState> {
    service
        .handle_states()
        .into_iter()
        .find(|(name, _)| name.starts_with(prefix))
        .map(|(_, state)| state)
}

/// A clear packet on `pid` and the same packet scrambled with `key` as the
/// even control word.
fn packet_pair(pid: u16, key: &[u8; 8]) -> (Vec<u8>, Vec<u8>) {
    let mut clear = vec![0u8; TS_PACKET_SIZE];
    clear[0] = TS_SYNC_BYTE;
    clear[1] = (pid >> 8) as u8 & 0x1f;
    clear[2] = pid as u8;
    clear[3] = 0x10;
    for (i, b) in clear[4..].iter_mut().enumerate() {
        *b = (i as u8).wrapping_mul(13).wrapping_add(5);
    }
    let mut ctx = CipherContext::new(CipherType::Csa);
    ctx.set_key(Parity::Even, key).unwrap();
    let mut scrambled = clear.clone();
    assert!(ctx.encrypt_packet(&mut scrambled, Parity::Even));
    (clear, scrambled)
}

/// Polls `done` until it holds, feeding the ECM section on every round.
async fn feed_until(service: &Service, mut done: impl FnMut() -> bool) {
    tokio::time::timeout(Duration::from_secs(5), async {
        while !done() {
            service.ecm_input(ECM_PID, &ECM);
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    })
    .await
    .expect("condition not reached in time");
}

#[tokio::test]
async fn test_newcamd_ecm_round_trip() {
    let (port, mut ecms) = spawn_server(true, Duration::ZERO, (EVEN, ODD)).await;
    let manager = ClientManager::from_config(&Config {
        clients: vec![newcamd_client("cardserver", port)],
        ..Config::default()
    })
    .unwrap();
    manager.start();

    let service = conax_service();
    service.start_descrambling(&manager);
    let handle = format!("newcamd-127.0.0.1-{port}-0B00");
    feed_until(&service, || state_of(&service, &handle) == Some(KeyState::Resolved)).await;

    assert_eq!(manager.status("cardserver"), Some(ClientStatus::Connected));
    assert!(!service.no_access());
    let ecm = ecms.recv().await.unwrap();
    assert_eq!(ecm.sid, 0x0101);
    assert_eq!(ecm.caid, 0x0b00);
    assert_eq!(&ecm.data[..], &ECM[..]);

    manager.stop().await;
    assert!(service.handle_states().is_empty());
    assert_eq!(manager.status("cardserver"), Some(ClientStatus::None));
}

#[tokio::test]
async fn test_newcamd_rejected_login() {
    let (port, _ecms) = spawn_server(false, Duration::ZERO, (EVEN, ODD)).await;
    let manager = ClientManager::from_config(&Config {
        clients: vec![newcamd_client("cardserver", port)],
        ..Config::default()
    })
    .unwrap();
    manager.start();

    let service = conax_service();
    service.start_descrambling(&manager);
    tokio::time::timeout(Duration::from_secs(5), async {
        while manager.status("cardserver") != Some(ClientStatus::Disconnected) {
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    })
    .await
    .expect("client never gave up on the login");

    assert!(service.handle_states().is_empty());
    manager.stop().await;
}

#[tokio::test]
async fn test_second_backend_goes_idle() {
    let (port, mut ecms) = spawn_server(true, Duration::ZERO, (EVEN, ODD)).await;
    let fixed = ClientConfig::Constcw(ConstcwConfig {
        common: ClientCommon {
            name: "fixed".to_string(),
            ..ClientCommon::default()
        },
        caid: 0x0b00,
        tsid: 1,
        sid: 0x0101,
        key_even: hex::encode(EVEN),
        key_odd: hex::encode(ODD),
        ..ConstcwConfig::default()
    });
    let manager = ClientManager::from_config(&Config {
        clients: vec![fixed, newcamd_client("cardserver", port)],
        ..Config::default()
    })
    .unwrap();
    manager.start();

    let service = conax_service();
    service.start_descrambling(&manager);
    assert_eq!(state_of(&service, "constcw-fixed"), Some(KeyState::Resolved));

    let handle = format!("newcamd-127.0.0.1-{port}-0B00");
    feed_until(&service, || state_of(&service, &handle) == Some(KeyState::Idle)).await;

    // the card server was asked, but its keys did not replace the fixed ones
    assert!(ecms.recv().await.is_some());
    assert_eq!(state_of(&service, "constcw-fixed"), Some(KeyState::Resolved));

    manager.stop().await;
}

#[tokio::test]
async fn test_slower_card_server_is_demoted() {
    let (fast_port, _fast_ecms) = spawn_server(true, Duration::ZERO, (EVEN, ODD)).await;
    let (slow_port, mut slow_ecms) = spawn_server(true, Duration::from_millis(500), (SLOW_EVEN, SLOW_ODD)).await;
    let manager = ClientManager::from_config(&Config {
        clients: vec![newcamd_client("fast", fast_port), newcamd_client("slow", slow_port)],
        ..Config::default()
    })
    .unwrap();
    manager.start();

    let service = conax_service();
    service.start_descrambling(&manager);
    let fast = format!("newcamd-127.0.0.1-{fast_port}-0B00");
    let slow = format!("newcamd-127.0.0.1-{slow_port}-0B00");
    feed_until(&service, || {
        state_of(&service, &fast) == Some(KeyState::Resolved) && state_of(&service, &slow) == Some(KeyState::Idle)
    })
    .await;

    assert!(slow_ecms.recv().await.is_some());
    assert_eq!(
        service.handle_states().iter().filter(|(_, s)| *s == KeyState::Resolved).count(),
        1
    );

    // the installed keys are the fast server's, not the late ones
    let (clear, scrambled) = packet_pair(0x200, &EVEN);
    let mut out = Vec::new();
    assert_eq!(service.descramble(0x200, &scrambled, |p| out.push(p.to_vec())), Outcome::Consumed);
    assert_eq!(out, vec![clear]);

    let (clear, scrambled) = packet_pair(0x200, &SLOW_EVEN);
    out.clear();
    service.descramble(0x200, &scrambled, |p| out.push(p.to_vec()));
    assert_eq!(out.len(), 1);
    assert_ne!(out[0], clear);

    manager.stop().await;
}
