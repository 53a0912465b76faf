use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::BytesMut;
use parking_lot::Mutex;
use tokio::io::AsyncWriteExt;
use tokio::net::tcp::OwnedWriteHalf;
use tokio::sync::{mpsc, Semaphore};
use tokio::time::Instant;
use tokio_util::codec::Encoder;
use tracing::{debug, trace};

use super::error::{ClientError, ClientResult};

struct Outbound<M> {
    msg: M,
    /// Set for ECM requests.
    ecm_seq: Option<u32>,
}

/// Sending side of a connected session.
///
/// Requests are queued in order and a single writer task encodes and writes
/// them, so messages from different services and keepalives never
/// interleave and a stream cipher advances in socket order.
pub struct Session<M> {
    client: String,
    tx: mpsc::UnboundedSender<Outbound<M>>,
    seq: AtomicU32,
    last_sent: Mutex<Instant>,
    gate: Arc<EcmGate>,
}

/// One ECM in flight at a time while `serialized` is set.
struct EcmGate {
    serialized: AtomicBool,
    permits: Semaphore,
    last_seq: AtomicU32,
}

/// Receiving end of a session's queue, consumed by [`SessionWriter::run`].
pub struct SessionWriter<M> {
    client: String,
    rx: mpsc::UnboundedReceiver<Outbound<M>>,
    gate: Arc<EcmGate>,
    ecm_timeout: Duration,
}

impl<M> Session<M> {
    pub fn new(client: &str, serialize_ecm: bool, ecm_timeout: Duration) -> (Self, SessionWriter<M>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let gate = Arc::new(EcmGate {
            serialized: AtomicBool::new(serialize_ecm),
            permits: Semaphore::new(1),
            last_seq: AtomicU32::new(0),
        });
        let session = Self {
            client: client.to_string(),
            tx,
            seq: AtomicU32::new(0),
            last_sent: Mutex::new(Instant::now()),
            gate: gate.clone(),
        };
        let writer = SessionWriter {
            client: client.to_string(),
            rx,
            gate,
            ecm_timeout,
        };
        (session, writer)
    }

    /// Next message sequence number of this session.
    pub fn next_seq(&self) -> u32 {
        self.seq.fetch_add(1, Ordering::Relaxed)
    }

    /// Sequence number of the ECM request most recently handed to the socket.
    pub fn last_ecm_seq(&self) -> u32 {
        self.gate.last_seq.load(Ordering::Acquire)
    }

    /// Lets the next queued ECM go out.
    pub fn ecm_answered(&self) {
        if self.gate.permits.available_permits() == 0 {
            self.gate.permits.add_permits(1);
        }
    }

    /// Switches between one ECM in flight and free pipelining.
    pub fn set_serialized_ecm(&self, serialized: bool) {
        self.gate.serialized.store(serialized, Ordering::Release);
        if !serialized {
            self.ecm_answered();
        }
    }

    pub fn is_serialized_ecm(&self) -> bool {
        self.gate.serialized.load(Ordering::Acquire)
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }

    /// Time since the last message was queued.
    pub fn idle_for(&self) -> Duration {
        self.last_sent.lock().elapsed()
    }

    pub fn send(&self, msg: M) -> ClientResult<()> {
        self.enqueue(msg, None)
    }

    pub fn send_ecm(&self, msg: M, seq: u32) -> ClientResult<()> {
        self.enqueue(msg, Some(seq))
    }

    fn enqueue(&self, msg: M, ecm_seq: Option<u32>) -> ClientResult<()> {
        self.tx
            .send(Outbound { msg, ecm_seq })
            .map_err(|_| ClientError::Closed)?;
        *self.last_sent.lock() = Instant::now();
        Ok(())
    }
}

impl<M> SessionWriter<M> {
    /// Encodes and writes queued messages until the session is dropped or
    /// the socket fails. A serialized ECM waits for the previous answer, at
    /// most for the ECM timeout.
    pub async fn run<E>(mut self, mut encoder: E, mut socket: OwnedWriteHalf) -> ClientResult<()>
    where
        E: Encoder<M, Error = ClientError>,
    {
        let mut buf = BytesMut::new();
        while let Some(out) = self.rx.recv().await {
            if let Some(seq) = out.ecm_seq {
                if self.gate.serialized.load(Ordering::Acquire) {
                    match tokio::time::timeout(self.ecm_timeout, self.gate.permits.acquire()).await {
                        Ok(Ok(permit)) => permit.forget(),
                        Ok(Err(_)) => return Err(ClientError::Closed),
                        Err(_) => debug!(client = %self.client, "previous ECM unanswered, sending next"),
                    }
                }
                self.gate.last_seq.store(seq, Ordering::Release);
            }
            buf.clear();
            encoder.encode(out.msg, &mut buf)?;
            trace!(client = %self.client, len = buf.len(), data = %hex::encode(&buf), "sending message");
            socket.write_all(&buf).await?;
        }
        Ok(())
    }
}
