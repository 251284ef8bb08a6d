//! Per-edge overlay transport.
//!
//! Every overlay edge (parent-child, broker-client, broker-module) is a pair
//! of message channels. Two transports produce them:
//!
//! - **In-process**: endpoints registered in a global registry; connecting
//!   cross-wires two channel pairs with zero copies. Used by tests and by
//!   co-located sessions.
//! - **TCP**: a per-connection pump task moves frames between the stream and
//!   the channel pair using the wire codec. Writes retry with exponential
//!   backoff before the peer is given up as lost.
//!
//! Channel closure is the only failure a peer ever observes; it is fatal
//! per-peer, never per-broker.

use std::io;
use std::time::Duration;

use bytes::{Bytes, BytesMut};
use dashmap::DashMap;
use flume::{Receiver, Sender};
use once_cell::sync::Lazy;
use rand::Rng;
use tracing::{debug, trace, warn};

use arbor_core::codec::{encode_stream, MessageAssembler};
use arbor_core::message::{Credential, Message};

use crate::overlay::PeerRole;

/// An accepted connection, handed to the broker by its connector.
#[derive(Debug)]
pub struct LinkConnect {
    /// The connecting endpoint's identifier (broker uuid, client uuid, ...).
    pub uuid: Bytes,
    pub role: PeerRole,
    /// Overlay rank, for child brokers.
    pub rank: Option<u32>,
    pub cred: Credential,
    /// Broker-to-peer direction.
    pub tx: Sender<Message>,
    /// Peer-to-broker direction.
    pub rx: Receiver<Message>,
}

static ENDPOINTS: Lazy<DashMap<String, Sender<LinkConnect>>> = Lazy::new(DashMap::new);

/// Generate a fresh peer identifier: 16 hex characters.
#[must_use]
pub fn new_uuid() -> Bytes {
    let mut rng = rand::thread_rng();
    let mut s = String::with_capacity(16);
    for _ in 0..16 {
        let nibble: u8 = rng.gen_range(0..16);
        s.push(char::from_digit(u32::from(nibble), 16).expect("nibble in range"));
    }
    Bytes::from(s)
}

/// Bind an in-process endpoint, returning the accept stream.
///
/// # Errors
///
/// Fails with `AddrInUse` if the endpoint name is already bound.
pub fn bind(endpoint: &str) -> io::Result<Receiver<LinkConnect>> {
    match ENDPOINTS.entry(endpoint.to_owned()) {
        dashmap::mapref::entry::Entry::Occupied(_) => Err(io::Error::new(
            io::ErrorKind::AddrInUse,
            format!("endpoint '{endpoint}' is already bound"),
        )),
        dashmap::mapref::entry::Entry::Vacant(entry) => {
            let (tx, rx) = flume::unbounded();
            entry.insert(tx);
            debug!(endpoint, "link: bound");
            Ok(rx)
        }
    }
}

/// Unbind an in-process endpoint. Connects fail afterwards.
pub fn unbind(endpoint: &str) {
    ENDPOINTS.remove(endpoint);
    debug!(endpoint, "link: unbound");
}

/// Connect to an in-process endpoint.
///
/// Returns the peer-side channel pair: a sender toward the broker and a
/// receiver of broker traffic.
///
/// # Errors
///
/// Fails with `NotFound` if nothing is bound at `endpoint`, or
/// `ConnectionRefused` if the binder stopped accepting.
pub fn connect(
    endpoint: &str,
    uuid: Bytes,
    role: PeerRole,
    rank: Option<u32>,
    cred: Credential,
) -> io::Result<(Sender<Message>, Receiver<Message>)> {
    let accept_tx = ENDPOINTS
        .get(endpoint)
        .map(|entry| entry.clone())
        .ok_or_else(|| {
            io::Error::new(
                io::ErrorKind::NotFound,
                format!("endpoint '{endpoint}' is not bound"),
            )
        })?;

    let (to_broker_tx, to_broker_rx) = flume::unbounded();
    let (to_peer_tx, to_peer_rx) = flume::unbounded();
    accept_tx
        .send(LinkConnect {
            uuid,
            role,
            rank,
            cred,
            tx: to_peer_tx,
            rx: to_broker_rx,
        })
        .map_err(|_| {
            io::Error::new(
                io::ErrorKind::ConnectionRefused,
                format!("endpoint '{endpoint}' stopped accepting"),
            )
        })?;
    Ok((to_broker_tx, to_peer_rx))
}

/// Exponential write backoff, reset on success.
#[derive(Debug, Clone)]
pub(crate) struct Backoff {
    base: Duration,
    max: Duration,
    attempt: u32,
    limit: u32,
}

impl Backoff {
    pub(crate) const fn new(base: Duration, max: Duration, limit: u32) -> Self {
        Self { base, max, attempt: 0, limit }
    }

    /// The delay before the next retry, or `None` when attempts are spent.
    pub(crate) fn next_delay(&mut self) -> Option<Duration> {
        if self.attempt >= self.limit {
            return None;
        }
        let delay = self.base * (1_u32 << self.attempt.min(10));
        self.attempt += 1;
        Some(delay.min(self.max))
    }

    pub(crate) fn reset(&mut self) {
        self.attempt = 0;
    }
}

/// Per-message write retry budget on TCP links.
const WRITE_RETRY_LIMIT: u32 = 5;
/// Read slice used by the pump; the loop alternates reads and write drains.
const PUMP_READ_TIMEOUT: Duration = Duration::from_millis(25);

/// Pump a TCP stream: decode inbound frames into `inbound`, drain `outbound`
/// into the stream. Runs until either side closes.
///
/// Hello handling is the caller's business; the pump is payload-agnostic.
pub async fn pump_stream(
    mut stream: compio::net::TcpStream,
    inbound: Sender<Message>,
    outbound: Receiver<Message>,
) {
    use compio::buf::BufResult;
    use compio::io::{AsyncRead, AsyncWriteExt};

    let mut assembler = MessageAssembler::new();
    let mut recv_buf = BytesMut::new();
    let mut write_buf = BytesMut::new();

    'pump: loop {
        // Drain pending writes first so request/response turnarounds are not
        // held hostage by a blocked read.
        while let Ok(msg) = outbound.try_recv() {
            encode_stream(&msg, &mut write_buf);
        }
        if !write_buf.is_empty() {
            let out = write_buf.split().to_vec();
            let mut backoff = Backoff::new(
                Duration::from_millis(10),
                Duration::from_secs(1),
                WRITE_RETRY_LIMIT,
            );
            loop {
                let BufResult(res, buf) = (&mut stream).write_all(out.clone()).await;
                let _ = buf;
                match res {
                    Ok(()) => break,
                    Err(e) => {
                        let Some(delay) = backoff.next_delay() else {
                            warn!(error = %e, "link: write retries exhausted");
                            break 'pump;
                        };
                        trace!(error = %e, ?delay, "link: transient write error");
                        compio::time::sleep(delay).await;
                    }
                }
            }
        }

        // Bounded read so the loop comes back around to the write drain.
        let slab: Vec<u8> = Vec::with_capacity(8192);
        match compio::time::timeout(PUMP_READ_TIMEOUT, AsyncRead::read(&mut stream, slab)).await {
            Err(_) => continue, // no inbound traffic this round
            Ok(BufResult(Ok(0), _)) => {
                trace!("link: EOF");
                break;
            }
            Ok(BufResult(Err(e), _)) => {
                trace!(error = %e, "link: read error");
                break;
            }
            Ok(BufResult(Ok(n), slab)) => {
                recv_buf.extend_from_slice(&slab[..n]);
                match assembler.decode(&mut recv_buf) {
                    Ok(msgs) => {
                        for msg in msgs {
                            if inbound.send(msg).is_err() {
                                break 'pump; // broker side gone
                            }
                        }
                    }
                    Err(e) => {
                        warn!(error = %e, "link: protocol error, closing");
                        break;
                    }
                }
            }
        }
    }
    // Dropping the channel ends mark the peer closed on both sides.
}

/// Connect a TCP overlay edge: dial, send the hello control message, spawn
/// the pump, return the channel pair.
///
/// # Errors
///
/// Propagates connect failures.
pub async fn connect_tcp(
    addr: &str,
    uuid: Bytes,
    role: PeerRole,
    rank: Option<u32>,
    cred: Credential,
) -> io::Result<(Sender<Message>, Receiver<Message>)> {
    let stream = compio::net::TcpStream::connect(addr).await?;
    if let Err(e) = crate::tcp::enable_tcp_nodelay(&stream) {
        trace!(error = %e, "link: TCP_NODELAY not set");
    }

    let (to_broker_tx, to_broker_rx) = flume::unbounded();
    let (to_peer_tx, to_peer_rx) = flume::unbounded();

    let hello = Message::control("overlay.hello")
        .with_cred(cred)
        .with_payload(serde_json::json!({
            "uuid": String::from_utf8_lossy(&uuid),
            "role": role.as_str(),
            "rank": rank,
        }));
    to_broker_tx
        .send(hello)
        .map_err(|_| io::Error::new(io::ErrorKind::BrokenPipe, "hello send failed"))?;

    compio::runtime::spawn(pump_stream(stream, to_peer_tx, to_broker_rx)).detach();
    // The pump moves to_broker traffic outbound and broker traffic inbound
    // from the remote's perspective; locally we hand back the mirror ends.
    Ok((to_broker_tx, to_peer_rx))
}

/// Serve a TCP listener: each accepted stream becomes a [`LinkConnect`] once
/// its hello arrives.
pub async fn serve_tcp(listener: compio::net::TcpListener, accepts: Sender<LinkConnect>) {
    loop {
        let Ok((stream, addr)) = listener.accept().await else {
            break;
        };
        trace!(%addr, "link: accepted");
        if let Err(e) = crate::tcp::enable_tcp_nodelay(&stream) {
            trace!(error = %e, "link: TCP_NODELAY not set");
        }
        let accepts = accepts.clone();
        compio::runtime::spawn(async move {
            let (inbound_tx, inbound_rx) = flume::unbounded();
            let (outbound_tx, outbound_rx) = flume::unbounded();
            compio::runtime::spawn(pump_stream(stream, inbound_tx, outbound_rx)).detach();

            // First message must be the hello.
            let Ok(hello) = inbound_rx.recv_async().await else {
                return;
            };
            let Some((uuid, role, rank)) = parse_hello(&hello) else {
                warn!("link: connection without hello, dropping");
                return;
            };
            let _ = accepts.send(LinkConnect {
                uuid,
                role,
                rank,
                cred: hello.cred(),
                tx: outbound_tx,
                rx: inbound_rx,
            });
        })
        .detach();
    }
}

fn parse_hello(msg: &Message) -> Option<(Bytes, PeerRole, Option<u32>)> {
    if msg.topic() != "overlay.hello" {
        return None;
    }
    let payload = msg.payload()?;
    let uuid = payload.get("uuid")?.as_str()?;
    let role = PeerRole::from_name(payload.get("role")?.as_str()?)?;
    let rank = payload.get("rank").and_then(serde_json::Value::as_u64);
    Some((
        Bytes::from(uuid.to_owned()),
        role,
        rank.map(|r| r as u32),
    ))
}
