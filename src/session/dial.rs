//! Dial-request tunnel bridge
//!
//! Cluster-side agents open connections back through the workstation: the
//! broker streams [`DialRequest`]s to the session, and for each one the
//! bridge spawns an independent relay that dials the local target and pumps
//! bytes both ways over a per-connection tunnel stream.
//!
//! # Liveness
//!
//! The receive loop never waits on a relay: every request is handed to a
//! spawned task immediately, so a stalled relay cannot delay receipt of the
//! next request. When the broker closes the stream the loop returns without
//! touching in-flight relays; they drain on their own and are only
//! force-closed by the session scope's cancellation, which every relay
//! holds a child token of.

use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use futures::{Stream, StreamExt};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::sync::CancellationToken;
use tonic::transport::Channel;
use tracing::{debug, warn};

use crate::proto::broker::broker_client::BrokerClient;
use crate::proto::broker::{DialRequest, TunnelChunk};
use crate::{Error, Result};

/// Used when a dial request does not carry its own timeout
const DEFAULT_DIAL_TIMEOUT: Duration = Duration::from_secs(5);

/// Read buffer size for the local-to-broker direction
const TUNNEL_CHUNK_SIZE: usize = 32 * 1024;

/// In-flight chunk budget per direction before backpressure
const TUNNEL_WINDOW: usize = 32;

/// A server-pushed stream of dial requests
pub type DialRequestStream =
    Pin<Box<dyn Stream<Item = std::result::Result<DialRequest, tonic::Status>> + Send>>;

/// Opens the local side of one dialed connection and relays its bytes
#[cfg_attr(test, automock)]
#[async_trait]
pub trait Dialer: Send + Sync + 'static {
    /// Serve one dial request to completion
    ///
    /// Returns once both directions are closed, the peer vanished, or
    /// `cancel` fired. Errors are per-connection; the caller logs them and
    /// keeps serving other requests.
    async fn relay(&self, request: DialRequest, cancel: CancellationToken) -> Result<()>;
}

#[cfg(test)]
use mockall::automock;

/// Consume the dial-request stream until it ends or the session is cancelled
///
/// Each request is served by an independent spawned relay holding a child
/// token of `cancel`. Returns an error only when the stream itself breaks;
/// a clean end-of-stream and cancellation both return `Ok`.
pub async fn dial_loop(
    mut requests: DialRequestStream,
    dialer: Arc<dyn Dialer>,
    cancel: CancellationToken,
) -> Result<()> {
    let active: Arc<DashMap<String, CancellationToken>> = Arc::new(DashMap::new());

    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                debug!(in_flight = active.len(), "Dial loop cancelled");
                return Ok(());
            }
            item = requests.next() => match item {
                None => {
                    debug!(in_flight = active.len(), "Dial stream ended");
                    return Ok(());
                }
                Some(Err(status)) => {
                    warn!(error = %status, "Dial stream broke");
                    return Err(Error::Rpc(status));
                }
                Some(Ok(request)) => {
                    if active.contains_key(&request.conn_id) {
                        warn!(conn_id = %request.conn_id, "Duplicate dial request dropped");
                        continue;
                    }
                    let child = cancel.child_token();
                    active.insert(request.conn_id.clone(), child.clone());

                    let dialer = dialer.clone();
                    let active = active.clone();
                    let conn_id = request.conn_id.clone();
                    tokio::spawn(async move {
                        debug!(conn_id = %conn_id, address = %request.address, "Relay started");
                        if let Err(e) = dialer.relay(request, child).await {
                            warn!(conn_id = %conn_id, error = %e, "Relay failed");
                        } else {
                            debug!(conn_id = %conn_id, "Relay finished");
                        }
                        active.remove(&conn_id);
                    });
                }
            }
        }
    }
}

/// [`Dialer`] that connects over TCP and tunnels through the broker
pub struct TcpDialer {
    client: BrokerClient<Channel>,
}

impl TcpDialer {
    /// Build a dialer sharing the session's broker channel
    pub fn new(client: BrokerClient<Channel>) -> Self {
        Self { client }
    }
}

#[async_trait]
impl Dialer for TcpDialer {
    async fn relay(&self, request: DialRequest, cancel: CancellationToken) -> Result<()> {
        let dial_timeout = if request.dial_timeout_ms == 0 {
            DEFAULT_DIAL_TIMEOUT
        } else {
            Duration::from_millis(request.dial_timeout_ms)
        };

        // Open the tunnel first so even a failed dial can be reported
        let (tx, rx) = mpsc::channel::<TunnelChunk>(TUNNEL_WINDOW);
        let inbound = self
            .client
            .clone()
            .tunnel(ReceiverStream::new(rx))
            .await?
            .into_inner();

        // Bind this stream to the connection id server-side
        tx.send(chunk(&request.conn_id, Vec::new(), false))
            .await
            .map_err(|_| Error::internal("tunnel closed before dial"))?;

        let stream = match tokio::time::timeout(dial_timeout, TcpStream::connect(&request.address))
            .await
        {
            Ok(Ok(stream)) => stream,
            Ok(Err(e)) => {
                let _ = tx.send(chunk(&request.conn_id, Vec::new(), true)).await;
                return Err(Error::Io(e));
            }
            Err(_) => {
                let _ = tx.send(chunk(&request.conn_id, Vec::new(), true)).await;
                return Err(Error::Io(std::io::Error::new(
                    std::io::ErrorKind::TimedOut,
                    format!("dial to {} timed out", request.address),
                )));
            }
        };

        let (read_half, write_half) = stream.into_split();
        let uplink = tokio::spawn(pump_uplink(
            read_half,
            tx,
            request.conn_id.clone(),
            cancel.clone(),
        ));
        let result = pump_downlink(inbound, write_half, cancel).await;
        let _ = uplink.await;
        result
    }
}

fn chunk(conn_id: &str, payload: Vec<u8>, eof: bool) -> TunnelChunk {
    TunnelChunk {
        conn_id: conn_id.to_string(),
        payload,
        eof,
    }
}

/// Local socket to broker: read, wrap, send; EOF is forwarded as a marker
async fn pump_uplink<R>(
    mut local: R,
    tx: mpsc::Sender<TunnelChunk>,
    conn_id: String,
    cancel: CancellationToken,
) where
    R: AsyncRead + Unpin,
{
    let mut buf = vec![0u8; TUNNEL_CHUNK_SIZE];
    loop {
        tokio::select! {
            _ = cancel.cancelled() => return,
            read = local.read(&mut buf) => match read {
                Ok(0) => {
                    let _ = tx.send(chunk(&conn_id, Vec::new(), true)).await;
                    return;
                }
                Ok(n) => {
                    if tx.send(chunk(&conn_id, buf[..n].to_vec(), false)).await.is_err() {
                        return;
                    }
                }
                Err(e) => {
                    debug!(conn_id = %conn_id, error = %e, "Local read ended");
                    let _ = tx.send(chunk(&conn_id, Vec::new(), true)).await;
                    return;
                }
            }
        }
    }
}

/// Broker to local socket: unwrap, write; an EOF marker half-closes the socket
async fn pump_downlink<S, W>(mut inbound: S, mut local: W, cancel: CancellationToken) -> Result<()>
where
    S: Stream<Item = std::result::Result<TunnelChunk, tonic::Status>> + Unpin,
    W: AsyncWrite + Unpin,
{
    loop {
        tokio::select! {
            _ = cancel.cancelled() => return Ok(()),
            item = inbound.next() => match item {
                None => return Ok(()),
                Some(Err(status)) => return Err(Error::Rpc(status)),
                Some(Ok(chunk)) => {
                    if !chunk.payload.is_empty() {
                        local.write_all(&chunk.payload).await?;
                    }
                    if chunk.eof {
                        let _ = local.shutdown().await;
                        return Ok(());
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;
    use std::time::Instant;

    /// Dialer that records starts/ends and sleeps per the request address
    struct RecordingDialer {
        events: Mutex<Vec<String>>,
    }

    impl RecordingDialer {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                events: Mutex::new(Vec::new()),
            })
        }

        fn events(&self) -> Vec<String> {
            self.events.lock().expect("events lock").clone()
        }

        fn record(&self, event: String) {
            self.events.lock().expect("events lock").push(event);
        }
    }

    #[async_trait]
    impl Dialer for RecordingDialer {
        async fn relay(&self, request: DialRequest, cancel: CancellationToken) -> Result<()> {
            self.record(format!("start:{}", request.conn_id));
            let delay = match request.address.as_str() {
                "slow" => Duration::from_millis(500),
                _ => Duration::from_millis(1),
            };
            tokio::select! {
                _ = cancel.cancelled() => self.record(format!("cancelled:{}", request.conn_id)),
                _ = tokio::time::sleep(delay) => self.record(format!("done:{}", request.conn_id)),
            }
            Ok(())
        }
    }

    fn dial_request(conn_id: &str, address: &str) -> DialRequest {
        DialRequest {
            conn_id: conn_id.to_string(),
            protocol: "tcp".to_string(),
            address: address.to_string(),
            dial_timeout_ms: 0,
        }
    }

    fn request_stream() -> (
        mpsc::Sender<std::result::Result<DialRequest, tonic::Status>>,
        DialRequestStream,
    ) {
        let (tx, rx) = mpsc::channel(16);
        (tx, Box::pin(ReceiverStream::new(rx)))
    }

    async fn wait_for<F: Fn() -> bool>(deadline: Duration, check: F) -> bool {
        let start = Instant::now();
        while start.elapsed() < deadline {
            if check() {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        check()
    }

    #[tokio::test]
    async fn test_slow_relay_does_not_block_receipt() {
        let dialer = RecordingDialer::new();
        let (tx, stream) = request_stream();
        let cancel = CancellationToken::new();

        let loop_handle = tokio::spawn(dial_loop(stream, dialer.clone(), cancel.clone()));

        // A slow relay first, then fast ones behind it
        tx.send(Ok(dial_request("c1", "slow"))).await.expect("send");
        tx.send(Ok(dial_request("c2", "fast"))).await.expect("send");
        tx.send(Ok(dial_request("c3", "fast"))).await.expect("send");

        // All three must start while the slow one is still in flight
        let d = dialer.clone();
        let all_started = wait_for(Duration::from_millis(200), move || {
            let events = d.events();
            ["start:c1", "start:c2", "start:c3"]
                .iter()
                .all(|e| events.iter().any(|ev| ev == e))
        })
        .await;
        assert!(all_started, "receipt was blocked by a slow relay");
        assert!(!dialer.events().iter().any(|e| e == "done:c1"));

        cancel.cancel();
        loop_handle.await.expect("join").expect("loop result");
    }

    #[tokio::test]
    async fn test_stream_end_leaves_relays_draining() {
        let dialer = RecordingDialer::new();
        let (tx, stream) = request_stream();
        let cancel = CancellationToken::new();

        let loop_handle = tokio::spawn(dial_loop(stream, dialer.clone(), cancel.clone()));

        tx.send(Ok(dial_request("c1", "slow"))).await.expect("send");
        let d = dialer.clone();
        assert!(wait_for(Duration::from_millis(200), move || !d.events().is_empty()).await);

        // Broker closes the stream: the loop returns, the relay keeps going
        drop(tx);
        loop_handle.await.expect("join").expect("clean end");
        assert!(!dialer.events().iter().any(|e| e.starts_with("done")));

        // The relay drains on its own afterwards
        let d = dialer.clone();
        assert!(
            wait_for(Duration::from_secs(1), move || {
                d.events().iter().any(|e| e == "done:c1")
            })
            .await
        );
    }

    #[tokio::test]
    async fn test_session_cancel_force_closes_relays() {
        let dialer = RecordingDialer::new();
        let (tx, stream) = request_stream();
        let cancel = CancellationToken::new();

        let loop_handle = tokio::spawn(dial_loop(stream, dialer.clone(), cancel.clone()));

        tx.send(Ok(dial_request("c1", "slow"))).await.expect("send");
        let d = dialer.clone();
        assert!(wait_for(Duration::from_millis(200), move || !d.events().is_empty()).await);

        cancel.cancel();
        loop_handle.await.expect("join").expect("loop result");

        // The relay's child token fired; it did not sleep out its 500ms
        let d = dialer.clone();
        assert!(
            wait_for(Duration::from_millis(200), move || {
                d.events().iter().any(|e| e == "cancelled:c1")
            })
            .await
        );
    }

    #[tokio::test]
    async fn test_duplicate_conn_id_dropped_while_active() {
        let dialer = RecordingDialer::new();
        let (tx, stream) = request_stream();
        let cancel = CancellationToken::new();

        let loop_handle = tokio::spawn(dial_loop(stream, dialer.clone(), cancel.clone()));

        tx.send(Ok(dial_request("c1", "slow"))).await.expect("send");
        tx.send(Ok(dial_request("c1", "slow"))).await.expect("send");
        tx.send(Ok(dial_request("c2", "fast"))).await.expect("send");

        let d = dialer.clone();
        assert!(
            wait_for(Duration::from_millis(200), move || {
                d.events().iter().any(|e| e == "start:c2")
            })
            .await
        );
        let starts = dialer
            .events()
            .iter()
            .filter(|e| *e == "start:c1")
            .count();
        assert_eq!(starts, 1, "duplicate conn id must not spawn twice");

        cancel.cancel();
        loop_handle.await.expect("join").expect("loop result");
    }

    #[tokio::test]
    async fn test_stream_error_surfaces() {
        let dialer = RecordingDialer::new();
        let (tx, stream) = request_stream();
        let cancel = CancellationToken::new();

        let loop_handle = tokio::spawn(dial_loop(stream, dialer, cancel));

        tx.send(Err(tonic::Status::unavailable("broker restarting")))
            .await
            .expect("send");

        let result = loop_handle.await.expect("join");
        assert!(matches!(result, Err(Error::Rpc(_))));
    }

    #[tokio::test]
    async fn test_downlink_writes_and_half_closes() {
        let chunks = vec![
            Ok(chunk("c1", b"hello ".to_vec(), false)),
            Ok(chunk("c1", b"world".to_vec(), false)),
            Ok(chunk("c1", Vec::new(), true)),
        ];
        let inbound = futures::stream::iter(chunks);
        let (mut local, remote) = tokio::io::duplex(1024);

        pump_downlink(Box::pin(inbound), remote, CancellationToken::new())
            .await
            .expect("downlink clean");

        let mut received = Vec::new();
        local
            .read_to_end(&mut received)
            .await
            .expect("read to eof");
        assert_eq!(received, b"hello world");
    }

    #[tokio::test]
    async fn test_uplink_forwards_reads_and_eof_marker() {
        let (mut local, remote) = tokio::io::duplex(1024);
        let (tx, mut rx) = mpsc::channel(16);

        let handle = tokio::spawn(pump_uplink(
            remote,
            tx,
            "c1".to_string(),
            CancellationToken::new(),
        ));

        local.write_all(b"payload").await.expect("write");
        local.shutdown().await.expect("shutdown");

        let first = rx.recv().await.expect("data chunk");
        assert_eq!(first.payload, b"payload");
        assert!(!first.eof);

        let last = rx.recv().await.expect("eof chunk");
        assert!(last.eof);
        assert!(last.payload.is_empty());

        handle.await.expect("uplink done");
    }

    /// Story: a burst of dials is served concurrently and survives teardown
    #[tokio::test]
    async fn story_dial_burst_lifecycle() {
        let dialer = RecordingDialer::new();
        let (tx, stream) = request_stream();
        let cancel = CancellationToken::new();

        // Act 1: the broker pushes a burst of dial requests
        let loop_handle = tokio::spawn(dial_loop(stream, dialer.clone(), cancel.clone()));
        for i in 0..5 {
            tx.send(Ok(dial_request(&format!("c{i}"), "fast")))
                .await
                .expect("send");
        }

        // Act 2: every relay runs and finishes independently
        let d = dialer.clone();
        assert!(
            wait_for(Duration::from_secs(1), move || {
                let events = d.events();
                (0..5).all(|i| events.iter().any(|e| *e == format!("done:c{i}")))
            })
            .await
        );

        // Act 3: the session ends; the loop unwinds cleanly
        cancel.cancel();
        loop_handle.await.expect("join").expect("loop result");
    }
}
