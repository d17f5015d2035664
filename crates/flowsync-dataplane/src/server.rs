//! TCP channel server: the concrete transport behind
//! [`DataplaneChannel`](crate::channel::DataplaneChannel).
//!
//! The forwarding element dials in; exactly one connection is active at
//! a time (single-attachment model). Messages are newline-delimited
//! JSON in both directions. Outbound traffic goes through a bounded
//! queue so a slow device surfaces as `Congested` instead of stalling
//! the event loop.

use crate::channel::{ChannelState, DataplaneChannel, PortStatus, SouthboundEvent};
use crate::error::{DataplaneError, DataplaneResult};
use crate::flow::FlowMod;
use flowsync_types::PortNo;
use parking_lot::Mutex;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

/// Depth of the outbound write queue. A full queue is reported as
/// `Congested` and the message is dropped.
const OUT_QUEUE_DEPTH: usize = 512;

/// Protocol version spoken in the hello exchange.
const WIRE_VERSION: u8 = 1;

/// Messages on the wire, both directions.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum WireMessage {
    Hello { version: u8 },
    FlowMod(FlowMod),
    PurgeFlows,
    /// Fence: the device finishes everything queued before this.
    Barrier,
    PacketOut { port: PortNo, frame: Vec<u8> },
    PortStatus(PortStatus),
    PacketIn { port: PortNo, frame: Vec<u8> },
}

#[derive(Default)]
struct Shared {
    state: Mutex<ChannelState>,
    /// Present while a connection is active.
    out_tx: Mutex<Option<mpsc::Sender<WireMessage>>>,
}

/// Channel adapter backed by a TCP listener.
pub struct TcpChannel {
    shared: Arc<Shared>,
}

impl TcpChannel {
    /// Binds the listener and spawns the accept loop. Returns the
    /// channel handle plus the stream of southbound events. Bind
    /// failure is the one fatal bootstrap error of the process.
    pub async fn bind(
        listen_port: u16,
    ) -> DataplaneResult<(Arc<TcpChannel>, mpsc::UnboundedReceiver<SouthboundEvent>)> {
        let listener = TcpListener::bind(("0.0.0.0", listen_port)).await?;
        info!(listen_port, "southbound channel listening");

        let shared = Arc::new(Shared::default());
        let (event_tx, event_rx) = mpsc::unbounded_channel();

        let accept_shared = Arc::clone(&shared);
        tokio::spawn(async move {
            accept_loop(listener, accept_shared, event_tx).await;
        });

        Ok((Arc::new(TcpChannel { shared }), event_rx))
    }

    fn queue(&self, msg: WireMessage) -> DataplaneResult<()> {
        let state = *self.shared.state.lock();
        if !state.is_established() {
            return Err(DataplaneError::unavailable(state));
        }
        let guard = self.shared.out_tx.lock();
        let Some(tx) = guard.as_ref() else {
            return Err(DataplaneError::unavailable(ChannelState::NoChannel));
        };
        match tx.try_send(msg) {
            Ok(()) => Ok(()),
            Err(mpsc::error::TrySendError::Full(_)) => Err(DataplaneError::Congested),
            Err(mpsc::error::TrySendError::Closed(_)) => {
                Err(DataplaneError::unavailable(ChannelState::NoChannel))
            }
        }
    }
}

impl DataplaneChannel for TcpChannel {
    fn state(&self) -> ChannelState {
        *self.shared.state.lock()
    }

    fn send_flow(&self, flow: &FlowMod) -> DataplaneResult<()> {
        self.queue(WireMessage::FlowMod(flow.clone()))
    }

    fn purge_flows(&self) -> DataplaneResult<()> {
        self.queue(WireMessage::PurgeFlows)
    }

    fn send_packet(&self, port: PortNo, frame: &[u8]) -> DataplaneResult<()> {
        self.queue(WireMessage::PacketOut {
            port,
            frame: frame.to_vec(),
        })
    }

    fn barrier(&self) -> DataplaneResult<()> {
        self.queue(WireMessage::Barrier)
    }
}

async fn accept_loop(
    listener: TcpListener,
    shared: Arc<Shared>,
    event_tx: mpsc::UnboundedSender<SouthboundEvent>,
) {
    loop {
        let (stream, peer) = match listener.accept().await {
            Ok(conn) => conn,
            Err(e) => {
                warn!(error = %e, "accept failed");
                continue;
            }
        };

        // Single-attachment model: refuse a second device while one is
        // connected.
        if *shared.state.lock() != ChannelState::NoChannel {
            warn!(%peer, "rejecting connection, a forwarding element is already attached");
            drop(stream);
            continue;
        }

        info!(%peer, "forwarding element connected");
        *shared.state.lock() = ChannelState::Open;

        serve_connection(stream, &shared, &event_tx).await;

        let was_established = shared.state.lock().is_established();
        *shared.state.lock() = ChannelState::NoChannel;
        shared.out_tx.lock().take();
        info!(%peer, "forwarding element disconnected");
        if was_established {
            let _ = event_tx.send(SouthboundEvent::ChannelDown);
        }
    }
}

async fn serve_connection(
    stream: TcpStream,
    shared: &Arc<Shared>,
    event_tx: &mpsc::UnboundedSender<SouthboundEvent>,
) {
    let (read_half, mut write_half) = stream.into_split();
    let (out_tx, mut out_rx) = mpsc::channel::<WireMessage>(OUT_QUEUE_DEPTH);
    *shared.out_tx.lock() = Some(out_tx);

    let writer = tokio::spawn(async move {
        while let Some(msg) = out_rx.recv().await {
            let mut line = match serde_json::to_vec(&msg) {
                Ok(line) => line,
                Err(e) => {
                    warn!(error = %e, "dropping unserializable message");
                    continue;
                }
            };
            line.push(b'\n');
            if write_half.write_all(&line).await.is_err() {
                break;
            }
        }
    });

    let mut lines = BufReader::new(read_half).lines();
    loop {
        let line = match lines.next_line().await {
            Ok(Some(line)) => line,
            Ok(None) => break,
            Err(e) => {
                warn!(error = %e, "read failed, closing channel");
                break;
            }
        };

        let msg: WireMessage = match serde_json::from_str(&line) {
            Ok(msg) => msg,
            Err(e) => {
                // Decode errors discard the single message only.
                warn!(error = %e, "discarding malformed southbound message");
                continue;
            }
        };

        match msg {
            WireMessage::Hello { version } => {
                debug!(version, "hello from device");
                let reply = {
                    let guard = shared.out_tx.lock();
                    guard.as_ref().map(|tx| {
                        tx.try_send(WireMessage::Hello {
                            version: WIRE_VERSION,
                        })
                    })
                };
                if reply.is_none() {
                    break;
                }
                *shared.state.lock() = ChannelState::Established;
                let _ = event_tx.send(SouthboundEvent::ChannelUp);
            }
            WireMessage::PortStatus(status) => {
                let _ = event_tx.send(SouthboundEvent::PortStatus(status));
            }
            WireMessage::PacketIn { port, frame } => {
                let _ = event_tx.send(SouthboundEvent::PacketIn { port, frame });
            }
            other => {
                warn!(?other, "unexpected northbound message, discarding");
            }
        }
    }

    writer.abort();
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::flow::{FlowMatch, FlowRule};
    use tokio::io::AsyncReadExt;

    fn add_mod() -> FlowMod {
        FlowMod::Add(FlowRule {
            table: 0,
            priority: 1,
            cookie: 0,
            matches: FlowMatch::new(),
            actions: vec![],
        })
    }

    #[tokio::test]
    async fn test_send_requires_established() {
        let (channel, _events) = TcpChannel::bind(0).await.unwrap();
        let err = channel.send_flow(&add_mod()).unwrap_err();
        assert!(matches!(err, DataplaneError::ChannelUnavailable { .. }));
    }

    #[tokio::test]
    async fn test_hello_establishes_and_flow_reaches_wire() {
        // Bind an ephemeral port, then connect a fake device.
        let listener = TcpListener::bind(("127.0.0.1", 0)).await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);
        let (channel, mut events) = TcpChannel::bind(port).await.unwrap();

        let mut device = loop {
            match TcpStream::connect(("127.0.0.1", port)).await {
                Ok(stream) => break stream,
                Err(_) => tokio::time::sleep(std::time::Duration::from_millis(10)).await,
            }
        };
        device
            .write_all(b"{\"type\":\"hello\",\"version\":1}\n")
            .await
            .unwrap();

        assert_eq!(events.recv().await, Some(SouthboundEvent::ChannelUp));
        assert!(channel.state().is_established());

        channel.send_flow(&add_mod()).unwrap();

        // First line back is our hello reply, second the flow mod.
        let mut buf = vec![0u8; 4096];
        let mut collected = String::new();
        while collected.matches('\n').count() < 2 {
            let n = device.read(&mut buf).await.unwrap();
            assert!(n > 0, "device connection closed early");
            collected.push_str(std::str::from_utf8(&buf[..n]).unwrap());
        }
        assert!(collected.contains("\"type\":\"hello\""));
        assert!(collected.contains("\"type\":\"flow_mod\""));
    }
}
