//! Daemon composition and the single-threaded event loop.
//!
//! All reconciliation state lives here, built once at startup and
//! passed by reference — no globals. The loop multiplexes four inputs:
//! kernel netlink batches, southbound channel events, frames read from
//! the taps, and the tap reopen timer. Each netlink notification is
//! fully processed (store mutation plus every projection callback)
//! before the next is read, preserving per-object-kind causal order.

use crate::config::{DaemonConfig, TAP_REOPEN_INTERVAL};
use crate::pool::PacketPool;
use crate::reconciler::Reconciler;
use anyhow::Context;
use flowsync_dataplane::{DataplaneChannel, TcpChannel};
use flowsync_netlink::{AsyncNetlinkSocket, DumpKind, Ingest};
use flowsync_store::NetStore;
use flowsync_types::PortNo;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

pub struct Daemon {
    store: NetStore,
    ingest: Ingest,
    reconciler: Reconciler,
    channel: Arc<TcpChannel>,
    southbound_rx: mpsc::UnboundedReceiver<flowsync_dataplane::SouthboundEvent>,
    frame_rx: mpsc::UnboundedReceiver<(PortNo, Vec<u8>)>,
    netlink: AsyncNetlinkSocket,
}

impl Daemon {
    /// Binds the southbound listener and the netlink socket. These are
    /// the only process-fatal failure points.
    pub async fn new(config: DaemonConfig) -> anyhow::Result<Self> {
        let (channel, southbound_rx) = TcpChannel::bind(config.listen_port)
            .await
            .context("failed to bind southbound listener")?;

        let netlink =
            AsyncNetlinkSocket::new().context("failed to open netlink socket")?;

        let pool = PacketPool::new(config.pool_buffers, config.pool_buffer_capacity);
        let (frame_tx, frame_rx) = mpsc::unbounded_channel();

        let reconciler = Reconciler::new(
            Arc::clone(&channel) as Arc<dyn flowsync_dataplane::DataplaneChannel>,
            pool,
            frame_tx,
        );

        Ok(Self {
            store: NetStore::new(),
            ingest: Ingest::new(),
            reconciler,
            channel,
            southbound_rx,
            frame_rx,
            netlink,
        })
    }

    /// Primes the store with a full dump of each kernel table, in
    /// dependency order. Dumps are sequential: the kernel serializes
    /// them per socket, so the next request waits for this one's DONE.
    /// A failed dump leaves that table to live notifications; only the
    /// socket bind in `new` is process-fatal.
    async fn seed_store(&mut self) {
        for kind in DumpKind::SEQUENCE {
            if let Err(e) = self.netlink.request_dump(kind) {
                warn!(?kind, error = %e, "dump request failed, skipping table");
                continue;
            }
            loop {
                let batch = match self.netlink.recv_updates().await {
                    Ok(batch) => batch,
                    Err(e) => {
                        warn!(?kind, error = %e, "receive failed during initial dump");
                        break;
                    }
                };
                for update in batch.updates {
                    self.ingest
                        .apply(&mut self.store, &mut self.reconciler, update);
                }
                if batch.done {
                    break;
                }
            }
        }
        info!(entries = self.store.entry_count(), "store seeded from kernel dump");
    }

    pub async fn run(mut self) -> anyhow::Result<()> {
        self.seed_store().await;

        let mut reopen_timer = tokio::time::interval(TAP_REOPEN_INTERVAL);
        reopen_timer.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                batch = self.netlink.recv_updates() => match batch {
                    Ok(batch) => {
                        for update in batch.updates {
                            self.ingest
                                .apply(&mut self.store, &mut self.reconciler, update);
                        }
                    }
                    Err(e) => {
                        // Socket-level failure; undecodable messages are
                        // already dropped one at a time below this layer.
                        warn!(error = %e, "netlink receive failed");
                    }
                },

                Some(event) = self.southbound_rx.recv() => {
                    self.reconciler.handle_southbound(&self.store, event);
                }

                Some((port, frame)) = self.frame_rx.recv() => {
                    // Frames from the taps are injected as packet-out.
                    if let Err(e) = self.channel.send_packet(port, &frame) {
                        if e.is_recoverable() {
                            debug!(%port, error = %e, "packet-out skipped");
                        } else {
                            warn!(%port, error = %e, "packet-out failed");
                        }
                    }
                }

                _ = reopen_timer.tick() => {
                    self.reconciler.retry_pending_taps();
                }
            }
        }
    }
}
