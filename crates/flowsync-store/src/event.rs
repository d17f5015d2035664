//! Typed store-change events and the subscriber seam.
//!
//! Events carry the entry's *key*, never the object itself: subscribers
//! re-fetch current state from the store, so a callback can never act on
//! a stale copy. For `*Deleted` events the entry is still present when
//! the callback runs (notify-then-remove), so projections can read the
//! entry one last time to build their uninstall.

use crate::{LinkScopedKey, NetStore, RouteKey};

/// A store mutation, delivered to every registered sink after the store
/// has been updated (creates/updates) or just before removal (deletes).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreEvent {
    LinkCreated(u32),
    LinkUpdated(u32),
    LinkDeleted(u32),
    AddrCreated(LinkScopedKey),
    AddrUpdated(LinkScopedKey),
    AddrDeleted(LinkScopedKey),
    NeighCreated(LinkScopedKey),
    NeighUpdated(LinkScopedKey),
    NeighDeleted(LinkScopedKey),
    RouteCreated(RouteKey),
    RouteUpdated(RouteKey),
    RouteDeleted(RouteKey),
}

/// Receiver of store-change events.
///
/// Dispatch is synchronous: the event source finishes every sink's
/// callback before reading the next kernel notification, preserving
/// per-object-kind causal order.
pub trait EventSink {
    fn on_store_event(&mut self, store: &NetStore, event: StoreEvent);
}

/// Handle returned by [`Fanout::subscribe`]; passes back to
/// [`Fanout::unsubscribe`] to stop delivery to that sink.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SinkToken(u64);

/// Fans one event out to several sinks, in registration order.
///
/// The reconciliation controller uses this shape to deliver each event
/// to every interested projector; tests use it to attach a recording
/// sink next to the component under test. Subscription hands back a
/// token so a sink can be detached without disturbing the others.
#[derive(Default)]
pub struct Fanout<'a> {
    sinks: Vec<(SinkToken, &'a mut dyn EventSink)>,
    next_token: u64,
}

impl<'a> Fanout<'a> {
    pub fn new() -> Self {
        Self {
            sinks: Vec::new(),
            next_token: 0,
        }
    }

    pub fn subscribe(&mut self, sink: &'a mut dyn EventSink) -> SinkToken {
        let token = SinkToken(self.next_token);
        self.next_token += 1;
        self.sinks.push((token, sink));
        token
    }

    /// Removes the sink registered under `token`; returns false when the
    /// token is unknown (already removed or never issued here).
    pub fn unsubscribe(&mut self, token: SinkToken) -> bool {
        let before = self.sinks.len();
        self.sinks.retain(|(t, _)| *t != token);
        self.sinks.len() != before
    }
}

impl EventSink for Fanout<'_> {
    fn on_store_event(&mut self, store: &NetStore, event: StoreEvent) {
        for (_, sink) in &mut self.sinks {
            sink.on_store_event(store, event);
        }
    }
}
