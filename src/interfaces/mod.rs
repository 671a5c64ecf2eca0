pub mod error;
pub mod rpc;
pub mod signal;
pub mod web;
pub mod whatsapp;

use async_trait::async_trait;
use serde::Serialize;
use std::fmt;
use std::sync::{Mutex, MutexGuard};
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tracing::warn;

pub use error::TransportError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Platform {
    WhatsApp,
    Signal,
}

impl fmt::Display for Platform {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Platform::WhatsApp => f.write_str("whatsapp"),
            Platform::Signal => f.write_str("signal"),
        }
    }
}

/// A text message received on one of the transports, already filtered of
/// self-sent and non-text traffic.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InboundMessage {
    pub platform: Platform,
    /// Conversation the reply goes to (a group or the direct peer).
    pub chat_id: String,
    /// The participant who actually wrote the message.
    pub sender_id: String,
    pub group_id: Option<String>,
    pub text: String,
    pub wire_id: String,
}

impl InboundMessage {
    /// Composite `conversation::participant` identity.
    pub fn sender_identity(&self) -> String {
        format!("{}::{}", self.chat_id, self.sender_id)
    }
}

/// Connection-level signal reported by a transport to its supervisor.
#[derive(Debug)]
pub enum LinkEvent {
    Open,
    Closed { code: Option<u16> },
    LoggedOut,
    Activity,
    Fault(TransportError),
}

/// A [`LinkEvent`] tagged with the connection generation that produced it, so
/// that late events from a torn-down connection can be told apart.
#[derive(Debug)]
pub struct LinkSignal {
    pub generation: u64,
    pub event: LinkEvent,
}

pub type LinkSender = mpsc::UnboundedSender<LinkSignal>;

/// Socket-level view of a transport, merged into the supervisor's status.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LinkHealth {
    pub socket_open: bool,
    pub pending_requests: usize,
}

#[async_trait]
pub trait Transport: Send + Sync {
    fn platform(&self) -> Platform;

    /// Establish a fresh underlying connection. Every signal produced by this
    /// connection is tagged with `generation` and pushed on `link`.
    async fn connect(&self, generation: u64, link: LinkSender) -> Result<(), TransportError>;

    /// Tear down the current connection, if any. Must not emit further
    /// signals for the torn-down generation.
    async fn disconnect(&self);

    async fn send(&self, target: &str, text: &str) -> Result<(), TransportError>;

    fn health_snapshot(&self) -> LinkHealth;
}

/// Lock a std mutex, recovering the data if a holder panicked.
pub(crate) fn guard<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Hand a message to the router without blocking the socket reader, which
/// must keep draining acks and responses. Returns false if it was dropped.
pub(crate) fn forward(intake: &mpsc::Sender<InboundMessage>, msg: InboundMessage) -> bool {
    match intake.try_send(msg) {
        Ok(()) => true,
        Err(TrySendError::Full(msg)) => {
            warn!(
                "[{}] Router intake full, dropping message {} from {}",
                msg.platform, msg.wire_id, msg.sender_id
            );
            false
        }
        Err(TrySendError::Closed(msg)) => {
            warn!("[{}] Router intake closed, message {} lost", msg.platform, msg.wire_id);
            false
        }
    }
}

/// Holds the link sender of the live connection generation.
#[derive(Default)]
pub(crate) struct LinkSlot {
    inner: Mutex<Option<(u64, LinkSender)>>,
}

impl LinkSlot {
    pub(crate) fn install(&self, generation: u64, link: LinkSender) {
        if let Ok(mut slot) = self.inner.lock() {
            *slot = Some((generation, link));
        }
    }

    pub(crate) fn clear(&self) {
        if let Ok(mut slot) = self.inner.lock() {
            *slot = None;
        }
    }

    /// Emit only if `generation` is still the live one.
    pub(crate) fn emit(&self, generation: u64, event: LinkEvent) {
        if let Ok(slot) = self.inner.lock()
            && let Some((live, tx)) = slot.as_ref()
            && *live == generation
        {
            let _ = tx.send(LinkSignal { generation, event });
        }
    }

    /// Emit on whichever generation is live.
    pub(crate) fn emit_current(&self, event: LinkEvent) {
        if let Ok(slot) = self.inner.lock()
            && let Some((generation, tx)) = slot.as_ref()
        {
            let _ = tx.send(LinkSignal {
                generation: *generation,
                event,
            });
        }
    }

    pub(crate) fn generation(&self) -> Option<u64> {
        self.inner.lock().ok().and_then(|s| s.as_ref().map(|(g, _)| *g))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sender_identity_is_composite() {
        let msg = InboundMessage {
            platform: Platform::WhatsApp,
            chat_id: "1203@g.us".into(),
            sender_id: "3161@s.whatsapp.net".into(),
            group_id: Some("1203@g.us".into()),
            text: "hi".into(),
            wire_id: "ABC".into(),
        };
        assert_eq!(msg.sender_identity(), "1203@g.us::3161@s.whatsapp.net");
    }

    #[test]
    fn forward_drops_instead_of_waiting_on_a_full_intake() {
        let msg = |id: &str| InboundMessage {
            platform: Platform::Signal,
            chat_id: "+31".into(),
            sender_id: "+31".into(),
            group_id: None,
            text: "hi".into(),
            wire_id: id.into(),
        };
        let (tx, mut rx) = mpsc::channel(1);
        assert!(forward(&tx, msg("1")));
        assert!(!forward(&tx, msg("2")));
        assert_eq!(rx.try_recv().unwrap().wire_id, "1");
        drop(rx);
        assert!(!forward(&tx, msg("3")));
    }

    #[test]
    fn link_slot_drops_stale_generations() {
        let slot = LinkSlot::default();
        let (tx, mut rx) = mpsc::unbounded_channel();
        slot.install(2, tx);

        slot.emit(1, LinkEvent::Open);
        slot.emit(2, LinkEvent::Activity);

        let got = rx.try_recv().unwrap();
        assert_eq!(got.generation, 2);
        assert!(matches!(got.event, LinkEvent::Activity));
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn cleared_slot_emits_nothing() {
        let slot = LinkSlot::default();
        let (tx, mut rx) = mpsc::unbounded_channel();
        slot.install(1, tx);
        slot.clear();
        slot.emit_current(LinkEvent::Activity);
        assert!(rx.try_recv().is_err());
        assert_eq!(slot.generation(), None);
    }
}
