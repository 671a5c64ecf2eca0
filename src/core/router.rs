use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, mpsc};
use tracing::{error, info, warn};

use crate::core::commands::{Caller, CommandProcessor, Reply};
use crate::core::memory::{ConversationMemory, flush_logged};
use crate::core::supervisor::terminate;
use crate::interfaces::{InboundMessage, Platform, Transport};

pub const INTAKE_CAPACITY: usize = 256;
pub const RESTART_NOTICE: &str = "🔄 Restarting services... I'll be back in a moment.";
/// Time given to the restart notice to leave before the process exits.
pub const RESTART_FLUSH_DELAY: Duration = Duration::from_secs(3);

/// Routing identities derived from an inbound message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Canonical {
    pub reply_target: String,
    pub memory_key: String,
    pub admin_subject: String,
}

/// Replies and history follow the conversation; admin checks follow the
/// participant who wrote the message.
pub fn canonicalize(msg: &InboundMessage) -> Canonical {
    let identity = msg.sender_identity();
    let (target, participant) = identity
        .split_once("::")
        .unwrap_or((identity.as_str(), identity.as_str()));
    Canonical {
        reply_target: target.to_string(),
        memory_key: target.to_string(),
        admin_subject: participant.to_string(),
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dispatched {
    Dropped,
    Replied,
    SendFailed,
    Restart,
}

/// Drains the intake channel and is the sole owner of the
/// [`CommandProcessor`], so messages from every transport are handled one at
/// a time.
pub struct Router {
    processor: CommandProcessor,
    transports: HashMap<Platform, Arc<dyn Transport>>,
    memory: Arc<Mutex<ConversationMemory>>,
    intake: mpsc::Receiver<InboundMessage>,
}

impl Router {
    pub fn new(
        processor: CommandProcessor,
        memory: Arc<Mutex<ConversationMemory>>,
        intake: mpsc::Receiver<InboundMessage>,
    ) -> Self {
        Self {
            processor,
            transports: HashMap::new(),
            memory,
            intake,
        }
    }

    pub fn register(&mut self, transport: Arc<dyn Transport>) {
        self.transports.insert(transport.platform(), transport);
    }

    pub async fn run(mut self) {
        info!("[Router] Ready ({} transports)", self.transports.len());
        while let Some(msg) = self.intake.recv().await {
            if self.handle(msg).await == Dispatched::Restart {
                tokio::time::sleep(RESTART_FLUSH_DELAY).await;
                terminate("[Router] Restart requested by admin");
            }
        }
        warn!("[Router] Intake channel closed");
    }

    pub async fn handle(&mut self, msg: InboundMessage) -> Dispatched {
        let canonical = canonicalize(&msg);
        let Some(transport) = self.transports.get(&msg.platform).cloned() else {
            error!("[Router] No transport registered for {}", msg.platform);
            return Dispatched::Dropped;
        };

        let caller = Caller {
            memory_key: &canonical.memory_key,
            admin_subject: &canonical.admin_subject,
        };
        match self.processor.process(caller, &msg.text).await {
            Reply::Silent => Dispatched::Dropped,
            Reply::Restart => {
                info!("[Router] Restart requested by {}", canonical.admin_subject);
                if let Err(e) = transport.send(&canonical.reply_target, RESTART_NOTICE).await {
                    warn!("[Router] Could not deliver restart notice: {}", e);
                }
                flush_logged(&self.memory).await;
                Dispatched::Restart
            }
            Reply::Text(text) => match transport.send(&canonical.reply_target, &text).await {
                Ok(()) => Dispatched::Replied,
                Err(e) => {
                    error!(
                        "[Router] Failed to send reply to {} on {}: {}",
                        canonical.reply_target, msg.platform, e
                    );
                    Dispatched::SendFailed
                }
            },
        }
    }
}
