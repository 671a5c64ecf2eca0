use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use serde::Deserialize;
use serde_json::{Value, json};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, info, warn};

use super::rpc::{PendingRequestTable, await_reply};
use super::{
    InboundMessage, LinkEvent, LinkHealth, LinkSender, LinkSlot, Platform, Transport,
    TransportError, forward, guard,
};
use crate::config::WhatsAppConfig;
use crate::core::dedup::Deduplicator;

/// Close code the bridge reports when the device was unlinked.
pub const LOGGED_OUT_STATUS: u16 = 401;

#[derive(Debug, Deserialize)]
#[serde(tag = "event")]
enum BridgeFrame {
    #[serde(rename = "connection.update")]
    Connection {
        connection: Option<String>,
        #[serde(rename = "statusCode")]
        status_code: Option<u16>,
    },
    #[serde(rename = "messages.upsert")]
    Upsert {
        #[serde(rename = "type")]
        kind: String,
        #[serde(default)]
        messages: Vec<WireMessage>,
    },
    #[serde(rename = "send.ack")]
    SendAck {
        #[serde(rename = "ref")]
        reference: String,
        ok: bool,
        error: Option<String>,
    },
    #[serde(rename = "fault")]
    Fault {
        #[serde(default)]
        fatal: bool,
        message: String,
    },
    #[serde(other)]
    Other,
}

#[derive(Debug, Deserialize)]
struct WireMessage {
    key: MessageKey,
    participant: Option<String>,
    message: Option<MessageBody>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct MessageKey {
    remote_jid: String,
    id: String,
    #[serde(default)]
    from_me: bool,
    participant: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct MessageBody {
    conversation: Option<String>,
    extended_text_message: Option<ExtendedText>,
}

#[derive(Debug, Deserialize)]
struct ExtendedText {
    text: Option<String>,
}

/// Turn a delivery batch into an inbound message. Only `notify` batches are
/// handled and only their first message is considered.
fn inbound_from_upsert(kind: &str, messages: Vec<WireMessage>) -> Option<InboundMessage> {
    if kind != "notify" {
        return None;
    }
    let msg = messages.into_iter().next()?;
    if msg.key.from_me {
        return None;
    }
    let body = msg.message?;
    let text = body
        .conversation
        .or_else(|| body.extended_text_message.and_then(|e| e.text))?;
    let text = text.trim();
    if text.is_empty() {
        return None;
    }

    let chat_id = msg.key.remote_jid;
    let sender_id = msg
        .key
        .participant
        .or(msg.participant)
        .unwrap_or_else(|| chat_id.clone());
    let group_id = chat_id.ends_with("@g.us").then(|| chat_id.clone());

    Some(InboundMessage {
        platform: Platform::WhatsApp,
        chat_id,
        sender_id,
        group_id,
        text: text.to_string(),
        wire_id: msg.key.id,
    })
}

struct Shared {
    url: String,
    send_timeout: Duration,
    intake: mpsc::Sender<InboundMessage>,
    dedup: Mutex<Deduplicator>,
    pending: Mutex<PendingRequestTable>,
    link: LinkSlot,
    outbound: Mutex<Option<mpsc::UnboundedSender<Message>>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl Shared {
    async fn on_frame(&self, generation: u64, raw: &str) {
        debug!("[WhatsApp] <- {}", raw);
        self.link.emit(generation, LinkEvent::Activity);

        let frame: BridgeFrame = match serde_json::from_str(raw) {
            Ok(frame) => frame,
            Err(e) => {
                warn!("[WhatsApp] Skipping malformed frame: {}", e);
                return;
            }
        };

        match frame {
            BridgeFrame::Connection {
                connection,
                status_code,
            } => match connection.as_deref() {
                Some("open") => self.link.emit(generation, LinkEvent::Open),
                Some("close") if status_code == Some(LOGGED_OUT_STATUS) => {
                    self.link.emit(generation, LinkEvent::LoggedOut)
                }
                Some("close") => self
                    .link
                    .emit(generation, LinkEvent::Closed { code: status_code }),
                other => debug!("[WhatsApp] Connection update {:?}", other),
            },
            BridgeFrame::Upsert { kind, messages } => {
                let Some(msg) = inbound_from_upsert(&kind, messages) else {
                    return;
                };
                if !guard(&self.dedup).first_sighting(&msg.wire_id) {
                    debug!("[WhatsApp] Duplicate message {} dropped", msg.wire_id);
                    return;
                }
                info!("[WhatsApp] Received from {}: {}", msg.sender_id, msg.text);
                forward(&self.intake, msg);
            }
            BridgeFrame::SendAck {
                reference,
                ok,
                error,
            } => {
                let reply = if ok {
                    Ok(Value::Null)
                } else {
                    Err(TransportError::Rejected(
                        error.unwrap_or_else(|| "send failed".to_string()),
                    ))
                };
                if !guard(&self.pending).resolve(&reference, reply) {
                    debug!("[WhatsApp] Late ack for {}", reference);
                }
            }
            BridgeFrame::Fault { fatal, message } => {
                let err = if fatal {
                    TransportError::Fatal(message)
                } else {
                    TransportError::Fault(message)
                };
                self.link.emit(generation, LinkEvent::Fault(err));
            }
            BridgeFrame::Other => {}
        }
    }

    fn on_socket_closed(&self, generation: u64, code: Option<u16>) {
        if self.link.generation() != Some(generation) {
            return;
        }
        guard(&self.outbound).take();
        guard(&self.pending).fail_all();
        self.link.emit(generation, LinkEvent::Closed { code });
    }
}

/// Transport speaking to the multi-device bridge sidecar over a WebSocket.
pub struct WhatsAppBridge {
    shared: Arc<Shared>,
}

impl WhatsAppBridge {
    pub fn new(config: &WhatsAppConfig, intake: mpsc::Sender<InboundMessage>) -> Self {
        Self {
            shared: Arc::new(Shared {
                url: config.bridge_url.clone(),
                send_timeout: Duration::from_secs(config.send_timeout_secs),
                intake,
                dedup: Mutex::new(Deduplicator::new(config.dedup_capacity)),
                pending: Mutex::new(PendingRequestTable::default()),
                link: LinkSlot::default(),
                outbound: Mutex::new(None),
                tasks: Mutex::new(Vec::new()),
            }),
        }
    }
}

#[async_trait]
impl Transport for WhatsAppBridge {
    fn platform(&self) -> Platform {
        Platform::WhatsApp
    }

    async fn connect(&self, generation: u64, link: LinkSender) -> Result<(), TransportError> {
        info!("[WhatsApp] Connecting to bridge at {}", self.shared.url);
        let (ws, _) = connect_async(self.shared.url.as_str()).await?;
        let (mut sink, mut stream) = ws.split();
        let (out_tx, mut out_rx) = mpsc::unbounded_channel::<Message>();

        self.shared.link.install(generation, link);
        *guard(&self.shared.outbound) = Some(out_tx);

        let writer = tokio::spawn(async move {
            while let Some(msg) = out_rx.recv().await {
                if let Err(e) = sink.send(msg).await {
                    warn!("[WhatsApp] Write failed: {}", e);
                    break;
                }
            }
        });

        let shared = self.shared.clone();
        let reader = tokio::spawn(async move {
            let mut code = None;
            while let Some(next) = stream.next().await {
                match next {
                    Ok(Message::Text(text)) => shared.on_frame(generation, text.as_str()).await,
                    Ok(Message::Close(frame)) => {
                        code = frame.map(|f| u16::from(f.code));
                        break;
                    }
                    Ok(_) => shared.link.emit(generation, LinkEvent::Activity),
                    Err(e) => {
                        warn!("[WhatsApp] Socket error: {}", e);
                        break;
                    }
                }
            }
            shared.on_socket_closed(generation, code);
        });

        let mut tasks = guard(&self.shared.tasks);
        tasks.push(writer);
        tasks.push(reader);
        Ok(())
    }

    async fn disconnect(&self) {
        self.shared.link.clear();
        guard(&self.shared.outbound).take();
        for task in guard(&self.shared.tasks).drain(..) {
            task.abort();
        }
        guard(&self.shared.pending).fail_all();
    }

    async fn send(&self, target: &str, text: &str) -> Result<(), TransportError> {
        let out = guard(&self.shared.outbound)
            .clone()
            .ok_or(TransportError::NotConnected)?;
        let timeout = self.shared.send_timeout;
        let (reference, rx) = {
            let mut pending = guard(&self.shared.pending);
            let reference = pending.next_id();
            let rx = pending.register(reference.clone(), timeout);
            (reference, rx)
        };

        let frame = json!({
            "action": "send",
            "ref": reference,
            "jid": target,
            "text": text,
        });
        if out.send(Message::Text(frame.to_string().into())).is_err() {
            guard(&self.shared.pending).remove(&reference);
            return Err(TransportError::NotConnected);
        }

        match await_reply(&self.shared.pending, &reference, rx, timeout).await {
            Ok(_) => {
                self.shared.link.emit_current(LinkEvent::Activity);
                info!("[WhatsApp] Sent reply to {}", target);
                Ok(())
            }
            Err(e) => {
                warn!("[WhatsApp] Send to {} failed: {}", target, e);
                Err(e)
            }
        }
    }

    fn health_snapshot(&self) -> LinkHealth {
        LinkHealth {
            socket_open: guard(&self.shared.outbound).is_some(),
            pending_requests: guard(&self.shared.pending).len(),
        }
    }
}
