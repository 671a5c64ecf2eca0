use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{Value, json};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::rpc::{Frame, LineBuffer, PendingRequestTable, await_reply, classify};
use super::{
    InboundMessage, LinkEvent, LinkHealth, LinkSender, LinkSlot, Platform, Transport,
    TransportError, forward, guard,
};
use crate::config::SignalConfig;

/// Prefix marking a group reply target.
pub const GROUP_PREFIX: &str = "group:";

#[derive(Debug, Deserialize)]
struct ReceiveParams {
    envelope: Envelope,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Envelope {
    source: Option<String>,
    source_number: Option<String>,
    timestamp: Option<u64>,
    data_message: Option<DataMessage>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct DataMessage {
    message: Option<String>,
    group_info: Option<GroupInfo>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GroupInfo {
    group_id: String,
}

fn inbound_from_receive(params: Value, account: &str) -> Option<InboundMessage> {
    let params: ReceiveParams = match serde_json::from_value(params) {
        Ok(p) => p,
        Err(e) => {
            debug!("[Signal] Ignoring receive push: {}", e);
            return None;
        }
    };
    let envelope = params.envelope;
    let source = envelope.source.or(envelope.source_number)?;
    if source == account {
        return None;
    }
    let data = envelope.data_message?;
    let text = data.message?;
    let text = text.trim();
    if text.is_empty() {
        return None;
    }

    let group_id = data.group_info.map(|g| g.group_id);
    let chat_id = match &group_id {
        Some(id) => format!("{}{}", GROUP_PREFIX, id),
        None => source.clone(),
    };
    Some(InboundMessage {
        platform: Platform::Signal,
        chat_id,
        sender_id: source,
        group_id,
        text: text.to_string(),
        wire_id: envelope.timestamp.map(|t| t.to_string()).unwrap_or_default(),
    })
}

/// `send` parameters for a direct recipient or a `group:<id>` target.
fn send_params(account: &str, target: &str, text: &str) -> Value {
    match target.strip_prefix(GROUP_PREFIX) {
        Some(group_id) => json!({
            "account": account,
            "message": text,
            "groupId": group_id,
        }),
        None => json!({
            "account": account,
            "message": text,
            "recipient": [target],
        }),
    }
}

struct Shared {
    addr: String,
    account: String,
    send_timeout: Duration,
    intake: mpsc::Sender<InboundMessage>,
    pending: Mutex<PendingRequestTable>,
    link: LinkSlot,
    outbound: Mutex<Option<mpsc::UnboundedSender<String>>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl Shared {
    async fn on_line(&self, generation: u64, line: &str) {
        debug!("[Signal] <- {}", line);
        self.link.emit(generation, LinkEvent::Activity);

        let json: Value = match serde_json::from_str(line) {
            Ok(v) => v,
            Err(e) => {
                warn!("[Signal] Skipping malformed line: {}", e);
                return;
            }
        };

        match classify(json) {
            Frame::Response { id, outcome } => {
                let reply = outcome.map_err(TransportError::Rejected);
                if !guard(&self.pending).resolve(&id, reply) {
                    debug!("[Signal] No pending request for response {}", id);
                }
            }
            Frame::Push { method, params } if method == "receive" => {
                let Some(msg) = inbound_from_receive(params, &self.account) else {
                    return;
                };
                info!("[Signal] Received from {}: {}", msg.sender_id, msg.text);
                forward(&self.intake, msg);
            }
            Frame::Push { method, .. } => debug!("[Signal] Ignoring push {}", method),
            Frame::Other => {}
        }
    }

    fn on_socket_closed(&self, generation: u64) {
        if self.link.generation() != Some(generation) {
            return;
        }
        guard(&self.outbound).take();
        guard(&self.pending).fail_all();
        warn!("[Signal] Stream closed");
        self.link.emit(generation, LinkEvent::Closed { code: None });
    }
}

/// Line-delimited JSON-RPC client for the local chat daemon.
pub struct SignalRpc {
    shared: Arc<Shared>,
}

impl SignalRpc {
    pub fn new(config: &SignalConfig, intake: mpsc::Sender<InboundMessage>) -> Self {
        Self {
            shared: Arc::new(Shared {
                addr: config.rpc_addr.clone(),
                account: config.account.clone(),
                send_timeout: Duration::from_secs(config.send_timeout_secs),
                intake,
                pending: Mutex::new(PendingRequestTable::default()),
                link: LinkSlot::default(),
                outbound: Mutex::new(None),
                tasks: Mutex::new(Vec::new()),
            }),
        }
    }
}

#[async_trait]
impl Transport for SignalRpc {
    fn platform(&self) -> Platform {
        Platform::Signal
    }

    async fn connect(&self, generation: u64, link: LinkSender) -> Result<(), TransportError> {
        let stream = TcpStream::connect(&self.shared.addr).await?;
        let (mut reader, mut writer) = stream.into_split();
        let (out_tx, mut out_rx) = mpsc::unbounded_channel::<String>();

        self.shared.link.install(generation, link);
        *guard(&self.shared.outbound) = Some(out_tx);
        info!("[Signal] Connected to {}", self.shared.addr);
        self.shared.link.emit(generation, LinkEvent::Open);

        let write_task = tokio::spawn(async move {
            while let Some(line) = out_rx.recv().await {
                if let Err(e) = writer.write_all(line.as_bytes()).await {
                    warn!("[Signal] Write failed: {}", e);
                    break;
                }
            }
        });

        let shared = self.shared.clone();
        let read_task = tokio::spawn(async move {
            let mut lines = LineBuffer::default();
            let mut chunk = vec![0u8; 8192];
            loop {
                match reader.read(&mut chunk).await {
                    Ok(0) => break,
                    Ok(n) => {
                        for line in lines.push(&chunk[..n]) {
                            shared.on_line(generation, &line).await;
                        }
                    }
                    Err(e) => {
                        warn!("[Signal] Read failed: {}", e);
                        break;
                    }
                }
            }
            shared.on_socket_closed(generation);
        });

        let mut tasks = guard(&self.shared.tasks);
        tasks.push(write_task);
        tasks.push(read_task);
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
        let (id, rx) = {
            let mut pending = guard(&self.shared.pending);
            let id = pending.next_id();
            let rx = pending.register(id.clone(), timeout);
            (id, rx)
        };

        let request = json!({
            "jsonrpc": "2.0",
            "method": "send",
            "params": send_params(&self.shared.account, target, text),
            "id": id,
        });
        if out.send(format!("{}\n", request)).is_err() {
            guard(&self.shared.pending).remove(&id);
            return Err(TransportError::NotConnected);
        }

        match await_reply(&self.shared.pending, &id, rx, timeout).await {
            Ok(_) => {
                self.shared.link.emit_current(LinkEvent::Activity);
                info!("[Signal] Sent message to {}", target);
                Ok(())
            }
            Err(e) => {
                warn!("[Signal] Send to {} failed: {}", target, e);
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
