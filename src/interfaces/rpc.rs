//! Plumbing shared by the stream transports: an incremental line reader, the
//! JSON-RPC frame classifier and the table correlating outgoing requests with
//! their responses.

use serde_json::Value;
use std::collections::VecDeque;
use std::sync::Mutex;
use std::time::{Duration, Instant};
use tokio::sync::oneshot;
use tracing::{debug, warn};

use super::TransportError;

pub const MAX_PENDING_REQUESTS: usize = 50;

pub type Reply = Result<Value, TransportError>;

/// Splits a byte stream into newline-terminated lines, keeping a trailing
/// partial line until the next chunk completes it.
#[derive(Debug, Default)]
pub struct LineBuffer {
    buf: Vec<u8>,
}

impl LineBuffer {
    pub fn push(&mut self, chunk: &[u8]) -> Vec<String> {
        self.buf.extend_from_slice(chunk);

        let mut lines = Vec::new();
        let mut start = 0;
        while let Some(offset) = self.buf[start..].iter().position(|b| *b == b'\n') {
            let end = start + offset;
            let raw = &self.buf[start..end];
            let raw = raw.strip_suffix(b"\r").unwrap_or(raw);
            if !raw.is_empty() {
                lines.push(String::from_utf8_lossy(raw).into_owned());
            }
            start = end + 1;
        }
        self.buf.drain(..start);
        lines
    }

    /// Bytes held back as an incomplete line.
    pub fn pending(&self) -> usize {
        self.buf.len()
    }
}

/// One parsed line of the RPC stream.
#[derive(Debug, PartialEq)]
pub enum Frame {
    /// Answer to a request we sent (has `id`, no `method`).
    Response {
        id: String,
        outcome: Result<Value, String>,
    },
    /// Unsolicited notification (has `method`, no `id`).
    Push { method: String, params: Value },
    /// Anything else, e.g. a request addressed to us.
    Other,
}

fn id_string(v: &Value) -> Option<String> {
    match v {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

pub fn classify(mut json: Value) -> Frame {
    let id = json.get("id").and_then(id_string);
    let method = json
        .get("method")
        .and_then(|m| m.as_str())
        .map(str::to_string);

    match (id, method) {
        (Some(id), None) => {
            if let Some(err) = json.get("error").filter(|e| !e.is_null()) {
                let message = err
                    .get("message")
                    .and_then(|m| m.as_str())
                    .map(str::to_string)
                    .unwrap_or_else(|| err.to_string());
                Frame::Response {
                    id,
                    outcome: Err(message),
                }
            } else {
                let result = json.get_mut("result").map(Value::take).unwrap_or(Value::Null);
                Frame::Response {
                    id,
                    outcome: Ok(result),
                }
            }
        }
        (None, Some(method)) => {
            let params = json.get_mut("params").map(Value::take).unwrap_or(Value::Null);
            Frame::Push { method, params }
        }
        _ => Frame::Other,
    }
}

struct PendingRequest {
    id: String,
    created_at: Instant,
    deadline: Instant,
    tx: oneshot::Sender<Reply>,
}

/// Outstanding requests awaiting a correlated response, oldest first.
pub struct PendingRequestTable {
    next_id: u64,
    capacity: usize,
    entries: VecDeque<PendingRequest>,
}

impl Default for PendingRequestTable {
    fn default() -> Self {
        Self::with_capacity(MAX_PENDING_REQUESTS)
    }
}

impl PendingRequestTable {
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            next_id: 0,
            capacity: capacity.max(1),
            entries: VecDeque::with_capacity(capacity),
        }
    }

    pub fn next_id(&mut self) -> String {
        self.next_id += 1;
        self.next_id.to_string()
    }

    /// Register a request. When the table is full the oldest unresolved
    /// entry is evicted and its caller fails with [`TransportError::Evicted`].
    pub fn register(&mut self, id: String, timeout: Duration) -> oneshot::Receiver<Reply> {
        let now = Instant::now();
        self.purge_expired(now);
        while self.entries.len() >= self.capacity {
            if let Some(oldest) = self.entries.pop_front() {
                warn!(
                    "Pending request table full, evicting request {} (age {:?})",
                    oldest.id,
                    oldest.created_at.elapsed()
                );
                let _ = oldest.tx.send(Err(TransportError::Evicted));
            }
        }

        let (tx, rx) = oneshot::channel();
        self.entries.push_back(PendingRequest {
            id,
            created_at: now,
            deadline: now + timeout,
            tx,
        });
        rx
    }

    /// Complete the request with `id`. Returns false when no such request is
    /// outstanding (already timed out, evicted, or never ours).
    pub fn resolve(&mut self, id: &str, reply: Reply) -> bool {
        match self.entries.iter().position(|p| p.id == id) {
            Some(idx) => {
                if let Some(entry) = self.entries.remove(idx) {
                    let _ = entry.tx.send(reply);
                }
                true
            }
            None => false,
        }
    }

    pub fn remove(&mut self, id: &str) -> bool {
        match self.entries.iter().position(|p| p.id == id) {
            Some(idx) => self.entries.remove(idx).is_some(),
            None => false,
        }
    }

    /// Drop entries whose deadline has passed without notifying their callers;
    /// the caller side reports its own timeout. Runs on every registration so
    /// abandoned entries never count against the capacity.
    pub fn purge_expired(&mut self, now: Instant) -> usize {
        let before = self.entries.len();
        self.entries.retain(|p| p.deadline > now);
        before - self.entries.len()
    }

    /// Fail every outstanding request, used when the connection goes away.
    pub fn fail_all(&mut self) {
        for entry in self.entries.drain(..) {
            let _ = entry.tx.send(Err(TransportError::Closed));
        }
    }

    pub fn contains(&self, id: &str) -> bool {
        self.entries.iter().any(|p| p.id == id)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Wait for the reply to `id`. On timeout the entry is removed from the table
/// and the wait is abandoned.
pub async fn await_reply(
    table: &Mutex<PendingRequestTable>,
    id: &str,
    rx: oneshot::Receiver<Reply>,
    timeout: Duration,
) -> Reply {
    match tokio::time::timeout(timeout, rx).await {
        Ok(Ok(reply)) => reply,
        Ok(Err(_)) => Err(TransportError::Closed),
        Err(_) => {
            if let Ok(mut t) = table.lock() {
                t.remove(id);
            }
            debug!("Request {} timed out after {:?}", id, timeout);
            Err(TransportError::Timeout(timeout))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn line_split_across_reads_is_reassembled() {
        let mut buf = LineBuffer::default();
        assert!(buf.push(br#"{"id":"1","res"#).is_empty());
        assert_eq!(buf.pending(), 14);

        let lines = buf.push(b"ult\":true}\n{\"method\":\"receive\"}\n{\"par");
        assert_eq!(
            lines,
            vec![
                r#"{"id":"1","result":true}"#.to_string(),
                r#"{"method":"receive"}"#.to_string()
            ]
        );
        assert_eq!(buf.pending(), 5);
    }

    #[test]
    fn blank_lines_and_crlf_are_ignored() {
        let mut buf = LineBuffer::default();
        let lines = buf.push(b"\n\r\n{\"a\":1}\r\n");
        assert_eq!(lines, vec![r#"{"a":1}"#.to_string()]);
        assert_eq!(buf.pending(), 0);
    }

    #[test]
    fn multibyte_char_split_across_reads() {
        let mut buf = LineBuffer::default();
        let text = "héllo\n".as_bytes();
        assert!(buf.push(&text[..2]).is_empty());
        assert_eq!(buf.push(&text[2..]), vec!["héllo".to_string()]);
    }

    #[test]
    fn classify_response_and_error() {
        let ok = classify(json!({"jsonrpc": "2.0", "id": "7", "result": {"timestamp": 1}}));
        assert_eq!(
            ok,
            Frame::Response {
                id: "7".into(),
                outcome: Ok(json!({"timestamp": 1}))
            }
        );

        let err = classify(json!({"id": 8, "error": {"code": -1, "message": "unknown recipient"}}));
        assert_eq!(
            err,
            Frame::Response {
                id: "8".into(),
                outcome: Err("unknown recipient".into())
            }
        );
    }

    #[test]
    fn classify_push_and_other() {
        let push = classify(json!({"jsonrpc": "2.0", "method": "receive", "params": {"x": 1}}));
        assert_eq!(
            push,
            Frame::Push {
                method: "receive".into(),
                params: json!({"x": 1})
            }
        );
        assert_eq!(classify(json!({"id": "1", "method": "ping"})), Frame::Other);
        assert_eq!(classify(json!({"data": 1})), Frame::Other);
    }

    #[test]
    fn ids_are_monotonic() {
        let mut table = PendingRequestTable::default();
        assert_eq!(table.next_id(), "1");
        assert_eq!(table.next_id(), "2");
        assert_eq!(table.next_id(), "3");
    }

    #[tokio::test]
    async fn fifty_first_request_evicts_oldest() {
        let mut table = PendingRequestTable::default();
        let mut receivers = Vec::new();
        for _ in 0..MAX_PENDING_REQUESTS {
            let id = table.next_id();
            receivers.push(table.register(id, Duration::from_secs(10)));
        }
        assert_eq!(table.len(), MAX_PENDING_REQUESTS);

        let id = table.next_id();
        let _newest = table.register(id.clone(), Duration::from_secs(10));
        assert_eq!(table.len(), MAX_PENDING_REQUESTS);
        assert!(!table.contains("1"));
        assert!(table.contains("2"));
        assert!(table.contains(&id));

        let first = receivers.remove(0).await.unwrap();
        assert!(matches!(first, Err(TransportError::Evicted)));
    }

    #[tokio::test]
    async fn resolve_delivers_and_removes() {
        let mut table = PendingRequestTable::default();
        let id = table.next_id();
        let rx = table.register(id.clone(), Duration::from_secs(10));

        assert!(table.resolve(&id, Ok(json!("done"))));
        assert!(table.is_empty());
        assert_eq!(rx.await.unwrap().unwrap(), json!("done"));
        assert!(!table.resolve(&id, Ok(Value::Null)));
    }

    #[tokio::test(start_paused = true)]
    async fn await_reply_times_out_and_removes_entry() {
        let table = Mutex::new(PendingRequestTable::default());
        let (id, rx) = {
            let mut t = table.lock().unwrap();
            let id = t.next_id();
            let rx = t.register(id.clone(), Duration::from_secs(10));
            (id, rx)
        };

        let reply = await_reply(&table, &id, rx, Duration::from_secs(10)).await;
        assert!(matches!(reply, Err(TransportError::Timeout(_))));
        assert!(table.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn fail_all_rejects_with_closed() {
        let mut table = PendingRequestTable::default();
        let id = table.next_id();
        let rx = table.register(id, Duration::from_secs(10));
        table.fail_all();
        assert!(matches!(rx.await.unwrap(), Err(TransportError::Closed)));
    }

    #[test]
    fn purge_drops_expired_entries() {
        let mut table = PendingRequestTable::default();
        let id = table.next_id();
        let _rx = table.register(id, Duration::from_secs(1));
        assert_eq!(table.purge_expired(Instant::now()), 0);
        assert_eq!(table.purge_expired(Instant::now() + Duration::from_secs(2)), 1);
    }
}
