pub mod health;

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rand::Rng;
use serde::{Serialize, Serializer};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::core::lifecycle::LifecycleComponent;
use crate::interfaces::{LinkEvent, LinkSender, LinkSignal, Platform, Transport, guard};

/// Upper bound on a single `Transport::connect` call.
pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionState {
    Disconnected,
    Connecting,
    Open,
    Reconnecting,
    /// Terminal: the account was unlinked and needs manual re-pairing.
    LoggedOut,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Session {
    pub state: SessionState,
    pub reconnect_attempts: u32,
    pub last_connected_at: Option<DateTime<Utc>>,
    pub last_activity_at: Option<DateTime<Utc>>,
    pub reconnect_locked: bool,
    /// Whether the session has reached `Open` at least once since boot.
    pub ever_open: bool,
}

impl Default for Session {
    fn default() -> Self {
        Self {
            state: SessionState::Disconnected,
            reconnect_attempts: 0,
            last_connected_at: None,
            last_activity_at: None,
            reconnect_locked: false,
            ever_open: false,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReconnectPolicy {
    /// `min(base * 2^attempts, cap)` plus up to half of that again as jitter.
    Exponential { base: Duration, cap: Duration },
    Fixed(Duration),
}

impl ReconnectPolicy {
    pub fn exponential() -> Self {
        ReconnectPolicy::Exponential {
            base: Duration::from_secs(5),
            cap: Duration::from_secs(60),
        }
    }

    pub fn delay<R: Rng + ?Sized>(&self, attempts: u32, rng: &mut R) -> Duration {
        match *self {
            ReconnectPolicy::Fixed(delay) => delay,
            ReconnectPolicy::Exponential { base, cap } => {
                let scaled = base.saturating_mul(2u32.saturating_pow(attempts)).min(cap);
                let max_jitter = scaled.as_millis() as u64 / 2;
                scaled + Duration::from_millis(rng.gen_range(0..=max_jitter))
            }
        }
    }
}

/// Point-in-time view of one transport, served by the status endpoint.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TransportStatus {
    pub platform: Platform,
    pub state: SessionState,
    pub healthy: bool,
    pub reconnecting: bool,
    pub reconnect_attempts: u32,
    pub pending_requests: usize,
    #[serde(serialize_with = "rfc3339_or_never")]
    pub last_activity: Option<DateTime<Utc>>,
    #[serde(serialize_with = "rfc3339_or_never")]
    pub last_connected: Option<DateTime<Utc>>,
}

fn rfc3339_or_never<S: Serializer>(
    at: &Option<DateTime<Utc>>,
    serializer: S,
) -> Result<S::Ok, S::Error> {
    match at {
        Some(at) => serializer.serialize_str(&at.to_rfc3339()),
        None => serializer.serialize_str("never"),
    }
}

/// Log and terminate so an external process supervisor restarts us.
pub fn terminate(reason: &str) -> ! {
    error!("{}, exiting for restart", reason);
    std::process::exit(1)
}

struct Inner {
    transport: Arc<dyn Transport>,
    policy: ReconnectPolicy,
    session: Mutex<Session>,
    generation: AtomicU64,
    link_tx: LinkSender,
    link_rx: Mutex<Option<mpsc::UnboundedReceiver<LinkSignal>>>,
    timer: Mutex<Option<JoinHandle<()>>>,
    event_loop: Mutex<Option<JoinHandle<()>>>,
}

/// Owns one transport's [`Session`]: connects it, watches its link events
/// and reconnects it when it dies.
#[derive(Clone)]
pub struct ConnectionSupervisor {
    inner: Arc<Inner>,
}

impl ConnectionSupervisor {
    pub fn new(transport: Arc<dyn Transport>, policy: ReconnectPolicy) -> Self {
        let (link_tx, link_rx) = mpsc::unbounded_channel();
        Self {
            inner: Arc::new(Inner {
                transport,
                policy,
                session: Mutex::new(Session::default()),
                generation: AtomicU64::new(0),
                link_tx,
                link_rx: Mutex::new(Some(link_rx)),
                timer: Mutex::new(None),
                event_loop: Mutex::new(None),
            }),
        }
    }

    pub fn platform(&self) -> Platform {
        self.inner.transport.platform()
    }

    pub fn transport(&self) -> Arc<dyn Transport> {
        self.inner.transport.clone()
    }

    pub fn session(&self) -> Session {
        guard(&self.inner.session).clone()
    }

    pub fn state(&self) -> SessionState {
        guard(&self.inner.session).state
    }

    fn current_generation(&self) -> u64 {
        self.inner.generation.load(Ordering::SeqCst)
    }

    fn replace_timer(&self, task: Option<JoinHandle<()>>) {
        if let Some(old) = std::mem::replace(&mut *guard(&self.inner.timer), task) {
            old.abort();
        }
    }

    /// Request a reconnection. Returns `false` when the request was dropped
    /// because one is already in progress or the session is logged out.
    pub fn reconnect(&self, reason: &str) -> bool {
        let platform = self.platform();
        let delay = {
            let mut session = guard(&self.inner.session);
            if session.state == SessionState::LoggedOut {
                info!("[{}] Logged out, ignoring reconnect ({})", platform, reason);
                return false;
            }
            if session.reconnect_locked {
                info!(
                    "[{}] Reconnect already in progress, ignoring ({})",
                    platform, reason
                );
                return false;
            }
            session.reconnect_locked = true;
            session.state = SessionState::Reconnecting;
            let delay = self
                .inner
                .policy
                .delay(session.reconnect_attempts, &mut rand::thread_rng());
            session.reconnect_attempts += 1;
            warn!(
                "[{}] Reconnecting in {}ms (attempt {}, reason: {})",
                platform,
                delay.as_millis(),
                session.reconnect_attempts,
                reason
            );
            delay
        };

        // Anything the dead connection still reports is stale from here on.
        self.inner.generation.fetch_add(1, Ordering::SeqCst);

        let this = self.clone();
        self.replace_timer(Some(tokio::spawn(async move {
            this.inner.transport.disconnect().await;
            tokio::time::sleep(delay).await;
            this.establish().await;
        })));
        true
    }

    /// Start a new connection generation. Failures are fed back as a close
    /// event of that generation.
    pub async fn establish(&self) {
        let platform = self.platform();
        let generation = self.inner.generation.fetch_add(1, Ordering::SeqCst) + 1;
        guard(&self.inner.session).state = SessionState::Connecting;
        info!("[{}] Connecting (generation {})", platform, generation);

        let attempt = tokio::time::timeout(
            CONNECT_TIMEOUT,
            self.inner
                .transport
                .connect(generation, self.inner.link_tx.clone()),
        )
        .await;

        let failure = match attempt {
            Ok(Ok(())) => return,
            Ok(Err(e)) => e.to_string(),
            Err(_) => format!("no connection within {:?}", CONNECT_TIMEOUT),
        };
        warn!("[{}] Connection attempt failed: {}", platform, failure);
        let _ = self.inner.link_tx.send(LinkSignal {
            generation,
            event: LinkEvent::Closed { code: None },
        });
    }

    pub(crate) fn handle(&self, signal: LinkSignal) {
        let platform = self.platform();
        if signal.generation != self.current_generation() {
            debug!(
                "[{}] Ignoring {:?} from stale generation {}",
                platform, signal.event, signal.generation
            );
            return;
        }

        match signal.event {
            LinkEvent::Open => {
                let mut session = guard(&self.inner.session);
                let now = Utc::now();
                session.state = SessionState::Open;
                session.reconnect_attempts = 0;
                session.last_connected_at = Some(now);
                session.last_activity_at = Some(now);
                session.reconnect_locked = false;
                session.ever_open = true;
                info!("[{}] Connection open", platform);
            }
            LinkEvent::Activity => {
                guard(&self.inner.session).last_activity_at = Some(Utc::now());
            }
            LinkEvent::Closed { code } => {
                {
                    let mut session = guard(&self.inner.session);
                    if session.state == SessionState::LoggedOut {
                        return;
                    }
                    session.reconnect_locked = false;
                    session.state = SessionState::Disconnected;
                }
                warn!("[{}] Connection closed (code {:?})", platform, code);
                self.reconnect("closed");
            }
            LinkEvent::LoggedOut => {
                {
                    let mut session = guard(&self.inner.session);
                    session.state = SessionState::LoggedOut;
                    session.reconnect_locked = false;
                }
                error!(
                    "[{}] Session logged out. Re-pair the device to continue.",
                    platform
                );
                self.inner.generation.fetch_add(1, Ordering::SeqCst);
                let transport = self.inner.transport.clone();
                self.replace_timer(Some(tokio::spawn(async move {
                    transport.disconnect().await;
                })));
            }
            LinkEvent::Fault(e) if e.is_fatal() => {
                terminate(&format!("[{}] {}", platform, e));
            }
            LinkEvent::Fault(e) => {
                warn!("[{}] {}", platform, e);
                guard(&self.inner.session).reconnect_locked = false;
                self.reconnect("transport fault");
            }
        }
    }

    pub fn health_snapshot(&self) -> TransportStatus {
        let session = self.session();
        let link = self.inner.transport.health_snapshot();
        TransportStatus {
            platform: self.platform(),
            state: session.state,
            healthy: session.state == SessionState::Open && link.socket_open,
            reconnecting: session.reconnect_locked
                || session.state == SessionState::Reconnecting,
            reconnect_attempts: session.reconnect_attempts,
            pending_requests: link.pending_requests,
            last_activity: session.last_activity_at,
            last_connected: session.last_connected_at,
        }
    }

    fn spawn_event_loop(&self) {
        let Some(mut rx) = guard(&self.inner.link_rx).take() else {
            return;
        };
        let this = self.clone();
        let task = tokio::spawn(async move {
            while let Some(signal) = rx.recv().await {
                this.handle(signal);
            }
        });
        *guard(&self.inner.event_loop) = Some(task);
    }
}

#[async_trait]
impl LifecycleComponent for ConnectionSupervisor {
    async fn on_start(&mut self) -> Result<()> {
        self.spawn_event_loop();
        let this = self.clone();
        self.replace_timer(Some(tokio::spawn(async move {
            this.establish().await;
        })));
        info!("[{}] Supervisor started", self.platform());
        Ok(())
    }

    async fn on_shutdown(&mut self) -> Result<()> {
        if let Some(task) = guard(&self.inner.event_loop).take() {
            task.abort();
        }
        self.replace_timer(None);
        self.inner.generation.fetch_add(1, Ordering::SeqCst);
        self.inner.transport.disconnect().await;
        guard(&self.inner.session).state = SessionState::Disconnected;
        info!("[{}] Supervisor stopped", self.platform());
        Ok(())
    }
}
