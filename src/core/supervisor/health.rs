use chrono::Utc;
use std::time::{Duration, Instant};
use tokio::task::JoinHandle;
use tracing::{info, warn};

use super::{ConnectionSupervisor, SessionState, terminate};

pub const MONITOR_PERIOD: Duration = Duration::from_secs(2 * 60);
pub const DEAD_CHECK_LIMIT: u32 = 5;

pub const WATCHDOG_PERIOD: Duration = Duration::from_secs(5 * 60);
pub const WATCHDOG_GRACE: Duration = Duration::from_secs(3 * 60);
pub const NEVER_OPEN_LIMIT: Duration = Duration::from_secs(5 * 60);
pub const IDLE_LIMIT: Duration = Duration::from_secs(15 * 60);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MonitorAction {
    Idle,
    Reconnect,
}

/// Counts consecutive checks that found the session neither open nor
/// already reconnecting.
#[derive(Debug, Default)]
pub struct HealthMonitor {
    dead_checks: u32,
}

impl HealthMonitor {
    pub fn tick(&mut self, state: SessionState) -> MonitorAction {
        match state {
            SessionState::Open => {
                self.dead_checks = 0;
                MonitorAction::Idle
            }
            SessionState::Reconnecting | SessionState::LoggedOut => MonitorAction::Idle,
            SessionState::Disconnected | SessionState::Connecting => {
                self.dead_checks += 1;
                if self.dead_checks >= DEAD_CHECK_LIMIT {
                    self.dead_checks = 0;
                    MonitorAction::Reconnect
                } else {
                    MonitorAction::Idle
                }
            }
        }
    }

    pub fn dead_checks(&self) -> u32 {
        self.dead_checks
    }
}

pub fn spawn_monitor(supervisor: ConnectionSupervisor) -> JoinHandle<()> {
    tokio::spawn(async move {
        let platform = supervisor.platform();
        let mut monitor = HealthMonitor::default();
        let mut ticker = tokio::time::interval(MONITOR_PERIOD);
        ticker.tick().await;
        loop {
            ticker.tick().await;
            let state = supervisor.state();
            let action = monitor.tick(state);
            match state {
                SessionState::Open => info!("[Monitor] {} connection healthy", platform),
                _ => info!(
                    "[Monitor] {} is {:?} (dead checks {}/{})",
                    platform,
                    state,
                    monitor.dead_checks(),
                    DEAD_CHECK_LIMIT
                ),
            }
            if action == MonitorAction::Reconnect {
                warn!("[Monitor] {} inactive too long, forcing reconnect", platform);
                supervisor.reconnect("inactive");
            }
        }
    })
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    Healthy,
    NeverConnected,
    Stale(Duration),
}

/// Last-resort restart decision.
///
/// `idle` is the time since the last recorded activity, `None` if there was
/// none.
pub fn watchdog_verdict(
    uptime: Duration,
    state: SessionState,
    ever_open: bool,
    idle: Option<Duration>,
) -> Verdict {
    if uptime < WATCHDOG_GRACE || state == SessionState::LoggedOut {
        return Verdict::Healthy;
    }
    if !ever_open {
        return if uptime > NEVER_OPEN_LIMIT {
            Verdict::NeverConnected
        } else {
            Verdict::Healthy
        };
    }
    match idle {
        Some(idle) if idle > IDLE_LIMIT => Verdict::Stale(idle),
        _ => Verdict::Healthy,
    }
}

pub fn spawn_watchdog(supervisor: ConnectionSupervisor, booted: Instant) -> JoinHandle<()> {
    tokio::spawn(async move {
        let platform = supervisor.platform();
        // First check one full period after start; the grace window is
        // enforced by the verdict against process uptime.
        let first = tokio::time::Instant::now() + WATCHDOG_PERIOD;
        let mut ticker = tokio::time::interval_at(first, WATCHDOG_PERIOD);
        loop {
            ticker.tick().await;
            let session = supervisor.session();
            let idle = session
                .last_activity_at
                .and_then(|at| (Utc::now() - at).to_std().ok());
            match watchdog_verdict(booted.elapsed(), session.state, session.ever_open, idle) {
                Verdict::Healthy => {}
                Verdict::NeverConnected => terminate(&format!(
                    "[Watchdog] {} never connected since boot",
                    platform
                )),
                Verdict::Stale(idle) => terminate(&format!(
                    "[Watchdog] {} silent for {}s",
                    platform,
                    idle.as_secs()
                )),
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    const MIN: u64 = 60;

    fn mins(m: u64) -> Duration {
        Duration::from_secs(m * MIN)
    }

    #[test]
    fn five_dead_checks_trigger_one_reconnect() {
        let mut monitor = HealthMonitor::default();
        for _ in 0..4 {
            assert_eq!(monitor.tick(SessionState::Disconnected), MonitorAction::Idle);
        }
        assert_eq!(monitor.tick(SessionState::Connecting), MonitorAction::Reconnect);
        assert_eq!(monitor.dead_checks(), 0);
    }

    #[test]
    fn open_resets_and_reconnecting_pauses_count() {
        let mut monitor = HealthMonitor::default();
        monitor.tick(SessionState::Disconnected);
        monitor.tick(SessionState::Disconnected);
        monitor.tick(SessionState::Reconnecting);
        assert_eq!(monitor.dead_checks(), 2);
        monitor.tick(SessionState::Open);
        assert_eq!(monitor.dead_checks(), 0);
    }

    #[test]
    fn logged_out_never_triggers() {
        let mut monitor = HealthMonitor::default();
        for _ in 0..20 {
            assert_eq!(monitor.tick(SessionState::LoggedOut), MonitorAction::Idle);
        }
    }

    #[tokio::test(start_paused = true)]
    async fn stuck_session_gets_exactly_one_inactive_reconnect() {
        use crate::core::supervisor::ReconnectPolicy;
        use crate::core::supervisor::tests::FakeTransport;
        use std::sync::Arc;
        use std::sync::atomic::Ordering;

        let fake = Arc::new(FakeTransport::default());
        let sup = ConnectionSupervisor::new(fake.clone(), ReconnectPolicy::Fixed(mins(60)));
        let monitor = spawn_monitor(sup.clone());

        // Dead checks land at 2, 4, 6 and 8 minutes.
        tokio::time::sleep(mins(9)).await;
        assert_eq!(sup.session().reconnect_attempts, 0);
        assert_eq!(sup.state(), SessionState::Disconnected);

        tokio::time::sleep(mins(2)).await;
        assert_eq!(sup.session().reconnect_attempts, 1);
        assert_eq!(sup.state(), SessionState::Reconnecting);

        // Reconnecting pauses the count, so nothing more fires.
        tokio::time::sleep(mins(20)).await;
        assert_eq!(sup.session().reconnect_attempts, 1);
        assert_eq!(fake.connects.load(Ordering::SeqCst), 0);
        monitor.abort();
    }

    #[test]
    fn watchdog_respects_grace() {
        assert_eq!(
            watchdog_verdict(mins(2), SessionState::Disconnected, false, None),
            Verdict::Healthy
        );
    }

    #[test]
    fn watchdog_restarts_when_never_connected() {
        assert_eq!(
            watchdog_verdict(mins(4), SessionState::Connecting, false, None),
            Verdict::Healthy
        );
        assert_eq!(
            watchdog_verdict(mins(6), SessionState::Connecting, false, None),
            Verdict::NeverConnected
        );
    }

    #[test]
    fn watchdog_restarts_on_stale_activity() {
        assert_eq!(
            watchdog_verdict(mins(60), SessionState::Open, true, Some(mins(14))),
            Verdict::Healthy
        );
        assert_eq!(
            watchdog_verdict(mins(60), SessionState::Reconnecting, true, Some(mins(16))),
            Verdict::Stale(mins(16))
        );
    }

    #[test]
    fn watchdog_leaves_logged_out_sessions_alone() {
        assert_eq!(
            watchdog_verdict(mins(60), SessionState::LoggedOut, true, Some(mins(50))),
            Verdict::Healthy
        );
    }
}
