use std::{sync::Arc, time::Duration};

use tokio::{sync::watch, time::Instant};

use crate::netroxy::tunnel::server::Server;

const MIN_PERIOD: Duration = Duration::from_secs(1);

/// Sweep period for a heartbeat interval: a third of it, but at least a second.
pub fn period_for(timeout: Duration) -> Duration {
    (timeout / 3).max(MIN_PERIOD)
}

/// Closes every session whose deadline has passed and returns how many.
/// The session's own teardown removes it from the table.
pub fn sweep(server: &Server, now: Instant) -> usize {
    let mut expired = 0;
    for s in server.sessions() {
        if s.is_closed() || !s.is_expired(now) {
            continue;
        }
        tracing::warn!(
            server = %server.name(),
            session = %s.name(),
            peer = %s.peer(),
            "supervisor: session missed its heartbeats"
        );
        metrics::counter!("netroxy_sessions_expired_total").increment(1);
        s.close();
        expired += 1;
    }
    expired
}

/// Periodically expires silent sessions of one server.
pub struct Supervisor {
    server: Arc<Server>,
    period: Duration,
}

impl Supervisor {
    pub fn new(server: Arc<Server>) -> Self {
        let period = period_for(server.timeout());
        Self { server, period }
    }

    pub fn with_period(mut self, period: Duration) -> Self {
        self.period = period;
        self
    }

    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        let mut tick = tokio::time::interval_at(Instant::now() + self.period, self.period);
        tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        tracing::debug!(server = %self.server.name(), period = ?self.period, "supervisor: started");

        loop {
            tokio::select! {
                res = shutdown.changed() => {
                    if res.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
                now = tick.tick() => {
                    let n = sweep(&self.server, now);
                    if n > 0 {
                        tracing::info!(server = %self.server.name(), expired = n, "supervisor: sweep");
                    }
                }
            }
        }
    }
}
