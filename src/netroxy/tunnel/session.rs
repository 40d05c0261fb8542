use std::{
    net::SocketAddr,
    sync::{Arc, Mutex, PoisonError},
    time::Duration,
};

use tokio::{io::WriteHalf, sync::watch, time::Instant};

use crate::netroxy::{
    telemetry,
    tunnel::{
        mapping::MappingRegistry,
        protocol::{FrameWriter, ProtocolError, ServerCommand},
        transport::BoxedStream,
    },
};

pub type ControlWriter = FrameWriter<WriteHalf<BoxedStream>>;

/// Heartbeat intervals a session may stay silent before it expires. Clients
/// give up on the server after the same number of unanswered heartbeats.
pub const MISSED_HEARTBEATS_LIMIT: u32 = 3;

/// Server-side state of one authenticated control connection.
pub struct ControlSession {
    token: String,
    name: String,
    peer: SocketAddr,
    login_time_unix_ms: u64,
    heartbeat_interval: Duration,
    expire_at: Mutex<Instant>,
    writer: Arc<ControlWriter>,
    mappings: MappingRegistry,
    closed: watch::Sender<bool>,
}

impl std::fmt::Debug for ControlSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ControlSession")
            .field("name", &self.name)
            .field("peer", &self.peer)
            .finish_non_exhaustive()
    }
}

impl ControlSession {
    pub fn new(
        token: String,
        name: String,
        peer: SocketAddr,
        heartbeat_interval: Duration,
        writer: Arc<ControlWriter>,
    ) -> Self {
        let (closed, _) = watch::channel(false);
        let s = Self {
            token,
            name,
            peer,
            login_time_unix_ms: telemetry::now_unix_ms(),
            heartbeat_interval,
            expire_at: Mutex::new(Instant::now()),
            writer,
            mappings: MappingRegistry::new(),
            closed,
        };
        s.refresh_deadline();
        s
    }

    pub fn token(&self) -> &str {
        &self.token
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn peer(&self) -> SocketAddr {
        self.peer
    }

    pub fn login_time_unix_ms(&self) -> u64 {
        self.login_time_unix_ms
    }

    pub fn heartbeat_interval(&self) -> Duration {
        self.heartbeat_interval
    }

    pub fn mappings(&self) -> &MappingRegistry {
        &self.mappings
    }

    pub fn writer(&self) -> Arc<ControlWriter> {
        self.writer.clone()
    }

    pub fn expire_at(&self) -> Instant {
        *self.expire_at.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Pushes the expiry out by the allowed number of missed heartbeats.
    pub fn refresh_deadline(&self) {
        let next = Instant::now() + self.heartbeat_interval * MISSED_HEARTBEATS_LIMIT;
        *self.expire_at.lock().unwrap_or_else(PoisonError::into_inner) = next;
    }

    pub fn is_expired(&self, now: Instant) -> bool {
        now >= self.expire_at()
    }

    pub async fn send(&self, cmd: &ServerCommand) -> Result<(), ProtocolError> {
        self.writer.send(cmd).await
    }

    /// Asks the session's command loop to drop the control connection.
    /// Idempotent.
    pub fn close(&self) {
        self.closed.send_replace(true);
    }

    pub fn is_closed(&self) -> bool {
        *self.closed.borrow()
    }

    pub fn closed_signal(&self) -> watch::Receiver<bool> {
        self.closed.subscribe()
    }
}
