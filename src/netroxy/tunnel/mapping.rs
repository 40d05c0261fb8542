use std::{
    collections::{HashMap, VecDeque},
    net::SocketAddr,
    sync::{
        Arc, Mutex, PoisonError, RwLock,
        atomic::{AtomicBool, AtomicU64, Ordering},
    },
};

use tokio::sync::{oneshot, watch};

use crate::netroxy::{net, telemetry, tunnel::transport::BoxedStream};

/// One public port exposed on behalf of a session.
///
/// The listener itself lives in the broker task; the mapping only keeps the
/// signal that stops it and the queue of public connections waiting for
/// their data connection.
pub struct Mapping {
    local_ip: String,
    local_port: u16,
    remote_port: u16,
    listen_addr: SocketAddr,
    session_name: String,
    created_at_unix_ms: u64,
    enabled: AtomicBool,
    active_tunnels: AtomicU64,
    pending: Mutex<Pending>,
    stop: watch::Sender<bool>,
}

#[derive(Default)]
struct Pending {
    closed: bool,
    waiters: VecDeque<oneshot::Sender<BoxedStream>>,
}

impl std::fmt::Debug for Mapping {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Mapping")
            .field("remote_port", &self.remote_port)
            .field("target", &self.target_addr())
            .field("enabled", &self.is_enabled())
            .finish_non_exhaustive()
    }
}

impl Mapping {
    pub fn new(
        local_ip: String,
        local_port: u16,
        listen_addr: SocketAddr,
        session_name: String,
        enabled: bool,
    ) -> Self {
        let (stop, _) = watch::channel(false);
        Self {
            local_ip,
            local_port,
            remote_port: listen_addr.port(),
            listen_addr,
            session_name,
            created_at_unix_ms: telemetry::now_unix_ms(),
            enabled: AtomicBool::new(enabled),
            active_tunnels: AtomicU64::new(0),
            pending: Mutex::new(Pending::default()),
            stop,
        }
    }

    pub fn remote_port(&self) -> u16 {
        self.remote_port
    }

    pub fn listen_addr(&self) -> SocketAddr {
        self.listen_addr
    }

    pub fn target_addr(&self) -> String {
        net::join_host_port(&self.local_ip, self.local_port)
    }

    pub fn session_name(&self) -> &str {
        &self.session_name
    }

    pub fn created_at_unix_ms(&self) -> u64 {
        self.created_at_unix_ms
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::Acquire)
    }

    pub fn set_enabled(&self, on: bool) {
        self.enabled.store(on, Ordering::Release);
    }

    pub fn active_tunnels(&self) -> u64 {
        self.active_tunnels.load(Ordering::Relaxed)
    }

    pub(crate) fn tunnel_started(&self) {
        self.active_tunnels.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn tunnel_finished(&self) {
        self.active_tunnels.fetch_sub(1, Ordering::Relaxed);
    }

    /// Queues a public connection for the next data connection on this port.
    ///
    /// On a stopped mapping the returned receiver fails immediately.
    pub fn enqueue_waiter(&self) -> oneshot::Receiver<BoxedStream> {
        let (tx, rx) = oneshot::channel();
        let mut p = self.pending.lock().unwrap_or_else(PoisonError::into_inner);
        if !p.closed {
            p.waiters.retain(|w| !w.is_closed());
            p.waiters.push_back(tx);
        }
        rx
    }

    /// Hands a data connection to the oldest live waiter. Waiters that gave
    /// up (timed out or closed) are skipped. The connection comes back when
    /// nobody is waiting.
    pub fn deliver(&self, mut conn: BoxedStream) -> Result<(), BoxedStream> {
        let mut p = self.pending.lock().unwrap_or_else(PoisonError::into_inner);
        while let Some(w) = p.waiters.pop_front() {
            match w.send(conn) {
                Ok(()) => return Ok(()),
                Err(back) => conn = back,
            }
        }
        Err(conn)
    }

    pub fn pending_len(&self) -> usize {
        let p = self.pending.lock().unwrap_or_else(PoisonError::into_inner);
        p.waiters.iter().filter(|w| !w.is_closed()).count()
    }

    pub fn stop_signal(&self) -> watch::Receiver<bool> {
        self.stop.subscribe()
    }

    pub fn is_stopped(&self) -> bool {
        *self.stop.borrow()
    }

    /// Stops the broker and fails every queued waiter. Safe to call twice.
    pub fn stop(&self) {
        {
            let mut p = self.pending.lock().unwrap_or_else(PoisonError::into_inner);
            p.closed = true;
            p.waiters.clear();
        }
        self.stop.send_replace(true);
    }
}

#[derive(Debug, thiserror::Error)]
pub enum MappingError {
    #[error("port {0} is already mapped by this session")]
    Duplicate(u16),
    #[error("bind port {port}: {source}")]
    Bind {
        port: u16,
        #[source]
        source: std::io::Error,
    },
    #[error("invalid local address {0:?}")]
    InvalidTarget(String),
    #[error("remote port must be non-zero")]
    ZeroPort,
    #[error("session is closed")]
    SessionClosed,
}

/// Per-session registry of mappings keyed by remote port.
#[derive(Debug, Default)]
pub struct MappingRegistry {
    closed: AtomicBool,
    mappings: RwLock<HashMap<u16, Arc<Mapping>>>,
}

impl MappingRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&self, mapping: Arc<Mapping>) -> Result<(), MappingError> {
        let mut m = self
            .mappings
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        if self.closed.load(Ordering::Acquire) {
            return Err(MappingError::SessionClosed);
        }
        let port = mapping.remote_port();
        if m.contains_key(&port) {
            return Err(MappingError::Duplicate(port));
        }
        m.insert(port, mapping);
        Ok(())
    }

    pub fn remove(&self, remote_port: u16) -> Option<Arc<Mapping>> {
        let removed = self
            .mappings
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&remote_port);
        if let Some(m) = &removed {
            m.stop();
        }
        removed
    }

    pub fn get(&self, remote_port: u16) -> Option<Arc<Mapping>> {
        self.mappings
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&remote_port)
            .cloned()
    }

    pub fn contains(&self, remote_port: u16) -> bool {
        self.mappings
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .contains_key(&remote_port)
    }

    pub fn list(&self) -> Vec<Arc<Mapping>> {
        let mut out: Vec<Arc<Mapping>> = self
            .mappings
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .cloned()
            .collect();
        out.sort_by_key(|m| m.remote_port());
        out
    }

    pub fn len(&self) -> usize {
        self.mappings
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    /// Stops and removes every mapping. Later `add` calls fail, so a MAP
    /// racing with teardown cannot leave a listener behind.
    pub fn close(&self) -> usize {
        let drained: Vec<Arc<Mapping>> = {
            let mut m = self
                .mappings
                .write()
                .unwrap_or_else(PoisonError::into_inner);
            self.closed.store(true, Ordering::Release);
            m.drain().map(|(_, v)| v).collect()
        };
        for m in &drained {
            m.stop();
        }
        drained.len()
    }
}

#[cfg(test)]
mod tests {
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    use super::*;

    fn mapping(port: u16) -> Arc<Mapping> {
        Arc::new(Mapping::new(
            "127.0.0.1".into(),
            8000,
            SocketAddr::from(([127, 0, 0, 1], port)),
            "box".into(),
            true,
        ))
    }

    fn tagged_stream(tag: &'static [u8]) -> BoxedStream {
        let (mut a, b) = tokio::io::duplex(64);
        tokio::spawn(async move {
            let _ = a.write_all(tag).await;
        });
        Box::new(b)
    }

    async fn read_tag(mut st: BoxedStream) -> Vec<u8> {
        let mut buf = vec![0u8; 1];
        st.read_exact(&mut buf).await.unwrap();
        buf
    }

    #[tokio::test]
    async fn waiters_are_served_in_order() {
        let m = mapping(9000);
        let first = m.enqueue_waiter();
        let second = m.enqueue_waiter();

        assert!(m.deliver(tagged_stream(b"a")).is_ok());
        assert!(m.deliver(tagged_stream(b"b")).is_ok());

        assert_eq!(read_tag(first.await.unwrap()).await, b"a");
        assert_eq!(read_tag(second.await.unwrap()).await, b"b");
    }

    #[tokio::test]
    async fn abandoned_waiters_are_skipped() {
        let m = mapping(9000);
        let gone = m.enqueue_waiter();
        let live = m.enqueue_waiter();
        drop(gone);
        assert_eq!(m.pending_len(), 1);

        assert!(m.deliver(tagged_stream(b"x")).is_ok());
        assert_eq!(read_tag(live.await.unwrap()).await, b"x");
    }

    #[tokio::test]
    async fn delivery_without_waiter_returns_connection() {
        let m = mapping(9000);
        assert!(m.deliver(tagged_stream(b"x")).is_err());
    }

    #[tokio::test]
    async fn stop_fails_waiters_and_refuses_new_ones() {
        let m = mapping(9000);
        let w = m.enqueue_waiter();
        let mut stop = m.stop_signal();
        m.stop();
        m.stop();
        assert!(w.await.is_err());
        assert!(m.enqueue_waiter().await.is_err());
        assert!(*stop.borrow_and_update());
        assert!(m.is_stopped());
    }

    #[test]
    fn registry_rejects_duplicates_and_closes_everything() {
        let reg = MappingRegistry::new();
        reg.add(mapping(9001)).unwrap();
        reg.add(mapping(9000)).unwrap();
        assert!(matches!(
            reg.add(mapping(9000)),
            Err(MappingError::Duplicate(9000))
        ));
        let ports: Vec<u16> = reg.list().iter().map(|m| m.remote_port()).collect();
        assert_eq!(ports, vec![9000, 9001]);

        let kept = reg.get(9000).unwrap();
        assert_eq!(reg.close(), 2);
        assert!(kept.is_stopped());
        assert_eq!(reg.len(), 0);
        assert!(matches!(
            reg.add(mapping(9002)),
            Err(MappingError::SessionClosed)
        ));
    }

    #[test]
    fn remove_stops_only_that_mapping() {
        let reg = MappingRegistry::new();
        reg.add(mapping(9000)).unwrap();
        reg.add(mapping(9001)).unwrap();

        let removed = reg.remove(9000).unwrap();
        assert!(removed.is_stopped());
        assert!(reg.remove(9000).is_none());
        assert!(!reg.contains(9000));
        assert!(!reg.get(9001).unwrap().is_stopped());
        reg.add(mapping(9000)).unwrap();
    }

    #[test]
    fn enabled_flag_toggles() {
        let m = mapping(9000);
        assert!(m.is_enabled());
        m.set_enabled(false);
        assert!(!m.is_enabled());
        assert_eq!(m.target_addr(), "127.0.0.1:8000");
    }
}
