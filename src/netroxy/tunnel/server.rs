use std::{
    net::SocketAddr,
    sync::{Arc, OnceLock},
    time::Duration,
};

use dashmap::{DashMap, mapref::entry::Entry};
use tokio::{
    io::{ReadHalf, WriteHalf},
    net::TcpListener,
    sync::watch,
};

use crate::netroxy::{
    net,
    telemetry::{self, GaugeGuard},
    tunnel::{
        broker,
        mapping::{Mapping, MappingError},
        protocol::{ClientCommand, FrameReader, FrameWriter, ProtocolError, ServerCommand},
        session::{ControlSession, ControlWriter, MISSED_HEARTBEATS_LIMIT},
        transport::{BoxedStream, TransportListener},
    },
};

const TOKEN_LEN: usize = 32;
const WRITER_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(1);

type ControlReader = FrameReader<ReadHalf<BoxedStream>>;

#[derive(Debug, Clone)]
pub struct ServerOptions {
    pub name: String,
    pub tls: bool,
    /// Address public mapping listeners bind on.
    pub bind_ip: String,
    pub username: String,
    pub password: String,
    /// Heartbeat interval announced to clients.
    pub timeout: Duration,
    /// How long a public connection waits for its data connection. Zero waits forever.
    pub tunnel_timeout: Duration,
}

#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
    #[error("no command within {0:?}")]
    LoginTimeout(Duration),
    #[error("{0} before authentication")]
    NotAuthenticated(&'static str),
    #[error("bad credentials for {0:?}")]
    AuthFailed(String),
    #[error("{0} on an authenticated control connection")]
    Unexpected(&'static str),
    #[error("unknown session token")]
    UnknownToken,
    #[error("port {0} is not mapped by this session")]
    UnknownMapping(u16),
    #[error("no public connection waiting on port {0}")]
    NoPendingRequest(u16),
}

/// Accepts control and data connections on one listener and owns the
/// sessions authenticated through it.
pub struct Server {
    opts: ServerOptions,
    started_at_unix_ms: u64,
    listen_addr: OnceLock<SocketAddr>,
    sessions: DashMap<String, Arc<ControlSession>>,
}

impl Server {
    pub fn new(opts: ServerOptions) -> Self {
        Self {
            opts,
            started_at_unix_ms: telemetry::now_unix_ms(),
            listen_addr: OnceLock::new(),
            sessions: DashMap::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.opts.name
    }

    pub fn is_tls(&self) -> bool {
        self.opts.tls
    }

    pub fn timeout(&self) -> Duration {
        self.opts.timeout
    }

    pub fn started_at_unix_ms(&self) -> u64 {
        self.started_at_unix_ms
    }

    pub fn listen_addr(&self) -> Option<SocketAddr> {
        self.listen_addr.get().copied()
    }

    /// Live sessions ordered by login time.
    pub fn sessions(&self) -> Vec<Arc<ControlSession>> {
        let mut out: Vec<Arc<ControlSession>> =
            self.sessions.iter().map(|e| e.value().clone()).collect();
        out.sort_by(|a, b| {
            a.login_time_unix_ms()
                .cmp(&b.login_time_unix_ms())
                .then_with(|| a.name().cmp(b.name()))
        });
        out
    }

    pub fn session_by_token(&self, token: &str) -> Option<Arc<ControlSession>> {
        self.sessions.get(token).map(|e| e.value().clone())
    }

    pub fn session_by_name(&self, name: &str) -> Option<Arc<ControlSession>> {
        self.sessions
            .iter()
            .find(|e| e.value().name() == name)
            .map(|e| e.value().clone())
    }

    pub fn session_count(&self) -> usize {
        self.sessions.len()
    }

    /// Drops a session from the table, stops its mappings and signals its
    /// command loop to close the control connection.
    pub fn release(&self, session: &Arc<ControlSession>) {
        self.sessions
            .remove_if(session.token(), |_, v| Arc::ptr_eq(v, session));
        session.close();
        let n = session.mappings().close();
        if n > 0 {
            tracing::debug!(server = %self.opts.name, session = %session.name(), mappings = n, "tunnel: mappings released");
        }
    }

    pub fn close_all(&self) {
        for s in self.sessions() {
            self.release(&s);
        }
    }

    pub async fn serve(
        self: Arc<Self>,
        ln: TransportListener,
        mut shutdown: watch::Receiver<bool>,
    ) -> anyhow::Result<()> {
        if let Some(addr) = ln.local_addr() {
            let _ = self.listen_addr.set(addr);
        }
        tracing::info!(
            server = %self.opts.name,
            addr = ?self.listen_addr(),
            transport = %ln.transport().name(),
            "tunnel: listening"
        );

        loop {
            tokio::select! {
                res = shutdown.changed() => {
                    if res.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
                res = ln.accept() => {
                    let accepted = match res {
                        Ok(v) => v,
                        Err(err) => {
                            tracing::warn!(server = %self.opts.name, err = %err, "tunnel: accept failed");
                            tokio::time::sleep(Duration::from_millis(50)).await;
                            continue;
                        }
                    };
                    let srv = self.clone();
                    tokio::spawn(async move {
                        let peer = accepted.peer;
                        let conn = match accepted.finish().await {
                            Ok(c) => c,
                            Err(err) => {
                                tracing::debug!(server = %srv.opts.name, peer = %peer, err = %err, "tunnel: handshake failed");
                                return;
                            }
                        };
                        if let Err(err) = srv.handle_conn(conn, peer).await {
                            tracing::info!(server = %srv.opts.name, peer = %peer, err = %err, "tunnel: connection closed");
                        }
                    });
                }
            }
        }

        self.close_all();
        tracing::info!(server = %self.opts.name, "tunnel: stopped");
        Ok(())
    }

    async fn handle_conn(&self, conn: BoxedStream, peer: SocketAddr) -> Result<(), SessionError> {
        let (rd, wr) = tokio::io::split(conn);
        let mut reader = FrameReader::new(rd);
        let writer = FrameWriter::new(wr);

        let login_timeout = self.opts.timeout * MISSED_HEARTBEATS_LIMIT;
        let first = tokio::time::timeout(login_timeout, reader.read_client_command())
            .await
            .map_err(|_| SessionError::LoginTimeout(login_timeout))??;

        match first {
            ClientCommand::Auth {
                name,
                username,
                password,
            } => {
                if username != self.opts.username || password != self.opts.password {
                    metrics::counter!("netroxy_auth_failures_total").increment(1);
                    let _ = writer.send(&ServerCommand::AuthRejected).await;
                    writer.shutdown().await;
                    return Err(SessionError::AuthFailed(name));
                }
                self.run_session(reader, Arc::new(writer), name, peer).await
            }
            ClientCommand::TunnelReady { token, remote_port } => {
                self.attach_data_conn(reader, writer, &token, remote_port)
            }
            other => Err(SessionError::NotAuthenticated(other.verb())),
        }
    }

    fn register(&self, name: String, peer: SocketAddr, writer: Arc<ControlWriter>) -> Arc<ControlSession> {
        loop {
            let token = telemetry::random_token(TOKEN_LEN);
            if let Entry::Vacant(slot) = self.sessions.entry(token.clone()) {
                let session = Arc::new(ControlSession::new(
                    token,
                    name,
                    peer,
                    self.opts.timeout,
                    writer,
                ));
                slot.insert(session.clone());
                return session;
            }
        }
    }

    async fn run_session(
        &self,
        mut reader: ControlReader,
        writer: Arc<ControlWriter>,
        name: String,
        peer: SocketAddr,
    ) -> Result<(), SessionError> {
        let session = self.register(name, peer, writer.clone());
        let guard = SessionGuard {
            server: self,
            session: session.clone(),
            _active: GaugeGuard::new("netroxy_sessions_active"),
        };
        tracing::info!(server = %self.opts.name, session = %session.name(), peer = %peer, "tunnel: client logged in");

        // Closing the session abandons the command loop even mid-write, so
        // a client that stopped reading cannot keep it alive.
        let mut closed = session.closed_signal();
        let res = tokio::select! {
            res = async {
                session
                    .send(&ServerCommand::AuthAccepted {
                        timeout_secs: self.opts.timeout.as_secs(),
                        token: session.token().to_string(),
                    })
                    .await?;
                self.command_loop(&session, &mut reader).await
            } => res,
            _ = async { let _ = closed.wait_for(|c| *c).await; } => Ok(()),
        };

        drop(guard);
        if tokio::time::timeout(WRITER_SHUTDOWN_TIMEOUT, writer.shutdown())
            .await
            .is_err()
        {
            tracing::debug!(server = %self.opts.name, session = %session.name(), "tunnel: control writer did not shut down in time");
        }
        tracing::info!(server = %self.opts.name, session = %session.name(), peer = %peer, "tunnel: client logged out");
        res
    }

    async fn command_loop(
        &self,
        session: &Arc<ControlSession>,
        reader: &mut ControlReader,
    ) -> Result<(), SessionError> {
        loop {
            match reader.read_client_command().await {
                Ok(ClientCommand::Heartbeat) => {
                    session.refresh_deadline();
                    session.send(&ServerCommand::HeartbeatAck).await?;
                }
                Ok(ClientCommand::Map {
                    remote_port,
                    local_addr,
                    is_open,
                }) => {
                    let ok = match self
                        .open_mapping(session, remote_port, &local_addr, is_open)
                        .await
                    {
                        Ok(m) => {
                            tracing::info!(
                                server = %self.opts.name,
                                session = %session.name(),
                                remote_port,
                                target = %m.target_addr(),
                                enabled = is_open,
                                "tunnel: mapping added"
                            );
                            true
                        }
                        Err(err) => {
                            tracing::warn!(server = %self.opts.name, session = %session.name(), remote_port, err = %err, "tunnel: mapping refused");
                            false
                        }
                    };
                    session
                        .send(&ServerCommand::MapResult { remote_port, ok })
                        .await?;
                }
                Ok(other) => return Err(SessionError::Unexpected(other.verb())),
                Err(ProtocolError::Eof) => return Ok(()),
                Err(err) => return Err(err.into()),
            }
        }
    }

    async fn open_mapping(
        &self,
        session: &Arc<ControlSession>,
        remote_port: u16,
        local_addr: &str,
        is_open: bool,
    ) -> Result<Arc<Mapping>, MappingError> {
        if remote_port == 0 {
            return Err(MappingError::ZeroPort);
        }
        let (local_ip, local_port) = net::split_host_port(local_addr)
            .ok_or_else(|| MappingError::InvalidTarget(local_addr.to_string()))?;
        if session.mappings().contains(remote_port) {
            return Err(MappingError::Duplicate(remote_port));
        }

        let bind_addr = net::join_host_port(&self.opts.bind_ip, remote_port);
        let ln = TcpListener::bind(bind_addr.as_str())
            .await
            .map_err(|source| MappingError::Bind {
                port: remote_port,
                source,
            })?;
        let listen_addr = ln.local_addr().map_err(|source| MappingError::Bind {
            port: remote_port,
            source,
        })?;

        let mapping = Arc::new(Mapping::new(
            local_ip,
            local_port,
            listen_addr,
            session.name().to_string(),
            is_open,
        ));
        session.mappings().add(mapping.clone())?;
        tokio::spawn(broker::run(
            ln,
            mapping.clone(),
            session.writer(),
            self.opts.tunnel_timeout,
        ));
        Ok(mapping)
    }

    /// Pairs a data connection with the oldest public connection waiting on
    /// the same port. Bytes the client sent right after its TRS frame are kept.
    fn attach_data_conn(
        &self,
        reader: ControlReader,
        writer: FrameWriter<WriteHalf<BoxedStream>>,
        token: &str,
        remote_port: u16,
    ) -> Result<(), SessionError> {
        let session = self
            .session_by_token(token)
            .ok_or(SessionError::UnknownToken)?;
        let mapping = session
            .mappings()
            .get(remote_port)
            .ok_or(SessionError::UnknownMapping(remote_port))?;

        let stream: BoxedStream = Box::new(tokio::io::join(reader.into_inner(), writer.into_inner()));
        mapping
            .deliver(stream)
            .map_err(|_| SessionError::NoPendingRequest(remote_port))?;
        tracing::debug!(server = %self.opts.name, session = %session.name(), remote_port, "tunnel: data connection attached");
        Ok(())
    }
}

/// Tears a session down when its command loop exits, whichever way it exits.
struct SessionGuard<'a> {
    server: &'a Server,
    session: Arc<ControlSession>,
    _active: GaugeGuard,
}

impl Drop for SessionGuard<'_> {
    fn drop(&mut self) {
        self.server.release(&self.session);
    }
}
