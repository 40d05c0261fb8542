use std::{
    collections::BTreeMap,
    sync::{
        Arc, Mutex, PoisonError,
        atomic::{AtomicU32, Ordering},
    },
    time::Duration,
};

use tokio::{io::WriteHalf, sync::watch, time::Instant};

use crate::netroxy::{
    net,
    tunnel::{
        protocol::{ClientCommand, FrameReader, FrameWriter, ProtocolError, ServerCommand, write_frame},
        session::MISSED_HEARTBEATS_LIMIT,
        splice::splice,
        transport::{BoxedStream, Transport, dial_with_timeout, tcp::TcpTransport},
    },
};

const LOGIN_TIMEOUT: Duration = Duration::from_secs(10);

type ClientWriter = FrameWriter<WriteHalf<BoxedStream>>;

#[derive(Debug, Clone)]
pub struct ClientOptions {
    pub name: String,
    pub server_addr: String,
    pub username: String,
    pub password: String,
    pub retry_interval: Duration,
    /// Zero disables the limit.
    pub dial_timeout: Duration,
}

/// A local service exposed on a public port of the server.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Target {
    pub local_addr: String,
    pub remote_port: u16,
    pub is_open: bool,
}

#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    #[error("dial {addr}: {cause:#}")]
    Dial { addr: String, cause: anyhow::Error },
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
    #[error("server rejected credentials")]
    AuthRejected,
    #[error("no auth reply within {0:?}")]
    LoginTimeout(Duration),
    #[error("unexpected {0}")]
    Unexpected(String),
    #[error("no heartbeat reply after {0} attempts")]
    HeartbeatExpired(u32),
    #[error("invalid local address {0:?}")]
    InvalidTarget(String),
}

struct ActiveSession {
    token: String,
    writer: Arc<ClientWriter>,
}

#[derive(Default)]
struct ClientState {
    targets: BTreeMap<u16, Target>,
    active: Option<Arc<ActiveSession>>,
}

/// Keeps one control session to the server alive and serves its tunnel requests.
pub struct Client {
    opts: ClientOptions,
    transport: Arc<dyn Transport>,
    state: Mutex<ClientState>,
}

impl Client {
    pub fn new(opts: ClientOptions, transport: Arc<dyn Transport>) -> Self {
        Self {
            opts,
            transport,
            state: Mutex::new(ClientState::default()),
        }
    }

    pub fn name(&self) -> &str {
        &self.opts.name
    }

    pub fn targets(&self) -> Vec<Target> {
        let st = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        st.targets.values().cloned().collect()
    }

    /// Token of the live session, if logged in.
    pub fn session_token(&self) -> Option<String> {
        let st = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        st.active.as_ref().map(|s| s.token.clone())
    }

    /// Registers `local_addr` for `remote_port`. A live session announces it
    /// right away; otherwise it goes out with the next login.
    pub async fn connect(
        &self,
        local_addr: &str,
        remote_port: u16,
        is_open: bool,
    ) -> Result<(), ClientError> {
        if net::split_host_port(local_addr).is_none() {
            return Err(ClientError::InvalidTarget(local_addr.to_string()));
        }
        let target = Target {
            local_addr: local_addr.trim().to_string(),
            remote_port,
            is_open,
        };
        let active = {
            let mut st = self.state.lock().unwrap_or_else(PoisonError::into_inner);
            st.targets.insert(remote_port, target.clone());
            st.active.clone()
        };
        if let Some(session) = active {
            session.writer.send(&map_command(&target)).await?;
        }
        Ok(())
    }

    /// Logs in and serves until shutdown, reconnecting after a fixed delay
    /// whenever the session fails.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) -> anyhow::Result<()> {
        if self.opts.server_addr.trim().is_empty() {
            anyhow::bail!("client: server address is required");
        }

        loop {
            if *shutdown.borrow() {
                return Ok(());
            }

            match self.run_once(shutdown.clone()).await {
                Ok(()) => return Ok(()),
                Err(err) => {
                    tracing::warn!(
                        client = %self.opts.name,
                        server = %self.opts.server_addr,
                        err = %err,
                        retry = %humantime::format_duration(self.opts.retry_interval),
                        "client: disconnected; retrying"
                    );
                }
            }

            tokio::select! {
                res = shutdown.changed() => {
                    if res.is_err() || *shutdown.borrow() {
                        return Ok(());
                    }
                }
                _ = tokio::time::sleep(self.opts.retry_interval) => {}
            }
        }
    }

    /// One session lifetime. `Ok` only when shutdown was requested.
    pub async fn run_once(&self, mut shutdown: watch::Receiver<bool>) -> Result<(), ClientError> {
        let addr = self.opts.server_addr.as_str();
        let conn = dial_with_timeout(self.transport.as_ref(), addr, self.opts.dial_timeout)
            .await
            .map_err(|cause| ClientError::Dial {
                addr: addr.to_string(),
                cause,
            })?;
        let (rd, wr) = tokio::io::split(conn);
        let mut reader = FrameReader::new(rd);
        let writer = Arc::new(FrameWriter::new(wr));

        let (timeout_secs, token) = self.login(&mut reader, &writer).await?;
        tracing::info!(
            client = %self.opts.name,
            server = %addr,
            transport = %self.transport.name(),
            timeout_secs,
            "client: logged in"
        );

        let session = Arc::new(ActiveSession { token, writer });
        let _active = ActiveGuard {
            state: &self.state,
            session: session.clone(),
        };
        self.announce(&session).await?;

        let misses = AtomicU32::new(0);
        let interval = Duration::from_secs(timeout_secs.max(1));
        let res = tokio::select! {
            _ = async { let _ = shutdown.wait_for(|s| *s).await; } => Ok(()),
            res = heartbeat(&session.writer, interval, &misses) => res,
            res = self.read_commands(&session, &mut reader, &misses) => res,
        };
        session.writer.shutdown().await;
        res
    }

    async fn login(
        &self,
        reader: &mut FrameReader<tokio::io::ReadHalf<BoxedStream>>,
        writer: &ClientWriter,
    ) -> Result<(u64, String), ClientError> {
        writer
            .send(&ClientCommand::Auth {
                name: self.opts.name.clone(),
                username: self.opts.username.clone(),
                password: self.opts.password.clone(),
            })
            .await?;
        let reply = tokio::time::timeout(LOGIN_TIMEOUT, reader.read_server_command())
            .await
            .map_err(|_| ClientError::LoginTimeout(LOGIN_TIMEOUT))??;
        match reply {
            ServerCommand::AuthAccepted {
                timeout_secs,
                token,
            } => Ok((timeout_secs, token)),
            ServerCommand::AuthRejected => Err(ClientError::AuthRejected),
            other => Err(ClientError::Unexpected(format!("{other:?} before login"))),
        }
    }

    /// Publishes the session and sends MAP for every registered target.
    async fn announce(&self, session: &Arc<ActiveSession>) -> Result<(), ClientError> {
        let targets: Vec<Target> = {
            let mut st = self.state.lock().unwrap_or_else(PoisonError::into_inner);
            st.active = Some(session.clone());
            st.targets.values().cloned().collect()
        };
        for t in &targets {
            session.writer.send(&map_command(t)).await?;
        }
        Ok(())
    }

    async fn read_commands(
        &self,
        session: &ActiveSession,
        reader: &mut FrameReader<tokio::io::ReadHalf<BoxedStream>>,
        misses: &AtomicU32,
    ) -> Result<(), ClientError> {
        loop {
            match reader.read_server_command().await? {
                ServerCommand::HeartbeatAck => misses.store(0, Ordering::Relaxed),
                ServerCommand::MapResult { remote_port, ok } => {
                    if ok {
                        tracing::info!(client = %self.opts.name, remote_port, "client: mapping accepted");
                    } else {
                        tracing::warn!(client = %self.opts.name, remote_port, "client: mapping refused");
                    }
                }
                ServerCommand::TunnelRequest { remote_port } => {
                    let target = {
                        let st = self.state.lock().unwrap_or_else(PoisonError::into_inner);
                        st.targets.get(&remote_port).cloned()
                    };
                    let Some(target) = target else {
                        tracing::warn!(client = %self.opts.name, remote_port, "client: tunnel request for unknown port");
                        continue;
                    };
                    let transport = self.transport.clone();
                    let server_addr = self.opts.server_addr.clone();
                    let dial_timeout = self.opts.dial_timeout;
                    let token = session.token.clone();
                    tokio::spawn(async move {
                        if let Err(err) =
                            open_tunnel(transport, &server_addr, dial_timeout, &token, &target).await
                        {
                            tracing::warn!(remote_port, target = %target.local_addr, err = %err, "client: tunnel abandoned");
                        }
                    });
                }
                other => return Err(ClientError::Unexpected(format!("{other:?}"))),
            }
        }
    }
}

fn map_command(t: &Target) -> ClientCommand {
    ClientCommand::Map {
        remote_port: t.remote_port,
        local_addr: t.local_addr.clone(),
        is_open: t.is_open,
    }
}

/// Counts a miss per tick and gives up once the limit is reached without an ack.
async fn heartbeat(
    writer: &ClientWriter,
    interval: Duration,
    misses: &AtomicU32,
) -> Result<(), ClientError> {
    let mut tick = tokio::time::interval_at(Instant::now() + interval, interval);
    tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    loop {
        tick.tick().await;
        let n = misses.fetch_add(1, Ordering::Relaxed) + 1;
        if n >= MISSED_HEARTBEATS_LIMIT {
            return Err(ClientError::HeartbeatExpired(n));
        }
        writer.send(&ClientCommand::Heartbeat).await?;
    }
}

/// Dials the server for a data connection, identifies it with TRS, then
/// splices it with a fresh connection to the local target.
pub async fn open_tunnel(
    transport: Arc<dyn Transport>,
    server_addr: &str,
    dial_timeout: Duration,
    token: &str,
    target: &Target,
) -> anyhow::Result<()> {
    let mut data = dial_with_timeout(transport.as_ref(), server_addr, dial_timeout).await?;
    write_frame(
        &mut data,
        &ClientCommand::TunnelReady {
            token: token.to_string(),
            remote_port: target.remote_port,
        },
    )
    .await?;

    let local = dial_with_timeout(&TcpTransport::new(), &target.local_addr, dial_timeout).await?;
    tracing::debug!(remote_port = target.remote_port, target = %target.local_addr, "client: tunnel open");
    let end = splice(data, local).await;
    if let Some(err) = end.error {
        tracing::debug!(remote_port = target.remote_port, err = %err, "client: tunnel ended with error");
    }
    Ok(())
}

struct ActiveGuard<'a> {
    state: &'a Mutex<ClientState>,
    session: Arc<ActiveSession>,
}

impl Drop for ActiveGuard<'_> {
    fn drop(&mut self) {
        let mut st = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        if st
            .active
            .as_ref()
            .is_some_and(|a| Arc::ptr_eq(a, &self.session))
        {
            st.active = None;
        }
    }
}

#[cfg(test)]
mod tests {
    use std::net::SocketAddr;

    use tokio::{
        io::{AsyncReadExt, AsyncWriteExt},
        net::{TcpListener, TcpStream},
    };

    use super::*;
    use crate::netroxy::tunnel::server::tests::{free_port, options, start};

    fn client_options(addr: SocketAddr) -> ClientOptions {
        ClientOptions {
            name: "box".into(),
            server_addr: addr.to_string(),
            username: "admin".into(),
            password: "secret".into(),
            retry_interval: Duration::from_millis(100),
            dial_timeout: Duration::from_secs(2),
        }
    }

    fn tcp() -> Arc<dyn Transport> {
        Arc::new(TcpTransport::new())
    }

    async fn echo_service() -> SocketAddr {
        let ln = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = ln.local_addr().unwrap();
        tokio::spawn(async move {
            while let Ok((mut c, _)) = ln.accept().await {
                tokio::spawn(async move {
                    let (mut r, mut w) = c.split();
                    let _ = tokio::io::copy(&mut r, &mut w).await;
                });
            }
        });
        addr
    }

    async fn eventually(mut cond: impl FnMut() -> bool) -> bool {
        for _ in 0..150 {
            if cond() {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        cond()
    }

    #[tokio::test]
    async fn public_traffic_reaches_local_service() {
        let (srv, addr, _stop) = start(options()).await;
        let local = echo_service().await;
        let port = free_port().await;

        let client = Arc::new(Client::new(client_options(addr), tcp()));
        client.connect(&local.to_string(), port, true).await.unwrap();

        let (tx, rx) = watch::channel(false);
        let runner = tokio::spawn({
            let client = client.clone();
            async move { client.run(rx).await }
        });
        assert!(eventually(|| srv.find_mapping(port).is_some()).await);

        let mut public = TcpStream::connect(("127.0.0.1", port)).await.unwrap();
        public.write_all(b"hello through the tunnel").await.unwrap();
        let mut buf = vec![0u8; 24];
        tokio::time::timeout(Duration::from_secs(5), public.read_exact(&mut buf))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(buf, b"hello through the tunnel");

        tx.send_replace(true);
        tokio::time::timeout(Duration::from_secs(5), runner)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert!(client.session_token().is_none());
    }

    #[tokio::test]
    async fn targets_added_after_login_are_mapped() {
        let (srv, addr, _stop) = start(options()).await;
        let client = Arc::new(Client::new(client_options(addr), tcp()));
        let (_tx, rx) = watch::channel(false);
        tokio::spawn({
            let client = client.clone();
            async move { client.run(rx).await }
        });
        assert!(eventually(|| client.session_token().is_some()).await);

        let port = free_port().await;
        client.connect("127.0.0.1:8000", port, false).await.unwrap();
        assert!(eventually(|| srv.find_mapping(port).is_some()).await);
        assert!(!srv.find_mapping(port).unwrap().is_enabled());
        assert_eq!(client.targets().len(), 1);
    }

    #[tokio::test]
    async fn bad_local_address_is_refused() {
        let client = Client::new(client_options("127.0.0.1:1".parse().unwrap()), tcp());
        assert!(matches!(
            client.connect("localhost", 9000, true).await,
            Err(ClientError::InvalidTarget(_))
        ));
        assert!(client.targets().is_empty());
    }

    #[tokio::test]
    async fn wrong_password_fails_login() {
        let (_srv, addr, _stop) = start(options()).await;
        let mut opts = client_options(addr);
        opts.password = "wrong".into();
        let client = Client::new(opts, tcp());
        let (_tx, rx) = watch::channel(false);
        assert!(matches!(
            client.run_once(rx).await,
            Err(ClientError::AuthRejected)
        ));
    }

    /// Accepts one client, logs it in with a one second heartbeat, then runs `script`.
    async fn fake_server<F, Fut>(script: F) -> SocketAddr
    where
        F: FnOnce(FrameReader<tokio::net::tcp::OwnedReadHalf>, tokio::net::tcp::OwnedWriteHalf) -> Fut
            + Send
            + 'static,
        Fut: std::future::Future<Output = ()> + Send,
    {
        let ln = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = ln.local_addr().unwrap();
        tokio::spawn(async move {
            let (c, _) = ln.accept().await.unwrap();
            let (r, mut w) = c.into_split();
            let mut r = FrameReader::new(r);
            assert!(matches!(
                r.read_client_command().await.unwrap(),
                ClientCommand::Auth { .. }
            ));
            write_frame(
                &mut w,
                &ServerCommand::AuthAccepted {
                    timeout_secs: 1,
                    token: "tok".into(),
                },
            )
            .await
            .unwrap();
            script(r, w).await;
        });
        addr
    }

    #[tokio::test]
    async fn silent_server_is_dropped_after_missed_heartbeats() {
        let addr = fake_server(|mut r, w| async move {
            let _w = w;
            while r.read_client_command().await.is_ok() {}
        })
        .await;
        let client = Client::new(client_options(addr), tcp());
        let (_tx, rx) = watch::channel(false);
        let res = tokio::time::timeout(Duration::from_secs(10), client.run_once(rx))
            .await
            .unwrap();
        assert!(matches!(
            res,
            Err(ClientError::HeartbeatExpired(MISSED_HEARTBEATS_LIMIT))
        ));
    }

    #[tokio::test]
    async fn unknown_tunnel_port_is_ignored_but_bad_command_closes() {
        let addr = fake_server(|r, mut w| async move {
            let _r = r;
            write_frame(&mut w, &ServerCommand::TunnelRequest { remote_port: 4242 })
                .await
                .unwrap();
            write_frame(
                &mut w,
                &ServerCommand::MapResult {
                    remote_port: 4242,
                    ok: false,
                },
            )
            .await
            .unwrap();
            write_frame(&mut w, &ServerCommand::AuthRejected).await.unwrap();
            tokio::time::sleep(Duration::from_secs(5)).await;
        })
        .await;
        let client = Client::new(client_options(addr), tcp());
        let (_tx, rx) = watch::channel(false);
        let res = tokio::time::timeout(Duration::from_secs(5), client.run_once(rx))
            .await
            .unwrap();
        assert!(matches!(res, Err(ClientError::Unexpected(_))));
    }

    #[tokio::test]
    async fn unreachable_local_target_abandons_only_the_tunnel() {
        let ln = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let server_addr = ln.local_addr().unwrap();
        let dead = free_port().await;
        let target = Target {
            local_addr: format!("127.0.0.1:{dead}"),
            remote_port: 9000,
            is_open: true,
        };

        let tunnel = tokio::spawn(async move {
            open_tunnel(
                tcp(),
                &server_addr.to_string(),
                Duration::from_secs(2),
                "tok",
                &target,
            )
            .await
        });

        let (c, _) = ln.accept().await.unwrap();
        let mut r = FrameReader::new(c);
        assert_eq!(
            r.read_client_command().await.unwrap(),
            ClientCommand::TunnelReady {
                token: "tok".into(),
                remote_port: 9000,
            }
        );
        assert!(tunnel.await.unwrap().is_err());
        assert!(r.read_string().await.is_err());
    }
}
