use std::{path::PathBuf, sync::Arc, time::Duration};

use anyhow::Context;
use tokio::{sync::watch, task::JoinSet};

use crate::netroxy::{
    admin,
    config::{self, ClientConfig, Role, ServerConfig},
    logging, telemetry,
    tunnel::{
        client::{Client, ClientOptions},
        dashboard::ServerGroup,
        server::{Server, ServerOptions},
        supervisor::Supervisor,
        transport::{
            Transport, TransportListener,
            tcp::TcpTransport,
            tls::{TlsClientOptions, TlsServerOptions, TlsTransport},
        },
    },
};

type Tasks = JoinSet<anyhow::Result<()>>;

pub async fn run_server(config_path: Option<PathBuf>) -> anyhow::Result<()> {
    let resolved = config::resolve_config_path(config_path, Role::Server)?;
    let cfg = config::load_server_config(&resolved.path)
        .with_context(|| format!("load config: {}", resolved.path.display()))?;

    let _logrt = logging::init(&cfg.logging)?;

    tracing::info!(
        config = %resolved.path.display(),
        source = %resolved.source,
        listen_addr = %cfg.listen_addr(),
        tls = cfg.tls.enabled,
        timeout = %humantime::format_duration(cfg.timeout),
        admin_addr = %cfg.admin_addr,
        "netroxy: starting server"
    );

    let prom = telemetry::init_prometheus()?;
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let mut tasks = Tasks::new();
    let mut servers = Vec::new();

    let plain = Arc::new(Server::new(server_options(&cfg, "PlainServer", false)));
    let ln = TransportListener::bind(&cfg.listen_addr(), Arc::new(TcpTransport::new())).await?;
    spawn_server(&mut tasks, plain.clone(), ln, &shutdown_rx);
    servers.push(plain);

    if cfg.tls.enabled {
        let tr = TlsTransport::server(&TlsServerOptions {
            cert_file: cfg.tls.ca.clone(),
            key_file: cfg.tls.key.clone(),
        })?;
        let tls = Arc::new(Server::new(server_options(&cfg, "TLSServer", true)));
        let ln = TransportListener::bind(&cfg.tls_listen_addr(), Arc::new(tr)).await?;
        spawn_server(&mut tasks, tls.clone(), ln, &shutdown_rx);
        servers.push(tls);
    }

    if !cfg.admin_addr.is_empty() {
        let ln = admin::bind(&cfg.admin_addr).await?;
        let state = admin::AdminState {
            dashboard: Arc::new(ServerGroup::new(servers)),
            prometheus: Some(prom),
        };
        tasks.spawn(admin::serve(ln, state, shutdown_rx.clone()));
    }

    wait_and_drain(tasks, shutdown_tx).await
}

fn server_options(cfg: &ServerConfig, prefix: &str, tls: bool) -> ServerOptions {
    ServerOptions {
        name: format!("{prefix}-{}", telemetry::random_token(8)),
        tls,
        bind_ip: cfg.ip.clone(),
        username: cfg.username.clone(),
        password: cfg.password.clone(),
        timeout: cfg.timeout,
        tunnel_timeout: cfg.tunnel_timeout,
    }
}

fn spawn_server(
    tasks: &mut Tasks,
    server: Arc<Server>,
    ln: TransportListener,
    shutdown: &watch::Receiver<bool>,
) {
    tasks.spawn(server.clone().serve(ln, shutdown.clone()));
    let shutdown = shutdown.clone();
    tasks.spawn(async move {
        Supervisor::new(server).run(shutdown).await;
        Ok(())
    });
}

pub async fn run_client(config_path: Option<PathBuf>) -> anyhow::Result<()> {
    let resolved = config::resolve_config_path(config_path, Role::Client)?;
    let cfg = config::load_client_config(&resolved.path)
        .with_context(|| format!("load config: {}", resolved.path.display()))?;

    let _logrt = logging::init(&cfg.logging)?;

    tracing::info!(
        config = %resolved.path.display(),
        source = %resolved.source,
        name = %cfg.name,
        server = %cfg.server_addr(),
        tls = cfg.tls.enabled,
        connections = cfg.connections.len(),
        "netroxy: starting client"
    );

    let client = Arc::new(build_client(&cfg)?);
    for c in &cfg.connections {
        client
            .connect(&c.local_addr, c.remote_port, c.is_open)
            .await
            .with_context(|| format!("register {} -> :{}", c.local_addr, c.remote_port))?;
    }

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let mut tasks = Tasks::new();
    tasks.spawn(async move { client.run(shutdown_rx).await });

    wait_and_drain(tasks, shutdown_tx).await
}

fn build_client(cfg: &ClientConfig) -> anyhow::Result<Client> {
    let transport: Arc<dyn Transport> = if cfg.tls.enabled {
        Arc::new(TlsTransport::client(&TlsClientOptions {
            verify: cfg.tls.verify,
            server_name: cfg.tls.server_name.clone(),
            ca_file: cfg.tls.ca.clone(),
        })?)
    } else {
        Arc::new(TcpTransport::new())
    };
    Ok(Client::new(
        ClientOptions {
            name: cfg.name.clone(),
            server_addr: cfg.server_addr(),
            username: cfg.username.clone(),
            password: cfg.password.clone(),
            retry_interval: cfg.retry_interval,
            dial_timeout: cfg.dial_timeout,
        },
        transport,
    ))
}

/// Runs until Ctrl-C/SIGTERM or until a task fails, then stops everything.
async fn wait_and_drain(mut tasks: Tasks, shutdown_tx: watch::Sender<bool>) -> anyhow::Result<()> {
    let mut result = Ok(());
    tokio::select! {
        _ = shutdown_signal() => {
            tracing::info!("shutdown: signal");
        }
        res = tasks.join_next() => {
            match res {
                Some(Ok(Ok(()))) | None => {}
                Some(Ok(Err(err))) => result = Err(err),
                Some(Err(join_err)) => result = Err(join_err.into()),
            }
        }
    }
    let _ = shutdown_tx.send(true);

    // Hard cap so a stuck task cannot stall process exit.
    let drain = async { while tasks.join_next().await.is_some() {} };
    if tokio::time::timeout(Duration::from_secs(5), drain).await.is_err() {
        tracing::warn!("shutdown: tasks did not stop in time; aborting");
        tasks.abort_all();
        while tasks.join_next().await.is_some() {}
    }

    result
}

async fn shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{SignalKind, signal};

        match signal(SignalKind::terminate()) {
            Ok(mut term) => {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => {}
                    _ = term.recv() => {}
                }
            }
            Err(err) => {
                tracing::warn!(err = %err, "shutdown: SIGTERM handler unavailable");
                let _ = tokio::signal::ctrl_c().await;
            }
        }
    }

    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
}
