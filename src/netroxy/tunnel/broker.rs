use std::{net::SocketAddr, sync::Arc, time::Duration};

use tokio::{
    io::AsyncWriteExt,
    net::{TcpListener, TcpStream},
};

use crate::netroxy::{
    telemetry::GaugeGuard,
    tunnel::{
        mapping::Mapping,
        protocol::{ProtocolError, ServerCommand},
        session::ControlWriter,
        splice::splice,
    },
};

#[derive(Debug, thiserror::Error)]
pub enum TunnelError {
    #[error("mapping is disabled")]
    Disabled,
    #[error("send tunnel request: {0}")]
    Request(#[from] ProtocolError),
    #[error("no data connection within {0:?}")]
    Timeout(Duration),
    #[error("mapping closed while waiting for data connection")]
    Closed,
}

/// Accepts public connections for one mapping until the mapping is stopped.
/// Dropping the listener on return releases the port.
pub async fn run(
    ln: TcpListener,
    mapping: Arc<Mapping>,
    control: Arc<ControlWriter>,
    tunnel_timeout: Duration,
) {
    let mut stop = mapping.stop_signal();
    let port = mapping.remote_port();
    tracing::info!(remote_port = port, target = %mapping.target_addr(), "broker: listening");

    loop {
        tokio::select! {
            _ = async { let _ = stop.wait_for(|s| *s).await; } => break,
            res = ln.accept() => {
                let (conn, peer) = match res {
                    Ok(v) => v,
                    Err(err) => {
                        tracing::warn!(remote_port = port, err = %err, "broker: accept failed");
                        tokio::time::sleep(Duration::from_millis(50)).await;
                        continue;
                    }
                };
                let mapping = mapping.clone();
                let control = control.clone();
                tokio::spawn(async move {
                    if let Err(err) = forward(conn, peer, &mapping, &control, tunnel_timeout).await {
                        tracing::info!(remote_port = mapping.remote_port(), peer = %peer, err = %err, "broker: tunnel not established");
                    }
                });
            }
        }
    }

    tracing::info!(remote_port = port, "broker: stopped");
}

async fn forward(
    mut conn: TcpStream,
    peer: SocketAddr,
    mapping: &Mapping,
    control: &ControlWriter,
    tunnel_timeout: Duration,
) -> Result<(), TunnelError> {
    let port = mapping.remote_port();
    if !mapping.is_enabled() {
        metrics::counter!("netroxy_tunnel_rejected_total").increment(1);
        let _ = conn.shutdown().await;
        return Err(TunnelError::Disabled);
    }
    tracing::debug!(remote_port = port, peer = %peer, "broker: public connection");

    let waiter = mapping.enqueue_waiter();
    // A client that stops reading must not pin this task past teardown.
    let mut stop = mapping.stop_signal();
    let request = ServerCommand::TunnelRequest { remote_port: port };
    tokio::select! {
        res = control.send(&request) => res?,
        _ = async { let _ = stop.wait_for(|s| *s).await; } => return Err(TunnelError::Closed),
    }

    let data = if tunnel_timeout > Duration::from_millis(0) {
        tokio::time::timeout(tunnel_timeout, waiter)
            .await
            .map_err(|_| TunnelError::Timeout(tunnel_timeout))?
    } else {
        waiter.await
    }
    .map_err(|_| TunnelError::Closed)?;

    let _ = conn.set_nodelay(true);
    metrics::counter!("netroxy_tunnels_total").increment(1);
    let _active = GaugeGuard::new("netroxy_tunnels_active");
    mapping.tunnel_started();
    tracing::info!(remote_port = port, peer = %peer, target = %mapping.target_addr(), "broker: forwarding");

    let end = splice(conn, data).await;
    mapping.tunnel_finished();
    match end.error {
        Some(err) => {
            tracing::debug!(remote_port = port, peer = %peer, err = %err, "broker: tunnel ended with error")
        }
        None => {
            tracing::debug!(
                remote_port = port,
                peer = %peer,
                bytes_in = end.forward,
                bytes_out = end.backward,
                "broker: tunnel closed"
            )
        }
    }
    Ok(())
}
