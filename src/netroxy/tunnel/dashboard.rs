//! Read/toggle view over running servers, consumed by the admin API.

use std::sync::Arc;

use serde::Serialize;

use crate::netroxy::tunnel::{mapping::Mapping, server::Server, session::ControlSession};

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct ServerView {
    pub name: String,
    pub tls: bool,
    pub listen_addr: Option<String>,
    pub started_at_unix_ms: u64,
    pub session_count: usize,
    pub mapping_count: usize,
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct SessionView {
    pub name: String,
    pub server: String,
    pub peer: String,
    pub login_time_unix_ms: u64,
    pub heartbeat_interval_secs: u64,
    pub mapping_count: usize,
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct MappingView {
    pub remote_port: u16,
    pub remote_addr: String,
    pub target_addr: String,
    pub enabled: bool,
    pub session: String,
    pub server: String,
    pub active_tunnels: u64,
    pub created_at_unix_ms: u64,
}

pub trait Dashboard: Send + Sync {
    fn servers(&self) -> Vec<ServerView>;

    fn list_sessions(&self) -> Vec<SessionView>;

    fn get_session(&self, name: &str) -> Option<SessionView> {
        self.list_sessions().into_iter().find(|s| s.name == name)
    }

    fn list_mappings(&self) -> Vec<MappingView>;

    fn get_mapping(&self, remote_port: u16) -> Option<MappingView> {
        self.list_mappings()
            .into_iter()
            .find(|m| m.remote_port == remote_port)
    }

    /// Returns false when no mapping listens on `remote_port`.
    fn set_mapping_enabled(&self, remote_port: u16, on: bool) -> bool;
}

fn session_view(server: &Server, s: &ControlSession) -> SessionView {
    SessionView {
        name: s.name().to_string(),
        server: server.name().to_string(),
        peer: s.peer().to_string(),
        login_time_unix_ms: s.login_time_unix_ms(),
        heartbeat_interval_secs: s.heartbeat_interval().as_secs(),
        mapping_count: s.mappings().len(),
    }
}

fn mapping_view(server: &Server, m: &Mapping) -> MappingView {
    MappingView {
        remote_port: m.remote_port(),
        remote_addr: m.listen_addr().to_string(),
        target_addr: m.target_addr(),
        enabled: m.is_enabled(),
        session: m.session_name().to_string(),
        server: server.name().to_string(),
        active_tunnels: m.active_tunnels(),
        created_at_unix_ms: m.created_at_unix_ms(),
    }
}

impl Server {
    pub fn server_info(&self) -> ServerView {
        let sessions = self.sessions();
        ServerView {
            name: self.name().to_string(),
            tls: self.is_tls(),
            listen_addr: self.listen_addr().map(|a| a.to_string()),
            started_at_unix_ms: self.started_at_unix_ms(),
            session_count: sessions.len(),
            mapping_count: sessions.iter().map(|s| s.mappings().len()).sum(),
        }
    }

    pub fn find_mapping(&self, remote_port: u16) -> Option<Arc<Mapping>> {
        self.sessions()
            .iter()
            .find_map(|s| s.mappings().get(remote_port))
    }
}

impl Dashboard for Server {
    fn servers(&self) -> Vec<ServerView> {
        vec![self.server_info()]
    }

    fn list_sessions(&self) -> Vec<SessionView> {
        self.sessions()
            .iter()
            .map(|s| session_view(self, s))
            .collect()
    }

    fn get_session(&self, name: &str) -> Option<SessionView> {
        self.session_by_name(name).map(|s| session_view(self, &s))
    }

    fn list_mappings(&self) -> Vec<MappingView> {
        let mut out: Vec<MappingView> = self
            .sessions()
            .iter()
            .flat_map(|s| s.mappings().list())
            .map(|m| mapping_view(self, &m))
            .collect();
        out.sort_by_key(|m| m.remote_port);
        out
    }

    fn get_mapping(&self, remote_port: u16) -> Option<MappingView> {
        self.find_mapping(remote_port)
            .map(|m| mapping_view(self, &m))
    }

    fn set_mapping_enabled(&self, remote_port: u16, on: bool) -> bool {
        match self.find_mapping(remote_port) {
            Some(m) => {
                m.set_enabled(on);
                tracing::info!(server = %self.name(), remote_port, enabled = on, "dashboard: mapping toggled");
                true
            }
            None => false,
        }
    }
}

/// Several servers (plain and TLS listeners) seen as one.
#[derive(Clone, Default)]
pub struct ServerGroup {
    servers: Vec<Arc<Server>>,
}

impl ServerGroup {
    pub fn new(servers: Vec<Arc<Server>>) -> Self {
        Self { servers }
    }
}

impl Dashboard for ServerGroup {
    fn servers(&self) -> Vec<ServerView> {
        self.servers.iter().map(|s| s.server_info()).collect()
    }

    fn list_sessions(&self) -> Vec<SessionView> {
        self.servers.iter().flat_map(|s| s.list_sessions()).collect()
    }

    fn get_session(&self, name: &str) -> Option<SessionView> {
        self.servers.iter().find_map(|s| s.get_session(name))
    }

    fn list_mappings(&self) -> Vec<MappingView> {
        let mut out: Vec<MappingView> =
            self.servers.iter().flat_map(|s| s.list_mappings()).collect();
        out.sort_by_key(|m| m.remote_port);
        out
    }

    fn get_mapping(&self, remote_port: u16) -> Option<MappingView> {
        self.servers.iter().find_map(|s| s.get_mapping(remote_port))
    }

    fn set_mapping_enabled(&self, remote_port: u16, on: bool) -> bool {
        self.servers
            .iter()
            .any(|s| s.set_mapping_enabled(remote_port, on))
    }
}
