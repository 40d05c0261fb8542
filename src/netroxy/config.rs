use std::{
    fs,
    path::{Path, PathBuf},
    time::Duration,
};

use anyhow::Context;
use serde::{Deserialize, de::DeserializeOwned};

use crate::netroxy::{net, telemetry};

#[derive(Debug, Clone)]
pub struct ResolvedConfigPath {
    pub path: PathBuf,
    pub source: ConfigPathSource,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfigPathSource {
    Flag,
    Env,
    Cwd,
}

impl std::fmt::Display for ConfigPathSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigPathSource::Flag => write!(f, "flag"),
            ConfigPathSource::Env => write!(f, "env"),
            ConfigPathSource::Cwd => write!(f, "cwd"),
        }
    }
}

/// Which side of the tunnel a config file describes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Server,
    Client,
}

impl Role {
    pub fn env_var(self) -> &'static str {
        match self {
            Role::Server => "NETROXY_SERVER_CONFIG",
            Role::Client => "NETROXY_CLIENT_CONFIG",
        }
    }

    fn file_stem(self) -> &'static str {
        match self {
            Role::Server => "netroxy-server",
            Role::Client => "netroxy-client",
        }
    }
}

const EXTENSIONS: [&str; 4] = ["toml", "yaml", "yml", "json"];

pub fn resolve_config_path(
    explicit_flag_path: Option<PathBuf>,
    role: Role,
) -> anyhow::Result<ResolvedConfigPath> {
    if let Some(p) = explicit_flag_path {
        if p.as_os_str().is_empty() {
            anyhow::bail!("config: empty config path");
        }
        return Ok(ResolvedConfigPath {
            path: p,
            source: ConfigPathSource::Flag,
        });
    }

    // clap maps the env var into the flag already; this covers callers that
    // do not go through the CLI.
    if let Some(p) = std::env::var_os(role.env_var()) {
        if !p.is_empty() {
            return Ok(ResolvedConfigPath {
                path: PathBuf::from(p),
                source: ConfigPathSource::Env,
            });
        }
    }

    let path = discover_config_path(Path::new("."), role)?;
    Ok(ResolvedConfigPath {
        path,
        source: ConfigPathSource::Cwd,
    })
}

fn discover_config_path(dir: &Path, role: Role) -> anyhow::Result<PathBuf> {
    for ext in EXTENSIONS {
        let p = dir.join(format!("{}.{ext}", role.file_stem()));
        if fs::metadata(&p).map(|m| m.is_file()).unwrap_or(false) {
            return Ok(p);
        }
    }
    anyhow::bail!(
        "config: no {}.{{toml,yaml,yml,json}} in {} (set --config or {})",
        role.file_stem(),
        dir.display(),
        role.env_var()
    )
}

fn parse_file<T: DeserializeOwned>(path: &Path) -> anyhow::Result<T> {
    let data = fs::read(path).with_context(|| format!("read {}", path.display()))?;
    let s = String::from_utf8_lossy(&data);

    let ext = path
        .extension()
        .and_then(|e| e.to_str())
        .unwrap_or("")
        .to_ascii_lowercase();

    match ext.as_str() {
        "toml" => toml::from_str(&s).with_context(|| format!("parse toml {}", path.display())),
        "yaml" | "yml" => {
            serde_yaml::from_str(&s).with_context(|| format!("parse yaml {}", path.display()))
        }
        "json" => serde_json::from_str(&s).with_context(|| format!("parse json {}", path.display())),
        _ => anyhow::bail!("config: unsupported config extension {:?}", ext),
    }
}

pub fn load_server_config(path: &Path) -> anyhow::Result<ServerConfig> {
    let fc: FileServerConfig = parse_file(path)?;
    ServerConfig::from_file_config(fc)
}

pub fn load_client_config(path: &Path) -> anyhow::Result<ClientConfig> {
    let fc: FileClientConfig = parse_file(path)?;
    ClientConfig::from_file_config(fc)
}

#[derive(Debug, Clone)]
pub struct LoggingConfig {
    pub level: String,
    pub format: String,
    pub output: String,
    pub add_source: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".into(),
            format: "text".into(),
            output: "stderr".into(),
            add_source: false,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub ip: String,
    pub port: u16,
    pub username: String,
    pub password: String,
    pub timeout: Duration,
    pub tunnel_timeout: Duration,
    pub tls: ServerTlsConfig,
    pub admin_addr: String,
    pub logging: LoggingConfig,
}

impl ServerConfig {
    pub fn listen_addr(&self) -> String {
        net::join_host_port(&self.ip, self.port)
    }

    pub fn tls_listen_addr(&self) -> String {
        net::join_host_port(&self.ip, self.tls.port)
    }
}

#[derive(Debug, Clone, Default)]
pub struct ServerTlsConfig {
    pub enabled: bool,
    pub port: u16,
    /// PEM certificate chain. Empty together with `key` means self-signed.
    pub ca: String,
    pub key: String,
}

#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub name: String,
    pub ip: String,
    pub port: u16,
    pub username: String,
    pub password: String,
    pub tls: ClientTlsConfig,
    pub retry_interval: Duration,
    pub dial_timeout: Duration,
    pub connections: Vec<ConnectionConfig>,
    pub logging: LoggingConfig,
}

impl ClientConfig {
    pub fn server_addr(&self) -> String {
        net::join_host_port(&self.ip, self.port)
    }
}

#[derive(Debug, Clone, Default)]
pub struct ClientTlsConfig {
    pub enabled: bool,
    pub verify: bool,
    pub server_name: String,
    pub ca: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionConfig {
    pub local_addr: String,
    pub remote_port: u16,
    pub is_open: bool,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct FileServerConfig {
    ip: Option<String>,
    port: u16,
    #[serde(default)]
    username: String,
    #[serde(default)]
    password: String,
    timeout: Option<i64>,
    tunnel_timeout_ms: Option<i64>,
    tls: Option<FileServerTls>,
    #[serde(default)]
    admin_addr: String,
    web: Option<FileWebConfig>,
    logging: Option<FileLogging>,
}

/// Older configs describe the dashboard as a `web` block. Only its address
/// is read; keys like `root` and `Https` have no counterpart and are ignored.
#[derive(Debug, Deserialize)]
struct FileWebConfig {
    #[serde(default)]
    enabled: bool,
    #[serde(default)]
    ip: String,
    #[serde(default)]
    port: u16,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct FileServerTls {
    #[serde(default)]
    enabled: bool,
    #[serde(default)]
    port: u16,
    #[serde(default)]
    ca: String,
    #[serde(default)]
    key: String,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct FileClientConfig {
    name: Option<String>,
    ip: String,
    port: u16,
    #[serde(default)]
    username: String,
    #[serde(default)]
    password: String,
    tls: Option<FileClientTls>,
    retry_interval_ms: Option<i64>,
    dial_timeout_ms: Option<i64>,
    #[serde(default)]
    connections: Vec<FileConnection>,
    logging: Option<FileLogging>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct FileClientTls {
    #[serde(default)]
    enabled: bool,
    #[serde(default)]
    verify: bool,
    server_name: Option<String>,
    #[serde(default)]
    ca: String,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct FileConnection {
    ip: String,
    port: u16,
    #[serde(alias = "remotePort")]
    remote_port: u16,
    is_open: Option<bool>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct FileLogging {
    level: Option<String>,
    format: Option<String>,
    output: Option<String>,
    #[serde(default)]
    add_source: bool,
}

fn non_empty(v: Option<&String>) -> Option<String> {
    v.map(|s| s.trim().to_string()).filter(|s| !s.is_empty())
}

fn millis(v: Option<i64>, default: u64) -> Duration {
    Duration::from_millis(v.map(|n| n.max(0) as u64).unwrap_or(default))
}

impl LoggingConfig {
    fn from_file(l: Option<&FileLogging>) -> Self {
        let mut cfg = LoggingConfig::default();
        if let Some(l) = l {
            if let Some(level) = non_empty(l.level.as_ref()) {
                cfg.level = level;
            }
            if let Some(fmt) = non_empty(l.format.as_ref()) {
                cfg.format = fmt.to_ascii_lowercase();
            }
            if let Some(out) = non_empty(l.output.as_ref()) {
                cfg.output = out;
            }
            cfg.add_source = l.add_source;
        }
        cfg
    }
}

impl ServerConfig {
    fn from_file_config(fc: FileServerConfig) -> anyhow::Result<ServerConfig> {
        if fc.port == 0 {
            anyhow::bail!("config: port is required");
        }
        let timeout = fc.timeout.unwrap_or(30);
        if timeout <= 0 {
            anyhow::bail!("config: timeout must be positive, got {timeout}");
        }

        let tls = match &fc.tls {
            Some(t) => ServerTlsConfig {
                enabled: t.enabled,
                port: t.port,
                ca: t.ca.trim().to_string(),
                key: t.key.trim().to_string(),
            },
            None => ServerTlsConfig::default(),
        };
        if tls.enabled {
            if tls.port == 0 {
                anyhow::bail!("config: tls.port is required when tls is enabled");
            }
            if tls.port == fc.port {
                anyhow::bail!("config: tls.port must differ from port");
            }
            if tls.ca.is_empty() != tls.key.is_empty() {
                anyhow::bail!("config: tls.ca and tls.key must be set together");
            }
        }

        let admin_addr = admin_addr(&fc)?;
        Ok(ServerConfig {
            ip: non_empty(fc.ip.as_ref()).unwrap_or_else(|| "0.0.0.0".into()),
            port: fc.port,
            username: fc.username,
            password: fc.password,
            timeout: Duration::from_secs(timeout as u64),
            tunnel_timeout: millis(fc.tunnel_timeout_ms, 30_000),
            tls,
            admin_addr,
            logging: LoggingConfig::from_file(fc.logging.as_ref()),
        })
    }
}

fn admin_addr(fc: &FileServerConfig) -> anyhow::Result<String> {
    let explicit = fc.admin_addr.trim();
    match &fc.web {
        Some(web) if web.enabled && explicit.is_empty() => {
            if web.port == 0 {
                anyhow::bail!("config: web.port is required when web is enabled");
            }
            Ok(net::join_host_port(web.ip.trim(), web.port))
        }
        _ => Ok(explicit.to_string()),
    }
}

/// `<hostname>-<random>`, so dashboards can tell machines apart.
fn default_client_name() -> String {
    let host = hostname::get()
        .ok()
        .and_then(|h| h.into_string().ok())
        .filter(|h| !h.is_empty())
        .unwrap_or_else(|| "netroxy".to_string());
    format!("{host}-{}", telemetry::random_token(8))
}

impl ClientConfig {
    fn from_file_config(fc: FileClientConfig) -> anyhow::Result<ClientConfig> {
        let ip = fc.ip.trim().to_string();
        if ip.is_empty() {
            anyhow::bail!("config: ip is required");
        }
        if fc.port == 0 {
            anyhow::bail!("config: port is required");
        }

        let tls = match &fc.tls {
            Some(t) => ClientTlsConfig {
                enabled: t.enabled,
                verify: t.verify,
                server_name: non_empty(t.server_name.as_ref()).unwrap_or_else(|| ip.clone()),
                ca: t.ca.trim().to_string(),
            },
            None => ClientTlsConfig::default(),
        };
        if tls.enabled && tls.verify && tls.ca.is_empty() {
            anyhow::bail!("config: tls.ca is required when tls.verify is set");
        }

        let mut connections = Vec::with_capacity(fc.connections.len());
        for (i, c) in fc.connections.iter().enumerate() {
            let host = c.ip.trim();
            if host.is_empty() || c.port == 0 {
                anyhow::bail!("config: connections[{i}] needs ip and port");
            }
            if c.remote_port == 0 {
                anyhow::bail!("config: connections[{i}] needs remote_port");
            }
            if connections
                .iter()
                .any(|x: &ConnectionConfig| x.remote_port == c.remote_port)
            {
                anyhow::bail!(
                    "config: connections[{i}] remote_port {} is listed twice",
                    c.remote_port
                );
            }
            connections.push(ConnectionConfig {
                local_addr: net::join_host_port(host, c.port),
                remote_port: c.remote_port,
                is_open: c.is_open.unwrap_or(true),
            });
        }

        Ok(ClientConfig {
            name: non_empty(fc.name.as_ref()).unwrap_or_else(default_client_name),
            ip,
            port: fc.port,
            username: fc.username,
            password: fc.password,
            tls,
            retry_interval: millis(fc.retry_interval_ms, 3000),
            dial_timeout: millis(fc.dial_timeout_ms, 5000),
            connections,
            logging: LoggingConfig::from_file(fc.logging.as_ref()),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn temp_dir(name: &str) -> PathBuf {
        let mut p = std::env::temp_dir();
        let now = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap_or_default()
            .as_nanos();
        p.push(format!(
            "netroxy_cfg_test_{name}_{}_{}",
            std::process::id(),
            now
        ));
        std::fs::create_dir_all(&p).expect("mkdir");
        p
    }

    #[test]
    fn server_defaults_fill_in() {
        let dir = temp_dir("server_defaults");
        let cfg_path = dir.join("netroxy-server.toml");

        let toml = r#"
port = 7000
username = "admin"
password = "secret"
"#;

        std::fs::write(&cfg_path, toml).expect("write");
        let cfg = load_server_config(&cfg_path).expect("load");
        assert_eq!(cfg.listen_addr(), "0.0.0.0:7000");
        assert_eq!(cfg.timeout, Duration::from_secs(30));
        assert_eq!(cfg.tunnel_timeout, Duration::from_secs(30));
        assert!(!cfg.tls.enabled);
        assert_eq!(cfg.logging.level, "info");
        assert!(cfg.admin_addr.is_empty());

        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn server_rejects_bad_timeout_and_half_tls() {
        let dir = temp_dir("server_bad");
        let cfg_path = dir.join("netroxy-server.yaml");

        std::fs::write(&cfg_path, "port: 7000\ntimeout: 0\n").expect("write");
        let err = load_server_config(&cfg_path).unwrap_err();
        assert!(err.to_string().contains("timeout"));

        std::fs::write(
            &cfg_path,
            "port: 7000\ntls:\n  enabled: true\n  port: 7443\n  ca: cert.pem\n",
        )
        .expect("write");
        let err = load_server_config(&cfg_path).unwrap_err();
        assert!(err.to_string().contains("together"));

        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn unknown_fields_are_rejected() {
        let dir = temp_dir("unknown");
        let cfg_path = dir.join("netroxy-server.toml");

        std::fs::write(&cfg_path, "port = 7000\nweb_root = \"./web\"\n").expect("write");
        let err = load_server_config(&cfg_path).unwrap_err();
        let msg = format!("{err:#}");
        assert!(msg.contains("web_root"), "got: {msg}");

        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn client_json_with_connections() {
        let dir = temp_dir("client_json");
        let cfg_path = dir.join("netroxy-client.json");

        let json = r#"{
  "ip": "203.0.113.7",
  "port": 7000,
  "username": "admin",
  "password": "secret",
  "tls": { "enabled": true },
  "connections": [
    { "ip": "127.0.0.1", "port": 8000, "remotePort": 9000 },
    { "ip": "127.0.0.1", "port": 22, "remote_port": 9022, "is_open": false }
  ]
}"#;

        std::fs::write(&cfg_path, json).expect("write");
        let cfg = load_client_config(&cfg_path).expect("load");
        assert_eq!(cfg.server_addr(), "203.0.113.7:7000");
        let (host, suffix) = cfg.name.rsplit_once('-').unwrap();
        assert!(!host.is_empty());
        assert_eq!(suffix.len(), 8);
        assert!(cfg.tls.enabled);
        assert!(!cfg.tls.verify);
        assert_eq!(cfg.tls.server_name, "203.0.113.7");
        assert_eq!(cfg.retry_interval, Duration::from_secs(3));
        assert_eq!(
            cfg.connections,
            vec![
                ConnectionConfig {
                    local_addr: "127.0.0.1:8000".into(),
                    remote_port: 9000,
                    is_open: true,
                },
                ConnectionConfig {
                    local_addr: "127.0.0.1:22".into(),
                    remote_port: 9022,
                    is_open: false,
                },
            ]
        );

        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn client_rejects_duplicate_remote_ports() {
        let dir = temp_dir("client_dup");
        let cfg_path = dir.join("netroxy-client.toml");

        let toml = r#"
ip = "127.0.0.1"
port = 7000

[[connections]]
ip = "127.0.0.1"
port = 8000
remote_port = 9000

[[connections]]
ip = "127.0.0.1"
port = 8001
remote_port = 9000
"#;

        std::fs::write(&cfg_path, toml).expect("write");
        let err = load_client_config(&cfg_path).unwrap_err();
        assert!(err.to_string().contains("listed twice"));

        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn discovery_prefers_toml_and_flag_wins() {
        let dir = temp_dir("discover");
        std::fs::write(dir.join("netroxy-client.yaml"), "ip: a\nport: 1\n").expect("write");
        assert_eq!(
            discover_config_path(&dir, Role::Client).unwrap(),
            dir.join("netroxy-client.yaml")
        );
        std::fs::write(dir.join("netroxy-client.toml"), "").expect("write");
        assert_eq!(
            discover_config_path(&dir, Role::Client).unwrap(),
            dir.join("netroxy-client.toml")
        );
        assert!(discover_config_path(&dir, Role::Server).is_err());

        let flagged = resolve_config_path(Some(dir.join("x.json")), Role::Server).unwrap();
        assert_eq!(flagged.source, ConfigPathSource::Flag);
        assert_eq!(flagged.path, dir.join("x.json"));

        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn legacy_web_block_sets_admin_addr() {
        let dir = temp_dir("server_web");
        let cfg_path = dir.join("netroxy-server.json");

        let json = r#"{
  "ip": "0.0.0.0",
  "port": 7000,
  "username": "admin",
  "password": "secret",
  "timeout": 10,
  "tls": { "enabled": false, "port": 0, "ca": "", "key": "" },
  "web": {
    "enabled": true,
    "ip": "127.0.0.1",
    "port": 8080,
    "root": "./web",
    "Https": { "ca": "", "key": "" }
  }
}"#;
        std::fs::write(&cfg_path, json).expect("write");
        let cfg = load_server_config(&cfg_path).expect("load");
        assert_eq!(cfg.admin_addr, "127.0.0.1:8080");
        assert_eq!(cfg.timeout, Duration::from_secs(10));

        std::fs::write(
            &cfg_path,
            r#"{ "port": 7000, "admin_addr": ":9100", "web": { "enabled": true, "port": 8080 } }"#,
        )
        .expect("write");
        assert_eq!(load_server_config(&cfg_path).expect("load").admin_addr, ":9100");

        std::fs::write(
            &cfg_path,
            r#"{ "port": 7000, "web": { "enabled": false, "port": 8080 } }"#,
        )
        .expect("write");
        assert!(load_server_config(&cfg_path).expect("load").admin_addr.is_empty());

        let _ = std::fs::remove_dir_all(&dir);
    }
}
