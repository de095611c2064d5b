//! Service probing over a session.
//!
//! Probes a server for installed services (MySQL, Redis, PostgreSQL,
//! Docker, nginx) by running lightweight detection commands through the
//! session's quick path. Probes are resolved through a capability-key
//! registry, so new service types plug in without touching a central
//! dispatch.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use futures_util::future::join_all;
use serde::{Deserialize, Serialize};

use crate::error::SessionError;
use crate::session::Session;

/// Status of a detected service.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "lowercase")]
pub enum ServiceStatus {
    Running,
    Stopped,
    Installed,
}

/// A service detected on the server.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DetectedService {
    pub name: String,
    pub version: String,
    pub status: ServiceStatus,
    pub port: u16,
}

/// Capability interface one service type exposes to the dashboard layer.
#[async_trait]
pub trait ServiceProbe: Send + Sync {
    fn key(&self) -> &'static str;
    fn default_port(&self) -> u16;
    async fn installed(&self, session: &Session) -> Result<bool, SessionError>;
    async fn version(&self, session: &Session) -> Result<String, SessionError>;
    async fn status(&self, session: &Session) -> Result<ServiceStatus, SessionError>;
    async fn config_path(&self, session: &Session) -> Result<Option<String>, SessionError>;
}

/// Probe driven entirely by shell command templates; covers every stock
/// service and most custom ones.
pub struct CommandProbe {
    key: &'static str,
    port: u16,
    which: &'static str,
    version_cmd: &'static str,
    /// Tried in order; exit zero plus an `active` token means running.
    status_cmds: &'static [&'static str],
    config_cmd: Option<&'static str>,
}

impl CommandProbe {
    pub fn mysql() -> Self {
        Self {
            key: "mysql",
            port: 3306,
            which: "which mysql 2>/dev/null || which mysqld 2>/dev/null",
            version_cmd: "mysql --version 2>/dev/null",
            status_cmds: &[
                "systemctl is-active mysql 2>/dev/null || systemctl is-active mysqld 2>/dev/null || systemctl is-active mariadb 2>/dev/null",
                "pgrep -x mysqld >/dev/null 2>&1 && echo active",
            ],
            config_cmd: Some("ls /etc/my.cnf /etc/mysql/my.cnf 2>/dev/null | head -n 1"),
        }
    }

    pub fn redis() -> Self {
        Self {
            key: "redis",
            port: 6379,
            which: "which redis-server 2>/dev/null || which redis-cli 2>/dev/null",
            version_cmd: "redis-cli --version 2>/dev/null",
            status_cmds: &[
                // A PONG from the server is the strongest running signal.
                "redis-cli ping 2>/dev/null | grep -iq pong && echo active",
                "systemctl is-active redis 2>/dev/null || systemctl is-active redis-server 2>/dev/null",
                "pgrep -x redis-server >/dev/null 2>&1 && echo active",
            ],
            config_cmd: Some("ls /etc/redis/redis.conf /etc/redis.conf 2>/dev/null | head -n 1"),
        }
    }

    pub fn postgresql() -> Self {
        Self {
            key: "postgresql",
            port: 5432,
            which: "which psql 2>/dev/null",
            version_cmd: "psql --version 2>/dev/null",
            status_cmds: &[
                "systemctl is-active postgresql 2>/dev/null",
                "pgrep -x postgres >/dev/null 2>&1 && echo active",
            ],
            config_cmd: Some("ls /etc/postgresql/*/main/postgresql.conf 2>/dev/null | head -n 1"),
        }
    }

    pub fn docker() -> Self {
        Self {
            key: "docker",
            port: 0,
            which: "which docker 2>/dev/null",
            version_cmd: "docker --version 2>/dev/null",
            status_cmds: &[
                // docker info succeeds only when the daemon is up.
                "docker info >/dev/null 2>&1 && echo active",
                "systemctl is-active docker 2>/dev/null",
            ],
            config_cmd: Some("ls /etc/docker/daemon.json 2>/dev/null | head -n 1"),
        }
    }

    pub fn nginx() -> Self {
        Self {
            key: "nginx",
            port: 80,
            which: "which nginx 2>/dev/null",
            version_cmd: "nginx -v 2>&1",
            status_cmds: &[
                "systemctl is-active nginx 2>/dev/null",
                "pgrep -x nginx >/dev/null 2>&1 && echo active",
            ],
            config_cmd: Some("nginx -t 2>&1 | grep -o '/[^ ]*nginx.conf' | head -n 1"),
        }
    }
}

#[async_trait]
impl ServiceProbe for CommandProbe {
    fn key(&self) -> &'static str {
        self.key
    }

    fn default_port(&self) -> u16 {
        self.port
    }

    async fn installed(&self, session: &Session) -> Result<bool, SessionError> {
        let result = session.execute_quick(self.which).await?;
        Ok(result.exit_code == Some(0) && !result.output.trim().is_empty())
    }

    async fn version(&self, session: &Session) -> Result<String, SessionError> {
        let result = session.execute_quick(self.version_cmd).await?;
        Ok(parse_version(&result.output))
    }

    async fn status(&self, session: &Session) -> Result<ServiceStatus, SessionError> {
        for cmd in self.status_cmds {
            let result = session.execute_quick(cmd).await?;
            if result.exit_code == Some(0) && result.output.contains("active") {
                return Ok(ServiceStatus::Running);
            }
        }
        // Binary exists but nothing reported it running.
        Ok(ServiceStatus::Stopped)
    }

    async fn config_path(&self, session: &Session) -> Result<Option<String>, SessionError> {
        let Some(cmd) = self.config_cmd else {
            return Ok(None);
        };
        let result = session.execute_quick(cmd).await?;
        let path = result.output.lines().next().unwrap_or("").trim();
        if result.exit_code == Some(0) && path.starts_with('/') {
            Ok(Some(path.to_string()))
        } else {
            Ok(None)
        }
    }
}

/// Capability-key registry, resolved once at startup.
pub struct ServiceRegistry {
    probes: HashMap<&'static str, Arc<dyn ServiceProbe>>,
}

impl ServiceRegistry {
    pub fn new() -> Self {
        Self {
            probes: HashMap::new(),
        }
    }

    /// Registry with the stock probe set.
    pub fn with_defaults() -> Self {
        let mut registry = Self::new();
        registry.register(Arc::new(CommandProbe::mysql()));
        registry.register(Arc::new(CommandProbe::redis()));
        registry.register(Arc::new(CommandProbe::postgresql()));
        registry.register(Arc::new(CommandProbe::docker()));
        registry.register(Arc::new(CommandProbe::nginx()));
        registry
    }

    /// Later registrations override earlier ones with the same key.
    pub fn register(&mut self, probe: Arc<dyn ServiceProbe>) {
        self.probes.insert(probe.key(), probe);
    }

    pub fn get(&self, key: &str) -> Option<Arc<dyn ServiceProbe>> {
        self.probes.get(key).cloned()
    }

    pub fn keys(&self) -> Vec<&'static str> {
        let mut keys: Vec<&'static str> = self.probes.keys().copied().collect();
        keys.sort_unstable();
        keys
    }

    /// Probe every registered service concurrently. Probes that error or
    /// find nothing installed are simply absent from the result.
    pub async fn detect_all(&self, session: &Session) -> Vec<DetectedService> {
        let futures = self.probes.values().cloned().map(|probe| async move {
            match probe.installed(session).await {
                Ok(true) => {}
                _ => return None,
            }
            let version = probe.version(session).await.unwrap_or_default();
            let status = probe
                .status(session)
                .await
                .unwrap_or(ServiceStatus::Installed);
            Some(DetectedService {
                name: probe.key().to_string(),
                version,
                status,
                port: probe.default_port(),
            })
        });

        let mut services: Vec<DetectedService> =
            join_all(futures).await.into_iter().flatten().collect();
        services.sort_by(|a, b| a.name.cmp(&b.name));
        log::info!("detected {} services", services.len());
        services
    }
}

impl Default for ServiceRegistry {
    fn default() -> Self {
        Self::with_defaults()
    }
}

/// Extract a version token from tool output.
fn parse_version(output: &str) -> String {
    // Common shapes:
    // - "mysql  Ver 8.0.35 Distrib 8.0.35, ..."
    // - "redis-cli 7.0.11"
    // - "psql (PostgreSQL) 15.4"
    // - "Docker version 24.0.5, ..."
    // - "nginx version: nginx/1.24.0"
    for word in output.split_whitespace() {
        let trimmed = word.trim_end_matches(',').trim_end_matches(';');
        let candidate = trimmed.rsplit_once('/').map(|(_, v)| v).unwrap_or(trimmed);
        if candidate.chars().next().is_some_and(|c| c.is_ascii_digit()) && candidate.contains('.') {
            return candidate.to_string();
        }
    }
    output.lines().next().unwrap_or("unknown").to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::ChannelHandle;
    use crate::session::auth::NoSecrets;
    use crate::session::ConnectionTarget;
    use std::time::Duration;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    #[test]
    fn test_parse_version_mysql() {
        let output = "mysql  Ver 8.0.35 Distrib 8.0.35, for Linux on x86_64";
        assert_eq!(parse_version(output), "8.0.35");
    }

    #[test]
    fn test_parse_version_redis() {
        assert_eq!(parse_version("redis-cli 7.0.11"), "7.0.11");
    }

    #[test]
    fn test_parse_version_docker() {
        assert_eq!(parse_version("Docker version 24.0.5, build ced0996"), "24.0.5");
    }

    #[test]
    fn test_parse_version_psql() {
        assert_eq!(parse_version("psql (PostgreSQL) 15.4"), "15.4");
    }

    #[test]
    fn test_parse_version_nginx() {
        assert_eq!(parse_version("nginx version: nginx/1.24.0"), "1.24.0");
    }

    #[test]
    fn test_detected_service_json() {
        let service = DetectedService {
            name: "mysql".to_string(),
            version: "8.0.35".to_string(),
            status: ServiceStatus::Running,
            port: 3306,
        };
        let json = serde_json::to_string(&service).unwrap();
        assert!(json.contains("\"status\":\"running\""));
        assert!(json.contains("\"port\":3306"));
    }

    #[test]
    fn test_registry_defaults_and_override() {
        let registry = ServiceRegistry::with_defaults();
        assert_eq!(
            registry.keys(),
            vec!["docker", "mysql", "nginx", "postgresql", "redis"]
        );
        assert!(registry.get("redis").is_some());
        assert!(registry.get("unknown").is_none());
    }

    /// Fake host where only redis exists and is running.
    async fn fake_shell(server: tokio::io::DuplexStream) {
        let (mut reader, mut writer) = tokio::io::split(server);
        let mut pending = Vec::new();
        let mut byte = [0u8; 1];
        loop {
            match reader.read(&mut byte).await {
                Ok(0) | Err(_) => return,
                Ok(_) => {}
            }
            if byte[0] != b'\n' {
                pending.push(byte[0]);
                continue;
            }
            let line = String::from_utf8_lossy(&pending).to_string();
            pending.clear();

            let Some(frame_at) = line.find("); echo '") else { continue };
            let delim_start = frame_at + "); echo '".len();
            let delim_end = line[delim_start..].find('\'').unwrap() + delim_start;
            let delim = line[delim_start..delim_end].to_string();
            let inner = &line[..frame_at];

            let payload = if inner.contains("which redis-server") {
                format!("/usr/bin/redis-server\n{delim}0\n")
            } else if inner.contains("which") {
                format!("{delim}1\n")
            } else if inner.contains("redis-cli --version") {
                format!("redis-cli 7.0.11\n{delim}0\n")
            } else if inner.contains("redis-cli ping") {
                format!("active\n{delim}0\n")
            } else {
                format!("{delim}1\n")
            };
            if writer.write_all(payload.as_bytes()).await.is_err() {
                return;
            }
        }
    }

    #[tokio::test]
    async fn test_detect_all_reports_running_redis_only() {
        let (client, server) = tokio::io::duplex(64 * 1024);
        tokio::spawn(fake_shell(server));
        let (reader, writer) = tokio::io::split(client);
        let session = Session::from_parts(
            ChannelHandle::spawn(reader, writer),
            ConnectionTarget::Local,
            Arc::new(NoSecrets),
            Duration::from_secs(5),
        );

        let registry = ServiceRegistry::with_defaults();
        let services = registry.detect_all(&session).await;
        assert_eq!(services.len(), 1);
        assert_eq!(services[0].name, "redis");
        assert_eq!(services[0].version, "7.0.11");
        assert_eq!(services[0].status, ServiceStatus::Running);
        assert_eq!(services[0].port, 6379);
    }
}
