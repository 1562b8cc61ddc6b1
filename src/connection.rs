//! MySQL primary 연결 관리
//!
//! 하나의 연결(`MySqlLink`)은 두 세션으로 구성됩니다.
//!   - 복제 채널: 직접 구현한 패킷 채널. 세션 변수 설정, 등록, dump 요청, 이벤트 수신
//!   - 메타데이터 세션: mysql_async 풀. 버전, server_uuid, gtid_executed 조회
//!
//! 재연결할 때마다 새 연결을 만들고, 이전 연결은 항상 먼저 닫습니다.

use crate::auth::{self, Credentials};
use crate::config::ReplicaConfig;
use crate::error::{ReplicaError, Result};
use crate::protocol::PacketChannel;
use async_trait::async_trait;
use bytes::Bytes;
use mysql_async::prelude::*;
use mysql_async::{OptsBuilder, Pool};
use regex::Regex;
use std::time::Duration;
use tokio::net::TcpStream;
use tracing::{debug, info};

pub const COM_QUIT: u8 = 0x01;
pub const COM_QUERY: u8 = 0x03;

/// 죽은 primary를 빨리 감지하기 위한 연결 타임아웃
pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(2);

pub const PROGRAM_NAME: &str = "binlog-mirror";
pub const CLIENT_ROLE: &str = "binary_log_listener";

/// MySQL 연결 설정
#[derive(Debug, Clone)]
pub struct ConnectionConfig {
    pub hostname: String,
    pub port: u16,
    pub username: String,
    pub password: String,
    pub bind_address: Option<String>,
    pub connect_timeout: Duration,
    pub read_timeout: Option<Duration>,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        ConnectionConfig {
            hostname: "localhost".to_string(),
            port: 3306,
            username: "root".to_string(),
            password: String::new(),
            bind_address: None,
            connect_timeout: CONNECT_TIMEOUT,
            read_timeout: None,
        }
    }
}

impl ConnectionConfig {
    pub fn new(hostname: impl Into<String>, username: impl Into<String>) -> Self {
        ConnectionConfig {
            hostname: hostname.into(),
            username: username.into(),
            ..Default::default()
        }
    }

    fn build_opts(&self) -> OptsBuilder {
        OptsBuilder::default()
            .ip_or_hostname(self.hostname.clone())
            .tcp_port(self.port)
            .user(Some(self.username.clone()))
            .pass(Some(self.password.clone()))
            .prefer_socket(false)
    }
}

impl From<&ReplicaConfig> for ConnectionConfig {
    fn from(config: &ReplicaConfig) -> Self {
        ConnectionConfig {
            hostname: config.master_host.clone(),
            port: config.master_port,
            username: config.master_user.clone(),
            password: config.master_password.clone(),
            bind_address: config.bind_address.clone(),
            connect_timeout: CONNECT_TIMEOUT,
            read_timeout: config.read_timeout(),
        }
    }
}

/// 한 번의 연결 시도로 얻은 primary 세션
#[async_trait]
pub trait PrimaryLink: Send {
    /// 메타데이터 세션에서 첫 행 첫 컬럼 조회 (NULL이면 None)
    async fn query_value(&mut self, sql: &str) -> Result<Option<String>>;

    /// `SHOW GLOBAL VARIABLES LIKE` 조회
    async fn variable(&mut self, name: &str) -> Result<Option<String>>;

    /// 복제 채널에서 문장 실행 (세션 변수 설정용)
    async fn execute(&mut self, sql: &str) -> Result<()>;

    /// 복제 채널에서 명령 전송 후 OK 대기
    async fn command(&mut self, command: u8, payload: &[u8]) -> Result<()>;

    /// 복제 채널에서 응답 없는 명령 전송 (dump 요청, semi-sync 응답)
    async fn send_command(&mut self, command: u8, payload: &[u8]) -> Result<()>;

    async fn read_packet(&mut self) -> Result<Bytes>;

    /// 생존 확인 후 닫기 (실패해도 무시)
    async fn close(&mut self);

    async fn server_version(&mut self) -> Result<String> {
        self.query_value("SELECT VERSION()")
            .await?
            .ok_or_else(|| ReplicaError::Query("SELECT VERSION() returned no rows".to_string()))
    }

    async fn server_uuid(&mut self) -> Result<String> {
        self.query_value("SELECT @@GLOBAL.server_uuid")
            .await?
            .filter(|uuid| !uuid.trim().is_empty())
            .ok_or_else(|| ReplicaError::Query("primary reported no server_uuid".to_string()))
    }

    /// `@@global.gtid_executed` 텍스트 (줄바꿈 포함 가능)
    async fn executed_gtid_set(&mut self) -> Result<String> {
        Ok(self
            .query_value("SELECT @@global.gtid_executed")
            .await?
            .unwrap_or_default())
    }
}

/// 새 `PrimaryLink`를 만드는 쪽
#[async_trait]
pub trait Connector: Send {
    type Link: PrimaryLink;

    async fn connect(&mut self) -> Result<Self::Link>;
}

/// 실제 MySQL 서버 연결
pub struct MySqlConnector {
    config: ConnectionConfig,
}

impl MySqlConnector {
    pub fn new(config: ConnectionConfig) -> Self {
        MySqlConnector { config }
    }
}

#[async_trait]
impl Connector for MySqlConnector {
    type Link = MySqlLink;

    async fn connect(&mut self) -> Result<MySqlLink> {
        let config = &self.config;
        let mut channel = PacketChannel::connect(
            &config.hostname,
            config.port,
            config.bind_address.as_deref(),
            config.connect_timeout,
        )
        .await?;

        let credentials = Credentials {
            username: &config.username,
            password: &config.password,
            attributes: vec![("program_name", PROGRAM_NAME), ("_client_role", CLIENT_ROLE)],
        };
        let greeting = tokio::time::timeout(
            config.connect_timeout,
            auth::authenticate(&mut channel, &credentials),
        )
        .await
        .map_err(|_| ReplicaError::connect("Timed out during authentication"))??;
        channel.set_read_timeout(config.read_timeout);

        info!(
            "Connected to {}:{} (server {}, connection id {})",
            config.hostname, config.port, greeting.server_version, greeting.thread_id
        );

        Ok(MySqlLink {
            channel,
            pool: Pool::new(config.build_opts()),
        })
    }
}

/// 복제 채널 + 메타데이터 풀
pub struct MySqlLink {
    channel: PacketChannel<TcpStream>,
    pool: Pool,
}

#[async_trait]
impl PrimaryLink for MySqlLink {
    async fn query_value(&mut self, sql: &str) -> Result<Option<String>> {
        // 풀에서 매번 가져오므로 유휴 중 끊긴 세션은 자동으로 다시 연결됨
        let mut conn = self.pool.get_conn().await?;
        let row: Option<(Option<String>,)> = conn.query_first(sql).await?;
        Ok(row.and_then(|(value,)| value))
    }

    async fn variable(&mut self, name: &str) -> Result<Option<String>> {
        let mut conn = self.pool.get_conn().await?;
        let query = format!("SHOW GLOBAL VARIABLES LIKE '{}'", name);
        let result: Vec<(String, String)> = conn.query(query).await?;
        Ok(result.into_iter().next().map(|(_, value)| value))
    }

    async fn execute(&mut self, sql: &str) -> Result<()> {
        self.command(COM_QUERY, sql.as_bytes()).await
    }

    async fn command(&mut self, command: u8, payload: &[u8]) -> Result<()> {
        self.channel.write_command(command, payload).await?;
        self.channel.read_ok().await?;
        Ok(())
    }

    async fn send_command(&mut self, command: u8, payload: &[u8]) -> Result<()> {
        self.channel.write_command(command, payload).await
    }

    async fn read_packet(&mut self) -> Result<Bytes> {
        self.channel.read_packet().await
    }

    async fn close(&mut self) {
        match self.pool.get_conn().await {
            Ok(mut conn) => {
                if let Err(e) = conn.ping().await {
                    debug!("Metadata session ping failed: {}", e);
                }
            }
            Err(e) => debug!("Metadata session unavailable on close: {}", e),
        }
        if let Err(e) = self.channel.write_command(COM_QUIT, &[]).await {
            debug!("COM_QUIT failed: {}", e);
        }
        self.channel.shutdown().await;
        if let Err(e) = self.pool.clone().disconnect().await {
            debug!("Metadata pool disconnect failed: {}", e);
        }
    }
}

/// `SELECT VERSION()` 결과에서 (major, minor) 추출
pub fn parse_server_version(version: &str) -> Result<(u32, u32)> {
    let re = Regex::new(r"^(\d+)\.(\d+)")
        .map_err(|e| ReplicaError::Config(format!("version pattern: {}", e)))?;
    let caps = re
        .captures(version.trim())
        .ok_or_else(|| ReplicaError::Query(format!("unrecognised server version '{}'", version)))?;
    let major = caps[1]
        .parse()
        .map_err(|_| ReplicaError::Query(format!("unrecognised server version '{}'", version)))?;
    let minor = caps[2]
        .parse()
        .map_err(|_| ReplicaError::Query(format!("unrecognised server version '{}'", version)))?;
    Ok((major, minor))
}

/// binlog v4 를 지원하지 않는 primary 거부
pub async fn check_primary_version<L: PrimaryLink>(link: &mut L) -> Result<(u32, u32)> {
    let version = link.server_version().await?;
    let (major, minor) = parse_server_version(&version)?;
    if major < 5 {
        return Err(ReplicaError::Config(format!(
            "unsupported primary version {} (5.0 or later required)",
            version
        )));
    }
    debug!("Primary version {}", version);
    Ok((major, minor))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_connection_config_default() {
        let config = ConnectionConfig::default();
        assert_eq!(config.hostname, "localhost");
        assert_eq!(config.port, 3306);
        assert_eq!(config.connect_timeout, Duration::from_secs(2));
    }

    #[test]
    fn test_connection_config_from_replica_config() {
        let replica = ReplicaConfig {
            master_host: "10.1.2.3".to_string(),
            master_port: 3307,
            master_user: "repl".to_string(),
            net_read_timeout: 60,
            ..Default::default()
        };
        let config = ConnectionConfig::from(&replica);
        assert_eq!(config.hostname, "10.1.2.3");
        assert_eq!(config.port, 3307);
        assert_eq!(config.username, "repl");
        assert_eq!(config.read_timeout, Some(Duration::from_secs(60)));
    }

    #[test]
    fn test_parse_server_version() {
        assert_eq!(parse_server_version("8.0.34-log").unwrap(), (8, 0));
        assert_eq!(parse_server_version("5.7.44").unwrap(), (5, 7));
        assert_eq!(parse_server_version("10.11.6-MariaDB").unwrap(), (10, 11));
        assert!(parse_server_version("unknown").is_err());
    }
}
