//! 설정 파일 (TOML) 로딩 및 검증
//!
//! 모든 키는 하나의 평평한 테이블에 있으며 생략하면 기본값을 사용합니다.
//!
//! ```toml
//! master_host = "10.0.0.5"
//! master_user = "repl"
//! master_password = "secret"
//! binlog_dir = "/data/binlog"
//! get_start_gtid_mode = 2
//! ```

use crate::error::{ReplicaError, Result};
use crate::events::BIN_LOG_HEADER_SIZE;
use crate::gtid::GtidSet;
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// 시작 위치 결정 방식 (get_start_gtid_mode)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Default)]
#[serde(try_from = "u8")]
pub enum StartupMode {
    /// 설정된 exclude_gtids 로 GTID 모드 시작 (로컬 파일 초기화)
    #[default]
    ConfiguredGtids,
    /// Primary의 gtid_executed 로 GTID 모드 시작 (로컬 파일 초기화)
    PrimaryExecuted,
    /// 로컬 인덱스의 마지막 파일에서 이어받기
    ResumeLocal,
}

impl TryFrom<u8> for StartupMode {
    type Error = String;

    fn try_from(value: u8) -> std::result::Result<Self, Self::Error> {
        match value {
            0 => Ok(StartupMode::ConfiguredGtids),
            1 => Ok(StartupMode::PrimaryExecuted),
            2 => Ok(StartupMode::ResumeLocal),
            other => Err(format!("get_start_gtid_mode must be 0, 1 or 2 (got {})", other)),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ReplicaConfig {
    pub master_host: String,
    pub master_port: u16,
    pub master_user: String,
    pub master_password: String,
    pub bind_address: Option<String>,

    /// 초 단위. 0이면 primary 기본값
    pub heartbeat_period: u64,
    /// 초 단위. 0이면 읽기 타임아웃 없음
    pub net_read_timeout: u64,

    pub get_start_gtid_mode: StartupMode,
    pub virtual_slave_server_id: u32,

    pub binlog_dir: Option<PathBuf>,
    pub index_file: String,
    pub exclude_gtids: String,

    pub log_level: String,
    pub log_file: Option<String>,

    pub fsync_mode: bool,
    pub start_position: u64,
    pub stop_never: bool,
    pub to_last_log: bool,
    pub semi_sync: bool,
    pub replica_uuid: Option<String>,

    pub report_host: String,
    pub report_user: String,
    pub report_password: String,
    pub report_port: u16,

    /// 0이면 무제한
    pub max_reconnect_attempts: u32,
    pub reconnect_backoff_ms: u64,
    pub max_reconnect_backoff_ms: u64,
}

impl Default for ReplicaConfig {
    fn default() -> Self {
        ReplicaConfig {
            master_host: "127.0.0.1".to_string(),
            master_port: 3306,
            master_user: "root".to_string(),
            master_password: String::new(),
            bind_address: None,
            heartbeat_period: 0,
            net_read_timeout: 0,
            get_start_gtid_mode: StartupMode::default(),
            virtual_slave_server_id: 1,
            binlog_dir: None,
            index_file: "binlog.index".to_string(),
            exclude_gtids: String::new(),
            log_level: "info".to_string(),
            log_file: None,
            fsync_mode: false,
            start_position: BIN_LOG_HEADER_SIZE,
            stop_never: true,
            to_last_log: false,
            semi_sync: true,
            replica_uuid: None,
            report_host: String::new(),
            report_user: String::new(),
            report_password: String::new(),
            report_port: 0,
            max_reconnect_attempts: 0,
            reconnect_backoff_ms: 1000,
            max_reconnect_backoff_ms: 30_000,
        }
    }
}

impl ReplicaConfig {
    /// 설정 파일 로드 + 검증
    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path).map_err(|e| {
            ReplicaError::Config(format!("cannot read {}: {}", path.display(), e))
        })?;
        Self::from_toml_str(&text)
    }

    pub fn from_toml_str(text: &str) -> Result<Self> {
        let mut config: ReplicaConfig =
            toml::from_str(text).map_err(|e| ReplicaError::Config(e.to_string()))?;
        config.validate()?;
        if config.replica_uuid.is_none() {
            config.replica_uuid = Some(uuid::Uuid::new_v4().to_string());
        }
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.binlog_dir.is_none() {
            return Err(ReplicaError::Config("binlog_dir is required".to_string()));
        }
        if self.virtual_slave_server_id == 0 {
            return Err(ReplicaError::Config(
                "virtual_slave_server_id must be non-zero".to_string(),
            ));
        }
        if self.start_position < BIN_LOG_HEADER_SIZE {
            return Err(ReplicaError::Config(format!(
                "start_position must be at least {} (got {})",
                BIN_LOG_HEADER_SIZE, self.start_position
            )));
        }
        if self.index_file.is_empty() || self.index_file.contains(['/', '\\']) {
            return Err(ReplicaError::Config(format!(
                "index_file must be a plain file name (got '{}')",
                self.index_file
            )));
        }
        GtidSet::parse(&self.exclude_gtids)
            .map_err(|e| ReplicaError::Config(format!("exclude_gtids: {}", e)))?;
        if let Some(uuid) = &self.replica_uuid {
            uuid::Uuid::parse_str(uuid)
                .map_err(|e| ReplicaError::Config(format!("replica_uuid: {}", e)))?;
        }
        Ok(())
    }

    pub fn binlog_dir(&self) -> &Path {
        self.binlog_dir.as_deref().unwrap_or_else(|| Path::new("."))
    }

    /// `SET @master_heartbeat_period` 값 (나노초)
    pub fn heartbeat_period_ns(&self) -> u64 {
        self.heartbeat_period.saturating_mul(1_000_000_000)
    }

    pub fn read_timeout(&self) -> Option<Duration> {
        (self.net_read_timeout > 0).then(|| Duration::from_secs(self.net_read_timeout))
    }

    pub fn replica_uuid(&self) -> &str {
        self.replica_uuid.as_deref().unwrap_or_default()
    }

    /// n번째 재시도 전 대기 시간: min(base * 2^n, max)
    pub fn reconnect_delay(&self, attempt: u32) -> Duration {
        let factor = 1u64.checked_shl(attempt.min(32)).unwrap_or(u64::MAX);
        let delay = self
            .reconnect_backoff_ms
            .saturating_mul(factor)
            .min(self.max_reconnect_backoff_ms.max(self.reconnect_backoff_ms));
        Duration::from_millis(delay)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_minimal_config_uses_defaults() {
        let config = ReplicaConfig::from_toml_str(r#"binlog_dir = "/tmp/mirror""#).unwrap();
        assert_eq!(config.master_port, 3306);
        assert_eq!(config.get_start_gtid_mode, StartupMode::ConfiguredGtids);
        assert_eq!(config.start_position, 4);
        assert!(config.stop_never);
        assert_eq!(config.binlog_dir(), Path::new("/tmp/mirror"));
        assert_eq!(config.index_file, "binlog.index");
        assert!(uuid::Uuid::parse_str(config.replica_uuid()).is_ok());
        assert_eq!(config.read_timeout(), None);
    }

    #[test]
    fn test_full_config() {
        let text = r#"
            master_host = "10.0.0.5"
            master_port = 3307
            master_user = "repl"
            master_password = "secret"
            heartbeat_period = 5
            net_read_timeout = 30
            get_start_gtid_mode = 2
            virtual_slave_server_id = 1001
            binlog_dir = "/data/binlog"
            exclude_gtids = "3e11fa47-71ca-11e1-9e33-c80aa9429562:1-100"
            fsync_mode = true
            replica_uuid = "0b6a4c36-5c0f-4b55-9df0-6d2b8c3f4a10"
        "#;
        let config = ReplicaConfig::from_toml_str(text).unwrap();
        assert_eq!(config.get_start_gtid_mode, StartupMode::ResumeLocal);
        assert_eq!(config.heartbeat_period_ns(), 5_000_000_000);
        assert_eq!(config.read_timeout(), Some(Duration::from_secs(30)));
        assert_eq!(config.replica_uuid(), "0b6a4c36-5c0f-4b55-9df0-6d2b8c3f4a10");
        assert!(config.fsync_mode);
    }

    #[test]
    fn test_invalid_configs() {
        let cases = [
            "master_port = 3306",
            "binlog_dir = \"/tmp\"\nget_start_gtid_mode = 3",
            "binlog_dir = \"/tmp\"\nvirtual_slave_server_id = 0",
            "binlog_dir = \"/tmp\"\nstart_position = 2",
            "binlog_dir = \"/tmp\"\nexclude_gtids = \"not-a-uuid:1-5\"",
            "binlog_dir = \"/tmp\"\nunknown_key = 1",
        ];
        for text in cases {
            assert!(
                matches!(ReplicaConfig::from_toml_str(text), Err(ReplicaError::Config(_))),
                "expected config error for {:?}",
                text
            );
        }
    }

    #[test]
    fn test_reconnect_delay_is_capped() {
        let config = ReplicaConfig {
            reconnect_backoff_ms: 100,
            max_reconnect_backoff_ms: 1000,
            ..Default::default()
        };
        assert_eq!(config.reconnect_delay(0), Duration::from_millis(100));
        assert_eq!(config.reconnect_delay(2), Duration::from_millis(400));
        assert_eq!(config.reconnect_delay(10), Duration::from_millis(1000));
        assert_eq!(config.reconnect_delay(80), Duration::from_millis(1000));
    }
}
