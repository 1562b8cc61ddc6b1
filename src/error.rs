//! 복제 클라이언트 에러 타입
//!
//! 네트워크/프로토콜 계열 에러는 재연결로 복구하고,
//! 로컬 저장소 및 설정 에러는 프로세스를 종료시킵니다.

use thiserror::Error;
use std::io;

#[derive(Error, Debug)]
pub enum ReplicaError {
    #[error("설정 에러: {0}")]
    Config(String),

    #[error("MySQL 연결 에러 ({code}): {message}")]
    Connect { code: u16, message: String },

    #[error("쿼리 실행 에러: {0}")]
    Query(String),

    #[error("네트워크 에러: {0}")]
    Network(String),

    #[error("Primary 에러 패킷 ({code}): {message}")]
    Primary { code: u16, message: String },

    #[error("프로토콜 에러: {0}")]
    Protocol(String),

    #[error("GTID 파싱 에러: {0}")]
    GtidParse(String),

    /// 로컬 파일/인덱스 I/O 에러. 네트워크 I/O는 `Network`로 변환해야 합니다.
    #[error("I/O 에러: {0}")]
    Io(#[from] io::Error),

    #[error("재연결 시도 {0}회 초과")]
    RetriesExhausted(u32),
}

impl ReplicaError {
    /// 재시도하지 않고 프로세스를 종료해야 하는 에러인지 여부
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            ReplicaError::Config(_)
                | ReplicaError::GtidParse(_)
                | ReplicaError::Io(_)
                | ReplicaError::RetriesExhausted(_)
        )
    }

    /// Primary가 보고한 에러 코드 (있는 경우)
    pub fn error_code(&self) -> Option<u16> {
        match self {
            ReplicaError::Connect { code, .. } | ReplicaError::Primary { code, .. } => Some(*code),
            _ => None,
        }
    }

    pub fn connect(message: impl Into<String>) -> Self {
        ReplicaError::Connect {
            code: 0,
            message: message.into(),
        }
    }
}

impl From<mysql_async::Error> for ReplicaError {
    fn from(err: mysql_async::Error) -> Self {
        match err {
            mysql_async::Error::Server(e) => ReplicaError::Connect {
                code: e.code,
                message: e.message,
            },
            other => ReplicaError::Query(other.to_string()),
        }
    }
}

pub type Result<T> = std::result::Result<T, ReplicaError>;
