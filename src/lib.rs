//! MySQL binlog 미러 (가상 replica)
//!
//! Primary에 replica로 등록해 binlog 이벤트를 받아 원본과 같은 바이트로
//! 로컬 세그먼트 파일과 인덱스 파일에 기록합니다.
//! 주요 기능:
//! - Position / GTID 모드 dump 요청
//! - 제어 이벤트(rotate, FDE, XID, heartbeat)만 해석하는 수신 루프
//! - 연결 장애 시 바이트 단위로 이어받는 복구, server_uuid 기반 failover 감지
//! - Semi-sync 응답

pub mod auth;
pub mod binlog;
pub mod config;
pub mod connection;
pub mod dump;
pub mod error;
pub mod events;
pub mod gtid;
pub mod identity;
pub mod offset;
pub mod protocol;
pub mod recovery;
pub mod replica;
pub mod semisync;
pub mod writer;

#[cfg(test)]
mod test_support;

pub use config::{ReplicaConfig, StartupMode};
pub use connection::{ConnectionConfig, MySqlConnector};
pub use error::{ReplicaError, Result};
pub use events::EventType;
pub use gtid::GtidSet;
pub use offset::BinlogPosition;
pub use replica::Replica;
