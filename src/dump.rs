//! Binlog dump 요청 및 replica 등록 패킷 생성
//!
//! COM_BINLOG_DUMP (0x12):
//!   - Position (4 bytes)
//!   - Flags (2 bytes)
//!   - Server ID (4 bytes)
//!   - Binlog filename (나머지 전부, 길이 prefix 없음)
//!
//! COM_BINLOG_DUMP_GTID (0x1e):
//!   - Flags (2 bytes)
//!   - Server ID (4 bytes)
//!   - Filename length (4 bytes) + filename
//!   - Position (8 bytes)
//!   - GTID data length (4 bytes) + 인코딩된 GTID 집합

use crate::error::{ReplicaError, Result};
use crate::events::BIN_LOG_HEADER_SIZE;
use crate::gtid::GtidSet;
use bytes::Bytes;

pub const COM_BINLOG_DUMP: u8 = 0x12;
pub const COM_REGISTER_SLAVE: u8 = 0x15;
pub const COM_BINLOG_DUMP_GTID: u8 = 0x1e;

/// 더 이상 이벤트가 없으면 EOF 패킷을 보내도록 요청
pub const BINLOG_DUMP_NON_BLOCK: u16 = 1;

/// 파일명 최대 길이 (FN_REFLEN - 1)
pub const MAX_BINLOG_NAME_LEN: usize = 511;

const MAX_REPORT_HOST_LEN: usize = 255;
const MAX_REPORT_USER_LEN: usize = 32;
const MAX_REPORT_PASSWORD_LEN: usize = 32;

/// 요청 주소 지정 방식
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DumpMode {
    /// 파일명 + 바이트 위치
    Position,
    /// 제외할 GTID 집합
    Gtid,
}

/// 한 번의 연결 시도에 사용하는 dump 요청 (생성 후 불변)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DumpRequest {
    mode: DumpMode,
    file_name: String,
    position: u64,
    server_id: u32,
    excluded: Vec<u8>,
    non_blocking: bool,
}

impl DumpRequest {
    /// Position 모드 요청. 위치는 4바이트로만 표현 가능
    pub fn position(
        file_name: &str,
        position: u64,
        server_id: u32,
        non_blocking: bool,
    ) -> Result<Self> {
        check_file_name(file_name)?;
        if position > u32::MAX as u64 {
            return Err(ReplicaError::Config(format!(
                "binlog position {} does not fit COM_BINLOG_DUMP",
                position
            )));
        }
        Ok(DumpRequest {
            mode: DumpMode::Position,
            file_name: file_name.to_string(),
            position,
            server_id,
            excluded: Vec::new(),
            non_blocking,
        })
    }

    /// GTID 모드 요청. 제외 집합은 요청 생성 시점의 스냅샷
    pub fn gtid(
        excluded: &GtidSet,
        position: u64,
        server_id: u32,
        non_blocking: bool,
    ) -> Result<Self> {
        let mut encoded = Vec::with_capacity(excluded.encoded_length());
        excluded.encode(&mut encoded);
        if encoded.len() > u32::MAX as usize {
            return Err(ReplicaError::Config(format!(
                "excluded GTID set too large to encode ({} bytes)",
                encoded.len()
            )));
        }
        Ok(DumpRequest {
            mode: DumpMode::Gtid,
            file_name: String::new(),
            position: position.max(BIN_LOG_HEADER_SIZE),
            server_id,
            excluded: encoded,
            non_blocking,
        })
    }

    pub fn mode(&self) -> DumpMode {
        self.mode
    }

    pub fn file_name(&self) -> &str {
        &self.file_name
    }

    pub fn start_position(&self) -> u64 {
        self.position
    }

    pub fn command(&self) -> u8 {
        match self.mode {
            DumpMode::Position => COM_BINLOG_DUMP,
            DumpMode::Gtid => COM_BINLOG_DUMP_GTID,
        }
    }

    fn flags(&self) -> u16 {
        if self.non_blocking {
            BINLOG_DUMP_NON_BLOCK
        } else {
            0
        }
    }

    /// 명령 바이트를 제외한 payload 인코딩
    pub fn encode(&self) -> Bytes {
        let mut buffer = Vec::new();
        match self.mode {
            DumpMode::Position => {
                buffer.extend_from_slice(&(self.position as u32).to_le_bytes());
                buffer.extend_from_slice(&self.flags().to_le_bytes());
                buffer.extend_from_slice(&self.server_id.to_le_bytes());
                buffer.extend_from_slice(self.file_name.as_bytes());
            }
            DumpMode::Gtid => {
                buffer.extend_from_slice(&self.flags().to_le_bytes());
                buffer.extend_from_slice(&self.server_id.to_le_bytes());
                buffer.extend_from_slice(&(self.file_name.len() as u32).to_le_bytes());
                buffer.extend_from_slice(self.file_name.as_bytes());
                buffer.extend_from_slice(&self.position.to_le_bytes());
                buffer.extend_from_slice(&(self.excluded.len() as u32).to_le_bytes());
                buffer.extend_from_slice(&self.excluded);
            }
        }
        Bytes::from(buffer)
    }
}

fn check_file_name(file_name: &str) -> Result<()> {
    if file_name.len() > MAX_BINLOG_NAME_LEN {
        return Err(ReplicaError::Config(format!(
            "binlog file name is {} bytes (max {})",
            file_name.len(),
            MAX_BINLOG_NAME_LEN
        )));
    }
    Ok(())
}

/// SHOW SLAVE HOSTS 에 노출되는 등록 정보
#[derive(Debug, Clone, Default)]
pub struct Registration {
    pub server_id: u32,
    pub report_host: String,
    pub report_user: String,
    pub report_password: String,
    pub report_port: u16,
}

impl Registration {
    /// COM_REGISTER_SLAVE payload. 보고 문자열이 제한을 넘으면 None (등록 생략)
    pub fn encode(&self) -> Option<Bytes> {
        if self.report_host.len() > MAX_REPORT_HOST_LEN
            || self.report_user.len() > MAX_REPORT_USER_LEN
            || self.report_password.len() > MAX_REPORT_PASSWORD_LEN
        {
            return None;
        }

        let mut buffer = Vec::with_capacity(
            18 + self.report_host.len() + self.report_user.len() + self.report_password.len(),
        );
        buffer.extend_from_slice(&self.server_id.to_le_bytes());
        for field in [&self.report_host, &self.report_user, &self.report_password] {
            buffer.push(field.len() as u8);
            buffer.extend_from_slice(field.as_bytes());
        }
        // report_port + rpl_recovery_rank + master_id
        buffer.extend_from_slice(&self.report_port.to_le_bytes());
        buffer.extend_from_slice(&[0u8; 8]);
        Some(Bytes::from(buffer))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SID: &str = "3e11fa47-71ca-11e1-9e33-c80aa9429562";

    #[test]
    fn test_position_request_bytes() {
        let request = DumpRequest::position("mysql-bin.000042", 1234, 7, false).unwrap();
        assert_eq!(request.command(), COM_BINLOG_DUMP);

        let mut expected = vec![0xd2, 0x04, 0x00, 0x00, 0x00, 0x00, 0x07, 0x00, 0x00, 0x00];
        expected.extend_from_slice(b"mysql-bin.000042");
        assert_eq!(&request.encode()[..], &expected[..]);
    }

    #[test]
    fn test_non_blocking_flag() {
        let request = DumpRequest::position("mysql-bin.000001", 4, 1, true).unwrap();
        assert_eq!(&request.encode()[4..6], &[0x01, 0x00]);
    }

    #[test]
    fn test_position_request_rejects_oversized_fields() {
        let long_name = "x".repeat(MAX_BINLOG_NAME_LEN + 1);
        assert!(matches!(
            DumpRequest::position(&long_name, 4, 1, false),
            Err(ReplicaError::Config(_))
        ));
        assert!(matches!(
            DumpRequest::position("mysql-bin.000001", u32::MAX as u64 + 1, 1, false),
            Err(ReplicaError::Config(_))
        ));
    }

    #[test]
    fn test_gtid_request_bytes() {
        let excluded = GtidSet::parse(&format!("{}:1-5", SID)).unwrap();
        let request = DumpRequest::gtid(&excluded, 4, 9, false).unwrap();
        assert_eq!(request.command(), COM_BINLOG_DUMP_GTID);
        assert_eq!(request.file_name(), "");

        let payload = request.encode();
        let mut expected = vec![0x00, 0x00, 0x09, 0x00, 0x00, 0x00];
        expected.extend_from_slice(&0u32.to_le_bytes());
        expected.extend_from_slice(&4u64.to_le_bytes());
        expected.extend_from_slice(&48u32.to_le_bytes());
        expected.extend_from_slice(&1u64.to_le_bytes());
        expected.extend_from_slice(uuid::Uuid::parse_str(SID).unwrap().as_bytes());
        expected.extend_from_slice(&1u64.to_le_bytes());
        expected.extend_from_slice(&1u64.to_le_bytes());
        expected.extend_from_slice(&6u64.to_le_bytes());
        assert_eq!(&payload[..], &expected[..]);
    }

    #[test]
    fn test_gtid_request_with_empty_set() {
        let request = DumpRequest::gtid(&GtidSet::new(), 4, 1, true).unwrap();
        let payload = request.encode();
        assert_eq!(payload.len(), 2 + 4 + 4 + 8 + 4 + 8);
        assert_eq!(&payload[18..22], &8u32.to_le_bytes());
        assert_eq!(&payload[22..], &0u64.to_le_bytes());
    }

    #[test]
    fn test_gtid_snapshot_is_immutable() {
        let excluded = GtidSet::parse(&format!("{}:1-5", SID)).unwrap();
        let request = DumpRequest::gtid(&excluded, 4, 1, false).unwrap();
        let before = request.encode();
        excluded.add_from_text(&format!("{}:6-10", SID)).unwrap();
        assert_eq!(request.encode(), before);
    }

    #[test]
    fn test_register_payload() {
        let registration = Registration {
            server_id: 101,
            report_host: "replica-1".to_string(),
            report_user: "repl".to_string(),
            report_password: String::new(),
            report_port: 3307,
        };
        let payload = registration.encode().unwrap();

        let mut expected = 101u32.to_le_bytes().to_vec();
        expected.push(9);
        expected.extend_from_slice(b"replica-1");
        expected.push(4);
        expected.extend_from_slice(b"repl");
        expected.push(0);
        expected.extend_from_slice(&3307u16.to_le_bytes());
        expected.extend_from_slice(&[0u8; 8]);
        assert_eq!(&payload[..], &expected[..]);
    }

    #[test]
    fn test_register_skipped_for_long_user() {
        let registration = Registration {
            server_id: 1,
            report_user: "u".repeat(33),
            ..Default::default()
        };
        assert!(registration.encode().is_none());
    }
}
