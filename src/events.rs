//! MySQL Binlog 이벤트 타입 및 제어 이벤트 데이터 구조 정의
//!
//! 이 클라이언트는 이벤트 본문을 해석하지 않고 그대로 저장합니다.
//! 여기서는 스트림 제어에 필요한 이벤트(ROTATE, FORMAT_DESCRIPTION,
//! XID, HEARTBEAT)만 정의합니다.

use chrono::{DateTime, Utc};

/// Binlog 파일 매직 헤더 (".bin")
pub const BINLOG_MAGIC: [u8; 4] = [0xfe, 0x62, 0x69, 0x6e];

/// 매직 헤더 크기 = 첫 이벤트의 시작 위치
pub const BIN_LOG_HEADER_SIZE: u64 = 4;

/// v4 공통 헤더 크기
pub const LOG_EVENT_MINIMAL_HEADER_LEN: usize = 19;

pub const BINLOG_CHECKSUM_LEN: usize = 4;

/// MySQL Binlog 이벤트 타입
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum EventType {
    /// 알 수 없는 이벤트 (본문은 그대로 저장)
    Unknown = 0,
    /// 로테이션 이벤트 (새 binlog 파일)
    RotateEvent = 4,
    /// 포맷 설명 이벤트 (헤더 길이, 체크섬 알고리즘)
    FormatDescriptionEvent = 15,
    /// 트랜잭션 커밋 이벤트
    XidEvent = 16,
    /// 하트비트 이벤트
    HeartbeatEvent = 27,
    /// GTID 이벤트
    GtidEvent = 33,
    /// 이전 GTID 집합 이벤트
    PreviousGtidsEvent = 35,
    /// 하트비트 이벤트 (8.0.26+)
    HeartbeatEventV2 = 41,
}

impl EventType {
    pub fn from_u8(val: u8) -> Self {
        match val {
            4 => EventType::RotateEvent,
            15 => EventType::FormatDescriptionEvent,
            16 => EventType::XidEvent,
            27 => EventType::HeartbeatEvent,
            33 => EventType::GtidEvent,
            35 => EventType::PreviousGtidsEvent,
            41 => EventType::HeartbeatEventV2,
            _ => EventType::Unknown,
        }
    }

    pub fn is_heartbeat(&self) -> bool {
        matches!(self, EventType::HeartbeatEvent | EventType::HeartbeatEventV2)
    }
}

/// Binlog 이벤트 공통 헤더
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EventHeader {
    /// 이벤트 타임스탬프 (초 단위). 0이면 가짜(synthetic) 이벤트
    pub timestamp: u32,
    /// 원본 타입 코드
    pub type_code: u8,
    /// MySQL 서버 ID
    pub server_id: u32,
    /// 이벤트 전체 길이 (헤더 + 본문 + 체크섬)
    pub event_length: u32,
    /// 이 이벤트가 끝나는 위치 (primary binlog 기준)
    pub log_pos: u32,
    /// 이벤트 플래그
    pub flags: u16,
}

impl EventHeader {
    pub fn event_type(&self) -> EventType {
        EventType::from_u8(self.type_code)
    }
}

/// 체크섬 알고리즘
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChecksumAlg {
    Off,
    Crc32,
    Undefined,
}

impl ChecksumAlg {
    pub fn from_u8(val: u8) -> Self {
        match val {
            0 => ChecksumAlg::Off,
            1 => ChecksumAlg::Crc32,
            _ => ChecksumAlg::Undefined,
        }
    }

    pub fn trailer_len(&self) -> usize {
        match self {
            ChecksumAlg::Crc32 => BINLOG_CHECKSUM_LEN,
            _ => 0,
        }
    }
}

/// 현재 활성화된 포맷 설명 (FormatDescriptionContext)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FormatDescription {
    pub binlog_version: u16,
    pub server_version: String,
    pub create_timestamp: u32,
    /// 공통 헤더 길이
    pub header_length: u8,
    pub post_header_lengths: Vec<u8>,
    pub checksum_alg: ChecksumAlg,
}

impl Default for FormatDescription {
    /// FDE를 받기 전까지 사용할 v4 기본 포맷 (체크섬 없음)
    fn default() -> Self {
        FormatDescription {
            binlog_version: 4,
            server_version: String::new(),
            create_timestamp: 0,
            header_length: LOG_EVENT_MINIMAL_HEADER_LEN as u8,
            post_header_lengths: Vec::new(),
            checksum_alg: ChecksumAlg::Off,
        }
    }
}

impl FormatDescription {
    pub fn created_at(&self) -> Option<DateTime<Utc>> {
        DateTime::from_timestamp(self.create_timestamp as i64, 0)
    }
}

/// 회전 이벤트 데이터
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RotateEventData {
    /// 새 바이너리 로그 파일명
    pub next_binlog_name: String,
    /// 새 파일의 시작 위치
    pub position: u64,
    /// 타임스탬프가 0인 가짜 rotate 여부
    pub synthetic: bool,
}

/// XID (트랜잭션 완료) 이벤트 데이터
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct XidEventData {
    pub xid: u64,
    /// 이 이벤트가 끝나는 위치 (헤더의 log_pos)
    pub log_pos: u32,
}
