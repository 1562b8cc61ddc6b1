//! 테스트용 binlog 이벤트 생성기

use crate::binlog::BinlogParser;
use crate::events::{FormatDescription, LOG_EVENT_MINIMAL_HEADER_LEN};

pub const ROTATE_EVENT: u8 = 4;
pub const QUERY_EVENT: u8 = 2;
pub const FDE_EVENT: u8 = 15;
pub const XID_EVENT: u8 = 16;
pub const HEARTBEAT_EVENT: u8 = 27;

/// FDE post-header 길이 배열 항목 수
pub const FDE_TYPE_COUNT: usize = 40;
/// CRC32가 붙은 FDE 전체 길이
pub const FDE_EVENT_LEN_CRC: usize = LOG_EVENT_MINIMAL_HEADER_LEN + 57 + FDE_TYPE_COUNT + 1 + 4;
pub const XID_EVENT_LEN_CRC: usize = LOG_EVENT_MINIMAL_HEADER_LEN + 8 + 4;

pub const SERVER_ID: u32 = 1;

/// 헤더 + 본문 (+ CRC32) 이벤트
pub fn event(type_code: u8, timestamp: u32, log_pos: u32, body: &[u8], crc: bool) -> Vec<u8> {
    let length = LOG_EVENT_MINIMAL_HEADER_LEN + body.len() + if crc { 4 } else { 0 };
    let mut out = Vec::with_capacity(length);
    out.extend_from_slice(&timestamp.to_le_bytes());
    out.push(type_code);
    out.extend_from_slice(&SERVER_ID.to_le_bytes());
    out.extend_from_slice(&(length as u32).to_le_bytes());
    out.extend_from_slice(&log_pos.to_le_bytes());
    out.extend_from_slice(&0u16.to_le_bytes());
    out.extend_from_slice(body);
    if crc {
        let checksum = crc32fast::hash(&out);
        out.extend_from_slice(&checksum.to_le_bytes());
    }
    out
}

/// 본문을 해석하지 않는 QUERY 이벤트 (log_pos 지정)
pub fn opaque_event(timestamp: u32, log_pos: u32, body_len: usize, crc: bool) -> Vec<u8> {
    let body: Vec<u8> = (0..body_len).map(|i| (i % 251) as u8).collect();
    event(QUERY_EVENT, timestamp, log_pos, &body, crc)
}

/// `start` 위치에서 시작하는 QUERY 이벤트 (log_pos = start + 길이)
pub fn opaque_event_at(timestamp: u32, start: u32, body_len: usize, crc: bool) -> Vec<u8> {
    let length = LOG_EVENT_MINIMAL_HEADER_LEN + body_len + if crc { 4 } else { 0 };
    opaque_event(timestamp, start + length as u32, body_len, crc)
}

pub fn fde_event(timestamp: u32, log_pos: u32, crc: bool) -> Vec<u8> {
    let mut body = Vec::new();
    body.extend_from_slice(&4u16.to_le_bytes());
    let mut version = [0u8; 50];
    version[..6].copy_from_slice(b"8.0.34");
    body.extend_from_slice(&version);
    body.extend_from_slice(&timestamp.to_le_bytes());
    body.push(LOG_EVENT_MINIMAL_HEADER_LEN as u8);
    let mut post_headers = vec![0u8; FDE_TYPE_COUNT];
    post_headers[FDE_EVENT as usize - 1] = (57 + FDE_TYPE_COUNT) as u8;
    post_headers[ROTATE_EVENT as usize - 1] = 8;
    body.extend_from_slice(&post_headers);
    body.push(if crc { 1 } else { 0 });
    event(FDE_EVENT, timestamp, log_pos, &body, crc)
}

/// CRC32 체크섬을 쓰는 포맷 컨텍스트
pub fn crc_context() -> FormatDescription {
    BinlogParser::parse_format_description(&fde_event(1, 125, true))
        .expect("synthetic FDE parses")
}

pub fn rotate_event(timestamp: u32, name: &str, position: u64, log_pos: u32, crc: bool) -> Vec<u8> {
    let mut body = position.to_le_bytes().to_vec();
    body.extend_from_slice(name.as_bytes());
    event(ROTATE_EVENT, timestamp, log_pos, &body, crc)
}

pub fn xid_event(timestamp: u32, xid: u64, log_pos: u32, crc: bool) -> Vec<u8> {
    event(XID_EVENT, timestamp, log_pos, &xid.to_le_bytes(), crc)
}

pub fn heartbeat_event(name: &str, log_pos: u32) -> Vec<u8> {
    event(HEARTBEAT_EVENT, 0, log_pos, name.as_bytes(), false)
}
