//! Binlog 수신 위치 추적
//!
//! Primary binlog 파일명 + 위치로 재시작 지점을 추적합니다.
//! 예: "mysql-bin.000003" 파일의 4097 바이트 위치

use crate::events::BIN_LOG_HEADER_SIZE;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Binlog 파일 위치 정보 (StreamCursor)
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct BinlogPosition {
    /// 바이너리 로그 파일명 (e.g., "mysql-bin.000001"). 아직 모르면 빈 문자열
    pub filename: String,
    /// 바이트 위치
    pub position: u64,
}

impl BinlogPosition {
    pub fn new(filename: impl Into<String>, position: u64) -> Self {
        BinlogPosition {
            filename: filename.into(),
            position,
        }
    }

    /// 파일 첫 이벤트 위치 (매직 헤더 바로 뒤)
    pub fn start_of(filename: impl Into<String>) -> Self {
        Self::new(filename, BIN_LOG_HEADER_SIZE)
    }

    /// 현재 파일의 첫 이벤트 이전(또는 시작점)에 있는지 여부
    pub fn at_file_start(&self) -> bool {
        self.position <= BIN_LOG_HEADER_SIZE
    }

    /// 이벤트 수신 후 위치 갱신
    ///
    /// log_pos가 있으면 그대로 사용하고, 0이면 이벤트 길이만큼 전진합니다.
    pub fn advance(&mut self, log_pos: u32, event_length: u32) {
        if log_pos != 0 {
            self.position = log_pos as u64;
        } else {
            self.position += event_length as u64;
        }
    }

    pub fn set(&mut self, filename: &str, position: u64) {
        if self.filename != filename {
            self.filename = filename.to_string();
        }
        self.position = position;
    }
}

impl fmt::Display for BinlogPosition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.filename, self.position)
    }
}
