//! 재연결/복구 상태
//!
//! 장애가 나면 상태는 RECOVERING이 되고, 재연결 후 primary가 바뀌었는지에
//! 따라 위치 모드로 이어받을지 GTID 모드로 다시 시작할지 결정합니다.

use crate::binlog::BinlogParser;
use crate::dump::DumpMode;
use crate::error::Result;
use crate::events::{EventType, FormatDescription, BIN_LOG_HEADER_SIZE, LOG_EVENT_MINIMAL_HEADER_LEN};
use crate::offset::BinlogPosition;
use crate::writer::OpenMode;
use std::fs::File;
use std::io::{BufReader, ErrorKind, Read};
use std::path::Path;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnState {
    Normal,
    Recovering,
}

/// 재연결 후 상태 전이 결과
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    /// 변화 없음 (NORMAL 상태에서 연결)
    Start,
    /// 같은 primary: 위치 모드로 이어받기
    Resume,
    /// primary 변경: 제외 GTID 집합을 다시 구하고 덮어쓰기
    Failover,
}

/// 상태 머신만 변경하는 복구 정보
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecoveryState {
    pub state: ConnState,
    pub mode: DumpMode,
    /// 다음 요청의 파일명 + 위치
    pub resume: BinlogPosition,
    /// 마지막으로 기록된 이벤트의 끝 위치 (primary 기준)
    pub last_acked: u64,
    pub open_mode: OpenMode,
}

impl RecoveryState {
    /// 로컬 파일을 비운 뒤 GTID 모드로 새로 시작 (모드 0, 1)
    pub fn fresh_gtid() -> Self {
        RecoveryState {
            state: ConnState::Normal,
            mode: DumpMode::Gtid,
            resume: BinlogPosition::start_of(""),
            last_acked: 0,
            open_mode: OpenMode::Truncate,
        }
    }

    pub fn is_recovering(&self) -> bool {
        self.state == ConnState::Recovering
    }

    /// 이벤트를 기록한 뒤 호출
    pub fn acknowledge(&mut self, position: u64) {
        self.last_acked = position;
    }

    /// 연결/프로토콜 장애 발생
    ///
    /// NORMAL에서 처음 장애가 났을 때만 재개 지점을 기록합니다.
    /// 이미 RECOVERING이면 이전 결정(덮어쓰기, 잘라낼 위치 등)을 유지합니다.
    /// 현재 파일에 아직 아무 이벤트도 기록하지 않았다면 덮어쓰기 결정도 유지합니다.
    pub fn on_fault(&mut self, cursor: &BinlogPosition) {
        if self.state == ConnState::Recovering {
            return;
        }
        self.state = ConnState::Recovering;
        self.resume = BinlogPosition::new(cursor.filename.clone(), self.last_acked);
        self.open_mode = if self.last_acked <= BIN_LOG_HEADER_SIZE {
            OpenMode::Truncate
        } else {
            OpenMode::Append { truncate_to: None }
        };
    }

    /// primary가 binlog를 읽을 수 없다고 보고함 (1236): 처음부터 다시 받음
    pub fn on_fatal_read(&mut self) {
        self.state = ConnState::Recovering;
        self.mode = DumpMode::Position;
        self.resume = BinlogPosition::new("", 0);
        self.last_acked = 0;
        self.open_mode = OpenMode::Truncate;
    }

    /// 재연결 + identity 조회 후 호출
    pub fn transition(&mut self, switched: bool, start_position: u64) -> Transition {
        if self.state == ConnState::Normal {
            return Transition::Start;
        }

        if switched {
            // 이전 primary의 위치는 새 primary에서 의미가 없음
            self.mode = DumpMode::Gtid;
            self.open_mode = OpenMode::Truncate;
            self.resume = BinlogPosition::start_of("");
            self.last_acked = 0;
            return Transition::Failover;
        }

        if !self.resume.filename.is_empty() {
            self.mode = DumpMode::Position;
            self.resume.position = start_position.max(self.last_acked);
        } else {
            self.resume.position = start_position.max(self.resume.position);
        }
        Transition::Resume
    }

    /// RECOVERING이 끝나고 정상 처리로 돌아감
    pub fn finish_recovery(&mut self) {
        if self.state == ConnState::Recovering {
            info!(resume = %self.resume, "Recovery finished");
        }
        self.state = ConnState::Normal;
    }
}

/// 로컬 세그먼트에서 찾은 마지막 XID
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct XidMark {
    /// XID 이벤트 헤더의 log_pos (primary 기준 재개 위치)
    pub log_pos: u32,
    /// 로컬 파일에서 XID 이벤트가 끝나는 오프셋
    pub local_end: u64,
}

/// 세그먼트를 앞에서부터 이벤트 길이로 훑어 마지막 XID를 찾습니다.
///
/// 길이가 맞지 않는 꼬리(기록 중 중단된 이벤트)에서 멈추며,
/// XID는 길이와 체크섬으로 구조를 검증합니다.
pub fn scan_last_xid(path: &Path) -> Result<Option<XidMark>> {
    let file = match File::open(path) {
        Ok(file) => file,
        Err(e) if e.kind() == ErrorKind::NotFound => {
            warn!(file = %path.display(), "Last indexed binlog file is missing");
            return Ok(None);
        }
        Err(e) => return Err(e.into()),
    };
    let mut reader = BufReader::new(file);

    let mut magic = [0u8; BIN_LOG_HEADER_SIZE as usize];
    if read_fully(&mut reader, &mut magic)?.is_none() || BinlogParser::verify_magic(&magic).is_err() {
        warn!(file = %path.display(), "Binlog file has no valid magic header");
        return Ok(None);
    }

    let mut context = FormatDescription::default();
    let mut offset = BIN_LOG_HEADER_SIZE;
    let mut last_xid = None;
    let mut event = Vec::new();

    loop {
        let mut header = [0u8; LOG_EVENT_MINIMAL_HEADER_LEN];
        if read_fully(&mut reader, &mut header)?.is_none() {
            break;
        }
        let length = match BinlogParser::parse_header(&header) {
            Ok(h) => h.event_length as usize,
            Err(e) => {
                debug!(offset, "Stopping scan at unreadable header: {}", e);
                break;
            }
        };

        event.clear();
        event.extend_from_slice(&header);
        event.resize(length, 0);
        if read_fully(&mut reader, &mut event[LOG_EVENT_MINIMAL_HEADER_LEN..])?.is_none() {
            debug!(offset, length, "Stopping scan at partial event");
            break;
        }

        match EventType::from_u8(header[4]) {
            EventType::FormatDescriptionEvent => match BinlogParser::parse_format_description(&event) {
                Ok(fde) => context = fde,
                Err(e) => {
                    warn!(offset, "Unreadable format description in local file: {}", e);
                    break;
                }
            },
            EventType::XidEvent => match BinlogParser::parse_xid_event(&event, &context) {
                Ok(xid) => {
                    last_xid = Some(XidMark {
                        log_pos: xid.log_pos,
                        local_end: offset + length as u64,
                    })
                }
                Err(e) => {
                    warn!(offset, "Invalid XID event in local file: {}", e);
                    break;
                }
            },
            _ => {}
        }
        offset += length as u64;
    }

    Ok(last_xid)
}

/// 버퍼를 가득 채우거나, 파일 끝이면 None
fn read_fully<R: Read>(reader: &mut R, buf: &mut [u8]) -> Result<Option<()>> {
    match reader.read_exact(buf) {
        Ok(()) => Ok(Some(())),
        Err(e) if e.kind() == ErrorKind::UnexpectedEof => Ok(None),
        Err(e) => Err(e.into()),
    }
}
