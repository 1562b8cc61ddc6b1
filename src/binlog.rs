//! MySQL Binlog 이벤트 파싱
//!
//! 이벤트 구조 (v4):
//!   - Timestamp (4 bytes)
//!   - Type (1 byte)
//!   - Server ID (4 bytes)
//!   - Event Length (4 bytes)
//!   - Next Position (4 bytes)
//!   - Flags (2 bytes)
//!   - Event Data (variable)
//!   - Checksum (0 or 4 bytes, FDE의 체크섬 알고리즘에 따름)
//!
//! 모든 필드 접근은 범위를 검사하며, 짧거나 잘못된 버퍼는
//! `ReplicaError::Protocol`로 보고합니다.

use crate::error::{ReplicaError, Result};
use crate::events::*;
use byteorder::{LittleEndian, ReadBytesExt};
use std::io::Cursor;


/// FDE 본문의 고정 필드 길이 (binlog_version + server_version + create_timestamp + header_length)
const FDE_FIXED_LEN: usize = 2 + 50 + 4 + 1;

/// 체크섬 인식 버전(5.6.1+)의 FDE 꼬리: 알고리즘(1) + CRC32(4). 체크섬이 꺼져 있으면 알고리즘만
const FDE_CHECKSUM_TRAILER_LEN: usize = 1 + BINLOG_CHECKSUM_LEN;

/// ROTATE 이벤트 post-header (다음 파일 시작 위치)
const ROTATE_POST_HEADER_LEN: usize = 8;

/// XID 이벤트 본문
const XID_BODY_LEN: usize = 8;

fn short(what: &str, need: usize, have: usize) -> ReplicaError {
    ReplicaError::Protocol(format!(
        "{}: need {} bytes, got {}",
        what, need, have
    ))
}

/// Binlog 이벤트 파서
pub struct BinlogParser;

impl BinlogParser {
    /// Binlog 파일 헤더 검증
    pub fn verify_magic(data: &[u8]) -> Result<()> {
        if data.len() < BINLOG_MAGIC.len() {
            return Err(ReplicaError::Protocol(
                "Invalid binlog: too short".to_string(),
            ));
        }

        if data[..4] == BINLOG_MAGIC[..] {
            Ok(())
        } else {
            Err(ReplicaError::Protocol(
                "Invalid binlog magic number".to_string(),
            ))
        }
    }

    /// 이벤트 헤더 파싱
    pub fn parse_header(data: &[u8]) -> Result<EventHeader> {
        if data.len() < LOG_EVENT_MINIMAL_HEADER_LEN {
            return Err(short("event header", LOG_EVENT_MINIMAL_HEADER_LEN, data.len()));
        }

        let mut cursor = Cursor::new(data);
        let header = EventHeader {
            timestamp: read_u32(&mut cursor)?,
            type_code: cursor.read_u8().map_err(protocol)?,
            server_id: read_u32(&mut cursor)?,
            event_length: read_u32(&mut cursor)?,
            log_pos: read_u32(&mut cursor)?,
            flags: cursor.read_u16::<LittleEndian>().map_err(protocol)?,
        };

        if (header.event_length as usize) < LOG_EVENT_MINIMAL_HEADER_LEN {
            return Err(ReplicaError::Protocol(format!(
                "event length {} shorter than header",
                header.event_length
            )));
        }
        Ok(header)
    }

    /// 스트림으로 받은 이벤트 버퍼의 헤더를 파싱하고 길이 필드와 일치하는지 검증
    pub fn parse_framed(data: &[u8]) -> Result<EventHeader> {
        let header = Self::parse_header(data)?;
        if header.event_length as usize != data.len() {
            return Err(ReplicaError::Protocol(format!(
                "event length field {} does not match packet length {} (type {})",
                header.event_length,
                data.len(),
                header.type_code
            )));
        }
        Ok(header)
    }

    /// FORMAT_DESCRIPTION 이벤트 파싱 (15)
    pub fn parse_format_description(data: &[u8]) -> Result<FormatDescription> {
        let header = Self::parse_framed(data)?;
        let body = &data[LOG_EVENT_MINIMAL_HEADER_LEN..];
        if body.len() < FDE_FIXED_LEN {
            return Err(short("format description", FDE_FIXED_LEN, body.len()));
        }

        let mut cursor = Cursor::new(body);
        let binlog_version = cursor.read_u16::<LittleEndian>().map_err(protocol)?;
        let version_bytes = &body[2..52];
        let version_end = version_bytes.iter().position(|&b| b == 0).unwrap_or(50);
        let server_version = String::from_utf8_lossy(&version_bytes[..version_end]).to_string();
        cursor.set_position(52);
        let create_timestamp = read_u32(&mut cursor)?;
        let header_length = cursor.read_u8().map_err(protocol)?;

        if (header_length as usize) < LOG_EVENT_MINIMAL_HEADER_LEN {
            return Err(ReplicaError::Protocol(format!(
                "format description declares header length {}",
                header_length
            )));
        }

        // FDE 자신의 post-header 길이 = 57 + 이벤트 타입 수
        let rest = &body[FDE_FIXED_LEN..];
        let fde_index = EventType::FormatDescriptionEvent as usize - 1;
        let own_post_header = *rest
            .get(fde_index)
            .ok_or_else(|| short("post-header lengths", fde_index + 1, rest.len()))?
            as usize;
        let type_count = own_post_header
            .checked_sub(FDE_FIXED_LEN)
            .filter(|n| *n <= rest.len())
            .ok_or_else(|| {
                ReplicaError::Protocol(format!(
                    "format description post-header length {} out of range",
                    own_post_header
                ))
            })?;

        let post_header_lengths = rest[..type_count].to_vec();
        let trailer = &rest[type_count..];

        let checksum_alg = match trailer.len() {
            // 5.6.1 이전 버전: 체크섬 필드 없음
            0 => ChecksumAlg::Off,
            1 | FDE_CHECKSUM_TRAILER_LEN => ChecksumAlg::from_u8(trailer[0]),
            n => {
                return Err(ReplicaError::Protocol(format!(
                    "format description has {} unexpected trailing bytes",
                    n
                )))
            }
        };

        if checksum_alg == ChecksumAlg::Crc32 {
            verify_checksum(data, &header)?;
        }

        Ok(FormatDescription {
            binlog_version,
            server_version,
            create_timestamp,
            header_length,
            post_header_lengths,
            checksum_alg,
        })
    }

    /// ROTATE 이벤트 파싱 (4)
    ///
    /// 가짜 rotate(타임스탬프 0)는 체크섬 없이 올 수 있으므로,
    /// CRC 검증에 실패한 경우에만 체크섬이 없는 것으로 간주합니다.
    pub fn parse_rotate_event(data: &[u8], fde: &FormatDescription) -> Result<RotateEventData> {
        let header = Self::parse_framed(data)?;
        let body_start = fde.header_length as usize;
        let synthetic = header.timestamp == 0;

        let mut end = data.len();
        if fde.checksum_alg == ChecksumAlg::Crc32 {
            match verify_checksum(data, &header) {
                Ok(()) => end -= BINLOG_CHECKSUM_LEN,
                Err(_) if synthetic => {}
                Err(e) => return Err(e),
            }
        }

        let body = data
            .get(body_start..end)
            .filter(|b| b.len() >= ROTATE_POST_HEADER_LEN)
            .ok_or_else(|| short("rotate event", body_start + ROTATE_POST_HEADER_LEN, end))?;

        let mut cursor = Cursor::new(body);
        let position = cursor.read_u64::<LittleEndian>().map_err(protocol)?;
        let name_bytes = &body[ROTATE_POST_HEADER_LEN..];
        if name_bytes.is_empty() {
            return Err(ReplicaError::Protocol(
                "rotate event without file name".to_string(),
            ));
        }
        let next_binlog_name = String::from_utf8(name_bytes.to_vec()).map_err(|e| {
            ReplicaError::Protocol(format!("rotate file name is not UTF-8: {}", e))
        })?;

        Ok(RotateEventData {
            next_binlog_name,
            position,
            synthetic,
        })
    }

    /// XID 이벤트 파싱 (16). 구조(길이, 체크섬)가 맞지 않으면 에러
    pub fn parse_xid_event(data: &[u8], fde: &FormatDescription) -> Result<XidEventData> {
        let header = Self::parse_framed(data)?;
        if header.event_type() != EventType::XidEvent {
            return Err(ReplicaError::Protocol(format!(
                "expected XID event, got type {}",
                header.type_code
            )));
        }

        let expected = fde.header_length as usize + XID_BODY_LEN + fde.checksum_alg.trailer_len();
        if data.len() != expected {
            return Err(ReplicaError::Protocol(format!(
                "XID event length {} (expected {})",
                data.len(),
                expected
            )));
        }
        if fde.checksum_alg == ChecksumAlg::Crc32 {
            verify_checksum(data, &header)?;
        }
        if header.log_pos == 0 {
            return Err(ReplicaError::Protocol(
                "XID event without log position".to_string(),
            ));
        }

        let mut cursor = Cursor::new(&data[fde.header_length as usize..]);
        let xid = cursor.read_u64::<LittleEndian>().map_err(protocol)?;
        Ok(XidEventData {
            xid,
            log_pos: header.log_pos,
        })
    }
}

/// 이벤트 끝 4바이트의 CRC32 검증
fn verify_checksum(data: &[u8], header: &EventHeader) -> Result<()> {
    if data.len() < LOG_EVENT_MINIMAL_HEADER_LEN + BINLOG_CHECKSUM_LEN {
        return Err(short("checksummed event", LOG_EVENT_MINIMAL_HEADER_LEN + BINLOG_CHECKSUM_LEN, data.len()));
    }
    let (payload, trailer) = data.split_at(data.len() - BINLOG_CHECKSUM_LEN);
    let expected = u32::from_le_bytes([trailer[0], trailer[1], trailer[2], trailer[3]]);
    let actual = crc32fast::hash(payload);
    if actual != expected {
        return Err(ReplicaError::Protocol(format!(
            "checksum mismatch on event type {} at log_pos {}: expected {:08x}, computed {:08x}",
            header.type_code, header.log_pos, expected, actual
        )));
    }
    Ok(())
}

fn read_u32(cursor: &mut Cursor<&[u8]>) -> Result<u32> {
    cursor.read_u32::<LittleEndian>().map_err(protocol)
}

fn protocol(err: std::io::Error) -> ReplicaError {
    ReplicaError::Protocol(format!("truncated event: {}", err))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::*;

    #[test]
    fn test_verify_magic() {
        let valid = vec![0xfe, 0x62, 0x69, 0x6e];
        assert!(BinlogParser::verify_magic(&valid).is_ok());

        let invalid = vec![0x00, 0x00, 0x00, 0x00];
        assert!(BinlogParser::verify_magic(&invalid).is_err());
        assert!(BinlogParser::verify_magic(&[0xfe]).is_err());
    }

    #[test]
    fn test_parse_header() {
        let event = opaque_event(1_700_000_000, 500, 64, false);
        let header = BinlogParser::parse_framed(&event).unwrap();
        assert_eq!(header.timestamp, 1_700_000_000);
        assert_eq!(header.type_code, QUERY_EVENT);
        assert_eq!(header.event_length as usize, event.len());
        assert_eq!(header.log_pos, 500);
    }

    #[test]
    fn test_parse_header_too_short() {
        let event = opaque_event(1, 100, 10, false);
        assert!(matches!(
            BinlogParser::parse_header(&event[..18]),
            Err(ReplicaError::Protocol(_))
        ));
    }

    #[test]
    fn test_framed_length_mismatch() {
        let mut event = opaque_event(1, 100, 10, false);
        event.push(0);
        assert!(BinlogParser::parse_framed(&event).is_err());
    }

    #[test]
    fn test_parse_format_description_with_checksum() {
        let event = fde_event(1, 120, true);
        let fde = BinlogParser::parse_format_description(&event).unwrap();
        assert_eq!(fde.binlog_version, 4);
        assert_eq!(fde.server_version, "8.0.34");
        assert_eq!(fde.header_length, 19);
        assert_eq!(fde.post_header_lengths.len(), FDE_TYPE_COUNT);
        assert_eq!(fde.checksum_alg, ChecksumAlg::Crc32);
    }

    #[test]
    fn test_parse_format_description_without_checksum() {
        let event = fde_event(1, 120, false);
        let fde = BinlogParser::parse_format_description(&event).unwrap();
        assert_eq!(fde.checksum_alg, ChecksumAlg::Off);
    }

    #[test]
    fn test_format_description_bad_checksum() {
        let mut event = fde_event(1, 120, true);
        let last = event.len() - 1;
        event[last] ^= 0xff;
        assert!(matches!(
            BinlogParser::parse_format_description(&event),
            Err(ReplicaError::Protocol(_))
        ));
    }

    #[test]
    fn test_parse_rotate_event() {
        let fde = crc_context();
        let event = rotate_event(1_700_000_000, "mysql-bin.000002", 4, 999, true);
        let rotate = BinlogParser::parse_rotate_event(&event, &fde).unwrap();
        assert_eq!(rotate.next_binlog_name, "mysql-bin.000002");
        assert_eq!(rotate.position, 4);
        assert!(!rotate.synthetic);
    }

    #[test]
    fn test_fake_rotate_without_checksum_under_crc_context() {
        let fde = crc_context();
        let event = rotate_event(0, "mysql-bin.000003", 4, 0, false);
        let rotate = BinlogParser::parse_rotate_event(&event, &fde).unwrap();
        assert_eq!(rotate.next_binlog_name, "mysql-bin.000003");
        assert!(rotate.synthetic);
    }

    #[test]
    fn test_real_rotate_with_corrupt_checksum() {
        let fde = crc_context();
        let mut event = rotate_event(1_700_000_000, "mysql-bin.000002", 4, 999, true);
        let last = event.len() - 1;
        event[last] ^= 0x01;
        assert!(BinlogParser::parse_rotate_event(&event, &fde).is_err());
    }

    #[test]
    fn test_parse_xid_event() {
        let fde = crc_context();
        let event = xid_event(1_700_000_000, 77, 4242, true);
        let xid = BinlogParser::parse_xid_event(&event, &fde).unwrap();
        assert_eq!(xid.xid, 77);
        assert_eq!(xid.log_pos, 4242);

        // 체크섬 컨텍스트와 구조가 맞지 않으면 거부
        let plain = FormatDescription::default();
        assert!(BinlogParser::parse_xid_event(&event, &plain).is_err());
    }
}
