//! GTID (Global Transaction ID) 집합 관리
//!
//! 텍스트 형식: `uuid1:1-100:200,uuid2:1-50`
//! (같은 UUID의 구간은 ':'로, 서로 다른 UUID는 ','로 구분. 공백/개행 허용)
//!
//! 바이너리 형식 (COM_BINLOG_DUMP_GTID 페이로드):
//! - n_sids (8 bytes)
//! - 각 sid: uuid (16 bytes), n_intervals (8 bytes),
//!   각 구간: start (8 bytes), end + 1 (8 bytes)

use crate::error::{ReplicaError, Result};
use byteorder::{LittleEndian, WriteBytesExt};
use parking_lot::RwLock;
use std::collections::BTreeMap;
use uuid::Uuid;

/// GTID 범위 (양 끝 포함)
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct GtidRange {
    pub start: u64,
    pub end: u64,
}

impl GtidRange {
    pub fn new(start: u64, end: u64) -> Result<Self> {
        if start == 0 {
            return Err(ReplicaError::GtidParse(
                "transaction number must be positive".to_string(),
            ));
        }
        if start > end {
            return Err(ReplicaError::GtidParse(format!(
                "invalid interval: {}-{} (start > end)",
                start, end
            )));
        }
        Ok(GtidRange { start, end })
    }

    pub fn contains(&self, value: u64) -> bool {
        value >= self.start && value <= self.end
    }

    /// 겹치거나 연접한 범위를 하나로 병합
    pub fn merge(&self, other: &GtidRange) -> Option<GtidRange> {
        if self.end.saturating_add(1) >= other.start && other.end.saturating_add(1) >= self.start {
            Some(GtidRange {
                start: self.start.min(other.start),
                end: self.end.max(other.end),
            })
        } else {
            None
        }
    }
}

/// 정렬되고 서로 겹치지 않는 범위 목록으로 정규화
fn normalize(ranges: &mut Vec<GtidRange>) {
    ranges.sort();
    let mut merged: Vec<GtidRange> = Vec::with_capacity(ranges.len());
    for range in ranges.drain(..) {
        match merged.last_mut() {
            Some(last) => match last.merge(&range) {
                Some(m) => *last = m,
                None => merged.push(range),
            },
            None => merged.push(range),
        }
    }
    *ranges = merged;
}

type SidMap = BTreeMap<Uuid, Vec<GtidRange>>;

/// 텍스트를 독립된 맵으로 파싱 (기존 집합은 건드리지 않음)
fn parse_text(text: &str) -> Result<SidMap> {
    let mut parsed = SidMap::new();
    let text = text.trim();
    if text.is_empty() || text.eq_ignore_ascii_case("NULL") {
        return Ok(parsed);
    }

    for sid_part in text.split(',') {
        let sid_part = sid_part.trim();
        if sid_part.is_empty() {
            return Err(ReplicaError::GtidParse(format!(
                "empty source entry in '{}'",
                text
            )));
        }

        let mut pieces = sid_part.split(':');
        let uuid_str = pieces.next().unwrap_or_default().trim();
        let uuid = Uuid::parse_str(uuid_str).map_err(|e| {
            ReplicaError::GtidParse(format!("invalid source id '{}': {}", uuid_str, e))
        })?;

        let mut ranges = Vec::new();
        for interval in pieces {
            ranges.push(parse_interval(interval.trim())?);
        }
        if ranges.is_empty() {
            return Err(ReplicaError::GtidParse(format!(
                "source id '{}' has no intervals",
                uuid_str
            )));
        }

        parsed.entry(uuid).or_default().extend(ranges);
    }

    for ranges in parsed.values_mut() {
        normalize(ranges);
    }
    Ok(parsed)
}

fn parse_interval(interval: &str) -> Result<GtidRange> {
    let number = |s: &str| {
        s.trim()
            .parse::<u64>()
            .map_err(|_| ReplicaError::GtidParse(format!("invalid interval: '{}'", interval)))
    };

    match interval.split_once('-') {
        Some((start, end)) => GtidRange::new(number(start)?, number(end)?),
        None => {
            let n = number(interval)?;
            GtidRange::new(n, n)
        }
    }
}

/// GTID 집합 (source id → 구간 목록)
///
/// 내부 맵은 하나의 읽기/쓰기 락으로 보호됩니다.
/// `encode`, `is_empty` 등은 읽기 락, `add_from_text`만 쓰기 락을 잡습니다.
#[derive(Debug, Default)]
pub struct GtidSet {
    sets: RwLock<SidMap>,
}

impl GtidSet {
    pub fn new() -> Self {
        GtidSet {
            sets: RwLock::new(BTreeMap::new()),
        }
    }

    /// GTID 텍스트 파싱
    pub fn parse(text: &str) -> Result<Self> {
        Ok(GtidSet {
            sets: RwLock::new(parse_text(text)?),
        })
    }

    /// 텍스트의 GTID들을 집합에 추가
    ///
    /// 파싱이 하나라도 실패하면 집합은 변경되지 않습니다.
    pub fn add_from_text(&self, text: &str) -> Result<()> {
        let parsed = parse_text(text)?;

        let mut sets = self.sets.write();
        for (uuid, ranges) in parsed {
            let existing = sets.entry(uuid).or_default();
            existing.extend(ranges);
            normalize(existing);
        }
        Ok(())
    }

    pub fn contains(&self, uuid: &Uuid, sequence: u64) -> bool {
        self.sets
            .read()
            .get(uuid)
            .map(|ranges| ranges.iter().any(|r| r.contains(sequence)))
            .unwrap_or(false)
    }

    /// UUID별 구간 목록 스냅샷
    pub fn ranges(&self, uuid: &Uuid) -> Vec<GtidRange> {
        self.sets.read().get(uuid).cloned().unwrap_or_default()
    }

    pub fn is_empty(&self) -> bool {
        self.sets.read().values().all(|ranges| ranges.is_empty())
    }

    /// 인코딩된 바이트 길이
    pub fn encoded_length(&self) -> usize {
        let sets = self.sets.read();
        8 + sets
            .values()
            .map(|ranges| 16 + 8 + ranges.len() * 16)
            .sum::<usize>()
    }

    /// COM_BINLOG_DUMP_GTID 형식으로 인코딩해 `buffer` 뒤에 붙임
    pub fn encode(&self, buffer: &mut Vec<u8>) {
        let sets = self.sets.read();
        buffer.reserve(8 + sets.len() * 24);

        // Vec<u8>에 대한 쓰기는 실패하지 않음
        let _ = buffer.write_u64::<LittleEndian>(sets.len() as u64);
        for (uuid, ranges) in sets.iter() {
            buffer.extend_from_slice(uuid.as_bytes());
            let _ = buffer.write_u64::<LittleEndian>(ranges.len() as u64);
            for range in ranges {
                let _ = buffer.write_u64::<LittleEndian>(range.start);
                let _ = buffer.write_u64::<LittleEndian>(range.end + 1);
            }
        }
    }

    pub fn to_string(&self) -> String {
        let sets = self.sets.read();
        let parts: Vec<String> = sets
            .iter()
            .filter(|(_, ranges)| !ranges.is_empty())
            .map(|(uuid, ranges)| {
                let range_strs: Vec<String> = ranges
                    .iter()
                    .map(|r| {
                        if r.start == r.end {
                            r.start.to_string()
                        } else {
                            format!("{}-{}", r.start, r.end)
                        }
                    })
                    .collect();
                format!("{}:{}", uuid, range_strs.join(":"))
            })
            .collect();
        parts.join(",")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use byteorder::ReadBytesExt;
    use std::io::{Cursor, Read};

    const SID_A: &str = "3e11fa47-71ca-11e1-9e33-c80aa9429562";
    const SID_B: &str = "2174b383-5441-11e8-b90a-c80aa9429562";

    fn uuid(s: &str) -> Uuid {
        Uuid::parse_str(s).unwrap()
    }

    /// 인코딩 결과를 다시 맵으로 디코딩 (테스트 전용)
    fn decode(bytes: &[u8]) -> BTreeMap<Uuid, Vec<(u64, u64)>> {
        let mut cursor = Cursor::new(bytes);
        let n_sids = cursor.read_u64::<LittleEndian>().unwrap();
        let mut map = BTreeMap::new();
        for _ in 0..n_sids {
            let mut sid = [0u8; 16];
            cursor.read_exact(&mut sid).unwrap();
            let n = cursor.read_u64::<LittleEndian>().unwrap();
            let mut intervals = Vec::new();
            for _ in 0..n {
                let start = cursor.read_u64::<LittleEndian>().unwrap();
                let end = cursor.read_u64::<LittleEndian>().unwrap();
                intervals.push((start, end - 1));
            }
            map.insert(Uuid::from_bytes(sid), intervals);
        }
        assert_eq!(cursor.position() as usize, bytes.len());
        map
    }

    #[test]
    fn test_gtid_parse() {
        let text = format!("{}:1-100:200:300-400, {}:1-5", SID_A, SID_B);
        let set = GtidSet::parse(&text).unwrap();
        assert_eq!(
            set.ranges(&uuid(SID_A)),
            vec![
                GtidRange { start: 1, end: 100 },
                GtidRange { start: 200, end: 200 },
                GtidRange { start: 300, end: 400 },
            ]
        );
        assert!(set.contains(&uuid(SID_B), 3));
        assert!(!set.contains(&uuid(SID_B), 6));
    }

    #[test]
    fn test_parse_server_formatted_text() {
        // SELECT @@gtid_executed 결과는 ",\n"으로 구분됨
        let text = format!("{}:1-3,\n{}:7", SID_A.to_uppercase(), SID_B);
        let set = GtidSet::parse(&text).unwrap();
        assert_eq!(set.ranges(&uuid(SID_A)), vec![GtidRange { start: 1, end: 3 }]);
        assert_eq!(set.ranges(&uuid(SID_B)), vec![GtidRange { start: 7, end: 7 }]);
    }

    #[test]
    fn test_empty_text() {
        let set = GtidSet::new();
        set.add_from_text("").unwrap();
        set.add_from_text("  \n").unwrap();
        assert!(set.is_empty());
        assert_eq!(set.encoded_length(), 8);
    }

    #[test]
    fn test_encode_round_trip() {
        let text = format!("{}:1-10:12-20,{}:5", SID_A, SID_B);
        let set = GtidSet::parse(&text).unwrap();

        let mut buffer = Vec::new();
        set.encode(&mut buffer);
        assert_eq!(buffer.len(), set.encoded_length());

        let decoded = decode(&buffer);
        assert_eq!(decoded[&uuid(SID_A)], vec![(1, 10), (12, 20)]);
        assert_eq!(decoded[&uuid(SID_B)], vec![(5, 5)]);
    }

    #[test]
    fn test_encode_appends_to_existing_buffer() {
        let set = GtidSet::parse(&format!("{}:1", SID_A)).unwrap();
        let mut buffer = vec![0xAA, 0xBB];
        set.encode(&mut buffer);
        assert_eq!(&buffer[..2], &[0xAA, 0xBB]);
        assert_eq!(buffer.len(), 2 + set.encoded_length());
    }

    #[test]
    fn test_malformed_interval_does_not_mutate() {
        let set = GtidSet::parse(&format!("{}:1-10", SID_A)).unwrap();

        // 두 번째 항목의 구간이 잘못됨 → 첫 번째 항목도 반영되지 않아야 함
        let bad = format!("{}:50-60,{}:9-3", SID_B, SID_A);
        assert!(matches!(
            set.add_from_text(&bad),
            Err(ReplicaError::GtidParse(_))
        ));
        assert_eq!(set.ranges(&uuid(SID_A)), vec![GtidRange { start: 1, end: 10 }]);
        assert!(set.ranges(&uuid(SID_B)).is_empty());
    }

    #[test]
    fn test_malformed_inputs() {
        let set = GtidSet::new();
        for bad in [
            "not-a-uuid:1-5".to_string(),
            format!("{}", SID_A),
            format!("{}:", SID_A),
            format!("{}:0-5", SID_A),
            format!("{}:a-b", SID_A),
            format!("{}:1-5,,{}:1", SID_A, SID_B),
            format!("{}:1--5", SID_A),
        ] {
            assert!(set.add_from_text(&bad).is_err(), "accepted '{}'", bad);
        }
        assert!(set.is_empty());
    }

    #[test]
    fn test_repeated_adds_stay_sorted_and_merged() {
        let set = GtidSet::new();
        set.add_from_text(&format!("{}:10-20", SID_A)).unwrap();
        set.add_from_text(&format!("{}:1-3:30", SID_A)).unwrap();
        set.add_from_text(&format!("{}:4-9", SID_A)).unwrap();
        set.add_from_text(&format!("{}:21:25-29", SID_A)).unwrap();

        let ranges = set.ranges(&uuid(SID_A));
        assert_eq!(ranges, vec![GtidRange { start: 1, end: 21 }, GtidRange { start: 25, end: 30 }]);
        for pair in ranges.windows(2) {
            assert!(pair[0].end + 1 < pair[1].start);
        }
    }

    #[test]
    fn test_to_string() {
        let set = GtidSet::parse(&format!("{}:1-3:5", SID_A)).unwrap();
        assert_eq!(set.to_string(), format!("{}:1-3:5", SID_A));
    }
}
