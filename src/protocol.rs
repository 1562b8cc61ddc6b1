//! MySQL 프로토콜 패킷 처리
//!
//! 패킷 = 3 bytes 길이 + 1 byte 시퀀스 + 본문.
//! 0xFFFFFF 길이의 본문은 다음 패킷으로 이어지며 하나로 합쳐 반환합니다.
//!
//! 채널은 `AsyncRead + AsyncWrite` 위에서 동작하므로 테스트에서는
//! `tokio_test::io` 목 스트림으로 대체할 수 있습니다.

use crate::error::{ReplicaError, Result};
use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use bytes::{Bytes, BytesMut};
use std::io::{self, Cursor, Read};
use std::net::{IpAddr, SocketAddr};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpSocket, TcpStream};
use tracing::debug;

/// 단일 패킷 본문의 최대 길이
pub const MAX_PACKET_LEN: usize = 0xFF_FFFF;

pub const OK_HEADER: u8 = 0x00;
pub const EOF_HEADER: u8 = 0xFE;
pub const ERR_HEADER: u8 = 0xFF;

/// MySQL 패킷 채널
pub struct PacketChannel<S = TcpStream> {
    stream: S,
    sequence: u8,
    read_timeout: Option<Duration>,
}

impl PacketChannel<TcpStream> {
    /// 새 패킷 채널 생성 (TCP 연결)
    pub async fn connect(
        hostname: &str,
        port: u16,
        bind_address: Option<&str>,
        connect_timeout: Duration,
    ) -> Result<Self> {
        let addr = format!("{}:{}", hostname, port);
        let stream = tokio::time::timeout(connect_timeout, open_stream(&addr, bind_address))
            .await
            .map_err(|_| {
                ReplicaError::connect(format!(
                    "Timed out connecting to {} after {:?}",
                    addr, connect_timeout
                ))
            })??;
        stream
            .set_nodelay(true)
            .map_err(|e| ReplicaError::connect(format!("Failed to configure socket: {}", e)))?;

        debug!("Connected to MySQL at {}", addr);

        Ok(PacketChannel::new(stream))
    }
}

async fn open_stream(addr: &str, bind_address: Option<&str>) -> Result<TcpStream> {
    let connect_err =
        |e: io::Error| ReplicaError::connect(format!("Failed to connect to {}: {}", addr, e));

    let Some(bind) = bind_address else {
        return TcpStream::connect(addr).await.map_err(connect_err);
    };

    let local_ip: IpAddr = bind
        .parse()
        .map_err(|_| ReplicaError::Config(format!("invalid bind_address '{}'", bind)))?;
    let remote = tokio::net::lookup_host(addr)
        .await
        .map_err(connect_err)?
        .find(|candidate| candidate.is_ipv4() == local_ip.is_ipv4())
        .ok_or_else(|| {
            ReplicaError::connect(format!("No address of {} matches bind address {}", addr, bind))
        })?;

    let socket = if local_ip.is_ipv4() {
        TcpSocket::new_v4()
    } else {
        TcpSocket::new_v6()
    }
    .map_err(connect_err)?;
    socket
        .bind(SocketAddr::new(local_ip, 0))
        .map_err(|e| ReplicaError::connect(format!("Failed to bind {}: {}", bind, e)))?;
    socket.connect(remote).await.map_err(connect_err)
}

impl<S> PacketChannel<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    pub fn new(stream: S) -> Self {
        PacketChannel {
            stream,
            sequence: 0,
            read_timeout: None,
        }
    }

    /// 패킷 읽기 타임아웃 설정 (None = 무제한)
    pub fn set_read_timeout(&mut self, timeout: Option<Duration>) {
        self.read_timeout = timeout;
    }

    /// 패킷 읽기 (분할된 패킷은 합쳐서 반환)
    pub async fn read_packet(&mut self) -> Result<Bytes> {
        match self.read_timeout {
            Some(limit) => tokio::time::timeout(limit, self.read_full_packet())
                .await
                .map_err(|_| {
                    ReplicaError::Network(format!("no packet within read timeout {:?}", limit))
                })?,
            None => self.read_full_packet().await,
        }
    }

    async fn read_full_packet(&mut self) -> Result<Bytes> {
        let mut payload = BytesMut::new();
        loop {
            // 패킷 헤더 읽기 (3 bytes length + 1 byte sequence)
            let mut header = [0u8; 4];
            self.stream
                .read_exact(&mut header)
                .await
                .map_err(|e| network("read packet header", e))?;
            let length = u32::from_le_bytes([header[0], header[1], header[2], 0]) as usize;
            self.sequence = header[3].wrapping_add(1);

            // 패킷 본문 읽기
            let start = payload.len();
            payload.resize(start + length, 0);
            self.stream
                .read_exact(&mut payload[start..])
                .await
                .map_err(|e| network("read packet body", e))?;

            if length < MAX_PACKET_LEN {
                break;
            }
        }
        Ok(payload.freeze())
    }

    /// 패킷 쓰기 (현재 시퀀스 번호부터)
    pub async fn write_packet(&mut self, data: &[u8]) -> Result<()> {
        let mut frame = Vec::with_capacity(data.len() + 4);
        for chunk in data.chunks(MAX_PACKET_LEN) {
            self.push_frame(&mut frame, chunk)?;
        }
        // 길이가 0xFFFFFF의 배수(0 포함)면 빈 패킷으로 끝을 알림
        if data.len() % MAX_PACKET_LEN == 0 {
            self.push_frame(&mut frame, &[])?;
        }

        self.stream
            .write_all(&frame)
            .await
            .map_err(|e| network("write packet", e))?;
        self.stream
            .flush()
            .await
            .map_err(|e| network("flush packet", e))?;

        Ok(())
    }

    fn push_frame(&mut self, frame: &mut Vec<u8>, chunk: &[u8]) -> Result<()> {
        WriteBytesExt::write_u24::<LittleEndian>(frame, chunk.len() as u32)
            .and_then(|_| WriteBytesExt::write_u8(frame, self.sequence))
            .map_err(|e| ReplicaError::Protocol(format!("Failed to frame packet: {}", e)))?;
        frame.extend_from_slice(chunk);
        self.sequence = self.sequence.wrapping_add(1);
        Ok(())
    }

    /// 새 명령 전송 (시퀀스 0부터)
    pub async fn write_command(&mut self, command: u8, payload: &[u8]) -> Result<()> {
        let mut data = Vec::with_capacity(payload.len() + 1);
        data.push(command);
        data.extend_from_slice(payload);
        self.sequence = 0;
        self.write_packet(&data).await
    }

    /// 응답이 OK 패킷인지 확인하고, ERR 패킷이면 에러로 변환
    pub async fn read_ok(&mut self) -> Result<OkPacket> {
        let packet = self.read_packet().await?;
        match packet.first() {
            Some(&OK_HEADER) => OkPacket::parse(&packet),
            Some(&ERR_HEADER) => Err(ErrPacket::parse(&packet)?.into_error()),
            Some(other) => Err(ReplicaError::Protocol(format!(
                "expected OK packet, got header 0x{:02x}",
                other
            ))),
            None => Err(ReplicaError::Protocol("empty response packet".to_string())),
        }
    }

    pub async fn shutdown(&mut self) {
        if let Err(e) = self.stream.shutdown().await {
            debug!("Socket shutdown failed: {}", e);
        }
    }
}

fn network(context: &str, err: io::Error) -> ReplicaError {
    if err.kind() == io::ErrorKind::UnexpectedEof {
        ReplicaError::Network(format!("{}: connection closed by primary", context))
    } else {
        ReplicaError::Network(format!("{}: {}", context, err))
    }
}

/// Greeting 패킷 파싱
#[derive(Debug, Clone)]
pub struct GreetingPacket {
    pub protocol_version: u8,
    pub server_version: String,
    pub thread_id: u32,
    pub scramble: Vec<u8>,
    pub server_capabilities: u32,
    pub server_collation: u8,
    pub server_status: u16,
    pub auth_plugin_name: String,
}

impl GreetingPacket {
    pub fn parse(data: &[u8]) -> Result<Self> {
        if data.first() == Some(&ERR_HEADER) {
            return Err(ErrPacket::parse(data)?.into_connect_error());
        }

        let mut cursor = Cursor::new(data);

        // Protocol version (1 byte)
        let protocol_version = ReadBytesExt::read_u8(&mut cursor).map_err(truncated("protocol version"))?;

        // Server version (null-terminated string)
        let server_version = read_null_terminated_string(&mut cursor)?;

        // Thread ID (4 bytes)
        let thread_id = ReadBytesExt::read_u32::<LittleEndian>(&mut cursor)
            .map_err(truncated("thread ID"))?;

        // Auth plugin data part 1 (8 bytes)
        let mut scramble = vec![0u8; 8];
        Read::read_exact(&mut cursor, &mut scramble)
            .map_err(truncated("scramble part 1"))?;

        // Filler (1 byte, always 0x00)
        ReadBytesExt::read_u8(&mut cursor).map_err(truncated("filler"))?;

        let capabilities_lower = ReadBytesExt::read_u16::<LittleEndian>(&mut cursor)
            .map_err(truncated("capabilities"))?;
        let server_collation = ReadBytesExt::read_u8(&mut cursor).map_err(truncated("collation"))?;
        let server_status = ReadBytesExt::read_u16::<LittleEndian>(&mut cursor)
            .map_err(truncated("status"))?;
        let capabilities_upper = ReadBytesExt::read_u16::<LittleEndian>(&mut cursor)
            .map_err(truncated("capabilities upper"))?;

        let server_capabilities = (capabilities_upper as u32) << 16 | capabilities_lower as u32;

        let auth_data_len = ReadBytesExt::read_u8(&mut cursor).map_err(truncated("auth data length"))?;

        // Reserved (10 bytes)
        let mut reserved = [0u8; 10];
        Read::read_exact(&mut cursor, &mut reserved)
            .map_err(truncated("reserved"))?;

        // Auth plugin data part 2 (at least 13 bytes, 마지막 null 포함)
        let scramble_len = std::cmp::max(13, auth_data_len.saturating_sub(8)) as usize;
        let mut scramble_part2 = vec![0u8; scramble_len];
        Read::read_exact(&mut cursor, &mut scramble_part2)
            .map_err(truncated("scramble part 2"))?;
        scramble.extend_from_slice(&scramble_part2[..scramble_part2.len() - 1]);

        let auth_plugin_name = if (cursor.position() as usize) < data.len() {
            read_null_terminated_string(&mut cursor).unwrap_or_default()
        } else {
            String::new()
        };

        Ok(GreetingPacket {
            protocol_version,
            server_version,
            thread_id,
            scramble,
            server_capabilities,
            server_collation,
            server_status,
            auth_plugin_name,
        })
    }
}

/// OK 패킷
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OkPacket {
    pub affected_rows: u64,
    pub last_insert_id: u64,
    pub status_flags: u16,
    pub warnings: u16,
}

impl OkPacket {
    pub fn parse(data: &[u8]) -> Result<Self> {
        let mut cursor = Cursor::new(data);
        let header = ReadBytesExt::read_u8(&mut cursor).map_err(truncated("OK header"))?;
        if header != OK_HEADER {
            return Err(ReplicaError::Protocol(format!(
                "not an OK packet (0x{:02x})",
                header
            )));
        }
        let affected_rows = read_lenenc_int(&mut cursor)?;
        let last_insert_id = read_lenenc_int(&mut cursor)?;
        // 4.1 이전 서버는 상태/경고 필드를 생략할 수 있음
        let status_flags = ReadBytesExt::read_u16::<LittleEndian>(&mut cursor).unwrap_or(0);
        let warnings = ReadBytesExt::read_u16::<LittleEndian>(&mut cursor).unwrap_or(0);
        Ok(OkPacket {
            affected_rows,
            last_insert_id,
            status_flags,
            warnings,
        })
    }
}

/// ERR 패킷
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ErrPacket {
    pub code: u16,
    pub sql_state: Option<String>,
    pub message: String,
}

impl ErrPacket {
    pub fn parse(data: &[u8]) -> Result<Self> {
        if data.len() < 3 || data[0] != ERR_HEADER {
            return Err(ReplicaError::Protocol("malformed ERR packet".to_string()));
        }
        let code = u16::from_le_bytes([data[1], data[2]]);
        let mut rest = &data[3..];
        let mut sql_state = None;
        if rest.first() == Some(&b'#') && rest.len() >= 6 {
            sql_state = Some(String::from_utf8_lossy(&rest[1..6]).to_string());
            rest = &rest[6..];
        }
        Ok(ErrPacket {
            code,
            sql_state,
            message: String::from_utf8_lossy(rest).to_string(),
        })
    }

    /// 스트리밍 중 받은 에러
    pub fn into_error(self) -> ReplicaError {
        ReplicaError::Primary {
            code: self.code,
            message: self.message,
        }
    }

    /// 연결/인증 단계에서 받은 에러
    pub fn into_connect_error(self) -> ReplicaError {
        ReplicaError::Connect {
            code: self.code,
            message: self.message,
        }
    }
}

/// 바이너리 로그 스트림 패킷 분류
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamPacket {
    /// 상태 바이트를 제거한 이벤트 (semi-sync 헤더는 아직 포함)
    Event(Bytes),
    /// 논블로킹 덤프의 스트림 끝
    Eof,
    Error(ErrPacket),
}

impl StreamPacket {
    pub fn classify(packet: Bytes) -> Result<Self> {
        match packet.first() {
            Some(&OK_HEADER) => Ok(StreamPacket::Event(packet.slice(1..))),
            Some(&ERR_HEADER) => Ok(StreamPacket::Error(ErrPacket::parse(&packet)?)),
            Some(&EOF_HEADER) if packet.len() < 9 => Ok(StreamPacket::Eof),
            Some(other) => Err(ReplicaError::Protocol(format!(
                "unexpected stream packet header 0x{:02x} ({} bytes)",
                other,
                packet.len()
            ))),
            None => Err(ReplicaError::Protocol("empty stream packet".to_string())),
        }
    }
}

/// null로 끝나는 문자열 읽기
pub fn read_null_terminated_string<R: Read>(reader: &mut R) -> Result<String> {
    let mut bytes = Vec::new();
    loop {
        let byte = reader.read_u8().map_err(truncated("string"))?;
        if byte == 0 {
            break;
        }
        bytes.push(byte);
    }
    String::from_utf8(bytes)
        .map_err(|e| ReplicaError::Protocol(format!("Invalid UTF-8 in string: {}", e)))
}

/// Length-encoded integer 읽기
pub fn read_lenenc_int<R: Read>(reader: &mut R) -> Result<u64> {
    let first = reader.read_u8().map_err(truncated("length-encoded integer"))?;
    let value = match first {
        0xfc => reader.read_u16::<LittleEndian>().map(u64::from),
        0xfd => reader.read_u24::<LittleEndian>().map(u64::from),
        0xfe => reader.read_u64::<LittleEndian>(),
        0xfb | 0xff => {
            return Err(ReplicaError::Protocol(format!(
                "invalid length-encoded integer prefix 0x{:02x}",
                first
            )))
        }
        small => Ok(small as u64),
    };
    value.map_err(truncated("length-encoded integer"))
}

/// Length-encoded integer 쓰기
pub fn write_lenenc_int(buffer: &mut Vec<u8>, value: u64) {
    if value < 0xfb {
        buffer.push(value as u8);
    } else if value <= 0xffff {
        buffer.push(0xfc);
        buffer.extend_from_slice(&(value as u16).to_le_bytes());
    } else if value <= 0xff_ffff {
        buffer.push(0xfd);
        buffer.extend_from_slice(&(value as u32).to_le_bytes()[..3]);
    } else {
        buffer.push(0xfe);
        buffer.extend_from_slice(&value.to_le_bytes());
    }
}

/// Length-encoded string 쓰기
pub fn write_lenenc_str(buffer: &mut Vec<u8>, value: &[u8]) {
    write_lenenc_int(buffer, value.len() as u64);
    buffer.extend_from_slice(value);
}

fn truncated(what: &'static str) -> impl Fn(io::Error) -> ReplicaError {
    move |e| ReplicaError::Protocol(format!("Failed to read {}: {}", what, e))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio_test::io::Builder;

    fn frame(payload: &[u8], seq: u8) -> Vec<u8> {
        let len = payload.len() as u32;
        let mut out = len.to_le_bytes()[..3].to_vec();
        out.push(seq);
        out.extend_from_slice(payload);
        out
    }

    #[tokio::test]
    async fn test_read_packet() {
        let mock = Builder::new().read(&frame(b"\x00hello", 3)).build();
        let mut channel = PacketChannel::new(mock);
        let packet = channel.read_packet().await.unwrap();
        assert_eq!(&packet[..], b"\x00hello");
        assert_eq!(channel.sequence, 4);
    }

    #[tokio::test]
    async fn test_read_packet_reassembles_max_length_payload() {
        let first = vec![0xabu8; MAX_PACKET_LEN];
        let mock = Builder::new()
            .read(&frame(&first, 1))
            .read(&frame(b"tail", 2))
            .build();
        let mut channel = PacketChannel::new(mock);
        let packet = channel.read_packet().await.unwrap();
        assert_eq!(packet.len(), MAX_PACKET_LEN + 4);
        assert_eq!(&packet[MAX_PACKET_LEN..], b"tail");
    }

    #[tokio::test]
    async fn test_read_packet_closed_connection_is_network_error() {
        let mock = Builder::new().read(&[0x05, 0x00]).build();
        let mut channel = PacketChannel::new(mock);
        assert!(matches!(
            channel.read_packet().await,
            Err(ReplicaError::Network(_))
        ));
    }

    #[tokio::test]
    async fn test_write_command_resets_sequence() {
        let mock = Builder::new().write(&frame(b"\x0eping", 0)).build();
        let mut channel = PacketChannel::new(mock);
        channel.sequence = 7;
        channel.write_command(0x0e, b"ping").await.unwrap();
        assert_eq!(channel.sequence, 1);
    }

    #[tokio::test]
    async fn test_read_ok_maps_err_packet() {
        let mut err = vec![0xff, 0x15, 0x04, b'#'];
        err.extend_from_slice(b"28000Access denied");
        let mock = Builder::new().read(&frame(&err, 1)).build();
        let mut channel = PacketChannel::new(mock);
        match channel.read_ok().await {
            Err(ReplicaError::Primary { code, message }) => {
                assert_eq!(code, 1045);
                assert_eq!(message, "Access denied");
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_classify_stream_packets() {
        let event = StreamPacket::classify(Bytes::from_static(&[0x00, 1, 2, 3])).unwrap();
        assert_eq!(event, StreamPacket::Event(Bytes::from_static(&[1, 2, 3])));

        let eof = StreamPacket::classify(Bytes::from_static(&[0xfe, 0, 0, 2, 0])).unwrap();
        assert_eq!(eof, StreamPacket::Eof);

        let mut err = vec![0xff, 0xd4, 0x04];
        err.extend_from_slice(b"#HY000Could not find first log file name in binary log index file");
        match StreamPacket::classify(Bytes::from(err)).unwrap() {
            StreamPacket::Error(packet) => {
                assert_eq!(packet.code, 1236);
                assert_eq!(packet.sql_state.as_deref(), Some("HY000"));
            }
            other => panic!("unexpected {:?}", other),
        }

        assert!(StreamPacket::classify(Bytes::new()).is_err());
        assert!(StreamPacket::classify(Bytes::from_static(&[0x42])).is_err());
    }

    #[test]
    fn test_lenenc_int() {
        for value in [0u64, 250, 251, 0xffff, 0x10000, 0xff_ffff, 0x100_0000] {
            let mut buf = Vec::new();
            write_lenenc_int(&mut buf, value);
            assert_eq!(read_lenenc_int(&mut Cursor::new(&buf)).unwrap(), value);
        }
    }

    #[test]
    fn test_greeting_parse() {
        let mut data = vec![10u8];
        data.extend_from_slice(b"8.0.34\0");
        data.extend_from_slice(&42u32.to_le_bytes());
        data.extend_from_slice(b"abcdefgh");
        data.push(0);
        data.extend_from_slice(&0xf7ffu16.to_le_bytes());
        data.push(255);
        data.extend_from_slice(&2u16.to_le_bytes());
        data.extend_from_slice(&0xdfffu16.to_le_bytes());
        data.push(21);
        data.extend_from_slice(&[0u8; 10]);
        data.extend_from_slice(b"ijklmnopqrst\0");
        data.extend_from_slice(b"caching_sha2_password\0");

        let greeting = GreetingPacket::parse(&data).unwrap();
        assert_eq!(greeting.server_version, "8.0.34");
        assert_eq!(greeting.thread_id, 42);
        assert_eq!(greeting.scramble, b"abcdefghijklmnopqrst");
        assert_eq!(greeting.auth_plugin_name, "caching_sha2_password");
    }
}
