//! MySQL 인증 처리
//!
//! Native password authentication 구현. 서버가 다른 플러그인으로
//! auth switch를 요청하면 mysql_native_password만 따라갑니다.

use crate::error::{ReplicaError, Result};
use crate::protocol::{
    write_lenenc_str, ErrPacket, GreetingPacket, OkPacket, PacketChannel, EOF_HEADER, ERR_HEADER,
    OK_HEADER,
};
use byteorder::{LittleEndian, WriteBytesExt};
use std::io::Write;
use tokio::io::{AsyncRead, AsyncWrite};
use tracing::debug;

pub const NATIVE_PASSWORD_PLUGIN: &str = "mysql_native_password";

/// utf8mb4_general_ci
pub const DEFAULT_COLLATION: u8 = 45;

/// Client capability flags
pub mod capabilities {
    pub const LONG_PASSWORD: u32 = 1;
    pub const LONG_FLAG: u32 = 4;
    pub const CONNECT_WITH_DB: u32 = 8;
    pub const PROTOCOL_41: u32 = 512;
    pub const TRANSACTIONS: u32 = 8192;
    pub const SECURE_CONNECTION: u32 = 32768;
    pub const MULTI_STATEMENTS: u32 = 1 << 16;
    pub const MULTI_RESULTS: u32 = 1 << 17;
    pub const PLUGIN_AUTH: u32 = 1 << 19;
    pub const CONNECT_ATTRS: u32 = 1 << 20;
}

/// 핸드셰이크에 실어 보내는 클라이언트 정보
#[derive(Debug, Clone)]
pub struct Credentials<'a> {
    pub username: &'a str,
    pub password: &'a str,
    /// 연결 속성 (performance_schema.session_connect_attrs 에 노출)
    pub attributes: Vec<(&'a str, &'a str)>,
}

/// Native password 인증 응답 생성
pub fn create_auth_response(password: &str, scramble: &[u8]) -> Vec<u8> {
    if password.is_empty() {
        return Vec::new();
    }

    // SHA1(password)
    let stage1 = sha1(password.as_bytes());

    // SHA1(SHA1(password))
    let stage2 = sha1(&stage1);

    // SHA1(scramble + SHA1(SHA1(password)))
    let mut combined = scramble.to_vec();
    combined.extend_from_slice(&stage2);
    let stage3 = sha1(&combined);

    stage1.iter().zip(stage3.iter()).map(|(a, b)| a ^ b).collect()
}

fn sha1(data: &[u8]) -> Vec<u8> {
    use sha1::{Digest, Sha1};
    let mut hasher = Sha1::new();
    hasher.update(data);
    hasher.finalize().to_vec()
}

/// 인증 패킷 생성
pub fn create_handshake_response(
    credentials: &Credentials<'_>,
    scramble: &[u8],
    collation: u8,
) -> std::result::Result<Vec<u8>, std::io::Error> {
    let mut buffer = Vec::new();

    let mut capabilities = capabilities::LONG_PASSWORD
        | capabilities::LONG_FLAG
        | capabilities::PROTOCOL_41
        | capabilities::TRANSACTIONS
        | capabilities::SECURE_CONNECTION
        | capabilities::MULTI_STATEMENTS
        | capabilities::MULTI_RESULTS
        | capabilities::PLUGIN_AUTH;
    if !credentials.attributes.is_empty() {
        capabilities |= capabilities::CONNECT_ATTRS;
    }

    buffer.write_u32::<LittleEndian>(capabilities)?;

    // Max packet size (4 bytes) - 0 means default (16MB)
    buffer.write_u32::<LittleEndian>(0)?;
    buffer.write_u8(collation)?;
    buffer.write_all(&[0u8; 23])?;

    // Username (null-terminated string)
    buffer.write_all(credentials.username.as_bytes())?;
    buffer.write_u8(0)?;

    let auth_response = create_auth_response(credentials.password, scramble);
    buffer.write_u8(auth_response.len() as u8)?;
    buffer.write_all(&auth_response)?;

    buffer.write_all(NATIVE_PASSWORD_PLUGIN.as_bytes())?;
    buffer.write_u8(0)?;

    if !credentials.attributes.is_empty() {
        let mut attrs = Vec::new();
        for (key, value) in &credentials.attributes {
            write_lenenc_str(&mut attrs, key.as_bytes());
            write_lenenc_str(&mut attrs, value.as_bytes());
        }
        write_lenenc_str(&mut buffer, &attrs);
    }

    Ok(buffer)
}

/// Auth switch 요청 (0xFE + 플러그인명 + 새 scramble)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthSwitchRequest {
    pub plugin_name: String,
    pub scramble: Vec<u8>,
}

impl AuthSwitchRequest {
    pub fn parse(data: &[u8]) -> Result<Self> {
        if data.first() != Some(&EOF_HEADER) {
            return Err(ReplicaError::Protocol("not an auth switch request".to_string()));
        }
        let body = &data[1..];
        let name_end = body.iter().position(|&b| b == 0).unwrap_or(body.len());
        let plugin_name = String::from_utf8_lossy(&body[..name_end]).to_string();
        let mut scramble = body.get(name_end + 1..).unwrap_or_default().to_vec();
        if scramble.last() == Some(&0) {
            scramble.pop();
        }
        Ok(AuthSwitchRequest {
            plugin_name,
            scramble,
        })
    }
}

/// Greeting 수신부터 인증 완료까지 수행
pub async fn authenticate<S>(
    channel: &mut PacketChannel<S>,
    credentials: &Credentials<'_>,
) -> Result<GreetingPacket>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let greeting = GreetingPacket::parse(&channel.read_packet().await?)?;
    debug!(
        "Greeting from MySQL {} (thread {}, plugin {})",
        greeting.server_version, greeting.thread_id, greeting.auth_plugin_name
    );

    let response = create_handshake_response(credentials, &greeting.scramble, DEFAULT_COLLATION)
        .map_err(|e| ReplicaError::Protocol(format!("Failed to build handshake: {}", e)))?;
    channel.write_packet(&response).await?;

    let reply = channel.read_packet().await?;
    let reply = match reply.first() {
        Some(&EOF_HEADER) => {
            let switch = AuthSwitchRequest::parse(&reply)?;
            if switch.plugin_name != NATIVE_PASSWORD_PLUGIN {
                return Err(ReplicaError::connect(format!(
                    "unsupported authentication plugin '{}'",
                    switch.plugin_name
                )));
            }
            debug!("Auth switch to {}", switch.plugin_name);
            channel
                .write_packet(&create_auth_response(credentials.password, &switch.scramble))
                .await?;
            channel.read_packet().await?
        }
        _ => reply,
    };

    match reply.first() {
        Some(&OK_HEADER) => {
            OkPacket::parse(&reply)?;
            Ok(greeting)
        }
        Some(&ERR_HEADER) => Err(ErrPacket::parse(&reply)?.into_connect_error()),
        Some(other) => Err(ReplicaError::connect(format!(
            "unexpected authentication reply 0x{:02x}",
            other
        ))),
        None => Err(ReplicaError::connect("empty authentication reply")),
    }
}
