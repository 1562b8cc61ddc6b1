//! Semi-sync replica 훅
//!
//!   - request_dump: primary에 semi-sync가 켜져 있으면 `@rpl_semi_sync_slave` 설정
//!   - read_event: 이벤트 앞의 0xEF + 플래그 2바이트를 벗기고 응답 필요 여부 반환
//!   - queue_event: 0xEF + 위치(8) + 파일명 응답 전송

use crate::connection::PrimaryLink;
use crate::error::{ReplicaError, Result};
use bytes::Bytes;
use tracing::{debug, info};

pub const SEMI_SYNC_INDICATOR: u8 = 0xef;
pub const SEMI_SYNC_ACK_REQ: u8 = 0x01;

/// 8.0.26+ 는 source, 이전은 master
const PRIMARY_ENABLED_VARIABLES: [&str; 2] =
    ["rpl_semi_sync_source_enabled", "rpl_semi_sync_master_enabled"];

#[derive(Debug, Clone)]
pub struct SemiSync {
    configured: bool,
    active: bool,
}

impl SemiSync {
    pub fn new(configured: bool) -> Self {
        SemiSync {
            configured,
            active: false,
        }
    }

    /// dump 요청 전에 호출. 연결마다 새로 협상합니다.
    pub async fn request_dump<L: PrimaryLink>(&mut self, link: &mut L) -> Result<()> {
        self.active = false;
        if !self.configured {
            return Ok(());
        }

        let mut enabled = false;
        for name in PRIMARY_ENABLED_VARIABLES {
            if let Some(value) = link.variable(name).await? {
                enabled = value.eq_ignore_ascii_case("ON") || value == "1";
                break;
            }
        }
        if !enabled {
            debug!("Semi-sync is not enabled on primary");
            return Ok(());
        }

        link.execute("SET @rpl_semi_sync_slave = 1").await?;
        self.active = true;
        info!("Semi-sync replication negotiated");
        Ok(())
    }

    /// semi-sync 헤더를 제거한 이벤트와 응답 필요 여부
    pub fn read_event(&self, payload: Bytes) -> Result<(Bytes, bool)> {
        if !self.active {
            return Ok((payload, false));
        }
        if payload.len() < 2 || payload[0] != SEMI_SYNC_INDICATOR {
            return Err(ReplicaError::Protocol(format!(
                "missing semi-sync header (first byte {:?})",
                payload.first()
            )));
        }
        let need_reply = payload[1] & SEMI_SYNC_ACK_REQ != 0;
        Ok((payload.slice(2..), need_reply))
    }

    /// 기록이 끝난 위치를 primary에 알림
    pub async fn queue_event<L: PrimaryLink>(
        &self,
        link: &mut L,
        file_name: &str,
        position: u64,
    ) -> Result<()> {
        if !self.active {
            return Ok(());
        }
        link.send_command(SEMI_SYNC_INDICATOR, &ack_body(file_name, position))
            .await?;
        debug!(file = file_name, position, "Semi-sync ack sent");
        Ok(())
    }
}

/// 0xEF 이후의 응답 본문: 위치(8) + 파일명
pub fn ack_body(file_name: &str, position: u64) -> Vec<u8> {
    let mut body = Vec::with_capacity(8 + file_name.len());
    body.extend_from_slice(&position.to_le_bytes());
    body.extend_from_slice(file_name.as_bytes());
    body
}
