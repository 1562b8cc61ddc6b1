//! 가상 replica: 연결 → dump 요청 → 수신 루프 → 장애 시 복구
//!
//! 하나의 제어 루프가 모든 상태를 소유합니다. 네트워크/프로토콜 장애는
//! RECOVERING 상태로 전이한 뒤 재연결하고, 로컬 저장소/설정 에러는
//! 즉시 반환되어 프로세스를 종료시킵니다.

use crate::binlog::BinlogParser;
use crate::config::{ReplicaConfig, StartupMode};
use crate::connection::{check_primary_version, Connector, PrimaryLink};
use crate::dump::{DumpMode, DumpRequest, Registration, COM_REGISTER_SLAVE};
use crate::error::{ReplicaError, Result};
use crate::events::{EventHeader, EventType, FormatDescription};
use crate::gtid::GtidSet;
use crate::identity::PrimaryIdentity;
use crate::offset::BinlogPosition;
use crate::protocol::StreamPacket;
use crate::recovery::{scan_last_xid, ConnState, RecoveryState, Transition};
use crate::semisync::SemiSync;
use crate::writer::{BinlogWriter, OpenMode};
use bytes::Bytes;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

/// ER_MASTER_FATAL_ERROR_READING_BINLOG
pub const ER_MASTER_FATAL_ERROR_READING_BINLOG: u16 = 1236;

/// 한 세션(연결)이 끝난 이유
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SessionEnd {
    Shutdown,
    /// 논블로킹 dump에서 더 받을 이벤트가 없음
    EndOfStream,
}

/// RECOVERING 상태에서 이벤트를 처리한 결과
enum Recovered {
    Skip,
    Continue,
}

pub struct Replica<C: Connector> {
    config: ReplicaConfig,
    connector: C,
    link: Option<C::Link>,
    writer: BinlogWriter,
    excluded: GtidSet,
    included: GtidSet,
    identity: PrimaryIdentity,
    recovery: RecoveryState,
    cursor: BinlogPosition,
    context: FormatDescription,
    semisync: SemiSync,
    attempts: u32,
}

impl<C: Connector> Replica<C> {
    pub fn new(config: ReplicaConfig, connector: C) -> Result<Self> {
        config.validate()?;
        let writer = BinlogWriter::open(config.binlog_dir(), &config.index_file, config.fsync_mode)?;
        let semisync = SemiSync::new(config.semi_sync);
        Ok(Replica {
            config,
            connector,
            link: None,
            writer,
            excluded: GtidSet::new(),
            included: GtidSet::new(),
            identity: PrimaryIdentity::new(),
            recovery: RecoveryState::fresh_gtid(),
            cursor: BinlogPosition::default(),
            context: FormatDescription::default(),
            semisync,
            attempts: 0,
        })
    }

    pub fn cursor(&self) -> &BinlogPosition {
        &self.cursor
    }

    pub fn recovery(&self) -> &RecoveryState {
        &self.recovery
    }

    pub fn excluded(&self) -> &GtidSet {
        &self.excluded
    }

    pub fn included(&self) -> &GtidSet {
        &self.included
    }

    pub fn identity(&self) -> &PrimaryIdentity {
        &self.identity
    }

    /// 종료 신호를 받거나 치명적 에러가 날 때까지 실행
    pub async fn run(&mut self, mut shutdown: watch::Receiver<bool>) -> Result<()> {
        let result = self.drive(&mut shutdown).await;
        let closed = self.close().await;
        match result {
            Err(e) => {
                error!("Replication stopped: {}", e);
                Err(e)
            }
            Ok(()) => closed,
        }
    }

    async fn drive(&mut self, shutdown: &mut watch::Receiver<bool>) -> Result<()> {
        if !self.bootstrap(shutdown).await? {
            return Ok(());
        }

        loop {
            if stop_requested(shutdown) {
                info!("Shutdown requested");
                return Ok(());
            }

            match self.session(shutdown).await {
                Ok(SessionEnd::Shutdown) => {
                    info!("Shutdown requested");
                    return Ok(());
                }
                Ok(SessionEnd::EndOfStream) => {
                    info!(position = %self.cursor, "Reached end of primary binlog");
                    return Ok(());
                }
                Err(e) if e.is_fatal() => return Err(e),
                Err(e) => {
                    self.record_fault(&e)?;
                    if !self.backoff(shutdown).await? {
                        return Ok(());
                    }
                }
            }
        }
    }

    /// 시작 모드에 따라 초기 복구 상태를 정합니다. 종료 신호를 받으면 false
    async fn bootstrap(&mut self, shutdown: &mut watch::Receiver<bool>) -> Result<bool> {
        match self.config.get_start_gtid_mode {
            StartupMode::ConfiguredGtids => {
                self.writer.reset()?;
                self.excluded
                    .add_from_text(&self.config.exclude_gtids)
                    .map_err(|e| ReplicaError::Config(format!("exclude_gtids: {}", e)))?;
                self.recovery = RecoveryState::fresh_gtid();
                info!(excluded = %self.excluded.to_string(), "Starting from configured GTID set");
                Ok(true)
            }
            StartupMode::PrimaryExecuted => self.bootstrap_from_primary(shutdown).await,
            StartupMode::ResumeLocal => {
                let Some(last) = self.writer.index().last_entry().map(str::to_string) else {
                    info!("Index is empty, starting from primary executed GTID set");
                    return self.bootstrap_from_primary(shutdown).await;
                };
                self.resume_local(&last)?;
                Ok(true)
            }
        }
    }

    async fn bootstrap_from_primary(&mut self, shutdown: &mut watch::Receiver<bool>) -> Result<bool> {
        let excluded = loop {
            if stop_requested(shutdown) {
                return Ok(false);
            }
            match self.fetch_executed().await {
                Ok(set) => break set,
                Err(e) if e.is_fatal() => return Err(e),
                Err(e) => {
                    warn!("Could not read primary executed GTID set: {}", e);
                    if !self.backoff(shutdown).await? {
                        return Ok(false);
                    }
                }
            }
        };
        self.attempts = 0;

        self.writer.reset()?;
        self.excluded = excluded;
        self.recovery = RecoveryState::fresh_gtid();
        info!(excluded = %self.excluded.to_string(), "Starting from primary executed GTID set");
        Ok(true)
    }

    async fn fetch_executed(&mut self) -> Result<GtidSet> {
        let mut link = self.connector.connect().await?;
        let executed = link.executed_gtid_set().await;
        link.close().await;
        GtidSet::parse(&executed?).map_err(unreadable_primary_gtids)
    }

    /// 인덱스의 마지막 파일에서 마지막 XID를 찾아 이어받기
    fn resume_local(&mut self, name: &str) -> Result<()> {
        let path = self.writer.segment_path(name);
        match scan_last_xid(&path)? {
            Some(mark) => {
                info!(file = name, position = mark.log_pos, local_end = mark.local_end, "Resuming after last transaction");
                self.recovery = RecoveryState {
                    state: ConnState::Recovering,
                    mode: DumpMode::Position,
                    resume: BinlogPosition::new(name, mark.log_pos as u64),
                    last_acked: mark.log_pos as u64,
                    open_mode: OpenMode::Append {
                        truncate_to: Some(mark.local_end),
                    },
                };
            }
            None => {
                warn!(file = name, "Could not find last position in last file, overwriting it");
                self.recovery = RecoveryState {
                    state: ConnState::Normal,
                    mode: DumpMode::Position,
                    resume: BinlogPosition::start_of(name),
                    last_acked: 0,
                    open_mode: OpenMode::Truncate,
                };
            }
        }
        self.cursor = self.recovery.resume.clone();
        Ok(())
    }

    /// 이전 연결을 닫고 새로 연결해 스트리밍
    async fn session(&mut self, shutdown: &mut watch::Receiver<bool>) -> Result<SessionEnd> {
        if let Some(mut prior) = self.link.take() {
            prior.close().await;
        }
        let mut link = self.connector.connect().await?;
        let result = self.stream(&mut link, shutdown).await;
        self.link = Some(link);
        result
    }

    async fn stream(
        &mut self,
        link: &mut C::Link,
        shutdown: &mut watch::Receiver<bool>,
    ) -> Result<SessionEnd> {
        let request = self.prepare(link).await?;
        info!(
            mode = ?request.mode(),
            file = request.file_name(),
            position = request.start_position(),
            state = ?self.recovery.state,
            "Requesting binlog dump"
        );
        link.send_command(request.command(), &request.encode()).await?;
        self.cursor = self.recovery.resume.clone();

        loop {
            if stop_requested(shutdown) {
                return Ok(SessionEnd::Shutdown);
            }
            let packet = tokio::select! {
                _ = shutdown.changed() => return Ok(SessionEnd::Shutdown),
                packet = link.read_packet() => packet?,
            };

            match StreamPacket::classify(packet)? {
                StreamPacket::Event(payload) => {
                    let (event, need_reply) = self.semisync.read_event(payload)?;
                    self.handle_event(link, event, need_reply).await?;
                }
                StreamPacket::Eof if !self.config.stop_never => {
                    self.writer.sync_if_configured()?;
                    return Ok(SessionEnd::EndOfStream);
                }
                StreamPacket::Eof => {
                    return Err(ReplicaError::Protocol(
                        "unexpected EOF packet in blocking dump".to_string(),
                    ))
                }
                StreamPacket::Error(err) => return Err(err.into_error()),
            }
        }
    }

    /// 버전 확인, identity 갱신, 상태 전이, 세션 설정, 등록 후 dump 요청 생성
    async fn prepare(&mut self, link: &mut C::Link) -> Result<DumpRequest> {
        check_primary_version(link).await?;
        link.execute("SET @master_binlog_checksum='NONE'").await?;

        let switched = self.identity.refresh(link).await?;
        match self.recovery.transition(switched, self.config.start_position) {
            Transition::Failover => {
                let executed = link.executed_gtid_set().await?;
                self.excluded
                    .add_from_text(&executed)
                    .map_err(unreadable_primary_gtids)?;
                // 같은 이름의 파일도 덮어쓰도록 현재 파일을 닫음
                self.writer.close()?;
                warn!(
                    excluded = %self.excluded.to_string(),
                    "Primary changed, restarting in GTID mode"
                );
            }
            Transition::Resume => {
                info!(resume = %self.recovery.resume, mode = ?self.recovery.mode, "Resuming stream");
            }
            Transition::Start => {}
        }

        self.semisync.request_dump(link).await?;
        self.register(link).await?;

        if self.config.heartbeat_period > 0 {
            link.execute(&format!(
                "SET @master_heartbeat_period = {}",
                self.config.heartbeat_period_ns()
            ))
            .await?;
        }
        link.execute(&format!("SET @slave_uuid = '{}'", self.config.replica_uuid()))
            .await?;

        let non_blocking = !self.config.stop_never;
        let server_id = self.config.virtual_slave_server_id;
        match self.recovery.mode {
            DumpMode::Position => DumpRequest::position(
                &self.recovery.resume.filename,
                self.recovery.resume.position,
                server_id,
                non_blocking,
            ),
            DumpMode::Gtid => DumpRequest::gtid(
                &self.excluded,
                self.config.start_position,
                server_id,
                non_blocking,
            ),
        }
    }

    async fn register(&mut self, link: &mut C::Link) -> Result<()> {
        let registration = Registration {
            server_id: self.config.virtual_slave_server_id,
            report_host: self.config.report_host.clone(),
            report_user: self.config.report_user.clone(),
            report_password: self.config.report_password.clone(),
            report_port: self.config.report_port,
        };
        match registration.encode() {
            Some(payload) => link.command(COM_REGISTER_SLAVE, &payload).await,
            None => {
                warn!("Report host/user/password too long, skipping replica registration");
                Ok(())
            }
        }
    }

    async fn handle_event(&mut self, link: &mut C::Link, event: Bytes, need_reply: bool) -> Result<()> {
        let header = BinlogParser::parse_framed(&event)?;

        if self.recovery.is_recovering() {
            if let Recovered::Skip = self.recovering_event(&header, &event)? {
                return Ok(());
            }
        }

        match header.event_type() {
            kind if kind.is_heartbeat() => {
                debug!(position = %self.cursor, "Heartbeat");
                Ok(())
            }
            EventType::RotateEvent => self.rotate_event(link, &header, &event, need_reply).await,
            EventType::FormatDescriptionEvent => {
                self.format_description_event(link, &header, &event, need_reply)
                    .await
            }
            _ => self.write_event(link, &header, &event, need_reply).await,
        }
    }

    /// RECOVERING 상태의 이벤트 처리. `Continue`면 같은 이벤트를 정상 경로로 넘김
    fn recovering_event(&mut self, header: &EventHeader, event: &[u8]) -> Result<Recovered> {
        match header.event_type() {
            kind if kind.is_heartbeat() => {
                debug!("Recovering, received heartbeat");
                Ok(Recovered::Skip)
            }
            EventType::RotateEvent => {
                let rotate = BinlogParser::parse_rotate_event(event, &self.context)?;
                if rotate.next_binlog_name == self.recovery.resume.filename {
                    self.cursor.set(&rotate.next_binlog_name, rotate.position);
                    debug!(position = %self.cursor, "Recovering, rotate to resumed file");
                    Ok(Recovered::Skip)
                } else {
                    self.recovery.finish_recovery();
                    Ok(Recovered::Continue)
                }
            }
            EventType::FormatDescriptionEvent => {
                if self.cursor.at_file_start() {
                    self.recovery.finish_recovery();
                    return Ok(Recovered::Continue);
                }
                self.context = BinlogParser::parse_format_description(event)?;
                debug!(position = %self.cursor, "Recovering, format description updated");
                Ok(Recovered::Skip)
            }
            _ => {
                if self.cursor.filename.is_empty() {
                    return Err(ReplicaError::Protocol(
                        "event received before any rotate while recovering".to_string(),
                    ));
                }
                self.writer
                    .ensure_open(&self.cursor.filename, self.recovery.open_mode)?;
                self.recovery.finish_recovery();
                Ok(Recovered::Continue)
            }
        }
    }

    async fn rotate_event(
        &mut self,
        link: &mut C::Link,
        header: &EventHeader,
        event: &[u8],
        need_reply: bool,
    ) -> Result<()> {
        let rotate = BinlogParser::parse_rotate_event(event, &self.context)?;

        if rotate.synthetic {
            // 가짜 rotate는 원본 로그에 없으므로 기록하지 않음
            if self.config.to_last_log && self.writer.current_name().is_some() {
                self.writer.append(event)?;
            }
            debug!(file = %rotate.next_binlog_name, position = rotate.position, "Fake rotate");
            self.cursor.set(&rotate.next_binlog_name, rotate.position);
            return Ok(());
        }

        self.write_event(link, header, event, need_reply).await?;
        info!(
            from = %self.cursor.filename,
            to = %rotate.next_binlog_name,
            position = rotate.position,
            "Rotate"
        );
        self.cursor.set(&rotate.next_binlog_name, rotate.position);
        self.recovery.acknowledge(rotate.position);
        Ok(())
    }

    async fn format_description_event(
        &mut self,
        link: &mut C::Link,
        header: &EventHeader,
        event: &[u8],
        need_reply: bool,
    ) -> Result<()> {
        let fde = BinlogParser::parse_format_description(event)?;

        if !self.cursor.at_file_start() {
            // 연결 직후 다시 보내준 FDE: 위치를 움직이지 않음
            debug!(position = %self.cursor, "Format description resent by primary");
            self.context = fde;
            return Ok(());
        }

        if self.cursor.filename.is_empty() {
            return Err(ReplicaError::Protocol(
                "format description received before binlog file name".to_string(),
            ));
        }

        info!(
            file = %self.cursor.filename,
            server_version = %fde.server_version,
            created = ?fde.created_at(),
            checksum = ?fde.checksum_alg,
            "New binlog segment"
        );
        self.context = fde;
        self.writer.close()?;
        self.writer.ensure_open(&self.cursor.filename, OpenMode::Truncate)?;
        self.write_event(link, header, event, need_reply).await
    }

    /// 이벤트 바이트 기록, 위치 갱신, 필요하면 동기화 후 semi-sync 응답
    async fn write_event(
        &mut self,
        link: &mut C::Link,
        header: &EventHeader,
        event: &[u8],
        need_reply: bool,
    ) -> Result<()> {
        if self.writer.current_name().is_none() {
            return Err(ReplicaError::Protocol(format!(
                "event type {} received before format description",
                header.type_code
            )));
        }

        self.writer.append(event)?;
        self.cursor.advance(header.log_pos, header.event_length);
        self.recovery.acknowledge(self.cursor.position);
        self.attempts = 0;

        if need_reply || header.event_type() == EventType::XidEvent {
            self.writer.sync_if_configured()?;
        }
        if need_reply {
            self.semisync
                .queue_event(link, &self.cursor.filename, self.cursor.position)
                .await?;
        }
        Ok(())
    }

    fn record_fault(&mut self, err: &ReplicaError) -> Result<()> {
        error!(
            code = ?err.error_code(),
            file = %self.cursor.filename,
            offset = self.cursor.position,
            "Replication interrupted: {}",
            err
        );

        let fatal_read = matches!(err, ReplicaError::Primary { code, .. } if *code == ER_MASTER_FATAL_ERROR_READING_BINLOG);
        if fatal_read {
            warn!("Primary cannot serve the requested binlog, resetting local state");
            self.writer.reset()?;
            self.recovery.on_fatal_read();
            self.cursor = BinlogPosition::default();
            self.context = FormatDescription::default();
        } else {
            self.recovery.on_fault(&self.cursor);
        }
        Ok(())
    }

    /// 재연결 전 대기. 종료 신호를 받으면 false
    async fn backoff(&mut self, shutdown: &mut watch::Receiver<bool>) -> Result<bool> {
        self.attempts += 1;
        let max = self.config.max_reconnect_attempts;
        if max > 0 && self.attempts > max {
            return Err(ReplicaError::RetriesExhausted(max));
        }

        let delay = self.config.reconnect_delay(self.attempts - 1);
        info!(attempt = self.attempts, delay_ms = delay.as_millis() as u64, "Reconnecting");
        tokio::select! {
            _ = tokio::time::sleep(delay) => Ok(true),
            _ = shutdown.changed() => Ok(false),
        }
    }

    async fn close(&mut self) -> Result<()> {
        let flushed = self.writer.close();
        if let Some(mut link) = self.link.take() {
            link.close().await;
        }
        flushed
    }
}

fn stop_requested(shutdown: &watch::Receiver<bool>) -> bool {
    *shutdown.borrow()
}

/// primary가 보고한 `gtid_executed`를 읽을 수 없으면 재연결로 다시 시도
fn unreadable_primary_gtids(e: ReplicaError) -> ReplicaError {
    ReplicaError::Protocol(format!("primary gtid_executed: {}", e))
}
