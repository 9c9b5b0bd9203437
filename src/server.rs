//! 요청 처리기 - 워커에서 패킷 하나를 읽고 태그에 따라 분기
//!
//! 연결별 에러는 그 연결 안에서 끝난다:
//! - 전송 계층 에러: 연결 종료
//! - 키 협상 거부: 응답 없음, 연결 유지
//! - 세션 없음: 응답 없음, 저장소 호출 없음, 연결 유지
//! - 저장소 에러: 빈 RecordReply, 연결 유지

use std::io::{Read, Write};
use std::sync::Arc;

use tracing::{debug, info, warn};

use crate::config::Config;
use crate::key_agreement::KeyAgreement;
use crate::packet::{self, PacketType};
use crate::record::{DataStore, RecordService};
use crate::session::{ConnectionId, SessionKeyTable};
use crate::stats::ServerStats;
use crate::{Error, Result};

/// 서버 상태 (모든 워커가 공유)
pub struct Server {
    key_agreement: KeyAgreement,
    records: RecordService,
    sessions: SessionKeyTable,
    stats: ServerStats,
    max_payload: usize,
}

impl Server {
    pub fn new(config: &Config, store: Arc<dyn DataStore>) -> Result<Self> {
        Ok(Self::with_parts(
            KeyAgreement::from_config(config)?,
            store,
            config.max_payload_size,
        ))
    }

    pub fn with_parts(key_agreement: KeyAgreement, store: Arc<dyn DataStore>, max_payload: usize) -> Self {
        Self {
            key_agreement,
            records: RecordService::new(store),
            sessions: SessionKeyTable::new(),
            stats: ServerStats::new(),
            max_payload,
        }
    }

    pub fn key_agreement(&self) -> &KeyAgreement {
        &self.key_agreement
    }

    pub fn sessions(&self) -> &SessionKeyTable {
        &self.sessions
    }

    pub fn stats(&self) -> &ServerStats {
        &self.stats
    }

    pub fn max_payload(&self) -> usize {
        self.max_payload
    }

    /// 새 연결 등록
    pub fn open_connection(&self, conn: ConnectionId) {
        ServerStats::incr(&self.stats.connections_accepted);
        debug!("{} opened", conn);
    }

    /// 연결 종료 시 세션 키 제거
    pub fn close_connection(&self, conn: ConnectionId) {
        if self.sessions.remove(conn).is_some() {
            debug!("{}: session key removed", conn);
        }
        ServerStats::incr(&self.stats.connections_closed);
    }

    /// 패킷 하나 읽고 처리
    pub fn handle_request<S: Read + Write>(&self, conn: ConnectionId, stream: &mut S) -> Result<()> {
        let request = packet::read_packet(stream, self.max_payload)?;

        match request.packet_type {
            PacketType::KeyAgreement => self.handle_key_agreement(conn, &request.payload, stream),
            PacketType::Record => self.handle_record(conn, &request.payload, stream),
        }
    }

    /// 요청 하나 처리 후 연결을 유지할지 반환
    pub fn serve_one<S: Read + Write>(&self, conn: ConnectionId, stream: &mut S) -> bool {
        match self.handle_request(conn, stream) {
            Ok(()) => true,
            Err(Error::ConnectionClosed) => {
                debug!("{}: client closed", conn);
                false
            }
            Err(e) if e.closes_connection() => {
                ServerStats::incr(&self.stats.transport_errors);
                warn!("{}: {} (closing)", conn, e);
                false
            }
            Err(e) => {
                warn!("{}: {}", conn, e);
                true
            }
        }
    }

    /// 연결이 끝날 때까지 요청 처리 (연결당 블로킹 루프)
    pub fn serve_connection<S: Read + Write>(&self, conn: ConnectionId, mut stream: S) {
        self.open_connection(conn);
        while self.serve_one(conn, &mut stream) {}
        self.close_connection(conn);
    }

    fn handle_key_agreement<W: Write>(&self, conn: ConnectionId, payload: &[u8], stream: &mut W) -> Result<()> {
        let agreement = match self.key_agreement.respond(payload) {
            Ok(agreement) => agreement,
            Err(reason) => {
                // 거부 시 응답하지 않는다
                ServerStats::incr(&self.stats.rejected_exchanges);
                return Err(Error::ProtocolReject(reason));
            }
        };

        // 응답을 보낸 뒤에만 세션 키 설치
        packet::write_packet(stream, PacketType::KeyAgreement, &agreement.reply, self.max_payload)?;
        self.sessions.install(conn, agreement.session_key);

        ServerStats::incr(&self.stats.key_agreements);
        info!("{}: session key shared with {}", conn, agreement.identity);
        Ok(())
    }

    fn handle_record<W: Write>(&self, conn: ConnectionId, payload: &[u8], stream: &mut W) -> Result<()> {
        ServerStats::incr(&self.stats.record_requests);

        let reply = match self.records.respond(&self.sessions, conn, payload) {
            Ok(reply) => reply,
            Err(Error::NoSession) => {
                ServerStats::incr(&self.stats.no_session_requests);
                return Err(Error::NoSession);
            }
            Err(e) => {
                if matches!(e, Error::DataStore(_)) {
                    ServerStats::incr(&self.stats.data_store_errors);
                }
                warn!("{}: record lookup failed, sending empty reply: {}", conn, e);
                Vec::new()
            }
        };

        let reply = if reply.len() > self.max_payload {
            warn!(
                "{}: record reply too large ({} > {}), sending empty reply",
                conn,
                reply.len(),
                self.max_payload
            );
            Vec::new()
        } else {
            reply
        };

        packet::write_packet(stream, PacketType::Record, &reply, self.max_payload)?;
        debug!("{}: record reply sent ({} bytes)", conn, reply.len());
        Ok(())
    }
}
