//! 풀/서버 통계

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

/// 스레드 풀 상태 스냅샷
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolStats {
    pub min_workers: usize,
    pub max_workers: usize,

    /// 살아있는 워커 수
    pub live_workers: usize,

    /// 작업 실행 중인 워커 수
    pub busy_workers: usize,

    /// 큐에 대기 중인 작업 수
    pub queued_tasks: usize,

    pub queue_capacity: usize,

    /// 아직 처리되지 않은 퇴역 요청 수
    pub pending_retirements: usize,

    pub shutdown: bool,
}

impl PoolStats {
    /// 바쁜 워커 비율 (0.0 ~ 1.0)
    pub fn busy_ratio(&self) -> f64 {
        if self.live_workers == 0 {
            return 0.0;
        }
        self.busy_workers as f64 / self.live_workers as f64
    }

    /// 큐 점유율 (0.0 ~ 1.0)
    pub fn queue_utilization(&self) -> f64 {
        if self.queue_capacity == 0 {
            return 0.0;
        }
        self.queued_tasks as f64 / self.queue_capacity as f64
    }

    pub fn summary(&self) -> String {
        format!(
            "Workers: {}/{} (min {}, max {}) | Busy: {:.1}% | Queue: {}/{} | Retiring: {}",
            self.busy_workers,
            self.live_workers,
            self.min_workers,
            self.max_workers,
            self.busy_ratio() * 100.0,
            self.queued_tasks,
            self.queue_capacity,
            self.pending_retirements,
        )
    }
}

/// 서버 전체 카운터
///
/// 워커 여러 개가 동시에 갱신하므로 전부 원자적 카운터다.
#[derive(Debug)]
pub struct ServerStats {
    start_time: Instant,

    /// 수락한 연결 수
    pub connections_accepted: AtomicU64,

    /// 닫힌 연결 수
    pub connections_closed: AtomicU64,

    /// 성공한 키 협상 수
    pub key_agreements: AtomicU64,

    /// 거부된 키 협상 수
    pub rejected_exchanges: AtomicU64,

    /// 처리한 레코드 요청 수
    pub record_requests: AtomicU64,

    /// 세션 없이 들어온 레코드 요청 수
    pub no_session_requests: AtomicU64,

    /// 저장소 에러 수
    pub data_store_errors: AtomicU64,

    /// 연결을 끊은 전송 계층 에러 수
    pub transport_errors: AtomicU64,
}

impl ServerStats {
    pub fn new() -> Self {
        Self {
            start_time: Instant::now(),
            connections_accepted: AtomicU64::new(0),
            connections_closed: AtomicU64::new(0),
            key_agreements: AtomicU64::new(0),
            rejected_exchanges: AtomicU64::new(0),
            record_requests: AtomicU64::new(0),
            no_session_requests: AtomicU64::new(0),
            data_store_errors: AtomicU64::new(0),
            transport_errors: AtomicU64::new(0),
        }
    }

    /// 카운터 1 증가
    pub fn incr(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn get(counter: &AtomicU64) -> u64 {
        counter.load(Ordering::Relaxed)
    }

    /// 경과 시간
    pub fn elapsed(&self) -> Duration {
        self.start_time.elapsed()
    }

    /// 현재 열린 연결 수
    pub fn open_connections(&self) -> u64 {
        Self::get(&self.connections_accepted).saturating_sub(Self::get(&self.connections_closed))
    }

    /// 키 협상 성공률
    pub fn agreement_success_rate(&self) -> f64 {
        let ok = Self::get(&self.key_agreements);
        let total = ok + Self::get(&self.rejected_exchanges);
        if total == 0 {
            return 0.0;
        }
        ok as f64 / total as f64
    }

    /// 통계 요약 문자열
    pub fn summary(&self) -> String {
        format!(
            "Uptime: {:.0}s | Connections: {} open / {} total | Key agreements: {} ok, {} rejected | Records: {} (no session {}, store errors {}) | Transport errors: {}",
            self.elapsed().as_secs_f64(),
            self.open_connections(),
            Self::get(&self.connections_accepted),
            Self::get(&self.key_agreements),
            Self::get(&self.rejected_exchanges),
            Self::get(&self.record_requests),
            Self::get(&self.no_session_requests),
            Self::get(&self.data_store_errors),
            Self::get(&self.transport_errors),
        )
    }
}

impl Default for ServerStats {
    fn default() -> Self {
        Self::new()
    }
}
