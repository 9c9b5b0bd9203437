//! 에러 타입 정의

use thiserror::Error;

use crate::crypto::CryptoError;
use crate::key_agreement::RejectReason;

/// TMIS 서버 에러 타입
///
/// 풀 생성 에러(`AllocationFailed`, `SyncInitFailed`, `InvalidPoolConfig`)는
/// 시작 시점에 치명적이고, 나머지는 해당 연결 안에서만 처리된다.
#[derive(Error, Debug)]
pub enum Error {
    #[error("IO 에러: {0}")]
    Io(#[from] std::io::Error),

    #[error("메모리 할당 실패: {what}")]
    AllocationFailed { what: &'static str },

    #[error("동기화/스레드 초기화 실패: {0}")]
    SyncInitFailed(String),

    #[error("잘못된 풀 설정: min={min}, max={max}, capacity={capacity}")]
    InvalidPoolConfig {
        min: usize,
        max: usize,
        capacity: usize,
    },

    #[error("작업 큐 가득 참")]
    QueueFull,

    #[error("스레드 풀 종료됨")]
    Shutdown,

    #[error("메시지 중간에 연결 끊김: expected {expected} bytes, got {got}")]
    Truncated { expected: usize, got: usize },

    #[error("연결 종료")]
    ConnectionClosed,

    #[error("페이로드 크기 초과: {len} > 최대 {max}")]
    PayloadTooLarge { len: usize, max: usize },

    #[error("알 수 없는 패킷 타입: {0}")]
    UnknownPacketType(u8),

    #[error("키 협상 거부: {0}")]
    ProtocolReject(#[from] RejectReason),

    #[error("세션 키 없음 (키 협상 전 요청)")]
    NoSession,

    #[error("데이터 저장소 에러: {0}")]
    DataStore(String),

    #[error("필드에 예약된 구분자 포함: {field}")]
    ReservedMarker { field: &'static str },

    #[error("잘못된 응답: {0}")]
    MalformedReply(String),

    #[error("암호화 에러: {0}")]
    Crypto(#[from] CryptoError),

    #[error("설정 에러: {0}")]
    Config(String),
}

impl Error {
    /// 이 에러 후 연결을 닫아야 하는지 여부
    ///
    /// 전송 계층 에러만 연결을 끊는다. 프로토콜 거부나 세션 없음은
    /// 연결을 유지한다.
    pub fn closes_connection(&self) -> bool {
        matches!(
            self,
            Error::Io(_)
                | Error::Truncated { .. }
                | Error::ConnectionClosed
                | Error::PayloadTooLarge { .. }
                | Error::UnknownPacketType(_)
        )
    }
}

impl From<toml::de::Error> for Error {
    fn from(e: toml::de::Error) -> Self {
        Error::Config(e.to_string())
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::DataStore(e.to_string())
    }
}

/// Result 타입 별칭
pub type Result<T> = std::result::Result<T, Error>;
