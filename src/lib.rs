//! # TMIS (Telecare Medical Information Server)
//!
//! 키 협상 기반 다중 클라이언트 세션 서버
//!
//! ## 핵심 특징
//! - **적응형 스레드 풀**: 고정 용량 작업 큐 + 최소~최대 워커 자동 조절
//! - **신원 기반 키 협상**: 마스터 비밀로 신원 인증 후 세션 키 유도
//! - **레코드 프로토콜**: 세션 키로 암호화된 진료 기록 조회
//! - **패킷 코덱**: 길이 + 타입 헤더, 길이 검증된 페이로드

pub mod client;
pub mod config;
pub mod crypto;
pub mod dispatcher;
pub mod error;
pub mod key_agreement;
pub mod logging;
pub mod packet;
pub mod pool;
pub mod record;
pub mod server;
pub mod session;
pub mod stats;

pub use client::ClientSession;
pub use config::{Config, PoolConfig};
pub use crypto::{CryptoError, SymmetricKey};
pub use dispatcher::Dispatcher;
pub use error::{Error, Result};
pub use key_agreement::{KeyAgreement, MasterKeyMaterial, RejectReason};
pub use packet::{Packet, PacketType};
pub use pool::ThreadPool;
pub use record::{DataStore, InMemoryDataStore, MedicalRecord, RecordService};
pub use server::Server;
pub use session::{ConnectionId, SessionKeyTable};
pub use stats::{PoolStats, ServerStats};

/// 기본 포트
pub const DEFAULT_PORT: u16 = 8888;

/// 기본 최대 페이로드 크기 (바이트)
pub const DEFAULT_MAX_PAYLOAD_SIZE: usize = 16 * 1024; // 16KB

/// 생성원 P를 유도하는 기본 시드
pub const DEFAULT_GENERATOR_SEED: &str = "tmis-generator-seed";
