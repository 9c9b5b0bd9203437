//! 연결 식별자와 세션 키 테이블

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

use dashmap::DashMap;

use crate::crypto::SymmetricKey;

/// 연결 식별자
///
/// 프로세스 안에서 단조 증가하며 재사용되지 않는다.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(pub u64);

impl ConnectionId {
    /// 새 식별자 발급
    pub fn next() -> Self {
        static NEXT: AtomicU64 = AtomicU64::new(1);
        Self(NEXT.fetch_add(1, Ordering::Relaxed))
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "conn#{}", self.0)
    }
}

/// 연결별 세션 키 테이블
///
/// 키 협상 성공 시에만 기록되고, 레코드 프로토콜은 읽기만 한다.
/// 연결이 닫히면 제거된다.
#[derive(Debug, Default)]
pub struct SessionKeyTable {
    keys: DashMap<ConnectionId, SymmetricKey>,
}

impl SessionKeyTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// 세션 키 설치. 같은 연결에서 재협상하면 덮어쓴다
    pub fn install(&self, conn: ConnectionId, key: SymmetricKey) {
        self.keys.insert(conn, key);
    }

    pub fn get(&self, conn: ConnectionId) -> Option<SymmetricKey> {
        self.keys.get(&conn).map(|entry| *entry.value())
    }

    pub fn remove(&self, conn: ConnectionId) -> Option<SymmetricKey> {
        self.keys.remove(&conn).map(|(_, key)| key)
    }

    pub fn contains(&self, conn: ConnectionId) -> bool {
        self.keys.contains_key(&conn)
    }

    pub fn len(&self) -> usize {
        self.keys.len()
    }

    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }
}
