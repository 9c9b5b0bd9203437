//! 진료 기록 조회 (레코드 프로토콜)
//!
//! 요청 페이로드는 평문 사용자 신원이다. 응답은 직렬화된 기록을 세션 키로
//! 암호화한 뒤 16진수로 보낸다.
//!
//! 직렬화: `time AA doctor AA symptom AA feedback AAAA` 를 기록 수만큼 반복

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::crypto::SymmetricKey;
use crate::session::{ConnectionId, SessionKeyTable};
use crate::{Error, Result};

/// 기록 구분자
pub const RECORD_SEPARATOR: &str = "AAAA";

/// 필드 구분자
pub const FIELD_SEPARATOR: &str = "AA";

/// 진료 기록 한 건
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MedicalRecord {
    pub time: String,
    pub doctor: String,
    pub symptom: String,
    pub feedback: String,
}

impl MedicalRecord {
    pub fn new(
        time: impl Into<String>,
        doctor: impl Into<String>,
        symptom: impl Into<String>,
        feedback: impl Into<String>,
    ) -> Self {
        Self {
            time: time.into(),
            doctor: doctor.into(),
            symptom: symptom.into(),
            feedback: feedback.into(),
        }
    }

    fn fields(&self) -> [(&'static str, &str); 4] {
        [
            ("time", &self.time),
            ("doctor", &self.doctor),
            ("symptom", &self.symptom),
            ("feedback", &self.feedback),
        ]
    }
}

/// 저장소 에러 (프로토콜상 의미 없음)
#[derive(Debug, Clone, thiserror::Error)]
#[error("{0}")]
pub struct DataStoreError(pub String);

impl From<DataStoreError> for Error {
    fn from(e: DataStoreError) -> Self {
        Error::DataStore(e.0)
    }
}

/// 읽기 전용 기록 저장소
pub trait DataStore: Send + Sync {
    fn fetch_records(&self, identity: &str) -> std::result::Result<Vec<MedicalRecord>, DataStoreError>;
}

/// 메모리 저장소 (JSON 파일에서 적재 가능)
///
/// JSON 형식: `{ "신원": [ { "time": .., "doctor": .., "symptom": .., "feedback": .. } ] }`
#[derive(Debug, Default)]
pub struct InMemoryDataStore {
    records: RwLock<HashMap<String, Vec<MedicalRecord>>>,
}

impl InMemoryDataStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_json_str(s: &str) -> Result<Self> {
        let records: HashMap<String, Vec<MedicalRecord>> = serde_json::from_str(s)?;
        Ok(Self {
            records: RwLock::new(records),
        })
    }

    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| Error::DataStore(format!("{}: {}", path.display(), e)))?;
        Self::from_json_str(&content)
    }

    /// 기록 추가
    pub fn insert(&self, identity: impl Into<String>, record: MedicalRecord) {
        self.records
            .write()
            .entry(identity.into())
            .or_default()
            .push(record);
    }

    /// 등록된 사용자 수
    pub fn identities(&self) -> usize {
        self.records.read().len()
    }
}

impl DataStore for InMemoryDataStore {
    fn fetch_records(&self, identity: &str) -> std::result::Result<Vec<MedicalRecord>, DataStoreError> {
        Ok(self
            .records
            .read()
            .get(identity)
            .cloned()
            .unwrap_or_default())
    }
}

/// 구분자와 겹칠 수 있는 필드인지
///
/// 왼쪽부터 분리하므로 `AA`를 포함하거나 `A`로 끝나는 값은 경계가 모호해진다.
fn is_reserved(value: &str) -> bool {
    value.contains(FIELD_SEPARATOR) || value.ends_with('A')
}

/// 기록 직렬화
pub fn serialize_records(records: &[MedicalRecord]) -> Result<String> {
    let mut out = String::new();
    for record in records {
        for (i, (name, value)) in record.fields().into_iter().enumerate() {
            if is_reserved(value) {
                return Err(Error::ReservedMarker { field: name });
            }
            if i > 0 {
                out.push_str(FIELD_SEPARATOR);
            }
            out.push_str(value);
        }
        out.push_str(RECORD_SEPARATOR);
    }
    Ok(out)
}

/// 직렬화된 기록 파싱
pub fn parse_records(s: &str) -> Result<Vec<MedicalRecord>> {
    let mut records = Vec::new();

    for chunk in s.split(RECORD_SEPARATOR).filter(|c| !c.is_empty()) {
        let fields: Vec<&str> = chunk.split(FIELD_SEPARATOR).collect();
        let [time, doctor, symptom, feedback] = fields[..] else {
            return Err(Error::MalformedReply(format!(
                "기록 필드 수 {} (4 필요)",
                fields.len()
            )));
        };
        records.push(MedicalRecord::new(time, doctor, symptom, feedback));
    }

    Ok(records)
}

/// 레코드 프로토콜 처리기
#[derive(Clone)]
pub struct RecordService {
    store: Arc<dyn DataStore>,
}

impl RecordService {
    pub fn new(store: Arc<dyn DataStore>) -> Self {
        Self { store }
    }

    /// RecordRequest 처리, RecordReply 페이로드 반환
    ///
    /// 세션 키가 없으면 저장소를 건드리지 않고 `NoSession`.
    /// 기록이 없으면 빈 페이로드.
    pub fn respond(
        &self,
        sessions: &SessionKeyTable,
        conn: ConnectionId,
        payload: &[u8],
    ) -> Result<Vec<u8>> {
        let key = sessions.get(conn).ok_or(Error::NoSession)?;

        let identity = std::str::from_utf8(payload)
            .map_err(|_| Error::DataStore("신원이 UTF-8이 아님".into()))?
            .trim_end_matches('\0');

        let records = self.store.fetch_records(identity)?;
        debug!("{}: {} records for {}", conn, records.len(), identity);

        encrypt_records(&key, &records)
    }
}

/// 기록 직렬화 후 세션 키로 암호화, 16진수 페이로드
pub fn encrypt_records(key: &SymmetricKey, records: &[MedicalRecord]) -> Result<Vec<u8>> {
    let serialized = serialize_records(records)?;
    if serialized.is_empty() {
        return Ok(Vec::new());
    }
    Ok(hex::encode_upper(key.encrypt(serialized.as_bytes())).into_bytes())
}

/// RecordReply 페이로드 복호화 후 파싱
pub fn decrypt_records(key: &SymmetricKey, payload: &[u8]) -> Result<Vec<MedicalRecord>> {
    if payload.is_empty() {
        return Ok(Vec::new());
    }
    let text = std::str::from_utf8(payload)
        .map_err(|_| Error::MalformedReply("16진수 아님".into()))?;
    let ciphertext = crate::crypto::hex_decode(text)?;
    let plaintext = key.decrypt(&ciphertext)?;
    let plaintext = String::from_utf8(plaintext)
        .map_err(|_| Error::MalformedReply("평문이 UTF-8이 아님".into()))?;
    parse_records(&plaintext)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn sample() -> Vec<MedicalRecord> {
        vec![
            MedicalRecord::new("2024-03-01 09:00", "Dr. Kim", "fever", "rest and fluids"),
            MedicalRecord::new("2024-03-08 10:30", "Dr. Lee", "cough", "follow-up in a week"),
        ]
    }

    struct CountingStore {
        calls: AtomicUsize,
    }

    impl DataStore for CountingStore {
        fn fetch_records(&self, _identity: &str) -> std::result::Result<Vec<MedicalRecord>, DataStoreError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(sample())
        }
    }

    struct FailingStore;

    impl DataStore for FailingStore {
        fn fetch_records(&self, _identity: &str) -> std::result::Result<Vec<MedicalRecord>, DataStoreError> {
            Err(DataStoreError("connection refused".into()))
        }
    }

    #[test]
    fn test_serialize_layout() {
        let s = serialize_records(&sample()[..1]).unwrap();
        assert_eq!(s, "2024-03-01 09:00AADr. KimAAfeverAArest and fluidsAAAA");
        assert_eq!(parse_records(&s).unwrap(), sample()[..1].to_vec());
    }

    #[test]
    fn test_parse_multiple() {
        let s = serialize_records(&sample()).unwrap();
        assert_eq!(parse_records(&s).unwrap(), sample());
        assert!(parse_records("").unwrap().is_empty());
        assert!(matches!(parse_records("aAAbAAAA"), Err(Error::MalformedReply(_))));
    }

    #[test]
    fn test_reserved_marker_rejected() {
        let bad = MedicalRecord::new("t", "Dr. AA", "s", "f");
        assert!(matches!(
            serialize_records(&[bad]),
            Err(Error::ReservedMarker { field: "doctor" })
        ));

        let trailing = MedicalRecord::new("t", "d", "s", "grade A");
        assert!(matches!(
            serialize_records(&[trailing]),
            Err(Error::ReservedMarker { field: "feedback" })
        ));

        // 'A'로 시작하는 값은 문제없음
        let leading = MedicalRecord::new("t", "Dr. Ahn", "Asthma", "f");
        let s = serialize_records(&[leading.clone()]).unwrap();
        assert_eq!(parse_records(&s).unwrap(), vec![leading]);
    }

    #[test]
    fn test_respond_without_session_skips_store() {
        let store = Arc::new(CountingStore {
            calls: AtomicUsize::new(0),
        });
        let service = RecordService::new(store.clone());
        let sessions = SessionKeyTable::new();

        assert!(matches!(
            service.respond(&sessions, ConnectionId(1), b"alice"),
            Err(Error::NoSession)
        ));
        assert_eq!(store.calls.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_respond_encrypts_with_session_key() {
        let store = Arc::new(CountingStore {
            calls: AtomicUsize::new(0),
        });
        let service = RecordService::new(store.clone());
        let sessions = SessionKeyTable::new();
        let key = SymmetricKey::derive(b"session");
        sessions.install(ConnectionId(2), key);

        let reply = service.respond(&sessions, ConnectionId(2), b"alice").unwrap();
        assert!(!reply.is_empty());
        assert_eq!(store.calls.load(Ordering::SeqCst), 1);
        assert_eq!(decrypt_records(&key, &reply).unwrap(), sample());

        // 다른 키로는 복원되지 않음
        let other = SymmetricKey::derive(b"other");
        assert_ne!(decrypt_records(&other, &reply).ok(), Some(sample()));
    }

    #[test]
    fn test_store_failure_surfaces() {
        let service = RecordService::new(Arc::new(FailingStore));
        let sessions = SessionKeyTable::new();
        sessions.install(ConnectionId(3), SymmetricKey::derive(b"k"));

        assert!(matches!(
            service.respond(&sessions, ConnectionId(3), b"alice"),
            Err(Error::DataStore(_))
        ));
    }

    #[test]
    fn test_unknown_identity_gives_empty_reply() {
        let service = RecordService::new(Arc::new(InMemoryDataStore::new()));
        let sessions = SessionKeyTable::new();
        sessions.install(ConnectionId(4), SymmetricKey::derive(b"k"));

        let reply = service.respond(&sessions, ConnectionId(4), b"nobody").unwrap();
        assert!(reply.is_empty());
    }

    #[test]
    fn test_load_json_store() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            r#"{{"alice": [{{"time": "t1", "doctor": "d1", "symptom": "s1", "feedback": "f1"}}]}}"#
        )
        .unwrap();

        let store = InMemoryDataStore::load(file.path()).unwrap();
        assert_eq!(store.identities(), 1);
        assert_eq!(
            store.fetch_records("alice").unwrap(),
            vec![MedicalRecord::new("t1", "d1", "s1", "f1")]
        );
        assert!(store.fetch_records("bob").unwrap().is_empty());

        store.insert("bob", MedicalRecord::new("t2", "d2", "s2", "f2"));
        assert_eq!(store.fetch_records("bob").unwrap().len(), 1);

        assert!(matches!(
            InMemoryDataStore::from_json_str("[1, 2"),
            Err(Error::DataStore(_))
        ));
    }
}
