//! 신원 기반 키 협상
//!
//! 요청 페이로드: `HEX(Hi) 我 hex(Rc)`
//! - `Hi = AES(k2키, IDi 我 Ai 我 t1)`, `k2 = s·Rc`
//! - `Ai = SHA1(IDi ++ 마스터 비밀 문자열)` 을 10진수로 표현한 값
//!
//! 응답 평문: `IDi 我 Rs 我 Ji 我 t2 我`, 같은 전송 키로 암호화 후 16진수
//!
//! 세션 키: `first16(MD5(Ji ++ t1 ++ t2))`
//!
//! 상태: `AwaitRequest -> Authenticating -> DerivingSessionKey -> Complete | Rejected`.
//! 어느 단계에서 실패해도 곧바로 `Rejected`가 되고 세션 키는 만들어지지 않는다.

use std::fmt;
use std::time::Duration;

use chrono::{DateTime, Local, NaiveDateTime};
use curve25519_dalek::ristretto::RistrettoPoint;
use curve25519_dalek::scalar::Scalar;
use tracing::debug;

use crate::config::Config;
use crate::crypto::{self, SymmetricKey};
use crate::Result;

/// 키 협상 필드 구분자
pub const SEPARATOR: &str = "我";

/// t1/t2 형식
pub const TIMESTAMP_FORMAT: &str = "%Y%m%d%H%M%S";

/// 키 협상 거부 사유
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RejectReason {
    #[error("구분자 없음: {0}")]
    MissingSeparator(&'static str),

    #[error("16진수 디코딩 실패: {0}")]
    InvalidHex(&'static str),

    #[error("잘못된 클라이언트 그룹 원소")]
    InvalidElement,

    #[error("평문이 UTF-8이 아님")]
    InvalidUtf8,

    #[error("Hi 복호화 실패")]
    DecryptionFailed,

    #[error("등록되지 않은 사용자: {0}")]
    NotRegistered(String),

    #[error("잘못된 타임스탬프: {0}")]
    InvalidTimestamp(String),

    #[error("오래된 요청: {skew_secs}초 차이")]
    Stale { skew_secs: i64 },
}

/// 프로세스 전체에서 공유하는 마스터 키 재료 (시작 후 불변)
#[derive(Clone)]
pub struct MasterKeyMaterial {
    secret: Scalar,
    /// 인증자 계산에 쓰이는 비밀 문자열 (설정값 그대로)
    secret_literal: String,
    generator: RistrettoPoint,
    public_key: RistrettoPoint,
}

impl MasterKeyMaterial {
    /// 16진수 비밀과 생성원 시드로 생성
    pub fn from_hex(secret_hex: &str, generator_seed: &str) -> Result<Self> {
        let literal = secret_hex.trim();
        let secret = crypto::scalar_from_hex(literal)?;
        let generator = crypto::generator_from_seed(generator_seed.as_bytes());

        Ok(Self {
            secret,
            secret_literal: literal.to_string(),
            generator,
            public_key: secret * generator,
        })
    }

    pub fn from_config(config: &Config) -> Result<Self> {
        Self::from_hex(&config.master_secret, &config.generator_seed)
    }

    /// 새 마스터 비밀 생성
    pub fn generate(generator_seed: &str) -> Self {
        let secret = crypto::random_scalar();
        let generator = crypto::generator_from_seed(generator_seed.as_bytes());

        Self {
            secret,
            secret_literal: hex::encode(secret.to_bytes()),
            generator,
            public_key: secret * generator,
        }
    }

    /// 고정 생성원 P
    pub fn generator(&self) -> &RistrettoPoint {
        &self.generator
    }

    /// 공개 키 Ppub = s·P
    pub fn public_key(&self) -> &RistrettoPoint {
        &self.public_key
    }

    /// 설정 파일에 기록할 비밀 문자열
    pub fn secret_hex(&self) -> &str {
        &self.secret_literal
    }

    /// 사용자 등록 시 발급하는 인증자 Ai (10진수 문자열)
    pub fn authenticator_for(&self, identity: &str) -> String {
        let mut material = Vec::with_capacity(identity.len() + self.secret_literal.len());
        material.extend_from_slice(identity.as_bytes());
        material.extend_from_slice(self.secret_literal.as_bytes());
        crypto::sha1_decimal(&material)
    }

    /// 인증자 검사 (앞쪽 0은 무시)
    pub fn verify_authenticator(&self, identity: &str, ai: &str) -> bool {
        let expected = self.authenticator_for(identity);
        match (crypto::normalize_decimal(ai), crypto::normalize_decimal(&expected)) {
            (Some(got), Some(want)) => got == want,
            _ => false,
        }
    }

    /// 전송 키: k2 = s·Rc
    fn transport_key(&self, rc: &RistrettoPoint) -> SymmetricKey {
        transport_key(&(self.secret * rc))
    }
}

impl fmt::Debug for MasterKeyMaterial {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MasterKeyMaterial")
            .field("public_key", &crypto::element_to_string(&self.public_key))
            .finish_non_exhaustive()
    }
}

/// 공유 원소 k2에서 전송 키 유도
pub fn transport_key(k2: &RistrettoPoint) -> SymmetricKey {
    SymmetricKey::derive(crypto::element_to_string(k2).as_bytes())
}

/// 세션 키 유도: first16(MD5(Ji ++ t1 ++ t2))
pub fn derive_session_key(ji: &str, t1: &str, t2: &str) -> SymmetricKey {
    let mut material = String::with_capacity(ji.len() + t1.len() + t2.len());
    material.push_str(ji);
    material.push_str(t1);
    material.push_str(t2);
    SymmetricKey::derive(material.as_bytes())
}

pub fn format_timestamp(t: &DateTime<Local>) -> String {
    t.format(TIMESTAMP_FORMAT).to_string()
}

pub fn parse_timestamp(s: &str) -> Option<DateTime<Local>> {
    NaiveDateTime::parse_from_str(s, TIMESTAMP_FORMAT)
        .ok()?
        .and_local_timezone(Local)
        .earliest()
}

/// 교환 상태
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExchangeState {
    AwaitRequest,
    Authenticating,
    DerivingSessionKey,
    Complete,
    Rejected,
}

/// 성공한 교환 결과
#[derive(Debug, Clone)]
pub struct Agreement {
    /// 인증된 사용자 신원
    pub identity: String,
    /// KeyAgreement 응답 페이로드 (16진수)
    pub reply: Vec<u8>,
    /// 이 연결의 세션 키
    pub session_key: SymmetricKey,
}

/// 복호화된 Hi의 필드
struct Credentials<'a> {
    identity: &'a str,
    authenticator: &'a str,
    t1: &'a str,
}

/// 교환 한 번 (요청 수신부터 세션 키 유도까지)
///
/// 교환이 끝나면 세션 키 외에는 아무 상태도 남기지 않는다.
#[derive(Debug)]
pub struct Exchange {
    state: ExchangeState,
}

impl Exchange {
    pub fn new() -> Self {
        Self {
            state: ExchangeState::AwaitRequest,
        }
    }

    pub fn state(&self) -> ExchangeState {
        self.state
    }

    fn transition(&mut self, next: ExchangeState) {
        debug!("Key agreement: {:?} -> {:?}", self.state, next);
        self.state = next;
    }

    /// 요청 처리. 실패 시 상태는 `Rejected`
    pub fn run(
        &mut self,
        agreement: &KeyAgreement,
        payload: &[u8],
        now: DateTime<Local>,
    ) -> std::result::Result<Agreement, RejectReason> {
        match self.run_steps(agreement, payload, now) {
            Ok(result) => {
                self.transition(ExchangeState::Complete);
                Ok(result)
            }
            Err(reason) => {
                self.transition(ExchangeState::Rejected);
                Err(reason)
            }
        }
    }

    fn run_steps(
        &mut self,
        agreement: &KeyAgreement,
        payload: &[u8],
        now: DateTime<Local>,
    ) -> std::result::Result<Agreement, RejectReason> {
        let master = &agreement.master;

        // 1. Hi, Rc 분리 및 디코딩
        let text = std::str::from_utf8(payload).map_err(|_| RejectReason::InvalidUtf8)?;
        let (hi_hex, rc_hex) = text
            .split_once(SEPARATOR)
            .ok_or(RejectReason::MissingSeparator("request"))?;
        let hi = crypto::hex_decode(hi_hex.trim()).map_err(|_| RejectReason::InvalidHex("Hi"))?;
        let rc_bytes =
            crypto::hex_decode(rc_hex.trim()).map_err(|_| RejectReason::InvalidHex("Rc"))?;
        let rc = crypto::element_from_bytes(&rc_bytes).map_err(|_| RejectReason::InvalidElement)?;

        self.transition(ExchangeState::Authenticating);

        // 2. 전송 키로 Hi 복호화
        let key = master.transport_key(&rc);
        let plaintext = key.decrypt(&hi).map_err(|_| RejectReason::DecryptionFailed)?;
        let plaintext = String::from_utf8(plaintext).map_err(|_| RejectReason::InvalidUtf8)?;
        let credentials = split_credentials(&plaintext)?;

        // 3. 신원 인증
        if !master.verify_authenticator(credentials.identity, credentials.authenticator) {
            return Err(RejectReason::NotRegistered(credentials.identity.to_string()));
        }

        // 4. 신선도
        let t1 = parse_timestamp(credentials.t1)
            .ok_or_else(|| RejectReason::InvalidTimestamp(credentials.t1.to_string()))?;
        let skew_secs = now.signed_duration_since(t1).num_seconds();
        debug!("t1 skew: {}s (identity={})", skew_secs, credentials.identity);
        if let Some(max) = agreement.max_clock_skew {
            if skew_secs.unsigned_abs() > max.as_secs() {
                return Err(RejectReason::Stale { skew_secs });
            }
        }

        self.transition(ExchangeState::DerivingSessionKey);

        // 5. rs, Rs = rs·P, Ji = rs·Rc
        let rs = crypto::random_scalar();
        let big_rs = crypto::element_to_string(&(rs * master.generator()));
        let ji = crypto::element_to_string(&(rs * rc));
        let t2 = format_timestamp(&now);

        // 6. 응답: IDi 我 Rs 我 Ji 我 t2 我
        let mut reply_plain = String::new();
        for field in [credentials.identity, big_rs.as_str(), ji.as_str(), t2.as_str()] {
            reply_plain.push_str(field);
            reply_plain.push_str(SEPARATOR);
        }
        let reply = hex::encode_upper(key.encrypt(reply_plain.as_bytes())).into_bytes();

        // 7. 세션 키
        let session_key = derive_session_key(&ji, credentials.t1, &t2);

        Ok(Agreement {
            identity: credentials.identity.to_string(),
            reply,
            session_key,
        })
    }
}

impl Default for Exchange {
    fn default() -> Self {
        Self::new()
    }
}

/// `IDi 我 Ai 我 t1` 분리. 빈 필드는 허용하지 않는다
fn split_credentials(plaintext: &str) -> std::result::Result<Credentials<'_>, RejectReason> {
    let mut fields = plaintext.split(SEPARATOR).filter(|f| !f.is_empty());
    let identity = fields.next().ok_or(RejectReason::MissingSeparator("IDi"))?;
    let authenticator = fields.next().ok_or(RejectReason::MissingSeparator("Ai"))?;
    let t1 = fields.next().ok_or(RejectReason::MissingSeparator("t1"))?;

    Ok(Credentials {
        identity,
        authenticator,
        t1,
    })
}

/// 서버 측 키 협상 컴포넌트
#[derive(Debug, Clone)]
pub struct KeyAgreement {
    master: MasterKeyMaterial,
    /// None이면 t1 차이를 로그로만 남긴다
    max_clock_skew: Option<Duration>,
}

impl KeyAgreement {
    pub fn new(master: MasterKeyMaterial, max_clock_skew: Option<Duration>) -> Self {
        Self {
            master,
            max_clock_skew,
        }
    }

    pub fn from_config(config: &Config) -> Result<Self> {
        Ok(Self::new(
            MasterKeyMaterial::from_config(config)?,
            config.max_clock_skew(),
        ))
    }

    pub fn master(&self) -> &MasterKeyMaterial {
        &self.master
    }

    /// KeyAgreement 요청 처리 (현재 시각 기준)
    pub fn respond(&self, payload: &[u8]) -> std::result::Result<Agreement, RejectReason> {
        self.respond_at(payload, Local::now())
    }

    pub fn respond_at(
        &self,
        payload: &[u8],
        now: DateTime<Local>,
    ) -> std::result::Result<Agreement, RejectReason> {
        Exchange::new().run(self, payload, now)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SECRET: &str = "0101010101010101010101010101010101010101010101010101010101010101";
    const SEED: &str = "test-seed";

    fn master() -> MasterKeyMaterial {
        MasterKeyMaterial::from_hex(SECRET, SEED).unwrap()
    }

    /// 클라이언트 측 요청 생성 (rc 반환)
    fn build_request(
        master: &MasterKeyMaterial,
        identity: &str,
        ai: &str,
        t1: &str,
    ) -> (Vec<u8>, Scalar) {
        let rc = crypto::random_scalar();
        let big_rc = rc * master.generator();
        let key = transport_key(&(rc * master.public_key()));

        let hi_plain = format!("{identity}{SEPARATOR}{ai}{SEPARATOR}{t1}");
        let hi = hex::encode_upper(key.encrypt(hi_plain.as_bytes()));
        let payload = format!("{hi}{SEPARATOR}{}", hex::encode(crypto::element_to_bytes(&big_rc)));
        (payload.into_bytes(), rc)
    }

    fn now_str() -> String {
        format_timestamp(&Local::now())
    }

    #[test]
    fn test_valid_exchange_completes() {
        let master = master();
        let agreement = KeyAgreement::new(master.clone(), None);
        let ai = master.authenticator_for("alice");
        let t1 = now_str();
        let (payload, rc) = build_request(&master, "alice", &ai, &t1);

        let mut exchange = Exchange::new();
        assert_eq!(exchange.state(), ExchangeState::AwaitRequest);
        let result = exchange.run(&agreement, &payload, Local::now()).unwrap();
        assert_eq!(exchange.state(), ExchangeState::Complete);
        assert_eq!(result.identity, "alice");

        // 클라이언트 측에서 응답 복호화 및 세션 키 재계산
        let key = transport_key(&(rc * master.public_key()));
        let reply = key
            .decrypt(&hex::decode(&result.reply).unwrap())
            .unwrap();
        let reply = String::from_utf8(reply).unwrap();
        let fields: Vec<&str> = reply.split(SEPARATOR).collect();
        assert_eq!(fields.len(), 5);
        assert_eq!(fields[0], "alice");
        assert!(fields[4].is_empty());

        let rs = crypto::element_from_str(fields[1]).unwrap();
        let ji = crypto::element_to_string(&(rc * rs));
        assert_eq!(ji, fields[2]);
        assert_eq!(derive_session_key(&ji, &t1, fields[3]), result.session_key);
    }

    #[test]
    fn test_forged_authenticator_rejected() {
        let master = master();
        let agreement = KeyAgreement::new(master.clone(), None);
        let real = master.authenticator_for("alice");

        for forged in ["12345", "0", real.as_str()] {
            // 다른 신원의 진짜 Ai도 위조로 취급
            let (payload, _) = build_request(&master, "mallory", forged, &now_str());
            let mut exchange = Exchange::new();
            let err = exchange.run(&agreement, &payload, Local::now()).unwrap_err();
            assert_eq!(err, RejectReason::NotRegistered("mallory".into()));
            assert_eq!(exchange.state(), ExchangeState::Rejected);
        }
    }

    #[test]
    fn test_authenticator_leading_zeros() {
        let master = master();
        let ai = master.authenticator_for("bob");
        assert!(master.verify_authenticator("bob", &format!("000{ai}")));
        assert!(!master.verify_authenticator("bob", "not a number"));
    }

    #[test]
    fn test_other_secret_is_rejected() {
        let master = master();
        let other = MasterKeyMaterial::generate(SEED);
        let agreement = KeyAgreement::new(master, None);

        // 다른 마스터 비밀 기준으로 만든 요청은 복호화/인증 단계에서 거부
        let ai = other.authenticator_for("alice");
        let (payload, _) = build_request(&other, "alice", &ai, &now_str());
        assert!(agreement.respond(&payload).is_err());
    }

    #[test]
    fn test_malformed_requests() {
        let agreement = KeyAgreement::new(master(), None);

        assert_eq!(
            agreement.respond(b"ABCDEF").unwrap_err(),
            RejectReason::MissingSeparator("request")
        );
        assert_eq!(
            agreement.respond("zz我00".as_bytes()).unwrap_err(),
            RejectReason::InvalidHex("Hi")
        );
        assert_eq!(
            agreement.respond("00我qq".as_bytes()).unwrap_err(),
            RejectReason::InvalidHex("Rc")
        );

        // 항등원 Rc
        let identity = hex::encode([0u8; 32]);
        assert_eq!(
            agreement
                .respond(format!("00{SEPARATOR}{identity}").as_bytes())
                .unwrap_err(),
            RejectReason::InvalidElement
        );
    }

    #[test]
    fn test_missing_credential_field() {
        let master = master();
        let agreement = KeyAgreement::new(master.clone(), None);

        let rc = crypto::random_scalar();
        let key = transport_key(&(rc * master.public_key()));
        let hi = hex::encode(key.encrypt(format!("alice{SEPARATOR}123").as_bytes()));
        let payload = format!(
            "{hi}{SEPARATOR}{}",
            crypto::element_to_string(&(rc * master.generator()))
        );

        assert_eq!(
            agreement.respond(payload.as_bytes()).unwrap_err(),
            RejectReason::MissingSeparator("t1")
        );
    }

    #[test]
    fn test_freshness_policy() {
        let master = master();
        let ai = master.authenticator_for("alice");
        let old = Local::now() - chrono::Duration::seconds(600);
        let (payload, _) = build_request(&master, "alice", &ai, &format_timestamp(&old));

        // 정책 없음: 차이만 기록하고 통과
        let lenient = KeyAgreement::new(master.clone(), None);
        assert!(lenient.respond(&payload).is_ok());

        let strict = KeyAgreement::new(master.clone(), Some(Duration::from_secs(120)));
        assert!(matches!(
            strict.respond(&payload),
            Err(RejectReason::Stale { skew_secs }) if skew_secs >= 600
        ));

        let (fresh, _) = build_request(&master, "alice", &ai, &now_str());
        assert!(strict.respond(&fresh).is_ok());

        let (garbage, _) = build_request(&master, "alice", &ai, "yesterday");
        assert_eq!(
            lenient.respond(&garbage).unwrap_err(),
            RejectReason::InvalidTimestamp("yesterday".into())
        );
    }

    #[test]
    fn test_session_key_determinism() {
        let a = derive_session_key("ji-value", "20240101120000", "20240101120001");
        let b = derive_session_key("ji-value", "20240101120000", "20240101120001");
        let c = derive_session_key("ji-other", "20240101120000", "20240101120001");
        assert_eq!(a, b);
        assert_ne!(a, c);
    }

    #[test]
    fn test_timestamp_format() {
        let t = parse_timestamp("20240305091502").unwrap();
        assert_eq!(format_timestamp(&t), "20240305091502");
        assert!(parse_timestamp("2024-03-05").is_none());
    }

    #[test]
    fn test_debug_hides_secret() {
        let text = format!("{:?}", master());
        assert!(!text.contains(SECRET));
    }
}
