//! 클라이언트 측 프로토콜
//!
//! 등록 시 받은 인증자 Ai와 서버 공개 파라미터(P, Ppub)로 키 협상을 하고,
//! 얻은 세션 키로 진료 기록을 조회한다.

use std::io::{Read, Write};

use chrono::{DateTime, Local};
use curve25519_dalek::ristretto::RistrettoPoint;
use curve25519_dalek::scalar::Scalar;
use tracing::debug;

use crate::crypto::{self, SymmetricKey};
use crate::key_agreement::{self, MasterKeyMaterial, SEPARATOR};
use crate::packet::{self, PacketType};
use crate::record::{self, MedicalRecord};
use crate::{Error, Result};

/// 등록된 사용자 한 명의 클라이언트
#[derive(Debug, Clone)]
pub struct ClientSession {
    identity: String,
    authenticator: String,
    generator: RistrettoPoint,
    server_public: RistrettoPoint,
}

/// 응답을 기다리는 교환 (클라이언트 임시 비밀 보관)
pub struct PendingExchange {
    identity: String,
    rc: Scalar,
    transport: SymmetricKey,
    t1: String,
}

impl ClientSession {
    pub fn new(
        identity: impl Into<String>,
        authenticator: impl Into<String>,
        generator: RistrettoPoint,
        server_public: RistrettoPoint,
    ) -> Self {
        Self {
            identity: identity.into(),
            authenticator: authenticator.into(),
            generator,
            server_public,
        }
    }

    /// 서버 측 마스터 재료로 사용자 등록 (Ai 발급)
    pub fn register(master: &MasterKeyMaterial, identity: &str) -> Self {
        Self::new(
            identity,
            master.authenticator_for(identity),
            *master.generator(),
            *master.public_key(),
        )
    }

    /// 공개 파라미터 텍스트로 생성
    pub fn from_public_params(
        identity: &str,
        authenticator: &str,
        generator_seed: &str,
        server_public_hex: &str,
    ) -> Result<Self> {
        Ok(Self::new(
            identity,
            authenticator,
            crypto::generator_from_seed(generator_seed.as_bytes()),
            crypto::element_from_str(server_public_hex)?,
        ))
    }

    pub fn identity(&self) -> &str {
        &self.identity
    }

    /// KeyAgreement 요청 페이로드 생성
    pub fn begin(&self) -> (Vec<u8>, PendingExchange) {
        self.begin_at(Local::now())
    }

    pub fn begin_at(&self, now: DateTime<Local>) -> (Vec<u8>, PendingExchange) {
        let rc = crypto::random_scalar();
        let big_rc = rc * self.generator;
        let transport = key_agreement::transport_key(&(rc * self.server_public));
        let t1 = key_agreement::format_timestamp(&now);

        let hi_plain = [self.identity.as_str(), self.authenticator.as_str(), t1.as_str()].join(SEPARATOR);
        let hi = hex::encode_upper(transport.encrypt(hi_plain.as_bytes()));
        let payload = format!("{}{}{}", hi, SEPARATOR, crypto::element_to_string(&big_rc));

        let pending = PendingExchange {
            identity: self.identity.clone(),
            rc,
            transport,
            t1,
        };
        (payload.into_bytes(), pending)
    }

    /// 스트림 위에서 키 협상 수행
    pub fn key_agreement<S: Read + Write>(&self, stream: &mut S, max_payload: usize) -> Result<SymmetricKey> {
        let (request, pending) = self.begin();
        packet::write_packet(stream, PacketType::KeyAgreement, &request, max_payload)?;

        let reply = packet::read_packet(stream, max_payload)?;
        if reply.packet_type != PacketType::KeyAgreement {
            return Err(Error::MalformedReply(format!(
                "키 협상 응답 대신 {:?}",
                reply.packet_type
            )));
        }
        pending.finish(&reply.payload)
    }

    /// 진료 기록 조회
    pub fn fetch_records<S: Read + Write>(
        &self,
        stream: &mut S,
        session_key: &SymmetricKey,
        max_payload: usize,
    ) -> Result<Vec<MedicalRecord>> {
        packet::write_packet(stream, PacketType::Record, self.identity.as_bytes(), max_payload)?;

        let reply = packet::read_packet(stream, max_payload)?;
        if reply.packet_type != PacketType::Record {
            return Err(Error::MalformedReply(format!(
                "레코드 응답 대신 {:?}",
                reply.packet_type
            )));
        }
        record::decrypt_records(session_key, &reply.payload)
    }
}

impl PendingExchange {
    /// 서버 응답 검증 후 세션 키 유도
    ///
    /// 신원 에코와 `Ji == rc·Rs` 를 확인한다.
    pub fn finish(self, reply: &[u8]) -> Result<SymmetricKey> {
        let text = std::str::from_utf8(reply)
            .map_err(|_| Error::MalformedReply("16진수 아님".into()))?;
        let plaintext = self.transport.decrypt(&crypto::hex_decode(text)?)?;
        let plaintext = String::from_utf8(plaintext)
            .map_err(|_| Error::MalformedReply("평문이 UTF-8이 아님".into()))?;

        let fields: Vec<&str> = plaintext.split(SEPARATOR).filter(|f| !f.is_empty()).collect();
        let [identity, rs, ji, t2] = fields[..] else {
            return Err(Error::MalformedReply(format!("응답 필드 수 {}", fields.len())));
        };

        if identity != self.identity {
            return Err(Error::MalformedReply(format!("신원 불일치: {}", identity)));
        }

        let rs = crypto::element_from_str(rs)?;
        let expected = crypto::element_to_string(&(self.rc * rs));
        if expected != ji.to_ascii_lowercase() {
            return Err(Error::MalformedReply("Ji 불일치".into()));
        }

        debug!("Key agreement finished for {} (t2={})", identity, t2);
        Ok(key_agreement::derive_session_key(ji, &self.t1, t2))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::key_agreement::KeyAgreement;

    const SECRET: &str = "0303030303030303030303030303030303030303030303030303030303030303";

    #[test]
    fn test_client_and_server_agree() {
        let master = MasterKeyMaterial::from_hex(SECRET, "seed").unwrap();
        let server = KeyAgreement::new(master.clone(), None);
        let client = ClientSession::register(&master, "carol");

        let (request, pending) = client.begin();
        let agreement = server.respond(&request).unwrap();
        let key = pending.finish(&agreement.reply).unwrap();

        assert_eq!(key, agreement.session_key);
    }

    #[test]
    fn test_public_params_client() {
        let master = MasterKeyMaterial::from_hex(SECRET, "seed").unwrap();
        let server = KeyAgreement::new(master.clone(), None);
        let client = ClientSession::from_public_params(
            "dave",
            &master.authenticator_for("dave"),
            "seed",
            &crypto::element_to_string(master.public_key()),
        )
        .unwrap();

        let (request, pending) = client.begin();
        let agreement = server.respond(&request).unwrap();
        assert_eq!(pending.finish(&agreement.reply).unwrap(), agreement.session_key);
    }

    #[test]
    fn test_reply_for_other_exchange_is_rejected() {
        let master = MasterKeyMaterial::from_hex(SECRET, "seed").unwrap();
        let server = KeyAgreement::new(master.clone(), None);
        let client = ClientSession::register(&master, "carol");

        let (request, _first) = client.begin();
        let (_, second) = client.begin();
        let agreement = server.respond(&request).unwrap();

        // 다른 교환의 임시 비밀로는 응답을 받아들이지 않음
        assert!(second.finish(&agreement.reply).is_err());
    }

    #[test]
    fn test_garbage_reply() {
        let master = MasterKeyMaterial::from_hex(SECRET, "seed").unwrap();
        let client = ClientSession::register(&master, "carol");
        let (_, pending) = client.begin();
        assert!(pending.finish(b"not hex").is_err());
    }
}
