//! 암호 프리미티브 - AES-128-CBC + MD5/SHA-1 + Ristretto255 그룹 연산
//!
//! 프로토콜 코드는 이 모듈을 순수 함수 모음으로만 사용한다.
//!
//! - 대칭 암호: AES-128-CBC, IV는 전부 0, 제로 패딩
//! - 다이제스트: MD5 (키 유도), SHA-1 (신원 인증자)
//! - 그룹: Ristretto255 위의 스칼라 곱, 해시로부터 점 생성

use aes::Aes128;
use cbc::cipher::{block_padding::ZeroPadding, BlockDecryptMut, BlockEncryptMut, KeyIvInit};
use curve25519_dalek::ristretto::{CompressedRistretto, RistrettoPoint};
use curve25519_dalek::scalar::Scalar;
use curve25519_dalek::traits::Identity;
use md5::Md5;
use rand_core::OsRng;
use sha1::{Digest, Sha1};
use sha2::Sha512;

/// AES 블록 크기 (16 bytes)
pub const BLOCK_SIZE: usize = 16;

/// 대칭 키 크기 (16 bytes, 16진수 문자 16개)
pub const KEY_SIZE: usize = 16;

/// 압축된 그룹 원소 크기 (32 bytes)
pub const ELEMENT_SIZE: usize = 32;

type Aes128CbcEnc = cbc::Encryptor<Aes128>;
type Aes128CbcDec = cbc::Decryptor<Aes128>;

/// 암호화 오류
#[derive(Debug, thiserror::Error)]
pub enum CryptoError {
    #[error("잘못된 16진수 문자열")]
    InvalidHex,
    #[error("잘못된 그룹 원소")]
    InvalidElement,
    #[error("잘못된 스칼라")]
    InvalidScalar,
    #[error("잘못된 키 크기")]
    InvalidKeySize,
    #[error("암호문 길이가 블록 크기의 배수가 아님: {0}")]
    InvalidCiphertextLength(usize),
    #[error("복호화 실패")]
    DecryptionFailed,
}

/// 16바이트 대칭 키 (전송 키 / 세션 키 공용)
///
/// 키 바이트는 MD5 다이제스트의 대문자 16진수 앞 16글자다.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct SymmetricKey([u8; KEY_SIZE]);

impl SymmetricKey {
    pub fn from_bytes(bytes: [u8; KEY_SIZE]) -> Self {
        Self(bytes)
    }

    /// 임의 재료에서 키 유도: first16(hex(MD5(material)))
    pub fn derive(material: &[u8]) -> Self {
        let digest = md5_hex(material);
        let mut key = [0u8; KEY_SIZE];
        key.copy_from_slice(&digest.as_bytes()[..KEY_SIZE]);
        Self(key)
    }

    pub fn as_bytes(&self) -> &[u8; KEY_SIZE] {
        &self.0
    }

    /// 로그 출력용 문자열 (키 자체가 ASCII 16진수)
    pub fn to_hex_str(&self) -> String {
        String::from_utf8_lossy(&self.0).into_owned()
    }

    /// AES-128-CBC 암호화 (IV 0, 제로 패딩)
    ///
    /// 평문이 0바이트로 끝나면 복호화 시 그 0들은 패딩과 구분되지 않는다.
    pub fn encrypt(&self, plaintext: &[u8]) -> Vec<u8> {
        let iv = [0u8; BLOCK_SIZE];
        Aes128CbcEnc::new(&self.0.into(), &iv.into()).encrypt_padded_vec_mut::<ZeroPadding>(plaintext)
    }

    /// AES-128-CBC 복호화, 뒤쪽 0 패딩 제거
    pub fn decrypt(&self, ciphertext: &[u8]) -> Result<Vec<u8>, CryptoError> {
        if ciphertext.len() % BLOCK_SIZE != 0 {
            return Err(CryptoError::InvalidCiphertextLength(ciphertext.len()));
        }
        let iv = [0u8; BLOCK_SIZE];
        Aes128CbcDec::new(&self.0.into(), &iv.into())
            .decrypt_padded_vec_mut::<ZeroPadding>(ciphertext)
            .map_err(|_| CryptoError::DecryptionFailed)
    }
}

impl std::fmt::Debug for SymmetricKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("SymmetricKey(..)")
    }
}

/// MD5 다이제스트 (대문자 16진수 32글자)
pub fn md5_hex(data: &[u8]) -> String {
    hex::encode_upper(Md5::digest(data))
}

/// SHA-1 다이제스트를 큰 정수로 보고 10진수 문자열로 변환
pub fn sha1_decimal(data: &[u8]) -> String {
    bytes_to_decimal(&Sha1::digest(data))
}

/// 빅엔디언 바이트열 -> 10진수 문자열
fn bytes_to_decimal(bytes: &[u8]) -> String {
    // 리틀엔디언 10진 자릿수
    let mut digits: Vec<u8> = vec![0];
    for &byte in bytes {
        let mut carry = byte as u32;
        for d in digits.iter_mut() {
            let v = (*d as u32) * 256 + carry;
            *d = (v % 10) as u8;
            carry = v / 10;
        }
        while carry > 0 {
            digits.push((carry % 10) as u8);
            carry /= 10;
        }
    }
    digits.iter().rev().map(|d| (b'0' + d) as char).collect()
}

/// 10진수 문자열 정규화 (앞쪽 0 제거). 숫자가 아니면 None
pub fn normalize_decimal(s: &str) -> Option<&str> {
    if s.is_empty() || !s.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    let trimmed = s.trim_start_matches('0');
    Some(if trimmed.is_empty() { "0" } else { trimmed })
}

/// 시드 문자열을 해시해서 고정 생성원 P 생성
pub fn generator_from_seed(seed: &[u8]) -> RistrettoPoint {
    RistrettoPoint::hash_from_bytes::<Sha512>(seed)
}

/// 무작위 스칼라
pub fn random_scalar() -> Scalar {
    Scalar::random(&mut OsRng)
}

/// 32바이트 16진수에서 스칼라 파싱 (mod l 축약)
pub fn scalar_from_hex(s: &str) -> Result<Scalar, CryptoError> {
    let bytes = hex::decode(s.trim()).map_err(|_| CryptoError::InvalidHex)?;
    let bytes: [u8; 32] = bytes.try_into().map_err(|_| CryptoError::InvalidScalar)?;
    let scalar = Scalar::from_bytes_mod_order(bytes);
    if scalar == Scalar::ZERO {
        return Err(CryptoError::InvalidScalar);
    }
    Ok(scalar)
}

/// 그룹 원소 직렬화 (압축 32바이트)
pub fn element_to_bytes(point: &RistrettoPoint) -> [u8; ELEMENT_SIZE] {
    point.compress().to_bytes()
}

/// 그룹 원소 텍스트 표현 (소문자 16진수)
pub fn element_to_string(point: &RistrettoPoint) -> String {
    hex::encode(element_to_bytes(point))
}

/// 그룹 원소 역직렬화. 항등원은 거부
pub fn element_from_bytes(bytes: &[u8]) -> Result<RistrettoPoint, CryptoError> {
    let compressed = CompressedRistretto::from_slice(bytes).map_err(|_| CryptoError::InvalidElement)?;
    let point = compressed.decompress().ok_or(CryptoError::InvalidElement)?;
    if point == RistrettoPoint::identity() {
        return Err(CryptoError::InvalidElement);
    }
    Ok(point)
}

/// 텍스트 표현에서 그룹 원소 파싱
pub fn element_from_str(s: &str) -> Result<RistrettoPoint, CryptoError> {
    element_from_bytes(&hex_decode(s)?)
}

/// 16진수 디코딩 (대소문자 무관)
pub fn hex_decode(s: &str) -> Result<Vec<u8>, CryptoError> {
    hex::decode(s).map_err(|_| CryptoError::InvalidHex)
}
