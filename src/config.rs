//! 서버 설정

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;

use crate::{Error, Result, DEFAULT_MAX_PAYLOAD_SIZE, DEFAULT_PORT};

/// 스레드 풀 설정
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PoolConfig {
    /// 최소 워커 수 (생성 직후 살아있는 워커 수)
    pub min_workers: usize,

    /// 최대 워커 수
    pub max_workers: usize,

    /// 작업 큐 용량
    pub queue_capacity: usize,

    /// 매니저 샘플링 주기 (밀리초)
    pub manager_interval_ms: u64,

    /// 한 번에 추가/퇴역시키는 워커 수
    pub worker_step: usize,

    /// 확장 기준 바쁜 워커 비율 (%), 이 값을 넘으면 확장
    pub scale_up_busy_percent: usize,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            min_workers: 10,
            max_workers: 100,
            queue_capacity: 100,
            manager_interval_ms: 10_000, // 10초
            worker_step: 10,
            scale_up_busy_percent: 80,
        }
    }
}

impl PoolConfig {
    pub fn new(min_workers: usize, max_workers: usize, queue_capacity: usize) -> Self {
        Self {
            min_workers,
            max_workers,
            queue_capacity,
            ..Self::default()
        }
    }

    /// 매니저 샘플링 주기
    pub fn manager_interval(&self) -> Duration {
        Duration::from_millis(self.manager_interval_ms)
    }

    /// min ≤ max, max > 0, capacity > 0
    pub fn validate(&self) -> Result<()> {
        if self.min_workers > self.max_workers || self.max_workers == 0 || self.queue_capacity == 0 {
            return Err(Error::InvalidPoolConfig {
                min: self.min_workers,
                max: self.max_workers,
                capacity: self.queue_capacity,
            });
        }
        Ok(())
    }

    /// 저사양 기기용 설정
    pub fn low_spec() -> Self {
        Self {
            min_workers: 2,
            max_workers: 8,
            queue_capacity: 32,
            manager_interval_ms: 5_000,
            worker_step: 2,
            scale_up_busy_percent: 80,
        }
    }

    /// 고부하용 설정
    pub fn high_load() -> Self {
        Self {
            min_workers: 32,
            max_workers: 256,
            queue_capacity: 1024,
            manager_interval_ms: 2_000,
            worker_step: 16,
            scale_up_busy_percent: 75,
        }
    }
}

/// TMIS 서버 설정
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Config {
    /// 리슨 주소
    pub bind_addr: SocketAddr,

    /// 스레드 풀 설정
    pub pool: PoolConfig,

    /// 패킷 페이로드 최대 크기 (바이트)
    pub max_payload_size: usize,

    /// 마스터 비밀 스칼라 (32바이트 16진수)
    /// 인증자 계산에는 이 문자열 그대로 사용됨
    pub master_secret: String,

    /// 생성원 P를 유도하는 시드
    pub generator_seed: String,

    /// t1 허용 시계 오차 (초)
    /// None이면 차이만 계산해서 로그로 남기고 거부하지 않음
    pub max_clock_skew_secs: Option<u64>,

    /// 로그 파일 경로 (None이면 stdout)
    pub log_file: Option<PathBuf>,

    /// 로그 레벨 (EnvFilter 문법)
    pub log_level: String,

    /// 진료 기록 JSON 파일
    pub records_file: Option<PathBuf>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::from(([0, 0, 0, 0], DEFAULT_PORT)),
            pool: PoolConfig::default(),
            max_payload_size: DEFAULT_MAX_PAYLOAD_SIZE,
            master_secret: String::new(),
            generator_seed: crate::DEFAULT_GENERATOR_SEED.to_string(),
            max_clock_skew_secs: None,
            log_file: None,
            log_level: "info".to_string(),
            records_file: None,
        }
    }
}

impl Config {
    /// 새 설정 생성
    pub fn new() -> Self {
        Self::default()
    }

    /// TOML 문자열에서 설정 읽기
    pub fn from_toml_str(s: &str) -> Result<Self> {
        let config: Config = toml::from_str(s)?;
        Ok(config)
    }

    /// TOML 파일에서 설정 읽기
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| Error::Config(format!("{}: {}", path.display(), e)))?;
        Self::from_toml_str(&content)
    }

    /// 시계 오차 허용 범위
    pub fn max_clock_skew(&self) -> Option<Duration> {
        self.max_clock_skew_secs.map(Duration::from_secs)
    }

    /// 시작 전 설정 검증
    pub fn validate(&self) -> Result<()> {
        self.pool.validate()?;

        if self.master_secret.trim().is_empty() {
            return Err(Error::Config("master_secret 필요".into()));
        }
        crate::crypto::scalar_from_hex(&self.master_secret)
            .map_err(|e| Error::Config(format!("master_secret: {}", e)))?;

        if self.generator_seed.is_empty() {
            return Err(Error::Config("generator_seed 필요".into()));
        }
        if self.max_payload_size < crate::packet::HEADER_SIZE {
            return Err(Error::Config(format!(
                "max_payload_size 너무 작음: {}",
                self.max_payload_size
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    const SECRET: &str = "0101010101010101010101010101010101010101010101010101010101010101";

    #[test]
    fn test_defaults_match_deployment() {
        let config = Config::default();
        assert_eq!(config.bind_addr.port(), 8888);
        assert_eq!(config.pool.min_workers, 10);
        assert_eq!(config.pool.max_workers, 100);
        assert_eq!(config.pool.queue_capacity, 100);
        assert_eq!(config.pool.manager_interval(), Duration::from_secs(10));
        assert!(config.max_clock_skew().is_none());
    }

    #[test]
    fn test_validate_requires_secret() {
        let mut config = Config::default();
        assert!(matches!(config.validate(), Err(Error::Config(_))));

        config.master_secret = SECRET.to_string();
        assert!(config.validate().is_ok());

        config.master_secret = "not hex".to_string();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_pool_validate() {
        assert!(PoolConfig::new(2, 4, 8).validate().is_ok());
        assert!(PoolConfig::new(0, 4, 8).validate().is_ok());
        assert!(PoolConfig::new(5, 4, 8).validate().is_err());
        assert!(PoolConfig::new(2, 4, 0).validate().is_err());
        assert!(PoolConfig::new(0, 0, 8).validate().is_err());
        assert!(PoolConfig::low_spec().validate().is_ok());
        assert!(PoolConfig::high_load().validate().is_ok());
    }

    #[test]
    fn test_load_from_toml_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            r#"
bind_addr = "127.0.0.1:9999"
master_secret = "{SECRET}"
max_clock_skew_secs = 120

[pool]
min_workers = 3
max_workers = 6
"#
        )
        .unwrap();

        let config = Config::load(file.path()).unwrap();
        assert_eq!(config.bind_addr.port(), 9999);
        assert_eq!(config.pool.min_workers, 3);
        assert_eq!(config.pool.max_workers, 6);
        // 지정하지 않은 값은 기본값
        assert_eq!(config.pool.queue_capacity, 100);
        assert_eq!(config.max_clock_skew(), Some(Duration::from_secs(120)));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_invalid_toml() {
        assert!(matches!(
            Config::from_toml_str("pool = 3"),
            Err(Error::Config(_))
        ));
    }
}
