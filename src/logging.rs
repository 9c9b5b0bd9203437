//! 로그 출력 설정
//!
//! 로그 파일이 지정되면 추가 모드로 기록하고, 없으면 stdout.
//! 기록 실패는 무시된다 (프로토콜 결과에 영향 없음).

use std::fs::OpenOptions;
use std::path::Path;
use std::sync::Mutex;

use tracing_subscriber::EnvFilter;

use crate::config::Config;
use crate::{Error, Result};

/// 전역 subscriber 설치
///
/// `RUST_LOG`가 있으면 그 값이 `level`보다 우선한다.
pub fn init_logging(level: &str, log_file: Option<&Path>) -> Result<()> {
    let filter = match EnvFilter::try_from_default_env() {
        Ok(filter) => filter,
        Err(_) => parse_filter(level)?,
    };

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_thread_names(true);

    let installed = match log_file {
        Some(path) => {
            let file = OpenOptions::new().create(true).append(true).open(path)?;
            builder.with_ansi(false).with_writer(Mutex::new(file)).try_init()
        }
        None => builder.try_init(),
    };

    installed.map_err(|e| Error::Config(format!("로깅 초기화 실패: {}", e)))
}

fn parse_filter(level: &str) -> Result<EnvFilter> {
    EnvFilter::try_new(level).map_err(|e| Error::Config(format!("log_level: {}", e)))
}

/// 설정 값으로 로깅 초기화
pub fn init_from_config(config: &Config) -> Result<()> {
    init_logging(&config.log_level, config.log_file.as_deref())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_log_file_appends() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("tmis.log");
        std::fs::write(&path, "existing line\n").unwrap();

        init_logging("info", Some(&path)).unwrap();
        tracing::warn!("logging-test-marker");

        let content = std::fs::read_to_string(&path).unwrap();
        assert!(content.starts_with("existing line\n"));
        if std::env::var("RUST_LOG").is_err() {
            assert!(content.contains("logging-test-marker"));
        }

        // 두 번째 설치는 에러
        assert!(init_logging("info", None).is_err());
    }

    #[test]
    fn test_parse_filter() {
        assert!(parse_filter("info").is_ok());
        assert!(parse_filter("tmis=debug,warn").is_ok());
        assert!(matches!(parse_filter("tmis=loud"), Err(Error::Config(_))));
    }
}
