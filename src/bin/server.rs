//! TMIS 서버 - 키 협상 + 진료 기록 조회
//!
//! 사용법:
//!   cargo run --release --bin tmis-server -- [OPTIONS]
//!
//! 예시:
//!   # 새 마스터 비밀 생성 (설정 파일에 기록)
//!   cargo run --release --bin tmis-server -- --generate-secret
//!
//!   # 사용자 등록: 인증자 Ai와 공개 키 출력
//!   cargo run --release --bin tmis-server -- -c tmis.toml --register alice
//!
//!   # 서버 실행
//!   cargo run --release --bin tmis-server -- -c tmis.toml --records records.json

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, ValueEnum};
use tokio::net::TcpListener;
use tracing::{info, warn};

use tmis::crypto::element_to_string;
use tmis::record::{DataStore, InMemoryDataStore};
use tmis::{Config, Dispatcher, MasterKeyMaterial, PoolConfig, Server, ThreadPool};

/// 풀 설정 프리셋
#[derive(Debug, Clone, Copy, ValueEnum)]
enum Preset {
    LowSpec,
    HighLoad,
}

#[derive(Debug, Parser)]
#[command(name = "tmis-server", version, about = "TMIS 서버 - 적응형 스레드 풀 + 신원 기반 키 협상")]
struct Args {
    /// TOML 설정 파일
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// 바인드 주소 (기본: 0.0.0.0:8888)
    #[arg(short, long)]
    bind: Option<SocketAddr>,

    /// 풀 프리셋
    #[arg(long, value_enum)]
    preset: Option<Preset>,

    #[arg(long)]
    min_workers: Option<usize>,

    #[arg(long)]
    max_workers: Option<usize>,

    #[arg(long)]
    queue_capacity: Option<usize>,

    /// 진료 기록 JSON 파일
    #[arg(short, long)]
    records: Option<PathBuf>,

    /// 로그 파일 (기본: stdout)
    #[arg(long)]
    log_file: Option<PathBuf>,

    #[arg(long)]
    log_level: Option<String>,

    /// t1 허용 시계 오차 (초). 지정하지 않으면 거부하지 않음
    #[arg(long)]
    max_clock_skew: Option<u64>,

    /// 사용자 등록 정보 출력 후 종료
    #[arg(long, value_name = "IDENTITY")]
    register: Option<String>,

    /// 새 마스터 비밀 출력 후 종료
    #[arg(long)]
    generate_secret: bool,

    /// 통계 출력 주기 (초, 0이면 끔)
    #[arg(long, default_value_t = 60)]
    stats_interval: u64,
}

impl Args {
    fn apply(&self, config: &mut Config) {
        if let Some(preset) = self.preset {
            config.pool = match preset {
                Preset::LowSpec => PoolConfig::low_spec(),
                Preset::HighLoad => PoolConfig::high_load(),
            };
        }
        if let Some(bind) = self.bind {
            config.bind_addr = bind;
        }
        if let Some(n) = self.min_workers {
            config.pool.min_workers = n;
        }
        if let Some(n) = self.max_workers {
            config.pool.max_workers = n;
        }
        if let Some(n) = self.queue_capacity {
            config.pool.queue_capacity = n;
        }
        if let Some(path) = &self.records {
            config.records_file = Some(path.clone());
        }
        if let Some(path) = &self.log_file {
            config.log_file = Some(path.clone());
        }
        if let Some(level) = &self.log_level {
            config.log_level = level.clone();
        }
        if let Some(secs) = self.max_clock_skew {
            config.max_clock_skew_secs = Some(secs);
        }
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    let mut config = match &args.config {
        Some(path) => Config::load(path)?,
        None => Config::default(),
    };
    args.apply(&mut config);

    if args.generate_secret {
        let master = MasterKeyMaterial::generate(&config.generator_seed);
        println!("master_secret = \"{}\"", master.secret_hex());
        println!("# public_key = {}", element_to_string(master.public_key()));
        return Ok(());
    }

    config.validate()?;

    if let Some(identity) = &args.register {
        let master = MasterKeyMaterial::from_config(&config)?;
        println!("identity:       {}", identity);
        println!("authenticator:  {}", master.authenticator_for(identity));
        println!("public_key:     {}", element_to_string(master.public_key()));
        println!("generator_seed: {}", config.generator_seed);
        return Ok(());
    }

    tmis::logging::init_from_config(&config)?;

    info!("TMIS Server starting...");
    info!("Bind address: {}", config.bind_addr);
    info!(
        "Pool: min={}, max={}, queue={}, interval={:?}",
        config.pool.min_workers,
        config.pool.max_workers,
        config.pool.queue_capacity,
        config.pool.manager_interval()
    );
    info!("Max payload: {} bytes", config.max_payload_size);
    match config.max_clock_skew() {
        Some(skew) => info!("Freshness: reject t1 older than {:?}", skew),
        None => info!("Freshness: log only"),
    }

    let store: Arc<dyn DataStore> = match &config.records_file {
        Some(path) => {
            let store = InMemoryDataStore::load(path)?;
            info!("Loaded records for {} identities from {:?}", store.identities(), path);
            Arc::new(store)
        }
        None => {
            warn!("기록 파일 없음, 빈 저장소로 시작");
            Arc::new(InMemoryDataStore::new())
        }
    };

    let pool = Arc::new(ThreadPool::with_config(config.pool.clone())?);
    let server = Arc::new(Server::new(&config, store)?);
    let listener = TcpListener::bind(config.bind_addr).await?;

    // 주기적 통계 출력
    let reporter = (args.stats_interval > 0).then(|| {
        let server = server.clone();
        let pool = pool.clone();
        let period = Duration::from_secs(args.stats_interval);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                info!("{}", server.stats().summary());
                info!("{}", pool.stats().summary());
            }
        })
    });

    Dispatcher::new(server.clone(), pool.clone())
        .run(listener, async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                warn!("시그널 대기 실패: {}", e);
                std::future::pending::<()>().await;
            }
        })
        .await?;

    if let Some(reporter) = reporter {
        reporter.abort();
    }

    info!("Shutting down thread pool...");
    let final_pool = pool.clone();
    tokio::task::spawn_blocking(move || final_pool.shutdown()).await?;

    info!("{}", server.stats().summary());
    info!("TMIS Server stopped");
    Ok(())
}
