//! TMIS 클라이언트 - 키 협상 후 진료 기록 조회
//!
//! 사용법:
//!   cargo run --release --bin tmis-client -- [OPTIONS]
//!
//! 예시:
//!   # 기록 조회 (인증자/공개 키는 tmis-server --register 출력값)
//!   cargo run --release --bin tmis-client -- -i alice -a <AI> --public-key <HEX>
//!
//!   # 부하 테스트: 세션 64개 병렬, 세션당 요청 10개
//!   cargo run --release --bin tmis-client -- -i alice -a <AI> --public-key <HEX> --sessions 64 --requests 10

use std::net::{SocketAddr, TcpStream};
use std::time::{Duration, Instant};

use clap::Parser;
use rayon::prelude::*;
use tracing::{info, warn};

use tmis::{ClientSession, MedicalRecord, DEFAULT_GENERATOR_SEED, DEFAULT_MAX_PAYLOAD_SIZE};

#[derive(Debug, Parser)]
#[command(name = "tmis-client", version, about = "TMIS 클라이언트 - 키 협상 + 진료 기록 조회")]
struct Args {
    /// 서버 주소
    #[arg(short, long, default_value = "127.0.0.1:8888")]
    server: SocketAddr,

    /// 사용자 신원 (IDi)
    #[arg(short, long)]
    identity: String,

    /// 등록 시 받은 인증자 (Ai)
    #[arg(short, long)]
    authenticator: String,

    /// 서버 공개 키 (16진수)
    #[arg(long)]
    public_key: String,

    #[arg(long, default_value = DEFAULT_GENERATOR_SEED)]
    generator_seed: String,

    /// 병렬 세션 수
    #[arg(long, default_value_t = 1)]
    sessions: usize,

    /// 세션당 기록 요청 수
    #[arg(long, default_value_t = 1)]
    requests: usize,

    #[arg(long, default_value_t = DEFAULT_MAX_PAYLOAD_SIZE)]
    max_payload: usize,

    /// 응답 대기 시간 (초)
    #[arg(long, default_value_t = 10)]
    timeout: u64,

    #[arg(long, default_value = "info")]
    log_level: String,
}

/// 세션 하나 결과
struct SessionOutcome {
    records: Vec<MedicalRecord>,
    handshake: Duration,
    total: Duration,
}

fn run_session(client: &ClientSession, args: &Args) -> tmis::Result<SessionOutcome> {
    let start = Instant::now();
    let mut stream = TcpStream::connect(args.server)?;
    stream.set_read_timeout(Some(Duration::from_secs(args.timeout)))?;
    stream.set_nodelay(true)?;

    let key = client.key_agreement(&mut stream, args.max_payload)?;
    let handshake = start.elapsed();

    let mut records = Vec::new();
    for _ in 0..args.requests {
        records = client.fetch_records(&mut stream, &key, args.max_payload)?;
    }

    Ok(SessionOutcome {
        records,
        handshake,
        total: start.elapsed(),
    })
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();
    tmis::logging::init_logging(&args.log_level, None)?;

    let client = ClientSession::from_public_params(
        &args.identity,
        &args.authenticator,
        &args.generator_seed,
        &args.public_key,
    )?;

    info!("TMIS Client starting...");
    info!("Server: {}", args.server);
    info!("Identity: {}", client.identity());

    if args.sessions <= 1 {
        let outcome = run_session(&client, &args)?;
        info!("Key agreement: {:.2}ms", outcome.handshake.as_secs_f64() * 1000.0);
        info!("Records: {}", outcome.records.len());
        for record in &outcome.records {
            println!(
                "{}\t{}\t{}\t{}",
                record.time, record.doctor, record.symptom, record.feedback
            );
        }
        return Ok(());
    }

    // 부하 테스트
    info!("Running {} sessions x {} requests", args.sessions, args.requests);
    let start = Instant::now();

    let outcomes: Vec<tmis::Result<SessionOutcome>> = (0..args.sessions)
        .into_par_iter()
        .map(|_| run_session(&client, &args))
        .collect();

    let elapsed = start.elapsed();
    let mut ok = 0usize;
    let mut handshake_total = Duration::ZERO;
    let mut session_total = Duration::ZERO;

    for outcome in &outcomes {
        match outcome {
            Ok(outcome) => {
                ok += 1;
                handshake_total += outcome.handshake;
                session_total += outcome.total;
            }
            Err(e) => warn!("세션 실패: {}", e),
        }
    }

    info!("Load test complete!");
    info!("  Time: {:.2}s", elapsed.as_secs_f64());
    info!("  Sessions: {}/{} ok", ok, args.sessions);
    if ok > 0 {
        info!(
            "  Avg key agreement: {:.2}ms",
            handshake_total.as_secs_f64() * 1000.0 / ok as f64
        );
        info!(
            "  Avg session: {:.2}ms",
            session_total.as_secs_f64() * 1000.0 / ok as f64
        );
        info!(
            "  Throughput: {:.1} requests/s",
            (ok * (args.requests + 1)) as f64 / elapsed.as_secs_f64()
        );
    }

    Ok(())
}
