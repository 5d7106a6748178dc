//! renochat 서버 (브로커)
//!
//! 사용자 이름 등록, 공개 메시지 브로드캐스트, 귓속말 라우팅
//! 파일 데이터는 서버를 거치지 않음 (디스크립터만 귓속말로 전달)
//!
//! 사용법:
//!   cargo run --release --bin renochat-server -- [OPTIONS]
//!
//! 예시:
//!   cargo run --release --bin renochat-server -- --bind 0.0.0.0:12345 --max-sessions 64
//!   RUST_LOG=debug cargo run --bin renochat-server

use std::net::SocketAddr;

use clap::Parser;
use tracing::info;
use tracing_subscriber::EnvFilter;

use renochat::{Broker, BrokerConfig, DEFAULT_BROKER_PORT};

/// renochat 채팅 브로커
#[derive(Parser, Debug)]
#[command(author, version, about)]
struct Args {
    /// 리슨 주소
    #[arg(short, long, default_value_t = SocketAddr::from(([0, 0, 0, 0], DEFAULT_BROKER_PORT)))]
    bind: SocketAddr,

    /// 최대 동시 세션 수
    #[arg(long, default_value_t = 1024)]
    max_sessions: usize,

    /// 이름이 비었을 때 쓰는 이름
    #[arg(long, default_value = "Anonymous")]
    anonymous_name: String,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let args = Args::parse();
    let config = BrokerConfig {
        bind_addr: args.bind,
        max_sessions: args.max_sessions,
        anonymous_name: args.anonymous_name,
        ..BrokerConfig::default()
    };

    info!("=== renochat server ===");
    info!("Bind: {}, max sessions: {}", config.bind_addr, config.max_sessions);

    let broker = Broker::new(config);
    let shutdown = broker.shutdown_handle();

    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Ctrl-C 수신, 서버 종료");
            shutdown.shutdown();
        }
    });

    broker.serve().await?;
    Ok(())
}
