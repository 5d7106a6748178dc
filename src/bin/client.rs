//! renochat 클라이언트
//!
//! 표준입력 명령 + 이벤트 출력으로 된 최소 텍스트 표현 계층
//!
//! 명령:
//!   /msg <user> <text>    귓속말
//!   /file <user> <path>   파일 제안
//!   /accept, /reject      가장 오래된 제안 수락/거절
//!   /users                사용자 목록 요청
//!   /quit                 종료
//!   그 외                 공개 메시지
//!
//! 예시:
//!   cargo run --release --bin renochat-client -- --name alice --server 127.0.0.1:12345
//!   cargo run --release --bin renochat-client -- --name bob --json --download-dir ./inbox

use std::net::{IpAddr, SocketAddr};
use std::path::{Path, PathBuf};

use clap::Parser;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::warn;
use tracing_subscriber::EnvFilter;

use renochat::{ChatClient, ClientConfig, ClientEvent, Config, TransferEvent, DEFAULT_BROKER_PORT};

/// renochat 채팅 클라이언트
#[derive(Parser, Debug)]
#[command(author, version, about)]
struct Args {
    /// 사용자 이름
    #[arg(short, long)]
    name: String,

    /// 브로커 주소
    #[arg(short, long, default_value_t = SocketAddr::from(([127, 0, 0, 1], DEFAULT_BROKER_PORT)))]
    server: SocketAddr,

    /// 파일 제안 시 디스크립터에 넣을 IP
    #[arg(long, default_value = "127.0.0.1")]
    advertise_ip: IpAddr,

    /// 랑데부 리스너 바인드 주소 (포트 0 = 자동)
    #[arg(long, default_value = "0.0.0.0:0")]
    rendezvous_bind: SocketAddr,

    /// 받은 파일 저장 디렉터리
    #[arg(short, long, default_value = ".")]
    download_dir: PathBuf,

    /// 상대 접속 대기 시간 (초)
    #[arg(long, default_value_t = 120)]
    accept_timeout_secs: u64,

    /// 세그먼트 크기 (바이트)
    #[arg(long, default_value_t = renochat::DEFAULT_SEGMENT_SIZE)]
    segment_size: usize,

    /// 이벤트를 JSON 한 줄씩 출력
    #[arg(long)]
    json: bool,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")))
        .with_writer(std::io::stderr)
        .init();

    let args = Args::parse();
    let config = ClientConfig {
        server_addr: args.server,
        rendezvous_bind: args.rendezvous_bind,
        advertise_ip: args.advertise_ip,
        accept_timeout_ms: args.accept_timeout_secs * 1000,
        download_dir: args.download_dir.clone(),
        transport: Config::default().with_segment_size(args.segment_size),
    };

    let (client, mut events) = ChatClient::connect(config, &args.name).await?;
    let mut stdin = BufReader::new(tokio::io::stdin()).lines();

    loop {
        tokio::select! {
            event = events.recv() => {
                let Some(event) = event else { break };
                let disconnected = matches!(event, ClientEvent::Disconnected { .. });
                print_event(&event, args.json);
                if disconnected {
                    return Ok(());
                }
            }
            line = stdin.next_line() => {
                let Some(line) = line? else { break };
                if !handle_input(&client, line.trim_end()).await {
                    break;
                }
            }
        }
    }

    client.quit().await?;
    Ok(())
}

/// 입력 한 줄 처리, 종료면 false
async fn handle_input(client: &ChatClient, line: &str) -> bool {
    let (command, rest) = line.split_once(' ').unwrap_or((line, ""));

    let result = match command {
        "/quit" => return false,
        "/users" => client.request_users(),
        "/msg" => match rest.split_once(' ') {
            Some((to, text)) => client.send_private(to, text),
            None => {
                eprintln!("usage: /msg <user> <text>");
                Ok(())
            }
        },
        "/file" => match rest.split_once(' ') {
            Some((to, path)) => client.offer_file(to, Path::new(path.trim())).await.map(|_| ()),
            None => {
                eprintln!("usage: /file <user> <path>");
                Ok(())
            }
        },
        "/accept" => {
            match client.take_offer() {
                Some(offer) => {
                    let _ = client.accept_offer(offer);
                }
                None => eprintln!("no pending offer"),
            }
            Ok(())
        }
        "/reject" => match client.take_offer() {
            Some(offer) => client.reject_offer(&offer).await,
            None => {
                eprintln!("no pending offer");
                Ok(())
            }
        },
        _ if line.is_empty() => Ok(()),
        _ => client.send_public(line),
    };

    if let Err(e) = result {
        warn!("명령 실패: {}", e);
        eprintln!("error: {}", e);
    }
    true
}

fn print_event(event: &ClientEvent, json: bool) {
    if json {
        match serde_json::to_string(event) {
            Ok(line) => println!("{}", line),
            Err(e) => warn!("이벤트 직렬화 실패: {}", e),
        }
        return;
    }

    match event {
        ClientEvent::Connected { server, name } => println!("* connected to {} as {}", server, name),
        ClientEvent::Disconnected { reason: Some(reason) } => println!("* disconnected: {}", reason),
        ClientEvent::Disconnected { reason: None } => println!("* disconnected"),
        ClientEvent::MessageReceived {
            from,
            text,
            is_private: true,
        } => println!("[private] {}: {}", from, text),
        ClientEvent::MessageReceived { from, text, .. } => println!("{}: {}", from, text),
        ClientEvent::Presence { name, joined: true } => println!("* {} joined the chat", name),
        ClientEvent::Presence { name, joined: false } => println!("* {} left the chat", name),
        ClientEvent::DirectoryChanged { names } => println!("* users: {}", names.join(", ")),
        ClientEvent::TransferOffered { from, descriptor } => println!(
            "* {} wants to send you a file: {} ({} bytes) - /accept or /reject",
            from, descriptor.file_name, descriptor.file_size
        ),
        ClientEvent::Transfer(transfer) => print_transfer(transfer),
        ClientEvent::Notice { text } => println!("* {}", text),
    }
}

fn print_transfer(event: &TransferEvent) {
    match event {
        TransferEvent::Started {
            id,
            direction,
            peer,
            file_name,
            file_size,
        } => println!("* transfer {} {:?} {} ({} bytes) with {}", id, direction, file_name, file_size, peer),
        TransferEvent::Progress { id, fraction, .. } => {
            if *fraction >= 1.0 {
                println!("* transfer {}: 100%", id);
            }
        }
        // cwnd 기록은 JSON 출력에서만 의미 있음
        TransferEvent::Cwnd { .. } | TransferEvent::Retransmit { .. } => {}
        TransferEvent::Completed {
            id,
            file_name,
            bytes,
            elapsed_ms,
            retransmits,
            ..
        } => println!(
            "* transfer {} done: {} ({} bytes, {} ms, {} retransmits)",
            id, file_name, bytes, elapsed_ms, retransmits
        ),
        TransferEvent::Failed { id, file_name, reason, .. } => {
            println!("* transfer {} failed: {} ({})", id, file_name, reason)
        }
    }
}
