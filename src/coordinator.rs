//! 파일 전송 조정
//!
//! - 제안측: 랑데부 리스너를 열고 디스크립터를 귓속말로 보낸 뒤 접속 하나만 받아 송신
//! - 수락측: 디스크립터 주소로 접속해 수신
//! - 거절: 접속 후 바로 닫음 (제안측은 실패로 끝남)

use std::fmt;
use std::net::{IpAddr, SocketAddr};
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::fs::File;
use tokio::io::{BufReader, BufWriter};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::config::ClientConfig;
use crate::congestion::Mode;
use crate::receiver::SegmentReceiver;
use crate::segment::SeqNum;
use crate::sender::SegmentSender;
use crate::stats::{TransferStats, TransferUpdate};
use crate::transfer::RetransmitReason;
use crate::{Error, Result};

/// 디스크립터 첫 토큰
pub const DESCRIPTOR_TAG: &str = "File";

/// 전송 제안 디스크립터
///
/// 텍스트 형식: `File <target> <ip> <port> <fileName> <fileSize>`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransferDescriptor {
    /// 받을 사람
    pub target: String,
    /// 제안측 랑데부 IP
    pub ip: IpAddr,
    /// 제안측 랑데부 포트
    pub port: u16,
    /// 파일 이름 (공백 없음)
    pub file_name: String,
    /// 파일 크기 (바이트)
    pub file_size: u64,
}

impl TransferDescriptor {
    /// 공백이 들어간 파일 이름은 `_` 로 바꿔 한 토큰으로 만듦
    pub fn new(target: impl Into<String>, addr: SocketAddr, file_name: &str, file_size: u64) -> Self {
        let file_name: String = file_name
            .chars()
            .map(|c| if c.is_whitespace() { '_' } else { c })
            .collect();

        Self {
            target: target.into(),
            ip: addr.ip(),
            port: addr.port(),
            file_name: if file_name.is_empty() { "file".to_string() } else { file_name },
            file_size,
        }
    }

    pub fn addr(&self) -> SocketAddr {
        SocketAddr::new(self.ip, self.port)
    }

    /// 메시지 본문이 디스크립터로 보이는지
    pub fn looks_like(text: &str) -> bool {
        text.starts_with("File ")
    }
}

impl FromStr for TransferDescriptor {
    type Err = Error;

    fn from_str(text: &str) -> Result<Self> {
        let invalid = || Error::InvalidDescriptor(text.to_string());

        let parts: Vec<&str> = text.split_whitespace().collect();
        if parts.len() < 6 || parts[0] != DESCRIPTOR_TAG {
            return Err(invalid());
        }

        Ok(Self {
            target: parts[1].to_string(),
            ip: parts[2].parse().map_err(|_| invalid())?,
            port: parts[3].parse().map_err(|_| invalid())?,
            file_name: parts[4].to_string(),
            file_size: parts[5].parse().map_err(|_| invalid())?,
        })
    }
}

impl fmt::Display for TransferDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} {} {} {} {} {}",
            DESCRIPTOR_TAG, self.target, self.ip, self.port, self.file_name, self.file_size
        )
    }
}

/// 전송 식별자 (프로세스 안에서 유일)
pub type TransferId = u64;

/// 전송 방향
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransferDirection {
    Outgoing,
    Incoming,
}

/// 전송 이벤트 (표현 계층용)
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "transfer", rename_all = "snake_case")]
pub enum TransferEvent {
    Started {
        id: TransferId,
        direction: TransferDirection,
        peer: String,
        file_name: String,
        file_size: u64,
    },
    Progress {
        id: TransferId,
        direction: TransferDirection,
        bytes: u64,
        file_size: u64,
        fraction: f64,
    },
    /// 송신 라운드마다 cwnd 한 점
    Cwnd {
        id: TransferId,
        round: u64,
        cwnd: u32,
        ssthresh: u32,
        mode: Mode,
    },
    Retransmit {
        id: TransferId,
        seq: SeqNum,
        reason: RetransmitReason,
    },
    Completed {
        id: TransferId,
        direction: TransferDirection,
        file_name: String,
        bytes: u64,
        elapsed_ms: u64,
        retransmits: u64,
    },
    Failed {
        id: TransferId,
        direction: TransferDirection,
        file_name: String,
        reason: String,
    },
}

/// 디스크립터를 보내기 전, 리스너와 파일이 준비된 제안
#[derive(Debug)]
pub struct OutgoingOffer {
    id: TransferId,
    descriptor: TransferDescriptor,
    listener: TcpListener,
    file: File,
}

impl OutgoingOffer {
    pub fn id(&self) -> TransferId {
        self.id
    }

    pub fn descriptor(&self) -> &TransferDescriptor {
        &self.descriptor
    }
}

/// 전송 조정자
///
/// 각 전송은 별도 태스크에서 열기 → 진행 → 닫기까지 소유
#[derive(Clone)]
pub struct TransferCoordinator {
    config: Arc<ClientConfig>,
    events: mpsc::UnboundedSender<TransferEvent>,
    next_id: Arc<AtomicU64>,
}

impl TransferCoordinator {
    pub fn new(config: ClientConfig, events: mpsc::UnboundedSender<TransferEvent>) -> Self {
        Self {
            config: Arc::new(config),
            events,
            next_id: Arc::new(AtomicU64::new(1)),
        }
    }

    /// 파일을 열고 랑데부 리스너를 바인드
    pub async fn open_offer(&self, target: &str, path: &Path) -> Result<OutgoingOffer> {
        let file = File::open(path).await?;
        let file_size = file.metadata().await?.len();

        let listener = TcpListener::bind(self.config.rendezvous_bind).await?;
        let port = listener.local_addr()?.port();

        let file_name = path.file_name().and_then(|n| n.to_str()).unwrap_or("file");
        let descriptor = TransferDescriptor::new(
            target,
            SocketAddr::new(self.config.advertise_ip, port),
            file_name,
            file_size,
        );

        info!("전송 제안 준비: {} → {} ({} bytes, port {})", file_name, target, file_size, port);

        Ok(OutgoingOffer {
            id: self.next_id.fetch_add(1, Ordering::Relaxed),
            descriptor,
            listener,
            file,
        })
    }

    /// 상대 접속을 기다렸다가 송신 (별도 태스크)
    pub fn spawn_offer(&self, offer: OutgoingOffer) -> JoinHandle<Result<TransferStats>> {
        let this = self.clone();
        tokio::spawn(async move { this.run_offer(offer).await })
    }

    /// 제안을 수락하고 수신 (별도 태스크)
    pub fn spawn_accept(&self, from: &str, descriptor: TransferDescriptor) -> JoinHandle<Result<TransferStats>> {
        let this = self.clone();
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let from = from.to_string();
        tokio::spawn(async move { this.run_accept(id, from, descriptor).await })
    }

    /// 제안 거절: 접속 후 바로 닫음
    pub async fn reject(&self, descriptor: &TransferDescriptor) -> Result<()> {
        let stream = TcpStream::connect(descriptor.addr()).await?;
        drop(stream);
        info!("전송 거절: {}", descriptor.file_name);
        Ok(())
    }

    async fn run_offer(&self, offer: OutgoingOffer) -> Result<TransferStats> {
        let OutgoingOffer {
            id,
            descriptor,
            listener,
            file,
        } = offer;
        let direction = TransferDirection::Outgoing;

        self.emit(TransferEvent::Started {
            id,
            direction,
            peer: descriptor.target.clone(),
            file_name: descriptor.file_name.clone(),
            file_size: descriptor.file_size,
        });

        let result: Result<TransferStats> = async {
            let timeout_ms = self.config.accept_timeout_ms;
            let (stream, peer) = tokio::time::timeout(self.config.accept_timeout(), listener.accept())
                .await
                .map_err(|_| Error::RendezvousTimeout { timeout_ms })??;
            // 접속은 하나만 받음
            drop(listener);
            stream.set_nodelay(true)?;
            info!("전송 상대 접속: {}", peer);

            let (tx, rx) = mpsc::unbounded_channel();
            let forward = self.forward_updates(id, direction, rx);

            let sender = SegmentSender::new(self.config.transport.clone()).with_updates(tx);
            let result = sender
                .send(stream, BufReader::new(file), descriptor.file_size)
                .await;
            drop(sender);
            let _ = forward.await;
            result
        }
        .await;

        self.finish(id, direction, &descriptor.file_name, result)
    }

    async fn run_accept(&self, id: TransferId, from: String, descriptor: TransferDescriptor) -> Result<TransferStats> {
        let direction = TransferDirection::Incoming;
        let path = self.download_path(&descriptor.file_name);

        self.emit(TransferEvent::Started {
            id,
            direction,
            peer: from,
            file_name: descriptor.file_name.clone(),
            file_size: descriptor.file_size,
        });

        let result: Result<TransferStats> = async {
            let stream = TcpStream::connect(descriptor.addr()).await?;
            stream.set_nodelay(true)?;
            let file = File::create(&path).await?;
            info!("수신 시작: {} → {}", descriptor.addr(), path.display());

            let (tx, rx) = mpsc::unbounded_channel();
            let forward = self.forward_updates(id, direction, rx);

            let receiver = SegmentReceiver::new(self.config.transport.clone()).with_updates(tx);
            let result = receiver
                .receive(stream, BufWriter::new(file), descriptor.file_size)
                .await;
            drop(receiver);
            let _ = forward.await;
            result
        }
        .await;

        self.finish(id, direction, &descriptor.file_name, result)
    }

    /// 다운로드 경로: 디렉터리 성분은 버리고 이름만 사용
    fn download_path(&self, file_name: &str) -> PathBuf {
        let name = Path::new(file_name)
            .file_name()
            .map(|n| n.to_os_string())
            .unwrap_or_else(|| "download".into());
        self.config.download_dir.join(name)
    }

    /// 송수신 루프 알림을 전송 이벤트로 변환
    fn forward_updates(
        &self,
        id: TransferId,
        direction: TransferDirection,
        mut updates: mpsc::UnboundedReceiver<TransferUpdate>,
    ) -> JoinHandle<()> {
        let events = self.events.clone();
        tokio::spawn(async move {
            while let Some(update) = updates.recv().await {
                let event = match update {
                    TransferUpdate::Progress { bytes, file_size } => TransferEvent::Progress {
                        id,
                        direction,
                        bytes,
                        file_size,
                        fraction: TransferUpdate::fraction(bytes, file_size),
                    },
                    TransferUpdate::Round { sample, snapshot } => TransferEvent::Cwnd {
                        id,
                        round: sample.round,
                        cwnd: sample.cwnd,
                        ssthresh: snapshot.ssthresh,
                        mode: snapshot.mode,
                    },
                    TransferUpdate::Retransmit { seq, reason } => TransferEvent::Retransmit { id, seq, reason },
                };
                let _ = events.send(event);
            }
        })
    }

    fn finish(
        &self,
        id: TransferId,
        direction: TransferDirection,
        file_name: &str,
        result: Result<TransferStats>,
    ) -> Result<TransferStats> {
        match &result {
            Ok(stats) => {
                info!("전송 {} 완료 ({:?}): {}", id, direction, stats.summary());
                self.emit(TransferEvent::Completed {
                    id,
                    direction,
                    file_name: file_name.to_string(),
                    bytes: stats.bytes_acked.max(stats.bytes_written),
                    elapsed_ms: stats.elapsed().as_millis() as u64,
                    retransmits: stats.total_retransmits(),
                });
            }
            Err(e) => {
                warn!("전송 {} 실패 ({:?}): {}", id, direction, e);
                self.emit(TransferEvent::Failed {
                    id,
                    direction,
                    file_name: file_name.to_string(),
                    reason: e.to_string(),
                });
            }
        }
        result
    }

    fn emit(&self, event: TransferEvent) {
        let _ = self.events.send(event);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Config;

    fn test_config(download_dir: &Path) -> ClientConfig {
        ClientConfig {
            download_dir: download_dir.to_path_buf(),
            transport: Config::fast_local(),
            ..ClientConfig::default()
        }
    }

    fn drain(rx: &mut mpsc::UnboundedReceiver<TransferEvent>) -> Vec<TransferEvent> {
        let mut events = Vec::new();
        while let Ok(event) = rx.try_recv() {
            events.push(event);
        }
        events
    }

    #[test]
    fn test_descriptor_text_format() {
        let addr: SocketAddr = "192.168.0.7:40001".parse().unwrap();
        let descriptor = TransferDescriptor::new("bob", addr, "my report.pdf", 2048);

        assert_eq!(descriptor.to_string(), "File bob 192.168.0.7 40001 my_report.pdf 2048");
        assert_eq!(descriptor.to_string().parse::<TransferDescriptor>().unwrap(), descriptor);
    }

    #[test]
    fn test_descriptor_rejects_malformed_text() {
        assert!("File bob 1.2.3.4 80 a.txt".parse::<TransferDescriptor>().is_err());
        assert!("File bob nowhere 80 a.txt 10".parse::<TransferDescriptor>().is_err());
        assert!("File bob 1.2.3.4 99999 a.txt 10".parse::<TransferDescriptor>().is_err());
        assert!("Photo bob 1.2.3.4 80 a.txt 10".parse::<TransferDescriptor>().is_err());
        assert!(!TransferDescriptor::looks_like("Filed under misc"));
    }

    #[test]
    fn test_download_path_strips_directories() {
        let dir = tempfile::tempdir().unwrap();
        let (tx, _rx) = mpsc::unbounded_channel();
        let coordinator = TransferCoordinator::new(test_config(dir.path()), tx);

        assert_eq!(coordinator.download_path("../../etc/passwd"), dir.path().join("passwd"));
        assert_eq!(coordinator.download_path("notes.txt"), dir.path().join("notes.txt"));
    }

    #[tokio::test]
    async fn test_offer_and_accept_over_loopback() {
        let src_dir = tempfile::tempdir().unwrap();
        let dst_dir = tempfile::tempdir().unwrap();

        let data: Vec<u8> = (0..50_000u32).map(|i| (i * 7 % 253) as u8).collect();
        let src_path = src_dir.path().join("payload.bin");
        std::fs::write(&src_path, &data).unwrap();

        let (alice_tx, mut alice_rx) = mpsc::unbounded_channel();
        let alice = TransferCoordinator::new(test_config(src_dir.path()), alice_tx);
        let (bob_tx, mut bob_rx) = mpsc::unbounded_channel();
        let bob = TransferCoordinator::new(test_config(dst_dir.path()), bob_tx);

        let offer = alice.open_offer("bob", &src_path).await.unwrap();
        let descriptor = offer.descriptor().clone();
        assert_eq!(descriptor.file_size, 50_000);
        assert_eq!(descriptor.file_name, "payload.bin");

        let sending = alice.spawn_offer(offer);
        let receiving = bob.spawn_accept("alice", descriptor);

        let sent = sending.await.unwrap().unwrap();
        let received = receiving.await.unwrap().unwrap();
        assert_eq!(sent.bytes_acked, 50_000);
        assert_eq!(received.bytes_written, 50_000);

        let written = std::fs::read(dst_dir.path().join("payload.bin")).unwrap();
        assert_eq!(written, data);

        let alice_events = drain(&mut alice_rx);
        assert!(matches!(alice_events.first(), Some(TransferEvent::Started { .. })));
        assert!(alice_events.iter().any(|e| matches!(e, TransferEvent::Cwnd { .. })));
        assert!(matches!(alice_events.last(), Some(TransferEvent::Completed { bytes: 50_000, .. })));

        let bob_events = drain(&mut bob_rx);
        assert!(matches!(
            bob_events.last(),
            Some(TransferEvent::Completed {
                direction: TransferDirection::Incoming,
                ..
            })
        ));
    }

    #[tokio::test]
    async fn test_reject_fails_offering_side() {
        let src_dir = tempfile::tempdir().unwrap();
        let src_path = src_dir.path().join("big.bin");
        std::fs::write(&src_path, vec![9u8; 200_000]).unwrap();

        let (alice_tx, mut alice_rx) = mpsc::unbounded_channel();
        let alice = TransferCoordinator::new(test_config(src_dir.path()), alice_tx);
        let (bob_tx, _bob_rx) = mpsc::unbounded_channel();
        let bob = TransferCoordinator::new(test_config(src_dir.path()), bob_tx);

        let offer = alice.open_offer("bob", &src_path).await.unwrap();
        let descriptor = offer.descriptor().clone();
        let sending = alice.spawn_offer(offer);

        bob.reject(&descriptor).await.unwrap();

        assert!(sending.await.unwrap().is_err());
        assert!(matches!(drain(&mut alice_rx).last(), Some(TransferEvent::Failed { .. })));
    }

    #[tokio::test]
    async fn test_unanswered_offer_times_out() {
        let src_dir = tempfile::tempdir().unwrap();
        let src_path = src_dir.path().join("a.txt");
        std::fs::write(&src_path, b"hello").unwrap();

        let config = ClientConfig {
            accept_timeout_ms: 100,
            ..test_config(src_dir.path())
        };
        let (tx, _rx) = mpsc::unbounded_channel();
        let coordinator = TransferCoordinator::new(config, tx);

        let offer = coordinator.open_offer("bob", &src_path).await.unwrap();
        let err = coordinator.spawn_offer(offer).await.unwrap().unwrap_err();
        assert!(matches!(err, Error::RendezvousTimeout { timeout_ms: 100 }));
    }
}
