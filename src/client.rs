//! 채팅 클라이언트
//!
//! 제어 채널 한 줄을 표현 계층용 이벤트로 바꾸고,
//! 파일 전송 제안/수락/거절은 TransferCoordinator 에 맡김.

use std::collections::VecDeque;
use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde::Serialize;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio::task::JoinHandle;
use tracing::{debug, info};

use crate::broker::SERVER_FULL_LINE;
use crate::client_session::write_lines;
use crate::config::ClientConfig;
use crate::coordinator::{TransferCoordinator, TransferDescriptor, TransferEvent};
use crate::stats::TransferStats;
use crate::{Error, Result};

/// 브로커로 보낼 줄 대기열 크기
const OUTBOUND_QUEUE: usize = 256;

/// 표현 계층 이벤트
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum ClientEvent {
    Connected {
        server: SocketAddr,
        name: String,
    },
    Disconnected {
        reason: Option<String>,
    },
    MessageReceived {
        from: String,
        text: String,
        is_private: bool,
    },
    Presence {
        name: String,
        joined: bool,
    },
    DirectoryChanged {
        names: Vec<String>,
    },
    TransferOffered {
        from: String,
        descriptor: TransferDescriptor,
    },
    Transfer(TransferEvent),
    /// 해석하지 못한 서버 줄
    Notice {
        text: String,
    },
}

/// 받은 전송 제안
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IncomingOffer {
    pub from: String,
    pub descriptor: TransferDescriptor,
}

/// 서버가 보낸 줄 하나를 이벤트로 해석
pub fn parse_server_line(line: &str) -> ClientEvent {
    if let Some(rest) = line.strip_prefix("/userlist") {
        if rest.is_empty() || rest.starts_with(' ') {
            let names = rest
                .split(',')
                .map(str::trim)
                .filter(|n| !n.is_empty())
                .map(str::to_string)
                .collect();
            return ClientEvent::DirectoryChanged { names };
        }
    }

    if let Some(rest) = line.strip_prefix("/private ") {
        if let Some((from, text)) = rest.split_once(": ") {
            if TransferDescriptor::looks_like(text) {
                if let Ok(descriptor) = text.parse() {
                    return ClientEvent::TransferOffered {
                        from: from.to_string(),
                        descriptor,
                    };
                }
            }
            return ClientEvent::MessageReceived {
                from: from.to_string(),
                text: text.to_string(),
                is_private: true,
            };
        }
    }

    // 브로커 이름에는 공백도 `:` 도 없음
    let is_name = |name: &str| !name.is_empty() && !name.contains(|c: char| c.is_whitespace() || c == ':');

    // 공개 메시지를 먼저 봄: "bob: joined the chat" 은 bob 의 메시지
    if let Some((from, text)) = line.split_once(": ").filter(|(from, _)| is_name(from)) {
        return ClientEvent::MessageReceived {
            from: from.to_string(),
            text: text.to_string(),
            is_private: false,
        };
    }

    if let Some(name) = line.strip_suffix(" joined the chat").filter(|n| is_name(n)) {
        return ClientEvent::Presence {
            name: name.to_string(),
            joined: true,
        };
    }
    if let Some(name) = line.strip_suffix(" left the chat").filter(|n| is_name(n)) {
        return ClientEvent::Presence {
            name: name.to_string(),
            joined: false,
        };
    }

    ClientEvent::Notice { text: line.to_string() }
}

/// 브로커 클라이언트
pub struct ChatClient {
    name: String,
    outbound: mpsc::Sender<String>,
    coordinator: TransferCoordinator,
    offers: Arc<Mutex<VecDeque<IncomingOffer>>>,
    reader: JoinHandle<()>,
    writer: JoinHandle<()>,
}

impl ChatClient {
    /// 접속 → 프롬프트 수신 → 이름 전송
    ///
    /// 이벤트 수신 채널을 함께 돌려줌
    pub async fn connect(config: ClientConfig, name: &str) -> Result<(Self, mpsc::UnboundedReceiver<ClientEvent>)> {
        let server = config.server_addr;
        let stream = TcpStream::connect(server).await?;
        stream.set_nodelay(true)?;
        let (read_half, mut write_half) = stream.into_split();
        let mut lines = BufReader::new(read_half).lines();

        let prompt = lines.next_line().await?.ok_or(Error::ConnectionClosed)?;
        if prompt == SERVER_FULL_LINE {
            return Err(Error::ServerFull);
        }
        debug!("서버 프롬프트: {}", prompt);

        write_half.write_all(format!("{}\n", name).as_bytes()).await?;
        write_half.flush().await?;

        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let _ = event_tx.send(ClientEvent::Connected {
            server,
            name: name.to_string(),
        });
        info!("브로커 접속: {} as {}", server, name);

        let (outbound, outbound_rx) = mpsc::channel(OUTBOUND_QUEUE);
        let writer = tokio::spawn(write_lines(write_half, outbound_rx));

        let offers = Arc::new(Mutex::new(VecDeque::new()));
        let reader = {
            let offers = Arc::clone(&offers);
            let events = event_tx.clone();
            tokio::spawn(async move {
                let reason = loop {
                    match lines.next_line().await {
                        Ok(Some(line)) => {
                            let event = parse_server_line(&line);
                            if let ClientEvent::TransferOffered { from, descriptor } = &event {
                                offers.lock().push_back(IncomingOffer {
                                    from: from.clone(),
                                    descriptor: descriptor.clone(),
                                });
                            }
                            let _ = events.send(event);
                        }
                        Ok(None) => break None,
                        Err(e) => break Some(e.to_string()),
                    }
                };
                info!("브로커 연결 종료");
                let _ = events.send(ClientEvent::Disconnected { reason });
            })
        };

        let (transfer_tx, mut transfer_rx) = mpsc::unbounded_channel();
        let coordinator = TransferCoordinator::new(config, transfer_tx);
        tokio::spawn(async move {
            while let Some(event) = transfer_rx.recv().await {
                let _ = event_tx.send(ClientEvent::Transfer(event));
            }
        });

        let client = Self {
            name: name.to_string(),
            outbound,
            coordinator,
            offers,
            reader,
            writer,
        };
        Ok((client, event_rx))
    }

    /// 접속 시 요청한 이름 (충돌 시 서버가 바꿀 수 있음)
    pub fn name(&self) -> &str {
        &self.name
    }

    fn send_line(&self, line: String) -> Result<()> {
        self.outbound.try_send(line).map_err(|e| match e {
            TrySendError::Full(_) => Error::QueueFull,
            TrySendError::Closed(_) => Error::NotConnected,
        })
    }

    pub fn send_public(&self, text: &str) -> Result<()> {
        self.send_line(text.to_string())
    }

    pub fn send_private(&self, to: &str, text: &str) -> Result<()> {
        self.send_line(format!("/msg {} {}", to, text))
    }

    /// 귓속말 대화 시작 알림
    pub fn open_private(&self, to: &str) -> Result<()> {
        self.send_line(format!("/private {}", to))
    }

    /// `/userlist` 요청
    pub fn request_users(&self) -> Result<()> {
        self.send_line("/users".to_string())
    }

    /// 파일 제안: 리스너 준비 → 디스크립터 귓속말 → 접속 대기 후 송신
    pub async fn offer_file(&self, to: &str, path: &Path) -> Result<JoinHandle<Result<TransferStats>>> {
        let offer = self.coordinator.open_offer(to, path).await?;
        self.send_private(to, &offer.descriptor().to_string())?;
        Ok(self.coordinator.spawn_offer(offer))
    }

    /// 가장 오래된 대기 중 제안
    pub fn take_offer(&self) -> Option<IncomingOffer> {
        self.offers.lock().pop_front()
    }

    pub fn pending_offers(&self) -> usize {
        self.offers.lock().len()
    }

    pub fn accept_offer(&self, offer: IncomingOffer) -> JoinHandle<Result<TransferStats>> {
        self.coordinator.spawn_accept(&offer.from, offer.descriptor)
    }

    pub async fn reject_offer(&self, offer: &IncomingOffer) -> Result<()> {
        self.coordinator.reject(&offer.descriptor).await
    }

    /// `/quit` 보내고 서버가 닫을 때까지 잠시 기다림
    pub async fn quit(self) -> Result<()> {
        let Self {
            outbound,
            reader,
            writer,
            ..
        } = self;

        let sent = outbound.send("/quit".to_string()).await;
        drop(outbound);
        let _ = writer.await;

        if tokio::time::timeout(Duration::from_secs(2), reader).await.is_err() {
            debug!("서버 종료 대기 시간 초과");
        }

        sent.map_err(|_| Error::NotConnected)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::Broker;
    use crate::config::BrokerConfig;
    use crate::coordinator::TransferDirection;
    use crate::Config;

    async fn start_broker() -> SocketAddr {
        let broker = Arc::new(Broker::new(BrokerConfig {
            bind_addr: "127.0.0.1:0".parse().unwrap(),
            ..BrokerConfig::default()
        }));
        let listener = broker.bind().await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move { broker.run(listener).await });
        addr
    }

    fn client_config(server_addr: SocketAddr, download_dir: &Path) -> ClientConfig {
        ClientConfig {
            server_addr,
            download_dir: download_dir.to_path_buf(),
            transport: Config::fast_local(),
            ..ClientConfig::default()
        }
    }

    async fn wait_for(
        rx: &mut mpsc::UnboundedReceiver<ClientEvent>,
        pred: impl Fn(&ClientEvent) -> bool,
    ) -> ClientEvent {
        tokio::time::timeout(Duration::from_secs(10), async {
            loop {
                let event = rx.recv().await.expect("event channel closed");
                if pred(&event) {
                    return event;
                }
            }
        })
        .await
        .expect("event timeout")
    }

    #[test]
    fn test_parse_server_lines() {
        assert!(matches!(
            parse_server_line("/userlist alice,bob"),
            ClientEvent::DirectoryChanged { names } if names == vec!["alice", "bob"]
        ));
        assert!(matches!(
            parse_server_line("/userlist"),
            ClientEvent::DirectoryChanged { names } if names.is_empty()
        ));
        assert!(matches!(
            parse_server_line("/private alice: hi: there"),
            ClientEvent::MessageReceived { from, text, is_private: true } if from == "alice" && text == "hi: there"
        ));
        assert!(matches!(
            parse_server_line("bob joined the chat"),
            ClientEvent::Presence { name, joined: true } if name == "bob"
        ));
        assert!(matches!(
            parse_server_line("bob left the chat"),
            ClientEvent::Presence { name, joined: false } if name == "bob"
        ));
        assert!(matches!(
            parse_server_line("alice: bob joined the chat"),
            ClientEvent::MessageReceived { from, is_private: false, .. } if from == "alice"
        ));
        assert!(matches!(parse_server_line("Server is full"), ClientEvent::Notice { .. }));
        // 본문이 입장 알림처럼 보여도 공개 메시지
        assert!(matches!(
            parse_server_line("bob: joined the chat"),
            ClientEvent::MessageReceived { from, text, is_private: false } if from == "bob" && text == "joined the chat"
        ));
        assert!(matches!(
            parse_server_line("carol: left the chat"),
            ClientEvent::MessageReceived { from, is_private: false, .. } if from == "carol"
        ));
    }

    #[test]
    fn test_parse_transfer_offer() {
        let event = parse_server_line("/private alice: File bob 127.0.0.1 40000 a.txt 12");
        let ClientEvent::TransferOffered { from, descriptor } = event else {
            panic!("not an offer");
        };
        assert_eq!(from, "alice");
        assert_eq!(descriptor.port, 40000);
        assert_eq!(descriptor.file_size, 12);

        // 형식이 틀리면 보통 귓속말
        assert!(matches!(
            parse_server_line("/private alice: File me later"),
            ClientEvent::MessageReceived { is_private: true, .. }
        ));
    }

    #[test]
    fn test_events_serialize_as_tagged_json() {
        let json = serde_json::to_string(&ClientEvent::MessageReceived {
            from: "alice".to_string(),
            text: "hi".to_string(),
            is_private: true,
        })
        .unwrap();
        assert!(json.contains("\"event\":\"message_received\""));

        let json = serde_json::to_string(&ClientEvent::Transfer(TransferEvent::Failed {
            id: 1,
            direction: TransferDirection::Outgoing,
            file_name: "a.txt".to_string(),
            reason: "연결 종료".to_string(),
        }))
        .unwrap();
        assert!(json.contains("\"event\":\"transfer\""));
        assert!(json.contains("\"transfer\":\"failed\""));
        assert!(json.contains("\"direction\":\"outgoing\""));
    }

    #[tokio::test]
    async fn test_private_message_and_file_transfer_between_clients() {
        let addr = start_broker().await;
        let src_dir = tempfile::tempdir().unwrap();
        let dst_dir = tempfile::tempdir().unwrap();

        let (alice, mut alice_events) = ChatClient::connect(client_config(addr, src_dir.path()), "alice")
            .await
            .unwrap();
        wait_for(&mut alice_events, |e| matches!(e, ClientEvent::DirectoryChanged { .. })).await;

        let (bob, mut bob_events) = ChatClient::connect(client_config(addr, dst_dir.path()), "bob")
            .await
            .unwrap();
        wait_for(&mut alice_events, |e| {
            matches!(e, ClientEvent::DirectoryChanged { names } if names.len() == 2)
        })
        .await;

        alice.send_private("bob", "hello").unwrap();
        let event = wait_for(&mut bob_events, |e| matches!(e, ClientEvent::MessageReceived { .. })).await;
        assert!(matches!(
            event,
            ClientEvent::MessageReceived { from, text, is_private: true } if from == "alice" && text == "hello"
        ));

        let data: Vec<u8> = (0..30_000u32).map(|i| (i % 199) as u8).collect();
        let path = src_dir.path().join("photo.png");
        std::fs::write(&path, &data).unwrap();

        let sending = alice.offer_file("bob", &path).await.unwrap();
        wait_for(&mut bob_events, |e| matches!(e, ClientEvent::TransferOffered { .. })).await;

        let offer = bob.take_offer().unwrap();
        assert_eq!(offer.from, "alice");
        assert_eq!(offer.descriptor.file_size, 30_000);
        assert_eq!(bob.pending_offers(), 0);

        let receiving = bob.accept_offer(offer);
        sending.await.unwrap().unwrap();
        receiving.await.unwrap().unwrap();

        assert_eq!(std::fs::read(dst_dir.path().join("photo.png")).unwrap(), data);
        wait_for(&mut bob_events, |e| {
            matches!(e, ClientEvent::Transfer(TransferEvent::Completed { .. }))
        })
        .await;

        bob.quit().await.unwrap();
        let event = wait_for(&mut alice_events, |e| matches!(e, ClientEvent::Presence { joined: false, .. })).await;
        assert!(matches!(event, ClientEvent::Presence { name, .. } if name == "bob"));
    }

    #[tokio::test]
    async fn test_rejected_offer_reports_failure() {
        let addr = start_broker().await;
        let dir = tempfile::tempdir().unwrap();

        let (alice, mut alice_events) = ChatClient::connect(client_config(addr, dir.path()), "alice")
            .await
            .unwrap();
        let (bob, mut bob_events) = ChatClient::connect(client_config(addr, dir.path()), "bob")
            .await
            .unwrap();
        wait_for(&mut alice_events, |e| {
            matches!(e, ClientEvent::DirectoryChanged { names } if names.len() == 2)
        })
        .await;

        let path = dir.path().join("big.bin");
        std::fs::write(&path, vec![1u8; 300_000]).unwrap();

        let sending = alice.offer_file("bob", &path).await.unwrap();
        wait_for(&mut bob_events, |e| matches!(e, ClientEvent::TransferOffered { .. })).await;
        let offer = bob.take_offer().unwrap();
        bob.reject_offer(&offer).await.unwrap();

        assert!(sending.await.unwrap().is_err());
        wait_for(&mut alice_events, |e| {
            matches!(e, ClientEvent::Transfer(TransferEvent::Failed { .. }))
        })
        .await;
    }

    #[tokio::test]
    async fn test_server_full_is_reported() {
        let broker = Arc::new(Broker::new(BrokerConfig {
            bind_addr: "127.0.0.1:0".parse().unwrap(),
            max_sessions: 1,
            ..BrokerConfig::default()
        }));
        let listener = broker.bind().await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move { broker.run(listener).await });

        let dir = tempfile::tempdir().unwrap();
        let (_alice, _events) = ChatClient::connect(client_config(addr, dir.path()), "alice")
            .await
            .unwrap();

        let err = ChatClient::connect(client_config(addr, dir.path()), "bob").await.err().unwrap();
        assert!(matches!(err, Error::ServerFull));
    }
}
