//! 채팅 브로커
//!
//! 명시적 컨텍스트(설정, 디렉터리, 라우터, 종료 신호)를 각 세션에 넘김.
//! 전역 상태 없음.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::client_session::ClientSession;
use crate::config::BrokerConfig;
use crate::directory::SessionDirectory;
use crate::router::CommandRouter;
use crate::Result;

/// 정원 초과 시 보내는 줄
pub const SERVER_FULL_LINE: &str = "Server is full";

/// 브로커 종료 핸들
#[derive(Clone)]
pub struct ShutdownHandle {
    tx: Arc<watch::Sender<bool>>,
}

impl ShutdownHandle {
    pub fn shutdown(&self) {
        self.tx.send_replace(true);
    }
}

/// 살아 있는 연결 수 (drop 시 감소)
struct ConnectionGuard {
    connections: Arc<AtomicUsize>,
}

impl Drop for ConnectionGuard {
    fn drop(&mut self) {
        let remaining = self.connections.fetch_sub(1, Ordering::SeqCst) - 1;
        info!("Client disconnected. Total clients: {}", remaining);
    }
}

/// 채팅 브로커
pub struct Broker {
    config: Arc<BrokerConfig>,
    directory: Arc<SessionDirectory>,
    router: CommandRouter,
    connections: Arc<AtomicUsize>,
    shutdown_tx: Arc<watch::Sender<bool>>,
}

impl Broker {
    pub fn new(config: BrokerConfig) -> Self {
        let directory = Arc::new(SessionDirectory::new());
        let router = CommandRouter::new(Arc::clone(&directory));
        let (shutdown_tx, _) = watch::channel(false);

        Self {
            config: Arc::new(config),
            directory,
            router,
            connections: Arc::new(AtomicUsize::new(0)),
            shutdown_tx: Arc::new(shutdown_tx),
        }
    }

    pub fn directory(&self) -> &Arc<SessionDirectory> {
        &self.directory
    }

    /// 현재 연결 수
    pub fn connections(&self) -> usize {
        self.connections.load(Ordering::SeqCst)
    }

    pub fn shutdown_handle(&self) -> ShutdownHandle {
        ShutdownHandle {
            tx: Arc::clone(&self.shutdown_tx),
        }
    }

    /// 설정된 주소로 바인드
    pub async fn bind(&self) -> Result<TcpListener> {
        let listener = TcpListener::bind(self.config.bind_addr).await?;
        info!("Chat server listening on {}", listener.local_addr()?);
        Ok(listener)
    }

    /// 바인드 후 종료 신호까지 서비스
    pub async fn serve(&self) -> Result<()> {
        let listener = self.bind().await?;
        self.run(listener).await
    }

    /// accept 루프
    pub async fn run(&self, listener: TcpListener) -> Result<()> {
        let mut shutdown = self.shutdown_tx.subscribe();

        loop {
            if *shutdown.borrow() {
                break;
            }

            tokio::select! {
                accepted = listener.accept() => match accepted {
                    Ok((stream, peer)) => {
                        if let Err(e) = stream.set_nodelay(true) {
                            debug!("nodelay 설정 실패 ({}): {}", peer, e);
                        }
                        self.handle_stream(stream, peer);
                    }
                    Err(e) => {
                        // accept 에러는 해당 연결만의 문제
                        warn!("accept 실패: {}", e);
                    }
                },
                _ = shutdown.changed() => break,
            }
        }

        info!("Chat server stopped ({} sessions)", self.directory.len());
        Ok(())
    }

    /// 연결 하나를 세션 태스크로 넘김
    pub fn handle_stream<S>(&self, mut stream: S, peer: SocketAddr)
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let active = self.connections.fetch_add(1, Ordering::SeqCst) + 1;
        let guard = ConnectionGuard {
            connections: Arc::clone(&self.connections),
        };

        if active > self.config.max_sessions {
            warn!("정원 초과로 {} 거부 ({} / {})", peer, active - 1, self.config.max_sessions);
            tokio::spawn(async move {
                let _guard = guard;
                let line = format!("{}\n", SERVER_FULL_LINE);
                let _ = stream.write_all(line.as_bytes()).await;
                let _ = stream.shutdown().await;
            });
            return;
        }

        info!("Client connected. Total clients: {}", active);

        let session = ClientSession::new(
            stream,
            peer,
            Arc::clone(&self.config),
            Arc::clone(&self.directory),
            self.router.clone(),
            self.shutdown_tx.subscribe(),
        );

        tokio::spawn(async move {
            let _guard = guard;
            if let Err(e) = session.run().await {
                warn!("세션 에러 ({}): {}", peer, e);
            }
        });
    }
}
