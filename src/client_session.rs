//! 브로커 쪽 클라이언트 세션
//!
//! 연결 하나 = 태스크 하나. 소켓 쓰기는 writer 태스크만 하고,
//! 다른 세션은 SessionHandle 채널로 줄을 넣음.

use std::io;
use std::net::SocketAddr;
use std::sync::Arc;

use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader, ReadHalf};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::config::BrokerConfig;
use crate::directory::{sanitize_name, SessionDirectory, SessionHandle};
use crate::router::{CommandRouter, Dispatch};
use crate::{Error, Result};

/// 연결 하나의 수명 주기: 프롬프트 → 이름 등록 → 명령 루프 → 정리
pub struct ClientSession<S> {
    stream: S,
    peer: SocketAddr,
    config: Arc<BrokerConfig>,
    directory: Arc<SessionDirectory>,
    router: CommandRouter,
    shutdown: watch::Receiver<bool>,
}

/// 명령 루프가 끝난 이유
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SessionEnd {
    /// EOF, `/quit`, 브로커 종료
    Closed,
    /// 송신 대기열이 넘침 (읽지 않는 클라이언트)
    Overflow,
}

impl<S> ClientSession<S>
where
    S: AsyncRead + AsyncWrite + Send + 'static,
{
    pub fn new(
        stream: S,
        peer: SocketAddr,
        config: Arc<BrokerConfig>,
        directory: Arc<SessionDirectory>,
        router: CommandRouter,
        shutdown: watch::Receiver<bool>,
    ) -> Self {
        Self {
            stream,
            peer,
            config,
            directory,
            router,
            shutdown,
        }
    }

    pub async fn run(self) -> Result<()> {
        let Self {
            stream,
            peer,
            config,
            directory,
            router,
            mut shutdown,
        } = self;

        let (read_half, write_half) = tokio::io::split(stream);
        let (tx, rx) = mpsc::channel::<String>(config.outbound_queue.max(1));
        let writer = tokio::spawn(write_lines(write_half, rx));
        let mut lines = LineReader::new(read_half, config.max_line_len);

        let _ = tx.try_send(config.prompt.clone());

        // 이름을 받기 전에 끊기면 등록 없이 종료
        let Some(raw_name) = next_line(&mut lines, &mut shutdown).await? else {
            debug!("{} 이름 입력 전 종료", peer);
            drop(tx);
            let _ = writer.await;
            return Ok(());
        };

        let name = sanitize_name(&raw_name).unwrap_or_else(|| config.anonymous_name.clone());
        let handle = directory.register(&name, tx);
        info!("{} joined the chat ({})", handle.name(), peer);
        directory.announce_join(&handle);

        let result = command_loop(&mut lines, &mut shutdown, &router, &handle).await;

        directory.unregister(&handle);
        info!("{} left the chat", handle.name());
        directory.announce_leave(&handle);

        match result {
            Ok(SessionEnd::Overflow) => {
                // 읽지 않는 상대에게 남은 줄은 버리고 연결을 끊음
                warn!("{} 송신 대기열 초과로 연결 종료 ({})", handle.name(), peer);
                writer.abort();
                Ok(())
            }
            Ok(SessionEnd::Closed) => {
                finish_writer(handle, writer).await;
                Ok(())
            }
            Err(e) => {
                writer.abort();
                Err(e)
            }
        }
    }
}

async fn command_loop<R: AsyncRead>(
    lines: &mut LineReader<ReadHalf<R>>,
    shutdown: &mut watch::Receiver<bool>,
    router: &CommandRouter,
    handle: &SessionHandle,
) -> Result<SessionEnd> {
    loop {
        let line = tokio::select! {
            line = next_line(lines, shutdown) => line?,
            _ = handle.overflowed() => return Ok(SessionEnd::Overflow),
        };
        let Some(line) = line else {
            return Ok(SessionEnd::Closed);
        };
        if router.dispatch(handle, &line) == Dispatch::Quit {
            debug!("{} /quit", handle.name());
            return Ok(SessionEnd::Closed);
        }
    }
}

/// 다음 줄, EOF 또는 브로커 종료면 None
async fn next_line<R: AsyncRead + Unpin>(
    lines: &mut LineReader<R>,
    shutdown: &mut watch::Receiver<bool>,
) -> Result<Option<String>> {
    if *shutdown.borrow() {
        return Ok(None);
    }

    tokio::select! {
        line = lines.next_line() => line,
        _ = shutdown.changed() => Ok(None),
    }
}

/// 길이 제한이 있는 줄 읽기
///
/// 읽다 만 조각은 `buf` 에 남으므로 취소되어도 다음 호출이 이어서 읽음.
/// `\n` 없이 `max_len` 을 넘으면 `LineTooLong`.
pub(crate) struct LineReader<R> {
    inner: BufReader<R>,
    buf: Vec<u8>,
    max_len: usize,
}

impl<R: AsyncRead + Unpin> LineReader<R> {
    pub(crate) fn new(inner: R, max_len: usize) -> Self {
        Self {
            inner: BufReader::new(inner),
            buf: Vec::new(),
            max_len,
        }
    }

    /// 개행(`\n`, `\r\n`)을 뗀 다음 줄, EOF 면 None
    pub(crate) async fn next_line(&mut self) -> Result<Option<String>> {
        loop {
            let room = (self.max_len + 1).saturating_sub(self.buf.len()) as u64;
            let n = (&mut self.inner).take(room).read_until(b'\n', &mut self.buf).await?;

            if self.buf.last() == Some(&b'\n') {
                self.buf.pop();
                if self.buf.last() == Some(&b'\r') {
                    self.buf.pop();
                }
                return self.take_line().map(Some);
            }
            if self.buf.len() > self.max_len {
                return Err(Error::LineTooLong { max_len: self.max_len });
            }
            if n == 0 {
                // 개행 없이 끝난 마지막 조각도 한 줄로 취급
                if self.buf.is_empty() {
                    return Ok(None);
                }
                return self.take_line().map(Some);
            }
        }
    }

    fn take_line(&mut self) -> Result<String> {
        let bytes = std::mem::take(&mut self.buf);
        String::from_utf8(bytes).map_err(|e| Error::Io(io::Error::new(io::ErrorKind::InvalidData, e)))
    }
}

/// 줄 채널 → 소켓, 채널이 닫히면 쓰기 방향 종료
pub(crate) async fn write_lines<W: AsyncWrite + Unpin>(mut writer: W, mut rx: mpsc::Receiver<String>) {
    while let Some(line) = rx.recv().await {
        let mut buf = line.into_bytes();
        buf.push(b'\n');
        if let Err(e) = writer.write_all(&buf).await {
            warn!("줄 쓰기 실패: {}", e);
            return;
        }
        if let Err(e) = writer.flush().await {
            warn!("줄 flush 실패: {}", e);
            return;
        }
    }
    let _ = writer.shutdown().await;
}

/// 마지막 핸들을 놓고 writer 가 남은 줄을 다 쓸 때까지 기다림
async fn finish_writer(handle: SessionHandle, writer: JoinHandle<()>) {
    drop(handle);
    let _ = writer.await;
}
