//! 세그먼트 송신자
//!
//! - 송신 액터 하나가 TransferSession 을 소유 (cwnd, 미확인 테이블, RTT)
//! - ACK 수신 태스크는 읽은 ACK 를 채널로 액터에 넘김
//! - 라운드마다: 윈도우 안에서 송신 → cwnd 진행 → 재전송 검사

use std::time::Instant;

use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::frame::{write_segment, AckFrame};
use crate::segment::{Segment, SegmentBuilder};
use crate::stats::{TransferStats, TransferUpdate};
use crate::transfer::{RetransmitReason, TransferSession};
use crate::{Config, Error, Result};

/// 송신 액터로 들어가는 명령
enum SenderCmd {
    Ack(AckFrame),
    Closed(Option<Error>),
}

/// 세그먼트 송신자
pub struct SegmentSender {
    config: Config,
    updates: Option<mpsc::UnboundedSender<TransferUpdate>>,
}

impl SegmentSender {
    pub fn new(config: Config) -> Self {
        Self {
            config,
            updates: None,
        }
    }

    /// 진행 알림 채널 연결
    pub fn with_updates(mut self, updates: mpsc::UnboundedSender<TransferUpdate>) -> Self {
        self.updates = Some(updates);
        self
    }

    /// `source` 에서 `file_size` 바이트를 읽어 `stream` 으로 전송
    ///
    /// 모든 바이트가 확인되면 통계를 돌려줌.
    /// 상대가 끊거나 진행 없이 transfer_timeout 이 지나면 실패.
    pub async fn send<S, R>(&self, stream: S, source: R, file_size: u64) -> Result<TransferStats>
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
        R: AsyncRead + Unpin,
    {
        let (read_half, mut write_half) = tokio::io::split(stream);
        let (cmd_tx, mut cmd_rx) = mpsc::channel::<SenderCmd>(1024);

        let ack_task = tokio::spawn(ack_loop(read_half, cmd_tx));

        info!(
            "Segment sender started: {} bytes, segment size {}",
            file_size, self.config.segment_size
        );

        let result = self.drive(&mut write_half, &mut cmd_rx, source, file_size).await;

        ack_task.abort();
        let _ = write_half.shutdown().await;

        match &result {
            Ok(stats) => info!("전송 완료: {}", stats.summary()),
            Err(e) => warn!("전송 실패: {}", e),
        }

        result
    }

    async fn drive<S, R>(
        &self,
        writer: &mut WriteHalf<S>,
        cmd_rx: &mut mpsc::Receiver<SenderCmd>,
        source: R,
        file_size: u64,
    ) -> Result<TransferStats>
    where
        S: AsyncRead + AsyncWrite,
        R: AsyncRead + Unpin,
    {
        let mut builder = SegmentBuilder::new(source, self.config.segment_size, file_size);
        let mut session = TransferSession::new(&self.config, file_size, Instant::now());

        let mut next_round = tokio::time::Instant::now();
        let mut write_failed: Option<Error> = None;

        loop {
            if session.is_complete() {
                return Ok(session.stats().clone());
            }

            tokio::select! {
                cmd = cmd_rx.recv() => match cmd {
                    Some(SenderCmd::Ack(frame)) => {
                        if let Some(segment) = session.on_ack(frame, Instant::now()) {
                            self.retransmit(writer, &segment, RetransmitReason::FastRetransmit, &mut write_failed).await;
                        }
                    }
                    Some(SenderCmd::Closed(err)) => {
                        if session.is_complete() {
                            continue;
                        }
                        return Err(err.or(write_failed).unwrap_or(Error::ConnectionClosed));
                    }
                    None => {
                        return Err(write_failed.unwrap_or(Error::ConnectionClosed));
                    }
                },
                _ = tokio::time::sleep_until(next_round) => {
                    let now = Instant::now();
                    if session.idle_for(now) > self.config.transfer_timeout() {
                        return Err(Error::TransferTimeout {
                            idle_ms: self.config.transfer_timeout_ms,
                        });
                    }

                    let sent_something = if write_failed.is_none() {
                        self.round(writer, &mut session, &mut builder, &mut write_failed).await?
                    } else {
                        false
                    };
                    next_round = tokio::time::Instant::now() + self.config.round_interval(sent_something);
                }
            }
        }
    }

    /// 송신 라운드 하나
    ///
    /// 새 세그먼트를 하나라도 보냈으면 true
    async fn round<S, R>(
        &self,
        writer: &mut WriteHalf<S>,
        session: &mut TransferSession,
        builder: &mut SegmentBuilder<R>,
        write_failed: &mut Option<Error>,
    ) -> Result<bool>
    where
        S: AsyncRead + AsyncWrite,
        R: AsyncRead + Unpin,
    {
        let cwnd = session.controller().cwnd() as usize;
        let mut sent = 0usize;

        while sent < cwnd && session.can_send() {
            // 소스 읽기 실패는 로컬 파일 I/O 에러이므로 그대로 실패
            let Some(segment) = builder.next_segment().await? else {
                break;
            };

            if let Err(e) = write_segment(writer, &segment).await {
                warn!("세그먼트 {} 송신 실패: {}", segment.seq, e);
                *write_failed = Some(e);
                return Ok(sent > 0);
            }

            session.record_sent(segment, Instant::now());
            sent += 1;
        }

        if sent > 0 {
            self.notify(TransferUpdate::Progress {
                bytes: session.bytes_sent(),
                file_size: session.file_size(),
            });
        }

        session.on_round();
        if let Some(sample) = session.stats().cwnd_history.last().copied() {
            self.notify(TransferUpdate::Round {
                sample,
                snapshot: session.snapshot(),
            });
        }

        if let Some((reason, segment)) = session.check_retransmit(Instant::now()) {
            self.retransmit(writer, &segment, reason, write_failed).await;
        }

        debug!(
            "round {}: sent {}, in flight {}, cwnd {}, ssthresh {}, rto {:?}",
            session.stats().rounds,
            sent,
            session.in_flight(),
            session.controller().cwnd(),
            session.controller().ssthresh(),
            session.controller().rto()
        );

        Ok(sent > 0)
    }

    async fn retransmit<S>(
        &self,
        writer: &mut WriteHalf<S>,
        segment: &Segment,
        reason: RetransmitReason,
        write_failed: &mut Option<Error>,
    ) where
        S: AsyncRead + AsyncWrite,
    {
        if write_failed.is_some() {
            return;
        }

        debug!("세그먼트 {} 재전송 ({:?})", segment.seq, reason);

        if let Err(e) = write_segment(writer, segment).await {
            warn!("세그먼트 {} 재전송 실패: {}", segment.seq, e);
            *write_failed = Some(e);
            return;
        }

        self.notify(TransferUpdate::Retransmit {
            seq: segment.seq,
            reason,
        });
    }

    fn notify(&self, update: TransferUpdate) {
        if let Some(updates) = &self.updates {
            let _ = updates.send(update);
        }
    }
}

/// ACK 수신 루프
///
/// 소켓이 닫히거나 에러가 나면 Closed 를 보내고 종료
async fn ack_loop<S: AsyncRead>(mut reader: ReadHalf<S>, cmd_tx: mpsc::Sender<SenderCmd>) {
    loop {
        match AckFrame::read_from(&mut reader).await {
            Ok(frame) => {
                if cmd_tx.send(SenderCmd::Ack(frame)).await.is_err() {
                    break;
                }
            }
            Err(Error::ConnectionClosed) => {
                debug!("ACK 스트림 종료");
                let _ = cmd_tx.send(SenderCmd::Closed(None)).await;
                break;
            }
            Err(e) => {
                warn!("ACK 수신 에러: {}", e);
                let _ = cmd_tx.send(SenderCmd::Closed(Some(e))).await;
                break;
            }
        }
    }
}
