//! 세그먼트 수신자
//!
//! - 순서대로 온 세그먼트는 바로 출력에 씀
//! - 앞선 세그먼트는 재조립 버퍼에 보관, 빈자리가 채워지면 한꺼번에 씀
//! - 세그먼트마다 누적 ACK + 광고 윈도우 전송

use std::collections::BTreeMap;

use bytes::Bytes;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::frame::{read_segment, AckFrame};
use crate::segment::{Segment, SeqNum};
use crate::stats::{TransferStats, TransferUpdate};
use crate::{Config, Error, Result};

/// 세그먼트 하나를 받은 결과
#[derive(Debug, PartialEq, Eq)]
pub enum Delivery {
    /// 순서대로 출력할 페이로드들 (방금 받은 것 + 버퍼에서 빠져나온 것)
    InOrder(Vec<Bytes>),
    /// 앞선 세그먼트라 보관함
    Buffered,
    /// 이미 전달했거나 이미 보관 중
    Duplicate,
}

/// 순서 밖 세그먼트 재조립 버퍼
///
/// 보관된 모든 키는 expected 보다 큼
#[derive(Debug, Default)]
pub struct ReassemblyBuffer {
    expected: SeqNum,
    pending: BTreeMap<SeqNum, Bytes>,
    pending_bytes: u64,
}

impl ReassemblyBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    /// 다음에 기다리는 시퀀스
    pub fn expected_seq(&self) -> SeqNum {
        self.expected
    }

    /// 연속으로 전달된 마지막 시퀀스
    pub fn last_delivered(&self) -> Option<SeqNum> {
        self.expected.checked_sub(1)
    }

    /// 보관 중인 세그먼트 수
    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    /// 보관 중인 페이로드 바이트 합
    pub fn pending_bytes(&self) -> u64 {
        self.pending_bytes
    }

    /// 이 시퀀스를 받으면 새로 보관하게 되는지
    pub fn would_buffer(&self, seq: SeqNum) -> bool {
        seq > self.expected && !self.pending.contains_key(&seq)
    }

    pub fn accept(&mut self, segment: Segment) -> Delivery {
        let Segment { seq, payload } = segment;

        if seq < self.expected {
            return Delivery::Duplicate;
        }

        if seq > self.expected {
            if self.pending.contains_key(&seq) {
                return Delivery::Duplicate;
            }
            self.pending_bytes += payload.len() as u64;
            self.pending.insert(seq, payload);
            return Delivery::Buffered;
        }

        let mut ready = vec![payload];
        self.expected = self.expected.wrapping_add(1);

        while let Some(next) = self.pending.remove(&self.expected) {
            self.pending_bytes -= next.len() as u64;
            ready.push(next);
            self.expected = self.expected.wrapping_add(1);
        }

        Delivery::InOrder(ready)
    }
}

/// 광고 윈도우 계산
///
/// 재조립 버퍼가 high water 를 넘으면 절반 (하한까지),
/// low water 미만이면 두 배 (상한까지)
#[derive(Debug, Clone)]
pub struct ReceiveWindow {
    window: u32,
    min: u32,
    max: u32,
    high_water: usize,
    low_water: usize,
}

impl ReceiveWindow {
    pub fn new(config: &Config) -> Self {
        Self {
            window: config.max_receive_window,
            min: config.min_receive_window.min(config.max_receive_window),
            max: config.max_receive_window,
            high_water: config.reassembly_high_water,
            low_water: config.reassembly_low_water,
        }
    }

    pub fn current(&self) -> u32 {
        self.window
    }

    /// 보관 중인 세그먼트 수를 보고 윈도우 갱신
    pub fn update(&mut self, pending: usize) -> u32 {
        if pending > self.high_water {
            self.window = (self.window / 2).max(self.min);
        } else if pending < self.low_water {
            self.window = self.window.saturating_mul(2).min(self.max);
        }
        self.window
    }
}

/// 세그먼트 수신자
pub struct SegmentReceiver {
    config: Config,
    updates: Option<mpsc::UnboundedSender<TransferUpdate>>,
}

impl SegmentReceiver {
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

    /// `total_bytes` 를 모두 받을 때까지 `stream` 에서 읽어 `sink` 에 씀
    ///
    /// 선언된 크기를 넘는 바이트는 쓰지 않음.
    /// 보관분과 기록분의 합이 선언된 크기를 넘게 하는 순서 밖 세그먼트는
    /// 프로토콜 위반으로 보고 `SegmentBeyondTotal` 로 끝냄.
    pub async fn receive<S, W>(&self, mut stream: S, mut sink: W, total_bytes: u64) -> Result<TransferStats>
    where
        S: AsyncRead + AsyncWrite + Unpin,
        W: AsyncWrite + Unpin,
    {
        let mut stats = TransferStats::new(total_bytes);
        let mut buffer = ReassemblyBuffer::new();
        let mut window = ReceiveWindow::new(&self.config);

        info!("Segment receiver started: expecting {} bytes", total_bytes);

        while stats.bytes_written < total_bytes {
            let segment = read_segment(&mut stream, self.config.max_frame_len).await?;
            stats.segments_received += 1;

            let seq = segment.seq;
            if buffer.would_buffer(seq) {
                let buffered = buffer.pending_bytes() + segment.payload.len() as u64;
                if stats.bytes_written + buffered > total_bytes {
                    warn!(
                        "선언된 크기를 넘는 순서 밖 세그먼트 {}: 기록 {} + 보관 {} > {}",
                        seq, stats.bytes_written, buffered, total_bytes
                    );
                    return Err(Error::SegmentBeyondTotal { seq, buffered });
                }
            }

            match buffer.accept(segment) {
                Delivery::InOrder(payloads) => {
                    for payload in payloads {
                        let remaining = total_bytes - stats.bytes_written;
                        let take = (payload.len() as u64).min(remaining) as usize;
                        if take < payload.len() {
                            warn!("선언된 크기 초과: {} bytes 버림", payload.len() - take);
                        }
                        sink.write_all(&payload[..take]).await?;
                        stats.bytes_written += take as u64;
                    }
                    self.notify(TransferUpdate::Progress {
                        bytes: stats.bytes_written,
                        file_size: total_bytes,
                    });
                }
                Delivery::Buffered => {
                    stats.out_of_order_segments += 1;
                    debug!("순서 밖 세그먼트 {} 보관 (expected {})", seq, buffer.expected_seq());
                }
                Delivery::Duplicate => {
                    stats.duplicate_segments += 1;
                    debug!("중복 세그먼트 {} 무시", seq);
                }
            }

            let advertised = window.update(buffer.pending_len());
            let ack_num = buffer.last_delivered().map(|s| s as i32).unwrap_or(-1);
            AckFrame::new(ack_num, advertised.min(i32::MAX as u32) as i32)
                .write_to(&mut stream)
                .await?;
            stats.acks_sent += 1;
        }

        sink.flush().await?;
        let _ = stream.shutdown().await;

        info!(
            "수신 완료: {} bytes, {} segments ({} out of order, {} duplicate)",
            stats.bytes_written, stats.segments_received, stats.out_of_order_segments, stats.duplicate_segments
        );

        Ok(stats)
    }

    fn notify(&self, update: TransferUpdate) {
        if let Some(updates) = &self.updates {
            let _ = updates.send(update);
        }
    }
}
