//! 전송 통계

use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};

use crate::congestion::CongestionSnapshot;
use crate::segment::SeqNum;
use crate::transfer::RetransmitReason;

/// 송수신 루프가 진행 중에 내보내는 알림
#[derive(Debug, Clone)]
pub enum TransferUpdate {
    /// 처리한 바이트 (송신: 보낸 바이트, 수신: 쓴 바이트)
    Progress { bytes: u64, file_size: u64 },

    /// 송신 라운드 종료
    Round {
        sample: CwndSample,
        snapshot: CongestionSnapshot,
    },

    /// 세그먼트 재전송
    Retransmit { seq: SeqNum, reason: RetransmitReason },
}

impl TransferUpdate {
    /// 진행률 (0.0 ~ 1.0)
    pub fn fraction(bytes: u64, file_size: u64) -> f64 {
        if file_size == 0 {
            return 1.0;
        }
        (bytes as f64 / file_size as f64).min(1.0)
    }
}

/// cwnd 기록 한 점 (라운드, cwnd)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CwndSample {
    pub round: u64,
    pub cwnd: u32,
}

/// 전송 하나에 대한 통계
///
/// 송신/수신 양쪽이 같은 구조체를 쓰고 자기 쪽 필드만 채움
#[derive(Debug, Clone)]
pub struct TransferStats {
    /// 시작 시간
    pub start_time: Instant,

    /// 선언된 파일 크기
    pub file_size: u64,

    // ── 송신측 ──
    /// 처음 전송한 세그먼트 수
    pub segments_sent: u64,

    /// 처음 전송한 바이트
    pub bytes_sent: u64,

    /// 누적 확인된 바이트
    pub bytes_acked: u64,

    /// 수신한 ACK 수
    pub acks_received: u64,

    /// 수신한 중복 ACK 수
    pub duplicate_acks: u64,

    /// fast retransmit 횟수
    pub fast_retransmits: u64,

    /// 타임아웃 재전송 횟수
    pub timeout_retransmits: u64,

    /// 상한 가드 재전송 횟수
    pub ceiling_retransmits: u64,

    /// 송신 라운드 수
    pub rounds: u64,

    /// 라운드별 cwnd
    pub cwnd_history: Vec<CwndSample>,

    // ── 수신측 ──
    /// 수신한 세그먼트 수 (중복 포함)
    pub segments_received: u64,

    /// 출력에 쓴 바이트
    pub bytes_written: u64,

    /// 순서가 앞선 세그먼트 수
    pub out_of_order_segments: u64,

    /// 이미 전달된 세그먼트 재수신 수
    pub duplicate_segments: u64,

    /// 보낸 ACK 수
    pub acks_sent: u64,
}

impl TransferStats {
    pub fn new(file_size: u64) -> Self {
        Self {
            start_time: Instant::now(),
            file_size,
            segments_sent: 0,
            bytes_sent: 0,
            bytes_acked: 0,
            acks_received: 0,
            duplicate_acks: 0,
            fast_retransmits: 0,
            timeout_retransmits: 0,
            ceiling_retransmits: 0,
            rounds: 0,
            cwnd_history: Vec::new(),
            segments_received: 0,
            bytes_written: 0,
            out_of_order_segments: 0,
            duplicate_segments: 0,
            acks_sent: 0,
        }
    }

    /// 경과 시간
    pub fn elapsed(&self) -> Duration {
        self.start_time.elapsed()
    }

    /// 현재 라운드의 cwnd 기록
    pub fn record_cwnd(&mut self, cwnd: u32) {
        self.cwnd_history.push(CwndSample {
            round: self.rounds,
            cwnd,
        });
    }

    /// 전체 재전송 횟수
    pub fn total_retransmits(&self) -> u64 {
        self.fast_retransmits + self.timeout_retransmits + self.ceiling_retransmits
    }

    /// 전체 처리율 (bytes/sec)
    pub fn throughput(&self) -> f64 {
        let elapsed = self.elapsed().as_secs_f64();
        if elapsed == 0.0 {
            return 0.0;
        }
        self.bytes_acked.max(self.bytes_written) as f64 / elapsed
    }

    /// 통계 요약 문자열
    pub fn summary(&self) -> String {
        format!(
            "Elapsed: {:.2}s | Size: {} | Sent: {} segs | Acked: {} B | Written: {} B | Retransmits: {} (fast {}, timeout {}, ceiling {}) | DupACKs: {} | Rounds: {} | Throughput: {:.2} MB/s",
            self.elapsed().as_secs_f64(),
            self.file_size,
            self.segments_sent,
            self.bytes_acked,
            self.bytes_written,
            self.total_retransmits(),
            self.fast_retransmits,
            self.timeout_retransmits,
            self.ceiling_retransmits,
            self.duplicate_acks,
            self.rounds,
            self.throughput() / 1_000_000.0,
        )
    }
}

impl Default for TransferStats {
    fn default() -> Self {
        Self::new(0)
    }
}
