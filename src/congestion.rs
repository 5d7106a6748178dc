//! Reno 계열 혼잡 제어 상태 머신
//!
//! 두 상태만 모델링함: `SlowStart`, `FastRecovery`.
//! 별도의 congestion avoidance 단계는 없고 FastRecovery 에서 라운드마다 cwnd += 1.
//!
//! I/O 없음. 송신 액터가 라운드/ACK/타임아웃 이벤트로 진행시킴.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::segment::SeqNum;
use crate::Config;

/// RTT 평활 계수
pub const RTT_ALPHA: f64 = 0.125;

/// RTT 분산 평활 계수
pub const RTT_BETA: f64 = 0.25;

/// 혼잡 제어 상태
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Mode {
    SlowStart,
    FastRecovery,
}

/// 수신한 ACK 분류
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AckKind {
    /// 마지막 누적 ACK 보다 큼
    New,
    /// 마지막 누적 ACK 와 같음
    Duplicate,
    /// 이미 지난 ACK
    Stale,
}

/// EWMA 기반 RTT/RTO 추정기 (단위: 밀리초)
#[derive(Debug, Clone)]
pub struct RttEstimator {
    rtt_ms: f64,
    rttvar_ms: f64,
    rto_ms: f64,
    min_rto_ms: f64,
    max_rto_ms: f64,
    backoff_cap_ms: f64,
}

impl RttEstimator {
    pub fn new(config: &Config) -> Self {
        Self {
            rtt_ms: config.initial_rtt_ms as f64,
            rttvar_ms: config.initial_rttvar_ms as f64,
            rto_ms: config.initial_rto_ms as f64,
            min_rto_ms: config.min_rto_ms as f64,
            max_rto_ms: config.max_rto_ms as f64,
            backoff_cap_ms: config.rto_backoff_cap_ms as f64,
        }
    }

    /// RTT 샘플 반영
    pub fn sample(&mut self, sample: Duration) {
        let sample_ms = sample.as_secs_f64() * 1000.0;

        // 분산은 갱신 전 rtt 기준
        self.rttvar_ms = (1.0 - RTT_BETA) * self.rttvar_ms + RTT_BETA * (sample_ms - self.rtt_ms).abs();
        self.rtt_ms = (1.0 - RTT_ALPHA) * self.rtt_ms + RTT_ALPHA * sample_ms;

        self.rto_ms = (self.rtt_ms + 4.0 * self.rttvar_ms).clamp(self.min_rto_ms, self.max_rto_ms);
    }

    /// 타임아웃 시 지수 백오프 (백오프 상한까지, 줄어들지는 않음)
    pub fn backoff(&mut self) {
        let cap = self.backoff_cap_ms.max(self.rto_ms);
        self.rto_ms = (self.rto_ms * 2.0).min(cap).min(self.max_rto_ms);
    }

    pub fn rtt(&self) -> Duration {
        Duration::from_secs_f64(self.rtt_ms / 1000.0)
    }

    pub fn rttvar(&self) -> Duration {
        Duration::from_secs_f64(self.rttvar_ms / 1000.0)
    }

    pub fn rto(&self) -> Duration {
        Duration::from_millis(self.rto_ms())
    }

    pub fn rto_ms(&self) -> u64 {
        self.rto_ms.round() as u64
    }
}

/// 외부 관찰용 스냅샷
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CongestionSnapshot {
    pub mode: Mode,
    pub cwnd: u32,
    pub ssthresh: u32,
    pub dup_acks: u32,
    pub last_acked: Option<SeqNum>,
    pub rtt_ms: f64,
    pub rto_ms: u64,
}

/// 혼잡 제어기
#[derive(Debug, Clone)]
pub struct CongestionController {
    mode: Mode,
    cwnd: u32,
    ssthresh: u32,
    dup_acks: u32,
    last_acked: Option<SeqNum>,
    ceiling: u32,
    dup_ack_threshold: u32,
    rtt: RttEstimator,
}

impl CongestionController {
    pub fn new(config: &Config) -> Self {
        Self {
            mode: Mode::SlowStart,
            cwnd: config.initial_cwnd.max(1),
            ssthresh: config.initial_ssthresh.max(2),
            dup_acks: 0,
            last_acked: None,
            ceiling: config.cwnd_ceiling.max(2),
            dup_ack_threshold: config.dup_ack_threshold.max(1),
            rtt: RttEstimator::new(config),
        }
    }

    pub fn mode(&self) -> Mode {
        self.mode
    }

    pub fn cwnd(&self) -> u32 {
        self.cwnd
    }

    pub fn ssthresh(&self) -> u32 {
        self.ssthresh
    }

    pub fn dup_acks(&self) -> u32 {
        self.dup_acks
    }

    pub fn last_acked(&self) -> Option<SeqNum> {
        self.last_acked
    }

    pub fn rto(&self) -> Duration {
        self.rtt.rto()
    }

    pub fn rtt(&self) -> &RttEstimator {
        &self.rtt
    }

    pub fn snapshot(&self) -> CongestionSnapshot {
        CongestionSnapshot {
            mode: self.mode,
            cwnd: self.cwnd,
            ssthresh: self.ssthresh,
            dup_acks: self.dup_acks,
            last_acked: self.last_acked,
            rtt_ms: self.rtt.rtt().as_secs_f64() * 1000.0,
            rto_ms: self.rtt.rto_ms(),
        }
    }

    /// 라운드 종료마다 호출
    ///
    /// 상한 가드가 발동했으면 true
    pub fn on_round(&mut self) -> bool {
        match self.mode {
            Mode::SlowStart => {
                self.cwnd = self.cwnd.saturating_mul(2);
                if self.cwnd >= self.ssthresh {
                    self.mode = Mode::FastRecovery;
                }
            }
            Mode::FastRecovery => {
                self.cwnd = self.cwnd.saturating_add(1);
            }
        }

        if self.cwnd >= self.ceiling {
            self.clamp_to_half();
            return true;
        }
        false
    }

    /// ACK 분류
    pub fn classify(&self, ack: SeqNum) -> AckKind {
        match self.last_acked {
            None => AckKind::New,
            Some(last) if ack > last => AckKind::New,
            Some(last) if ack == last => AckKind::Duplicate,
            Some(_) => AckKind::Stale,
        }
    }

    /// 새 누적 ACK 반영
    pub fn on_new_ack(&mut self, ack: SeqNum, rtt_sample: Option<Duration>) {
        if let Some(sample) = rtt_sample {
            self.rtt.sample(sample);
        }
        self.last_acked = Some(ack);
        self.dup_acks = 0;
    }

    /// 중복 ACK 반영
    ///
    /// 정확히 임계값에 도달한 순간에만 fast retransmit 대상 시퀀스를 돌려줌
    pub fn on_duplicate_ack(&mut self) -> Option<SeqNum> {
        let last = self.last_acked?;
        self.dup_acks += 1;

        if self.dup_acks == self.dup_ack_threshold {
            self.ssthresh = (self.cwnd / 2).max(2);
            self.cwnd = self.ssthresh + 3;
            self.mode = Mode::FastRecovery;
            return last.checked_add(1);
        }
        None
    }

    /// 재전송 타임아웃 반영
    pub fn on_timeout(&mut self) {
        self.ssthresh = (self.cwnd / 2).max(2);
        self.cwnd = 1;
        self.mode = Mode::SlowStart;
        self.dup_acks = 0;
        self.rtt.backoff();
    }

    /// cwnd 가 상한을 넘었는지
    pub fn exceeds_ceiling(&self) -> bool {
        self.cwnd > self.ceiling
    }

    /// 상한 가드: ssthresh = max(cwnd/2, 2), cwnd = ssthresh
    pub fn clamp_to_half(&mut self) {
        self.ssthresh = (self.cwnd / 2).max(2);
        self.cwnd = self.ssthresh;
    }
}
