//! 전송 세션 상태
//!
//! 미확인 세그먼트 테이블 + 혼잡 제어기.
//! 송신 액터 태스크 하나만 소유하고 변경함.

use std::collections::BTreeMap;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};

use crate::congestion::{AckKind, CongestionController, CongestionSnapshot};
use crate::frame::AckFrame;
use crate::segment::{Segment, SeqNum};
use crate::stats::TransferStats;
use crate::Config;

/// 재전송 사유
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RetransmitReason {
    /// 중복 ACK 임계값 도달
    FastRetransmit,
    /// RTO 만료
    Timeout,
    /// cwnd 상한 가드
    CeilingGuard,
}

/// 보냈지만 아직 누적 확인되지 않은 세그먼트
#[derive(Debug, Clone)]
struct Outstanding {
    segment: Segment,
    sent_at: Instant,
}

/// 파일 하나의 송신 상태
#[derive(Debug)]
pub struct TransferSession {
    file_size: u64,
    segment_size: usize,
    next_seq: SeqNum,
    bytes_sent: u64,
    bytes_acked: u64,
    receiver_window: u32,
    controller: CongestionController,
    outstanding: BTreeMap<SeqNum, Outstanding>,
    last_progress: Instant,
    stats: TransferStats,
}

impl TransferSession {
    pub fn new(config: &Config, file_size: u64, now: Instant) -> Self {
        Self {
            file_size,
            segment_size: config.segment_size.max(1),
            next_seq: 0,
            bytes_sent: 0,
            bytes_acked: 0,
            receiver_window: config.max_receive_window,
            controller: CongestionController::new(config),
            outstanding: BTreeMap::new(),
            last_progress: now,
            stats: TransferStats::new(file_size),
        }
    }

    pub fn file_size(&self) -> u64 {
        self.file_size
    }

    pub fn next_seq(&self) -> SeqNum {
        self.next_seq
    }

    pub fn bytes_sent(&self) -> u64 {
        self.bytes_sent
    }

    pub fn bytes_acked(&self) -> u64 {
        self.bytes_acked
    }

    pub fn receiver_window(&self) -> u32 {
        self.receiver_window
    }

    pub fn controller(&self) -> &CongestionController {
        &self.controller
    }

    pub fn snapshot(&self) -> CongestionSnapshot {
        self.controller.snapshot()
    }

    pub fn stats(&self) -> &TransferStats {
        &self.stats
    }

    pub fn in_flight(&self) -> usize {
        self.outstanding.len()
    }

    pub fn outstanding_seqs(&self) -> Vec<SeqNum> {
        self.outstanding.keys().copied().collect()
    }

    /// 모든 데이터를 보냈는지
    pub fn all_sent(&self) -> bool {
        self.bytes_sent >= self.file_size
    }

    /// 모든 데이터가 확인되었는지
    pub fn is_complete(&self) -> bool {
        self.all_sent() && self.outstanding.is_empty()
    }

    /// 유효 윈도우 (바이트): min(cwnd × segment_size, 수신 윈도우)
    pub fn effective_window(&self) -> u64 {
        let cwnd_bytes = self.controller.cwnd() as u64 * self.segment_size as u64;
        cwnd_bytes.min(self.receiver_window as u64)
    }

    /// 이번 라운드에 허용되는 비행 중 세그먼트 수
    ///
    /// 수신 윈도우가 세그먼트 하나보다 작아도 최소 하나는 허용
    pub fn admissible_segments(&self) -> usize {
        let by_window = self.effective_window().div_ceil(self.segment_size as u64);
        by_window.max(1) as usize
    }

    /// 새 세그먼트를 보낼 수 있는지
    pub fn can_send(&self) -> bool {
        !self.all_sent() && self.outstanding.len() < self.admissible_segments()
    }

    /// 새 세그먼트 송신 기록
    pub fn record_sent(&mut self, segment: Segment, now: Instant) {
        self.next_seq = segment.seq.wrapping_add(1);
        self.bytes_sent += segment.len() as u64;
        self.stats.segments_sent += 1;
        self.stats.bytes_sent += segment.len() as u64;
        self.outstanding.insert(
            segment.seq,
            Outstanding {
                segment,
                sent_at: now,
            },
        );
    }

    /// ACK 처리
    ///
    /// fast retransmit 대상이 있으면 돌려줌 (송신 시각은 now 로 갱신됨)
    pub fn on_ack(&mut self, frame: AckFrame, now: Instant) -> Option<Segment> {
        self.receiver_window = frame.window_bytes();
        self.stats.acks_received += 1;

        let ack = frame.acked_seq()?;

        // 보낸 적 없는 시퀀스에 대한 ACK 는 무시
        if ack >= self.next_seq {
            return None;
        }

        match self.controller.classify(ack) {
            AckKind::New => {
                let sample = self.outstanding.get(&ack).map(|o| now.saturating_duration_since(o.sent_at));
                self.controller.on_new_ack(ack, sample);
                self.retire_through(ack);
                self.last_progress = now;
                None
            }
            AckKind::Duplicate => {
                self.stats.duplicate_acks += 1;
                let seq = self.controller.on_duplicate_ack()?;
                let segment = self.touch(seq, now)?;
                self.stats.fast_retransmits += 1;
                Some(segment)
            }
            AckKind::Stale => None,
        }
    }

    /// 라운드 종료: cwnd 진행 + cwnd 기록
    pub fn on_round(&mut self) -> bool {
        let clamped = self.controller.on_round();
        self.stats.rounds += 1;
        self.stats.record_cwnd(self.controller.cwnd());
        clamped
    }

    /// 재전송 검사
    ///
    /// 1. cwnd 가 상한을 넘어 있으면 가장 오래된 세그먼트를 재전송하고 절반으로 줄임
    /// 2. 가장 오래된 미확인 세그먼트가 RTO 를 넘겼으면 타임아웃 처리
    pub fn check_retransmit(&mut self, now: Instant) -> Option<(RetransmitReason, Segment)> {
        if self.controller.exceeds_ceiling() {
            self.controller.clamp_to_half();
            if let Some(seq) = self.oldest_outstanding() {
                let segment = self.touch(seq, now)?;
                self.stats.ceiling_retransmits += 1;
                return Some((RetransmitReason::CeilingGuard, segment));
            }
        }

        let (seq, sent_at) = self
            .outstanding
            .first_key_value()
            .map(|(seq, o)| (*seq, o.sent_at))?;

        if now.saturating_duration_since(sent_at) > self.controller.rto() {
            self.controller.on_timeout();
            let segment = self.touch(seq, now)?;
            self.stats.timeout_retransmits += 1;
            return Some((RetransmitReason::Timeout, segment));
        }

        None
    }

    /// 마지막 진행 이후 경과 시간
    pub fn idle_for(&self, now: Instant) -> Duration {
        now.saturating_duration_since(self.last_progress)
    }

    fn oldest_outstanding(&self) -> Option<SeqNum> {
        self.outstanding.keys().next().copied()
    }

    /// 재전송할 세그먼트 복사본 + 송신 시각 갱신
    fn touch(&mut self, seq: SeqNum, now: Instant) -> Option<Segment> {
        let entry = self.outstanding.get_mut(&seq)?;
        entry.sent_at = now;
        Some(entry.segment.clone())
    }

    /// seq <= ack 인 항목 모두 제거
    fn retire_through(&mut self, ack: SeqNum) {
        let remaining = match ack.checked_add(1) {
            Some(next) => self.outstanding.split_off(&next),
            None => BTreeMap::new(),
        };
        let retired = std::mem::replace(&mut self.outstanding, remaining);

        let retired_bytes: u64 = retired.values().map(|o| o.segment.len() as u64).sum();
        self.bytes_acked += retired_bytes;
        self.stats.bytes_acked += retired_bytes;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::congestion::Mode;
    use bytes::Bytes;

    fn seg(seq: SeqNum) -> Segment {
        Segment::new(seq, Bytes::from(vec![seq as u8; 10]))
    }

    fn session_with_cwnd4(now: Instant) -> TransferSession {
        let config = Config::default().with_segment_size(10);
        let mut session = TransferSession::new(&config, 100, now);
        session.on_round();
        session.on_round();
        assert_eq!(session.controller().cwnd(), 4);
        session
    }

    #[test]
    fn test_initial_window_admits_one_segment() {
        let now = Instant::now();
        let config = Config::default().with_segment_size(10);
        let mut session = TransferSession::new(&config, 100, now);

        assert!(session.can_send());
        session.record_sent(seg(0), now);
        assert!(!session.can_send());
        assert_eq!(session.next_seq(), 1);
    }

    #[test]
    fn test_cumulative_ack_retires_prefix() {
        let now = Instant::now();
        let mut session = session_with_cwnd4(now);
        for seq in 0..4 {
            session.record_sent(seg(seq), now);
        }

        assert!(session.on_ack(AckFrame::new(2, 65535), now).is_none());
        assert_eq!(session.outstanding_seqs(), vec![3]);
        assert_eq!(session.bytes_acked(), 30);
        assert_eq!(session.controller().last_acked(), Some(2));
    }

    #[test]
    fn test_triple_duplicate_ack_fast_retransmit() {
        let now = Instant::now();
        let mut session = session_with_cwnd4(now);
        for seq in 0..4 {
            session.record_sent(seg(seq), now);
        }
        session.on_ack(AckFrame::new(0, 65535), now);

        assert!(session.on_ack(AckFrame::new(0, 65535), now).is_none());
        assert!(session.on_ack(AckFrame::new(0, 65535), now).is_none());
        let retransmitted = session.on_ack(AckFrame::new(0, 65535), now);

        assert_eq!(retransmitted.map(|s| s.seq), Some(1));
        assert_eq!(session.controller().cwnd(), 5);
        assert_eq!(session.controller().ssthresh(), 2);
        assert_eq!(session.stats().fast_retransmits, 1);

        assert!(session.on_ack(AckFrame::new(0, 65535), now).is_none());
        assert_eq!(session.stats().fast_retransmits, 1);
    }

    #[test]
    fn test_timeout_retransmits_oldest() {
        let start = Instant::now();
        let mut session = session_with_cwnd4(start);
        session.record_sent(seg(0), start);
        session.record_sent(seg(1), start);

        assert!(session.check_retransmit(start + Duration::from_millis(100)).is_none());

        let later = start + Duration::from_millis(300);
        let (reason, segment) = session.check_retransmit(later).unwrap();
        assert_eq!(reason, RetransmitReason::Timeout);
        assert_eq!(segment.seq, 0);
        assert_eq!(session.controller().cwnd(), 1);
        assert_eq!(session.controller().mode(), Mode::SlowStart);
        assert_eq!(session.controller().rto(), Duration::from_millis(400));

        // 재전송 시각이 갱신되어 곧바로 다시 타임아웃 나지 않음
        assert!(session.check_retransmit(later + Duration::from_millis(10)).is_none());
    }

    #[test]
    fn test_ceiling_guard_retransmits_oldest_outstanding() {
        // cwnd 가 상한을 넘은 채로 재전송 검사에 들어오면
        // 타임아웃과 무관하게 가장 오래된 세그먼트를 재전송함
        let now = Instant::now();
        let config = Config {
            cwnd_ceiling: 4,
            ..Config::default().with_segment_size(10)
        };
        let mut session = TransferSession::new(&config, 100, now);
        session.on_round();
        session.on_round();
        assert_eq!(session.controller().cwnd(), 2);

        session.record_sent(seg(0), now);
        session.record_sent(seg(1), now);
        session.on_ack(AckFrame::new(0, 65535), now);
        session.record_sent(seg(2), now);
        for _ in 0..3 {
            session.on_ack(AckFrame::new(0, 65535), now);
        }
        assert_eq!(session.controller().cwnd(), 5);

        let (reason, segment) = session.check_retransmit(now).unwrap();
        assert_eq!(reason, RetransmitReason::CeilingGuard);
        assert_eq!(segment.seq, 1);
        assert_eq!(session.controller().cwnd(), 2);
        assert_eq!(session.stats().ceiling_retransmits, 1);
    }

    #[test]
    fn test_ack_for_unsent_sequence_ignored() {
        let now = Instant::now();
        let mut session = session_with_cwnd4(now);
        session.record_sent(seg(0), now);

        session.on_ack(AckFrame::new(7, 65535), now);
        assert_eq!(session.controller().last_acked(), None);
        assert_eq!(session.in_flight(), 1);
    }

    #[test]
    fn test_receiver_window_limits_admission() {
        let now = Instant::now();
        let mut session = session_with_cwnd4(now);
        session.record_sent(seg(0), now);
        session.on_ack(AckFrame::new(-1, 10), now);

        assert_eq!(session.effective_window(), 10);
        assert_eq!(session.admissible_segments(), 1);
        assert!(!session.can_send());
    }

    #[test]
    fn test_complete_after_final_ack() {
        let now = Instant::now();
        let config = Config::default().with_segment_size(10);
        let mut session = TransferSession::new(&config, 10, now);
        session.record_sent(seg(0), now);
        assert!(session.all_sent());
        assert!(!session.is_complete());

        session.on_ack(AckFrame::new(0, 65535), now);
        assert!(session.is_complete());
    }
}
