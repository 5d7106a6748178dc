//! 프로토콜 설정

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::{DEFAULT_BROKER_PORT, DEFAULT_SEGMENT_SIZE};

/// 세그먼트 전송 설정
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// 세그먼트 크기 (바이트)
    pub segment_size: usize,

    /// 초기 혼잡 윈도우 (세그먼트 수)
    pub initial_cwnd: u32,

    /// 초기 slow start 임계값
    pub initial_ssthresh: u32,

    /// cwnd 상한 가드
    /// cwnd가 이 값에 도달하면 ssthresh = max(cwnd/2, 2), cwnd = ssthresh
    pub cwnd_ceiling: u32,

    /// fast retransmit 를 일으키는 중복 ACK 수
    pub dup_ack_threshold: u32,

    /// 초기 RTT 추정값 (밀리초)
    pub initial_rtt_ms: u64,

    /// 초기 RTT 분산 (밀리초)
    pub initial_rttvar_ms: u64,

    /// 초기 RTO (밀리초)
    pub initial_rto_ms: u64,

    /// RTO 하한 (밀리초)
    pub min_rto_ms: u64,

    /// RTO 상한 (밀리초)
    pub max_rto_ms: u64,

    /// 타임아웃 백오프 시 RTO 상한 (밀리초)
    pub rto_backoff_cap_ms: u64,

    /// 진행 없는 상태로 허용되는 최대 시간 (밀리초)
    pub transfer_timeout_ms: u64,

    /// 세그먼트를 보낸 라운드 뒤 대기 (밀리초)
    pub active_round_interval_ms: u64,

    /// 아무것도 못 보낸 라운드 뒤 대기 (밀리초)
    pub idle_round_interval_ms: u64,

    /// 수신측 초기/최대 광고 윈도우 (바이트)
    pub max_receive_window: u32,

    /// 수신측 최소 광고 윈도우 (바이트)
    pub min_receive_window: u32,

    /// 재조립 버퍼가 이 수를 넘으면 윈도우 축소
    pub reassembly_high_water: usize,

    /// 재조립 버퍼가 이 수 미만이면 윈도우 확대
    pub reassembly_low_water: usize,

    /// 허용하는 최대 페이로드 길이 (바이트)
    pub max_frame_len: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            segment_size: DEFAULT_SEGMENT_SIZE,
            initial_cwnd: 1,
            initial_ssthresh: 32,
            cwnd_ceiling: 41,
            dup_ack_threshold: 3,
            initial_rtt_ms: 100,
            initial_rttvar_ms: 50,
            initial_rto_ms: 200,
            min_rto_ms: 200,
            max_rto_ms: 60_000,
            rto_backoff_cap_ms: 10_000,
            transfer_timeout_ms: 60_000,
            active_round_interval_ms: 15,
            idle_round_interval_ms: 60,
            max_receive_window: 65_535,
            min_receive_window: 1024,
            reassembly_high_water: 50,
            reassembly_low_water: 10,
            max_frame_len: 16 * 1024 * 1024, // 16MB
        }
    }
}

impl Config {
    /// 새 설정 생성
    pub fn new() -> Self {
        Self::default()
    }

    /// 루프백용 설정 (짧은 라운드 간격)
    pub fn fast_local() -> Self {
        Self {
            active_round_interval_ms: 1,
            idle_round_interval_ms: 2,
            transfer_timeout_ms: 10_000,
            ..Self::default()
        }
    }

    /// 세그먼트 크기 변경
    pub fn with_segment_size(mut self, segment_size: usize) -> Self {
        self.segment_size = segment_size.max(1);
        self
    }

    pub fn transfer_timeout(&self) -> Duration {
        Duration::from_millis(self.transfer_timeout_ms)
    }

    /// 라운드 간 pacing 간격
    pub fn round_interval(&self, sent_something: bool) -> Duration {
        if sent_something {
            Duration::from_millis(self.active_round_interval_ms)
        } else {
            Duration::from_millis(self.idle_round_interval_ms)
        }
    }
}

/// 브로커 설정
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BrokerConfig {
    /// 리슨 주소
    pub bind_addr: SocketAddr,

    /// 접속 직후 보내는 프롬프트
    pub prompt: String,

    /// 이름이 비었을 때 사용하는 이름
    pub anonymous_name: String,

    /// 최대 동시 세션 수
    pub max_sessions: usize,

    /// 세션별 송신 대기열 (줄 수), 가득 차면 세션을 끊음
    pub outbound_queue: usize,

    /// 클라이언트 한 줄 최대 길이 (바이트)
    pub max_line_len: usize,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), DEFAULT_BROKER_PORT),
            prompt: "Enter your username:".to_string(),
            anonymous_name: "Anonymous".to_string(),
            max_sessions: 1024,
            outbound_queue: 1024,
            max_line_len: 64 * 1024,
        }
    }
}

/// 클라이언트 설정
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientConfig {
    /// 브로커 주소
    pub server_addr: SocketAddr,

    /// 파일 전송 랑데부 바인드 주소 (포트 0이면 자동 할당)
    pub rendezvous_bind: SocketAddr,

    /// 디스크립터에 광고할 IP
    pub advertise_ip: IpAddr,

    /// 상대가 접속할 때까지 기다리는 시간 (밀리초)
    pub accept_timeout_ms: u64,

    /// 받은 파일을 저장할 디렉터리
    pub download_dir: PathBuf,

    /// 전송 설정
    pub transport: Config,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            server_addr: SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), DEFAULT_BROKER_PORT),
            rendezvous_bind: SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), 0),
            advertise_ip: IpAddr::V4(Ipv4Addr::LOCALHOST),
            accept_timeout_ms: 120_000,
            download_dir: PathBuf::from("."),
            transport: Config::default(),
        }
    }
}

impl ClientConfig {
    pub fn accept_timeout(&self) -> Duration {
        Duration::from_millis(self.accept_timeout_ms)
    }
}
