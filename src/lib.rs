//! # renochat
//!
//! 중앙 브로커 채팅 + P2P 파일 전송
//!
//! ## 핵심 특징
//! - **세션 브로커**: 유일한 이름, 공개/귓속말 라우팅, 한 줄 텍스트 명령 프로토콜
//! - **세그먼트 전송**: 순서 보장 스트림 위의 자체 시퀀스, 누적 ACK, 재전송
//! - **Reno 스타일 혼잡제어**: slow start / fast recovery, 3 중복 ACK fast retransmit, RTO 백오프
//! - **수신 윈도우**: 재조립 버퍼 크기에 따라 광고 윈도우 자동 조정
//! - **단일 소유 상태**: 전송 상태는 송신 액터 하나가 소유, ACK 는 채널로 전달

pub mod broker;
pub mod client;
pub mod client_session;
pub mod config;
pub mod congestion;
pub mod coordinator;
pub mod directory;
pub mod error;
pub mod frame;
pub mod receiver;
pub mod router;
pub mod segment;
pub mod sender;
pub mod stats;
pub mod transfer;

pub use broker::{Broker, ShutdownHandle};
pub use client::{ChatClient, ClientEvent, IncomingOffer};
pub use config::{BrokerConfig, ClientConfig, Config};
pub use congestion::{CongestionController, Mode, RttEstimator};
pub use coordinator::{TransferCoordinator, TransferDescriptor, TransferDirection, TransferEvent};
pub use directory::{SessionDirectory, SessionHandle};
pub use error::{Error, Result};
pub use frame::AckFrame;
pub use receiver::SegmentReceiver;
pub use router::{Command, CommandRouter};
pub use segment::{Segment, SegmentBuilder, SeqNum};
pub use sender::SegmentSender;
pub use stats::{CwndSample, TransferStats};

/// 기본 세그먼트 크기 (바이트)
pub const DEFAULT_SEGMENT_SIZE: usize = 1024;

/// 기본 브로커 포트
pub const DEFAULT_BROKER_PORT: u16 = 12345;
