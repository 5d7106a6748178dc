//! 에러 타입 정의

use thiserror::Error;

/// renochat 에러 타입
#[derive(Error, Debug)]
pub enum Error {
    #[error("IO 에러: {0}")]
    Io(#[from] std::io::Error),

    #[error("연결 종료")]
    ConnectionClosed,

    #[error("잘못된 프레임: seq={seq}, length={length}")]
    MalformedFrame { seq: i32, length: i32 },

    #[error("프레임 크기 초과: {length} > {max_len}")]
    FrameTooLarge { length: usize, max_len: usize },

    #[error("전송 타임아웃: {idle_ms}ms 동안 진행 없음")]
    TransferTimeout { idle_ms: u64 },

    #[error("유효하지 않은 전송 디스크립터: {0}")]
    InvalidDescriptor(String),

    #[error("랑데부 대기 타임아웃: {timeout_ms}ms")]
    RendezvousTimeout { timeout_ms: u64 },

    #[error("서버에 연결되지 않음")]
    NotConnected,

    #[error("서버 정원 초과")]
    ServerFull,

    #[error("줄 길이 초과: {max_len} 바이트")]
    LineTooLong { max_len: usize },

    #[error("송신 대기열 가득 참")]
    QueueFull,

    #[error("선언된 크기를 넘는 세그먼트: seq={seq}, 버퍼 {buffered} 바이트")]
    SegmentBeyondTotal { seq: u32, buffered: u64 },
}

/// Result 타입 별칭
pub type Result<T> = std::result::Result<T, Error>;
