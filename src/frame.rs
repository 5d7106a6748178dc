//! 전송 채널 프레임 정의
//!
//! 모든 정수는 빅엔디언 i32
//! - 세그먼트: seq | length | payload
//! - ACK: ack_num | advertised_window

use bytes::{BufMut, Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::segment::{Segment, SeqNum};
use crate::{Error, Result};

/// 세그먼트 프레임 헤더 크기
pub const SEGMENT_HEADER_LEN: usize = 8;

/// ACK 프레임 크기
pub const ACK_FRAME_LEN: usize = 8;

/// 누적 ACK
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AckFrame {
    /// 연속으로 받은 마지막 시퀀스 (-1 이면 아직 없음)
    pub ack_num: i32,

    /// 수신측 광고 윈도우 (바이트)
    pub window: i32,
}

impl AckFrame {
    pub fn new(ack_num: i32, window: i32) -> Self {
        Self { ack_num, window }
    }

    /// 연속 수신된 시퀀스가 없으면 None
    pub fn acked_seq(&self) -> Option<SeqNum> {
        if self.ack_num < 0 {
            None
        } else {
            Some(self.ack_num as SeqNum)
        }
    }

    /// 음수 윈도우는 0으로 취급
    pub fn window_bytes(&self) -> u32 {
        self.window.max(0) as u32
    }

    pub fn to_bytes(&self) -> [u8; ACK_FRAME_LEN] {
        let mut buf = [0u8; ACK_FRAME_LEN];
        buf[..4].copy_from_slice(&self.ack_num.to_be_bytes());
        buf[4..].copy_from_slice(&self.window.to_be_bytes());
        buf
    }

    pub async fn write_to<W: AsyncWrite + Unpin>(&self, writer: &mut W) -> Result<()> {
        writer.write_all(&self.to_bytes()).await?;
        writer.flush().await?;
        Ok(())
    }

    /// 스트림에서 ACK 하나 읽기. 깨끗한 EOF 는 `ConnectionClosed`.
    pub async fn read_from<R: AsyncRead + Unpin>(reader: &mut R) -> Result<Self> {
        let mut buf = [0u8; ACK_FRAME_LEN];
        read_exact_or_closed(reader, &mut buf).await?;
        Ok(Self {
            ack_num: i32::from_be_bytes([buf[0], buf[1], buf[2], buf[3]]),
            window: i32::from_be_bytes([buf[4], buf[5], buf[6], buf[7]]),
        })
    }
}

/// 세그먼트를 프레임 바이트로 인코딩
pub fn encode_segment(segment: &Segment, buf: &mut BytesMut) {
    buf.reserve(SEGMENT_HEADER_LEN + segment.len());
    buf.put_i32(segment.seq as i32);
    buf.put_i32(segment.len() as i32);
    buf.put_slice(&segment.payload);
}

/// 세그먼트 프레임 쓰기
pub async fn write_segment<W: AsyncWrite + Unpin>(writer: &mut W, segment: &Segment) -> Result<()> {
    let mut buf = BytesMut::with_capacity(SEGMENT_HEADER_LEN + segment.len());
    encode_segment(segment, &mut buf);
    writer.write_all(&buf).await?;
    writer.flush().await?;
    Ok(())
}

/// 세그먼트 프레임 읽기
///
/// 음수 seq/length 는 `MalformedFrame`, `max_len` 초과는 `FrameTooLarge`.
pub async fn read_segment<R: AsyncRead + Unpin>(reader: &mut R, max_len: usize) -> Result<Segment> {
    let mut header = [0u8; SEGMENT_HEADER_LEN];
    read_exact_or_closed(reader, &mut header).await?;

    let seq = i32::from_be_bytes([header[0], header[1], header[2], header[3]]);
    let length = i32::from_be_bytes([header[4], header[5], header[6], header[7]]);

    if seq < 0 || length < 0 {
        return Err(Error::MalformedFrame { seq, length });
    }
    let length = length as usize;
    if length > max_len {
        return Err(Error::FrameTooLarge { length, max_len });
    }

    let mut payload = BytesMut::zeroed(length);
    read_exact_or_closed(reader, &mut payload).await?;

    Ok(Segment::new(seq as SeqNum, Bytes::from(payload)))
}

async fn read_exact_or_closed<R: AsyncRead + Unpin>(reader: &mut R, buf: &mut [u8]) -> Result<()> {
    match reader.read_exact(buf).await {
        Ok(_) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => Err(Error::ConnectionClosed),
        Err(e) => Err(Error::Io(e)),
    }
}
