//! 세그먼트 정의
//!
//! - Segment: 시퀀스 번호 + 페이로드, 전송 후 불변
//! - SegmentBuilder: 바이트 소스를 segment_size 단위로 잘라냄

use bytes::{Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt};

/// 세그먼트 시퀀스 번호
pub type SeqNum = u32;

/// 전송 단위
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Segment {
    /// 시퀀스 번호
    pub seq: SeqNum,

    /// 페이로드
    pub payload: Bytes,
}

impl Segment {
    pub fn new(seq: SeqNum, payload: Bytes) -> Self {
        Self { seq, payload }
    }

    pub fn len(&self) -> usize {
        self.payload.len()
    }

    pub fn is_empty(&self) -> bool {
        self.payload.is_empty()
    }
}

/// 바이트 소스를 세그먼트로 분할
#[derive(Debug)]
pub struct SegmentBuilder<R> {
    source: R,
    segment_size: usize,
    next_seq: SeqNum,
    total_bytes: u64,
    bytes_cut: u64,
}

impl<R: AsyncRead + Unpin> SegmentBuilder<R> {
    /// `total_bytes` 는 외부에서 알려진 파일 크기
    pub fn new(source: R, segment_size: usize, total_bytes: u64) -> Self {
        Self {
            source,
            segment_size: segment_size.max(1),
            next_seq: 0,
            total_bytes,
            bytes_cut: 0,
        }
    }

    /// 다음에 부여할 시퀀스 번호
    pub fn next_seq(&self) -> SeqNum {
        self.next_seq
    }

    /// 잘라낸 바이트 수
    pub fn bytes_cut(&self) -> u64 {
        self.bytes_cut
    }

    pub fn is_exhausted(&self) -> bool {
        self.bytes_cut >= self.total_bytes
    }

    /// 다음 세그먼트 읽기
    ///
    /// 마지막 세그먼트는 segment_size 보다 짧을 수 있음.
    /// 선언된 크기 전에 소스가 끝나면 `UnexpectedEof`.
    pub async fn next_segment(&mut self) -> std::io::Result<Option<Segment>> {
        if self.is_exhausted() {
            return Ok(None);
        }

        let remaining = self.total_bytes - self.bytes_cut;
        let want = (self.segment_size as u64).min(remaining) as usize;

        let mut buf = BytesMut::zeroed(want);
        let mut filled = 0;
        while filled < want {
            let n = self.source.read(&mut buf[filled..]).await?;
            if n == 0 {
                return Err(std::io::Error::new(
                    std::io::ErrorKind::UnexpectedEof,
                    format!(
                        "source ended at {} of {} bytes",
                        self.bytes_cut + filled as u64,
                        self.total_bytes
                    ),
                ));
            }
            filled += n;
        }

        let segment = Segment::new(self.next_seq, buf.freeze());
        self.next_seq = self.next_seq.wrapping_add(1);
        self.bytes_cut += want as u64;

        Ok(Some(segment))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_split_into_segments() {
        let data: Vec<u8> = (0..250).map(|i| i as u8).collect();
        let mut builder = SegmentBuilder::new(&data[..], 100, data.len() as u64);

        let mut segments = Vec::new();
        while let Some(segment) = builder.next_segment().await.unwrap() {
            segments.push(segment);
        }

        assert_eq!(segments.len(), 3);
        assert_eq!(segments[0].seq, 0);
        assert_eq!(segments[2].seq, 2);
        assert_eq!(segments[2].len(), 50);

        let joined: Vec<u8> = segments.iter().flat_map(|s| s.payload.to_vec()).collect();
        assert_eq!(joined, data);
        assert!(builder.is_exhausted());
    }

    #[tokio::test]
    async fn test_empty_source() {
        let mut builder = SegmentBuilder::new(&b""[..], 1024, 0);
        assert!(builder.next_segment().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_short_source_is_error() {
        let data = [1u8; 10];
        let mut builder = SegmentBuilder::new(&data[..], 8, 20);
        assert!(builder.next_segment().await.unwrap().is_some());

        let err = builder.next_segment().await.unwrap_err();
        assert_eq!(err.kind(), std::io::ErrorKind::UnexpectedEof);
    }
}
