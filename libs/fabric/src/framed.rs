use std::pin::Pin;
use std::task::Poll;

use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadBuf};

use crate::codec::Codec;
use crate::error::{Error, Result};

/// Largest frame accepted by default (100MB)
pub const DEFAULT_MAX_FRAME_LEN: usize = 100 * 1024 * 1024;

/// Largest frame the 4-byte length prefix can describe
pub const FRAME_LEN_LIMIT: usize = u32::MAX as usize;

/// Encode `message` with `codec`, refusing bodies above `max_frame_len`
pub fn encode_frame<C, T>(codec: &C, message: &T, max_frame_len: usize) -> Result<Vec<u8>>
where
    C: Codec,
    T: Serialize,
{
    let bytes = codec.encode(message)?;
    if bytes.len() > max_frame_len.min(FRAME_LEN_LIMIT) {
        return Err(Error::InvalidFrame(format!(
            "Message too large: {} bytes",
            bytes.len()
        )));
    }
    Ok(bytes)
}

/// Length-prefixed message stream
///
/// Messages are sent with a 4-byte big-endian length prefix followed by the
/// codec-encoded body.
pub struct Framed<S, C> {
    stream: S,
    codec: C,
    max_frame_len: usize,
}

impl<S, C> Framed<S, C>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
    C: Codec,
{
    pub fn new(stream: S, codec: C) -> Self {
        Self {
            stream,
            codec,
            max_frame_len: DEFAULT_MAX_FRAME_LEN,
        }
    }

    /// Reject frames above `max_frame_len` bytes in both directions
    ///
    /// Capped at [`FRAME_LEN_LIMIT`].
    pub fn with_max_frame_len(mut self, max_frame_len: usize) -> Self {
        self.max_frame_len = max_frame_len.min(FRAME_LEN_LIMIT);
        self
    }

    /// Encode one message, checking it against the frame size limit
    pub fn encode<T: Serialize>(&self, message: &T) -> Result<Vec<u8>> {
        encode_frame(&self.codec, message, self.max_frame_len)
    }

    /// Encode and write one message
    ///
    /// Encoding and size errors are reported before anything is written, so
    /// the stream stays usable after them.
    pub async fn send<T: Serialize>(&mut self, message: &T) -> Result<()> {
        let frame = self.encode(message)?;
        self.send_frame(frame).await
    }

    /// Write an already encoded frame body
    pub async fn send_frame(&mut self, frame: Vec<u8>) -> Result<()> {
        let len = u32::try_from(frame.len()).map_err(|_| {
            Error::InvalidFrame(format!("Message too large: {} bytes", frame.len()))
        })?;
        self.stream.write_u32(len).await?;
        self.stream.write_all(&frame).await?;
        self.stream.flush().await?;
        Ok(())
    }

    /// Read and decode one message
    pub async fn receive<T: DeserializeOwned>(&mut self) -> Result<T> {
        let len = self.stream.read_u32().await.map_err(closed_on_eof)? as usize;

        if len > self.max_frame_len {
            return Err(Error::InvalidFrame(format!(
                "Message too large: {} bytes",
                len
            )));
        }

        let mut buf = vec![0u8; len];
        self.stream
            .read_exact(&mut buf)
            .await
            .map_err(closed_on_eof)?;

        self.codec.decode(&buf)
    }

    /// Whether the peer hung up or the stream failed
    ///
    /// Only looks at what already arrived and never waits. Nothing should be
    /// pending between a reply and the next request, so unexpected bytes
    /// count as a broken stream too.
    pub async fn peer_closed(&mut self) -> bool {
        let mut byte = [0u8; 1];
        std::future::poll_fn(|cx| {
            let mut buf = ReadBuf::new(&mut byte);
            Poll::Ready(match Pin::new(&mut self.stream).poll_read(cx, &mut buf) {
                Poll::Pending => false,
                Poll::Ready(_) => true,
            })
        })
        .await
    }

    pub async fn close(&mut self) -> Result<()> {
        self.stream.shutdown().await?;
        Ok(())
    }
}

fn closed_on_eof(err: std::io::Error) -> Error {
    if err.kind() == std::io::ErrorKind::UnexpectedEof {
        Error::ConnectionClosed
    } else {
        err.into()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::BincodeCodec;

    #[tokio::test]
    async fn frames_keep_their_boundaries() {
        let (a, b) = tokio::io::duplex(1024);
        let mut left = Framed::new(a, BincodeCodec);
        let mut right = Framed::new(b, BincodeCodec);

        for word in ["first", "second", "third"] {
            left.send(&word.to_string()).await.unwrap();
        }
        for word in ["first", "second", "third"] {
            let received: String = right.receive().await.unwrap();
            assert_eq!(received, word);
        }
    }

    #[tokio::test]
    async fn rejects_oversized_frame_header() {
        let (mut a, b) = tokio::io::duplex(64);
        let mut framed = Framed::new(b, BincodeCodec).with_max_frame_len(16);

        a.write_u32(1024).await.unwrap();
        a.flush().await.unwrap();

        match framed.receive::<String>().await {
            Err(Error::InvalidFrame(msg)) => assert!(msg.contains("too large")),
            other => panic!("Expected InvalidFrame, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn oversized_send_writes_nothing() {
        let (a, b) = tokio::io::duplex(1024);
        let mut left = Framed::new(a, BincodeCodec).with_max_frame_len(8);
        let mut right = Framed::new(b, BincodeCodec);

        let result = left.send(&"this does not fit".to_string()).await;
        assert!(matches!(result, Err(Error::InvalidFrame(_))));

        left.send(&1u8).await.unwrap();
        let received: u8 = right.receive().await.unwrap();
        assert_eq!(received, 1);
    }

    #[tokio::test]
    async fn frame_limit_is_capped_by_length_prefix() {
        let (a, _b) = tokio::io::duplex(64);
        let framed = Framed::new(a, BincodeCodec).with_max_frame_len(usize::MAX);
        assert_eq!(framed.max_frame_len, FRAME_LEN_LIMIT);
    }

    #[tokio::test]
    async fn peer_closed_sees_hang_up() {
        let (a, b) = tokio::io::duplex(64);
        let mut framed = Framed::new(a, BincodeCodec);
        assert!(!framed.peer_closed().await);

        drop(b);
        assert!(framed.peer_closed().await);
    }

    #[tokio::test]
    async fn peer_closed_leaves_a_quiet_stream_usable() {
        let (a, b) = tokio::io::duplex(64);
        let mut left = Framed::new(a, BincodeCodec);
        let mut right = Framed::new(b, BincodeCodec);

        assert!(!left.peer_closed().await);
        left.send(&6u32).await.unwrap();
        assert_eq!(right.receive::<u32>().await.unwrap(), 6);
    }

    #[tokio::test]
    async fn eof_is_connection_closed() {
        let (a, b) = tokio::io::duplex(64);
        drop(a);
        let mut framed = Framed::new(b, BincodeCodec);

        match framed.receive::<String>().await {
            Err(Error::ConnectionClosed) => {}
            other => panic!("Expected ConnectionClosed, got {:?}", other),
        }
    }
}
