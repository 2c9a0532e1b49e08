//! Length‑prefixed frame codec for the board/controller link.
//!
//! Every message on the wire is one frame made of two length‑prefixed segments:
//!
//!   `<u16 LE name length><name bytes><u32 LE payload length><payload bytes>`
//!
//! The name is a short UTF‑8 identifier (`"read"`, `"data"`, ...). The payload is
//! opaque to this layer; callers serialize it (see [`Frame::with_payload`]).
//! There is no checksum and no escaping, so parsing cost is bounded by the frame size.
use bytes::{BufMut, BytesMut};
use serde::{de::DeserializeOwned, Serialize};
use tokio::io::{AsyncRead, AsyncReadExt};

use super::errors::LinkError;

/// Largest name the u16 prefix can describe.
pub const MAX_NAME_LEN: usize = u16::MAX as usize;
/// Largest payload the u32 prefix can describe.
pub const MAX_PAYLOAD_LEN: u64 = u32::MAX as u64;

/// One named message unit on the wire.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub name: String,
    pub payload: Vec<u8>,
}

impl Frame {
    pub fn new(name: impl Into<String>, payload: Vec<u8>) -> Self {
        Self {
            name: name.into(),
            payload,
        }
    }

    /// Build a frame whose payload is the bincode encoding of `value`.
    pub fn with_payload<T: Serialize + ?Sized>(
        name: impl Into<String>,
        value: &T,
    ) -> Result<Self, LinkError> {
        Ok(Self::new(name, bincode::serialize(value)?))
    }

    /// Decode the payload as `T`.
    pub fn decode_payload<T: DeserializeOwned>(&self) -> Result<T, LinkError> {
        Ok(bincode::deserialize(&self.payload)?)
    }

    pub fn encode(&self) -> Result<BytesMut, LinkError> {
        encode_frame(&self.name, &self.payload)
    }
}

/// Encode a `(name, payload)` pair into its wire form.
pub fn encode_frame(name: &str, payload: &[u8]) -> Result<BytesMut, LinkError> {
    let name_bytes = name.as_bytes();
    let name_len =
        u16::try_from(name_bytes.len()).map_err(|_| LinkError::NameTooLong(name_bytes.len()))?;
    let payload_len =
        u32::try_from(payload.len()).map_err(|_| LinkError::PayloadTooLong(payload.len()))?;

    let mut buf = BytesMut::with_capacity(2 + name_bytes.len() + 4 + payload.len());
    buf.put_u16_le(name_len);
    buf.put_slice(name_bytes);
    buf.put_u32_le(payload_len);
    buf.put_slice(payload);
    Ok(buf)
}

/// Read one whole frame from `reader`.
pub async fn read_frame<R: AsyncRead + Unpin>(reader: &mut R) -> Result<Frame, LinkError> {
    let mut prefix = [0u8; 2];
    let have = reader.read(&mut prefix).await?;
    finish_frame(reader, prefix, have).await
}

/// Complete a frame whose first `have` name‑prefix bytes are already in `prefix`.
///
/// `have == 0` means the peer closed the stream at a frame boundary.
pub async fn finish_frame<R: AsyncRead + Unpin>(
    reader: &mut R,
    mut prefix: [u8; 2],
    have: usize,
) -> Result<Frame, LinkError> {
    if have == 0 {
        return Err(LinkError::ConnectionAborted);
    }
    fill(reader, &mut prefix[have..]).await?;
    let name_len = u16::from_le_bytes(prefix) as u64;
    let name = read_segment(reader, name_len).await?;
    let name = String::from_utf8(name).map_err(|e| LinkError::InvalidName(e.utf8_error()))?;

    let mut len = [0u8; 4];
    let have = reader.read(&mut len).await?;
    if have == 0 {
        return Err(LinkError::ConnectionAborted);
    }
    fill(reader, &mut len[have..]).await?;
    let payload = read_segment(reader, u32::from_le_bytes(len) as u64).await?;

    Ok(Frame { name, payload })
}

async fn fill<R: AsyncRead + Unpin>(reader: &mut R, buf: &mut [u8]) -> Result<(), LinkError> {
    let mut got = 0;
    while got < buf.len() {
        let n = reader.read(&mut buf[got..]).await?;
        if n == 0 {
            return Err(LinkError::FrameTruncated {
                expected: buf.len(),
                received: got,
            });
        }
        got += n;
    }
    Ok(())
}

// Grows the buffer only as bytes arrive so a garbage length cannot force a 4 GiB allocation.
async fn read_segment<R: AsyncRead + Unpin>(reader: &mut R, len: u64) -> Result<Vec<u8>, LinkError> {
    let mut out = Vec::with_capacity(len.min(64 * 1024) as usize);
    (&mut *reader).take(len).read_to_end(&mut out).await?;
    if (out.len() as u64) < len {
        return Err(LinkError::FrameTruncated {
            expected: len as usize,
            received: out.len(),
        });
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wire_layout_is_little_endian_prefixed() {
        let buf = encode_frame("read", &[0xAA, 0xBB]).unwrap();
        assert_eq!(
            &buf[..],
            &[4, 0, b'r', b'e', b'a', b'd', 2, 0, 0, 0, 0xAA, 0xBB]
        );
    }

    #[tokio::test]
    async fn decode_inverts_encode() {
        let cases: Vec<(String, Vec<u8>)> = vec![
            (String::new(), Vec::new()),
            ("data".into(), (0..=255u8).collect()),
            ("é-ü".into(), vec![0; 70_000]),
            ("x".repeat(MAX_NAME_LEN), vec![1, 2, 3]),
        ];
        for (name, payload) in cases {
            let wire = encode_frame(&name, &payload).unwrap();
            let mut src = &wire[..];
            let frame = read_frame(&mut src).await.unwrap();
            assert_eq!(frame.name, name);
            assert_eq!(frame.payload, payload);
            assert!(src.is_empty());
        }
    }

    #[tokio::test]
    async fn frame_split_across_reads_is_reassembled() {
        let wire = encode_frame("write", b"deskwork").unwrap();
        let mut mock = tokio_test::io::Builder::new()
            .read(&wire[..1])
            .read(&wire[1..4])
            .read(&wire[4..9])
            .read(&wire[9..])
            .build();
        let frame = read_frame(&mut mock).await.unwrap();
        assert_eq!(frame.name, "write");
        assert_eq!(frame.payload, b"deskwork");
    }

    #[test]
    fn oversized_name_is_rejected() {
        let name = "n".repeat(MAX_NAME_LEN + 1);
        assert!(matches!(
            encode_frame(&name, &[]),
            Err(LinkError::NameTooLong(n)) if n == MAX_NAME_LEN + 1
        ));
    }

    #[tokio::test]
    async fn empty_stream_is_an_abort() {
        let mut src: &[u8] = &[];
        assert!(matches!(
            read_frame(&mut src).await,
            Err(LinkError::ConnectionAborted)
        ));
    }

    #[tokio::test]
    async fn short_payload_is_truncated() {
        let wire = encode_frame("send", &[1, 2, 3, 4, 5]).unwrap();
        let mut src = &wire[..wire.len() - 2];
        match read_frame(&mut src).await {
            Err(LinkError::FrameTruncated { expected, received }) => {
                assert_eq!(expected, 5);
                assert_eq!(received, 3);
            }
            other => panic!("expected truncation, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn close_before_payload_prefix_is_an_abort() {
        let wire = encode_frame("stop", &[]).unwrap();
        let mut src = &wire[..6];
        assert!(matches!(
            read_frame(&mut src).await,
            Err(LinkError::ConnectionAborted)
        ));
    }

    #[test]
    fn typed_payload_survives_bincode() {
        let frame = Frame::with_payload("write", &Some("deskwork".to_string())).unwrap();
        let value: Option<String> = frame.decode_payload().unwrap();
        assert_eq!(value.as_deref(), Some("deskwork"));
    }
}
