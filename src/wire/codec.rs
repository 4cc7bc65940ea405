//! Record-at-a-time read/write over a raw byte stream (C1).
//!
//! Each element is already self-describing (tag + BER length + value), so
//! framing falls straight out of that length rather than needing a
//! separate length-prefix layer the way `fantoch`'s `Rw<S>` needs
//! `tokio_util::codec::LengthDelimitedCodec` on top of `bincode` (bincode
//! values don't know their own length up front). `read_record` is the
//! single interruption point the receive loop races against the keepalive
//! deadline (§4.3, §9 "blocking reads with soft deadline").

use crate::error::{CoreError, CoreResult};
use crate::wire::element::Element;
use bytes::BytesMut;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

#[derive(Debug)]
pub enum ReadOutcome {
    Record(Element),
    Eof,
    Timeout,
}

/// Reads one complete record, or returns `Timeout` if `deadline` elapses
/// first. A timeout is not an error — it is the trigger the session's
/// receive loop uses to emit a keepalive (§4.3 step 2).
pub async fn read_record<S>(
    stream: &mut S,
    deadline: Option<Duration>,
) -> CoreResult<ReadOutcome>
where
    S: AsyncRead + Unpin,
{
    match deadline {
        Some(d) => match tokio::time::timeout(d, read_record_inner(stream)).await {
            Ok(result) => result,
            Err(_elapsed) => Ok(ReadOutcome::Timeout),
        },
        None => read_record_inner(stream).await,
    }
}

async fn read_record_inner<S>(stream: &mut S) -> CoreResult<ReadOutcome>
where
    S: AsyncRead + Unpin,
{
    let mut tag = [0u8; 1];
    let n = stream.read(&mut tag).await?;
    if n == 0 {
        return Ok(ReadOutcome::Eof);
    }

    let mut header = BytesMut::new();
    header.extend_from_slice(&tag);

    // BER length: first byte is either a short-form length or
    // 0x80 | count-of-following-length-bytes.
    let mut first_len_byte = [0u8; 1];
    read_exact_or_eof(stream, &mut first_len_byte).await?;
    header.extend_from_slice(&first_len_byte);

    let body_len = if first_len_byte[0] & 0x80 == 0 {
        first_len_byte[0] as usize
    } else {
        let count = (first_len_byte[0] & 0x7F) as usize;
        if count == 0 || count > 8 {
            return Err(CoreError::Protocol("unsupported BER length form".into()));
        }
        let mut len_bytes = vec![0u8; count];
        read_exact_or_eof(stream, &mut len_bytes).await?;
        header.extend_from_slice(&len_bytes);
        let mut value: u64 = 0;
        for b in len_bytes {
            value = (value << 8) | b as u64;
        }
        value as usize
    };

    let mut body = vec![0u8; body_len];
    if body_len > 0 {
        read_exact_or_eof(stream, &mut body).await?;
    }

    let mut full = header;
    full.extend_from_slice(&body);
    let record = Element::decode(&mut full)?;
    Ok(ReadOutcome::Record(record))
}

/// `read_exact` that turns a zero-byte EOF mid-record into a protocol
/// error instead of silently truncating — a peer closing mid-frame is a
/// malformed record, not a clean disconnect (a clean disconnect is only
/// ever observed at the start of a record, in `read_record_inner`).
async fn read_exact_or_eof<S>(stream: &mut S, buf: &mut [u8]) -> CoreResult<()>
where
    S: AsyncRead + Unpin,
{
    stream.read_exact(buf).await.map_err(|e| {
        if e.kind() == std::io::ErrorKind::UnexpectedEof {
            CoreError::Protocol("connection closed mid-record".into())
        } else {
            CoreError::Transport(e)
        }
    })
}

/// Writes one complete record.
pub async fn write_record<S>(stream: &mut S, record: &Element) -> CoreResult<()>
where
    S: AsyncWrite + Unpin,
{
    let mut buf = BytesMut::new();
    record.encode(&mut buf);
    stream.write_all(&buf).await?;
    stream.flush().await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[tokio::test]
    async fn writes_then_reads_back_the_same_record() {
        let record = Element::Sequence(vec![
            Element::Integer(41),
            Element::Enumerated(0),
            Element::utf8_string("hello"),
        ]);

        let mut buf = Vec::new();
        write_record(&mut buf, &record).await.unwrap();

        let mut cursor = Cursor::new(buf);
        match read_record(&mut cursor, None).await.unwrap() {
            ReadOutcome::Record(decoded) => assert_eq!(decoded, record),
            other => panic!("expected a record, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn empty_stream_is_eof() {
        let mut cursor = Cursor::new(Vec::<u8>::new());
        match read_record(&mut cursor, None).await.unwrap() {
            ReadOutcome::Eof => {}
            other => panic!("expected eof, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn deadline_elapses_to_timeout_not_error() {
        let (mut client, mut server) = tokio::io::duplex(64);
        let deadline = Duration::from_millis(20);
        let outcome = read_record(&mut server, Some(deadline)).await.unwrap();
        assert!(matches!(outcome, ReadOutcome::Timeout));
        // keep the client end alive for the duration of the test
        let _ = client.write_all(b"").await;
    }
}
