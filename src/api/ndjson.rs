//! Newline-delimited JSON decoding for streamed responses.

use std::io;

use bytes::Buf;
use futures::future;
use futures::stream::{BoxStream, Stream, StreamExt};
use serde::de::DeserializeOwned;
use tokio_util::codec::{FramedRead, LinesCodec, LinesCodecError};
use tokio_util::io::StreamReader;
use tracing::trace;

use crate::BotError;

/// Longest line accepted from the server.
const MAX_LINE_LENGTH: usize = 1 << 20;

/// Splits a byte stream into JSON values, one per line.
///
/// Blank lines are server keep-alives: they yield `keepalive` when given and
/// are skipped otherwise. A transport error ends the stream after being
/// yielded once, with its original kind.
pub fn decode_ndjson<S, B, E, T>(bytes: S, keepalive: Option<T>) -> BoxStream<'static, Result<T, BotError>>
where
    S: Stream<Item = Result<B, E>> + Send + 'static,
    B: Buf + Send + 'static,
    E: Into<BotError> + Send + 'static,
    T: DeserializeOwned + Clone + Send + 'static,
{
    // The reader only carries io::Error; the original error rides inside it.
    let reader = StreamReader::new(bytes.map(|chunk| chunk.map_err(|e| io::Error::other(Into::<BotError>::into(e)))));

    FramedRead::new(reader, LinesCodec::new_with_max_length(MAX_LINE_LENGTH))
        .filter_map(move |line| {
            let item = match line {
                Ok(line) if line.trim().is_empty() => {
                    trace!("Keep-alive line");
                    keepalive.clone().map(Ok)
                }
                Ok(line) => Some(serde_json::from_str(&line).map_err(BotError::from)),
                Err(err) => Some(Err(line_error(err))),
            };
            future::ready(item)
        })
        .boxed()
}

/// Recovers the transport error wrapped for the reader, or classifies a framing error.
fn line_error(err: LinesCodecError) -> BotError {
    match err {
        LinesCodecError::MaxLineLengthExceeded => {
            BotError::protocol(format!("Stream line longer than {} bytes", MAX_LINE_LENGTH))
        }
        LinesCodecError::Io(err) => {
            let kind = err.kind();
            match err.into_inner().map(|inner| inner.downcast::<BotError>()) {
                Some(Ok(original)) => *original,
                _ if kind == io::ErrorKind::InvalidData => BotError::protocol("Stream line is not UTF-8"),
                _ => BotError::transient(format!("Stream read failed: {}", kind)),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ErrorKind;
    use bytes::Bytes;
    use futures::stream;
    use serde::Deserialize;

    #[derive(Debug, Clone, PartialEq, Deserialize)]
    struct Item {
        n: u32,
    }

    fn chunks(parts: &[&'static str]) -> Vec<Result<Bytes, BotError>> {
        parts.iter().map(|&p| Ok(Bytes::from_static(p.as_bytes()))).collect()
    }

    #[tokio::test]
    async fn test_lines_split_across_chunks() {
        let input = chunks(&["{\"n\":1}\n{\"n\"", ":2}\r\n\n{\"n\":3}"]);
        let items: Vec<_> = decode_ndjson::<_, _, _, Item>(stream::iter(input), None)
            .map(|r| r.expect("valid line").n)
            .collect()
            .await;
        assert_eq!(items, [1, 2, 3]);
    }

    #[tokio::test]
    async fn test_keepalive_surfaces_when_requested() {
        let input = chunks(&["\n{\"n\":7}\n"]);
        let items: Vec<_> = decode_ndjson(stream::iter(input), Some(Item { n: 0 }))
            .map(|r| r.expect("valid line").n)
            .collect()
            .await;
        assert_eq!(items, [0, 7]);
    }

    #[tokio::test]
    async fn test_malformed_line_is_protocol_violation() {
        let input = chunks(&["not json\n"]);
        let items: Vec<Result<Item, BotError>> = decode_ndjson(stream::iter(input), None).collect().await;
        assert_eq!(items.len(), 1);
        let err = items[0].as_ref().expect_err("malformed");
        assert_eq!(err.kind, ErrorKind::ProtocolViolation);
    }

    #[tokio::test]
    async fn test_transport_error_keeps_its_kind_and_ends_stream() {
        let mut input = chunks(&["{\"n\":1}\n"]);
        input.push(Err(BotError::fatal_auth("token revoked")));
        input.extend(chunks(&["{\"n\":2}\n"]));

        let items: Vec<Result<Item, BotError>> = decode_ndjson(stream::iter(input), None).collect().await;
        assert_eq!(items.len(), 2);
        assert_eq!(items[0].as_ref().ok(), Some(&Item { n: 1 }));
        let err = items[1].as_ref().expect_err("transport error");
        assert_eq!(err.kind, ErrorKind::FatalAuth);
    }

    #[tokio::test]
    async fn test_invalid_utf8_is_protocol_violation() {
        let input: Vec<Result<Bytes, BotError>> = vec![Ok(Bytes::from_static(b"\xff\xfe\n"))];
        let items: Vec<Result<Item, BotError>> = decode_ndjson(stream::iter(input), None).collect().await;
        let err = items[0].as_ref().expect_err("not utf-8");
        assert_eq!(err.kind, ErrorKind::ProtocolViolation);
    }
}
