//! Line decoding for the mirrord progress stream.

use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};

use crate::cli::{Event, ProtocolError, WireEvent};

/// Error type for stream operations.
#[derive(thiserror::Error, Debug)]
pub enum StreamError {
    /// Reading from the pipe failed.
    #[error("Failed to read mirrord output: {0}")]
    Io(#[from] std::io::Error),
    /// A line could not be decoded.
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
}

/// Decode one line of the progress stream.
///
/// No defaults are applied: a `FinishedTask` without `success` is an error,
/// and so is a `success` field on any other kind.
///
/// # Errors
///
/// Returns `ProtocolError` if the line is not a well-formed record.
pub fn decode(line: &str) -> Result<Event, ProtocolError> {
    let wire: WireEvent =
        serde_json::from_str(line).map_err(|e| ProtocolError::malformed(line, &e))?;
    Event::try_from(wire)
}

/// Decode one raw line of the progress stream.
///
/// Bytes that are not valid UTF-8 are a protocol error, not an I/O error.
///
/// # Errors
///
/// Returns `ProtocolError` if the line is not a well-formed record.
pub fn decode_bytes(line: &[u8]) -> Result<Event, ProtocolError> {
    match std::str::from_utf8(line) {
        Ok(line) => decode(line),
        Err(e) => Err(ProtocolError::Malformed {
            input: String::from_utf8_lossy(line).into_owned(),
            reason: e.to_string(),
        }),
    }
}

/// Read decoded events from the binary's stdout.
///
/// Blank lines are skipped. The stream ends when the pipe closes; it yields
/// an error item for every line that fails to decode and leaves it to the
/// consumer to decide whether to keep going.
pub fn read_events<R>(reader: R) -> impl futures_core::Stream<Item = Result<Event, StreamError>>
where
    R: AsyncRead + Unpin,
{
    let segments = BufReader::new(reader).split(b'\n');

    futures_util::stream::unfold(segments, |mut segments| async move {
        loop {
            match segments.next_segment().await {
                Ok(Some(mut line)) => {
                    if line.last() == Some(&b'\r') {
                        line.pop();
                    }
                    if line.iter().all(u8::is_ascii_whitespace) {
                        tracing::trace!("Skipping blank line");
                        continue;
                    }
                    tracing::trace!(line = %String::from_utf8_lossy(&line), "mirrord output");
                    let event = decode_bytes(&line).map_err(StreamError::from);
                    return Some((event, segments));
                }
                Ok(None) => return None,
                Err(e) => return Some((Err(StreamError::Io(e)), segments)),
            }
        }
    })
}
