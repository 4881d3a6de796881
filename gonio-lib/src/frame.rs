use crate::channel::Channel;
use crate::constants::POLL_INTERVAL;
use crate::error::ChannelError;
use bytes::{Bytes, BytesMut};
use std::time::Duration;
use tracing::{debug, trace, warn};

/// Tokens delimited by one or more complete reads.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub tokens: Vec<String>,
}

impl Frame {
    /// Splits `raw`, which must end with `separator`.
    ///
    /// Only the empty token after the final separator is dropped, so joining
    /// every token followed by the separator gives back `raw`. Bytes that are
    /// not UTF-8 are rejected rather than replaced.
    fn split(raw: &[u8], separator: &str) -> Result<Self, ChannelError> {
        let text = std::str::from_utf8(raw).map_err(|e| ChannelError::InvalidEncoding {
            len: raw.len(),
            valid_up_to: e.valid_up_to(),
        })?;
        let body = text.strip_suffix(separator).unwrap_or(text);
        Ok(Self {
            tokens: body.split(separator).map(str::to_string).collect(),
        })
    }

    /// Re-encodes the frame as it appeared on the wire.
    pub fn to_wire(&self, separator: char) -> String {
        let mut out = String::new();
        for token in &self.tokens {
            out.push_str(token);
            out.push(separator);
        }
        out
    }
}

/// Turns the chunks returned by a [`Channel`] into whole-token frames.
///
/// Bytes after the last separator stay buffered until a later read completes
/// them, so a frame never contains a partial token.
pub struct FrameAssembler<C> {
    channel: C,
    separator: String,
    buffer: BytesMut,
    poll_interval: Duration,
}

impl<C: Channel> FrameAssembler<C> {
    pub fn new(channel: C, separator: char) -> Self {
        Self {
            channel,
            separator: separator.to_string(),
            buffer: BytesMut::with_capacity(1024),
            poll_interval: POLL_INTERVAL,
        }
    }

    pub fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }

    pub fn channel_mut(&mut self) -> &mut C {
        &mut self.channel
    }

    /// Bytes received but not yet part of a complete frame.
    pub fn pending(&self) -> &[u8] {
        &self.buffer
    }

    /// Drops buffered input along with anything waiting in the channel.
    pub async fn discard(&mut self) -> Result<(), ChannelError> {
        self.buffer.clear();
        self.channel.discard_input().await
    }

    /// Performs one read and returns a frame if it completed one.
    ///
    /// A completed frame holding invalid UTF-8 is consumed and reported as
    /// [`ChannelError::InvalidEncoding`]. An empty read sleeps for the poll interval before returning, so
    /// callers looping on this never spin hot.
    pub async fn poll_frame(&mut self) -> Result<Option<Frame>, ChannelError> {
        let chunk = self.channel.receive().await?;
        if chunk.is_empty() {
            tokio::time::sleep(self.poll_interval).await;
            return Ok(None);
        }
        trace!(len = chunk.len(), "chunk received");
        self.buffer.extend_from_slice(&chunk);
        self.take_frame()
    }

    /// Reads until a frame is complete. Cancellation safe as long as the
    /// channel's `receive` is.
    pub async fn next_frame(&mut self) -> Result<Frame, ChannelError> {
        loop {
            if let Some(frame) = self.poll_frame().await? {
                return Ok(frame);
            }
        }
    }

    fn take_frame(&mut self) -> Result<Option<Frame>, ChannelError> {
        let sep = self.separator.as_bytes();
        let Some(end) = last_separator_end(&self.buffer, sep) else {
            return Ok(None);
        };
        let raw: Bytes = self.buffer.split_to(end).freeze();
        let frame = Frame::split(&raw, &self.separator).inspect_err(|_| {
            warn!(raw = ?raw, "frame dropped, not valid UTF-8");
        })?;
        debug!(tokens = frame.tokens.len(), "frame assembled");
        Ok(Some(frame))
    }
}

/// Index just past the last occurrence of `sep` in `buffer`.
fn last_separator_end(buffer: &[u8], sep: &[u8]) -> Option<usize> {
    if sep.is_empty() || buffer.len() < sep.len() {
        return None;
    }
    buffer
        .windows(sep.len())
        .rposition(|window| window == sep)
        .map(|start| start + sep.len())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn split_drops_only_the_trailing_empty_token() {
        assert_eq!(Frame::split(b"a,b,", ",").unwrap().tokens, vec!["a", "b"]);
        assert_eq!(Frame::split(b"a,,b,", ",").unwrap().tokens, vec!["a", "", "b"]);
        assert_eq!(Frame::split(b"a,,", ",").unwrap().tokens, vec!["a", ""]);
        assert_eq!(Frame::split(b",", ",").unwrap().tokens, vec![""]);
    }

    #[test]
    fn split_rejects_invalid_utf8() {
        let err = Frame::split(b"DATA,1\xff,END,", ",").unwrap_err();
        assert!(matches!(
            err,
            ChannelError::InvalidEncoding {
                len: 12,
                valid_up_to: 6
            }
        ));
    }

    #[test]
    fn split_then_rejoin_is_identity() {
        for raw in ["ACK,", "DATA,1,2,3.5,", ",,", "x,,y,,"] {
            let frame = Frame::split(raw.as_bytes(), ",").unwrap();
            assert_eq!(frame.to_wire(','), raw);
        }
    }

    #[test]
    fn last_separator_is_found() {
        assert_eq!(last_separator_end(b"ab,cd", b","), Some(3));
        assert_eq!(last_separator_end(b"ab,cd,", b","), Some(6));
        assert_eq!(last_separator_end(b"abcd", b","), None);
        assert_eq!(last_separator_end(b"", b","), None);
    }
}
