use crate::channel::Channel;
use crate::error::{ChannelError, SessionError};
use crate::frame::FrameAssembler;
use crate::protocol::Vocabulary;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

/// Frame assembler shared between a session and its handshake task.
pub type SharedAssembler<C> = Arc<Mutex<FrameAssembler<C>>>;

/// Waits for the device's `ACK` on a dedicated task under a hard timeout.
///
/// Tokens that arrive before the acknowledgement, or after it in the same
/// frame, are handed back rather than dropped: some firmware revisions start
/// streaming before the `ACK` goes out.
pub struct AckWaiter<C> {
    assembler: SharedAssembler<C>,
    vocabulary: Vocabulary,
    timeout: Duration,
}

impl<C: Channel + 'static> AckWaiter<C> {
    pub fn new(assembler: SharedAssembler<C>, vocabulary: Vocabulary, timeout: Duration) -> Self {
        Self {
            assembler,
            vocabulary,
            timeout,
        }
    }

    /// Waits for the acknowledgement of `command`.
    ///
    /// Returns the non-ACK tokens seen on the way. On timeout the reading
    /// task is aborted before this returns, so the assembler is free again.
    pub async fn wait(&self, command: &str) -> Result<Vec<String>, SessionError> {
        let started = Instant::now();
        let assembler = Arc::clone(&self.assembler);
        let vocabulary = self.vocabulary.clone();

        let mut task = tokio::spawn(async move {
            let mut assembler = assembler.lock().await;
            let mut early = Vec::new();
            loop {
                let frame = assembler.next_frame().await?;
                let mut acked = false;
                for token in frame.tokens {
                    if vocabulary.is_ack(&token) {
                        acked = true;
                    } else {
                        early.push(token);
                    }
                }
                if acked {
                    return Ok::<_, ChannelError>(early);
                }
            }
        });

        match tokio::time::timeout(self.timeout, &mut task).await {
            Ok(joined) => {
                let early = joined?.map_err(SessionError::StreamIo)?;
                info!(command, elapsed_ms = started.elapsed().as_millis() as u64, "acknowledgement received");
                if !early.is_empty() {
                    debug!(tokens = early.len(), "tokens received alongside the acknowledgement");
                }
                Ok(early)
            }
            Err(_) => {
                task.abort();
                // Wait for the abort so the assembler lock is released.
                let _ = task.await;
                warn!(command, timeout_ms = self.timeout.as_millis() as u64, "no acknowledgement");
                Err(SessionError::HandshakeTimeout {
                    command: command.to_string(),
                    timeout_ms: self.timeout.as_millis() as u64,
                })
            }
        }
    }
}
