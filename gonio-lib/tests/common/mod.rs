//! Common test utilities: a scripted in-memory channel standing in for the rig

// Shared across test files, not every item is used in each
#![allow(dead_code)]

use async_trait::async_trait;
use bytes::Bytes;
use gonio_lib::channel::Channel;
use gonio_lib::error::ChannelError;
use std::collections::VecDeque;
use std::io;
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// Installs a test-friendly subscriber once; honours RUST_LOG.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_test_writer()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .try_init();
}

/// What the scripted device does on the next read.
#[derive(Debug, Clone)]
pub enum Step {
    Chunk(Bytes),
    /// Read times out after this long with no data
    Silence(Duration),
    /// Read fails
    Broken,
}

#[derive(Debug, Default)]
struct WireState {
    sent: Vec<String>,
    opened: usize,
    closed: usize,
}

/// View of what crossed the wire, readable after the channel moved into a session.
#[derive(Debug, Clone, Default)]
pub struct Wire(Arc<Mutex<WireState>>);

impl Wire {
    pub fn sent(&self) -> Vec<String> {
        self.0.lock().unwrap().sent.clone()
    }

    pub fn count_sent(&self, text: &str) -> usize {
        self.0.lock().unwrap().sent.iter().filter(|s| *s == text).count()
    }

    pub fn opened(&self) -> usize {
        self.0.lock().unwrap().opened
    }

    pub fn closed(&self) -> usize {
        self.0.lock().unwrap().closed
    }
}

/// Channel replaying a fixed script of reads.
///
/// Once the script runs out every read is a short timeout with no data.
pub struct ScriptedChannel {
    wire: Wire,
    incoming: VecDeque<Step>,
    replies: Vec<(String, String)>,
    unavailable: bool,
    open: bool,
}

impl ScriptedChannel {
    pub fn new() -> Self {
        Self {
            wire: Wire::default(),
            incoming: VecDeque::new(),
            replies: Vec::new(),
            unavailable: false,
            open: false,
        }
    }

    pub fn chunk(mut self, text: &str) -> Self {
        self.incoming.push_back(Step::Chunk(Bytes::copy_from_slice(text.as_bytes())));
        self
    }

    /// Raw bytes, for line noise that is not valid text.
    pub fn bytes(mut self, raw: &[u8]) -> Self {
        self.incoming.push_back(Step::Chunk(Bytes::copy_from_slice(raw)));
        self
    }

    pub fn silence(mut self, duration: Duration) -> Self {
        self.incoming.push_back(Step::Silence(duration));
        self
    }

    pub fn broken(mut self) -> Self {
        self.incoming.push_back(Step::Broken);
        self
    }

    /// Queues `reply` as the next read whenever `trigger` is sent.
    pub fn reply(mut self, trigger: &str, reply: &str) -> Self {
        self.replies.push((trigger.to_string(), reply.to_string()));
        self
    }

    /// Opening fails as if no device were connected.
    pub fn unavailable(mut self) -> Self {
        self.unavailable = true;
        self
    }

    pub fn wire(&self) -> Wire {
        self.wire.clone()
    }
}

#[async_trait]
impl Channel for ScriptedChannel {
    async fn open(&mut self) -> Result<(), ChannelError> {
        if self.unavailable {
            return Err(ChannelError::DeviceNotFound("scripted".to_string()));
        }
        self.open = true;
        self.wire.0.lock().unwrap().opened += 1;
        Ok(())
    }

    async fn close(&mut self) {
        self.open = false;
        self.wire.0.lock().unwrap().closed += 1;
    }

    async fn send(&mut self, text: &str) -> Result<(), ChannelError> {
        if !self.open {
            return Err(ChannelError::NotOpen);
        }
        self.wire.0.lock().unwrap().sent.push(text.to_string());
        for (trigger, reply) in &self.replies {
            if trigger == text {
                self.incoming.push_front(Step::Chunk(Bytes::from(reply.clone())));
            }
        }
        Ok(())
    }

    async fn receive(&mut self) -> Result<Bytes, ChannelError> {
        if !self.open {
            return Err(ChannelError::NotOpen);
        }
        match self.incoming.pop_front() {
            Some(Step::Chunk(bytes)) => Ok(bytes),
            Some(Step::Silence(duration)) => {
                tokio::time::sleep(duration).await;
                Ok(Bytes::new())
            }
            Some(Step::Broken) => Err(io::Error::new(io::ErrorKind::BrokenPipe, "scripted failure").into()),
            None => {
                tokio::time::sleep(Duration::from_millis(2)).await;
                Ok(Bytes::new())
            }
        }
    }

    async fn discard_input(&mut self) -> Result<(), ChannelError> {
        Ok(())
    }

    fn list_available(&self) -> Result<Vec<String>, ChannelError> {
        Ok(vec!["scripted".to_string()])
    }

    fn describe(&self, id: &str) -> Option<String> {
        (id == "scripted").then(|| "Scripted rig".to_string())
    }
}
