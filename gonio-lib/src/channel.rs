use crate::error::ChannelError;
use async_trait::async_trait;
use bytes::Bytes;

/// A half-duplex text link to the rig.
///
/// Implementations own whatever state selects and holds the physical port,
/// so independent channels (real or simulated) never share globals.
#[async_trait]
pub trait Channel: Send {
    /// Opens the link. Fails with [`ChannelError::DeviceNotFound`] or
    /// [`ChannelError::PortBusy`] when the device cannot be reached.
    async fn open(&mut self) -> Result<(), ChannelError>;

    /// Closes the link. Closing a channel that is not open does nothing.
    async fn close(&mut self);

    /// Writes `text` verbatim.
    async fn send(&mut self, text: &str) -> Result<(), ChannelError>;

    /// Returns whatever arrived, possibly nothing. May block up to the
    /// channel's read timeout.
    ///
    /// Must be cancellation safe: when the returned future is dropped, data
    /// already read is returned by the next call.
    async fn receive(&mut self) -> Result<Bytes, ChannelError>;

    /// Drops stale input left over from a previous run.
    async fn discard_input(&mut self) -> Result<(), ChannelError> {
        self.receive().await.map(|_| ())
    }

    /// Identifiers of the channels that could be opened right now.
    fn list_available(&self) -> Result<Vec<String>, ChannelError>;

    /// Human-readable description of a channel, when one is known.
    fn describe(&self, id: &str) -> Option<String>;
}
