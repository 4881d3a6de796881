pub mod ack;
pub mod channel;
pub mod constants;
pub mod error;
pub mod frame;
pub mod geometry;
pub mod orchestrator;
pub mod photometry;
pub mod protocol;
pub mod serial;
pub mod session;

// Re-export the types a front end needs for one run
pub use channel::Channel;
pub use error::{ChannelError, PhotometryError, SessionError};
pub use geometry::{SampleSet, SphericalSample};
pub use photometry::{Fwhm, PhotometryReport, Resolution};
pub use protocol::{IntensityConversion, ScanConfig, Vocabulary};
pub use serial::{SerialChannel, SerialSettings};
pub use session::{Operation, ProtocolSession, SessionConfig, SessionEvent, SessionOutcome, SessionState};
