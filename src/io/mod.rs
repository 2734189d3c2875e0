//! IO modules - external system interfaces
//!
//! - `mqtt` - broker session and the `Publisher` seam
//! - `remote` - SSH command execution and file download
//! - `heartbeat` - last successful cycle timestamp file

pub mod heartbeat;
pub mod mqtt;
pub mod remote;

pub use mqtt::{PublishError, Publisher};
pub use remote::{RemoteTransport, SshTransport, TransportError};
