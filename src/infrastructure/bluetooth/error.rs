use thiserror::Error;

/// Errors raised while discovering or connecting to the turret.
#[derive(Error, Debug)]
pub enum LinkError {
    /// A strategy could not build a socket for the device.
    #[error("{strategy}: socket construction failed: {reason}")]
    SocketConstruction {
        strategy: String,
        reason: String,
    },
    /// The socket was built but the connection attempt failed.
    #[error("{strategy}: connect failed: {reason}")]
    Connect { strategy: String, reason: String },
    /// SDP lookup did not find the service on the device.
    #[error("service {uuid} not advertised by {address}")]
    ServiceNotFound { uuid: String, address: String },
    /// The platform refused to start discovery.
    #[error("discovery failed to start: {0}")]
    Discovery(String),
    /// A platform tool exited unsuccessfully.
    #[error("`{program}` failed: {stderr}")]
    Tool { program: String, stderr: String },
    /// Underlying I/O error.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}
