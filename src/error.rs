//! Main crate error

use crate::rpc::PutError;

#[derive(thiserror::Error, Debug)]
/// Mainstay crate error enum.
pub enum Error {
    /// A request got no response within the request timeout.
    #[error("Timeout exceeded")]
    Timeout,

    /// The node is shutting down; all pending work is rejected with this.
    #[error("Node is disposing")]
    Disposing,

    /// A remote node answered a request with a KRPC error message.
    #[error("Remote node responded with error {code}: {description}")]
    RemoteError {
        /// KRPC error code.
        code: i32,
        description: String,
    },

    /// A value exceeds the 1000 byte limit; it never left this node.
    #[error("Value size {0} exceeds the maximum of 1000 bytes")]
    ValueTooLarge(usize),

    /// A salt exceeds the 64 byte limit; the record never left this node.
    #[error("Salt size {0} exceeds the maximum of 64 bytes")]
    SaltTooLarge(usize),

    #[error(transparent)]
    /// Storing a value at the closest nodes failed.
    Put(#[from] PutError),

    #[error(transparent)]
    /// Transparent [std::io::Error]
    IO(#[from] std::io::Error),

    /// Persisted state could not be parsed.
    #[error("Failed to parse the state file: {0}")]
    InvalidStateFile(#[from] serde_json::Error),
}
