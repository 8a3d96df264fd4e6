use nix::errno::Errno;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

/// Errors produced by the multiplexing core.
///
/// `Operation` is special: it is an engine-level per-operation failure
/// and travels in the `op_err` slot of completion results, never mixed
/// with the transport errors that the other variants report.
#[derive(Copy, Clone, Eq, PartialEq, Debug, Error)]
pub enum Error {
    #[error("invalid argument: {0}")]
    InvalidArgument(&'static str),

    /// No free slot could be allocated in the fd table.
    #[error("fd table exhausted")]
    ResourceExhausted,

    #[error("system error: {}", .0.desc())]
    System(Errno),

    /// The context was cancelled externally.
    #[error("operation cancelled")]
    Cancelled,

    /// An operation-specific failure reported by the engine.
    #[error("operation error: {0}")]
    Operation(&'static str),
}
