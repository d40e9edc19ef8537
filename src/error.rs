//! Engine error taxonomy.
//!
//! Usage errors (wrong thread, wrong state, bad argument) are detected
//! synchronously and never mutate engine state. Target errors come from the
//! OS boundary and are surfaced as-is. Process-ended is its own kind so
//! callers holding a stale process id get an explicit signal.

use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum EngineError {
    #[error("call made from outside the controller thread")]
    WrongThread,

    #[error("operation not allowed in the current state: {reason}")]
    WrongState { reason: String },

    #[error("invalid argument: {reason}")]
    InvalidArg { reason: String },

    #[error("process {pid} has already ended")]
    ProcessEnded { pid: u32 },

    #[error("process not found: {pid}")]
    ProcessNotFound { pid: u32 },

    #[error("thread not found: {tid}")]
    ThreadNotFound { tid: u32 },

    #[error("failed to launch {path}: {reason}")]
    LaunchFailed { path: String, reason: String },

    #[error("failed to attach to process {pid}: {reason}")]
    AttachFailed { pid: u32, reason: String },

    #[error("memory access failed at {address:#x}: {reason}")]
    MemoryAccess { address: u64, reason: String },

    #[error("access denied")]
    AccessDenied,

    #[error("cannot determine the instruction at {address:#x}")]
    UnknownInstruction { address: u64 },

    #[error("lost communication with the debug worker thread")]
    RemoteFailure,

    #[error("debug port error: {reason}")]
    Port { reason: String },
}

pub type Result<T> = std::result::Result<T, EngineError>;

impl EngineError {
    pub fn wrong_state(reason: impl Into<String>) -> Self {
        EngineError::WrongState {
            reason: reason.into(),
        }
    }

    pub fn invalid_arg(reason: impl Into<String>) -> Self {
        EngineError::InvalidArg {
            reason: reason.into(),
        }
    }
}
