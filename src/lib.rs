//! Vigil - event-driven native-code debugger engine.
//!
//! The engine is split along ownership lines:
//! - [`port`]: the OS debug surface behind a trait, with a Win32 backend
//!   and a deterministic simulator.
//! - [`exec`]: the event dispatch loop, process/thread/module registry,
//!   and the outward callback interface.
//! - [`machine`]: per-process execution control; breakpoint patching,
//!   stepping, contexts, and registers.
//! - [`proxy`]: the any-thread facade that marshals calls onto the
//!   engine's worker thread.

pub mod error;
pub mod exec;
pub mod machine;
pub mod port;
pub mod proxy;

pub use error::{EngineError, Result};
pub use exec::{Exec, MemoryAccess};
pub use proxy::ExecProxy;
