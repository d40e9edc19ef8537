//! The OS debug surface behind a trait.
//!
//! Everything the engine needs from the operating system's debug API goes
//! through [`DebugPort`]: the event stream, continue, memory and context
//! access, and thread suspension. The real Win32 backend lives in
//! [`windows`]; [`sim`] is a deterministic in-memory target used by tests
//! and demos on any OS.

pub mod sim;

#[cfg(target_os = "windows")]
pub mod windows;

use std::sync::{Arc, Mutex};

use crate::error::Result;
use crate::exec::event::ExceptionRecord;
use crate::machine::context::{CpuArch, ThreadContext};

/// Opaque OS handle value. Zero is never a valid handle.
pub type RawHandle = u64;

/// Locks a shared mutex, mapping a poisoned lock into an engine error
/// instead of panicking on the controller thread.
pub fn lock<T: ?Sized>(mutex: &Mutex<T>) -> Result<std::sync::MutexGuard<'_, T>> {
    mutex.lock().map_err(|_| crate::error::EngineError::Port {
        reason: "poisoned lock".into(),
    })
}

/// Port shared between the controller thread and free-threaded readers.
pub type SharedPort = Arc<Mutex<dyn DebugPort>>;

/// Parameters for launching a debuggee.
#[derive(Debug, Clone, Default)]
pub struct LaunchInfo {
    pub exe_path: String,
    pub command_line: String,
    pub working_dir: String,
    /// Create the initial thread suspended; the caller resumes it later
    /// through the engine once its breakpoints are in place.
    pub suspend_initial_thread: bool,
}

/// What launch/attach report synchronously; everything else arrives as
/// debug events.
#[derive(Debug, Clone)]
pub struct LaunchedProcess {
    pub pid: u32,
    pub process_handle: RawHandle,
}

/// One raw debug event, tagged with its process and thread.
#[derive(Debug, Clone)]
pub struct PortEvent {
    pub pid: u32,
    pub tid: u32,
    pub payload: PortPayload,
}

#[derive(Debug, Clone)]
pub enum PortPayload {
    CreateProcess {
        process_handle: RawHandle,
        thread_handle: RawHandle,
        /// Open handle to the image file; must be closed exactly once.
        image_file: Option<RawHandle>,
        image_base: u64,
        image_size: u32,
        entry_point: u64,
        start_address: u64,
        teb_base: u64,
        image_path: String,
        arch: CpuArch,
    },
    CreateThread {
        thread_handle: RawHandle,
        start_address: u64,
        teb_base: u64,
    },
    ExitProcess {
        exit_code: u32,
    },
    ExitThread {
        exit_code: u32,
    },
    LoadModule {
        /// Open handle to the image file; must be closed exactly once.
        image_file: Option<RawHandle>,
        image_base: u64,
        image_size: u32,
        image_path: String,
        debug_info_offset: u32,
        debug_info_size: u32,
    },
    UnloadModule {
        image_base: u64,
    },
    OutputString {
        address: u64,
        char_count: u32,
        wide: bool,
    },
    Exception {
        first_chance: bool,
        record: ExceptionRecord,
    },
    /// Event kinds the engine does not interpret (RIP and friends).
    Unknown,
}

impl PortEvent {
    /// The image-file handle embedded in this event's payload, if any.
    pub fn image_file_handle(&self) -> Option<RawHandle> {
        match &self.payload {
            PortPayload::CreateProcess { image_file, .. } => *image_file,
            PortPayload::LoadModule { image_file, .. } => *image_file,
            _ => None,
        }
    }
}

/// The OS debug API surface consumed by the engine.
///
/// Implementations are driven from the controller thread, except
/// `read_memory`, which may be called from any thread.
pub trait DebugPort: Send {
    fn launch(&mut self, info: &LaunchInfo) -> Result<LaunchedProcess>;
    fn attach(&mut self, pid: u32) -> Result<LaunchedProcess>;

    /// Blocks up to `timeout_ms` for the next debug event. `Ok(None)` is a
    /// timeout, not an error.
    fn wait_event(&mut self, timeout_ms: u32) -> Result<Option<PortEvent>>;

    /// Resumes the debuggee after an event. `handled` maps to
    /// DBG_CONTINUE versus DBG_EXCEPTION_NOT_HANDLED.
    fn continue_event(&mut self, pid: u32, tid: u32, handled: bool) -> Result<()>;

    fn terminate(&mut self, pid: u32) -> Result<()>;
    fn detach(&mut self, pid: u32) -> Result<()>;

    /// Injects a break into a running debuggee; the resulting trap arrives
    /// as a normal breakpoint exception event.
    fn break_into(&mut self, pid: u32) -> Result<()>;

    /// Raw read; returns (bytes read, length of the unreadable run that
    /// stopped the read). Free-threaded.
    fn read_memory(&mut self, pid: u32, address: u64, buf: &mut [u8]) -> Result<(usize, usize)>;

    /// Raw write; returns the byte count actually written.
    fn write_memory(&mut self, pid: u32, address: u64, data: &[u8]) -> Result<usize>;

    /// Fetches the feature groups named by `flags`.
    fn get_context(&mut self, tid: u32, flags: u32) -> Result<ThreadContext>;

    /// Stores the feature groups carried by `context.flags`.
    fn set_context(&mut self, tid: u32, context: &ThreadContext) -> Result<()>;

    fn suspend_thread(&mut self, handle: RawHandle) -> Result<()>;
    fn resume_thread(&mut self, handle: RawHandle) -> Result<()>;

    fn close_handle(&mut self, handle: RawHandle) -> Result<()>;
}
