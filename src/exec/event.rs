//! Debug-event model and the outward callback interface.
//!
//! The engine consumes raw OS debug events and reports cooked, high-level
//! events through [`EventCallback`]. Decision-bearing callbacks return a
//! [`RunMode`] that tells the dispatch loop whether to keep running.

use crate::error::EngineError;
use crate::exec::module::Module;
use crate::exec::process::Process;
use crate::exec::thread::Thread;

/// Win32-style exception codes the engine interprets itself.
pub const EXCEPTION_BREAKPOINT: u32 = 0x8000_0003;
pub const EXCEPTION_SINGLE_STEP: u32 = 0x8000_0004;

/// Opaque owner token attached to a breakpoint registration.
pub type Cookie = u64;

/// What the callback wants the debuggee to do after an event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunMode {
    /// Keep running; for exceptions this means "not handled, pass it on".
    Run,
    /// Stay stopped and hand control to the caller.
    Break,
    /// Stay stopped; the caller will decide later.
    Wait,
}

/// Raw exception payload, preserved for callback consumers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExceptionRecord {
    pub code: u32,
    pub flags: u32,
    pub address: u64,
    pub params: Vec<u64>,
}

impl ExceptionRecord {
    pub fn new(code: u32, address: u64) -> Self {
        ExceptionRecord {
            code,
            flags: 0,
            address,
            params: Vec::new(),
        }
    }
}

/// Event kinds, used for error reporting and tracing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventKind {
    ProcessStart,
    ProcessExit,
    ThreadStart,
    ThreadExit,
    ModuleLoad,
    ModuleUnload,
    OutputString,
    Exception,
    Breakpoint,
    StepComplete,
    LoadComplete,
    AsyncBreakComplete,
    Other,
}

/// Consumer of cooked debug events.
///
/// Called on the controller thread, outside the engine's internal locks, so
/// an implementation may call back into the engine's proxy surface. The
/// default implementations ignore notifications, pass exceptions on to the
/// debuggee, and stop at breakpoints.
pub trait EventCallback: Send {
    fn on_process_start(&mut self, process: &Process) {
        let _ = process;
    }

    fn on_process_exit(&mut self, pid: u32, exit_code: u32) {
        let _ = (pid, exit_code);
    }

    fn on_thread_start(&mut self, process: &Process, thread: &Thread) {
        let _ = (process, thread);
    }

    fn on_thread_exit(&mut self, process: &Process, tid: u32, exit_code: u32) {
        let _ = (process, tid, exit_code);
    }

    fn on_module_load(&mut self, process: &Process, module: &Module) {
        let _ = (process, module);
    }

    fn on_module_unload(&mut self, process: &Process, image_base: u64) {
        let _ = (process, image_base);
    }

    fn on_output_string(&mut self, process: &Process, text: &str) {
        let _ = (process, text);
    }

    /// The loader finished; module and import state is now valid.
    fn on_load_complete(&mut self, process: &Process, tid: u32) {
        let _ = (process, tid);
    }

    fn on_exception(
        &mut self,
        process: &Process,
        tid: u32,
        first_chance: bool,
        record: &ExceptionRecord,
    ) -> RunMode {
        let _ = (process, tid, first_chance, record);
        RunMode::Run
    }

    /// A breakpoint stop. `cookies` lists the owners registered at the
    /// address; it is empty for embedded (foreign) trap bytes.
    fn on_breakpoint(
        &mut self,
        process: &Process,
        tid: u32,
        address: u64,
        cookies: &[Cookie],
        embedded: bool,
    ) -> RunMode {
        let _ = (process, tid, address, cookies, embedded);
        RunMode::Break
    }

    fn on_step_complete(&mut self, process: &Process, tid: u32) {
        let _ = (process, tid);
    }

    /// A previously requested async break has taken effect.
    fn on_async_break_complete(&mut self, process: &Process, tid: u32) {
        let _ = (process, tid);
    }

    fn on_error(&mut self, process: &Process, error: &EngineError, kind: EventKind) {
        let _ = (process, error, kind);
    }

    /// Source-level step-in probe: may the stepper stop at this call
    /// target? `Run` keeps stepping through, `Break` accepts the stop.
    fn on_call_probe(&mut self, pid: u32, tid: u32, address: u64) -> RunMode {
        let _ = (pid, tid, address);
        RunMode::Run
    }
}

/// A callback that ignores everything; useful as a default.
pub struct NullCallback;

impl EventCallback for NullCallback {}
