//! The debug event loop and the engine's outer control surface.
//!
//! [`Exec`] pumps raw events from the port, keeps the process registry in
//! step with them, routes breakpoint and single-step exceptions through
//! each process's machine, and reports cooked events to the registered
//! callback. One event is in flight at a time: wait, dispatch, and either
//! the dispatcher continues the debuggee itself or it stays stopped until
//! `continue_debug`.
//!
//! Everything here must run on the thread that created the `Exec`; the OS
//! ties a debuggee to the thread that attached it. The exceptions are
//! [`MemoryAccess`], which reads target memory from any thread, and
//! `shutdown`.

pub mod event;
pub mod image;
pub mod module;
pub mod process;
pub mod thread;

use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Arc, Mutex};
use std::thread::ThreadId;

use log::{debug, info, warn};

use crate::error::{EngineError, Result};
use crate::exec::event::{Cookie, EventCallback, EventKind, RunMode};
use crate::exec::module::Module;
use crate::exec::process::Process;
use crate::exec::thread::Thread;
use crate::machine::breakpoints::BreakpointTable;
use crate::machine::context::ThreadContext;
use crate::machine::steppers::AddressRange;
use crate::machine::{Machine, MachineResult};
use crate::port::{lock, LaunchInfo, PortEvent, PortPayload, SharedPort};

/// Default wait used by callers that just want to poll.
pub const DEFAULT_WAIT_MS: u32 = 100;

/// Free-threaded, breakpoint-transparent reader for one process's memory.
/// Safe to use from any thread while the engine runs.
pub struct MemoryAccess {
    port: SharedPort,
    bps: Arc<Mutex<BreakpointTable>>,
    pid: u32,
}

impl MemoryAccess {
    pub fn pid(&self) -> u32 {
        self.pid
    }

    /// Reads target memory with trap bytes replaced by the original code
    /// bytes. Returns (bytes read, length of the unreadable run hit).
    pub fn read(&self, address: u64, buf: &mut [u8]) -> Result<(usize, usize)> {
        let mut port = lock(&self.port)?;
        let bps = lock(&self.bps)?;
        bps.read_memory(&mut *port, self.pid, address, buf)
    }
}

/// The debugger engine core.
pub struct Exec {
    port: SharedPort,
    callback: Box<dyn EventCallback>,
    processes: BTreeMap<u32, Process>,
    last_event: Option<PortEvent>,
    /// Pids launched with a suspended initial thread, waiting for their
    /// create event to capture the thread handle.
    pending_suspended: BTreeSet<u32>,
    controller: ThreadId,
    shut_down: bool,
}

impl Exec {
    pub fn new(port: SharedPort, callback: Box<dyn EventCallback>) -> Self {
        Exec {
            port,
            callback,
            processes: BTreeMap::new(),
            last_event: None,
            pending_suspended: BTreeSet::new(),
            controller: std::thread::current().id(),
            shut_down: false,
        }
    }

    fn check_thread(&self) -> Result<()> {
        if std::thread::current().id() != self.controller {
            return Err(EngineError::WrongThread);
        }
        Ok(())
    }

    fn find_process(&self, pid: u32) -> Result<&Process> {
        self.processes
            .get(&pid)
            .ok_or(EngineError::ProcessNotFound { pid })
    }

    fn find_process_mut(&mut self, pid: u32) -> Result<&mut Process> {
        self.processes
            .get_mut(&pid)
            .ok_or(EngineError::ProcessNotFound { pid })
    }

    // -- lifecycle -----------------------------------------------------

    /// Starts a new debuggee. The process record exists immediately; the
    /// rest fills in when the create event arrives.
    pub fn launch(&mut self, info: &LaunchInfo) -> Result<u32> {
        self.check_thread()?;
        self.ensure_running()?;

        let image = image::probe_image(std::path::Path::new(&info.exe_path)).ok();
        let arch = image
            .as_ref()
            .and_then(|i| i.arch())
            .unwrap_or(crate::machine::context::CpuArch::X64);

        let launched = {
            let mut port = lock(&self.port)?;
            port.launch(info)?
        };

        info!("launched {} as pid {}", info.exe_path, launched.pid);

        let mut process = Process::new(
            launched.process_handle,
            launched.pid,
            info.exe_path.clone(),
            arch,
        );
        if let Some(image) = image {
            process.entry_point = image.entry_point;
            process.image_size = image.size;
        }

        if info.suspend_initial_thread {
            self.pending_suspended.insert(launched.pid);
        }
        self.processes.insert(launched.pid, process);
        Ok(launched.pid)
    }

    /// Attaches to a running process.
    pub fn attach(&mut self, pid: u32) -> Result<u32> {
        self.check_thread()?;
        self.ensure_running()?;

        let launched = {
            let mut port = lock(&self.port)?;
            port.attach(pid)?
        };

        info!("attached to pid {}", launched.pid);

        let process = Process::new(
            launched.process_handle,
            launched.pid,
            String::new(),
            crate::machine::context::CpuArch::X64,
        );
        self.processes.insert(launched.pid, process);
        Ok(launched.pid)
    }

    /// Resumes the initial thread of a process launched suspended.
    pub fn resume_launched_process(&mut self, pid: u32) -> Result<()> {
        self.check_thread()?;
        let port = Arc::clone(&self.port);
        let process = self.find_process_mut(pid)?;

        let handle = process
            .launched_suspended_thread
            .take()
            .ok_or_else(|| EngineError::wrong_state("process was not launched suspended"))?;

        let mut port = lock(&port)?;
        port.resume_thread(handle)?;
        Ok(())
    }

    pub fn terminate(&mut self, pid: u32) -> Result<()> {
        self.check_thread()?;
        {
            let process = self.find_process_mut(pid)?;
            process.terminating = true;
        }
        {
            let mut port = lock(&self.port)?;
            port.terminate(pid)?;
        }
        // let the exit events flow
        if self.stopped_event_pid() == Some(pid) {
            self.cleanup_and_continue(true)?;
        }
        Ok(())
    }

    /// Detaches, restoring every patched byte so the debuggee runs clean.
    pub fn detach(&mut self, pid: u32) -> Result<()> {
        self.check_thread()?;
        {
            let process = self.find_process_mut(pid)?;
            if let Some(machine) = process.machine.as_mut() {
                machine.unpatch_all()?;
            }
            process.deleted = true;
        }
        if self.stopped_event_pid() == Some(pid) {
            self.cleanup_and_continue(true)?;
        }
        {
            let mut port = lock(&self.port)?;
            port.detach(pid)?;
        }
        self.processes.remove(&pid);
        Ok(())
    }

    /// Requests an asynchronous break. The stop arrives later as a break
    /// event through the normal dispatch path.
    pub fn break_into(&mut self, pid: u32) -> Result<()> {
        self.check_thread()?;
        {
            let process = self.find_process_mut(pid)?;
            process.ensure_alive()?;
            process.await_break = true;
        }
        let mut port = lock(&self.port)?;
        port.break_into(pid)
    }

    /// Tears the engine down: every debuggee is terminated and the
    /// registry cleared. Safe to call more than once and from any thread.
    pub fn shutdown(&mut self) -> Result<()> {
        if self.shut_down {
            return Ok(());
        }
        self.shut_down = true;

        if let Some(event) = self.last_event.take() {
            let mut port = lock(&self.port)?;
            if let Some(handle) = event.image_file_handle() {
                let _ = port.close_handle(handle);
            }
            let _ = port.continue_event(event.pid, event.tid, true);
        }

        let pids: Vec<u32> = self.processes.keys().copied().collect();
        {
            let mut port = lock(&self.port)?;
            for pid in pids {
                if let Err(err) = port.terminate(pid) {
                    warn!("terminate of pid {} during shutdown failed: {}", pid, err);
                }
            }
        }
        self.processes.clear();
        Ok(())
    }

    fn ensure_running(&self) -> Result<()> {
        if self.shut_down {
            return Err(EngineError::wrong_state("engine is shut down"));
        }
        Ok(())
    }

    // -- event pump ----------------------------------------------------

    /// Blocks up to `timeout_ms` for the next debug event. Returns whether
    /// an event is now pending dispatch.
    pub fn wait_for_event(&mut self, timeout_ms: u32) -> Result<bool> {
        self.check_thread()?;
        self.ensure_running()?;
        if self.last_event.is_some() {
            return Err(EngineError::wrong_state("an event is already pending"));
        }

        let event = {
            let mut port = lock(&self.port)?;
            port.wait_event(timeout_ms)?
        };

        match event {
            Some(event) => {
                self.last_event = Some(event);
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// Dispatches the pending event. Returns true when the debuggee is
    /// left stopped for the caller; otherwise it has been continued.
    pub fn dispatch_event(&mut self) -> Result<bool> {
        self.check_thread()?;
        let event = self
            .last_event
            .clone()
            .ok_or_else(|| EngineError::wrong_state("no event is pending"))?;

        let pid = event.pid;
        let tid = event.tid;

        if let Some(process) = self.processes.get_mut(&pid) {
            // stopped until the dispatcher or the caller continues
            process.stopped = true;
            if let Some(machine) = process.machine.as_mut() {
                machine.on_stopped(tid);
            }
        } else if !matches!(event.payload, PortPayload::CreateProcess { .. }) {
            // event for a process we never registered
            warn!("event for unknown pid {}", pid);
            self.cleanup_and_continue(true)?;
            return Ok(false);
        }

        let stopped = match event.payload.clone() {
            PortPayload::CreateProcess {
                process_handle,
                thread_handle,
                image_base,
                image_size,
                entry_point,
                start_address,
                teb_base,
                image_path,
                arch,
                ..
            } => {
                debug!("create process {} ({})", pid, image_path);
                let port = Arc::clone(&self.port);
                let process = self
                    .processes
                    .entry(pid)
                    .or_insert_with(|| Process::new(process_handle, pid, image_path.clone(), arch));

                process.arch = arch;
                process.entry_point = entry_point;
                process.image_base = image_base;
                // Win32 reports a zero size here; keep the size probed
                // from the image file in that case
                if image_size != 0 {
                    process.image_size = image_size;
                }
                process.started = true;
                if self.pending_suspended.remove(&pid) {
                    process.launched_suspended_thread = Some(thread_handle);
                }

                let mut machine = Machine::new(pid, arch, port);
                machine.on_thread_start(tid, thread_handle)?;
                process.machine = Some(machine);
                process.add_thread(Thread::new(thread_handle, tid, start_address, teb_base));

                let module_size = process.image_size;
                let mut main_module = Module::new(image_base, module_size, image_path);
                main_module.machine = match arch {
                    crate::machine::context::CpuArch::I386 => image::MACHINE_I386,
                    crate::machine::context::CpuArch::X64 => image::MACHINE_AMD64,
                };
                process.add_module(main_module);

                let process = &self.processes[&pid];
                self.callback.on_process_start(process);
                if let Some(module) = process.os_module() {
                    self.callback.on_module_load(process, module);
                }
                if let Some(thread) = process.find_thread(tid) {
                    self.callback.on_thread_start(process, thread);
                }
                false
            }

            PortPayload::CreateThread {
                thread_handle,
                start_address,
                teb_base,
            } => {
                let process = self.find_process_mut(pid)?;
                process.add_thread(Thread::new(thread_handle, tid, start_address, teb_base));
                if let Some(machine) = process.machine.as_mut() {
                    machine.on_thread_start(tid, thread_handle)?;
                }

                let process = &self.processes[&pid];
                if let Some(thread) = process.find_thread(tid) {
                    self.callback.on_thread_start(process, thread);
                }
                false
            }

            PortPayload::ExitThread { exit_code } => {
                {
                    let process = &self.processes[&pid];
                    self.callback.on_thread_exit(process, tid, exit_code);
                }
                let process = self.find_process_mut(pid)?;
                if let Some(machine) = process.machine.as_mut() {
                    machine.on_thread_exit(tid)?;
                }
                process.remove_thread(tid);
                false
            }

            PortPayload::ExitProcess { exit_code } => {
                info!("process {} exited with code {}", pid, exit_code);
                if let Some(process) = self.processes.get_mut(&pid) {
                    process.deleted = true;
                    process.machine = None;
                }
                self.callback.on_process_exit(pid, exit_code);
                self.cleanup_and_continue(true)?;
                self.processes.remove(&pid);
                return Ok(false);
            }

            PortPayload::LoadModule {
                image_base,
                image_size,
                image_path,
                debug_info_offset,
                debug_info_size,
                ..
            } => {
                let process = self.find_process_mut(pid)?;
                let mut module = Module::new(image_base, image_size, image_path);
                module.debug_info_offset = debug_info_offset;
                module.debug_info_size = debug_info_size;
                process.add_module(module);

                let process = &self.processes[&pid];
                if let Some(module) = process.find_module(image_base) {
                    self.callback.on_module_load(process, module);
                }
                false
            }

            PortPayload::UnloadModule { image_base } => {
                let process = self.find_process_mut(pid)?;
                process.mark_module_unloaded(image_base);

                let process = &self.processes[&pid];
                self.callback.on_module_unload(process, image_base);
                false
            }

            PortPayload::OutputString {
                address,
                char_count,
                wide,
            } => {
                let text = self.read_debug_string(pid, address, char_count, wide)?;
                let process = &self.processes[&pid];
                self.callback.on_output_string(process, &text);
                false
            }

            PortPayload::Exception {
                first_chance,
                record,
            } => self.dispatch_exception(pid, tid, first_chance, &record)?,

            PortPayload::Unknown => false,
        };

        if stopped {
            Ok(true)
        } else {
            self.cleanup_and_continue(true)?;
            Ok(false)
        }
    }

    fn dispatch_exception(
        &mut self,
        pid: u32,
        tid: u32,
        first_chance: bool,
        record: &event::ExceptionRecord,
    ) -> Result<bool> {
        let machine_result = {
            let process = self
                .processes
                .get_mut(&pid)
                .ok_or(EngineError::ProcessNotFound { pid })?;
            let machine = process
                .machine
                .as_mut()
                .ok_or_else(|| EngineError::wrong_state("process has no machine yet"))?;

            let callback = &mut self.callback;
            let mut probe =
                |address: u64| callback.on_call_probe(pid, tid, address) == RunMode::Break;
            machine.on_exception(tid, record, &mut probe)
        };

        let machine_result = match machine_result {
            Ok(result) => result,
            Err(err) => {
                let process = &self.processes[&pid];
                self.callback.on_error(process, &err, EventKind::Exception);
                return Ok(true);
            }
        };

        match machine_result {
            MachineResult::HandledContinue => Ok(false),

            MachineResult::PendingStep => {
                let process = &self.processes[&pid];
                self.callback.on_step_complete(process, tid);
                Ok(true)
            }

            MachineResult::PendingBp {
                address,
                cookies,
                embedded,
            } => {
                // the loader's own breakpoint announces a settled module
                // list; it raises from inside the OS module, so a trap
                // anywhere else is the debuggee's own
                let process = &self.processes[&pid];
                let at_loader_bp = embedded
                    && !process.reached_loader_bp
                    && process
                        .os_module()
                        .map_or(false, |module| module.contains(address));
                if at_loader_bp {
                    let process = self.find_process_mut(pid)?;
                    process.reached_loader_bp = true;
                    let process = &self.processes[&pid];
                    self.callback.on_load_complete(process, tid);
                    return Ok(true);
                }

                if embedded && self.processes[&pid].await_break {
                    let process = self.find_process_mut(pid)?;
                    process.await_break = false;
                    let process = &self.processes[&pid];
                    self.callback.on_async_break_complete(process, tid);
                    return Ok(true);
                }

                let process = &self.processes[&pid];
                let mode = self
                    .callback
                    .on_breakpoint(process, tid, address, &cookies, embedded);
                Ok(mode != RunMode::Run)
            }

            MachineResult::NotHandled => {
                let process = &self.processes[&pid];
                let mode = self
                    .callback
                    .on_exception(process, tid, first_chance, record);
                if mode == RunMode::Run {
                    // pass the exception on to the debuggee unhandled
                    self.cleanup_and_continue(false)?;
                    Ok(false)
                } else {
                    Ok(true)
                }
            }
        }
    }

    /// Resumes a debuggee stopped at an event. `handled` applies to
    /// exception events: whether the exception is swallowed or passed on.
    pub fn continue_debug(&mut self, handled: bool) -> Result<()> {
        self.check_thread()?;
        let pid = self
            .stopped_event_pid()
            .ok_or_else(|| EngineError::wrong_state("no stopped event to continue from"))?;
        self.cleanup_and_continue(handled)?;
        if let Some(process) = self.processes.get_mut(&pid) {
            process.stopped = false;
        }
        Ok(())
    }

    fn stopped_event_pid(&self) -> Option<u32> {
        self.last_event.as_ref().map(|event| event.pid)
    }

    /// Closes the event's file handle exactly once, lets the machine fix
    /// up breakpoints and flush the context, and continues the debuggee.
    fn cleanup_and_continue(&mut self, handled: bool) -> Result<()> {
        let event = match self.last_event.take() {
            Some(event) => event,
            None => return Ok(()),
        };

        if let Some(process) = self.processes.get_mut(&event.pid) {
            if !process.deleted {
                if let Some(machine) = process.machine.as_mut() {
                    machine.on_continue()?;
                }
            }
            process.stopped = false;
        }

        let mut port = lock(&self.port)?;
        if let Some(handle) = event.image_file_handle() {
            port.close_handle(handle)?;
        }
        port.continue_event(event.pid, event.tid, handled)
    }

    fn read_debug_string(
        &mut self,
        pid: u32,
        address: u64,
        char_count: u32,
        wide: bool,
    ) -> Result<String> {
        let byte_len = char_count as usize * if wide { 2 } else { 1 };
        let mut buf = vec![0u8; byte_len];
        let read = {
            let mut port = lock(&self.port)?;
            let (read, _) = port.read_memory(pid, address, &mut buf)?;
            read
        };
        buf.truncate(read);

        let text = if wide {
            let units: Vec<u16> = buf
                .chunks_exact(2)
                .map(|pair| u16::from_le_bytes([pair[0], pair[1]]))
                .collect();
            String::from_utf16_lossy(&units)
        } else {
            String::from_utf8_lossy(&buf).into_owned()
        };
        Ok(text.trim_end_matches('\0').to_string())
    }

    // -- breakpoints and stepping --------------------------------------

    pub fn set_breakpoint(&mut self, pid: u32, address: u64, cookie: Cookie) -> Result<()> {
        self.check_thread()?;
        let process = self.find_process_mut(pid)?;
        process.ensure_alive()?;
        process
            .machine
            .as_mut()
            .ok_or_else(|| EngineError::wrong_state("process has no machine yet"))?
            .set_breakpoint(address, cookie)
    }

    pub fn remove_breakpoint(&mut self, pid: u32, address: u64, cookie: Cookie) -> Result<()> {
        self.check_thread()?;
        let process = self.find_process_mut(pid)?;
        process.ensure_alive()?;
        process
            .machine
            .as_mut()
            .ok_or_else(|| EngineError::wrong_state("process has no machine yet"))?
            .remove_breakpoint(address, cookie)
    }

    pub fn step_instruction(&mut self, pid: u32, step_in: bool) -> Result<()> {
        self.check_thread()?;
        self.stopped_machine(pid)?.set_step_instruction(step_in)
    }

    pub fn step_range(
        &mut self,
        pid: u32,
        step_in: bool,
        source_mode: bool,
        ranges: Vec<AddressRange>,
    ) -> Result<()> {
        self.check_thread()?;
        self.stopped_machine(pid)?
            .set_step_range(step_in, source_mode, ranges)
    }

    pub fn step_out(&mut self, pid: u32, target_address: u64) -> Result<()> {
        self.check_thread()?;
        self.stopped_machine(pid)?.set_step_out(target_address)
    }

    pub fn cancel_step(&mut self, pid: u32) -> Result<()> {
        self.check_thread()?;
        self.stopped_machine(pid)?.cancel_step()
    }

    fn stopped_machine(&mut self, pid: u32) -> Result<&mut Machine> {
        let process = self
            .processes
            .get_mut(&pid)
            .ok_or(EngineError::ProcessNotFound { pid })?;
        process.ensure_alive()?;
        if !process.stopped {
            return Err(EngineError::wrong_state("process is not stopped"));
        }
        process
            .machine
            .as_mut()
            .ok_or_else(|| EngineError::wrong_state("process has no machine yet"))
    }

    // -- memory and context --------------------------------------------

    /// Breakpoint-transparent read on the controller thread. For reads
    /// from other threads use [`Exec::memory_access`].
    pub fn read_memory(&self, pid: u32, address: u64, buf: &mut [u8]) -> Result<(usize, usize)> {
        let process = self.find_process(pid)?;
        process
            .machine
            .as_ref()
            .ok_or_else(|| EngineError::wrong_state("process has no machine yet"))?
            .read_memory(address, buf)
    }

    /// Breakpoint-safe write.
    pub fn write_memory(&mut self, pid: u32, address: u64, data: &[u8]) -> Result<usize> {
        self.check_thread()?;
        let process = self.find_process_mut(pid)?;
        process.ensure_alive()?;
        process
            .machine
            .as_mut()
            .ok_or_else(|| EngineError::wrong_state("process has no machine yet"))?
            .write_memory(address, data)
    }

    pub fn get_thread_context(&self, pid: u32, tid: u32, flags: u32) -> Result<ThreadContext> {
        self.check_thread()?;
        let process = self.find_process(pid)?;
        if process.find_thread(tid).is_none() {
            return Err(EngineError::ThreadNotFound { tid });
        }
        process
            .machine
            .as_ref()
            .ok_or_else(|| EngineError::wrong_state("process has no machine yet"))?
            .get_context(tid, flags)
    }

    pub fn set_thread_context(&mut self, pid: u32, tid: u32, context: &ThreadContext) -> Result<()> {
        self.check_thread()?;
        let process = self.find_process_mut(pid)?;
        if process.find_thread(tid).is_none() {
            return Err(EngineError::ThreadNotFound { tid });
        }
        process
            .machine
            .as_mut()
            .ok_or_else(|| EngineError::wrong_state("process has no machine yet"))?
            .set_context(tid, context)
    }

    /// A free-threaded memory reader bound to `pid`.
    pub fn memory_access(&self, pid: u32) -> Result<MemoryAccess> {
        let process = self.find_process(pid)?;
        let machine = process
            .machine
            .as_ref()
            .ok_or_else(|| EngineError::wrong_state("process has no machine yet"))?;
        Ok(MemoryAccess {
            port: Arc::clone(&self.port),
            bps: machine.breakpoints(),
            pid,
        })
    }

    // -- registry views ------------------------------------------------

    pub fn process(&self, pid: u32) -> Option<&Process> {
        self.processes.get(&pid)
    }

    pub fn processes(&self) -> impl Iterator<Item = &Process> {
        self.processes.values()
    }
}

impl Drop for Exec {
    fn drop(&mut self) {
        if let Err(err) = self.shutdown() {
            warn!("shutdown during drop failed: {}", err);
        }
    }
}
