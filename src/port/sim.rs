//! Deterministic in-memory debug target.
//!
//! `SimPort` models just enough of a debuggee for the engine to be
//! exercised end to end on any OS: a region-map address space, a handful
//! of x64 instructions, round-robin thread scheduling, trap-flag single
//! stepping, and the same event protocol the Win32 backend produces
//! (create, loads, the loader's own trap byte, exceptions, exits).
//!
//! Programs are registered by path before launch. Placing `0xCC` at the
//! entry point reproduces the loader breakpoint; real code follows it.
//!
//! Understood opcodes: `90` nop, `CC` trap, `E8 rel32` call, `C3` ret
//! (thread exits on an empty stack), `EB rel8` / `E9 rel32` jmp,
//! `F3 A4` rep movsb (executed as one unit), `F4` thread exit. Anything
//! else raises an illegal-instruction exception.

use std::collections::{BTreeMap, BTreeSet, HashMap, VecDeque};

use log::debug;

use crate::error::{EngineError, Result};
use crate::exec::event::{ExceptionRecord, EXCEPTION_BREAKPOINT, EXCEPTION_SINGLE_STEP};
use crate::machine::context::{
    copy_context, CpuArch, ThreadContext, CTX_ALL, GPR_SP, TRACE_FLAG,
};
use crate::port::{DebugPort, LaunchInfo, LaunchedProcess, PortEvent, PortPayload, RawHandle};

pub const EXCEPTION_ACCESS_VIOLATION: u32 = 0xC000_0005;
pub const EXCEPTION_ILLEGAL_INSTRUCTION: u32 = 0xC000_001D;

/// Per-wait budget of simulated instructions, so a runaway debuggee turns
/// into a timeout instead of a hang.
const STEP_BUDGET: u32 = 10_000;

/// Shim mapped into every process: a trap byte and a thread exit, used to
/// service `break_into` with a real injected thread, the way the OS does.
const BREAK_SHIM_BASE: u64 = 0x6000_0000;
const BREAK_SHIM_CODE: [u8; 2] = [0xCC, 0xF4];

/// An extra module reported at launch.
#[derive(Debug, Clone)]
pub struct SimModule {
    pub base: u64,
    pub size: u32,
    pub path: String,
}

/// A registered debuggee image.
#[derive(Debug, Clone, Default)]
pub struct SimProgram {
    pub image_base: u64,
    pub image_size: u32,
    /// Where execution starts; put a trap byte here for loader-breakpoint
    /// behavior.
    pub entry_point: u64,
    /// Initial memory regions as (base, bytes).
    pub regions: Vec<(u64, Vec<u8>)>,
    pub modules: Vec<SimModule>,
}

struct SimThread {
    tid: u32,
    handle: RawHandle,
    suspend_count: u32,
    context: ThreadContext,
}

struct SimProcess {
    threads: BTreeMap<u32, SimThread>,
    memory: BTreeMap<u64, Vec<u8>>,
    next_tid: u32,
    /// Round-robin scheduling position.
    cursor: u32,
    /// An event from this process was delivered and not continued yet.
    halted: bool,
    exited: bool,
}

impl SimProcess {
    fn next_runnable(&mut self) -> Option<u32> {
        let runnable: Vec<u32> = self
            .threads
            .values()
            .filter(|t| t.suspend_count == 0)
            .map(|t| t.tid)
            .collect();
        if runnable.is_empty() {
            return None;
        }
        let tid = runnable
            .iter()
            .copied()
            .find(|&tid| tid > self.cursor)
            .unwrap_or(runnable[0]);
        self.cursor = tid;
        Some(tid)
    }
}

/// The simulated debug port.
pub struct SimPort {
    programs: HashMap<String, SimProgram>,
    procs: BTreeMap<u32, SimProcess>,
    pending: VecDeque<PortEvent>,
    /// Image-file handles the engine must close exactly once.
    file_handles: BTreeSet<RawHandle>,
    closed_file_handles: Vec<RawHandle>,
    next_handle: RawHandle,
    next_pid: u32,
}

impl Default for SimPort {
    fn default() -> Self {
        SimPort::new()
    }
}

impl SimPort {
    pub fn new() -> Self {
        SimPort {
            programs: HashMap::new(),
            procs: BTreeMap::new(),
            pending: VecDeque::new(),
            file_handles: BTreeSet::new(),
            closed_file_handles: Vec::new(),
            next_handle: 0x100,
            next_pid: 1000,
        }
    }

    /// Registers a program under a path for a later launch.
    pub fn register_program(&mut self, path: impl Into<String>, program: SimProgram) {
        self.programs.insert(path.into(), program);
    }

    /// Starts an extra thread in a running process; the create event
    /// arrives through the normal stream.
    pub fn spawn_thread(&mut self, pid: u32, start: u64) -> Result<u32> {
        let handle = self.alloc_handle();
        let proc = self
            .procs
            .get_mut(&pid)
            .ok_or(EngineError::ProcessNotFound { pid })?;
        let tid = proc.next_tid;
        proc.next_tid += 1;

        let mut context = ThreadContext::empty(CpuArch::X64);
        context.flags = CTX_ALL;
        context.pc = start;
        proc.threads.insert(
            tid,
            SimThread {
                tid,
                handle,
                suspend_count: 0,
                context,
            },
        );
        self.pending.push_back(PortEvent {
            pid,
            tid,
            payload: PortPayload::CreateThread {
                thread_handle: handle,
                start_address: start,
                teb_base: 0,
            },
        });
        Ok(tid)
    }

    /// Image-file handles issued but never closed. Zero once the engine
    /// has processed all create/load events.
    pub fn open_file_handles(&self) -> usize {
        self.file_handles.len()
    }

    pub fn closed_file_handles(&self) -> usize {
        self.closed_file_handles.len()
    }

    /// Current suspend count of a live thread.
    pub fn suspend_count(&self, tid: u32) -> Option<u32> {
        self.procs
            .values()
            .find_map(|p| p.threads.get(&tid))
            .map(|t| t.suspend_count)
    }

    /// Raw byte of target memory, bypassing the engine entirely.
    pub fn peek(&self, pid: u32, address: u64) -> Option<u8> {
        let proc = self.procs.get(&pid)?;
        let (base, data) = region_for(&proc.memory, address)?;
        Some(data[(address - base) as usize])
    }

    fn alloc_handle(&mut self) -> RawHandle {
        let handle = self.next_handle;
        self.next_handle += 1;
        handle
    }

    fn alloc_file_handle(&mut self) -> RawHandle {
        let handle = self.alloc_handle();
        self.file_handles.insert(handle);
        handle
    }

    fn find_thread_mut(&mut self, tid: u32) -> Result<&mut SimThread> {
        self.procs
            .values_mut()
            .find_map(|p| p.threads.get_mut(&tid))
            .ok_or(EngineError::ThreadNotFound { tid })
    }

    fn thread_by_handle_mut(&mut self, handle: RawHandle) -> Option<&mut SimThread> {
        self.procs
            .values_mut()
            .find_map(|p| p.threads.values_mut().find(|t| t.handle == handle))
    }

    /// Runs the VM for one process until it produces at least one event or
    /// the budget runs out.
    fn run_vm(&mut self, pid: u32) {
        for _ in 0..STEP_BUDGET {
            let proc = match self.procs.get_mut(&pid) {
                Some(p) if !p.halted && !p.exited => p,
                _ => return,
            };
            let tid = match proc.next_runnable() {
                Some(tid) => tid,
                None => return,
            };

            let before = self.pending.len();
            self.step_thread(pid, tid);
            if self.pending.len() > before {
                return;
            }
        }
    }

    fn step_thread(&mut self, pid: u32, tid: u32) {
        enum Outcome {
            Ran,
            Raise(u32, u64),
            Exit,
        }

        let outcome = {
            let proc = match self.procs.get_mut(&pid) {
                Some(p) => p,
                None => return,
            };
            let thread = match proc.threads.get_mut(&tid) {
                Some(t) => t,
                None => return,
            };

            let pc = thread.context.pc;
            let trace = thread.context.eflags & TRACE_FLAG != 0;

            let outcome = match read_bytes(&proc.memory, pc, 8) {
                None => Outcome::Raise(EXCEPTION_ACCESS_VIOLATION, pc),
                Some(opcode) => match opcode[0] {
                    0x90 => {
                        thread.context.pc = pc + 1;
                        Outcome::Ran
                    }
                    0xCC => {
                        thread.context.pc = pc + 1;
                        Outcome::Raise(EXCEPTION_BREAKPOINT, pc)
                    }
                    0xE8 => {
                        let rel =
                            i32::from_le_bytes([opcode[1], opcode[2], opcode[3], opcode[4]]);
                        let ret = pc + 5;
                        thread.context.gpr[GPR_SP] = thread.context.gpr[GPR_SP].wrapping_sub(8);
                        let sp = thread.context.gpr[GPR_SP];
                        if write_bytes(&mut proc.memory, sp, &ret.to_le_bytes()) != 8 {
                            Outcome::Raise(EXCEPTION_ACCESS_VIOLATION, sp)
                        } else {
                            thread.context.pc = ret.wrapping_add(rel as i64 as u64);
                            Outcome::Ran
                        }
                    }
                    0xC3 => {
                        let sp = thread.context.gpr[GPR_SP];
                        match read_bytes(&proc.memory, sp, 8) {
                            Some(bytes) => {
                                thread.context.gpr[GPR_SP] = sp + 8;
                                thread.context.pc = u64::from_le_bytes([
                                    bytes[0], bytes[1], bytes[2], bytes[3], bytes[4], bytes[5],
                                    bytes[6], bytes[7],
                                ]);
                                Outcome::Ran
                            }
                            // nothing to return to
                            None => Outcome::Exit,
                        }
                    }
                    0xEB => {
                        let rel = opcode[1] as i8;
                        thread.context.pc = (pc + 2).wrapping_add(rel as i64 as u64);
                        Outcome::Ran
                    }
                    0xE9 => {
                        let rel =
                            i32::from_le_bytes([opcode[1], opcode[2], opcode[3], opcode[4]]);
                        thread.context.pc = (pc + 5).wrapping_add(rel as i64 as u64);
                        Outcome::Ran
                    }
                    0xF3 if opcode[1] == 0xA4 => {
                        thread.context.pc = pc + 2;
                        Outcome::Ran
                    }
                    0xF4 => Outcome::Exit,
                    _ => Outcome::Raise(EXCEPTION_ILLEGAL_INSTRUCTION, pc),
                },
            };

            match outcome {
                Outcome::Ran if trace => {
                    thread.context.eflags &= !TRACE_FLAG;
                    Outcome::Raise(EXCEPTION_SINGLE_STEP, thread.context.pc)
                }
                Outcome::Raise(code, address) => {
                    thread.context.eflags &= !TRACE_FLAG;
                    Outcome::Raise(code, address)
                }
                other => other,
            }
        };

        match outcome {
            Outcome::Ran => {}
            Outcome::Raise(code, address) => self.raise(pid, tid, code, address),
            Outcome::Exit => self.exit_thread(pid, tid, 0),
        }
    }

    fn raise(&mut self, pid: u32, tid: u32, code: u32, address: u64) {
        debug!("sim raise {:#x} at {:#x} (pid {}, tid {})", code, address, pid, tid);
        self.pending.push_back(PortEvent {
            pid,
            tid,
            payload: PortPayload::Exception {
                first_chance: true,
                record: ExceptionRecord::new(code, address),
            },
        });
    }

    fn exit_thread(&mut self, pid: u32, tid: u32, exit_code: u32) {
        let proc = match self.procs.get_mut(&pid) {
            Some(p) => p,
            None => return,
        };
        proc.threads.remove(&tid);
        self.pending.push_back(PortEvent {
            pid,
            tid,
            payload: PortPayload::ExitThread { exit_code },
        });

        let all_gone = self.procs[&pid].threads.is_empty();
        if all_gone {
            if let Some(proc) = self.procs.get_mut(&pid) {
                proc.exited = true;
            }
            self.pending.push_back(PortEvent {
                pid,
                tid,
                payload: PortPayload::ExitProcess { exit_code },
            });
        }
    }
}

impl DebugPort for SimPort {
    fn launch(&mut self, info: &LaunchInfo) -> Result<LaunchedProcess> {
        let program = self
            .programs
            .get(&info.exe_path)
            .cloned()
            .ok_or_else(|| EngineError::LaunchFailed {
                path: info.exe_path.clone(),
                reason: "no such registered program".into(),
            })?;

        let pid = self.next_pid;
        self.next_pid += 1;
        let process_handle = self.alloc_handle();
        let thread_handle = self.alloc_handle();
        let image_file = self.alloc_file_handle();

        let mut memory = BTreeMap::new();
        for (base, bytes) in &program.regions {
            memory.insert(*base, bytes.clone());
        }
        memory.insert(BREAK_SHIM_BASE, BREAK_SHIM_CODE.to_vec());
        // a small stack for the initial thread
        let stack_base = 0x7000_0000u64;
        memory.insert(stack_base, vec![0u8; 0x1000]);

        let mut context = ThreadContext::empty(CpuArch::X64);
        context.flags = CTX_ALL;
        context.pc = program.entry_point;
        context.gpr[GPR_SP] = stack_base + 0x0F00;

        let tid = 1;
        let mut threads = BTreeMap::new();
        threads.insert(
            tid,
            SimThread {
                tid,
                handle: thread_handle,
                suspend_count: if info.suspend_initial_thread { 1 } else { 0 },
                context,
            },
        );

        self.procs.insert(
            pid,
            SimProcess {
                threads,
                memory,
                next_tid: 2,
                cursor: 0,
                halted: false,
                exited: false,
            },
        );

        self.pending.push_back(PortEvent {
            pid,
            tid,
            payload: PortPayload::CreateProcess {
                process_handle,
                thread_handle,
                image_file: Some(image_file),
                image_base: program.image_base,
                image_size: program.image_size,
                entry_point: program.entry_point,
                start_address: program.entry_point,
                teb_base: 0,
                image_path: info.exe_path.clone(),
                arch: CpuArch::X64,
            },
        });

        for module in &program.modules {
            let handle = self.alloc_file_handle();
            self.pending.push_back(PortEvent {
                pid,
                tid,
                payload: PortPayload::LoadModule {
                    image_file: Some(handle),
                    image_base: module.base,
                    image_size: module.size,
                    image_path: module.path.clone(),
                    debug_info_offset: 0,
                    debug_info_size: 0,
                },
            });
        }

        Ok(LaunchedProcess {
            pid,
            process_handle,
        })
    }

    fn attach(&mut self, pid: u32) -> Result<LaunchedProcess> {
        Err(EngineError::AttachFailed {
            pid,
            reason: "attach is not modeled by the simulator".into(),
        })
    }

    fn wait_event(&mut self, _timeout_ms: u32) -> Result<Option<PortEvent>> {
        if self.pending.is_empty() {
            let pids: Vec<u32> = self.procs.keys().copied().collect();
            for pid in pids {
                self.run_vm(pid);
                if !self.pending.is_empty() {
                    break;
                }
            }
        }

        match self.pending.pop_front() {
            Some(event) => {
                if let Some(proc) = self.procs.get_mut(&event.pid) {
                    proc.halted = true;
                }
                Ok(Some(event))
            }
            None => Ok(None),
        }
    }

    fn continue_event(&mut self, pid: u32, _tid: u32, _handled: bool) -> Result<()> {
        let remove = match self.procs.get_mut(&pid) {
            Some(proc) => {
                proc.halted = false;
                proc.exited && !self.pending.iter().any(|e| e.pid == pid)
            }
            None => false,
        };
        if remove {
            self.procs.remove(&pid);
        }
        Ok(())
    }

    fn terminate(&mut self, pid: u32) -> Result<()> {
        let proc = self
            .procs
            .get_mut(&pid)
            .ok_or(EngineError::ProcessNotFound { pid })?;
        if proc.exited {
            return Ok(());
        }
        let tid = proc.threads.keys().next().copied().unwrap_or(1);
        proc.threads.clear();
        proc.exited = true;
        self.pending.push_back(PortEvent {
            pid,
            tid,
            payload: PortPayload::ExitProcess { exit_code: 1 },
        });
        Ok(())
    }

    fn detach(&mut self, pid: u32) -> Result<()> {
        self.procs.remove(&pid);
        self.pending.retain(|e| e.pid != pid);
        Ok(())
    }

    fn break_into(&mut self, pid: u32) -> Result<()> {
        // an injected thread runs the trap shim, like a remote break thread
        self.spawn_thread(pid, BREAK_SHIM_BASE)?;
        Ok(())
    }

    fn read_memory(&mut self, pid: u32, address: u64, buf: &mut [u8]) -> Result<(usize, usize)> {
        let proc = self
            .procs
            .get(&pid)
            .ok_or(EngineError::ProcessNotFound { pid })?;

        let mut read = 0usize;
        if let Some((base, data)) = region_for(&proc.memory, address) {
            let offset = (address - base) as usize;
            read = buf.len().min(data.len() - offset);
            buf[..read].copy_from_slice(&data[offset..offset + read]);
        }

        let mut unreadable = 0usize;
        let remaining = buf.len() - read;
        if remaining > 0 {
            let hole_start = address + read as u64;
            unreadable = match proc.memory.range(hole_start..).next() {
                Some((&next_base, _)) => remaining.min((next_base - hole_start) as usize),
                None => remaining,
            };
        }

        Ok((read, unreadable))
    }

    fn write_memory(&mut self, pid: u32, address: u64, data: &[u8]) -> Result<usize> {
        let proc = self
            .procs
            .get_mut(&pid)
            .ok_or(EngineError::ProcessNotFound { pid })?;
        let written = write_bytes(&mut proc.memory, address, data);
        if written == 0 && !data.is_empty() {
            return Err(EngineError::MemoryAccess {
                address,
                reason: "address is not mapped".into(),
            });
        }
        Ok(written)
    }

    fn get_context(&mut self, tid: u32, flags: u32) -> Result<ThreadContext> {
        let thread = self.find_thread_mut(tid)?;
        let mut out = ThreadContext::empty(thread.context.arch);
        copy_context(flags, &thread.context, &mut out);
        out.flags = flags;
        Ok(out)
    }

    fn set_context(&mut self, tid: u32, context: &ThreadContext) -> Result<()> {
        let thread = self.find_thread_mut(tid)?;
        copy_context(context.flags, context, &mut thread.context);
        Ok(())
    }

    fn suspend_thread(&mut self, handle: RawHandle) -> Result<()> {
        match self.thread_by_handle_mut(handle) {
            Some(thread) => {
                thread.suspend_count += 1;
                Ok(())
            }
            // exited threads report access denied, like the OS
            None => Err(EngineError::AccessDenied),
        }
    }

    fn resume_thread(&mut self, handle: RawHandle) -> Result<()> {
        match self.thread_by_handle_mut(handle) {
            Some(thread) => {
                thread.suspend_count = thread.suspend_count.saturating_sub(1);
                Ok(())
            }
            None => Err(EngineError::AccessDenied),
        }
    }

    fn close_handle(&mut self, handle: RawHandle) -> Result<()> {
        if self.file_handles.remove(&handle) {
            self.closed_file_handles.push(handle);
            return Ok(());
        }
        if self.closed_file_handles.contains(&handle) {
            return Err(EngineError::Port {
                reason: format!("double close of handle {:#x}", handle),
            });
        }
        // process and thread handles close silently
        Ok(())
    }
}

fn region_for(memory: &BTreeMap<u64, Vec<u8>>, address: u64) -> Option<(u64, &Vec<u8>)> {
    let (&base, data) = memory.range(..=address).next_back()?;
    if address < base + data.len() as u64 {
        Some((base, data))
    } else {
        None
    }
}

/// Copies up to 8 bytes starting at `address`, zero padded past the end of
/// the region. None when the first byte is unmapped.
fn read_bytes(memory: &BTreeMap<u64, Vec<u8>>, address: u64, len: usize) -> Option<[u8; 8]> {
    let (base, data) = region_for(memory, address)?;
    let offset = (address - base) as usize;
    let avail = (data.len() - offset).min(len);
    let mut out = [0u8; 8];
    out[..avail].copy_from_slice(&data[offset..offset + avail]);
    Some(out)
}

fn write_bytes(memory: &mut BTreeMap<u64, Vec<u8>>, address: u64, bytes: &[u8]) -> usize {
    let base = match memory.range(..=address).next_back() {
        Some((&base, data)) if address < base + data.len() as u64 => base,
        _ => return 0,
    };
    let data = memory.get_mut(&base).unwrap();
    let offset = (address - base) as usize;
    let count = bytes.len().min(data.len() - offset);
    data[offset..offset + count].copy_from_slice(&bytes[..count]);
    count
}
