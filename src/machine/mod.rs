//! Per-process machine controller.
//!
//! The machine owns everything that touches the target CPU and its code
//! bytes: the breakpoint table, the context cache for the stopped thread,
//! and the stepper attached to each thread. The dispatch loop feeds it raw
//! breakpoint and single-step exceptions; it answers with what should
//! happen next, and fixes up the world on continue so the debuggee never
//! observes our trap bytes.
//!
//! The continue-side protocol for a thread parked on a patched breakpoint:
//! take the trap byte out, step the thread away (trap flag or a planted
//! breakpoint for REP strings), suspend every other thread so none of them
//! can sail through the hole, and on the thread's next exception put the
//! trap back and wake the others. Each thread carries its own pending
//! restore, so step-away windows on different threads can overlap.

pub mod breakpoints;
pub mod context;
pub mod decode;
pub mod registers;
pub mod steppers;

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};

use log::{debug, warn};

use crate::error::{EngineError, Result};
use crate::exec::event::{Cookie, ExceptionRecord, EXCEPTION_BREAKPOINT, EXCEPTION_SINGLE_STEP};
use crate::machine::breakpoints::{BpPriority, BreakpointTable};
use crate::machine::context::{ContextCache, CpuArch, ThreadContext, CTX_CONTROL, TRACE_FLAG};
use crate::machine::decode::{CpuMode, TRAP_OPCODE};
use crate::machine::steppers::{
    make_resume_stepper, make_step_in_stepper, make_step_over_stepper, AddressRange, RangeStepper,
    RunToStepper, StepOutcome, Stepper, StepperMachine,
};
use crate::port::{lock, RawHandle, SharedPort};

/// Decides whether a probed call target is an acceptable step-in stop.
pub type CallProbe<'a> = dyn FnMut(u64) -> bool + 'a;

/// What the machine wants the dispatch loop to do with an exception.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MachineResult {
    /// Not the machine's exception; dispatch it as a plain exception.
    NotHandled,
    /// Consumed internally; continue the debuggee without a callback.
    HandledContinue,
    /// A step finished; report step-complete and stay stopped.
    PendingStep,
    /// A breakpoint stop; report it with the owners registered at the
    /// address. `embedded` marks a trap byte the engine never planted.
    PendingBp {
        address: u64,
        cookies: Vec<Cookie>,
        embedded: bool,
    },
}

#[derive(Default)]
struct ThreadState {
    handle: RawHandle,
    /// Stepper driving a user-requested step.
    stepper: Option<Box<dyn Stepper>>,
    /// Transient stepper moving the thread off an unpatched breakpoint.
    resume_stepper: Option<Box<dyn Stepper>>,
    /// Breakpoint waiting to get its trap byte back once this thread has
    /// stepped away from it.
    restore_bp: Option<u64>,
    /// This thread's step-away suspended the others.
    isolating: bool,
}

impl ThreadState {
    fn new(handle: RawHandle) -> Self {
        ThreadState {
            handle,
            stepper: None,
            resume_stepper: None,
            restore_bp: None,
            isolating: false,
        }
    }
}

/// Execution controller for one debuggee process.
pub struct Machine {
    pid: u32,
    arch: CpuArch,
    port: SharedPort,
    bps: Arc<Mutex<BreakpointTable>>,
    cache: ContextCache,
    threads: BTreeMap<u32, ThreadState>,

    stopped_tid: u32,
    stopped_on_exception: bool,
    /// Address of an embedded trap byte the stopped thread is parked on.
    embedded_bp_addr: Option<u64>,

    /// Open step-away isolation windows; new threads start suspended once
    /// per window.
    isolation_count: u32,
}

impl Machine {
    pub fn new(pid: u32, arch: CpuArch, port: SharedPort) -> Self {
        Machine {
            pid,
            arch,
            port,
            bps: Arc::new(Mutex::new(BreakpointTable::new())),
            cache: ContextCache::new(),
            threads: BTreeMap::new(),
            stopped_tid: 0,
            stopped_on_exception: false,
            embedded_bp_addr: None,
            isolation_count: 0,
        }
    }

    pub fn pid(&self) -> u32 {
        self.pid
    }

    pub fn arch(&self) -> CpuArch {
        self.arch
    }

    fn cpu_mode(&self) -> CpuMode {
        match self.arch {
            CpuArch::I386 => CpuMode::Mode32,
            CpuArch::X64 => CpuMode::Mode64,
        }
    }

    /// Shared handle to the breakpoint table, for free-threaded
    /// breakpoint-transparent reads.
    pub fn breakpoints(&self) -> Arc<Mutex<BreakpointTable>> {
        Arc::clone(&self.bps)
    }

    pub fn is_stopped_on_exception(&self) -> bool {
        self.stopped_on_exception
    }

    pub fn stopped_tid(&self) -> u32 {
        self.stopped_tid
    }

    // -- thread bookkeeping --------------------------------------------

    pub fn on_thread_start(&mut self, tid: u32, handle: RawHandle) -> Result<()> {
        self.threads.insert(tid, ThreadState::new(handle));

        // keep new threads out of any breakpoint hole that is being
        // restored
        if self.isolation_count > 0 {
            let port_arc = Arc::clone(&self.port);
            let mut port = lock(&port_arc)?;
            for _ in 0..self.isolation_count {
                suspend_quiet(&mut *port, handle);
            }
        }
        Ok(())
    }

    pub fn on_thread_exit(&mut self, tid: u32) -> Result<()> {
        let (stepper, resume) = match self.threads.get_mut(&tid) {
            Some(state) => (state.stepper.take(), state.resume_stepper.take()),
            None => (None, None),
        };

        if let Some(mut stepper) = stepper {
            let mut probe = no_probe();
            let mut services = self.services(tid, &mut probe);
            stepper.cancel(&mut services)?;
        }
        if let Some(mut resume) = resume {
            let mut probe = no_probe();
            let mut services = self.services(tid, &mut probe);
            resume.cancel(&mut services)?;
        }

        // the step-away will never land; put the trap back now
        self.restore_bp_environment(tid)?;
        self.threads.remove(&tid);
        Ok(())
    }

    /// Marks the thread an event stopped on. Called for every debug event
    /// before it is dispatched.
    pub fn on_stopped(&mut self, tid: u32) {
        self.stopped_tid = tid;
        self.stopped_on_exception = false;
    }

    // -- exception dispatch --------------------------------------------

    /// Routes a raised exception through the stepping machinery. `probe`
    /// answers step-in probes for call targets.
    pub fn on_exception(
        &mut self,
        tid: u32,
        record: &ExceptionRecord,
        probe: &mut CallProbe<'_>,
    ) -> Result<MachineResult> {
        self.stopped_tid = tid;
        self.stopped_on_exception = true;
        self.embedded_bp_addr = None;

        {
            let port_arc = Arc::clone(&self.port);
            let mut port = lock(&port_arc)?;
            self.cache.fill(&mut *port, tid)?;
        }

        match record.code {
            EXCEPTION_SINGLE_STEP => self.dispatch_single_step(tid, probe),
            EXCEPTION_BREAKPOINT => self.dispatch_breakpoint(tid, record.address, probe),
            _ => {
                // the thread faulted instead of finishing its step-away;
                // put the trap back and wake the others before reporting
                if let Some(mut resume) = self.take_resume_stepper(tid) {
                    let mut probe = no_probe();
                    let mut services = self.services(tid, &mut probe);
                    resume.cancel(&mut services)?;
                }
                self.restore_bp_environment(tid)?;
                Ok(MachineResult::NotHandled)
            }
        }
    }

    fn dispatch_single_step(
        &mut self,
        tid: u32,
        probe: &mut CallProbe<'_>,
    ) -> Result<MachineResult> {
        self.cache.set_single_step(false);
        self.restore_bp_environment(tid)?;

        let address = self
            .cache
            .pc()
            .ok_or_else(|| EngineError::wrong_state("no cached context for stopped thread"))?;

        if let Some(mut stepper) = self.take_stepper(tid) {
            let result = {
                let mut services = self.services(tid, probe);
                stepper.on_single_step(&mut services, address)
            };
            let complete = stepper.is_complete();
            if !complete {
                self.put_stepper(tid, stepper);
            }
            match result? {
                StepOutcome::HandledStopped => return Ok(MachineResult::PendingStep),
                StepOutcome::HandledContinue => return Ok(MachineResult::HandledContinue),
                StepOutcome::NotHandled => {}
            }
        }

        if let Some(mut resume) = self.take_resume_stepper(tid) {
            let result = {
                let mut services = self.services(tid, probe);
                resume.on_single_step(&mut services, address)
            };
            let complete = resume.is_complete();
            if !complete {
                self.put_resume_stepper(tid, resume);
            }
            // a resume step never surfaces as a stop
            match result? {
                StepOutcome::NotHandled => {}
                _ => return Ok(MachineResult::HandledContinue),
            }
        }

        Ok(MachineResult::PendingStep)
    }

    fn dispatch_breakpoint(
        &mut self,
        tid: u32,
        address: u64,
        probe: &mut CallProbe<'_>,
    ) -> Result<MachineResult> {
        self.restore_bp_environment(tid)?;

        if let Some(mut stepper) = self.take_stepper(tid) {
            let result = {
                let mut services = self.services(tid, probe);
                stepper.on_breakpoint(&mut services, address)
            };
            let complete = stepper.is_complete();
            if !complete {
                self.put_stepper(tid, stepper);
            }
            let (outcome, rewind) = result?;
            match outcome {
                StepOutcome::NotHandled => {}
                _ => {
                    if rewind {
                        self.set_cached_pc(address);
                    }
                    return Ok(if complete {
                        MachineResult::PendingStep
                    } else {
                        MachineResult::HandledContinue
                    });
                }
            }
        }

        if let Some(mut resume) = self.take_resume_stepper(tid) {
            let result = {
                let mut services = self.services(tid, probe);
                resume.on_breakpoint(&mut services, address)
            };
            let complete = resume.is_complete();
            if !complete {
                self.put_resume_stepper(tid, resume);
            }
            let (outcome, rewind) = result?;
            match outcome {
                StepOutcome::NotHandled => {}
                _ => {
                    if rewind {
                        self.set_cached_pc(address);
                    }
                    return Ok(MachineResult::HandledContinue);
                }
            }
        }

        // unclaimed stop: park the PC on the trap byte for reporting
        self.set_cached_pc(address);

        let bps_arc = Arc::clone(&self.bps);
        let bps = lock(&bps_arc)?;
        let (cookies, embedded) = match bps.find(address) {
            Some(bp) if bp.is_active() => {
                if bp.original_byte() == TRAP_OPCODE {
                    // the debuggee's own trap byte hiding under ours
                    (Vec::new(), true)
                } else if bp.high_cookies().is_empty() {
                    // a stepper's trap tripped by a bystander thread; the
                    // continue side steps it past instead of stopping
                    return Ok(MachineResult::HandledContinue);
                } else {
                    (bp.high_cookies().to_vec(), false)
                }
            }
            _ => (Vec::new(), true),
        };
        drop(bps);

        if embedded {
            self.embedded_bp_addr = Some(address);
        }

        Ok(MachineResult::PendingBp {
            address,
            cookies,
            embedded,
        })
    }

    // -- continue ------------------------------------------------------

    /// Prepares the process to run again and flushes the cached context.
    /// Must be called exactly once before each continue.
    pub fn on_continue(&mut self) -> Result<()> {
        if self.stopped_on_exception {
            self.prepare_to_run()?;
        }

        self.stopped_on_exception = false;
        self.embedded_bp_addr = None;

        let port_arc = Arc::clone(&self.port);
        let mut port = lock(&port_arc)?;
        self.cache.flush(&mut *port)?;
        Ok(())
    }

    fn prepare_to_run(&mut self) -> Result<()> {
        let tid = self.stopped_tid;
        let pc = match self.cache.pc() {
            Some(pc) => pc,
            None => return Ok(()),
        };

        // a leftover resume stepper belongs to the previous stop
        if let Some(mut resume) = self.take_resume_stepper(tid) {
            let mut probe = no_probe();
            let mut services = self.services(tid, &mut probe);
            resume.cancel(&mut services)?;
        }

        let at_patched_bp = {
            let bps_arc = Arc::clone(&self.bps);
            let bps = lock(&bps_arc)?;
            bps.find(pc)
                .map_or(false, |bp| bp.is_active() && bp.original_byte() != TRAP_OPCODE)
        };

        if at_patched_bp {
            self.step_away_from_breakpoint(tid, pc)?;
        } else if self.embedded_bp_addr == Some(pc) {
            // a trap byte we never planted; hop over it unless a stepper
            // wants to treat it as its own step
            let can_skip = self
                .threads
                .get(&tid)
                .and_then(|t| t.stepper.as_ref())
                .map_or(true, |s| s.can_skip_embedded_bp());
            if can_skip {
                self.cache.change_pc(1);
            }
        }

        Ok(())
    }

    fn step_away_from_breakpoint(&mut self, tid: u32, pc: u64) -> Result<()> {
        debug!("stepping thread {} away from breakpoint at {:#x}", tid, pc);

        {
            let port_arc = Arc::clone(&self.port);
            let mut port = lock(&port_arc)?;
            let bps_arc = Arc::clone(&self.bps);
            let mut bps = lock(&bps_arc)?;
            bps.unpatch_temporarily(&mut *port, self.pid, pc)?;
        }
        if let Some(state) = self.threads.get_mut(&tid) {
            state.restore_bp = Some(pc);
        }

        if let Some(mut stepper) = self.take_stepper(tid) {
            let result = {
                let mut probe = no_probe();
                let mut services = self.services(tid, &mut probe);
                stepper.request_step_away(&mut services)
            };
            self.put_stepper(tid, stepper);
            result?;
        } else {
            let mut resume = {
                let mut probe = no_probe();
                let mut services = self.services(tid, &mut probe);
                let mut resume = make_resume_stepper(&mut services, pc, resume_cookie(tid))?;
                resume.start(&mut services)?;
                resume
            };
            resume.set_address(pc);
            self.put_resume_stepper(tid, resume);
        }

        if self.threads.len() > 1 {
            let port_arc = Arc::clone(&self.port);
            let mut port = lock(&port_arc)?;
            self.isolate_thread(&mut *port, tid);
        }
        Ok(())
    }

    /// Puts the thread's pending trap byte back after a step-away and
    /// releases the threads it isolated. No-op when nothing is pending.
    fn restore_bp_environment(&mut self, tid: u32) -> Result<()> {
        let (address, isolating) = match self.threads.get_mut(&tid) {
            Some(state) => (
                state.restore_bp.take(),
                std::mem::take(&mut state.isolating),
            ),
            None => (None, false),
        };
        if address.is_none() && !isolating {
            return Ok(());
        }

        let port_arc = Arc::clone(&self.port);
        let mut port = lock(&port_arc)?;
        if let Some(address) = address {
            let bps_arc = Arc::clone(&self.bps);
            let mut bps = lock(&bps_arc)?;
            bps.repatch(&mut *port, self.pid, address)?;
        }
        if isolating {
            self.unisolate_thread(&mut *port, tid);
        }
        Ok(())
    }

    fn isolate_thread(&mut self, port: &mut dyn crate::port::DebugPort, tid: u32) {
        debug!("isolating thread {}", tid);
        for (&other, state) in self.threads.iter() {
            if other != tid {
                suspend_quiet(port, state.handle);
            }
        }
        if let Some(state) = self.threads.get_mut(&tid) {
            state.isolating = true;
        }
        self.isolation_count += 1;
    }

    fn unisolate_thread(&mut self, port: &mut dyn crate::port::DebugPort, tid: u32) {
        debug!("releasing threads isolated for thread {}", tid);
        for (&other, state) in self.threads.iter() {
            if other != tid {
                resume_quiet(port, state.handle);
            }
        }
        self.isolation_count = self.isolation_count.saturating_sub(1);
    }

    // -- breakpoints ---------------------------------------------------

    pub fn set_breakpoint(&mut self, address: u64, cookie: Cookie) -> Result<()> {
        let port_arc = Arc::clone(&self.port);
        let mut port = lock(&port_arc)?;
        let bps_arc = Arc::clone(&self.bps);
        let mut bps = lock(&bps_arc)?;
        bps.set(&mut *port, self.pid, address, cookie, BpPriority::High)
    }

    pub fn remove_breakpoint(&mut self, address: u64, cookie: Cookie) -> Result<()> {
        let port_arc = Arc::clone(&self.port);
        let mut port = lock(&port_arc)?;
        let bps_arc = Arc::clone(&self.bps);
        let mut bps = lock(&bps_arc)?;
        bps.remove(&mut *port, self.pid, address, cookie, BpPriority::High)?;
        Ok(())
    }

    /// Restores every patched byte; the table is left empty. Used before
    /// detaching.
    pub fn unpatch_all(&mut self) -> Result<()> {
        let port_arc = Arc::clone(&self.port);
        let mut port = lock(&port_arc)?;
        let bps_arc = Arc::clone(&self.bps);
        let mut bps = lock(&bps_arc)?;
        bps.clear_all(&mut *port, self.pid)
    }

    // -- stepping ------------------------------------------------------

    pub fn set_step_instruction(&mut self, step_in: bool) -> Result<()> {
        let (tid, pc) = self.stopped_position()?;
        self.install_stepper(tid, |services| {
            if step_in {
                make_step_in_stepper(services, pc, false, step_cookie(tid))
            } else {
                make_step_over_stepper(services, pc, step_cookie(tid))
            }
        })
    }

    pub fn set_step_range(
        &mut self,
        step_in: bool,
        source_mode: bool,
        ranges: Vec<AddressRange>,
    ) -> Result<()> {
        if ranges.is_empty() {
            return Err(EngineError::invalid_arg("empty step range list"));
        }
        let (tid, pc) = self.stopped_position()?;
        self.install_stepper(tid, move |_services| {
            Ok(Box::new(RangeStepper::new(
                pc,
                step_in,
                source_mode,
                step_cookie(tid),
                ranges,
            )) as Box<dyn Stepper>)
        })
    }

    /// Runs until `target_address`, typically the caller's return address.
    pub fn set_step_out(&mut self, target_address: u64) -> Result<()> {
        let (tid, _pc) = self.stopped_position()?;
        self.install_stepper(tid, move |_services| {
            Ok(Box::new(RunToStepper::new(target_address, step_cookie(tid))) as Box<dyn Stepper>)
        })
    }

    pub fn cancel_step(&mut self) -> Result<()> {
        let tid = self.stopped_tid;
        if let Some(mut stepper) = self.take_stepper(tid) {
            let mut probe = no_probe();
            let mut services = self.services(tid, &mut probe);
            stepper.cancel(&mut services)?;
        }
        Ok(())
    }

    fn stopped_position(&self) -> Result<(u32, u64)> {
        if !self.stopped_on_exception {
            return Err(EngineError::wrong_state(
                "stepping requires a thread stopped at an exception",
            ));
        }
        let pc = self
            .cache
            .pc()
            .ok_or_else(|| EngineError::wrong_state("no cached context for stopped thread"))?;
        Ok((self.stopped_tid, pc))
    }

    fn install_stepper<F>(&mut self, tid: u32, make: F) -> Result<()>
    where
        F: FnOnce(&mut dyn StepperMachine) -> Result<Box<dyn Stepper>>,
    {
        if let Some(mut old) = self.take_stepper(tid) {
            let mut probe = no_probe();
            let mut services = self.services(tid, &mut probe);
            old.cancel(&mut services)?;
        }

        let stepper = {
            let mut probe = no_probe();
            let mut services = self.services(tid, &mut probe);
            let mut stepper = make(&mut services)?;
            stepper.start(&mut services)?;
            stepper
        };
        self.put_stepper(tid, stepper);
        Ok(())
    }

    // -- memory and context --------------------------------------------

    /// Breakpoint-transparent read.
    pub fn read_memory(&self, address: u64, buf: &mut [u8]) -> Result<(usize, usize)> {
        let port_arc = Arc::clone(&self.port);
        let mut port = lock(&port_arc)?;
        let bps_arc = Arc::clone(&self.bps);
        let bps = lock(&bps_arc)?;
        bps.read_memory(&mut *port, self.pid, address, buf)
    }

    /// Breakpoint-safe write.
    pub fn write_memory(&mut self, address: u64, data: &[u8]) -> Result<usize> {
        let port_arc = Arc::clone(&self.port);
        let mut port = lock(&port_arc)?;
        let bps_arc = Arc::clone(&self.bps);
        let mut bps = lock(&bps_arc)?;
        bps.write_memory(&mut *port, self.pid, address, data)
    }

    /// Feature-masked context read, merged with the stopped thread's cache.
    pub fn get_context(&self, tid: u32, flags: u32) -> Result<ThreadContext> {
        let port_arc = Arc::clone(&self.port);
        let mut port = lock(&port_arc)?;
        self.cache.get_merged(&mut *port, tid, self.arch, flags)
    }

    /// Feature-masked context write; cached groups are flushed on continue.
    pub fn set_context(&mut self, tid: u32, context: &ThreadContext) -> Result<()> {
        let port_arc = Arc::clone(&self.port);
        let mut port = lock(&port_arc)?;
        self.cache.set_merged(&mut *port, tid, context)
    }

    /// The stopped thread's program counter, from the cache.
    pub fn pc(&self) -> Option<u64> {
        self.cache.pc()
    }

    // -- plumbing ------------------------------------------------------

    fn services<'a, 'p>(
        &'a mut self,
        tid: u32,
        probe: &'a mut (dyn FnMut(u64) -> bool + 'p),
    ) -> MachineServices<'a, 'p> {
        let mode = self.cpu_mode();
        MachineServices {
            port: Arc::clone(&self.port),
            bps: Arc::clone(&self.bps),
            cache: &mut self.cache,
            pid: self.pid,
            tid,
            mode,
            probe,
        }
    }

    fn set_cached_pc(&mut self, pc: u64) {
        if let Some(context) = self.cache.cached_mut() {
            context.pc = pc;
        }
    }

    fn take_stepper(&mut self, tid: u32) -> Option<Box<dyn Stepper>> {
        self.threads.get_mut(&tid).and_then(|t| t.stepper.take())
    }

    fn put_stepper(&mut self, tid: u32, stepper: Box<dyn Stepper>) {
        if let Some(state) = self.threads.get_mut(&tid) {
            state.stepper = Some(stepper);
        }
    }

    fn take_resume_stepper(&mut self, tid: u32) -> Option<Box<dyn Stepper>> {
        self.threads
            .get_mut(&tid)
            .and_then(|t| t.resume_stepper.take())
    }

    fn put_resume_stepper(&mut self, tid: u32, stepper: Box<dyn Stepper>) {
        if let Some(state) = self.threads.get_mut(&tid) {
            state.resume_stepper = Some(stepper);
        }
    }
}

fn no_probe() -> Box<dyn FnMut(u64) -> bool> {
    Box::new(|_| false)
}

const STEPPER_COOKIE_BASE: Cookie = 0x8000_0000_0000_0000;

fn step_cookie(tid: u32) -> Cookie {
    STEPPER_COOKIE_BASE | ((tid as u64) << 1)
}

fn resume_cookie(tid: u32) -> Cookie {
    STEPPER_COOKIE_BASE | ((tid as u64) << 1) | 1
}

/// Suspension of a thread that is already exiting fails with access
/// denied; that is not an error worth surfacing.
fn suspend_quiet(port: &mut dyn crate::port::DebugPort, handle: RawHandle) {
    match port.suspend_thread(handle) {
        Ok(()) | Err(EngineError::AccessDenied) => {}
        Err(err) => warn!("suspend of thread handle {:#x} failed: {}", handle, err),
    }
}

fn resume_quiet(port: &mut dyn crate::port::DebugPort, handle: RawHandle) {
    match port.resume_thread(handle) {
        Ok(()) | Err(EngineError::AccessDenied) => {}
        Err(err) => warn!("resume of thread handle {:#x} failed: {}", handle, err),
    }
}

/// Stepper-facing view of the machine: breakpoints are low priority, reads
/// are breakpoint transparent, and the trap flag goes through the context
/// cache of the stopped thread. Port and table locks are taken per call,
/// so the call probe runs with none of them held and may re-enter the
/// engine's free-threaded surface.
struct MachineServices<'a, 'p> {
    port: SharedPort,
    bps: Arc<Mutex<BreakpointTable>>,
    cache: &'a mut ContextCache,
    pid: u32,
    tid: u32,
    mode: CpuMode,
    probe: &'a mut (dyn FnMut(u64) -> bool + 'p),
}

impl<'a, 'p> StepperMachine for MachineServices<'a, 'p> {
    fn set_single_step(&mut self, enable: bool) -> Result<()> {
        if self.cache.set_single_step(enable) {
            return Ok(());
        }
        // no cached context; touch the target directly
        let mut port = lock(&self.port)?;
        let mut context = port.get_context(self.tid, CTX_CONTROL)?;
        if enable {
            context.eflags |= TRACE_FLAG;
        } else {
            context.eflags &= !TRACE_FLAG;
        }
        port.set_context(self.tid, &context)
    }

    fn set_breakpoint(&mut self, address: u64, cookie: Cookie) -> Result<()> {
        let mut port = lock(&self.port)?;
        let mut bps = lock(&self.bps)?;
        bps.set(&mut *port, self.pid, address, cookie, BpPriority::Low)
    }

    fn remove_breakpoint(&mut self, address: u64, cookie: Cookie) -> Result<()> {
        let mut port = lock(&self.port)?;
        let mut bps = lock(&self.bps)?;
        bps.remove(&mut *port, self.pid, address, cookie, BpPriority::Low)?;
        Ok(())
    }

    fn read_memory(&mut self, address: u64, buf: &mut [u8]) -> Result<(usize, usize)> {
        let mut port = lock(&self.port)?;
        let bps = lock(&self.bps)?;
        bps.read_memory(&mut *port, self.pid, address, buf)
    }

    fn can_stop_at_function(&mut self, address: u64) -> bool {
        (self.probe)(address)
    }

    fn cpu_mode(&self) -> CpuMode {
        self.mode
    }
}
