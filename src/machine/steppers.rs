//! Stepping strategies.
//!
//! Each stepper arms one mechanism (the trap flag, a planted low-priority
//! breakpoint, or both), then consumes the single-step and breakpoint
//! exceptions the machine routes to it until it reports completion. The
//! factories pick a strategy from the decoded instruction at the PC.
//!
//! `request_step_away` asks a stepper to get the thread past the current
//! instruction so an unpatched breakpoint can be restored behind it. A
//! hardware single step is usually right; for REP string instructions the
//! armed after-instruction breakpoint already covers it.

use crate::error::{EngineError, Result};
use crate::exec::event::Cookie;
use crate::machine::decode::{
    instruction_type_and_size, CpuMode, InstructionType, MAX_INSTRUCTION_SIZE,
};

/// Closed address interval used by range stepping.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AddressRange {
    pub begin: u64,
    pub end: u64,
}

impl AddressRange {
    pub fn contains(&self, address: u64) -> bool {
        address >= self.begin && address <= self.end
    }
}

/// How a stepper disposed of an exception.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepOutcome {
    /// Not part of this stepper's plan.
    NotHandled,
    /// Consumed; keep the debuggee running.
    HandledContinue,
    /// Consumed; the step is done and the debuggee should stop.
    HandledStopped,
}

/// Services a stepper may call on the machine while handling an exception.
pub trait StepperMachine {
    fn set_single_step(&mut self, enable: bool) -> Result<()>;
    fn set_breakpoint(&mut self, address: u64, cookie: Cookie) -> Result<()>;
    fn remove_breakpoint(&mut self, address: u64, cookie: Cookie) -> Result<()>;
    /// Breakpoint-transparent read of target memory.
    fn read_memory(&mut self, address: u64, buf: &mut [u8]) -> Result<(usize, usize)>;
    /// Asks the external probe whether a call target is a valid stop.
    fn can_stop_at_function(&mut self, address: u64) -> bool;
    fn cpu_mode(&self) -> CpuMode;
}

/// One unit of execution control. See the module docs for the protocol.
pub trait Stepper: Send + std::fmt::Debug {
    fn start(&mut self, mac: &mut dyn StepperMachine) -> Result<()>;
    fn cancel(&mut self, mac: &mut dyn StepperMachine) -> Result<()>;
    fn is_complete(&self) -> bool;

    /// Whether an embedded trap byte encountered mid-flight can be skipped
    /// over instead of being treated as part of this stepper's execution.
    fn can_skip_embedded_bp(&self) -> bool {
        true
    }

    fn request_step_away(&mut self, mac: &mut dyn StepperMachine) -> Result<()>;
    fn set_address(&mut self, address: u64);

    /// Returns the outcome and whether the machine should rewind the PC
    /// back onto the trap byte.
    fn on_breakpoint(
        &mut self,
        mac: &mut dyn StepperMachine,
        address: u64,
    ) -> Result<(StepOutcome, bool)>;

    fn on_single_step(&mut self, mac: &mut dyn StepperMachine, address: u64)
        -> Result<StepOutcome>;
}

/// Classifies the instruction at `address` in target memory.
pub fn read_instruction(
    mac: &mut dyn StepperMachine,
    address: u64,
) -> Result<(InstructionType, usize)> {
    let mut mem = [0u8; MAX_INSTRUCTION_SIZE];
    let (read, _unreadable) = mac.read_memory(address, &mut mem)?;

    let (inst_type, size) = instruction_type_and_size(&mem[..read], mac.cpu_mode());
    if inst_type == InstructionType::None {
        return Err(EngineError::UnknownInstruction { address });
    }
    Ok((inst_type, size))
}

/// Transient stepper that drives a thread past an unpatched breakpoint so
/// the trap byte can be restored.
pub fn make_resume_stepper(
    mac: &mut dyn StepperMachine,
    pc: u64,
    cookie: Cookie,
) -> Result<Box<dyn Stepper>> {
    let (inst_type, size) = read_instruction(mac, pc)?;

    Ok(match inst_type {
        InstructionType::RepString => Box::new(BreakpointStepper::new(pc, size, cookie)),
        _ => Box::new(SingleStepStepper::new()),
    })
}

pub fn make_step_in_stepper(
    mac: &mut dyn StepperMachine,
    pc: u64,
    source_mode: bool,
    cookie: Cookie,
) -> Result<Box<dyn Stepper>> {
    let (inst_type, size) = read_instruction(mac, pc)?;

    Ok(match inst_type {
        InstructionType::Call if source_mode => Box::new(ProbeCallStepper::new(pc, size, cookie)),
        _ => Box::new(SingleStepStepper::new()),
    })
}

pub fn make_step_over_stepper(
    mac: &mut dyn StepperMachine,
    pc: u64,
    cookie: Cookie,
) -> Result<Box<dyn Stepper>> {
    let (inst_type, size) = read_instruction(mac, pc)?;

    Ok(match inst_type {
        InstructionType::RepString => Box::new(BreakpointStepper::new(pc, size, cookie)),
        InstructionType::Call => Box::new(CallBreakpointStepper::new(pc, size, cookie)),
        _ => Box::new(SingleStepStepper::new()),
    })
}

// ---------------------------------------------------------------------------
// SingleStepStepper
// ---------------------------------------------------------------------------

/// Steps one instruction with the trap flag.
#[derive(Debug)]
pub struct SingleStepStepper {
    complete: bool,
}

impl SingleStepStepper {
    pub fn new() -> Self {
        SingleStepStepper { complete: false }
    }
}

impl Default for SingleStepStepper {
    fn default() -> Self {
        SingleStepStepper::new()
    }
}

impl Stepper for SingleStepStepper {
    fn start(&mut self, mac: &mut dyn StepperMachine) -> Result<()> {
        mac.set_single_step(true)
    }

    fn cancel(&mut self, _mac: &mut dyn StepperMachine) -> Result<()> {
        Ok(())
    }

    fn is_complete(&self) -> bool {
        self.complete
    }

    fn can_skip_embedded_bp(&self) -> bool {
        // a trap byte at the stepped instruction is the step itself
        false
    }

    fn request_step_away(&mut self, _mac: &mut dyn StepperMachine) -> Result<()> {
        // single stepping is already the main mechanism
        Ok(())
    }

    fn set_address(&mut self, _address: u64) {}

    fn on_breakpoint(
        &mut self,
        _mac: &mut dyn StepperMachine,
        _address: u64,
    ) -> Result<(StepOutcome, bool)> {
        Ok((StepOutcome::NotHandled, true))
    }

    fn on_single_step(
        &mut self,
        _mac: &mut dyn StepperMachine,
        _address: u64,
    ) -> Result<StepOutcome> {
        self.complete = true;
        Ok(StepOutcome::HandledStopped)
    }
}

// ---------------------------------------------------------------------------
// BreakpointStepper
// ---------------------------------------------------------------------------

/// Steps one instruction by running to a breakpoint planted right after it.
/// Used for REP string instructions, where the trap flag would stop on
/// every iteration.
#[derive(Debug)]
pub struct BreakpointStepper {
    cur_addr: u64,
    after_addr: u64,
    inst_len: usize,
    cookie: Cookie,
    complete: bool,
}

impl BreakpointStepper {
    pub fn new(cur_addr: u64, inst_len: usize, cookie: Cookie) -> Self {
        debug_assert!(inst_len > 0);
        BreakpointStepper {
            cur_addr,
            after_addr: 0,
            inst_len,
            cookie,
            complete: false,
        }
    }
}

impl Stepper for BreakpointStepper {
    fn start(&mut self, mac: &mut dyn StepperMachine) -> Result<()> {
        self.after_addr = self.cur_addr + self.inst_len as u64;
        mac.set_breakpoint(self.after_addr, self.cookie)
    }

    fn cancel(&mut self, mac: &mut dyn StepperMachine) -> Result<()> {
        mac.remove_breakpoint(self.after_addr, self.cookie)
    }

    fn is_complete(&self) -> bool {
        self.complete
    }

    fn request_step_away(&mut self, _mac: &mut dyn StepperMachine) -> Result<()> {
        // the planted after-instruction breakpoint already gets the
        // thread past the restored trap
        Ok(())
    }

    fn set_address(&mut self, address: u64) {
        self.cur_addr = address;
    }

    fn on_breakpoint(
        &mut self,
        mac: &mut dyn StepperMachine,
        address: u64,
    ) -> Result<(StepOutcome, bool)> {
        if address == self.after_addr {
            self.complete = true;
            mac.remove_breakpoint(self.after_addr, self.cookie)?;
            return Ok((StepOutcome::HandledStopped, true));
        }
        Ok((StepOutcome::NotHandled, true))
    }

    fn on_single_step(
        &mut self,
        _mac: &mut dyn StepperMachine,
        _address: u64,
    ) -> Result<StepOutcome> {
        Ok(StepOutcome::NotHandled)
    }
}

// ---------------------------------------------------------------------------
// CallBreakpointStepper
// ---------------------------------------------------------------------------

/// Steps over a call by running to a breakpoint after it. Supports step
/// away by single stepping the call itself when still at the start.
#[derive(Debug)]
pub struct CallBreakpointStepper {
    cur_addr: u64,
    starting_addr: u64,
    after_addr: u64,
    inst_len: usize,
    cookie: Cookie,
    complete: bool,
    requested_ss: bool,
}

impl CallBreakpointStepper {
    pub fn new(cur_addr: u64, inst_len: usize, cookie: Cookie) -> Self {
        debug_assert!(inst_len > 0);
        CallBreakpointStepper {
            cur_addr,
            starting_addr: cur_addr,
            after_addr: 0,
            inst_len,
            cookie,
            complete: false,
            requested_ss: false,
        }
    }
}

impl Stepper for CallBreakpointStepper {
    fn start(&mut self, mac: &mut dyn StepperMachine) -> Result<()> {
        self.after_addr = self.cur_addr + self.inst_len as u64;
        mac.set_breakpoint(self.after_addr, self.cookie)
    }

    fn cancel(&mut self, mac: &mut dyn StepperMachine) -> Result<()> {
        mac.remove_breakpoint(self.after_addr, self.cookie)
    }

    fn is_complete(&self) -> bool {
        self.complete
    }

    fn request_step_away(&mut self, mac: &mut dyn StepperMachine) -> Result<()> {
        if self.cur_addr == self.starting_addr {
            self.requested_ss = true;
            mac.set_single_step(true)?;
        }
        Ok(())
    }

    fn set_address(&mut self, address: u64) {
        self.cur_addr = address;
    }

    fn on_breakpoint(
        &mut self,
        mac: &mut dyn StepperMachine,
        address: u64,
    ) -> Result<(StepOutcome, bool)> {
        self.cur_addr = address;
        if address == self.after_addr {
            self.complete = true;
            mac.remove_breakpoint(self.after_addr, self.cookie)?;
            return Ok((StepOutcome::HandledStopped, true));
        }
        Ok((StepOutcome::NotHandled, true))
    }

    fn on_single_step(
        &mut self,
        _mac: &mut dyn StepperMachine,
        address: u64,
    ) -> Result<StepOutcome> {
        self.cur_addr = address;
        if self.requested_ss {
            self.requested_ss = false;
            return Ok(StepOutcome::HandledContinue);
        }
        Ok(StepOutcome::NotHandled)
    }
}

// ---------------------------------------------------------------------------
// ProbeCallStepper
// ---------------------------------------------------------------------------

/// Steps into a call. Once inside the callee, the external probe decides
/// whether this is an acceptable stop; if not, the stepper runs on to the
/// breakpoint planted after the call, as if it had stepped over.
#[derive(Debug)]
pub struct ProbeCallStepper {
    cur_addr: u64,
    starting_addr: u64,
    after_addr: u64,
    inst_len: usize,
    cookie: Cookie,
    complete: bool,
    ss_count: u32,
}

impl ProbeCallStepper {
    pub fn new(cur_addr: u64, inst_len: usize, cookie: Cookie) -> Self {
        debug_assert!(inst_len > 0);
        ProbeCallStepper {
            cur_addr,
            starting_addr: cur_addr,
            after_addr: 0,
            inst_len,
            cookie,
            complete: false,
            ss_count: 0,
        }
    }
}

impl Stepper for ProbeCallStepper {
    fn start(&mut self, mac: &mut dyn StepperMachine) -> Result<()> {
        mac.set_single_step(true)?;
        self.after_addr = self.cur_addr + self.inst_len as u64;
        mac.set_breakpoint(self.after_addr, self.cookie)
    }

    fn cancel(&mut self, mac: &mut dyn StepperMachine) -> Result<()> {
        mac.remove_breakpoint(self.after_addr, self.cookie)
    }

    fn is_complete(&self) -> bool {
        self.complete
    }

    fn request_step_away(&mut self, _mac: &mut dyn StepperMachine) -> Result<()> {
        // at the starting call the single step is already armed; elsewhere
        // the after-call breakpoint does the job
        Ok(())
    }

    fn set_address(&mut self, address: u64) {
        self.cur_addr = address;
    }

    fn on_breakpoint(
        &mut self,
        mac: &mut dyn StepperMachine,
        address: u64,
    ) -> Result<(StepOutcome, bool)> {
        self.cur_addr = address;
        if address == self.after_addr {
            self.complete = true;
            mac.remove_breakpoint(self.after_addr, self.cookie)?;
            return Ok((StepOutcome::HandledStopped, true));
        }
        Ok((StepOutcome::NotHandled, true))
    }

    fn on_single_step(
        &mut self,
        mac: &mut dyn StepperMachine,
        address: u64,
    ) -> Result<StepOutcome> {
        self.cur_addr = address;
        self.ss_count += 1;

        if self.ss_count == 1 {
            // an incremental linker puts a jmp trampoline at function
            // entry; step through it before probing
            let (inst_type, _) = read_instruction(mac, address)?;
            if inst_type == InstructionType::Jmp {
                mac.set_single_step(true)?;
                return Ok(StepOutcome::HandledContinue);
            }
        }

        if mac.can_stop_at_function(address) {
            self.complete = true;
            mac.remove_breakpoint(self.after_addr, self.cookie)?;
            return Ok(StepOutcome::HandledStopped);
        }

        // run on to the breakpoint after the original call
        Ok(StepOutcome::HandledContinue)
    }
}

// ---------------------------------------------------------------------------
// RangeStepper
// ---------------------------------------------------------------------------

/// Composes single-instruction steppers until the PC leaves the configured
/// ranges.
#[derive(Debug)]
pub struct RangeStepper {
    cur_addr: u64,
    cookie: Cookie,
    step_in: bool,
    source_mode: bool,
    ranges: Vec<AddressRange>,
    complete: bool,
    inner: Option<Box<dyn Stepper>>,
}

impl RangeStepper {
    pub fn new(
        cur_addr: u64,
        step_in: bool,
        source_mode: bool,
        cookie: Cookie,
        ranges: Vec<AddressRange>,
    ) -> Self {
        debug_assert!(!ranges.is_empty());
        RangeStepper {
            cur_addr,
            cookie,
            step_in,
            source_mode,
            ranges,
            complete: false,
            inner: None,
        }
    }

    fn start_one_step(&mut self, mac: &mut dyn StepperMachine) -> Result<()> {
        debug_assert!(self.inner.is_none());

        let mut inner = if self.step_in {
            make_step_in_stepper(mac, self.cur_addr, self.source_mode, self.cookie)?
        } else {
            make_step_over_stepper(mac, self.cur_addr, self.cookie)?
        };
        inner.start(mac)?;
        self.inner = Some(inner);
        Ok(())
    }

    fn in_range(&self, address: u64) -> bool {
        self.ranges.iter().any(|r| r.contains(address))
    }

    fn handle_inner_complete(
        &mut self,
        mac: &mut dyn StepperMachine,
        address: u64,
    ) -> Result<StepOutcome> {
        self.inner = None;

        if self.in_range(address) {
            self.start_one_step(mac)?;
            return Ok(StepOutcome::HandledContinue);
        }

        self.complete = true;
        Ok(StepOutcome::HandledStopped)
    }
}

impl Stepper for RangeStepper {
    fn start(&mut self, mac: &mut dyn StepperMachine) -> Result<()> {
        self.start_one_step(mac)
    }

    fn cancel(&mut self, mac: &mut dyn StepperMachine) -> Result<()> {
        if let Some(mut inner) = self.inner.take() {
            inner.cancel(mac)?;
        }
        Ok(())
    }

    fn is_complete(&self) -> bool {
        self.complete
    }

    fn can_skip_embedded_bp(&self) -> bool {
        self.inner
            .as_ref()
            .map_or(false, |inner| inner.can_skip_embedded_bp())
    }

    fn request_step_away(&mut self, mac: &mut dyn StepperMachine) -> Result<()> {
        match self.inner.as_mut() {
            Some(inner) => inner.request_step_away(mac),
            None => Err(EngineError::wrong_state("range stepper has no inner step")),
        }
    }

    fn set_address(&mut self, address: u64) {
        self.cur_addr = address;
        if let Some(inner) = self.inner.as_mut() {
            inner.set_address(address);
        }
    }

    fn on_breakpoint(
        &mut self,
        mac: &mut dyn StepperMachine,
        address: u64,
    ) -> Result<(StepOutcome, bool)> {
        self.cur_addr = address;

        let inner = self
            .inner
            .as_mut()
            .ok_or_else(|| EngineError::wrong_state("range stepper has no inner step"))?;
        let (outcome, rewind) = inner.on_breakpoint(mac, address)?;

        if !inner.is_complete() {
            return Ok((outcome, rewind));
        }
        Ok((self.handle_inner_complete(mac, address)?, rewind))
    }

    fn on_single_step(
        &mut self,
        mac: &mut dyn StepperMachine,
        address: u64,
    ) -> Result<StepOutcome> {
        self.cur_addr = address;

        let inner = self
            .inner
            .as_mut()
            .ok_or_else(|| EngineError::wrong_state("range stepper has no inner step"))?;
        let outcome = inner.on_single_step(mac, address)?;

        if !inner.is_complete() {
            return Ok(outcome);
        }
        self.handle_inner_complete(mac, address)
    }
}

// ---------------------------------------------------------------------------
// RunToStepper
// ---------------------------------------------------------------------------

/// Runs to a fixed target address. Backs step-out (target is the caller's
/// return address) and run-to-cursor.
#[derive(Debug)]
pub struct RunToStepper {
    target_addr: u64,
    cookie: Cookie,
    complete: bool,
}

impl RunToStepper {
    pub fn new(target_addr: u64, cookie: Cookie) -> Self {
        debug_assert!(target_addr != 0);
        RunToStepper {
            target_addr,
            cookie,
            complete: false,
        }
    }
}

impl Stepper for RunToStepper {
    fn start(&mut self, mac: &mut dyn StepperMachine) -> Result<()> {
        mac.set_breakpoint(self.target_addr, self.cookie)
    }

    fn cancel(&mut self, mac: &mut dyn StepperMachine) -> Result<()> {
        mac.remove_breakpoint(self.target_addr, self.cookie)
    }

    fn is_complete(&self) -> bool {
        self.complete
    }

    fn request_step_away(&mut self, _mac: &mut dyn StepperMachine) -> Result<()> {
        Ok(())
    }

    fn set_address(&mut self, _address: u64) {}

    fn on_breakpoint(
        &mut self,
        mac: &mut dyn StepperMachine,
        address: u64,
    ) -> Result<(StepOutcome, bool)> {
        if address == self.target_addr {
            self.complete = true;
            mac.remove_breakpoint(self.target_addr, self.cookie)?;
            return Ok((StepOutcome::HandledStopped, true));
        }
        Ok((StepOutcome::NotHandled, true))
    }

    fn on_single_step(
        &mut self,
        _mac: &mut dyn StepperMachine,
        _address: u64,
    ) -> Result<StepOutcome> {
        Ok(StepOutcome::NotHandled)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    /// Serves a flat code slice and records trap and trap-flag requests.
    struct FakeMachine {
        base: u64,
        code: Vec<u8>,
        traps: BTreeMap<u64, Vec<Cookie>>,
        single_step: bool,
        approved_targets: Vec<u64>,
    }

    impl FakeMachine {
        fn new(base: u64, code: &[u8]) -> Self {
            FakeMachine {
                base,
                code: code.to_vec(),
                traps: BTreeMap::new(),
                single_step: false,
                approved_targets: Vec::new(),
            }
        }
    }

    impl StepperMachine for FakeMachine {
        fn set_single_step(&mut self, enable: bool) -> Result<()> {
            self.single_step = enable;
            Ok(())
        }

        fn set_breakpoint(&mut self, address: u64, cookie: Cookie) -> Result<()> {
            self.traps.entry(address).or_default().push(cookie);
            Ok(())
        }

        fn remove_breakpoint(&mut self, address: u64, cookie: Cookie) -> Result<()> {
            if let Some(cookies) = self.traps.get_mut(&address) {
                cookies.retain(|&c| c != cookie);
                if cookies.is_empty() {
                    self.traps.remove(&address);
                }
            }
            Ok(())
        }

        fn read_memory(&mut self, address: u64, buf: &mut [u8]) -> Result<(usize, usize)> {
            let offset = (address - self.base) as usize;
            let avail = self.code.len().saturating_sub(offset);
            let read = buf.len().min(avail);
            buf[..read].copy_from_slice(&self.code[offset..offset + read]);
            Ok((read, buf.len() - read))
        }

        fn can_stop_at_function(&mut self, address: u64) -> bool {
            self.approved_targets.contains(&address)
        }

        fn cpu_mode(&self) -> CpuMode {
            CpuMode::Mode64
        }
    }

    const BASE: u64 = 0x1000;

    #[test]
    fn resume_stepper_for_plain_code_single_steps() {
        let mut mac = FakeMachine::new(BASE, &[0x90]);
        let mut stepper = make_resume_stepper(&mut mac, BASE, 7).unwrap();
        stepper.start(&mut mac).unwrap();

        assert!(mac.single_step);
        assert!(mac.traps.is_empty());
        // a trap byte at the stepped instruction is the step itself
        assert!(!stepper.can_skip_embedded_bp());
    }

    #[test]
    fn resume_stepper_for_rep_string_runs_to_a_planted_trap() {
        let mut mac = FakeMachine::new(BASE, &[0xF3, 0xA4, 0x90]);
        let mut stepper = make_resume_stepper(&mut mac, BASE, 7).unwrap();
        stepper.start(&mut mac).unwrap();

        assert!(mac.traps.contains_key(&(BASE + 2)));
        // stepping away must not arm the trap flag; the planted trap
        // covers it
        stepper.request_step_away(&mut mac).unwrap();
        assert!(!mac.single_step);

        let (outcome, rewind) = stepper.on_breakpoint(&mut mac, BASE + 2).unwrap();
        assert_eq!(outcome, StepOutcome::HandledStopped);
        assert!(rewind);
        assert!(stepper.is_complete());
        assert!(mac.traps.is_empty());
    }

    #[test]
    fn step_over_a_call_waits_at_the_return_address() {
        let mut mac = FakeMachine::new(BASE, &[0xE8, 0x10, 0x00, 0x00, 0x00]);
        let mut stepper = make_step_over_stepper(&mut mac, BASE, 3).unwrap();
        stepper.start(&mut mac).unwrap();

        assert!(mac.traps.contains_key(&(BASE + 5)));

        let (outcome, _) = stepper.on_breakpoint(&mut mac, 0x2000).unwrap();
        assert_eq!(outcome, StepOutcome::NotHandled);
        assert!(!stepper.is_complete());

        let (outcome, _) = stepper.on_breakpoint(&mut mac, BASE + 5).unwrap();
        assert_eq!(outcome, StepOutcome::HandledStopped);
        assert!(stepper.is_complete());
        assert!(mac.traps.is_empty());
    }

    #[test]
    fn a_truncated_call_cannot_arm_a_stepper() {
        let mut mac = FakeMachine::new(BASE, &[0xE8, 0x10, 0x00]);
        let err = make_step_over_stepper(&mut mac, BASE, 3).unwrap_err();
        assert!(matches!(
            err,
            EngineError::UnknownInstruction { address } if address == BASE
        ));
    }

    #[test]
    fn step_in_stops_inside_an_approved_callee() {
        // call 0x1010; nop at the callee entry
        let mut code = vec![0u8; 0x20];
        code[..5].copy_from_slice(&[0xE8, 0x0B, 0x00, 0x00, 0x00]);
        code[0x10] = 0x90;
        let mut mac = FakeMachine::new(BASE, &code);
        mac.approved_targets.push(BASE + 0x10);

        let mut stepper = make_step_in_stepper(&mut mac, BASE, true, 3).unwrap();
        stepper.start(&mut mac).unwrap();
        assert!(mac.single_step);
        assert!(mac.traps.contains_key(&(BASE + 5)));

        let outcome = stepper.on_single_step(&mut mac, BASE + 0x10).unwrap();
        assert_eq!(outcome, StepOutcome::HandledStopped);
        assert!(stepper.is_complete());
        assert!(mac.traps.is_empty());
    }

    #[test]
    fn step_in_runs_past_a_rejected_callee() {
        let mut code = vec![0u8; 0x20];
        code[..5].copy_from_slice(&[0xE8, 0x0B, 0x00, 0x00, 0x00]);
        code[0x10] = 0x90;
        let mut mac = FakeMachine::new(BASE, &code);

        let mut stepper = make_step_in_stepper(&mut mac, BASE, true, 3).unwrap();
        stepper.start(&mut mac).unwrap();

        let outcome = stepper.on_single_step(&mut mac, BASE + 0x10).unwrap();
        assert_eq!(outcome, StepOutcome::HandledContinue);
        assert!(!stepper.is_complete());

        // falls back to the trap after the call, as a step over would
        let (outcome, _) = stepper.on_breakpoint(&mut mac, BASE + 5).unwrap();
        assert_eq!(outcome, StepOutcome::HandledStopped);
        assert!(stepper.is_complete());
    }

    #[test]
    fn step_in_walks_through_an_entry_trampoline() {
        // call 0x1010; jmp trampoline at the callee entry
        let mut code = vec![0u8; 0x20];
        code[..5].copy_from_slice(&[0xE8, 0x0B, 0x00, 0x00, 0x00]);
        code[0x10] = 0xEB;
        code[0x11] = 0x02;
        let mut mac = FakeMachine::new(BASE, &code);

        let mut stepper = make_step_in_stepper(&mut mac, BASE, true, 3).unwrap();
        stepper.start(&mut mac).unwrap();
        mac.single_step = false;

        let outcome = stepper.on_single_step(&mut mac, BASE + 0x10).unwrap();
        assert_eq!(outcome, StepOutcome::HandledContinue);
        // the trampoline is not a probe-worthy stop; the trap flag is
        // re-armed to land past it
        assert!(mac.single_step);
        assert!(!stepper.is_complete());
    }

    #[test]
    fn range_stepping_restarts_inside_the_range_and_stops_outside() {
        let mut mac = FakeMachine::new(BASE, &[0x90, 0x90, 0x90, 0x90]);
        let mut stepper = RangeStepper::new(
            BASE,
            false,
            false,
            21,
            vec![AddressRange {
                begin: BASE,
                end: BASE + 1,
            }],
        );
        stepper.start(&mut mac).unwrap();
        assert!(mac.single_step);

        let outcome = stepper.on_single_step(&mut mac, BASE + 1).unwrap();
        assert_eq!(outcome, StepOutcome::HandledContinue);
        assert!(!stepper.is_complete());

        let outcome = stepper.on_single_step(&mut mac, BASE + 2).unwrap();
        assert_eq!(outcome, StepOutcome::HandledStopped);
        assert!(stepper.is_complete());
    }

    #[test]
    fn run_to_completes_only_at_its_target() {
        let mut mac = FakeMachine::new(BASE, &[0x90]);
        let mut stepper = RunToStepper::new(0x2000, 9);
        stepper.start(&mut mac).unwrap();
        assert!(mac.traps.contains_key(&0x2000));

        let (outcome, _) = stepper.on_breakpoint(&mut mac, BASE).unwrap();
        assert_eq!(outcome, StepOutcome::NotHandled);

        let (outcome, _) = stepper.on_breakpoint(&mut mac, 0x2000).unwrap();
        assert_eq!(outcome, StepOutcome::HandledStopped);
        assert!(stepper.is_complete());
        assert!(mac.traps.is_empty());
    }
}
