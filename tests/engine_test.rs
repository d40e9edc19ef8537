//! End-to-end engine tests against the simulated target.
//!
//! Run with: cargo test --test engine_test -- --nocapture

use std::sync::{Arc, Mutex};
use std::time::Duration;

use vigil::exec::event::{
    Cookie, EventCallback, ExceptionRecord, RunMode, EXCEPTION_BREAKPOINT,
};
use vigil::exec::module::Module;
use vigil::exec::process::Process;
use vigil::exec::thread::Thread;
use vigil::exec::{Exec, MemoryAccess};
use vigil::machine::context::{CTX_FULL, GPR_AX};
use vigil::machine::steppers::AddressRange;
use vigil::port::sim::{SimModule, SimPort, SimProgram, EXCEPTION_ILLEGAL_INSTRUCTION};
use vigil::port::{LaunchInfo, SharedPort};
use vigil::proxy::ExecProxy;
use vigil::EngineError;

const PATH: &str = "target.sim";
const ENTRY: u64 = 0x40_1000;
const FUNC: u64 = ENTRY + 0x100;
const LOOP_TOP: u64 = ENTRY + 1;
const SECOND_LOOP: u64 = ENTRY + 0x80;

#[derive(Debug, Clone, PartialEq)]
enum Seen {
    ProcessStart(u32),
    ProcessExit(u32, u32),
    ThreadStart(u32),
    ThreadExit(u32),
    ModuleLoad(u64),
    LoadComplete,
    Breakpoint {
        address: u64,
        cookies: Vec<Cookie>,
        embedded: bool,
    },
    StepComplete(u32),
    AsyncBreak,
    Exception(u32),
    CallTarget(u64),
}

#[derive(Clone, Default)]
struct Recorder {
    seen: Arc<Mutex<Vec<Seen>>>,
    /// Free-threaded reader used to inspect call targets during source
    /// step-in.
    reader: Arc<Mutex<Option<MemoryAccess>>>,
}

impl Recorder {
    fn log(&self) -> Vec<Seen> {
        self.seen.lock().unwrap().clone()
    }

    fn push(&self, item: Seen) {
        self.seen.lock().unwrap().push(item);
    }
}

impl EventCallback for Recorder {
    fn on_process_start(&mut self, process: &Process) {
        self.push(Seen::ProcessStart(process.id));
    }

    fn on_process_exit(&mut self, pid: u32, exit_code: u32) {
        self.push(Seen::ProcessExit(pid, exit_code));
    }

    fn on_thread_start(&mut self, _process: &Process, thread: &Thread) {
        self.push(Seen::ThreadStart(thread.id));
    }

    fn on_thread_exit(&mut self, _process: &Process, tid: u32, _exit_code: u32) {
        self.push(Seen::ThreadExit(tid));
    }

    fn on_module_load(&mut self, _process: &Process, module: &Module) {
        self.push(Seen::ModuleLoad(module.image_base));
    }

    fn on_load_complete(&mut self, _process: &Process, _tid: u32) {
        self.push(Seen::LoadComplete);
    }

    fn on_breakpoint(
        &mut self,
        _process: &Process,
        _tid: u32,
        address: u64,
        cookies: &[Cookie],
        embedded: bool,
    ) -> RunMode {
        self.push(Seen::Breakpoint {
            address,
            cookies: cookies.to_vec(),
            embedded,
        });
        RunMode::Break
    }

    fn on_step_complete(&mut self, _process: &Process, tid: u32) {
        self.push(Seen::StepComplete(tid));
    }

    fn on_async_break_complete(&mut self, _process: &Process, _tid: u32) {
        self.push(Seen::AsyncBreak);
    }

    fn on_exception(
        &mut self,
        _process: &Process,
        _tid: u32,
        _first_chance: bool,
        record: &ExceptionRecord,
    ) -> RunMode {
        self.push(Seen::Exception(record.code));
        RunMode::Break
    }

    fn on_call_probe(&mut self, _pid: u32, _tid: u32, address: u64) -> RunMode {
        self.push(Seen::CallTarget(address));
        // a nop at the entry marks an acceptable stop; the read goes
        // through the engine's free-threaded surface
        if let Some(reader) = self.reader.lock().unwrap().as_ref() {
            let mut buf = [0u8; 1];
            if reader.read(address, &mut buf).is_ok() && buf[0] == 0x90 {
                return RunMode::Break;
            }
        }
        RunMode::Run
    }
}

/// Trap at entry (loader breakpoint), nop, call FUNC, nop, exit; FUNC is
/// nop+ret.
fn call_program() -> SimProgram {
    let mut code = vec![0u8; 0x200];
    code[0x000] = 0xCC;
    code[0x001] = 0x90;
    code[0x002..0x007].copy_from_slice(&[0xE8, 0xF9, 0x00, 0x00, 0x00]);
    code[0x007] = 0x90;
    code[0x008] = 0xF4;
    code[0x100] = 0x90;
    code[0x101] = 0xC3;
    program(code)
}

/// Trap at entry, then a nop loop at LOOP_TOP. A second nop loop sits at
/// SECOND_LOOP for extra threads.
fn loop_program() -> SimProgram {
    let mut code = vec![0u8; 0x200];
    code[0x000] = 0xCC;
    code[0x001] = 0x90; // LOOP_TOP
    code[0x002..0x004].copy_from_slice(&[0xEB, 0xFD]); // jmp LOOP_TOP
    code[0x080] = 0x90; // SECOND_LOOP
    code[0x081..0x083].copy_from_slice(&[0xEB, 0xFD]);
    program(code)
}

/// Trap at entry, nop, a trap byte the engine never planted, nop, exit.
fn embedded_trap_program() -> SimProgram {
    let mut code = vec![0u8; 0x10];
    code[0] = 0xCC;
    code[1] = 0x90;
    code[2] = 0xCC;
    code[3] = 0x90;
    code[4] = 0xF4;
    program(code)
}

fn program(code: Vec<u8>) -> SimProgram {
    SimProgram {
        image_base: ENTRY - 0x1000,
        image_size: 0x2000,
        entry_point: ENTRY,
        regions: vec![(ENTRY, code)],
        modules: vec![],
    }
}

struct Fixture {
    sim: Arc<Mutex<SimPort>>,
    exec: Exec,
    recorder: Recorder,
    pid: u32,
}

/// Launches a program and pumps until the loader breakpoint stop.
fn boot(prog: SimProgram) -> Fixture {
    let mut sim = SimPort::new();
    sim.register_program(PATH, prog);
    let sim = Arc::new(Mutex::new(sim));
    let port: SharedPort = sim.clone();

    let recorder = Recorder::default();
    let mut exec = Exec::new(port, Box::new(recorder.clone()));
    let pid = exec
        .launch(&LaunchInfo {
            exe_path: PATH.into(),
            ..Default::default()
        })
        .expect("launch");

    assert!(pump_until_stop(&mut exec), "no loader stop");
    assert_eq!(recorder.log().last(), Some(&Seen::LoadComplete));

    Fixture {
        sim,
        exec,
        recorder,
        pid,
    }
}

fn pump_until_stop(exec: &mut Exec) -> bool {
    for _ in 0..100 {
        if exec.wait_for_event(10).expect("wait") && exec.dispatch_event().expect("dispatch") {
            return true;
        }
    }
    false
}

fn pump_until_exit(exec: &mut Exec, pid: u32) {
    for _ in 0..100 {
        if exec.process(pid).is_none() {
            return;
        }
        if exec.wait_for_event(10).expect("wait") && exec.dispatch_event().expect("dispatch") {
            exec.continue_debug(true).expect("continue");
        }
    }
    panic!("process {} never exited", pid);
}

fn peek(fixture: &Fixture, address: u64) -> u8 {
    fixture
        .sim
        .lock()
        .unwrap()
        .peek(fixture.pid, address)
        .expect("unmapped address")
}

#[test]
fn loader_breakpoint_is_reported_before_any_user_stop() {
    let fixture = boot(call_program());
    let log = fixture.recorder.log();

    let start = log
        .iter()
        .position(|s| *s == Seen::ProcessStart(fixture.pid))
        .expect("process start");
    let load_complete = log
        .iter()
        .position(|s| *s == Seen::LoadComplete)
        .expect("load complete");
    assert!(start < load_complete);
    assert!(!log
        .iter()
        .any(|s| matches!(s, Seen::Breakpoint { .. } | Seen::Exception(_))));
}

#[test]
fn breakpoint_stop_reports_owner_cookies_and_parks_pc_on_the_trap() {
    let mut fixture = boot(call_program());
    let pid = fixture.pid;

    fixture.exec.set_breakpoint(pid, FUNC, 7).unwrap();
    fixture.exec.continue_debug(true).unwrap();
    assert!(pump_until_stop(&mut fixture.exec), "no breakpoint stop");

    assert_eq!(
        fixture.recorder.log().last(),
        Some(&Seen::Breakpoint {
            address: FUNC,
            cookies: vec![7],
            embedded: false,
        })
    );

    let context = fixture.exec.get_thread_context(pid, 1, CTX_FULL).unwrap();
    assert_eq!(context.pc, FUNC);

    fixture.exec.continue_debug(true).unwrap();
    pump_until_exit(&mut fixture.exec, pid);
    assert!(fixture
        .recorder
        .log()
        .iter()
        .any(|s| matches!(s, Seen::ProcessExit(p, _) if *p == pid)));
}

#[test]
fn reads_show_original_bytes_under_patches() {
    let mut fixture = boot(call_program());
    let pid = fixture.pid;

    fixture.exec.set_breakpoint(pid, FUNC, 1).unwrap();
    assert_eq!(peek(&fixture, FUNC), 0xCC);

    let mut buf = [0u8; 4];
    let (read, _) = fixture.exec.read_memory(pid, FUNC - 1, &mut buf).unwrap();
    assert_eq!(read, 4);
    // the trap byte is invisible; the nop shows through
    assert_eq!(buf[1], 0x90);
}

#[test]
fn trap_byte_stays_until_the_last_owner_leaves() {
    let mut fixture = boot(call_program());
    let pid = fixture.pid;

    fixture.exec.set_breakpoint(pid, FUNC, 1).unwrap();
    fixture.exec.set_breakpoint(pid, FUNC, 2).unwrap();
    assert_eq!(peek(&fixture, FUNC), 0xCC);

    fixture.exec.remove_breakpoint(pid, FUNC, 1).unwrap();
    assert_eq!(peek(&fixture, FUNC), 0xCC);

    fixture.exec.remove_breakpoint(pid, FUNC, 2).unwrap();
    assert_eq!(peek(&fixture, FUNC), 0x90);
}

#[test]
fn writes_through_a_patch_survive_breakpoint_removal() {
    let mut fixture = boot(call_program());
    let pid = fixture.pid;

    fixture.exec.set_breakpoint(pid, FUNC, 1).unwrap();
    let written = fixture.exec.write_memory(pid, FUNC, &[0xEB]).unwrap();
    assert_eq!(written, 1);

    // memory still carries the trap; readers see the caller's byte
    assert_eq!(peek(&fixture, FUNC), 0xCC);
    let mut buf = [0u8; 1];
    fixture.exec.read_memory(pid, FUNC, &mut buf).unwrap();
    assert_eq!(buf[0], 0xEB);

    fixture.exec.remove_breakpoint(pid, FUNC, 1).unwrap();
    assert_eq!(peek(&fixture, FUNC), 0xEB);
}

#[test]
fn instruction_step_stops_once_with_pc_advanced() {
    let mut fixture = boot(call_program());
    let pid = fixture.pid;

    fixture.exec.set_breakpoint(pid, FUNC, 3).unwrap();
    fixture.exec.continue_debug(true).unwrap();
    assert!(pump_until_stop(&mut fixture.exec));

    fixture.exec.step_instruction(pid, false).unwrap();
    fixture.exec.continue_debug(true).unwrap();
    assert!(pump_until_stop(&mut fixture.exec), "no step stop");

    assert_eq!(fixture.recorder.log().last(), Some(&Seen::StepComplete(1)));
    let context = fixture.exec.get_thread_context(pid, 1, CTX_FULL).unwrap();
    assert_eq!(context.pc, FUNC + 1);

    // the trap went back in while the step ran
    assert_eq!(peek(&fixture, FUNC), 0xCC);

    fixture.exec.continue_debug(true).unwrap();
    pump_until_exit(&mut fixture.exec, pid);
}

#[test]
fn continuing_past_an_owned_breakpoint_rearms_it() {
    let mut fixture = boot(loop_program());
    let pid = fixture.pid;

    fixture.exec.set_breakpoint(pid, LOOP_TOP, 5).unwrap();
    fixture.exec.continue_debug(true).unwrap();
    assert!(pump_until_stop(&mut fixture.exec), "first hit");

    fixture.exec.continue_debug(true).unwrap();
    assert!(pump_until_stop(&mut fixture.exec), "second hit");

    let hits = fixture
        .recorder
        .log()
        .iter()
        .filter(|s| matches!(s, Seen::Breakpoint { address, .. } if *address == LOOP_TOP))
        .count();
    assert_eq!(hits, 2);
    assert_eq!(peek(&fixture, LOOP_TOP), 0xCC);

    fixture.exec.terminate(pid).unwrap();
    pump_until_exit(&mut fixture.exec, pid);
}

#[test]
fn other_threads_pause_while_a_trap_is_restored() {
    let mut fixture = boot(loop_program());
    let pid = fixture.pid;

    let tid2 = fixture.sim.lock().unwrap().spawn_thread(pid, SECOND_LOOP).unwrap();
    fixture.exec.set_breakpoint(pid, LOOP_TOP, 11).unwrap();
    fixture.exec.continue_debug(true).unwrap();
    assert!(pump_until_stop(&mut fixture.exec), "no breakpoint stop");
    assert!(fixture.recorder.log().contains(&Seen::ThreadStart(tid2)));

    // continuing unpatches the trap and fences the other thread off
    fixture.exec.continue_debug(true).unwrap();
    assert_eq!(fixture.sim.lock().unwrap().suspend_count(tid2), Some(1));
    assert_eq!(peek(&fixture, LOOP_TOP), 0x90);

    // the step-away completes on the next event; everyone runs again
    assert!(fixture.exec.wait_for_event(10).unwrap());
    assert!(!fixture.exec.dispatch_event().unwrap());
    assert_eq!(fixture.sim.lock().unwrap().suspend_count(tid2), Some(0));
    assert_eq!(peek(&fixture, LOOP_TOP), 0xCC);

    fixture.exec.terminate(pid).unwrap();
    pump_until_exit(&mut fixture.exec, pid);
}

#[test]
fn embedded_trap_is_reported_without_owners_and_skipped() {
    let mut fixture = boot(embedded_trap_program());
    let pid = fixture.pid;

    fixture.exec.continue_debug(true).unwrap();
    assert!(pump_until_stop(&mut fixture.exec), "no embedded stop");

    assert_eq!(
        fixture.recorder.log().last(),
        Some(&Seen::Breakpoint {
            address: ENTRY + 2,
            cookies: vec![],
            embedded: true,
        })
    );

    // continuing hops over the foreign trap instead of re-raising it
    fixture.exec.continue_debug(true).unwrap();
    pump_until_exit(&mut fixture.exec, pid);
}

#[test]
fn async_break_surfaces_as_a_break_stop() {
    let mut fixture = boot(loop_program());
    let pid = fixture.pid;

    fixture.exec.continue_debug(true).unwrap();
    fixture.exec.break_into(pid).unwrap();
    assert!(pump_until_stop(&mut fixture.exec), "no break stop");
    assert_eq!(fixture.recorder.log().last(), Some(&Seen::AsyncBreak));

    fixture.exec.continue_debug(true).unwrap();
    fixture.exec.terminate(pid).unwrap();
    pump_until_exit(&mut fixture.exec, pid);
}

#[test]
fn image_file_handles_are_closed_exactly_once() {
    let mut prog = call_program();
    prog.modules = vec![SimModule {
        base: 0x5000_0000,
        size: 0x1000,
        path: "helper.dll".into(),
    }];

    let fixture = boot(prog);
    assert!(fixture
        .recorder
        .log()
        .contains(&Seen::ModuleLoad(0x5000_0000)));

    let sim = fixture.sim.lock().unwrap();
    assert_eq!(sim.open_file_handles(), 0);
    assert_eq!(sim.closed_file_handles(), 2);
}

#[test]
fn shutdown_is_idempotent() {
    let mut fixture = boot(call_program());

    fixture.exec.shutdown().unwrap();
    fixture.exec.shutdown().unwrap();

    assert!(matches!(
        fixture.exec.wait_for_event(10),
        Err(EngineError::WrongState { .. })
    ));
    assert!(matches!(
        fixture.exec.launch(&LaunchInfo::default()),
        Err(EngineError::WrongState { .. })
    ));
}

#[test]
fn stepping_needs_a_stopped_process() {
    let mut fixture = boot(call_program());
    let pid = fixture.pid;

    fixture.exec.continue_debug(true).unwrap();
    assert!(matches!(
        fixture.exec.step_instruction(pid, true),
        Err(EngineError::WrongState { .. })
    ));
    assert!(matches!(
        fixture.exec.step_instruction(pid + 1, true),
        Err(EngineError::ProcessNotFound { .. })
    ));
}

#[test]
fn a_pending_event_blocks_another_wait() {
    let mut fixture = boot(call_program());
    assert!(matches!(
        fixture.exec.wait_for_event(10),
        Err(EngineError::WrongState { .. })
    ));
}

#[test]
fn context_changes_round_trip_through_the_engine() {
    let mut fixture = boot(call_program());
    let pid = fixture.pid;

    let mut context = fixture.exec.get_thread_context(pid, 1, CTX_FULL).unwrap();
    context.gpr[GPR_AX] = 0x1234_5678;
    fixture.exec.set_thread_context(pid, 1, &context).unwrap();

    let back = fixture.exec.get_thread_context(pid, 1, CTX_FULL).unwrap();
    assert_eq!(back.gpr[GPR_AX], 0x1234_5678);
}

#[test]
fn breakpoint_exception_codes_are_not_surfaced_as_plain_exceptions() {
    let mut fixture = boot(call_program());
    let pid = fixture.pid;

    fixture.exec.set_breakpoint(pid, FUNC, 1).unwrap();
    fixture.exec.continue_debug(true).unwrap();
    assert!(pump_until_stop(&mut fixture.exec));

    assert!(!fixture
        .recorder
        .log()
        .contains(&Seen::Exception(EXCEPTION_BREAKPOINT)));
}

#[test]
fn proxy_marshals_calls_and_reads_from_any_thread() {
    let mut sim = SimPort::new();
    sim.register_program(PATH, call_program());
    let sim = Arc::new(Mutex::new(sim));
    let port: SharedPort = sim.clone();

    let recorder = Recorder::default();
    let proxy = Arc::new(ExecProxy::start(port, Box::new(recorder.clone())));

    let pid = proxy
        .launch(LaunchInfo {
            exe_path: PATH.into(),
            ..Default::default()
        })
        .expect("launch");

    assert!(wait_for(&recorder, |log| log.contains(&Seen::LoadComplete)));

    proxy.set_breakpoint(pid, FUNC, 21).unwrap();

    // transparent read from a thread that is neither the client nor the
    // worker
    let byte = {
        let proxy = Arc::clone(&proxy);
        std::thread::spawn(move || {
            let mut buf = [0u8; 1];
            proxy.read_memory(pid, FUNC, &mut buf).map(|_| buf[0])
        })
        .join()
        .unwrap()
    };
    assert_eq!(byte.unwrap(), 0x90);

    proxy.continue_debug(true).unwrap();
    assert!(wait_for(&recorder, |log| {
        log.iter()
            .any(|s| matches!(s, Seen::Breakpoint { address, .. } if *address == FUNC))
    }));

    proxy.continue_debug(true).unwrap();
    assert!(wait_for(&recorder, |log| {
        log.iter().any(|s| matches!(s, Seen::ProcessExit(p, _) if *p == pid))
    }));

    proxy.shutdown().unwrap();
    proxy.shutdown().unwrap();
}

fn wait_for<F: Fn(&[Seen]) -> bool>(recorder: &Recorder, predicate: F) -> bool {
    for _ in 0..300 {
        if predicate(&recorder.log()) {
            return true;
        }
        std::thread::sleep(Duration::from_millis(10));
    }
    false
}

#[test]
fn a_trap_outside_the_image_is_not_the_loader_breakpoint() {
    let mut code = vec![0u8; 0x10];
    code[0] = 0xCC;
    code[1] = 0x90;
    code[2] = 0xF4;
    let prog = SimProgram {
        image_base: 0x10_0000,
        image_size: 0x1000,
        entry_point: ENTRY,
        regions: vec![(ENTRY, code)],
        modules: vec![],
    };

    let mut sim = SimPort::new();
    sim.register_program(PATH, prog);
    let sim = Arc::new(Mutex::new(sim));
    let port: SharedPort = sim.clone();

    let recorder = Recorder::default();
    let mut exec = Exec::new(port, Box::new(recorder.clone()));
    let pid = exec
        .launch(&LaunchInfo {
            exe_path: PATH.into(),
            ..Default::default()
        })
        .expect("launch");

    assert!(pump_until_stop(&mut exec), "no stop");

    // the entry trap raises outside the main image, so it belongs to the
    // debuggee rather than the loader
    assert_eq!(
        recorder.log().last(),
        Some(&Seen::Breakpoint {
            address: ENTRY,
            cookies: vec![],
            embedded: true,
        })
    );

    exec.continue_debug(true).unwrap();
    pump_until_exit(&mut exec, pid);
    assert!(!recorder.log().contains(&Seen::LoadComplete));
}

#[test]
fn a_fault_during_a_step_away_still_restores_the_trap_and_the_threads() {
    let mut code = vec![0u8; 0x200];
    code[0x000] = 0xCC;
    code[0x001] = 0x90;
    code[0x002] = 0xF5; // faults in the simulator
    code[0x003] = 0x90;
    code[0x004] = 0xF4;
    code[0x080] = 0x90;
    code[0x081..0x083].copy_from_slice(&[0xEB, 0xFD]);
    let mut fixture = boot(program(code));
    let pid = fixture.pid;
    let bad = ENTRY + 2;

    let tid2 = fixture.sim.lock().unwrap().spawn_thread(pid, SECOND_LOOP).unwrap();
    fixture.exec.set_breakpoint(pid, bad, 13).unwrap();
    fixture.exec.continue_debug(true).unwrap();
    assert!(pump_until_stop(&mut fixture.exec), "no breakpoint stop");
    assert_eq!(
        fixture.recorder.log().last(),
        Some(&Seen::Breakpoint {
            address: bad,
            cookies: vec![13],
            embedded: false,
        })
    );

    // continuing unpatches the trap and fences the other thread off
    fixture.exec.continue_debug(true).unwrap();
    assert_eq!(fixture.sim.lock().unwrap().suspend_count(tid2), Some(1));
    assert_eq!(peek(&fixture, bad), 0xF5);

    // the step-away faults instead of completing; the trap still goes
    // back in and the other thread wakes up
    assert!(pump_until_stop(&mut fixture.exec), "no fault stop");
    assert_eq!(
        fixture.recorder.log().last(),
        Some(&Seen::Exception(EXCEPTION_ILLEGAL_INSTRUCTION))
    );
    assert_eq!(fixture.sim.lock().unwrap().suspend_count(tid2), Some(0));
    assert_eq!(peek(&fixture, bad), 0xCC);

    fixture.exec.terminate(pid).unwrap();
    pump_until_exit(&mut fixture.exec, pid);
}

#[test]
fn a_stepper_trap_hit_by_a_bystander_thread_is_not_reported() {
    let mut code = vec![0u8; 0x200];
    code[0x000] = 0xCC;
    code[0x001] = 0x90;
    code[0x002..0x007].copy_from_slice(&[0xE8, 0xF9, 0x00, 0x00, 0x00]); // call FUNC
    code[0x007] = 0x90; // return address; a second thread loops here
    code[0x008..0x00A].copy_from_slice(&[0xEB, 0xFD]);
    code[0x100..0x108].fill(0x90);
    code[0x108] = 0xC3;
    let mut fixture = boot(program(code));
    let pid = fixture.pid;
    let call_addr = ENTRY + 2;
    let landing = ENTRY + 7;

    fixture.exec.set_breakpoint(pid, call_addr, 4).unwrap();
    fixture.exec.continue_debug(true).unwrap();
    assert!(pump_until_stop(&mut fixture.exec), "no breakpoint stop");

    // while stopped at the call, start a thread that will run straight
    // into the stepper's trap at the return address
    fixture.sim.lock().unwrap().spawn_thread(pid, landing).unwrap();
    fixture.exec.step_instruction(pid, false).unwrap();
    fixture.exec.continue_debug(true).unwrap();
    assert!(pump_until_stop(&mut fixture.exec), "no step stop");

    assert_eq!(fixture.recorder.log().last(), Some(&Seen::StepComplete(1)));
    // the bystander was stepped past the trap silently
    assert!(!fixture
        .recorder
        .log()
        .iter()
        .any(|s| matches!(s, Seen::Breakpoint { address, .. } if *address == landing)));

    fixture.exec.terminate(pid).unwrap();
    pump_until_exit(&mut fixture.exec, pid);
}

#[test]
fn overlapping_step_aways_on_two_threads_restore_both_traps() {
    let mut fixture = boot(loop_program());
    let pid = fixture.pid;

    fixture.exec.set_breakpoint(pid, LOOP_TOP, 1).unwrap();
    fixture.exec.set_breakpoint(pid, SECOND_LOOP, 2).unwrap();
    fixture.exec.continue_debug(true).unwrap();
    assert!(pump_until_stop(&mut fixture.exec), "no first stop");

    // the second thread appears while the first restore is still pending
    let tid2 = fixture.sim.lock().unwrap().spawn_thread(pid, SECOND_LOOP).unwrap();
    fixture.exec.continue_debug(true).unwrap();
    assert!(pump_until_stop(&mut fixture.exec), "no second stop");
    assert!(fixture
        .recorder
        .log()
        .iter()
        .any(|s| matches!(s, Seen::Breakpoint { address, .. } if *address == SECOND_LOOP)));

    fixture.exec.continue_debug(true).unwrap();
    assert!(pump_until_stop(&mut fixture.exec), "no third stop");

    // both traps are back in and nobody is left suspended
    assert_eq!(peek(&fixture, LOOP_TOP), 0xCC);
    assert_eq!(peek(&fixture, SECOND_LOOP), 0xCC);
    assert_eq!(fixture.sim.lock().unwrap().suspend_count(1), Some(0));
    assert_eq!(fixture.sim.lock().unwrap().suspend_count(tid2), Some(0));

    fixture.exec.terminate(pid).unwrap();
    pump_until_exit(&mut fixture.exec, pid);
}

#[test]
fn range_stepping_stops_only_after_leaving_the_ranges() {
    let mut code = vec![0u8; 0x10];
    code[0x0] = 0xCC;
    code[0x1] = 0x90;
    code[0x2] = 0x90;
    code[0x3] = 0x90;
    code[0x4..0x6].copy_from_slice(&[0xEB, 0x04]); // jmp ENTRY+0x0A
    code[0xA] = 0x90;
    code[0xB] = 0xF4;
    let mut fixture = boot(program(code));
    let pid = fixture.pid;

    fixture.exec.set_breakpoint(pid, ENTRY + 1, 6).unwrap();
    fixture.exec.continue_debug(true).unwrap();
    assert!(pump_until_stop(&mut fixture.exec), "no breakpoint stop");

    fixture
        .exec
        .step_range(
            pid,
            false,
            false,
            vec![AddressRange {
                begin: ENTRY + 1,
                end: ENTRY + 4,
            }],
        )
        .unwrap();
    fixture.exec.continue_debug(true).unwrap();
    assert!(pump_until_stop(&mut fixture.exec), "no step stop");

    // one stop, at the jump target outside the ranges
    assert_eq!(fixture.recorder.log().last(), Some(&Seen::StepComplete(1)));
    let steps = fixture
        .recorder
        .log()
        .iter()
        .filter(|s| matches!(s, Seen::StepComplete(_)))
        .count();
    assert_eq!(steps, 1);
    let context = fixture.exec.get_thread_context(pid, 1, CTX_FULL).unwrap();
    assert_eq!(context.pc, ENTRY + 0x0A);

    fixture.exec.continue_debug(true).unwrap();
    pump_until_exit(&mut fixture.exec, pid);
}

#[test]
fn step_out_runs_to_the_callers_return_address() {
    let mut fixture = boot(call_program());
    let pid = fixture.pid;

    fixture.exec.set_breakpoint(pid, FUNC, 8).unwrap();
    fixture.exec.continue_debug(true).unwrap();
    assert!(pump_until_stop(&mut fixture.exec), "no breakpoint stop");

    fixture.exec.step_out(pid, ENTRY + 7).unwrap();
    fixture.exec.continue_debug(true).unwrap();
    assert!(pump_until_stop(&mut fixture.exec), "no step stop");

    assert_eq!(fixture.recorder.log().last(), Some(&Seen::StepComplete(1)));
    let context = fixture.exec.get_thread_context(pid, 1, CTX_FULL).unwrap();
    assert_eq!(context.pc, ENTRY + 7);
    // the breakpoint inside the callee went back in on the way out
    assert_eq!(peek(&fixture, FUNC), 0xCC);

    fixture.exec.continue_debug(true).unwrap();
    pump_until_exit(&mut fixture.exec, pid);
}

#[test]
fn source_step_in_stops_at_an_approved_call_target() {
    let mut fixture = boot(call_program());
    let pid = fixture.pid;
    let reader = fixture.exec.memory_access(pid).unwrap();
    *fixture.recorder.reader.lock().unwrap() = Some(reader);

    fixture.exec.set_breakpoint(pid, ENTRY + 2, 9).unwrap();
    fixture.exec.continue_debug(true).unwrap();
    assert!(pump_until_stop(&mut fixture.exec), "no breakpoint stop");

    fixture
        .exec
        .step_range(
            pid,
            true,
            true,
            vec![AddressRange {
                begin: ENTRY + 2,
                end: ENTRY + 6,
            }],
        )
        .unwrap();
    fixture.exec.continue_debug(true).unwrap();
    assert!(pump_until_stop(&mut fixture.exec), "no step stop");

    // the callback read target memory while the engine was mid-step
    assert!(fixture.recorder.log().contains(&Seen::CallTarget(FUNC)));
    assert_eq!(fixture.recorder.log().last(), Some(&Seen::StepComplete(1)));
    let context = fixture.exec.get_thread_context(pid, 1, CTX_FULL).unwrap();
    assert_eq!(context.pc, FUNC);

    fixture.exec.continue_debug(true).unwrap();
    pump_until_exit(&mut fixture.exec, pid);
}

#[test]
fn source_step_in_runs_past_a_rejected_call_target() {
    let mut prog = call_program();
    prog.regions[0].1[0x100] = 0xC3; // bare ret; not an acceptable stop
    let mut fixture = boot(prog);
    let pid = fixture.pid;
    let reader = fixture.exec.memory_access(pid).unwrap();
    *fixture.recorder.reader.lock().unwrap() = Some(reader);

    fixture.exec.set_breakpoint(pid, ENTRY + 2, 9).unwrap();
    fixture.exec.continue_debug(true).unwrap();
    assert!(pump_until_stop(&mut fixture.exec), "no breakpoint stop");

    fixture
        .exec
        .step_range(
            pid,
            true,
            true,
            vec![AddressRange {
                begin: ENTRY + 2,
                end: ENTRY + 6,
            }],
        )
        .unwrap();
    fixture.exec.continue_debug(true).unwrap();
    assert!(pump_until_stop(&mut fixture.exec), "no step stop");

    // rejected: the step fell back to the return address, as a step over
    assert!(fixture.recorder.log().contains(&Seen::CallTarget(FUNC)));
    assert_eq!(fixture.recorder.log().last(), Some(&Seen::StepComplete(1)));
    let context = fixture.exec.get_thread_context(pid, 1, CTX_FULL).unwrap();
    assert_eq!(context.pc, ENTRY + 7);

    fixture.exec.continue_debug(true).unwrap();
    pump_until_exit(&mut fixture.exec, pid);
}
