//! Vigil - event-driven native-code debugger engine.
//!
//! Small driver around the engine crate: launches a target under the
//! debugger (Win32 on Windows, the built-in simulator anywhere) and
//! prints the cooked event stream.

use std::sync::{Arc, Mutex};

use clap::Parser;
use colored::Colorize;

use vigil::exec::event::{Cookie, EventCallback, ExceptionRecord, RunMode};
use vigil::exec::module::Module;
use vigil::exec::process::Process;
use vigil::exec::thread::Thread;
use vigil::exec::{Exec, DEFAULT_WAIT_MS};
use vigil::port::sim::{SimPort, SimProgram};
use vigil::port::{LaunchInfo, SharedPort};

/// Vigil: native-code debugger engine
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Target binary to launch under the debugger
    #[arg(short, long)]
    target: Option<String>,

    /// Attach to a running process by pid
    #[arg(short, long)]
    attach: Option<u32>,

    /// Run the built-in simulator demo instead of a real target
    #[arg(long, default_value_t = false)]
    sim_demo: bool,

    /// Verbosity level (-v, -vv, -vvv)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,
}

/// Prints every cooked event; stops at breakpoints and steps.
struct PrintCallback;

impl EventCallback for PrintCallback {
    fn on_process_start(&mut self, process: &Process) {
        println!(
            "{} pid {} ({})",
            "[process start]".green().bold(),
            process.id,
            process.path
        );
    }

    fn on_process_exit(&mut self, pid: u32, exit_code: u32) {
        println!(
            "{} pid {} code {}",
            "[process exit]".green().bold(),
            pid,
            exit_code
        );
    }

    fn on_thread_start(&mut self, _process: &Process, thread: &Thread) {
        println!("{} tid {}", "[thread start]".cyan(), thread.id);
    }

    fn on_thread_exit(&mut self, _process: &Process, tid: u32, exit_code: u32) {
        println!("{} tid {} code {}", "[thread exit]".cyan(), tid, exit_code);
    }

    fn on_module_load(&mut self, _process: &Process, module: &Module) {
        println!(
            "{} {:#x} {}",
            "[module load]".blue(),
            module.image_base,
            module.path
        );
    }

    fn on_module_unload(&mut self, _process: &Process, image_base: u64) {
        println!("{} {:#x}", "[module unload]".blue(), image_base);
    }

    fn on_output_string(&mut self, _process: &Process, text: &str) {
        println!("{} {}", "[debug output]".yellow(), text.trim_end());
    }

    fn on_load_complete(&mut self, _process: &Process, tid: u32) {
        println!("{} tid {}", "[loader done]".magenta().bold(), tid);
    }

    fn on_exception(
        &mut self,
        _process: &Process,
        tid: u32,
        first_chance: bool,
        record: &ExceptionRecord,
    ) -> RunMode {
        println!(
            "{} code {:#x} at {:#x} tid {} ({})",
            "[exception]".red().bold(),
            record.code,
            record.address,
            tid,
            if first_chance {
                "first chance"
            } else {
                "second chance"
            }
        );
        // pass first-chance exceptions to the debuggee, stop on the rest
        if first_chance {
            RunMode::Run
        } else {
            RunMode::Break
        }
    }

    fn on_breakpoint(
        &mut self,
        _process: &Process,
        tid: u32,
        address: u64,
        cookies: &[Cookie],
        embedded: bool,
    ) -> RunMode {
        println!(
            "{} at {:#x} tid {} owners {:?}{}",
            "[breakpoint]".red().bold(),
            address,
            tid,
            cookies,
            if embedded { " (embedded)" } else { "" }
        );
        RunMode::Break
    }

    fn on_step_complete(&mut self, _process: &Process, tid: u32) {
        println!("{} tid {}", "[step done]".magenta(), tid);
    }

    fn on_async_break_complete(&mut self, _process: &Process, tid: u32) {
        println!("{} tid {}", "[break done]".magenta(), tid);
    }

    fn on_error(
        &mut self,
        _process: &Process,
        error: &vigil::EngineError,
        kind: vigil::exec::event::EventKind,
    ) {
        println!("{} {:?}: {}", "[engine error]".red().bold(), kind, error);
    }
}

const DEMO_PATH: &str = "demo.sim";
const DEMO_BASE: u64 = 0x40_0000;
const DEMO_ENTRY: u64 = 0x40_1000;
const DEMO_FUNC: u64 = 0x40_1100;

/// A tiny program: trap byte at entry (loader breakpoint), nop, a call
/// into a helper, nop, exit.
fn demo_program() -> SimProgram {
    let mut code = vec![0u8; 0x200];
    code[0x000] = 0xCC;
    code[0x001] = 0x90;
    code[0x002..0x007].copy_from_slice(&[0xE8, 0xF9, 0x00, 0x00, 0x00]); // call DEMO_FUNC
    code[0x007] = 0x90;
    code[0x008] = 0xF4;
    code[0x100] = 0x90;
    code[0x101] = 0xC3;

    SimProgram {
        image_base: DEMO_BASE,
        image_size: 0x2000,
        entry_point: DEMO_ENTRY,
        regions: vec![(DEMO_ENTRY, code)],
        modules: vec![],
    }
}

fn run_loop(mut exec: Exec, pid: u32) -> anyhow::Result<()> {
    let bp_cookie: Cookie = 1;
    let mut bp_set = false;

    while exec.process(pid).is_some() {
        if !exec.wait_for_event(DEFAULT_WAIT_MS)? {
            continue;
        }
        if !exec.dispatch_event()? {
            continue;
        }

        // stopped: after the loader settles, plant the demo breakpoint
        if !bp_set {
            exec.set_breakpoint(pid, DEMO_FUNC, bp_cookie)?;
            bp_set = true;
            log::info!("breakpoint set at {:#x}", DEMO_FUNC);
        }

        if let Some(process) = exec.process(pid) {
            if let Some(machine) = process.machine.as_ref() {
                if let Some(pc) = machine.pc() {
                    let mut bytes = [0u8; 8];
                    let (read, _) = exec.read_memory(pid, pc, &mut bytes)?;
                    println!("    pc {:#x}: {}", pc, hex::encode(&bytes[..read]).dimmed());
                }
            }
        }

        exec.continue_debug(true)?;
    }

    exec.shutdown()?;
    Ok(())
}

fn run_sim_demo() -> anyhow::Result<()> {
    let mut sim = SimPort::new();
    sim.register_program(DEMO_PATH, demo_program());

    let port: SharedPort = Arc::new(Mutex::new(sim));
    let mut exec = Exec::new(Arc::clone(&port), Box::new(PrintCallback));

    let pid = exec.launch(&LaunchInfo {
        exe_path: DEMO_PATH.into(),
        ..Default::default()
    })?;
    run_loop(exec, pid)
}

fn run_target(args: &Args) -> anyhow::Result<()> {
    #[cfg(target_os = "windows")]
    {
        let port: SharedPort = Arc::new(Mutex::new(vigil::port::windows::WindowsPort::new()));
        let mut exec = Exec::new(Arc::clone(&port), Box::new(PrintCallback));
        let pid = match (&args.target, args.attach) {
            (Some(path), _) => exec.launch(&LaunchInfo {
                exe_path: path.clone(),
                ..Default::default()
            })?,
            (None, Some(pid)) => exec.attach(pid)?,
            (None, None) => anyhow::bail!("nothing to debug; pass --target or --attach"),
        };
        run_loop(exec, pid)
    }

    #[cfg(not(target_os = "windows"))]
    {
        let _ = args;
        anyhow::bail!("live targets need Windows; try --sim-demo")
    }
}

fn main() -> anyhow::Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(
        match std::env::args().filter(|a| a == "-v").count() {
            0 => "warn",
            1 => "info",
            2 => "debug",
            _ => "trace",
        },
    ))
    .init();

    let args = Args::parse();
    log::debug!("args: {:?}", args);

    println!("[*] Vigil v{} - debugger engine", env!("CARGO_PKG_VERSION"));

    if args.sim_demo || (args.target.is_none() && args.attach.is_none()) {
        run_sim_demo()
    } else {
        run_target(&args)
    }
}
