//! Cross-thread marshaling for the engine.
//!
//! The OS pins a debuggee to the thread that launched it, so the engine
//! proper lives on a dedicated worker thread. [`ExecProxy`] is the
//! any-thread facade: each call is sent over a bounded channel and the
//! reply awaited, while the worker alternates between serving commands and
//! pumping debug events. Callbacks fire on the worker thread.
//!
//! Memory reads skip the channel entirely: the worker hands out a
//! [`MemoryAccess`] per process once, and reads go straight to the port.

use std::collections::HashMap;
use std::sync::mpsc::{sync_channel, Receiver, SyncSender, TrySendError};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::Duration;

use log::{debug, error, warn};

use crate::error::{EngineError, Result};
use crate::exec::event::{Cookie, EventCallback};
use crate::exec::{Exec, MemoryAccess};
use crate::machine::context::ThreadContext;
use crate::machine::steppers::AddressRange;
use crate::port::{LaunchInfo, SharedPort};

const COMMAND_QUEUE_DEPTH: usize = 64;
const EVENT_WAIT_MS: u32 = 50;

type Reply<T> = SyncSender<Result<T>>;

enum Command {
    Launch(LaunchInfo, Reply<u32>),
    Attach(u32, Reply<u32>),
    ResumeLaunched(u32, Reply<()>),
    Terminate(u32, Reply<()>),
    Detach(u32, Reply<()>),
    BreakInto(u32, Reply<()>),
    ContinueDebug(bool, Reply<()>),
    SetBreakpoint(u32, u64, Cookie, Reply<()>),
    RemoveBreakpoint(u32, u64, Cookie, Reply<()>),
    StepInstruction(u32, bool, Reply<()>),
    StepRange(u32, bool, bool, Vec<AddressRange>, Reply<()>),
    StepOut(u32, u64, Reply<()>),
    CancelStep(u32, Reply<()>),
    WriteMemory(u32, u64, Vec<u8>, Reply<usize>),
    GetContext(u32, u32, u32, Reply<ThreadContext>),
    SetContext(u32, u32, ThreadContext, Reply<()>),
    MemoryReader(u32, Reply<MemoryAccess>),
    Shutdown(Reply<()>),
}

/// Thread-safe facade over an [`Exec`] running on its own worker thread.
pub struct ExecProxy {
    tx: SyncSender<Command>,
    worker: Mutex<Option<JoinHandle<()>>>,
    readers: Mutex<HashMap<u32, Arc<MemoryAccess>>>,
}

impl ExecProxy {
    /// Spawns the worker and builds the engine on it, so every debuggee is
    /// owned by that thread.
    pub fn start(port: SharedPort, callback: Box<dyn EventCallback>) -> Self {
        let (tx, rx) = sync_channel(COMMAND_QUEUE_DEPTH);
        let worker = std::thread::Builder::new()
            .name("vigil-exec".into())
            .spawn(move || worker_main(port, callback, rx))
            .expect("worker thread spawn");

        ExecProxy {
            tx,
            worker: Mutex::new(Some(worker)),
            readers: Mutex::new(HashMap::new()),
        }
    }

    fn call<T>(&self, build: impl FnOnce(Reply<T>) -> Command) -> Result<T> {
        let (reply_tx, reply_rx) = sync_channel(1);
        self.tx
            .send(build(reply_tx))
            .map_err(|_| EngineError::RemoteFailure)?;
        reply_rx.recv().map_err(|_| EngineError::RemoteFailure)?
    }

    pub fn launch(&self, info: LaunchInfo) -> Result<u32> {
        self.call(|reply| Command::Launch(info, reply))
    }

    pub fn attach(&self, pid: u32) -> Result<u32> {
        self.call(|reply| Command::Attach(pid, reply))
    }

    pub fn resume_launched_process(&self, pid: u32) -> Result<()> {
        self.call(|reply| Command::ResumeLaunched(pid, reply))
    }

    pub fn terminate(&self, pid: u32) -> Result<()> {
        self.call(|reply| Command::Terminate(pid, reply))
    }

    pub fn detach(&self, pid: u32) -> Result<()> {
        self.call(|reply| Command::Detach(pid, reply))
    }

    pub fn break_into(&self, pid: u32) -> Result<()> {
        self.call(|reply| Command::BreakInto(pid, reply))
    }

    pub fn continue_debug(&self, handled: bool) -> Result<()> {
        self.call(|reply| Command::ContinueDebug(handled, reply))
    }

    pub fn set_breakpoint(&self, pid: u32, address: u64, cookie: Cookie) -> Result<()> {
        self.call(|reply| Command::SetBreakpoint(pid, address, cookie, reply))
    }

    pub fn remove_breakpoint(&self, pid: u32, address: u64, cookie: Cookie) -> Result<()> {
        self.call(|reply| Command::RemoveBreakpoint(pid, address, cookie, reply))
    }

    pub fn step_instruction(&self, pid: u32, step_in: bool) -> Result<()> {
        self.call(|reply| Command::StepInstruction(pid, step_in, reply))
    }

    pub fn step_range(
        &self,
        pid: u32,
        step_in: bool,
        source_mode: bool,
        ranges: Vec<AddressRange>,
    ) -> Result<()> {
        self.call(|reply| Command::StepRange(pid, step_in, source_mode, ranges, reply))
    }

    pub fn step_out(&self, pid: u32, target_address: u64) -> Result<()> {
        self.call(|reply| Command::StepOut(pid, target_address, reply))
    }

    pub fn cancel_step(&self, pid: u32) -> Result<()> {
        self.call(|reply| Command::CancelStep(pid, reply))
    }

    pub fn write_memory(&self, pid: u32, address: u64, data: &[u8]) -> Result<usize> {
        self.call(|reply| Command::WriteMemory(pid, address, data.to_vec(), reply))
    }

    pub fn get_thread_context(&self, pid: u32, tid: u32, flags: u32) -> Result<ThreadContext> {
        self.call(|reply| Command::GetContext(pid, tid, flags, reply))
    }

    pub fn set_thread_context(&self, pid: u32, tid: u32, context: ThreadContext) -> Result<()> {
        self.call(|reply| Command::SetContext(pid, tid, context, reply))
    }

    /// Breakpoint-transparent read, callable from any thread without a
    /// round trip through the worker.
    pub fn read_memory(&self, pid: u32, address: u64, buf: &mut [u8]) -> Result<(usize, usize)> {
        let reader = self.reader_for(pid)?;
        reader.read(address, buf)
    }

    fn reader_for(&self, pid: u32) -> Result<Arc<MemoryAccess>> {
        {
            let readers = self
                .readers
                .lock()
                .map_err(|_| EngineError::RemoteFailure)?;
            if let Some(reader) = readers.get(&pid) {
                return Ok(Arc::clone(reader));
            }
        }

        let reader = Arc::new(self.call(|reply| Command::MemoryReader(pid, reply))?);
        let mut readers = self
            .readers
            .lock()
            .map_err(|_| EngineError::RemoteFailure)?;
        Ok(Arc::clone(readers.entry(pid).or_insert(reader)))
    }

    /// Stops the worker and tears down the engine. Idempotent; later calls
    /// are no-ops.
    pub fn shutdown(&self) -> Result<()> {
        let worker = {
            let mut slot = self.worker.lock().map_err(|_| EngineError::RemoteFailure)?;
            match slot.take() {
                Some(worker) => worker,
                None => return Ok(()),
            }
        };

        let result = self.call(|reply| Command::Shutdown(reply));
        if worker.join().is_err() {
            return Err(EngineError::RemoteFailure);
        }
        // a worker that died before replying still counts as shut down
        match result {
            Err(EngineError::RemoteFailure) => Ok(()),
            other => other,
        }
    }
}

impl Drop for ExecProxy {
    fn drop(&mut self) {
        if let Err(err) = self.shutdown() {
            warn!("engine shutdown during drop failed: {}", err);
        }
    }
}

fn worker_main(port: SharedPort, callback: Box<dyn EventCallback>, rx: Receiver<Command>) {
    let mut exec = Exec::new(port, callback);
    // true while an event is dispatched and waiting for continue_debug
    let mut holding_stop = false;

    loop {
        if holding_stop {
            // nothing to pump; block on the next command
            match rx.recv_timeout(Duration::from_millis(200)) {
                Ok(command) => {
                    let (quit, continued) = serve(&mut exec, command);
                    if continued {
                        holding_stop = false;
                    }
                    if quit {
                        return;
                    }
                }
                Err(std::sync::mpsc::RecvTimeoutError::Timeout) => {}
                Err(std::sync::mpsc::RecvTimeoutError::Disconnected) => break,
            }
            continue;
        }

        loop {
            match rx.try_recv() {
                Ok(command) => {
                    let (quit, _) = serve(&mut exec, command);
                    if quit {
                        return;
                    }
                }
                Err(std::sync::mpsc::TryRecvError::Empty) => break,
                Err(std::sync::mpsc::TryRecvError::Disconnected) => {
                    if let Err(err) = exec.shutdown() {
                        error!("shutdown after client loss failed: {}", err);
                    }
                    return;
                }
            }
        }

        match exec.wait_for_event(EVENT_WAIT_MS) {
            Ok(true) => match exec.dispatch_event() {
                Ok(stopped) => holding_stop = stopped,
                Err(err) => error!("event dispatch failed: {}", err),
            },
            Ok(false) => {}
            Err(err) => error!("event wait failed: {}", err),
        }
    }

    if let Err(err) = exec.shutdown() {
        error!("shutdown after client loss failed: {}", err);
    }
}

/// Runs one command. Returns (worker should quit, debuggee was continued).
fn serve(exec: &mut Exec, command: Command) -> (bool, bool) {
    match command {
        Command::Launch(info, reply) => send(reply, exec.launch(&info)),
        Command::Attach(pid, reply) => send(reply, exec.attach(pid)),
        Command::ResumeLaunched(pid, reply) => send(reply, exec.resume_launched_process(pid)),
        Command::Terminate(pid, reply) => {
            let result = exec.terminate(pid);
            let continued = result.is_ok();
            send(reply, result);
            return (false, continued);
        }
        Command::Detach(pid, reply) => {
            let result = exec.detach(pid);
            let continued = result.is_ok();
            send(reply, result);
            return (false, continued);
        }
        Command::BreakInto(pid, reply) => send(reply, exec.break_into(pid)),
        Command::ContinueDebug(handled, reply) => {
            let result = exec.continue_debug(handled);
            let continued = result.is_ok();
            send(reply, result);
            return (false, continued);
        }
        Command::SetBreakpoint(pid, address, cookie, reply) => {
            send(reply, exec.set_breakpoint(pid, address, cookie))
        }
        Command::RemoveBreakpoint(pid, address, cookie, reply) => {
            send(reply, exec.remove_breakpoint(pid, address, cookie))
        }
        Command::StepInstruction(pid, step_in, reply) => {
            send(reply, exec.step_instruction(pid, step_in))
        }
        Command::StepRange(pid, step_in, source_mode, ranges, reply) => {
            send(reply, exec.step_range(pid, step_in, source_mode, ranges))
        }
        Command::StepOut(pid, target, reply) => send(reply, exec.step_out(pid, target)),
        Command::CancelStep(pid, reply) => send(reply, exec.cancel_step(pid)),
        Command::WriteMemory(pid, address, data, reply) => {
            send(reply, exec.write_memory(pid, address, &data))
        }
        Command::GetContext(pid, tid, flags, reply) => {
            send(reply, exec.get_thread_context(pid, tid, flags))
        }
        Command::SetContext(pid, tid, context, reply) => {
            send(reply, exec.set_thread_context(pid, tid, &context))
        }
        Command::MemoryReader(pid, reply) => send(reply, exec.memory_access(pid)),
        Command::Shutdown(reply) => {
            debug!("worker shutting down");
            send(reply, exec.shutdown());
            return (true, false);
        }
    }
    (false, false)
}

fn send<T>(reply: Reply<T>, result: Result<T>) {
    match reply.try_send(result) {
        Ok(()) | Err(TrySendError::Full(_)) => {}
        Err(TrySendError::Disconnected(_)) => {
            debug!("reply dropped; client went away");
        }
    }
}
