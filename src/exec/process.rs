//! Debuggee process records and lifecycle flags.

use std::collections::BTreeMap;

use crate::error::{EngineError, Result};
use crate::exec::module::Module;
use crate::exec::thread::Thread;
use crate::machine::context::CpuArch;
use crate::machine::Machine;
use crate::port::RawHandle;

/// One debuggee. Owns its threads, its module map, and exactly one machine
/// controller, created when the create-process event arrives and kept for
/// the process's lifetime.
pub struct Process {
    pub handle: RawHandle,
    pub id: u32,
    pub path: String,
    pub entry_point: u64,
    pub arch: CpuArch,
    pub image_base: u64,
    pub image_size: u32,

    // lifecycle flags
    pub stopped: bool,
    pub deleted: bool,
    pub terminating: bool,
    pub reached_loader_bp: bool,
    pub started: bool,

    /// Initial thread handle when the process was launched suspended and
    /// has not been resumed yet.
    pub launched_suspended_thread: Option<RawHandle>,
    /// An async break was requested and its trap has not arrived yet.
    pub await_break: bool,

    threads: Vec<Thread>,
    modules: BTreeMap<u64, Module>,
    /// Image base of the first module to load; used to recognize the
    /// loader breakpoint.
    os_module_base: Option<u64>,

    pub machine: Option<Machine>,
}

impl Process {
    pub fn new(handle: RawHandle, id: u32, path: String, arch: CpuArch) -> Self {
        Process {
            handle,
            id,
            path,
            entry_point: 0,
            arch,
            image_base: 0,
            image_size: 0,
            stopped: false,
            deleted: false,
            terminating: false,
            reached_loader_bp: false,
            started: false,
            launched_suspended_thread: None,
            await_break: false,
            threads: Vec::new(),
            modules: BTreeMap::new(),
            os_module_base: None,
            machine: None,
        }
    }

    /// Fails with a process-ended error when the process is already gone.
    pub fn ensure_alive(&self) -> Result<()> {
        if self.deleted || self.terminating {
            return Err(EngineError::ProcessEnded { pid: self.id });
        }
        Ok(())
    }

    pub fn add_thread(&mut self, thread: Thread) {
        self.threads.push(thread);
    }

    pub fn remove_thread(&mut self, tid: u32) {
        self.threads.retain(|t| t.id != tid);
    }

    pub fn find_thread(&self, tid: u32) -> Option<&Thread> {
        self.threads.iter().find(|t| t.id == tid)
    }

    pub fn threads(&self) -> &[Thread] {
        &self.threads
    }

    pub fn thread_count(&self) -> usize {
        self.threads.len()
    }

    pub fn add_module(&mut self, module: Module) {
        if self.os_module_base.is_none() {
            self.os_module_base = Some(module.image_base);
        }
        self.modules.insert(module.image_base, module);
    }

    pub fn mark_module_unloaded(&mut self, image_base: u64) {
        if let Some(module) = self.modules.get_mut(&image_base) {
            module.deleted = true;
        }
    }

    pub fn find_module(&self, image_base: u64) -> Option<&Module> {
        self.modules.get(&image_base)
    }

    pub fn modules(&self) -> impl Iterator<Item = &Module> {
        self.modules.values()
    }

    /// The first module ever loaded into this process, if still known.
    pub fn os_module(&self) -> Option<&Module> {
        self.os_module_base.and_then(|base| self.modules.get(&base))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn first_module_is_remembered_as_os_module() {
        let mut process = Process::new(1, 100, "a.exe".into(), CpuArch::X64);
        process.add_module(Module::new(0x1000, 0x100, "a.exe".into()));
        process.add_module(Module::new(0x9000, 0x100, "b.dll".into()));

        assert_eq!(process.os_module().unwrap().image_base, 0x1000);
    }

    #[test]
    fn ended_process_reports_distinguished_error() {
        let mut process = Process::new(1, 100, "a.exe".into(), CpuArch::X64);
        assert!(process.ensure_alive().is_ok());

        process.terminating = true;
        assert_eq!(
            process.ensure_alive(),
            Err(EngineError::ProcessEnded { pid: 100 })
        );
    }
}
