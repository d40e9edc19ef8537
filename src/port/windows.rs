//! Win32 debug port.
//!
//! Wraps the Debug API event pump (WaitForDebugEvent / ContinueDebugEvent)
//! and the memory, context, and thread-control calls behind [`DebugPort`].
//! Debuggee processes must be driven from the thread that launched or
//! attached them; the engine enforces that above this layer.

use std::collections::HashMap;
use std::ffi::c_void;

use log::warn;

use windows::core::PWSTR;
use windows::Win32::Foundation::{
    CloseHandle, GetLastError, BOOL, ERROR_ACCESS_DENIED, ERROR_PARTIAL_COPY, ERROR_SEM_TIMEOUT,
    HANDLE, NTSTATUS, WAIT_TIMEOUT,
};
use windows::Win32::System::Diagnostics::Debug::{
    ContinueDebugEvent, DebugActiveProcess, DebugActiveProcessStop, DebugBreakProcess,
    GetThreadContext, ReadProcessMemory, SetThreadContext, WaitForDebugEvent, WriteProcessMemory,
    CONTEXT, CONTEXT_ALL_AMD64, CONTEXT_CONTROL_AMD64, CONTEXT_FLOATING_POINT_AMD64,
    CONTEXT_INTEGER_AMD64, CONTEXT_SEGMENTS_AMD64, CREATE_PROCESS_DEBUG_EVENT,
    CREATE_THREAD_DEBUG_EVENT, DEBUG_EVENT, EXCEPTION_DEBUG_EVENT, EXIT_PROCESS_DEBUG_EVENT,
    EXIT_THREAD_DEBUG_EVENT, LOAD_DLL_DEBUG_EVENT, OUTPUT_DEBUG_STRING_EVENT,
    UNLOAD_DLL_DEBUG_EVENT,
};
use windows::Win32::System::Memory::{
    VirtualQueryEx, MEMORY_BASIC_INFORMATION, MEM_COMMIT, PAGE_GUARD, PAGE_NOACCESS,
};
use windows::Win32::System::Threading::{
    CreateProcessW, GetProcessId, IsWow64Process, QueryFullProcessImageNameW, ResumeThread,
    SuspendThread, TerminateProcess, CREATE_SUSPENDED, DEBUG_ONLY_THIS_PROCESS,
    PROCESS_INFORMATION, PROCESS_NAME_WIN32, STARTUPINFOW,
};

use crate::error::{EngineError, Result};
use crate::exec::event::ExceptionRecord;
use crate::machine::context::{
    CpuArch, ThreadContext, CTX_CONTROL, CTX_EXTENDED, CTX_FLOAT, CTX_INTEGER, CTX_SEGMENTS,
    GPR_AX, GPR_BP, GPR_BX, GPR_CX, GPR_DI, GPR_DX, GPR_SI, GPR_SP, SEG_CS, SEG_DS, SEG_ES,
    SEG_FS, SEG_GS, SEG_SS,
};
use crate::port::{DebugPort, LaunchInfo, LaunchedProcess, PortEvent, PortPayload, RawHandle};

const DBG_CONTINUE: NTSTATUS = NTSTATUS(0x0001_0002);
const DBG_EXCEPTION_NOT_HANDLED: NTSTATUS = NTSTATUS(0x8001_0001u32 as i32);

/// Win32-backed implementation of [`DebugPort`].
pub struct WindowsPort {
    processes: HashMap<u32, HANDLE>,
    threads: HashMap<u32, HANDLE>,
}

impl Default for WindowsPort {
    fn default() -> Self {
        WindowsPort::new()
    }
}

impl WindowsPort {
    pub fn new() -> Self {
        WindowsPort {
            processes: HashMap::new(),
            threads: HashMap::new(),
        }
    }

    fn process_handle(&self, pid: u32) -> Result<HANDLE> {
        self.processes
            .get(&pid)
            .copied()
            .ok_or(EngineError::ProcessNotFound { pid })
    }

    fn thread_handle(&self, tid: u32) -> Result<HANDLE> {
        self.threads
            .get(&tid)
            .copied()
            .ok_or(EngineError::ThreadNotFound { tid })
    }

    fn translate_event(&mut self, event: &DEBUG_EVENT) -> PortEvent {
        let pid = event.dwProcessId;
        let tid = event.dwThreadId;

        let payload = unsafe {
            match event.dwDebugEventCode {
                CREATE_PROCESS_DEBUG_EVENT => {
                    let info = &event.u.CreateProcessInfo;
                    self.processes.insert(pid, info.hProcess);
                    self.threads.insert(tid, info.hThread);
                    PortPayload::CreateProcess {
                        process_handle: info.hProcess.0 as RawHandle,
                        thread_handle: info.hThread.0 as RawHandle,
                        image_file: nonzero_handle(info.hFile),
                        image_base: info.lpBaseOfImage as u64,
                        image_size: 0,
                        entry_point: info.lpStartAddress.map_or(0, |f| f as u64),
                        start_address: info.lpStartAddress.map_or(0, |f| f as u64),
                        teb_base: info.lpThreadLocalBase as u64,
                        image_path: process_image_path(info.hProcess),
                        arch: process_arch(info.hProcess),
                    }
                }
                CREATE_THREAD_DEBUG_EVENT => {
                    let info = &event.u.CreateThread;
                    self.threads.insert(tid, info.hThread);
                    PortPayload::CreateThread {
                        thread_handle: info.hThread.0 as RawHandle,
                        start_address: info.lpStartAddress.map_or(0, |f| f as u64),
                        teb_base: info.lpThreadLocalBase as u64,
                    }
                }
                EXIT_THREAD_DEBUG_EVENT => {
                    self.threads.remove(&tid);
                    PortPayload::ExitThread {
                        exit_code: event.u.ExitThread.dwExitCode,
                    }
                }
                EXIT_PROCESS_DEBUG_EVENT => {
                    self.processes.remove(&pid);
                    PortPayload::ExitProcess {
                        exit_code: event.u.ExitProcess.dwExitCode,
                    }
                }
                LOAD_DLL_DEBUG_EVENT => {
                    let info = &event.u.LoadDll;
                    let path = self
                        .process_handle(pid)
                        .ok()
                        .map(|h| remote_image_name(h, info.lpImageName as u64, info.fUnicode != 0))
                        .unwrap_or_default();
                    PortPayload::LoadModule {
                        image_file: nonzero_handle(info.hFile),
                        image_base: info.lpBaseOfDll as u64,
                        image_size: 0,
                        image_path: path,
                        debug_info_offset: info.dwDebugInfoFileOffset,
                        debug_info_size: info.nDebugInfoSize,
                    }
                }
                UNLOAD_DLL_DEBUG_EVENT => PortPayload::UnloadModule {
                    image_base: event.u.UnloadDll.lpBaseOfDll as u64,
                },
                OUTPUT_DEBUG_STRING_EVENT => {
                    let info = &event.u.DebugString;
                    PortPayload::OutputString {
                        address: info.lpDebugStringData.0 as u64,
                        char_count: info.nDebugStringLength as u32,
                        wide: info.fUnicode != 0,
                    }
                }
                EXCEPTION_DEBUG_EVENT => {
                    let info = &event.u.Exception;
                    let raw = &info.ExceptionRecord;
                    let count = (raw.NumberParameters as usize).min(raw.ExceptionInformation.len());
                    PortPayload::Exception {
                        first_chance: info.dwFirstChance != 0,
                        record: ExceptionRecord {
                            code: raw.ExceptionCode.0 as u32,
                            flags: raw.ExceptionFlags,
                            address: raw.ExceptionAddress as u64,
                            params: raw.ExceptionInformation[..count]
                                .iter()
                                .map(|&p| p as u64)
                                .collect(),
                        },
                    }
                }
                _ => PortPayload::Unknown,
            }
        };

        PortEvent { pid, tid, payload }
    }
}

impl DebugPort for WindowsPort {
    fn launch(&mut self, info: &LaunchInfo) -> Result<LaunchedProcess> {
        let mut command_line: Vec<u16> = if info.command_line.is_empty() {
            format!("\"{}\"", info.exe_path)
        } else {
            info.command_line.clone()
        }
        .encode_utf16()
        .chain(std::iter::once(0))
        .collect();

        let mut flags = DEBUG_ONLY_THIS_PROCESS;
        if info.suspend_initial_thread {
            flags |= CREATE_SUSPENDED;
        }

        let startup = STARTUPINFOW {
            cb: std::mem::size_of::<STARTUPINFOW>() as u32,
            ..Default::default()
        };
        let mut process_info = PROCESS_INFORMATION::default();

        let working_dir: Vec<u16>;
        let working_dir_ptr = if info.working_dir.is_empty() {
            PWSTR::null()
        } else {
            working_dir = info
                .working_dir
                .encode_utf16()
                .chain(std::iter::once(0))
                .collect();
            PWSTR(working_dir.as_ptr() as *mut u16)
        };

        unsafe {
            CreateProcessW(
                None,
                PWSTR(command_line.as_mut_ptr()),
                None,
                None,
                BOOL(0),
                flags,
                None,
                working_dir_ptr,
                &startup,
                &mut process_info,
            )
        }
        .map_err(|err| EngineError::LaunchFailed {
            path: info.exe_path.clone(),
            reason: err.to_string(),
        })?;

        let pid = process_info.dwProcessId;
        self.processes.insert(pid, process_info.hProcess);
        self.threads.insert(process_info.dwThreadId, process_info.hThread);

        Ok(LaunchedProcess {
            pid,
            process_handle: process_info.hProcess.0 as RawHandle,
        })
    }

    fn attach(&mut self, pid: u32) -> Result<LaunchedProcess> {
        unsafe { DebugActiveProcess(pid) }.map_err(|err| EngineError::AttachFailed {
            pid,
            reason: err.to_string(),
        })?;
        // the real handle arrives with the create-process event
        Ok(LaunchedProcess {
            pid,
            process_handle: 0,
        })
    }

    fn wait_event(&mut self, timeout_ms: u32) -> Result<Option<PortEvent>> {
        let mut event = DEBUG_EVENT::default();
        match unsafe { WaitForDebugEvent(&mut event, timeout_ms) } {
            Ok(()) => Ok(Some(self.translate_event(&event))),
            Err(err)
                if err.code() == ERROR_SEM_TIMEOUT.to_hresult()
                    || err.code() == WAIT_TIMEOUT.to_hresult() =>
            {
                Ok(None)
            }
            Err(err) => Err(port_error(err)),
        }
    }

    fn continue_event(&mut self, pid: u32, tid: u32, handled: bool) -> Result<()> {
        let status = if handled {
            DBG_CONTINUE
        } else {
            DBG_EXCEPTION_NOT_HANDLED
        };
        unsafe { ContinueDebugEvent(pid, tid, status.0 as u32) }.map_err(port_error)
    }

    fn terminate(&mut self, pid: u32) -> Result<()> {
        let handle = self.process_handle(pid)?;
        unsafe { TerminateProcess(handle, 1) }.map_err(port_error)
    }

    fn detach(&mut self, pid: u32) -> Result<()> {
        self.processes.remove(&pid);
        unsafe { DebugActiveProcessStop(pid) }.map_err(port_error)
    }

    fn break_into(&mut self, pid: u32) -> Result<()> {
        let handle = self.process_handle(pid)?;
        unsafe { DebugBreakProcess(handle) }.map_err(port_error)
    }

    fn read_memory(&mut self, pid: u32, address: u64, buf: &mut [u8]) -> Result<(usize, usize)> {
        let handle = self.process_handle(pid)?;
        let mut read = 0usize;
        let result = unsafe {
            ReadProcessMemory(
                handle,
                address as *const c_void,
                buf.as_mut_ptr() as *mut c_void,
                buf.len(),
                Some(&mut read),
            )
        };

        match result {
            Ok(()) => Ok((read, 0)),
            Err(err) if err.code() == ERROR_PARTIAL_COPY.to_hresult() => {
                let unreadable = unreadable_run(handle, address + read as u64, buf.len() - read);
                Ok((read, unreadable))
            }
            Err(err) => Err(EngineError::MemoryAccess {
                address,
                reason: err.to_string(),
            }),
        }
    }

    fn write_memory(&mut self, pid: u32, address: u64, data: &[u8]) -> Result<usize> {
        let handle = self.process_handle(pid)?;
        let mut written = 0usize;
        unsafe {
            WriteProcessMemory(
                handle,
                address as *const c_void,
                data.as_ptr() as *const c_void,
                data.len(),
                Some(&mut written),
            )
        }
        .map_err(|err| EngineError::MemoryAccess {
            address,
            reason: err.to_string(),
        })?;
        Ok(written)
    }

    fn get_context(&mut self, tid: u32, flags: u32) -> Result<ThreadContext> {
        let handle = self.thread_handle(tid)?;
        let mut raw = CONTEXT {
            ContextFlags: to_native_flags(flags),
            ..Default::default()
        };
        unsafe { GetThreadContext(handle, &mut raw) }.map_err(port_error)?;
        Ok(from_native(&raw, flags))
    }

    fn set_context(&mut self, tid: u32, context: &ThreadContext) -> Result<()> {
        let handle = self.thread_handle(tid)?;
        // read-modify-write so unmentioned groups survive
        let mut raw = CONTEXT {
            ContextFlags: CONTEXT_ALL_AMD64,
            ..Default::default()
        };
        unsafe { GetThreadContext(handle, &mut raw) }.map_err(port_error)?;
        to_native(context, &mut raw);
        raw.ContextFlags = to_native_flags(context.flags);
        unsafe { SetThreadContext(handle, &raw) }.map_err(port_error)
    }

    fn suspend_thread(&mut self, handle: RawHandle) -> Result<()> {
        let count = unsafe { SuspendThread(HANDLE(handle as isize)) };
        if count == u32::MAX {
            return Err(last_thread_error());
        }
        Ok(())
    }

    fn resume_thread(&mut self, handle: RawHandle) -> Result<()> {
        let count = unsafe { ResumeThread(HANDLE(handle as isize)) };
        if count == u32::MAX {
            return Err(last_thread_error());
        }
        Ok(())
    }

    fn close_handle(&mut self, handle: RawHandle) -> Result<()> {
        unsafe { CloseHandle(HANDLE(handle as isize)) }.map_err(port_error)
    }
}

fn port_error(err: windows::core::Error) -> EngineError {
    EngineError::Port {
        reason: err.to_string(),
    }
}

fn last_thread_error() -> EngineError {
    let err = unsafe { GetLastError() };
    if err == ERROR_ACCESS_DENIED {
        EngineError::AccessDenied
    } else {
        EngineError::Port {
            reason: format!("thread control failed: {:?}", err),
        }
    }
}

fn nonzero_handle(handle: HANDLE) -> Option<RawHandle> {
    if handle.is_invalid() || handle.0 == 0 {
        None
    } else {
        Some(handle.0 as RawHandle)
    }
}

fn process_image_path(process: HANDLE) -> String {
    let mut buf = [0u16; 1024];
    let mut len = buf.len() as u32;
    let result = unsafe {
        QueryFullProcessImageNameW(
            process,
            PROCESS_NAME_WIN32,
            PWSTR(buf.as_mut_ptr()),
            &mut len,
        )
    };
    match result {
        Ok(()) => String::from_utf16_lossy(&buf[..len as usize]),
        Err(err) => {
            warn!("image path query failed: {}", err);
            String::new()
        }
    }
}

fn process_arch(process: HANDLE) -> CpuArch {
    let mut wow64 = BOOL(0);
    if unsafe { IsWow64Process(process, &mut wow64) }.is_ok() && wow64.as_bool() {
        CpuArch::I386
    } else {
        CpuArch::X64
    }
}

/// Reads the module path out of the debuggee: `pointer` is the remote
/// address of a pointer to the (possibly wide) string.
fn remote_image_name(process: HANDLE, pointer: u64, wide: bool) -> String {
    if pointer == 0 {
        return String::new();
    }

    let mut remote_str: u64 = 0;
    let mut read = 0usize;
    let ok = unsafe {
        ReadProcessMemory(
            process,
            pointer as *const c_void,
            &mut remote_str as *mut u64 as *mut c_void,
            std::mem::size_of::<u64>(),
            Some(&mut read),
        )
    };
    if ok.is_err() || remote_str == 0 {
        return String::new();
    }

    let mut buf = [0u8; 1024];
    let mut read = 0usize;
    let ok = unsafe {
        ReadProcessMemory(
            process,
            remote_str as *const c_void,
            buf.as_mut_ptr() as *mut c_void,
            buf.len(),
            Some(&mut read),
        )
    };
    if ok.is_err() && read == 0 {
        return String::new();
    }

    if wide {
        let units: Vec<u16> = buf[..read]
            .chunks_exact(2)
            .map(|pair| u16::from_le_bytes([pair[0], pair[1]]))
            .take_while(|&u| u != 0)
            .collect();
        String::from_utf16_lossy(&units)
    } else {
        String::from_utf8_lossy(&buf[..read])
            .trim_end_matches('\0')
            .to_string()
    }
}

/// Length of the unreadable stretch starting at `address`, capped at
/// `max`, from the page map.
fn unreadable_run(process: HANDLE, address: u64, max: usize) -> usize {
    let mut info = MEMORY_BASIC_INFORMATION::default();
    let got = unsafe {
        VirtualQueryEx(
            process,
            Some(address as *const c_void),
            &mut info,
            std::mem::size_of::<MEMORY_BASIC_INFORMATION>(),
        )
    };
    if got == 0 {
        return max;
    }

    let readable = info.State == MEM_COMMIT
        && info.Protect & PAGE_NOACCESS == windows::Win32::System::Memory::PAGE_PROTECTION_FLAGS(0)
        && info.Protect & PAGE_GUARD == windows::Win32::System::Memory::PAGE_PROTECTION_FLAGS(0);
    if readable {
        return 0;
    }

    let region_end = info.BaseAddress as u64 + info.RegionSize as u64;
    max.min((region_end - address) as usize)
}

fn to_native_flags(flags: u32) -> windows::Win32::System::Diagnostics::Debug::CONTEXT_FLAGS {
    let mut native = windows::Win32::System::Diagnostics::Debug::CONTEXT_FLAGS(0);
    if flags & CTX_CONTROL != 0 {
        native |= CONTEXT_CONTROL_AMD64;
    }
    if flags & CTX_INTEGER != 0 {
        native |= CONTEXT_INTEGER_AMD64;
    }
    if flags & CTX_SEGMENTS != 0 {
        native |= CONTEXT_SEGMENTS_AMD64;
    }
    if flags & (CTX_FLOAT | CTX_EXTENDED) != 0 {
        native |= CONTEXT_FLOATING_POINT_AMD64;
    }
    native
}

fn from_native(raw: &CONTEXT, flags: u32) -> ThreadContext {
    let mut ctx = ThreadContext::empty(CpuArch::X64);
    ctx.flags = flags;

    ctx.pc = raw.Rip;
    ctx.eflags = raw.EFlags;
    ctx.gpr[GPR_AX] = raw.Rax;
    ctx.gpr[GPR_CX] = raw.Rcx;
    ctx.gpr[GPR_DX] = raw.Rdx;
    ctx.gpr[GPR_BX] = raw.Rbx;
    ctx.gpr[GPR_SP] = raw.Rsp;
    ctx.gpr[GPR_BP] = raw.Rbp;
    ctx.gpr[GPR_SI] = raw.Rsi;
    ctx.gpr[GPR_DI] = raw.Rdi;
    ctx.gpr[8] = raw.R8;
    ctx.gpr[9] = raw.R9;
    ctx.gpr[10] = raw.R10;
    ctx.gpr[11] = raw.R11;
    ctx.gpr[12] = raw.R12;
    ctx.gpr[13] = raw.R13;
    ctx.gpr[14] = raw.R14;
    ctx.gpr[15] = raw.R15;
    ctx.segs[SEG_ES] = raw.SegEs;
    ctx.segs[SEG_CS] = raw.SegCs;
    ctx.segs[SEG_SS] = raw.SegSs;
    ctx.segs[SEG_DS] = raw.SegDs;
    ctx.segs[SEG_FS] = raw.SegFs;
    ctx.segs[SEG_GS] = raw.SegGs;

    let float = unsafe {
        std::slice::from_raw_parts(
            &raw.Anonymous as *const _ as *const u8,
            ctx.float_area.len().min(512),
        )
    };
    ctx.float_area[..float.len()].copy_from_slice(float);

    ctx
}

fn to_native(ctx: &ThreadContext, raw: &mut CONTEXT) {
    if ctx.flags & CTX_CONTROL != 0 {
        raw.Rip = ctx.pc;
        raw.EFlags = ctx.eflags;
        raw.Rsp = ctx.gpr[GPR_SP];
        raw.Rbp = ctx.gpr[GPR_BP];
        raw.SegCs = ctx.segs[SEG_CS];
        raw.SegSs = ctx.segs[SEG_SS];
    }
    if ctx.flags & CTX_INTEGER != 0 {
        raw.Rax = ctx.gpr[GPR_AX];
        raw.Rcx = ctx.gpr[GPR_CX];
        raw.Rdx = ctx.gpr[GPR_DX];
        raw.Rbx = ctx.gpr[GPR_BX];
        raw.Rsi = ctx.gpr[GPR_SI];
        raw.Rdi = ctx.gpr[GPR_DI];
        raw.R8 = ctx.gpr[8];
        raw.R9 = ctx.gpr[9];
        raw.R10 = ctx.gpr[10];
        raw.R11 = ctx.gpr[11];
        raw.R12 = ctx.gpr[12];
        raw.R13 = ctx.gpr[13];
        raw.R14 = ctx.gpr[14];
        raw.R15 = ctx.gpr[15];
    }
    if ctx.flags & CTX_SEGMENTS != 0 {
        raw.SegEs = ctx.segs[SEG_ES];
        raw.SegDs = ctx.segs[SEG_DS];
        raw.SegFs = ctx.segs[SEG_FS];
        raw.SegGs = ctx.segs[SEG_GS];
    }
    if ctx.flags & (CTX_FLOAT | CTX_EXTENDED) != 0 {
        let float = unsafe {
            std::slice::from_raw_parts_mut(
                &mut raw.Anonymous as *mut _ as *mut u8,
                ctx.float_area.len().min(512),
            )
        };
        float.copy_from_slice(&ctx.float_area[..float.len()]);
    }
}
