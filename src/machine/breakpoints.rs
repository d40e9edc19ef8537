//! Software breakpoint store: the address table, trap patching, and the
//! breakpoint-transparent memory paths.
//!
//! A breakpoint is patched into target memory exactly while at least one
//! cookie (high priority for user breakpoints, low priority for internal
//! stepping) is registered at its address. The record itself survives an
//! empty cookie set only while a stepper holds its lock.

use std::collections::BTreeMap;

use log::debug;

use crate::error::Result;
use crate::exec::event::Cookie;
use crate::machine::decode::TRAP_OPCODE;
use crate::port::DebugPort;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BpPriority {
    /// User-visible breakpoints.
    High,
    /// Breakpoints planted by steppers.
    Low,
}

/// One patched (or patchable) address in the debuggee.
#[derive(Debug, Default)]
pub struct Breakpoint {
    orig_byte: u8,
    /// Holding slot used while a caller's write overlaps this address; see
    /// [`BreakpointTable::write_memory`].
    temp_byte: u8,
    patched: bool,
    lock_count: u32,
    hi_cookies: Vec<Cookie>,
    lo_cookies: Vec<Cookie>,
}

impl Breakpoint {
    pub fn is_active(&self) -> bool {
        !self.hi_cookies.is_empty() || !self.lo_cookies.is_empty()
    }

    pub fn is_locked(&self) -> bool {
        self.lock_count > 0
    }

    pub fn is_patched(&self) -> bool {
        self.patched
    }

    pub fn original_byte(&self) -> u8 {
        self.orig_byte
    }

    pub fn high_cookies(&self) -> &[Cookie] {
        &self.hi_cookies
    }

    pub fn low_cookies(&self) -> &[Cookie] {
        &self.lo_cookies
    }

    fn cookies_mut(&mut self, priority: BpPriority) -> &mut Vec<Cookie> {
        match priority {
            BpPriority::High => &mut self.hi_cookies,
            BpPriority::Low => &mut self.lo_cookies,
        }
    }
}

/// Address-keyed table of breakpoints for one process.
#[derive(Debug, Default)]
pub struct BreakpointTable {
    map: BTreeMap<u64, Breakpoint>,
}

impl BreakpointTable {
    pub fn new() -> Self {
        BreakpointTable::default()
    }

    pub fn find(&self, address: u64) -> Option<&Breakpoint> {
        self.map.get(&address)
    }

    pub fn is_active(&self, address: u64) -> bool {
        self.map.get(&address).map_or(false, Breakpoint::is_active)
    }

    /// Registers interest at `address`. The first cookie patches the trap
    /// byte in; on a patch failure the cookie stays registered and the
    /// record is left unpatched, and the error is reported up.
    pub fn set(
        &mut self,
        port: &mut dyn DebugPort,
        pid: u32,
        address: u64,
        cookie: Cookie,
        priority: BpPriority,
    ) -> Result<()> {
        let bp = self.map.entry(address).or_default();
        let was_active = bp.is_active();
        debug_assert!(was_active || bp.is_locked() || !bp.patched);

        bp.cookies_mut(priority).push(cookie);

        // only the transition from inactive to active touches memory; a
        // locked record is mid-restore and gets its trap back on repatch
        if !was_active && !bp.is_locked() {
            patch(port, pid, address, bp)?;
        }
        Ok(())
    }

    /// Removes one cookie. The last cookie unpatches the trap; the record
    /// is freed unless a stepper still holds its lock. Returns whether the
    /// record was freed.
    pub fn remove(
        &mut self,
        port: &mut dyn DebugPort,
        pid: u32,
        address: u64,
        cookie: Cookie,
        priority: BpPriority,
    ) -> Result<bool> {
        let bp = match self.map.get_mut(&address) {
            Some(bp) => bp,
            None => return Ok(false),
        };

        let cookies = bp.cookies_mut(priority);
        match cookies.iter().position(|c| *c == cookie) {
            Some(index) => {
                cookies.remove(index);
            }
            None => return Ok(false),
        }

        if bp.is_active() {
            return Ok(false);
        }

        let unpatch_result = unpatch(port, pid, address, bp);

        let mut freed = false;
        if !bp.is_locked() {
            self.map.remove(&address);
            freed = true;
        }

        unpatch_result.map(|_| freed)
    }

    /// Takes the trap byte out of memory without touching the cookie lists;
    /// used while a thread must execute the original instruction.
    pub fn unpatch_temporarily(
        &mut self,
        port: &mut dyn DebugPort,
        pid: u32,
        address: u64,
    ) -> Result<()> {
        if let Some(bp) = self.map.get_mut(&address) {
            bp.lock_count += 1;
            unpatch(port, pid, address, bp)?;
        }
        Ok(())
    }

    /// Puts a temporarily removed trap byte back and releases the lock. If
    /// every cookie disappeared while the trap was out, the record is freed
    /// instead of repatched.
    pub fn repatch(&mut self, port: &mut dyn DebugPort, pid: u32, address: u64) -> Result<()> {
        let bp = match self.map.get_mut(&address) {
            Some(bp) => bp,
            None => return Ok(()),
        };

        debug_assert!(bp.is_locked());
        bp.lock_count = bp.lock_count.saturating_sub(1);

        if bp.is_active() {
            if !bp.patched {
                patch(port, pid, address, bp)?;
            }
        } else if !bp.is_locked() {
            self.map.remove(&address);
        }
        Ok(())
    }

    /// Breakpoint-transparent read: trap bytes inside the returned range
    /// are replaced with the stored original bytes.
    pub fn read_memory(
        &self,
        port: &mut dyn DebugPort,
        pid: u32,
        address: u64,
        buf: &mut [u8],
    ) -> Result<(usize, usize)> {
        let (read, unreadable) = port.read_memory(pid, address, buf)?;

        if read > 0 {
            let end = address + (read as u64 - 1);
            for (&bp_addr, bp) in self.map.range(address..=end) {
                if bp.patched {
                    buf[(bp_addr - address) as usize] = bp.orig_byte;
                }
            }
        }

        Ok((read, unreadable))
    }

    /// Breakpoint-safe write, done in three steps:
    /// 1. for each patched breakpoint in the range, stash the caller's byte
    ///    in the record's temp slot;
    /// 2. substitute the trap opcode into the outgoing buffer;
    /// 3. after a successful write, commit each stashed byte as the new
    ///    original byte, so a later unpatch restores the caller's content.
    pub fn write_memory(
        &mut self,
        port: &mut dyn DebugPort,
        pid: u32,
        address: u64,
        data: &[u8],
    ) -> Result<usize> {
        if data.is_empty() {
            return Ok(0);
        }

        let mut outgoing = data.to_vec();
        let end = address + (data.len() as u64 - 1);

        for (&bp_addr, bp) in self.map.range_mut(address..=end) {
            if bp.patched {
                let offset = (bp_addr - address) as usize;
                bp.temp_byte = outgoing[offset];
                outgoing[offset] = TRAP_OPCODE;
            }
        }

        let written = port.write_memory(pid, address, &outgoing)?;
        if written == 0 {
            return Ok(0);
        }

        let written_end = address + (written as u64 - 1);
        for (_, bp) in self.map.range_mut(address..=written_end) {
            if bp.patched {
                bp.orig_byte = bp.temp_byte;
            }
        }

        Ok(written)
    }

    /// Restores every patched byte and drops all records. Used when
    /// detaching, where the debuggee keeps running without us.
    pub fn clear_all(&mut self, port: &mut dyn DebugPort, pid: u32) -> Result<()> {
        let mut first_err = None;
        for (&address, bp) in self.map.iter_mut() {
            if let Err(err) = unpatch(port, pid, address, bp) {
                first_err.get_or_insert(err);
            }
        }
        self.map.clear();
        match first_err {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }
}

fn patch(port: &mut dyn DebugPort, pid: u32, address: u64, bp: &mut Breakpoint) -> Result<()> {
    debug_assert!(!bp.patched);

    let mut orig = [0u8; 1];
    port.read_memory(pid, address, &mut orig)?;
    bp.orig_byte = orig[0];

    port.write_memory(pid, address, &[TRAP_OPCODE])?;
    bp.patched = true;

    debug!("patched breakpoint at {:#x} (orig {:#04x})", address, orig[0]);
    Ok(())
}

fn unpatch(port: &mut dyn DebugPort, pid: u32, address: u64, bp: &mut Breakpoint) -> Result<()> {
    if !bp.patched {
        return Ok(());
    }

    port.write_memory(pid, address, &[bp.orig_byte])?;
    bp.patched = false;

    debug!("unpatched breakpoint at {:#x}", address);
    Ok(())
}
