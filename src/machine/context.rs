//! Thread CPU context snapshots and the one-level context cache.
//!
//! A context is fetched and stored in feature-masked groups so callers that
//! only want control registers never pay for the floating point state. The
//! cache holds exactly one context, for the thread most recently reported
//! stopped; it fills lazily and is flushed back to the target before the
//! next continue.

use crate::error::Result;
use crate::port::DebugPort;

/// Target processor architecture, fixed at process creation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CpuArch {
    I386,
    X64,
}

impl CpuArch {
    pub fn pointer_width(&self) -> u32 {
        match self {
            CpuArch::I386 => 32,
            CpuArch::X64 => 64,
        }
    }
}

// Context feature groups. A context buffer carries the union of the groups
// named in its `flags` field; all other fields are unspecified.
pub const CTX_CONTROL: u32 = 0x01; // pc, flags register, sp, bp, cs, ss
pub const CTX_INTEGER: u32 = 0x02; // general purpose registers
pub const CTX_SEGMENTS: u32 = 0x04; // es, ds, fs, gs
pub const CTX_FLOAT: u32 = 0x08; // x87 state
pub const CTX_EXTENDED: u32 = 0x10; // SSE state
pub const CTX_FULL: u32 = CTX_CONTROL | CTX_INTEGER | CTX_SEGMENTS;
pub const CTX_ALL: u32 = CTX_FULL | CTX_FLOAT | CTX_EXTENDED;

/// Trap flag bit in the flags register; drives hardware single-step.
pub const TRACE_FLAG: u32 = 0x100;

// General purpose register slots, in x64 encoding order.
pub const GPR_AX: usize = 0;
pub const GPR_CX: usize = 1;
pub const GPR_DX: usize = 2;
pub const GPR_BX: usize = 3;
pub const GPR_SP: usize = 4;
pub const GPR_BP: usize = 5;
pub const GPR_SI: usize = 6;
pub const GPR_DI: usize = 7;

// Segment register slots.
pub const SEG_ES: usize = 0;
pub const SEG_CS: usize = 1;
pub const SEG_SS: usize = 2;
pub const SEG_DS: usize = 3;
pub const SEG_FS: usize = 4;
pub const SEG_GS: usize = 5;

/// Portable CPU context snapshot. On x86 only the low 32 bits of each
/// general purpose slot and the first eight slots are meaningful.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ThreadContext {
    pub arch: CpuArch,
    /// Which feature groups this buffer actually carries.
    pub flags: u32,
    pub gpr: [u64; 16],
    pub pc: u64,
    pub eflags: u32,
    pub segs: [u16; 6],
    /// x87 state in the first 112 bytes, SSE state in the remainder.
    pub float_area: [u8; 512],
}

impl ThreadContext {
    pub fn empty(arch: CpuArch) -> Self {
        ThreadContext {
            arch,
            flags: 0,
            gpr: [0; 16],
            pc: 0,
            eflags: 0,
            segs: [0; 6],
            float_area: [0; 512],
        }
    }

    pub fn sp(&self) -> u64 {
        self.gpr[GPR_SP]
    }

    pub fn fp(&self) -> u64 {
        self.gpr[GPR_BP]
    }
}

/// Copies the feature groups named by `flags` from `src` into `dst`.
/// Group membership is fixed; partial group copies are never performed.
pub fn copy_context(flags: u32, src: &ThreadContext, dst: &mut ThreadContext) {
    if flags & CTX_CONTROL != 0 {
        dst.pc = src.pc;
        dst.eflags = src.eflags;
        dst.gpr[GPR_SP] = src.gpr[GPR_SP];
        dst.gpr[GPR_BP] = src.gpr[GPR_BP];
        dst.segs[SEG_CS] = src.segs[SEG_CS];
        dst.segs[SEG_SS] = src.segs[SEG_SS];
    }

    if flags & CTX_INTEGER != 0 {
        for slot in 0..16 {
            if slot != GPR_SP && slot != GPR_BP {
                dst.gpr[slot] = src.gpr[slot];
            }
        }
    }

    if flags & CTX_SEGMENTS != 0 {
        dst.segs[SEG_ES] = src.segs[SEG_ES];
        dst.segs[SEG_DS] = src.segs[SEG_DS];
        dst.segs[SEG_FS] = src.segs[SEG_FS];
        dst.segs[SEG_GS] = src.segs[SEG_GS];
    }

    if flags & CTX_FLOAT != 0 {
        let (x87, _) = dst.float_area.split_at_mut(112);
        x87.copy_from_slice(&src.float_area[..112]);
    }

    if flags & CTX_EXTENDED != 0 {
        dst.float_area[112..].copy_from_slice(&src.float_area[112..]);
    }
}

/// One-slot context cache for the currently stopped thread.
#[derive(Debug, Default)]
pub struct ContextCache {
    context: Option<ThreadContext>,
    tid: u32,
}

impl ContextCache {
    pub fn new() -> Self {
        ContextCache::default()
    }

    pub fn is_cached(&self) -> bool {
        self.context.is_some()
    }

    pub fn cached_tid(&self) -> u32 {
        self.tid
    }

    /// Fetches the full context of `tid` from the target and caches it.
    pub fn fill(&mut self, port: &mut dyn DebugPort, tid: u32) -> Result<()> {
        let context = port.get_context(tid, CTX_ALL)?;
        self.context = Some(context);
        self.tid = tid;
        Ok(())
    }

    /// Writes the cached context back to the target and empties the cache.
    /// A no-op when nothing is cached.
    pub fn flush(&mut self, port: &mut dyn DebugPort) -> Result<()> {
        if let Some(context) = self.context.take() {
            let tid = self.tid;
            self.tid = 0;
            port.set_context(tid, &context)?;
        }
        Ok(())
    }

    /// Drops the cached context without writing it back.
    pub fn discard(&mut self) {
        self.context = None;
        self.tid = 0;
    }

    pub fn pc(&self) -> Option<u64> {
        self.context.as_ref().map(|c| c.pc)
    }

    /// Moves the cached PC by `offset` bytes. Used to rewind over a trap
    /// byte or to nudge past an embedded one.
    pub fn change_pc(&mut self, offset: i64) -> bool {
        match self.context.as_mut() {
            Some(context) => {
                context.pc = context.pc.wrapping_add(offset as u64);
                true
            }
            None => false,
        }
    }

    /// Sets or clears the trap flag in the cached flags register.
    pub fn set_single_step(&mut self, enable: bool) -> bool {
        match self.context.as_mut() {
            Some(context) => {
                if enable {
                    context.eflags |= TRACE_FLAG;
                } else {
                    context.eflags &= !TRACE_FLAG;
                }
                true
            }
            None => false,
        }
    }

    pub fn cached(&self) -> Option<&ThreadContext> {
        self.context.as_ref()
    }

    pub fn cached_mut(&mut self) -> Option<&mut ThreadContext> {
        self.context.as_mut()
    }

    /// Feature-masked read that only touches the target for groups not
    /// already cached, merging the rest from the cache.
    pub fn get_merged(
        &self,
        port: &mut dyn DebugPort,
        tid: u32,
        arch: CpuArch,
        requested: u32,
    ) -> Result<ThreadContext> {
        let cache = match self.context.as_ref() {
            Some(c) if tid == self.tid => c,
            _ => return port.get_context(tid, requested),
        };

        let cached_flags = requested & cache.flags;
        let missing_flags = requested & !cache.flags;

        let mut result = if missing_flags != 0 {
            port.get_context(tid, missing_flags)?
        } else {
            ThreadContext::empty(arch)
        };

        if cached_flags != 0 {
            copy_context(cached_flags, cache, &mut result);
        }
        result.flags = requested;

        Ok(result)
    }

    /// Feature-masked write; groups present in the cache are updated there
    /// (flushed later), everything else goes straight to the target.
    pub fn set_merged(
        &mut self,
        port: &mut dyn DebugPort,
        tid: u32,
        context: &ThreadContext,
    ) -> Result<()> {
        let cache = match self.context.as_mut() {
            Some(c) if tid == self.tid => c,
            _ => return port.set_context(tid, context),
        };

        let cached_flags = context.flags & cache.flags;
        let missing_flags = context.flags & !cache.flags;

        if missing_flags != 0 {
            port.set_context(tid, context)?;
        }

        if cached_flags != 0 {
            copy_context(cached_flags, context, cache);
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn control_copy_leaves_integer_registers_alone() {
        let mut src = ThreadContext::empty(CpuArch::X64);
        src.pc = 0x1000;
        src.eflags = 0x246;
        src.gpr[GPR_SP] = 0x7fff_0000;
        src.gpr[GPR_AX] = 0xdead;

        let mut dst = ThreadContext::empty(CpuArch::X64);
        dst.gpr[GPR_AX] = 0xbeef;
        copy_context(CTX_CONTROL, &src, &mut dst);

        assert_eq!(dst.pc, 0x1000);
        assert_eq!(dst.gpr[GPR_SP], 0x7fff_0000);
        assert_eq!(dst.gpr[GPR_AX], 0xbeef);
    }

    #[test]
    fn integer_copy_skips_stack_registers() {
        let mut src = ThreadContext::empty(CpuArch::X64);
        src.gpr = [7; 16];

        let mut dst = ThreadContext::empty(CpuArch::X64);
        dst.gpr[GPR_SP] = 0x100;
        dst.gpr[GPR_BP] = 0x200;
        copy_context(CTX_INTEGER, &src, &mut dst);

        assert_eq!(dst.gpr[GPR_AX], 7);
        assert_eq!(dst.gpr[GPR_SP], 0x100);
        assert_eq!(dst.gpr[GPR_BP], 0x200);
    }

    #[test]
    fn float_and_extended_split_the_save_area() {
        let mut src = ThreadContext::empty(CpuArch::X64);
        src.float_area = [0xAA; 512];

        let mut dst = ThreadContext::empty(CpuArch::X64);
        copy_context(CTX_FLOAT, &src, &mut dst);
        assert_eq!(dst.float_area[111], 0xAA);
        assert_eq!(dst.float_area[112], 0);

        copy_context(CTX_EXTENDED, &src, &mut dst);
        assert_eq!(dst.float_area[511], 0xAA);
    }

    #[test]
    fn trace_flag_toggles() {
        let mut cache = ContextCache::new();
        assert!(!cache.set_single_step(true));

        cache.context = Some(ThreadContext::empty(CpuArch::X64));
        cache.tid = 1;
        assert!(cache.set_single_step(true));
        assert_eq!(cache.cached().unwrap().eflags & TRACE_FLAG, TRACE_FLAG);
        assert!(cache.set_single_step(false));
        assert_eq!(cache.cached().unwrap().eflags & TRACE_FLAG, 0);
    }
}
