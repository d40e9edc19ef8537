//! Symbolic register access over a context snapshot.
//!
//! Every register id maps to a descriptor: which storage slot backs it, and
//! for sub-registers, the bit shift and width within the parent. Writes to a
//! sub-register always read-modify-write the parent so sibling bits survive.

use crate::machine::context::{
    CpuArch, ThreadContext, GPR_AX, GPR_BP, GPR_BX, GPR_CX, GPR_DI, GPR_DX, GPR_SI, GPR_SP,
    SEG_CS, SEG_DS, SEG_ES, SEG_FS, SEG_GS, SEG_SS,
};

/// Symbolic register ids understood by the engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Reg {
    // 64-bit general purpose
    Rax, Rcx, Rdx, Rbx, Rsp, Rbp, Rsi, Rdi,
    R8, R9, R10, R11, R12, R13, R14, R15,
    Rip,
    // 32-bit views
    Eax, Ecx, Edx, Ebx, Esp, Ebp, Esi, Edi,
    Eip,
    // 16-bit views
    Ax, Cx, Dx, Bx, Sp, Bp, Si, Di,
    // 8-bit views
    Al, Cl, Dl, Bl, Ah, Ch, Dh, Bh,
    // flags and segments
    Eflags,
    Es, Cs, Ss, Ds, Fs, Gs,
    // x87/SSE ids exist for callers but have no backing in the flat
    // snapshot; reads report "not available"
    St0, Xmm0,
}

/// Where a register's bits live inside a [`ThreadContext`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Store {
    Gpr(usize),
    Pc,
    Flags,
    Seg(usize),
    None,
}

/// Descriptor: backing store plus the bit window of a sub-register.
/// `width == 0` means the full storage slot.
#[derive(Debug, Clone, Copy)]
pub struct RegisterDesc {
    pub store: Store,
    pub shift: u8,
    pub width: u8,
    /// Pointer width the register requires; 32 means valid on both.
    pub min_width: u32,
}

const fn full(store: Store, min_width: u32) -> RegisterDesc {
    RegisterDesc {
        store,
        shift: 0,
        width: 0,
        min_width,
    }
}

const fn sub(store: Store, shift: u8, width: u8) -> RegisterDesc {
    RegisterDesc {
        store,
        shift,
        width,
        min_width: 32,
    }
}

/// Static descriptor table, keyed by register id.
pub fn descriptor(reg: Reg) -> RegisterDesc {
    match reg {
        Reg::Rax => full(Store::Gpr(GPR_AX), 64),
        Reg::Rcx => full(Store::Gpr(GPR_CX), 64),
        Reg::Rdx => full(Store::Gpr(GPR_DX), 64),
        Reg::Rbx => full(Store::Gpr(GPR_BX), 64),
        Reg::Rsp => full(Store::Gpr(GPR_SP), 64),
        Reg::Rbp => full(Store::Gpr(GPR_BP), 64),
        Reg::Rsi => full(Store::Gpr(GPR_SI), 64),
        Reg::Rdi => full(Store::Gpr(GPR_DI), 64),
        Reg::R8 => full(Store::Gpr(8), 64),
        Reg::R9 => full(Store::Gpr(9), 64),
        Reg::R10 => full(Store::Gpr(10), 64),
        Reg::R11 => full(Store::Gpr(11), 64),
        Reg::R12 => full(Store::Gpr(12), 64),
        Reg::R13 => full(Store::Gpr(13), 64),
        Reg::R14 => full(Store::Gpr(14), 64),
        Reg::R15 => full(Store::Gpr(15), 64),
        Reg::Rip => full(Store::Pc, 64),

        Reg::Eax => sub(Store::Gpr(GPR_AX), 0, 32),
        Reg::Ecx => sub(Store::Gpr(GPR_CX), 0, 32),
        Reg::Edx => sub(Store::Gpr(GPR_DX), 0, 32),
        Reg::Ebx => sub(Store::Gpr(GPR_BX), 0, 32),
        Reg::Esp => sub(Store::Gpr(GPR_SP), 0, 32),
        Reg::Ebp => sub(Store::Gpr(GPR_BP), 0, 32),
        Reg::Esi => sub(Store::Gpr(GPR_SI), 0, 32),
        Reg::Edi => sub(Store::Gpr(GPR_DI), 0, 32),
        Reg::Eip => sub(Store::Pc, 0, 32),

        Reg::Ax => sub(Store::Gpr(GPR_AX), 0, 16),
        Reg::Cx => sub(Store::Gpr(GPR_CX), 0, 16),
        Reg::Dx => sub(Store::Gpr(GPR_DX), 0, 16),
        Reg::Bx => sub(Store::Gpr(GPR_BX), 0, 16),
        Reg::Sp => sub(Store::Gpr(GPR_SP), 0, 16),
        Reg::Bp => sub(Store::Gpr(GPR_BP), 0, 16),
        Reg::Si => sub(Store::Gpr(GPR_SI), 0, 16),
        Reg::Di => sub(Store::Gpr(GPR_DI), 0, 16),

        Reg::Al => sub(Store::Gpr(GPR_AX), 0, 8),
        Reg::Cl => sub(Store::Gpr(GPR_CX), 0, 8),
        Reg::Dl => sub(Store::Gpr(GPR_DX), 0, 8),
        Reg::Bl => sub(Store::Gpr(GPR_BX), 0, 8),
        Reg::Ah => sub(Store::Gpr(GPR_AX), 8, 8),
        Reg::Ch => sub(Store::Gpr(GPR_CX), 8, 8),
        Reg::Dh => sub(Store::Gpr(GPR_DX), 8, 8),
        Reg::Bh => sub(Store::Gpr(GPR_BX), 8, 8),

        Reg::Eflags => full(Store::Flags, 32),
        Reg::Es => full(Store::Seg(SEG_ES), 32),
        Reg::Cs => full(Store::Seg(SEG_CS), 32),
        Reg::Ss => full(Store::Seg(SEG_SS), 32),
        Reg::Ds => full(Store::Seg(SEG_DS), 32),
        Reg::Fs => full(Store::Seg(SEG_FS), 32),
        Reg::Gs => full(Store::Seg(SEG_GS), 32),

        Reg::St0 | Reg::Xmm0 => full(Store::None, 32),
    }
}

/// Result of a symbolic read. A register with no backing storage reports
/// `Unavailable`; the carried value is zero in that case.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegisterValue {
    Available(u64),
    Unavailable,
}

impl RegisterValue {
    pub fn value(&self) -> u64 {
        match self {
            RegisterValue::Available(v) => *v,
            RegisterValue::Unavailable => 0,
        }
    }
}

fn sub_mask(desc: &RegisterDesc) -> u64 {
    debug_assert!(desc.width > 0 && desc.width < 64);
    ((1u64 << desc.width) - 1) << desc.shift
}

fn read_store(context: &ThreadContext, store: Store) -> Option<u64> {
    match store {
        Store::Gpr(slot) => Some(context.gpr[slot]),
        Store::Pc => Some(context.pc),
        Store::Flags => Some(context.eflags as u64),
        Store::Seg(slot) => Some(context.segs[slot] as u64),
        Store::None => None,
    }
}

fn write_store(context: &mut ThreadContext, store: Store, value: u64) -> bool {
    match store {
        Store::Gpr(slot) => context.gpr[slot] = value,
        Store::Pc => context.pc = value,
        Store::Flags => context.eflags = value as u32,
        Store::Seg(slot) => context.segs[slot] = value as u16,
        Store::None => return false,
    }
    true
}

/// Register view over one context snapshot.
#[derive(Debug, Clone)]
pub struct RegisterSet {
    context: ThreadContext,
}

impl RegisterSet {
    pub fn new(context: ThreadContext) -> Self {
        RegisterSet { context }
    }

    pub fn context(&self) -> &ThreadContext {
        &self.context
    }

    pub fn into_context(self) -> ThreadContext {
        self.context
    }

    pub fn arch(&self) -> CpuArch {
        self.context.arch
    }

    pub fn get_value(&self, reg: Reg) -> RegisterValue {
        let desc = descriptor(reg);
        if desc.min_width > self.context.arch.pointer_width() {
            return RegisterValue::Unavailable;
        }

        let parent = match read_store(&self.context, desc.store) {
            Some(v) => v,
            None => return RegisterValue::Unavailable,
        };

        if desc.width == 0 {
            RegisterValue::Available(parent)
        } else {
            let mask = sub_mask(&desc);
            RegisterValue::Available((parent & mask) >> desc.shift)
        }
    }

    /// Writes a register; sub-registers merge into the parent without
    /// touching the sibling bits. Returns false for unbacked registers.
    pub fn set_value(&mut self, reg: Reg, value: u64) -> bool {
        let desc = descriptor(reg);
        if desc.min_width > self.context.arch.pointer_width() {
            return false;
        }

        if desc.width == 0 {
            return write_store(&mut self.context, desc.store, value);
        }

        let parent = match read_store(&self.context, desc.store) {
            Some(v) => v,
            None => return false,
        };
        let mask = sub_mask(&desc);
        let merged = (parent & !mask) | ((value << desc.shift) & mask);
        write_store(&mut self.context, desc.store, merged)
    }

    pub fn pc(&self) -> u64 {
        self.context.pc
    }

    pub fn sp(&self) -> u64 {
        self.context.sp()
    }

    pub fn fp(&self) -> u64 {
        self.context.fp()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn x64_set() -> RegisterSet {
        let mut context = ThreadContext::empty(CpuArch::X64);
        context.gpr[GPR_AX] = 0x1122_3344_5566_7788;
        RegisterSet::new(context)
    }

    #[test]
    fn sub_register_reads_slice_the_parent() {
        let regs = x64_set();
        assert_eq!(regs.get_value(Reg::Rax), RegisterValue::Available(0x1122_3344_5566_7788));
        assert_eq!(regs.get_value(Reg::Eax), RegisterValue::Available(0x5566_7788));
        assert_eq!(regs.get_value(Reg::Ax), RegisterValue::Available(0x7788));
        assert_eq!(regs.get_value(Reg::Al), RegisterValue::Available(0x88));
        assert_eq!(regs.get_value(Reg::Ah), RegisterValue::Available(0x77));
    }

    #[test]
    fn sub_register_write_preserves_sibling_bits() {
        let mut regs = x64_set();
        assert!(regs.set_value(Reg::Ah, 0xEE));
        assert_eq!(regs.get_value(Reg::Rax), RegisterValue::Available(0x1122_3344_5566_EE88));

        assert!(regs.set_value(Reg::Ax, 0x1234));
        assert_eq!(regs.get_value(Reg::Rax), RegisterValue::Available(0x1122_3344_5566_1234));
    }

    #[test]
    fn unbacked_register_is_unavailable_and_zeroed() {
        let regs = x64_set();
        let value = regs.get_value(Reg::St0);
        assert_eq!(value, RegisterValue::Unavailable);
        assert_eq!(value.value(), 0);
    }

    #[test]
    fn wide_registers_unavailable_on_x86() {
        let mut context = ThreadContext::empty(CpuArch::I386);
        context.gpr[GPR_AX] = 0xCAFE;
        let regs = RegisterSet::new(context);
        assert_eq!(regs.get_value(Reg::Rax), RegisterValue::Unavailable);
        assert_eq!(regs.get_value(Reg::Eax), RegisterValue::Available(0xCAFE));
    }
}
