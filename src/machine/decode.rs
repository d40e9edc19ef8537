//! Instruction classifier for x86 and x64 code.
//!
//! The stepping engine does not need a full disassembler. It only has to
//! recognize the instruction classes that change how a step is performed
//! (calls, jumps, REP string ops, trap bytes, system calls) and compute the
//! instruction length for the forms it plans to plant a breakpoint after.

/// Longest legal instruction encoding.
pub const MAX_INSTRUCTION_SIZE: usize = 16;

/// Trap byte used for software breakpoints (INT3).
pub const TRAP_OPCODE: u8 = 0xCC;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CpuMode {
    Mode32,
    Mode64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InstructionType {
    /// Could not be classified from the available bytes.
    None,
    Breakpoint,
    Call,
    Jmp,
    Syscall,
    RepString,
    Other,
}

#[derive(Debug, Clone, Copy, Default)]
struct Prefixes {
    address_size: bool, // 67
    operand_size: bool, // 66
    rep_f2: bool,
    rep_f3: bool,
}

/// Scans legacy prefixes (and REX in 64-bit mode); returns the prefix length.
fn read_prefixes(mem: &[u8], mode: CpuMode, prefixes: &mut Prefixes) -> usize {
    for (i, &byte) in mem.iter().enumerate() {
        match byte {
            0x67 => prefixes.address_size = true,
            0x66 => prefixes.operand_size = true,
            0xF0 => {} // lock
            0xF2 => prefixes.rep_f2 = true,
            0xF3 => prefixes.rep_f3 = true,
            0x2E | 0x3E | 0x26 | 0x64 | 0x65 | 0x36 => {} // segment overrides
            0x40..=0x4F if mode == CpuMode::Mode64 => {}  // REX
            _ => return i,
        }
    }
    mem.len()
}

/// ModRM operand size with 16-bit addressing; includes the ModRM byte itself.
fn modrm_size_16(modrm: u8) -> usize {
    let mod_bits = (modrm >> 6) & 3;
    let rm = modrm & 7;
    let mut size = 1;

    // mod == 3 is only for direct register operands
    if mod_bits != 3 {
        if mod_bits == 2 {
            size += 2; // disp16
        } else if mod_bits == 1 {
            size += 1; // disp8
        }
        if mod_bits == 0 && rm == 6 {
            size += 2; // disp16
        }
    }
    size
}

/// ModRM operand size with 32/64-bit addressing; includes the ModRM byte itself.
fn modrm_size_32(modrm: u8) -> usize {
    let mod_bits = (modrm >> 6) & 3;
    let rm = modrm & 7;
    let mut size = 1;

    if mod_bits != 3 {
        if rm == 4 {
            size += 1; // SIB
        }
        if mod_bits == 2 {
            size += 4; // disp32
        } else if mod_bits == 1 {
            size += 1; // disp8
        }
        if mod_bits == 0 && rm == 5 {
            size += 4; // disp32
        }
    }
    size
}

/// Classifies the instruction at the start of `mem` and, for the classes the
/// stepper cares about, computes its total length in bytes.
///
/// Returns `(InstructionType::None, 0)` when the bytes cannot be classified
/// or the instruction extends past the available memory.
pub fn instruction_type_and_size(mem: &[u8], mode: CpuMode) -> (InstructionType, usize) {
    let mem = &mem[..mem.len().min(MAX_INSTRUCTION_SIZE)];
    let mut prefixes = Prefixes::default();
    let prefix_len = read_prefixes(mem, mode, &mut prefixes);

    if prefix_len >= mem.len() {
        return (InstructionType::None, 0);
    }

    let op = &mem[prefix_len..];
    let mut inst_type = InstructionType::Other;
    let mut inst_size = 0usize;

    match op[0] {
        0xCC => {
            inst_size = 1;
            inst_type = InstructionType::Breakpoint;
        }

        // call rel16/rel32
        0xE8 => {
            inst_size = if prefixes.operand_size && mode == CpuMode::Mode32 {
                3
            } else {
                5
            };
            inst_type = InstructionType::Call;
        }

        // call far, 32-bit mode only
        0x9A if mode == CpuMode::Mode32 => {
            inst_size = if prefixes.operand_size { 5 } else { 7 };
            inst_type = InstructionType::Call;
        }

        // call/jmp through ModRM
        0xFF if op.len() >= 2 => {
            let reg_op = (op[1] >> 3) & 7;
            if reg_op == 2 || reg_op == 3 || reg_op == 4 || reg_op == 5 {
                let modrm_size = if mode == CpuMode::Mode64 || !prefixes.address_size {
                    modrm_size_32(op[1])
                } else {
                    modrm_size_16(op[1])
                };
                inst_size = 1 + modrm_size;
                inst_type = if reg_op <= 3 {
                    InstructionType::Call
                } else {
                    InstructionType::Jmp
                };
            }
        }

        // jmp rel8 / rel16 / rel32 / far
        0xEB => {
            inst_size = 2;
            inst_type = InstructionType::Jmp;
        }
        0xE9 => {
            inst_size = if prefixes.operand_size && mode == CpuMode::Mode32 {
                3
            } else {
                5
            };
            inst_type = InstructionType::Jmp;
        }
        0xEA if mode == CpuMode::Mode32 => {
            inst_size = if prefixes.operand_size { 5 } else { 7 };
            inst_type = InstructionType::Jmp;
        }

        // syscall / sysenter
        0x0F if op.len() >= 2 => {
            if op[1] == 0x05 || op[1] == 0x34 {
                inst_size = 2;
                inst_type = InstructionType::Syscall;
            }
        }

        // REP-prefixed string instructions
        opcode if prefixes.rep_f2 => {
            if matches!(opcode, 0xA6 | 0xA7 | 0xAE | 0xAF) {
                inst_size = 1;
                inst_type = InstructionType::RepString;
            }
        }
        opcode if prefixes.rep_f3 => {
            if matches!(opcode, 0x6C..=0x6F | 0xA4..=0xA7 | 0xAA..=0xAF) {
                inst_size = 1;
                inst_type = InstructionType::RepString;
            }
        }

        _ => {}
    }

    if inst_size > 0 {
        inst_size += prefix_len;
    }

    // longer than the readable memory means we can't trust the decode
    if inst_size > mem.len() {
        return (InstructionType::None, 0);
    }

    (inst_type, inst_size)
}
