//! Per-architecture register and ABI tables.
//!
//! Register ids follow the numbering of the Unicorn bindings so an engine
//! backend built on them can consume the tables unchanged; a different engine
//! is free to remap, since the emulator only ever passes ids through.

use thiserror::Error;

use crate::cpu::RegId;
use crate::loader::{ArchId, OsId};

/// Static description of a guest architecture.
pub struct Arch {
    pub name: &'static str,
    /// Guest word size in bytes.
    pub bsz: u8,
    pub sp: RegId,
    pub pc: RegId,
    /// Registers tracked by the register tracer, in display order.
    pub regs: &'static [(&'static str, RegId)],
    /// Register carrying the syscall number at a trap.
    pub syscall_num: RegId,
    /// Registers carrying syscall arguments, in ABI order.
    pub syscall_args: &'static [RegId],
    /// Register receiving the syscall result.
    pub syscall_ret: RegId,
}

/// The `(arch, OS)` pair has no table.
#[derive(Error, Debug)]
#[error("unsupported architecture/OS pair: {arch}/{os}")]
pub struct ArchUnsupported {
    pub arch: ArchId,
    pub os: OsId,
}

/// Look up the table for an `(arch, OS)` pair.
pub fn lookup(arch: ArchId, os: OsId) -> Result<&'static Arch, ArchUnsupported> {
    #[allow(unreachable_patterns)]
    match (arch, os) {
        (ArchId::X86_64, OsId::Linux) => Ok(&x86_64::ARCH),
        (ArchId::Aarch64, OsId::Linux) => Ok(&aarch64::ARCH),
        _ => Err(ArchUnsupported { arch, os }),
    }
}

pub mod x86_64 {
    use super::{Arch, RegId};

    pub const RAX: RegId = RegId(35);
    pub const RBP: RegId = RegId(36);
    pub const RBX: RegId = RegId(37);
    pub const RCX: RegId = RegId(38);
    pub const RDI: RegId = RegId(39);
    pub const RDX: RegId = RegId(40);
    pub const RIP: RegId = RegId(41);
    pub const RSI: RegId = RegId(43);
    pub const RSP: RegId = RegId(44);
    pub const R8: RegId = RegId(226);
    pub const R9: RegId = RegId(227);
    pub const R10: RegId = RegId(228);
    pub const R11: RegId = RegId(229);
    pub const R12: RegId = RegId(230);
    pub const R13: RegId = RegId(231);
    pub const R14: RegId = RegId(232);
    pub const R15: RegId = RegId(233);

    pub static ARCH: Arch = Arch {
        name: "x86_64",
        bsz: 8,
        sp: RSP,
        pc: RIP,
        regs: &[
            ("rax", RAX),
            ("rbx", RBX),
            ("rcx", RCX),
            ("rdx", RDX),
            ("rsi", RSI),
            ("rdi", RDI),
            ("rbp", RBP),
            ("rsp", RSP),
            ("r8", R8),
            ("r9", R9),
            ("r10", R10),
            ("r11", R11),
            ("r12", R12),
            ("r13", R13),
            ("r14", R14),
            ("r15", R15),
            ("rip", RIP),
        ],
        syscall_num: RAX,
        syscall_args: &[RDI, RSI, RDX, R10, R8, R9],
        syscall_ret: RAX,
    };
}

pub mod aarch64 {
    use super::{Arch, RegId};

    pub const SP: RegId = RegId(4);
    pub const X0: RegId = RegId(199);
    pub const X1: RegId = RegId(200);
    pub const X2: RegId = RegId(201);
    pub const X3: RegId = RegId(202);
    pub const X4: RegId = RegId(203);
    pub const X5: RegId = RegId(204);
    pub const X6: RegId = RegId(205);
    pub const X7: RegId = RegId(206);
    pub const X8: RegId = RegId(207);
    pub const X29: RegId = RegId(1);
    pub const X30: RegId = RegId(2);
    pub const PC: RegId = RegId(260);

    pub static ARCH: Arch = Arch {
        name: "aarch64",
        bsz: 8,
        sp: SP,
        pc: PC,
        regs: &[
            ("x0", X0),
            ("x1", X1),
            ("x2", X2),
            ("x3", X3),
            ("x4", X4),
            ("x5", X5),
            ("x6", X6),
            ("x7", X7),
            ("x8", X8),
            ("x29", X29),
            ("x30", X30),
            ("sp", SP),
            ("pc", PC),
        ],
        syscall_num: X8,
        syscall_args: &[X0, X1, X2, X3, X4, X5],
        syscall_ret: X0,
    };
}
