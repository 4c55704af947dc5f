//! The CPU-engine interface the emulator consumes.
//!
//! An engine executes guest instructions, owns guest memory and registers,
//! and raises events while running. The emulator registers the event kinds it
//! wants with [`Cpu::hook_add`] and passes an [`EventSink`] to [`Cpu::start`];
//! the engine calls back into the sink synchronously, handing it a mutable
//! borrow of itself so hooks can read registers, touch memory, or stop the
//! run. Events are delivered in instruction retirement order.

use bitflags::bitflags;
use thiserror::Error;

/// Identifier of a guest register, in the engine's own numbering.
///
/// The per-architecture tables in [`crate::arch`] provide the well-known ids.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RegId(pub u16);

/// Guest byte order, as reported by a binary loader.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Endian {
    Little,
    Big,
}

bitflags! {
    /// Event kinds an engine can deliver during a run.
    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    pub struct HookKinds: u32 {
        /// Entry into a basic block.
        const BLOCK = 1 << 0;
        /// Every executed instruction.
        const CODE = 1 << 1;
        /// A successful memory read.
        const MEM_READ = 1 << 2;
        /// A successful memory write.
        const MEM_WRITE = 1 << 3;
        /// A read from unmapped or protected memory.
        const MEM_READ_INVALID = 1 << 4;
        /// A write to unmapped or protected memory.
        const MEM_WRITE_INVALID = 1 << 5;
        /// An instruction fetch from unmapped or protected memory.
        const MEM_FETCH_INVALID = 1 << 6;
        /// A trapping instruction (software interrupt, syscall, ...).
        const INTR = 1 << 7;

        const MEM_VALID = Self::MEM_READ.bits() | Self::MEM_WRITE.bits();
        const MEM_INVALID = Self::MEM_READ_INVALID.bits()
            | Self::MEM_WRITE_INVALID.bits()
            | Self::MEM_FETCH_INVALID.bits();
    }
}

/// Kind of a memory access reported through the sink.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MemAccess {
    Read,
    Write,
    ReadInvalid,
    WriteInvalid,
    FetchInvalid,
}

impl MemAccess {
    /// The hook kind an engine checks before delivering this access.
    #[must_use]
    pub fn hook_kind(self) -> HookKinds {
        match self {
            MemAccess::Read => HookKinds::MEM_READ,
            MemAccess::Write => HookKinds::MEM_WRITE,
            MemAccess::ReadInvalid => HookKinds::MEM_READ_INVALID,
            MemAccess::WriteInvalid => HookKinds::MEM_WRITE_INVALID,
            MemAccess::FetchInvalid => HookKinds::MEM_FETCH_INVALID,
        }
    }
}

/// Errors raised by an engine.
#[non_exhaustive]
#[derive(Error, Debug)]
pub enum CpuError {
    #[error("cannot map {size:#x} bytes at {addr:#x}")]
    Map { addr: u64, size: u64 },
    #[error("cannot write {size:#x} bytes at {addr:#x}")]
    Write { addr: u64, size: u64 },
    #[error("cannot read {size:#x} bytes at {addr:#x}")]
    Read { addr: u64, size: u64 },
    #[error("unknown register {0:?}")]
    Reg(RegId),
    #[error("invalid memory access at {addr:#x}")]
    InvalidMemory { addr: u64 },
    #[error("engine error: {0}")]
    Engine(String),
}

/// A CPU engine.
///
/// Everything here is synchronous and single-threaded: [`Cpu::start`] drives
/// the guest on the caller's thread and only returns when the engine stops,
/// faults, or reaches `until`.
pub trait Cpu {
    /// Page granularity of the engine's memory mappings.
    fn page_size(&self) -> u64;

    /// Commit a guest range. `addr` and `size` must be page-aligned.
    fn mem_map(&mut self, addr: u64, size: u64) -> Result<(), CpuError>;

    /// Write bytes into mapped guest memory.
    fn mem_write(&mut self, addr: u64, data: &[u8]) -> Result<(), CpuError>;

    /// Fill `buf` from mapped guest memory at `addr`.
    fn mem_read_into(&mut self, buf: &mut [u8], addr: u64) -> Result<(), CpuError>;

    fn reg_read(&mut self, reg: RegId) -> Result<u64, CpuError>;

    fn reg_write(&mut self, reg: RegId, value: u64) -> Result<(), CpuError>;

    /// Register event kinds to deliver during subsequent runs.
    fn hook_add(&mut self, kinds: HookKinds) -> Result<(), CpuError>;

    /// Execute from `begin` until [`Cpu::stop`] is called, a fault occurs, or
    /// the program counter reaches `until`. Registered events are delivered
    /// to `events` as they occur.
    fn start(
        &mut self,
        begin: u64,
        until: u64,
        events: &mut dyn EventSink<Self>,
    ) -> Result<(), CpuError>;

    /// Request a clean stop; callable from inside an event callback. The
    /// engine returns from [`Cpu::start`] after the current instruction.
    fn stop(&mut self);

    /// Disassemble up to `size` bytes at `addr`.
    fn disas(&mut self, addr: u64, size: u64) -> Result<String, CpuError>;
}

/// Receiver for engine events.
///
/// Each callback is handed the engine itself, so a sink can read registers,
/// access memory, or call [`Cpu::stop`] mid-run. Callbacks must not block.
pub trait EventSink<C: Cpu + ?Sized> {
    fn on_block(&mut self, cpu: &mut C, addr: u64, size: u32) {
        let _ = (cpu, addr, size);
    }

    fn on_code(&mut self, cpu: &mut C, addr: u64, size: u32) {
        let _ = (cpu, addr, size);
    }

    fn on_mem(&mut self, cpu: &mut C, access: MemAccess, addr: u64, size: usize, value: i64) {
        let _ = (cpu, access, addr, size, value);
    }

    /// Invalid memory access. Return `true` to resume execution, `false` to
    /// let the engine fault.
    fn on_invalid_mem(
        &mut self,
        cpu: &mut C,
        access: MemAccess,
        addr: u64,
        size: usize,
        value: i64,
    ) -> bool {
        let _ = (cpu, access, addr, size, value);
        false
    }

    fn on_interrupt(&mut self, cpu: &mut C, intno: u32) {
        let _ = (cpu, intno);
    }
}
