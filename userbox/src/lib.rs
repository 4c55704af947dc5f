//! # Userbox
//!
//! > A user-space binary emulator core.
//!
//! Userbox loads an unmodified executable for a guest CPU architecture and
//! operating-system ABI, constructs a faithful process image (code, data,
//! stack, auxiliary vector, argument strings) inside an emulated flat address
//! space, and drives a CPU engine that executes the guest while trapping
//! interrupts back into the host for syscall dispatch.
//!
//! The engine itself is not part of this crate: it is consumed through the
//! [`cpu::Cpu`] trait, and events it raises during a run (basic blocks,
//! instructions, memory accesses, interrupts) are delivered to the emulator
//! through [`cpu::EventSink`]. Binary formats are likewise consumed through
//! [`loader::Loader`]; an OS personality (process start-up and syscall
//! handling) is plugged in as an [`os::Os`] record plus an [`os::Syscalls`]
//! implementation.
//!
//! The typical wiring, with an ELF binary and the Linux personality:
//!
//! ```ignore
//! let loader = userbox_loader_elf::ElfFile::open("./a.out")?;
//! let mut emu = Emulator::with_resolver(
//!     engine,
//!     Box::new(loader),
//!     userbox_shim_linux::linux(loader.arch()),
//!     Config::default(),
//!     Some(userbox_loader_elf::resolver()),
//! )?;
//! emu.set_syscalls(Box::new(userbox_shim_linux::PosixSyscalls::new()));
//! emu.run(&args, &env)?;
//! ```

pub mod arch;
pub mod cpu;
pub mod emu;
pub mod loader;
pub mod mem;
pub mod os;
pub mod symbol;
pub mod trace;

pub use cpu::{Cpu, CpuError, Endian, EventSink, HookKinds, MemAccess, RegId};
pub use emu::{Config, EmuError, Emulator, Process, STACK_BASE, STACK_SIZE};
pub use loader::{ArchId, LoadType, Loader, LoaderError, OsId, SegmentData, Symbol};
pub use os::{Os, Syscalls};
