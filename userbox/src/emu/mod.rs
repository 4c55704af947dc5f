//! The emulator: process image construction and the run driver.

mod hooks;
mod image;
mod stack;

use std::io::{self, Write};
use std::path::{Path, PathBuf};

use log::debug;
use thiserror::Error;

use crate::arch::{self, Arch, ArchUnsupported};
use crate::cpu::{Cpu, CpuError, Endian};
use crate::loader::{Loader, LoaderError, ResolveFn};
use crate::mem::{AddressSpace, DataSegment};
use crate::os::{GetArgsFn, Os, Syscalls};
use crate::symbol::Symbolicator;
use crate::trace::{self, Stacktrace, StatusDiff};

pub use image::LoadedImage;

/// Hint used when reserving the stack region.
pub const STACK_BASE: u64 = 0x6000_0000;
/// Size of the stack region.
pub const STACK_SIZE: u64 = 0x0080_0000;

/// Hint for the first mapping of a position-independent image.
const DYN_LOAD_HINT: u64 = 0x0100_0000;

/// Trace and environment switches for one emulator instance.
///
/// Multiple emulators in one host process are configured independently.
#[derive(Debug, Default)]
pub struct Config {
    pub verbose: bool,
    pub trace_sys: bool,
    pub trace_mem: bool,
    pub trace_exec: bool,
    pub trace_reg: bool,
    /// Sysroot absolute guest paths are redirected under.
    pub load_prefix: Option<PathBuf>,
}

#[non_exhaustive]
#[derive(Error, Debug)]
pub enum EmuError {
    #[error("unsupported binary load type")]
    UnsupportedLoadType,
    #[error(transparent)]
    Loader(#[from] LoaderError),
    #[error(transparent)]
    Cpu(#[from] CpuError),
    #[error(transparent)]
    Arch(#[from] ArchUnsupported),
    #[error("binary requests interpreter {0} but no loader resolver is configured")]
    NoResolver(String),
    #[error("no syscall layer installed (syscall {0})")]
    NoSyscalls(String),
}

/// Everything the emulator owns except the engine itself.
///
/// During a run the engine borrows this as the event sink, so hooks, the OS
/// personality, and the syscall layer all operate on `(&mut Process, &mut C)`
/// pairs. All mutation happens on the driving thread; see the crate docs.
pub struct Process<C: Cpu> {
    arch: &'static Arch,
    os: Os<C>,
    byte_order: Endian,
    config: Config,
    mem: AddressSpace,
    loader: Box<dyn Loader>,
    /// Kept only for symbolication once the interpreter is mapped.
    interp_loader: Option<Box<dyn Loader>>,
    resolver: Option<Box<ResolveFn>>,
    syscalls: Option<Box<dyn Syscalls<C>>>,
    base: u64,
    interp_base: u64,
    entry: u64,
    bin_entry: u64,
    stack_base: u64,
    data: DataSegment,
    sym: Symbolicator,
    status: StatusDiff,
    stacktrace: Stacktrace,
    deadlock: u32,
    last_block: u64,
    last_code: u64,
    out: Box<dyn Write>,
}

/// A loaded guest process plus the engine that executes it.
pub struct Emulator<C: Cpu> {
    cpu: C,
    proc: Process<C>,
}

impl<C: Cpu> std::fmt::Debug for Emulator<C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Emulator").finish_non_exhaustive()
    }
}

impl<C: Cpu> Emulator<C> {
    /// Map `loader`'s image into the engine and build an emulator around it.
    ///
    /// Fails on an unsupported load type or `(arch, OS)` pair, on parser
    /// errors, and on engine map/write rejections. A binary that requests an
    /// interpreter needs [`Emulator::with_resolver`] instead.
    pub fn new(
        cpu: C,
        loader: Box<dyn Loader>,
        os: Os<C>,
        config: Config,
    ) -> Result<Self, EmuError> {
        Self::with_resolver(cpu, loader, os, config, None)
    }

    /// Like [`Emulator::new`], with a factory for loading the interpreter a
    /// dynamically linked binary requests. The interpreter path is resolved
    /// through the configured load prefix first.
    pub fn with_resolver(
        mut cpu: C,
        loader: Box<dyn Loader>,
        os: Os<C>,
        config: Config,
        resolver: Option<Box<ResolveFn>>,
    ) -> Result<Self, EmuError> {
        let arch = arch::lookup(loader.arch(), loader.os())?;
        let byte_order = loader.byte_order();
        let (data_start, data_end) = loader.data_segment();
        let page_size = cpu.page_size();
        let mut proc = Process {
            arch,
            os,
            byte_order,
            config,
            mem: AddressSpace::new(page_size),
            loader,
            interp_loader: None,
            resolver,
            syscalls: None,
            base: 0,
            interp_base: 0,
            entry: 0,
            bin_entry: 0,
            stack_base: 0,
            data: DataSegment { start: data_start, end: data_end },
            sym: Symbolicator::default(),
            status: StatusDiff::new(arch),
            stacktrace: Stacktrace::default(),
            deadlock: 0,
            last_block: 0,
            last_code: 0,
            out: Box::new(io::stderr()),
        };

        let loaded = proc.map_binary(&mut cpu)?;
        proc.base = loaded.base;
        proc.interp_base = loaded.interp_base;
        proc.entry = loaded.entry;
        proc.bin_entry = loaded.bin_entry;

        let main_syms = proc.loader.symbols().unwrap_or_else(|err| {
            debug!("no symbols for main binary: {err}");
            Vec::new()
        });
        proc.sym.push_table(loaded.base, main_syms);
        if let Some(interp) = &proc.interp_loader {
            let interp_syms = interp.symbols().unwrap_or_else(|err| {
                debug!("no symbols for interpreter: {err}");
                Vec::new()
            });
            proc.sym.push_table(loaded.interp_base, interp_syms);
        }

        Ok(Emulator { cpu, proc })
    }

    /// Install the syscall implementation layer.
    pub fn set_syscalls(&mut self, syscalls: Box<dyn Syscalls<C>>) {
        self.proc.syscalls = Some(syscalls);
    }

    /// Redirect operator trace output (defaults to stderr).
    pub fn set_trace_output(&mut self, out: Box<dyn Write>) {
        self.proc.out = out;
    }

    /// Run the guest: install hooks, seed the stack, let the OS personality
    /// initialize the process, then start the engine at the entry point.
    ///
    /// Returns when the engine stops (guest exit, deliberate stop) or
    /// errors; on error the registers and stack trace are dumped to the
    /// trace output first.
    pub fn run(&mut self, args: &[String], env: &[String]) -> Result<(), EmuError> {
        self.proc.install_hooks(&mut self.cpu)?;
        self.proc.setup_stack(&mut self.cpu)?;
        if let Some(init) = self.proc.os.init {
            init(&mut self.proc, &mut self.cpu, args, env)?;
        }
        self.proc.dump_entry_state(&mut self.cpu)?;
        if self.proc.config.trace_reg || self.proc.config.trace_exec {
            let sp = self.cpu.reg_read(self.proc.arch.sp)?;
            self.proc.stacktrace.update(self.proc.entry, sp);
        }
        let entry = self.proc.entry;
        if let Err(err) = self.cpu.start(entry, u64::MAX, &mut self.proc) {
            self.proc.dump_crash_state(&mut self.cpu);
            return Err(err.into());
        }
        Ok(())
    }

    pub fn process(&self) -> &Process<C> {
        &self.proc
    }

    pub fn process_mut(&mut self) -> &mut Process<C> {
        &mut self.proc
    }

    pub fn cpu_mut(&mut self) -> &mut C {
        &mut self.cpu
    }

    /// Split borrows for callers that need the process and engine together.
    pub fn parts(&mut self) -> (&mut Process<C>, &mut C) {
        (&mut self.proc, &mut self.cpu)
    }

    // Thin facade over the process for embedders; the same operations are
    // available on `Process` for code running inside hooks.

    pub fn base(&self) -> u64 {
        self.proc.base
    }

    pub fn bin_entry(&self) -> u64 {
        self.proc.bin_entry
    }

    pub fn entry(&self) -> u64 {
        self.proc.entry
    }

    pub fn interp_base(&self) -> u64 {
        self.proc.interp_base
    }

    pub fn loader(&self) -> &dyn Loader {
        self.proc.loader()
    }

    pub fn symbolicate(&self, addr: u64) -> Option<String> {
        self.proc.symbolicate(addr)
    }

    pub fn prefix_path(&self, path: &str, force: bool) -> String {
        self.proc.prefix_path(path, force)
    }

    pub fn brk(&mut self, addr: u64) -> Result<u64, EmuError> {
        self.proc.brk(&mut self.cpu, addr)
    }

    pub fn push(&mut self, value: u64) -> Result<u64, EmuError> {
        self.proc.push(&mut self.cpu, value)
    }

    pub fn push_bytes(&mut self, bytes: &[u8]) -> Result<u64, EmuError> {
        self.proc.push_bytes(&mut self.cpu, bytes)
    }

    pub fn setup_stack(&mut self) -> Result<(), EmuError> {
        self.proc.setup_stack(&mut self.cpu)
    }

    pub fn posix_init(
        &mut self,
        args: &[String],
        env: &[String],
        auxv: &[u8],
    ) -> Result<(), EmuError> {
        self.proc.posix_init(&mut self.cpu, args, env, auxv)
    }

    pub fn reg_read(&mut self, reg: crate::cpu::RegId) -> Result<u64, EmuError> {
        self.cpu.reg_read(reg).map_err(Into::into)
    }

    pub fn reg_write(&mut self, reg: crate::cpu::RegId, value: u64) -> Result<(), EmuError> {
        self.cpu.reg_write(reg, value).map_err(Into::into)
    }

    pub fn mem_map(&mut self, addr: u64, size: u64) -> Result<(), EmuError> {
        self.proc.mem_map(&mut self.cpu, addr, size)
    }

    pub fn mmap(&mut self, hint: u64, size: u64) -> Result<u64, EmuError> {
        self.proc.mmap(&mut self.cpu, hint, size)
    }

    pub fn mem_write(&mut self, addr: u64, data: &[u8]) -> Result<(), EmuError> {
        self.proc.mem_write(&mut self.cpu, addr, data)
    }

    pub fn mem_read(&mut self, addr: u64, len: usize) -> Result<Vec<u8>, EmuError> {
        self.proc.mem_read(&mut self.cpu, addr, len)
    }

    pub fn syscall(
        &mut self,
        num: u64,
        name: &str,
        get_args: &mut GetArgsFn<'_>,
    ) -> Result<u64, EmuError> {
        self.proc.syscall(&mut self.cpu, num, name, get_args)
    }
}

impl<C: Cpu> Process<C> {
    pub fn arch(&self) -> &'static Arch {
        self.arch
    }

    pub fn os(&self) -> &Os<C> {
        &self.os
    }

    pub fn byte_order(&self) -> Endian {
        self.byte_order
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn base(&self) -> u64 {
        self.base
    }

    pub fn interp_base(&self) -> u64 {
        self.interp_base
    }

    pub fn entry(&self) -> u64 {
        self.entry
    }

    pub fn bin_entry(&self) -> u64 {
        self.bin_entry
    }

    pub fn stack_base(&self) -> u64 {
        self.stack_base
    }

    pub fn data_segment(&self) -> DataSegment {
        self.data
    }

    pub fn loader(&self) -> &dyn Loader {
        self.loader.as_ref()
    }

    /// The operator trace stream.
    pub fn out(&mut self) -> &mut dyn Write {
        &mut *self.out
    }

    pub fn symbolicate(&self, addr: u64) -> Option<String> {
        self.sym.resolve(addr)
    }

    /// Redirect an absolute guest path under the configured sysroot.
    ///
    /// With `force` the redirected path is returned regardless of whether it
    /// exists on the host; otherwise only when it does.
    pub fn prefix_path(&self, path: &str, force: bool) -> String {
        let Some(prefix) = &self.config.load_prefix else {
            return path.to_owned();
        };
        if prefix.as_os_str().is_empty() || !Path::new(path).is_absolute() {
            return path.to_owned();
        }
        let target = prefix.join(path.trim_start_matches('/'));
        if force || target.exists() {
            target.to_string_lossy().into_owned()
        } else {
            path.to_owned()
        }
    }

    /// Commit a specific guest range, aligned outward to page boundaries.
    pub fn mem_map(&mut self, cpu: &mut C, addr: u64, size: u64) -> Result<(), EmuError> {
        let (addr, size) = self.mem.align(addr, size, true);
        cpu.mem_map(addr, size)?;
        self.mem.reserve(addr, size);
        Ok(())
    }

    /// Allocate and commit an unused guest range of `size` bytes, at or
    /// above `hint` when it is non-zero.
    pub fn mmap(&mut self, cpu: &mut C, hint: u64, size: u64) -> Result<u64, EmuError> {
        let (_, size) = self.mem.align(0, size, true);
        let addr = self.mem.find_free(hint, size);
        cpu.mem_map(addr, size)?;
        self.mem.reserve(addr, size);
        Ok(addr)
    }

    pub fn mem_write(&mut self, cpu: &mut C, addr: u64, data: &[u8]) -> Result<(), EmuError> {
        cpu.mem_write(addr, data).map_err(Into::into)
    }

    pub fn mem_read(&mut self, cpu: &mut C, addr: u64, len: usize) -> Result<Vec<u8>, EmuError> {
        let mut buf = vec![0u8; len];
        cpu.mem_read_into(&mut buf, addr)?;
        Ok(buf)
    }

    /// Extend the program break to `addr`; `brk(0)` reports the current end.
    ///
    /// The break only grows. A mapping failure leaves the break unchanged
    /// and propagates.
    pub fn brk(&mut self, cpu: &mut C, addr: u64) -> Result<u64, EmuError> {
        if addr > self.data.end {
            self.mem_map(cpu, self.data.end, addr - self.data.end)?;
            self.data.end = addr;
        }
        Ok(self.data.end)
    }

    /// Forward a trapped syscall to the installed syscall layer.
    ///
    /// # Panics
    ///
    /// An empty `name` is a programmer error (the personality failed to
    /// resolve the number) and aborts with a diagnostic.
    pub fn syscall(
        &mut self,
        cpu: &mut C,
        num: u64,
        name: &str,
        get_args: &mut GetArgsFn<'_>,
    ) -> Result<u64, EmuError> {
        assert!(!name.is_empty(), "syscall {num} has no name entry");
        let trace = self.config.trace_sys;
        if trace && (self.config.trace_exec || self.config.trace_reg) {
            let indent = "  ".repeat(self.stacktrace.len().saturating_sub(1));
            let _ = write!(self.out, "{indent}s ");
        }
        let mut layer = self
            .syscalls
            .take()
            .ok_or_else(|| EmuError::NoSyscalls(name.to_owned()))?;
        let result = layer.call(self, cpu, num, name, get_args, trace);
        self.syscalls = Some(layer);
        result
    }

    /// Verbose pre-run dump: entry disassembly, the seeded stack, and the
    /// initial register state.
    fn dump_entry_state(&mut self, cpu: &mut C) -> Result<(), EmuError> {
        if self.config.verbose {
            let _ = writeln!(self.out, "[entry @ 0x{:x}]", self.entry);
            match cpu.disas(self.entry, 64) {
                Ok(dis) => {
                    let _ = writeln!(self.out, "{dis}");
                }
                Err(err) => {
                    let _ = writeln!(self.out, "{err}");
                }
            }
            let sp = cpu.reg_read(self.arch.sp)?;
            let top = self.stack_base + STACK_SIZE;
            let mut buf = vec![0u8; (top - sp) as usize];
            cpu.mem_read_into(&mut buf, sp)?;
            let _ = writeln!(self.out, "[stack @ 0x{sp:x}]");
            let _ = trace::hexdump(&mut *self.out, sp, &buf);
        }
        if self.config.verbose || self.config.trace_reg {
            let changes = self.status.changes(cpu);
            changes.print(&mut *self.out, "", false);
        }
        if self.config.verbose {
            let _ = writeln!(self.out, "=====================================");
            let _ = writeln!(self.out, "==== Program output begins here. ====");
            let _ = writeln!(self.out, "=====================================");
        }
        Ok(())
    }

    /// Post-mortem dump used when the engine reports an error.
    fn dump_crash_state(&mut self, cpu: &mut C) {
        let _ = writeln!(self.out, "Registers:");
        let changes = self.status.changes(cpu);
        changes.print(&mut *self.out, "", false);
        let _ = writeln!(self.out, "Stacktrace:");
        let Process { out, stacktrace, sym, .. } = self;
        stacktrace.print(&mut **out, sym);
    }
}
