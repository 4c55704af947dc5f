//! Execution-trace state: register diffs and the logical call stack.
//!
//! Formatting of the operator trace lines themselves (block, instruction,
//! memory, deadlock) lives with the event handling in [`crate::emu`]; this
//! module owns the state those lines are derived from.

use std::io::{self, Write};

use crate::arch::Arch;
use crate::cpu::Cpu;

/// Snapshot-and-diff over the tracked registers of an architecture.
///
/// Created once per process; every [`StatusDiff::changes`] call reads the
/// current register file, diffs it against the previous snapshot, and then
/// becomes the new baseline.
pub struct StatusDiff {
    arch: &'static Arch,
    prev: Vec<u64>,
}

impl StatusDiff {
    #[must_use]
    pub fn new(arch: &'static Arch) -> Self {
        StatusDiff { arch, prev: vec![0; arch.regs.len()] }
    }

    /// Diff the register file against the last snapshot and advance it.
    ///
    /// Registers the engine cannot read are reported as zero.
    pub fn changes<C: Cpu + ?Sized>(&mut self, cpu: &mut C) -> Changes {
        let mut entries = Vec::with_capacity(self.arch.regs.len());
        for (i, &(name, reg)) in self.arch.regs.iter().enumerate() {
            let value = cpu.reg_read(reg).unwrap_or(0);
            entries.push(RegChange { name, old: self.prev[i], new: value });
            self.prev[i] = value;
        }
        Changes { entries }
    }
}

/// One tracked register's previous and current value.
#[derive(Clone, Copy, Debug)]
pub struct RegChange {
    pub name: &'static str,
    pub old: u64,
    pub new: u64,
}

impl RegChange {
    #[must_use]
    pub fn changed(&self) -> bool {
        self.old != self.new
    }
}

/// The result of one [`StatusDiff::changes`] query.
pub struct Changes {
    entries: Vec<RegChange>,
}

impl Changes {
    /// Number of registers that changed since the previous query.
    #[must_use]
    pub fn count(&self) -> usize {
        self.entries.iter().filter(|e| e.changed()).count()
    }

    #[must_use]
    pub fn iter(&self) -> impl Iterator<Item = &RegChange> {
        self.entries.iter()
    }

    /// Print one line per register, each prefixed by `prefix`. With
    /// `only_changed`, unchanged registers are skipped and the previous
    /// value is shown.
    pub fn print(&self, w: &mut dyn Write, prefix: &str, only_changed: bool) {
        for entry in &self.entries {
            if only_changed && !entry.changed() {
                continue;
            }
            let _ = if only_changed {
                writeln!(w, "{prefix}{} = 0x{:x} (was 0x{:x})", entry.name, entry.new, entry.old)
            } else {
                writeln!(w, "{prefix}{} = 0x{:x}", entry.name, entry.new)
            };
        }
    }
}

/// A logical call stack derived from executed blocks and SP movement.
///
/// A block entered with a lower SP than the current frame is call-like and
/// pushes; SP rising back past a frame's SP is return-like and pops it.
#[derive(Default)]
pub struct Stacktrace {
    frames: Vec<Frame>,
}

#[derive(Clone, Copy, Debug)]
pub struct Frame {
    pub addr: u64,
    pub sp: u64,
}

impl Stacktrace {
    pub fn update(&mut self, addr: u64, sp: u64) {
        while self.frames.last().is_some_and(|f| f.sp < sp) {
            self.frames.pop();
        }
        match self.frames.last_mut() {
            Some(frame) if frame.sp == sp => frame.addr = addr,
            _ => self.frames.push(Frame { addr, sp }),
        }
    }

    /// Current call depth.
    #[must_use]
    pub fn len(&self) -> usize {
        self.frames.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }

    /// Print innermost frame first.
    pub fn print(&self, w: &mut dyn Write, sym: &crate::symbol::Symbolicator) {
        for (i, frame) in self.frames.iter().rev().enumerate() {
            let location = match sym.resolve(frame.addr) {
                Some(name) => format!(" ({name})"),
                None => String::new(),
            };
            let _ = writeln!(w, "  #{i} 0x{:x}{location}", frame.addr);
        }
    }
}

/// Dump `bytes` as hex rows of sixteen, addressed from `addr`.
pub fn hexdump(w: &mut dyn Write, addr: u64, bytes: &[u8]) -> io::Result<()> {
    for (i, row) in bytes.chunks(16).enumerate() {
        write!(w, "{:08x}:", addr + (i as u64) * 16)?;
        for byte in row {
            write!(w, " {byte:02x}")?;
        }
        writeln!(w)?;
    }
    Ok(())
}
