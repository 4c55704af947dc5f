//! Event handling during a run: trace lines, stack-trace upkeep, deadlock
//! detection, and interrupt routing.

use std::io::Write;

use crate::cpu::{Cpu, EventSink, HookKinds, MemAccess};

use super::{EmuError, Process};

impl<C: Cpu> Process<C> {
    /// Register the event kinds the current trace configuration needs.
    /// Invalid-memory and interrupt events are always on; the rest follow
    /// the trace flags.
    pub(super) fn install_hooks(&mut self, cpu: &mut C) -> Result<(), EmuError> {
        let mut kinds = HookKinds::MEM_INVALID | HookKinds::INTR;
        if self.config.trace_exec || self.config.trace_reg {
            kinds |= HookKinds::BLOCK;
        }
        if self.config.trace_exec {
            kinds |= HookKinds::CODE;
        }
        if self.config.trace_mem {
            kinds |= HookKinds::MEM_VALID;
        }
        cpu.hook_add(kinds)?;
        Ok(())
    }

    fn paren_symbol(&self, addr: u64) -> String {
        match self.symbolicate(addr) {
            Some(name) => format!(" ({name})"),
            None => String::new(),
        }
    }
}

impl<C: Cpu> EventSink<C> for Process<C> {
    fn on_block(&mut self, cpu: &mut C, addr: u64, _size: u32) {
        if let Ok(sp) = cpu.reg_read(self.arch.sp) {
            self.stacktrace.update(addr, sp);
        }
        let depth = self.stacktrace.len();
        let indent = "  ".repeat(depth);
        let block_indent = "  ".repeat(depth.saturating_sub(1));
        let block_line =
            format!("\n{block_indent}+ block{} @0x{addr:x}", self.paren_symbol(addr));
        if !self.config.trace_exec && self.config.trace_reg && self.deadlock == 0 {
            // Register-only tracing: a block header is only worth printing
            // when something changed under it.
            let changes = self.status.changes(cpu);
            if changes.count() > 0 {
                let _ = writeln!(self.out, "{block_line}");
                changes.print(&mut *self.out, &indent, true);
            }
        } else {
            let _ = writeln!(self.out, "{block_line}");
        }
        self.last_block = addr;
    }

    fn on_code(&mut self, cpu: &mut C, addr: u64, size: u32) {
        let indent = "  ".repeat(self.stacktrace.len());
        let changes = if addr == self.last_code
            || (self.config.trace_reg && self.config.trace_exec)
        {
            Some(self.status.changes(cpu))
        } else {
            None
        };

        if self.config.trace_exec {
            let dis = cpu.disas(addr, u64::from(size)).unwrap_or_default();
            match &changes {
                Some(ch) if self.config.trace_reg && ch.count() > 0 => {
                    let _ = write!(self.out, "{indent}{dis}");
                    let pad = 40usize.saturating_sub(dis.len());
                    ch.print(&mut *self.out, &" ".repeat(pad), true);
                }
                _ => {
                    let _ = writeln!(self.out, "{indent}{dis}");
                }
            }
        }

        // The same address executing repeatedly with no register movement is
        // the practical signature of a stuck guest.
        if addr == self.last_code {
            self.deadlock += 1;
            if let Some(ch) = &changes {
                if ch.count() > 0 {
                    if self.config.trace_reg && !self.config.trace_exec {
                        ch.print(&mut *self.out, &indent, true);
                    }
                    self.deadlock = 0;
                }
            }
            if self.deadlock > 2 {
                let _ = writeln!(
                    self.out,
                    "FATAL: deadlock detected at 0x{addr:x}{}",
                    self.paren_symbol(addr)
                );
                if let Some(ch) = &changes {
                    ch.print(&mut *self.out, &indent, false);
                }
                cpu.stop();
            }
        } else {
            self.deadlock = 0;
        }
        self.last_code = addr;
    }

    fn on_mem(&mut self, _cpu: &mut C, access: MemAccess, addr: u64, size: usize, value: i64) {
        let indent = "  ".repeat(self.stacktrace.len().saturating_sub(1));
        let letter = if access == MemAccess::Write { "W" } else { "R" };
        let width = usize::from(self.arch.bsz) * 2;
        let _ = writeln!(
            self.out,
            "{indent}{letter} 0x{addr:0width$x} {size} 0x{value:0width$x}",
            value = value as u64,
        );
    }

    fn on_invalid_mem(
        &mut self,
        _cpu: &mut C,
        access: MemAccess,
        addr: u64,
        size: usize,
        value: i64,
    ) -> bool {
        let what = match access {
            MemAccess::WriteInvalid => "invalid write",
            MemAccess::ReadInvalid => "invalid prot",
            MemAccess::FetchInvalid => "invalid fetch",
            _ => "unknown memory error",
        };
        let _ = writeln!(self.out, "{what}: @0x{addr:x}, 0x{size:x} = 0x{value:x}");
        false
    }

    fn on_interrupt(&mut self, cpu: &mut C, intno: u32) {
        let interrupt = self.os.interrupt;
        interrupt(self, cpu, intno);
    }
}
