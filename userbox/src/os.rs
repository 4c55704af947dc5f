//! OS personality records and the external syscall layer.
//!
//! An `(arch, OS)` pair selects an [`Os`] record: an optional process
//! start-up hook and a required interrupt handler, plus the syscall
//! number-to-name table. Personality crates construct these; the core only
//! dispatches through them.

use crate::cpu::Cpu;
use crate::emu::{EmuError, Process};

/// Process start-up hook: seeds the initial stack (argv/envp/auxv) per the
/// guest ABI before the engine starts.
pub type InitFn<C> = fn(&mut Process<C>, &mut C, &[String], &[String]) -> Result<(), EmuError>;

/// Trap handler: invoked synchronously for every guest interrupt.
pub type InterruptFn<C> = fn(&mut Process<C>, &mut C, u32);

/// An OS personality.
pub struct Os<C: Cpu> {
    pub name: &'static str,
    pub init: Option<InitFn<C>>,
    pub interrupt: InterruptFn<C>,
    /// Syscall number-to-name mapping for this OS on the current arch.
    pub syscall_name: fn(u64) -> Option<&'static str>,
}

/// On-demand extractor for guest syscall arguments: `get_args(n)` yields the
/// first `n` arguments per the guest ABI.
pub type GetArgsFn<'a> = dyn FnMut(usize) -> Result<Vec<u64>, EmuError> + 'a;

/// The external syscall implementation layer.
///
/// Receives every trapped call with its pre-resolved name and performs the
/// host-side effect. The process and engine are borrowed for the duration of
/// the call so implementations can touch guest memory and registers.
pub trait Syscalls<C: Cpu> {
    fn call(
        &mut self,
        proc: &mut Process<C>,
        cpu: &mut C,
        num: u64,
        name: &str,
        get_args: &mut GetArgsFn<'_>,
        trace: bool,
    ) -> Result<u64, EmuError>;
}
