//! Linux personality for userbox.
//!
//! Provides the [`userbox::os::Os`] record for Linux guests: process
//! start-up (argv/envp/auxv per the ELF ABI) and the interrupt handler that
//! decodes traps into system calls, resolves their names, and forwards them
//! through the emulator's syscall bridge. The host-side implementations of
//! the calls themselves live in [`PosixSyscalls`].

pub mod auxv;
pub mod errno;
mod syscalls;

use log::warn;

use userbox::arch;
use userbox::cpu::Cpu;
use userbox::emu::{EmuError, Process};
use userbox::loader::ArchId;
use userbox::os::Os;

use auxv::AuxKey;
pub use syscalls::{aarch64, x86_64, PosixSyscalls};

/// The Linux OS table for `arch`.
#[must_use]
pub fn linux<C: Cpu>(arch: ArchId) -> Os<C> {
    Os {
        name: "linux",
        init: Some(init),
        interrupt,
        syscall_name: match arch {
            ArchId::Aarch64 => aarch64::syscall_name,
            _ => x86_64::syscall_name,
        },
    }
}

/// Seed the initial stack: the `AT_RANDOM` pool, the auxiliary vector, then
/// environment and argument vectors with `argc` on top.
fn init<C: Cpu>(
    proc: &mut Process<C>,
    cpu: &mut C,
    args: &[String],
    env: &[String],
) -> Result<(), EmuError> {
    let random = proc.push_bytes(cpu, &syscalls::RANDOM_POOL)?;
    let entries = [
        (AuxKey::AT_PAGESZ, cpu.page_size()),
        (AuxKey::AT_BASE, proc.interp_base()),
        (AuxKey::AT_FLAGS, 0),
        (AuxKey::AT_ENTRY, proc.bin_entry()),
        (AuxKey::AT_UID, 0),
        (AuxKey::AT_EUID, 0),
        (AuxKey::AT_GID, 0),
        (AuxKey::AT_EGID, 0),
        (AuxKey::AT_SECURE, 0),
        (AuxKey::AT_RANDOM, random),
    ];
    let blob = auxv::build(proc.arch().bsz, proc.byte_order(), &entries);
    proc.posix_init(cpu, args, env, &blob)
}

/// Decode a trap as a system call and forward it.
///
/// The trap number is ignored: on every supported arch the syscall number
/// travels in a register named by the arch table (`rax`, `x8`).
fn interrupt<C: Cpu>(proc: &mut Process<C>, cpu: &mut C, _intno: u32) {
    let table: &'static arch::Arch = proc.arch();
    let num = match cpu.reg_read(table.syscall_num) {
        Ok(num) => num,
        Err(err) => {
            warn!("cannot read syscall number register: {err}");
            cpu.stop();
            return;
        }
    };
    let name = (proc.os().syscall_name)(num).unwrap_or("");

    let args: Result<Vec<u64>, EmuError> = table
        .syscall_args
        .iter()
        .map(|&reg| cpu.reg_read(reg).map_err(EmuError::from))
        .collect();
    let args = match args {
        Ok(args) => args,
        Err(err) => {
            warn!("cannot read syscall argument registers: {err}");
            cpu.stop();
            return;
        }
    };
    let mut get_args =
        move |n: usize| -> Result<Vec<u64>, EmuError> { Ok(args[..n.min(args.len())].to_vec()) };

    match proc.syscall(cpu, num, name, &mut get_args) {
        Ok(ret) => {
            let _ = cpu.reg_write(table.syscall_ret, ret);
        }
        Err(err) => {
            warn!("syscall {name} ({num}) failed: {err}");
            cpu.stop();
        }
    }
}
