//! Initial-stack construction per the POSIX-like guest ABI.
//!
//! ```text
//!                        STACK LAYOUT
//! position            content
//! ------------------------------------------------------------------
//! stack pointer ->  [ argc ]                       one word
//!                   [ argv[0] (pointer) ]          one word each
//!                   [ argv[..] ]
//!                   [ argv[n] = NULL ]
//!
//!                   [ envp[0] (pointer) ]
//!                   [ envp[..] ]
//!                   [ envp[term] = NULL ]
//!
//!                   [ auxv bytes ]                 opaque blob
//!
//!                   [ end marker ]                 one word (= NULL)
//!
//! stack base + STACK_SIZE -> < bottom of stack >
//! ------------------------------------------------------------------
//! ```
//!
//! The argument and environment strings themselves live in a separately
//! mapped region, not on the stack; only the pointer vectors do.

use crate::cpu::{Cpu, Endian};

use super::{EmuError, Process, STACK_BASE, STACK_SIZE};

impl<C: Cpu> Process<C> {
    /// Reserve the stack region and point the guest SP at its top.
    pub fn setup_stack(&mut self, cpu: &mut C) -> Result<(), EmuError> {
        let stack = self.mmap(cpu, STACK_BASE, STACK_SIZE)?;
        self.stack_base = stack;
        cpu.reg_write(self.arch.sp, stack + STACK_SIZE)?;
        Ok(())
    }

    /// Encode one guest word in the image's byte order and word size.
    fn pack_word(&self, value: u64) -> Vec<u8> {
        match (self.arch.bsz, self.byte_order) {
            (4, Endian::Little) => (value as u32).to_le_bytes().to_vec(),
            (4, Endian::Big) => (value as u32).to_be_bytes().to_vec(),
            (_, Endian::Little) => value.to_le_bytes().to_vec(),
            (_, Endian::Big) => value.to_be_bytes().to_vec(),
        }
    }

    /// Push one guest word; returns the new SP.
    pub fn push(&mut self, cpu: &mut C, value: u64) -> Result<u64, EmuError> {
        let word = self.pack_word(value);
        self.push_bytes(cpu, &word)
    }

    /// Push raw bytes; returns the new SP (the address of the bytes).
    pub fn push_bytes(&mut self, cpu: &mut C, bytes: &[u8]) -> Result<u64, EmuError> {
        let sp = cpu.reg_read(self.arch.sp)?;
        if bytes.is_empty() {
            return Ok(sp);
        }
        let sp = sp - bytes.len() as u64;
        cpu.mem_write(sp, bytes)?;
        cpu.reg_write(self.arch.sp, sp)?;
        Ok(sp)
    }

    /// Copy NUL-terminated strings into a freshly mapped guest region and
    /// return each string's address, in input order.
    fn push_strings(&mut self, cpu: &mut C, strings: &[String]) -> Result<Vec<u64>, EmuError> {
        if strings.is_empty() {
            return Ok(Vec::new());
        }
        let total: usize = strings.iter().map(|s| s.len() + 1).sum();
        let base = self.mmap(cpu, 0, total as u64)?;
        let mut buf = vec![0u8; total];
        let mut addrs = Vec::with_capacity(strings.len());
        let mut pos = 0usize;
        for s in strings {
            buf[pos..pos + s.len()].copy_from_slice(s.as_bytes());
            addrs.push(base + pos as u64);
            pos += s.len() + 1;
        }
        cpu.mem_write(base, &buf)?;
        Ok(addrs)
    }

    /// Push a pointer vector: the NULL terminator first, then the addresses
    /// in reverse, so the vector reads in natural order in guest memory.
    fn push_addrs(&mut self, cpu: &mut C, addrs: &[u64]) -> Result<(), EmuError> {
        self.push(cpu, 0)?;
        for &addr in addrs.iter().rev() {
            self.push(cpu, addr)?;
        }
        Ok(())
    }

    /// Build the initial stack: end marker, auxv, envp, argv, argc, with SP
    /// left pointing at argc.
    pub fn posix_init(
        &mut self,
        cpu: &mut C,
        args: &[String],
        env: &[String],
        auxv: &[u8],
    ) -> Result<(), EmuError> {
        self.push(cpu, 0)?;
        self.push_bytes(cpu, auxv)?;
        let envp = self.push_strings(cpu, env)?;
        self.push_addrs(cpu, &envp)?;
        let argv = self.push_strings(cpu, args)?;
        self.push_addrs(cpu, &argv)?;
        self.push(cpu, args.len() as u64)?;
        Ok(())
    }
}
