//! A deterministic, scripted CPU engine for tests.
//!
//! [`ScriptedCpu`] implements the full engine interface without executing a
//! single real instruction. Memory is flat storage over the committed
//! ranges; registers are a plain table; "execution" replays a scripted tape
//! of events through the caller's [`EventSink`], honoring the registered
//! hook kinds exactly like a real engine. Some great properties:
//!
//! - Full determinism: no clock, no randomness, no host state.
//! - Every `mem_map` and `stop` call is recorded for assertions.
//! - Disassembly is canned text, configurable per address.

use std::collections::HashMap;
use std::mem;

use userbox::cpu::{Cpu, CpuError, EventSink, HookKinds, MemAccess, RegId};

/// Page granularity of the mock engine.
pub const PAGE_SIZE: u64 = 0x1000;

/// One entry on the scripted event tape.
#[derive(Clone, Debug)]
pub enum Event {
    /// Deliver a basic-block event.
    Block { addr: u64, size: u32 },
    /// Deliver an instruction event.
    Code { addr: u64, size: u32 },
    /// Deliver a valid memory access.
    Mem { access: MemAccess, addr: u64, size: usize, value: i64 },
    /// Deliver an invalid memory access; the run faults unless the sink
    /// asks to resume.
    InvalidMem { access: MemAccess, addr: u64, size: usize, value: i64 },
    /// Deliver an interrupt.
    Intr { intno: u32 },
    /// Set a register silently, as if the guest executed something. Not
    /// delivered to the sink.
    SetReg { reg: RegId, value: u64 },
}

#[derive(Debug)]
struct Region {
    start: u64,
    data: Vec<u8>,
}

impl Region {
    fn end(&self) -> u64 {
        self.start + self.data.len() as u64
    }

    fn contains(&self, addr: u64, len: u64) -> bool {
        self.start <= addr && addr + len <= self.end()
    }
}

/// The scripted engine.
#[derive(Default)]
pub struct ScriptedCpu {
    regs: HashMap<RegId, u64>,
    regions: Vec<Region>,
    script: Vec<Event>,
    hooks: Option<HookKinds>,
    stopped: bool,
    disas: HashMap<u64, String>,
    /// Every `mem_map` call, in order, as `(addr, size)`.
    pub map_calls: Vec<(u64, u64)>,
    /// Number of `stop` calls observed.
    pub stop_calls: usize,
    /// `(begin, until)` of the last `start` call.
    pub started: Option<(u64, u64)>,
}

impl ScriptedCpu {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Append events to the tape replayed by the next `start`.
    pub fn script(&mut self, events: impl IntoIterator<Item = Event>) {
        self.script.extend(events);
    }

    /// Canned disassembly text for `addr`.
    pub fn set_disas(&mut self, addr: u64, text: impl Into<String>) {
        self.disas.insert(addr, text.into());
    }

    /// Hook kinds registered so far, if any.
    #[must_use]
    pub fn hooks(&self) -> Option<HookKinds> {
        self.hooks
    }

    /// Convenience read returning an owned buffer.
    pub fn read(&mut self, addr: u64, len: usize) -> Result<Vec<u8>, CpuError> {
        let mut buf = vec![0u8; len];
        self.mem_read_into(&mut buf, addr)?;
        Ok(buf)
    }

    /// Read one guest word, little-endian.
    pub fn read_u64(&mut self, addr: u64) -> Result<u64, CpuError> {
        let buf = self.read(addr, 8)?;
        Ok(u64::from_le_bytes(buf.try_into().unwrap()))
    }

    fn region_index(&self, addr: u64, len: u64) -> Option<usize> {
        self.regions.iter().position(|r| r.contains(addr, len))
    }
}

impl Cpu for ScriptedCpu {
    fn page_size(&self) -> u64 {
        PAGE_SIZE
    }

    fn mem_map(&mut self, addr: u64, size: u64) -> Result<(), CpuError> {
        self.map_calls.push((addr, size));
        if addr % PAGE_SIZE != 0 || size % PAGE_SIZE != 0 {
            return Err(CpuError::Map { addr, size });
        }
        let end = addr + size;
        if self.regions.iter().any(|r| addr < r.end() && r.start < end) {
            return Err(CpuError::Map { addr, size });
        }
        if size > 0 {
            self.regions.push(Region { start: addr, data: vec![0u8; size as usize] });
        }
        Ok(())
    }

    fn mem_write(&mut self, addr: u64, data: &[u8]) -> Result<(), CpuError> {
        if data.is_empty() {
            return Ok(());
        }
        let len = data.len() as u64;
        let Some(i) = self.region_index(addr, len) else {
            return Err(CpuError::Write { addr, size: len });
        };
        let offset = (addr - self.regions[i].start) as usize;
        self.regions[i].data[offset..offset + data.len()].copy_from_slice(data);
        Ok(())
    }

    fn mem_read_into(&mut self, buf: &mut [u8], addr: u64) -> Result<(), CpuError> {
        if buf.is_empty() {
            return Ok(());
        }
        let len = buf.len() as u64;
        let Some(i) = self.region_index(addr, len) else {
            return Err(CpuError::Read { addr, size: len });
        };
        let offset = (addr - self.regions[i].start) as usize;
        buf.copy_from_slice(&self.regions[i].data[offset..offset + buf.len()]);
        Ok(())
    }

    fn reg_read(&mut self, reg: RegId) -> Result<u64, CpuError> {
        Ok(self.regs.get(&reg).copied().unwrap_or(0))
    }

    fn reg_write(&mut self, reg: RegId, value: u64) -> Result<(), CpuError> {
        self.regs.insert(reg, value);
        Ok(())
    }

    fn hook_add(&mut self, kinds: HookKinds) -> Result<(), CpuError> {
        self.hooks = Some(self.hooks.unwrap_or(HookKinds::empty()) | kinds);
        Ok(())
    }

    fn start(
        &mut self,
        begin: u64,
        until: u64,
        events: &mut dyn EventSink<Self>,
    ) -> Result<(), CpuError> {
        self.started = Some((begin, until));
        self.stopped = false;
        let hooks = self.hooks.unwrap_or(HookKinds::empty());
        let tape = mem::take(&mut self.script);
        for event in tape {
            if self.stopped {
                break;
            }
            match event {
                Event::Block { addr, size } => {
                    if hooks.contains(HookKinds::BLOCK) {
                        events.on_block(self, addr, size);
                    }
                }
                Event::Code { addr, size } => {
                    if hooks.contains(HookKinds::CODE) {
                        events.on_code(self, addr, size);
                    }
                }
                Event::Mem { access, addr, size, value } => {
                    if hooks.contains(access.hook_kind()) {
                        events.on_mem(self, access, addr, size, value);
                    }
                }
                Event::InvalidMem { access, addr, size, value } => {
                    let resume = hooks.contains(access.hook_kind())
                        && events.on_invalid_mem(self, access, addr, size, value);
                    if !resume {
                        return Err(CpuError::InvalidMemory { addr });
                    }
                }
                Event::Intr { intno } => {
                    if hooks.contains(HookKinds::INTR) {
                        events.on_interrupt(self, intno);
                    }
                }
                Event::SetReg { reg, value } => {
                    self.regs.insert(reg, value);
                }
            }
        }
        Ok(())
    }

    fn stop(&mut self) {
        self.stopped = true;
        self.stop_calls += 1;
    }

    fn disas(&mut self, addr: u64, _size: u64) -> Result<String, CpuError> {
        Ok(self
            .disas
            .get(&addr)
            .cloned()
            .unwrap_or_else(|| format!("0x{addr:x}: .insn")))
    }
}
