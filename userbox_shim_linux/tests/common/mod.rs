//! Shared fixtures for Linux personality tests.

#![allow(dead_code)]

use std::cell::RefCell;
use std::io::{self, Write};
use std::rc::Rc;

use userbox::cpu::Endian;
use userbox::loader::{ArchId, LoadType, Loader, LoaderError, OsId, SegmentData, Symbol};

/// A hand-built x86_64 Linux image.
pub struct FixtureLoader {
    pub load_type: LoadType,
    pub entry: u64,
    pub segments: Vec<SegmentData>,
    pub data_segment: (u64, u64),
}

impl FixtureLoader {
    pub fn new(entry: u64) -> Self {
        FixtureLoader {
            load_type: LoadType::Exec,
            entry,
            segments: Vec::new(),
            data_segment: (0, 0),
        }
    }

    pub fn segment(mut self, addr: u64, size: u64, data: Vec<u8>) -> Self {
        self.segments.push(SegmentData { addr, size, data });
        self
    }
}

impl Loader for FixtureLoader {
    fn arch(&self) -> ArchId {
        ArchId::X86_64
    }

    fn os(&self) -> OsId {
        OsId::Linux
    }

    fn byte_order(&self) -> Endian {
        Endian::Little
    }

    fn load_type(&self) -> LoadType {
        self.load_type
    }

    fn entry(&self) -> u64 {
        self.entry
    }

    fn segments(&self) -> Result<Vec<SegmentData>, LoaderError> {
        Ok(self.segments.clone())
    }

    fn interp(&self) -> Option<String> {
        None
    }

    fn symbols(&self) -> Result<Vec<Symbol>, LoaderError> {
        Ok(Vec::new())
    }

    fn data_segment(&self) -> (u64, u64) {
        self.data_segment
    }
}

/// Clonable in-memory sink for capturing guest stdout or trace output.
#[derive(Clone, Default)]
pub struct SharedBuf(Rc<RefCell<Vec<u8>>>);

impl SharedBuf {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn contents(&self) -> String {
        String::from_utf8_lossy(&self.0.borrow()).into_owned()
    }
}

impl Write for SharedBuf {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.0.borrow_mut().extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}
