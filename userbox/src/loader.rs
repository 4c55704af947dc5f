//! The parsed-binary interface the emulator consumes.
//!
//! A format-specific parser (ELF, ...) produces segments, an entry point, an
//! optional interpreter path, and symbol tables; the emulator drives mapping
//! and never looks at raw format structures itself.

use std::fmt;

use thiserror::Error;

use crate::cpu::Endian;

/// How an image expects to be placed in memory.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LoadType {
    /// Fixed addresses; mapped with zero load bias.
    Exec,
    /// Position independent; relocated by a host-chosen load bias.
    Dyn,
    /// Anything else. Not loadable as a main binary.
    Unknown,
}

/// Guest CPU architecture tag.
#[non_exhaustive]
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ArchId {
    X86_64,
    Aarch64,
}

impl fmt::Display for ArchId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ArchId::X86_64 => f.write_str("x86_64"),
            ArchId::Aarch64 => f.write_str("aarch64"),
        }
    }
}

/// Guest operating-system ABI tag.
#[non_exhaustive]
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum OsId {
    Linux,
}

impl fmt::Display for OsId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OsId::Linux => f.write_str("linux"),
        }
    }
}

/// A loadable chunk of an image.
///
/// `size` is the in-memory size and may exceed `data.len()`; the tail beyond
/// the file-backed bytes is zero-filled (BSS).
#[derive(Clone, Debug)]
pub struct SegmentData {
    pub addr: u64,
    pub size: u64,
    pub data: Vec<u8>,
}

/// A named range in a symbol table.
///
/// `end == 0` encodes "size unknown": the symbol extends upward without
/// bound for symbolication purposes.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Symbol {
    pub name: String,
    pub start: u64,
    pub end: u64,
}

/// Errors produced by binary parsers.
#[non_exhaustive]
#[derive(Error, Debug)]
pub enum LoaderError {
    #[error("failed to read {path}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("malformed image: {0}")]
    Parse(String),
    #[error("no loader recognizes this binary format")]
    UnknownFormat,
}

/// A parsed binary.
pub trait Loader {
    fn arch(&self) -> ArchId;
    fn os(&self) -> OsId;
    fn byte_order(&self) -> Endian;
    fn load_type(&self) -> LoadType;
    fn entry(&self) -> u64;
    fn segments(&self) -> Result<Vec<SegmentData>, LoaderError>;
    /// Path of the dynamic interpreter, if the image requests one.
    fn interp(&self) -> Option<String>;
    fn symbols(&self) -> Result<Vec<Symbol>, LoaderError>;
    /// `(start, end)` of the writable data region the program break grows
    /// from.
    fn data_segment(&self) -> (u64, u64);
}

/// Factory used to load an interpreter referenced by a main binary.
pub type ResolveFn = dyn Fn(&str) -> Result<Box<dyn Loader>, LoaderError>;
