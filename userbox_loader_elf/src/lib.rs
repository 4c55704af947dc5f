//! ELF parsing behind the userbox loader interface.
//!
//! Parsing happens once, up front: the constructor walks the program headers
//! and symbol tables with `goblin` and keeps an owned snapshot, so a loaded
//! [`ElfFile`] holds no borrow of the input bytes and can be stored inside
//! the emulator for the lifetime of the process.

use std::path::Path;

use goblin::elf::{header, program_header, Elf};
use log::debug;
use thiserror::Error;

use userbox::cpu::Endian;
use userbox::loader::{ArchId, LoadType, Loader, LoaderError, OsId, SegmentData, Symbol};

/// Errors from opening or parsing an ELF image.
#[non_exhaustive]
#[derive(Error, Debug)]
pub enum ElfError {
    #[error("failed to read {path}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("malformed ELF: {0}")]
    Parse(#[from] goblin::error::Error),
    #[error("segment at {addr:#x} extends past the end of the file")]
    TruncatedSegment { addr: u64 },
    #[error("unsupported machine {0:#x}")]
    UnsupportedMachine(u16),
}

impl From<ElfError> for LoaderError {
    fn from(err: ElfError) -> Self {
        match err {
            ElfError::Io { path, source } => LoaderError::Io { path, source },
            other => LoaderError::Parse(other.to_string()),
        }
    }
}

/// A parsed ELF executable or shared object.
pub struct ElfFile {
    load_type: LoadType,
    arch: ArchId,
    byte_order: Endian,
    entry: u64,
    interp: Option<String>,
    segments: Vec<SegmentData>,
    symbols: Vec<Symbol>,
    data_segment: (u64, u64),
}

impl ElfFile {
    /// Read and parse the file at `path`.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, ElfError> {
        let path = path.as_ref();
        let bytes = std::fs::read(path).map_err(|source| ElfError::Io {
            path: path.display().to_string(),
            source,
        })?;
        Self::parse(&bytes)
    }

    /// Parse an in-memory image.
    pub fn parse(bytes: &[u8]) -> Result<Self, ElfError> {
        let elf = Elf::parse(bytes)?;

        let load_type = match elf.header.e_type {
            header::ET_EXEC => LoadType::Exec,
            header::ET_DYN => LoadType::Dyn,
            _ => LoadType::Unknown,
        };
        let arch = match elf.header.e_machine {
            header::EM_X86_64 => ArchId::X86_64,
            header::EM_AARCH64 => ArchId::Aarch64,
            machine => return Err(ElfError::UnsupportedMachine(machine)),
        };
        let byte_order = if elf.little_endian { Endian::Little } else { Endian::Big };

        let mut segments = Vec::new();
        let mut data_segment = (0u64, 0u64);
        for ph in &elf.program_headers {
            if ph.p_type != program_header::PT_LOAD {
                continue;
            }
            let offset = ph.p_offset as usize;
            let filesz = ph.p_filesz as usize;
            let end = offset.checked_add(filesz).filter(|&e| e <= bytes.len());
            let Some(end) = end else {
                return Err(ElfError::TruncatedSegment { addr: ph.p_vaddr });
            };
            segments.push(SegmentData {
                addr: ph.p_vaddr,
                size: ph.p_memsz,
                data: bytes[offset..end].to_vec(),
            });
            // The break grows from the highest writable segment.
            if ph.p_flags & program_header::PF_W != 0
                && ph.p_vaddr + ph.p_memsz > data_segment.1
            {
                data_segment = (ph.p_vaddr, ph.p_vaddr + ph.p_memsz);
            }
        }

        let symbols = collect_symbols(&elf);
        let interp = elf.interpreter.map(str::to_owned);
        debug!(
            "parsed ELF: {:?} {}, {} segment(s), {} symbol(s), interp {:?}",
            load_type,
            arch,
            segments.len(),
            symbols.len(),
            interp,
        );

        Ok(ElfFile {
            load_type,
            arch,
            byte_order,
            entry: elf.header.e_entry,
            interp,
            segments,
            symbols,
            data_segment,
        })
    }
}

/// Prefer `.symtab`; stripped binaries usually still carry `.dynsym`.
fn collect_symbols(elf: &Elf<'_>) -> Vec<Symbol> {
    let tables = [(&elf.syms, &elf.strtab), (&elf.dynsyms, &elf.dynstrtab)];
    for (syms, strtab) in tables {
        let mut out = Vec::new();
        for sym in syms.iter() {
            let Some(name) = strtab.get_at(sym.st_name) else {
                continue;
            };
            if name.is_empty() {
                continue;
            }
            out.push(Symbol {
                name: name.to_owned(),
                start: sym.st_value,
                end: if sym.st_size == 0 { 0 } else { sym.st_value + sym.st_size },
            });
        }
        if !out.is_empty() {
            return out;
        }
    }
    Vec::new()
}

impl Loader for ElfFile {
    fn arch(&self) -> ArchId {
        self.arch
    }

    fn os(&self) -> OsId {
        OsId::Linux
    }

    fn byte_order(&self) -> Endian {
        self.byte_order
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
        self.interp.clone()
    }

    fn symbols(&self) -> Result<Vec<Symbol>, LoaderError> {
        Ok(self.symbols.clone())
    }

    fn data_segment(&self) -> (u64, u64) {
        self.data_segment
    }
}

/// Load the file at `path` as a boxed loader.
pub fn load_file(path: impl AsRef<Path>) -> Result<Box<dyn Loader>, LoaderError> {
    let file = ElfFile::open(path)?;
    Ok(Box::new(file))
}

/// A resolver for [`userbox::Emulator::with_resolver`], loading interpreter
/// paths as ELF files.
#[must_use]
pub fn resolver() -> Box<userbox::loader::ResolveFn> {
    Box::new(|path: &str| load_file(path))
}
