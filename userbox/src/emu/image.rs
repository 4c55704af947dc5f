//! Image mapping: drive the address-space mapper over a parsed binary and,
//! when one is requested, its dynamic interpreter.

use log::debug;

use crate::cpu::Cpu;
use crate::loader::{LoadType, Loader, LoaderError, SegmentData};
use crate::mem;

use super::{EmuError, Process, DYN_LOAD_HINT};

/// Where an image (and its interpreter) ended up in guest memory.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct LoadedImage {
    /// Load bias of the main binary; zero for fixed-address images.
    pub base: u64,
    /// Address control is handed to on start: the interpreter's entry when
    /// one was loaded, the binary's own otherwise.
    pub entry: u64,
    /// The binary's own entry point, biased. Always the program's entry even
    /// when an interpreter runs first.
    pub bin_entry: u64,
    /// Load bias of the interpreter, or zero when there is none.
    pub interp_base: u64,
}

/// Owned snapshot of everything mapping needs from a loader, so no borrow of
/// the loader is held across engine calls.
struct ImageInfo {
    load_type: LoadType,
    entry: u64,
    interp: Option<String>,
    segments: Vec<SegmentData>,
}

impl ImageInfo {
    fn snapshot(loader: &dyn Loader) -> Result<Self, LoaderError> {
        Ok(ImageInfo {
            load_type: loader.load_type(),
            entry: loader.entry(),
            interp: loader.interp(),
            segments: loader.segments()?,
        })
    }
}

impl<C: Cpu> Process<C> {
    /// Map the main binary (and its interpreter, if any) into the engine.
    pub(super) fn map_binary(&mut self, cpu: &mut C) -> Result<LoadedImage, EmuError> {
        let info = ImageInfo::snapshot(self.loader.as_ref())?;
        self.map_image(cpu, info, true)
    }

    fn map_image(
        &mut self,
        cpu: &mut C,
        info: ImageInfo,
        main: bool,
    ) -> Result<LoadedImage, EmuError> {
        let dynamic = match info.load_type {
            LoadType::Exec => false,
            LoadType::Dyn => true,
            LoadType::Unknown => {
                // An interpreter is expected to be relocatable; only a main
                // binary of unknown type is rejected outright.
                if main {
                    return Err(EmuError::UnsupportedLoadType);
                }
                false
            }
        };

        let merged = mem::merge_segments(
            info.segments.iter().map(|s| (s.addr, s.size)),
            cpu.page_size(),
        );

        // Map the coalesced ranges first; for a relocatable image the range
        // starting at zero picks the load bias and everything else follows
        // it.
        let mut load_bias = 0u64;
        for range in &merged {
            if dynamic && range.start == 0 && load_bias == 0 {
                load_bias = self.mmap(cpu, DYN_LOAD_HINT, range.size())?;
            } else {
                self.mem_map(cpu, load_bias + range.start, range.size())?;
            }
        }

        // Only then write the original segments' payloads, so bytes landing
        // in a neighbouring segment's aligned tail hit mapped pages.
        for seg in &info.segments {
            if !seg.data.is_empty() {
                cpu.mem_write(load_bias + seg.addr, &seg.data)?;
            }
        }

        let entry = load_bias + info.entry;
        debug!(
            "mapped {} image: bias 0x{load_bias:x}, entry 0x{entry:x}, {} segment(s)",
            if main { "main" } else { "interpreter" },
            info.segments.len(),
        );

        let Some(interp) = info.interp else {
            return Ok(LoadedImage { base: load_bias, entry, bin_entry: entry, interp_base: 0 });
        };

        let path = self.prefix_path(&interp, true);
        debug!("loading interpreter {interp} from {path}");
        let interp_loader = match self.resolver.as_ref() {
            Some(resolve) => resolve(&path)?,
            None => return Err(EmuError::NoResolver(interp)),
        };
        let interp_info = ImageInfo::snapshot(interp_loader.as_ref())?;
        let sub = self.map_image(cpu, interp_info, false)?;
        self.interp_loader = Some(interp_loader);
        Ok(LoadedImage {
            base: load_bias,
            entry: sub.entry,
            bin_entry: entry,
            interp_base: sub.base,
        })
    }
}
