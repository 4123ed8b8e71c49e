//! File mappings.
//!
//! `mmap` covers a whole file with shared file-backed pages that are loaded
//! lazily; `munmap` writes dirty pages back and drops them.

use super::page::{FileSpan, PageKind, VirtualPageEntry};
use crate::{
    fs::{self, with_file_lock, File, FileDescriptor},
    system::Vm,
    threading::process::{AddressSpace, Pages, Process},
};
use alloc::{sync::Arc, vec::Vec};
use kidneyos_shared::{
    mem::{is_page_aligned, is_user_vaddr, OFFSET, PAGE_FRAME_SIZE},
    println,
};
use kidneyos_syscalls::{EBADF, EEXIST, EINVAL, ENOMEM, MAP_FAILED, MUNMAP_ALL};

pub use kidneyos_syscalls::MapId;

#[derive(Debug)]
pub struct MappedRegion {
    id: MapId,
    file: Arc<dyn File>,
    /// Pages created so far, in address order.
    pages: Vec<usize>,
}

/// A process's mappings.
#[derive(Debug)]
pub struct MapList {
    regions: Vec<MappedRegion>,
    next_id: MapId,
}

impl Default for MapList {
    fn default() -> Self {
        Self {
            regions: Vec::new(),
            next_id: 1,
        }
    }
}

impl MapList {
    pub fn len(&self) -> usize {
        self.regions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.regions.is_empty()
    }

    fn region_mut(&mut self, id: MapId) -> Option<&mut MappedRegion> {
        self.regions.iter_mut().find(|region| region.id == id)
    }

    fn take(&mut self, which: Unmap) -> Vec<MappedRegion> {
        match which {
            Unmap::All => core::mem::take(&mut self.regions),
            Unmap::One(id) => {
                let (taken, kept): (Vec<_>, Vec<_>) = core::mem::take(&mut self.regions)
                    .into_iter()
                    .partition(|region| region.id == id);
                self.regions = kept;
                taken
            }
        }
    }
}

/// Which mappings `munmap` removes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Unmap {
    One(MapId),
    All,
}

impl From<MapId> for Unmap {
    fn from(id: MapId) -> Self {
        if id == MUNMAP_ALL {
            Self::All
        } else {
            Self::One(id)
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MmapError {
    BadFileDescriptor,
    /// Outside user memory, or the file would run into kernel memory.
    BadAddress,
    Misaligned,
    EmptyFile,
    /// Some page of the range already has an entry.
    Overlap,
    /// The process has used up its mapping ids.
    OutOfIds,
    Io(fs::Error),
}

impl core::fmt::Display for MmapError {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            Self::BadFileDescriptor => write!(f, "bad file descriptor"),
            Self::BadAddress => write!(f, "address outside user memory"),
            Self::Misaligned => write!(f, "address not page aligned"),
            Self::EmptyFile => write!(f, "file is empty"),
            Self::Overlap => write!(f, "range overlaps existing pages"),
            Self::OutOfIds => write!(f, "no mapping ids left"),
            Self::Io(e) => write!(f, "{e}"),
        }
    }
}

impl core::error::Error for MmapError {}

impl MmapError {
    pub fn to_isize(self) -> isize {
        match self {
            Self::BadFileDescriptor => EBADF,
            Self::BadAddress | Self::Misaligned | Self::EmptyFile => EINVAL,
            Self::Overlap => EEXIST,
            Self::OutOfIds => ENOMEM,
            Self::Io(e) => e.to_isize(),
        }
    }
}

/// Unmaps a region that is still being built if `mmap` bails out.
struct RegionGuard<'a> {
    vm: &'a Vm,
    space: &'a Arc<AddressSpace>,
    id: Option<MapId>,
}

impl RegionGuard<'_> {
    fn commit(mut self) -> MapId {
        self.id.take().unwrap_or(MAP_FAILED)
    }
}

impl Drop for RegionGuard<'_> {
    fn drop(&mut self) {
        if let Some(id) = self.id {
            self.vm.munmap(self.space, Unmap::One(id));
        }
    }
}

impl Vm {
    /// Map the whole file open as `fd` at `vaddr`.
    pub fn mmap(
        &self,
        process: &dyn Process,
        fd: FileDescriptor,
        vaddr: usize,
    ) -> Result<MapId, MmapError> {
        let file = process.file(fd).ok_or(MmapError::BadFileDescriptor)?;
        if !is_user_vaddr(vaddr) {
            return Err(MmapError::BadAddress);
        }
        if !is_page_aligned(vaddr) {
            return Err(MmapError::Misaligned);
        }

        let (file, length) = with_file_lock(|| -> fs::Result<_> {
            let file = file.reopen()?;
            let length = file.length();
            Ok((file, length))
        })
        .map_err(MmapError::Io)?;

        let end = usize::try_from(length)
            .ok()
            .and_then(|length| vaddr.checked_add(length));
        let (length, end) = match end {
            _ if length == 0 => Err(MmapError::EmptyFile),
            Some(end) if end <= OFFSET => Ok((end - vaddr, end)),
            _ => Err(MmapError::BadAddress),
        }
        .inspect_err(|_| with_file_lock(|| file.close()))?;

        let space = process.address_space();
        let id = {
            let mut maps = space.mappings();
            let id = maps.next_id;
            id.checked_add(1).map(|next| {
                maps.next_id = next;
                maps.regions.push(MappedRegion {
                    id,
                    file: Arc::clone(&file),
                    pages: Vec::new(),
                });
                id
            })
        };
        let Some(id) = id else {
            with_file_lock(|| file.close());
            return Err(MmapError::OutOfIds);
        };
        let guard = RegionGuard {
            vm: self,
            space,
            id: Some(id),
        };

        for (i, page) in (vaddr..end).step_by(PAGE_FRAME_SIZE).enumerate() {
            let offset = i * PAGE_FRAME_SIZE;
            let read_bytes = PAGE_FRAME_SIZE.min(length - offset);
            let span = FileSpan {
                file: Arc::clone(&file),
                offset: offset as u64,
                read_bytes,
                zero_bytes: PAGE_FRAME_SIZE - read_bytes,
                shared: true,
            };

            if !space.insert_page(VirtualPageEntry::file_backed(page, span, true)) {
                if self.config.trace {
                    println!("mmap: {page:#x} already mapped in pid {}", space.pid());
                }
                return Err(MmapError::Overlap);
            }
            if let Some(region) = space.mappings().region_mut(id) {
                region.pages.push(page);
            }
        }

        if self.config.trace {
            println!(
                "mmap: pid {} mapped {length} bytes at {vaddr:#x} as {id}",
                space.pid()
            );
        }
        Ok(guard.commit())
    }

    /// Remove mappings of `space`, writing dirty pages back to their files.
    /// Returns how many regions were removed.
    pub fn munmap(&self, space: &Arc<AddressSpace>, which: Unmap) -> usize {
        let regions = space.mappings().take(which);

        for region in &regions {
            for &page in &region.pages {
                self.unmap_page(space, page);
            }
            with_file_lock(|| region.file.close());

            if self.config.trace {
                println!("munmap: pid {} unmapped {}", space.pid(), region.id);
            }
        }

        regions.len()
    }

    fn unmap_page(&self, space: &Arc<AddressSpace>, page: usize) {
        let mut frames = self.frames.lock();
        let mut pages = space.pages();
        let Pages { page_dir, spt } = &mut *pages;

        let Some(entry) = spt.remove(page) else {
            return;
        };

        if let Some(id) = entry.frame() {
            if let PageKind::FileBacked(span) = entry.kind() {
                if page_dir.is_dirty(page) {
                    // SAFETY: the frame table is locked, so the frame stays
                    // put, and the page lock keeps user copies out.
                    let bytes = unsafe { frames.frame(id).as_slice() };
                    if span.write_back(page, bytes) {
                        frames.stats_mut().write_backs += 1;
                    }
                }
            }
            page_dir.clear(page);
            frames.release(id);
        } else if let Some(slot) = entry.swap_slot() {
            self.swap.lock().free(slot);
        }
    }

    /// `mmap` for the syscall layer: the mapping id, or `MAP_FAILED`.
    pub fn sys_mmap(&self, process: &dyn Process, fd: FileDescriptor, addr: usize) -> isize {
        match self.mmap(process, fd, addr) {
            Ok(id) => id as isize,
            Err(e) => {
                if self.config.trace {
                    println!("{}: mmap({fd}, {addr:#x}) failed: {e}", process.name());
                }
                MAP_FAILED as isize
            }
        }
    }

    /// `munmap` for the syscall layer. Unknown ids are rejected; `-1` never is.
    pub fn sys_munmap(&self, process: &dyn Process, id: MapId) -> isize {
        let which = Unmap::from(id);
        match self.munmap(process.address_space(), which) {
            0 if which != Unmap::All => -EINVAL,
            _ => 0,
        }
    }
}
