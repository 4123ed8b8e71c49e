//! Swap backing store.
//!
//! The swap area is a run of sectors on a block device. Its first page holds
//! a [`SwapHeader`]; every page after that is one slot. Slots are handed out
//! from a bitmap and hold exactly one frame's worth of bytes.

use alloc::{boxed::Box, vec, vec::Vec};
use core::ops::Range;
use kidneyos_shared::{
    bit_array::BitArray, eprintln, mem::PAGE_FRAME_SIZE, println, sizes::SECTOR_SIZE,
};
use kidneyos_syscalls::{EINVAL, ENOSPC};
use zerocopy::{AsBytes, FromBytes, FromZeroes};

pub type BlockSector = u32;

const SECTOR: usize = SECTOR_SIZE as usize;
pub const SECTORS_PER_PAGE: u32 = (PAGE_FRAME_SIZE / SECTOR) as u32;

const MAGIC: [u8; 8] = *b"KIDNSWAP";
const VERSION: u32 = 1;

/// A block device holding the swap area. `buf` is always one sector long.
pub trait SwapDevice: Send {
    fn read(&mut self, sector: BlockSector, buf: &mut [u8]);
    fn write(&mut self, sector: BlockSector, buf: &[u8]);
    /// Size of the device in sectors.
    fn size(&self) -> BlockSector;
}

/// A swap device backed by kernel heap memory.
pub struct RamDisk {
    sectors: Vec<[u8; SECTOR]>,
    reads: usize,
    writes: usize,
}

impl RamDisk {
    pub fn new(sectors: BlockSector) -> Self {
        Self {
            sectors: vec![[0; SECTOR]; sectors as usize],
            reads: 0,
            writes: 0,
        }
    }

    /// Sectors read so far.
    pub fn reads(&self) -> usize {
        self.reads
    }

    /// Sectors written so far.
    pub fn writes(&self) -> usize {
        self.writes
    }

    fn sector(&mut self, sector: BlockSector) -> &mut [u8; SECTOR] {
        let count = self.sectors.len();
        self.sectors
            .get_mut(sector as usize)
            .unwrap_or_else(|| panic!("sector {sector} past end of {count}-sector ram disk"))
    }
}

impl SwapDevice for RamDisk {
    fn read(&mut self, sector: BlockSector, buf: &mut [u8]) {
        buf.copy_from_slice(self.sector(sector));
        self.reads += 1;
    }

    fn write(&mut self, sector: BlockSector, buf: &[u8]) {
        self.sector(sector).copy_from_slice(buf);
        self.writes += 1;
    }

    fn size(&self) -> BlockSector {
        self.sectors.len() as BlockSector
    }
}

/// Index of a page-sized slot in the swap area.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SwapSlot(u32);

impl SwapSlot {
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

#[derive(FromZeroes, FromBytes, AsBytes)]
#[repr(C)]
struct SwapHeader {
    magic: [u8; 8],
    version: u32,
    slots: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SwapError {
    /// The swap area does not start with a valid header.
    BadSignature,
    /// The device cannot hold the swap area, or the area has no room for a slot.
    DeviceTooSmall,
}

impl core::fmt::Display for SwapError {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            Self::BadSignature => write!(f, "no swap signature"),
            Self::DeviceTooSmall => write!(f, "swap device too small"),
        }
    }
}

impl core::error::Error for SwapError {}

impl SwapError {
    pub fn to_isize(self) -> isize {
        match self {
            Self::BadSignature => EINVAL,
            Self::DeviceTooSmall => ENOSPC,
        }
    }
}

pub struct SwapSpace {
    device: Box<dyn SwapDevice>,
    area: Range<BlockSector>,
    used: BitArray,
}

impl SwapSpace {
    fn slots_in(device: &dyn SwapDevice, area: &Range<BlockSector>) -> Result<u32, SwapError> {
        if area.end > device.size() || area.start > area.end {
            return Err(SwapError::DeviceTooSmall);
        }
        match (area.end - area.start) / SECTORS_PER_PAGE {
            0 | 1 => Err(SwapError::DeviceTooSmall),
            pages => Ok(pages - 1),
        }
    }

    /// Write a fresh header over `area` and take it over as swap.
    pub fn format(
        mut device: Box<dyn SwapDevice>,
        area: Range<BlockSector>,
    ) -> Result<Self, SwapError> {
        let slots = Self::slots_in(device.as_ref(), &area)?;

        let header = SwapHeader {
            magic: MAGIC,
            version: VERSION,
            slots,
        };
        let mut sector = [0u8; SECTOR];
        sector[..core::mem::size_of::<SwapHeader>()].copy_from_slice(header.as_bytes());
        device.write(area.start, &sector);

        println!("swap: formatted {} slots at sector {}", slots, area.start);

        Ok(Self {
            device,
            area,
            used: BitArray::new(slots as usize),
        })
    }

    fn read_header(
        device: &mut dyn SwapDevice,
        area: &Range<BlockSector>,
    ) -> Result<u32, SwapError> {
        let capacity = Self::slots_in(device, area)?;

        let mut sector = [0u8; SECTOR];
        device.read(area.start, &mut sector);
        let header = SwapHeader::read_from_prefix(&sector[..]).ok_or(SwapError::BadSignature)?;

        if header.magic != MAGIC || header.version != VERSION {
            return Err(SwapError::BadSignature);
        }
        if header.slots == 0 || header.slots > capacity {
            return Err(SwapError::BadSignature);
        }
        Ok(header.slots)
    }

    /// Take over an area previously prepared with [`SwapSpace::format`].
    /// Slot contents from before are discarded.
    pub fn attach(
        mut device: Box<dyn SwapDevice>,
        area: Range<BlockSector>,
    ) -> Result<Self, SwapError> {
        let slots = Self::read_header(device.as_mut(), &area)?;

        println!("swap: attached {} slots at sector {}", slots, area.start);

        Ok(Self {
            device,
            area,
            used: BitArray::new(slots as usize),
        })
    }

    /// [`SwapSpace::attach`], formatting the area first if it has no header.
    pub fn open(
        mut device: Box<dyn SwapDevice>,
        area: Range<BlockSector>,
    ) -> Result<Self, SwapError> {
        match Self::read_header(device.as_mut(), &area) {
            Ok(_) => Self::attach(device, area),
            Err(SwapError::BadSignature) => {
                println!("swap: no signature at sector {}", area.start);
                Self::format(device, area)
            }
            Err(e) => Err(e),
        }
    }

    fn first_sector(&self, slot: SwapSlot) -> BlockSector {
        self.area.start + (slot.0 + 1) * SECTORS_PER_PAGE
    }

    fn check_in_use(&self, slot: SwapSlot) {
        assert!(
            slot.index() < self.used.len() && self.used.get(slot.index()),
            "swap slot {} is not in use",
            slot.0
        );
    }

    /// Store one page in a free slot.
    ///
    /// Running out of slots is fatal: the caller needs a frame that cannot be
    /// produced any other way.
    pub fn swap_out(&mut self, page: &[u8]) -> SwapSlot {
        assert_eq!(page.len(), PAGE_FRAME_SIZE);

        let Some(index) = self.used.first_clear() else {
            eprintln!("swap: all {} slots in use", self.used.len());
            panic!("out of swap space");
        };
        self.used.set(index, true);
        let slot = SwapSlot(index as u32);

        let first = self.first_sector(slot);
        for (i, chunk) in page.chunks_exact(SECTOR).enumerate() {
            self.device.write(first + i as BlockSector, chunk);
        }

        slot
    }

    /// Copy `slot` back into `page` and free the slot.
    pub fn swap_in(&mut self, slot: SwapSlot, page: &mut [u8]) {
        assert_eq!(page.len(), PAGE_FRAME_SIZE);
        self.check_in_use(slot);

        let first = self.first_sector(slot);
        for (i, chunk) in page.chunks_exact_mut(SECTOR).enumerate() {
            self.device.read(first + i as BlockSector, chunk);
        }

        self.used.set(slot.index(), false);
    }

    /// Discard `slot` without reading it.
    pub fn free(&mut self, slot: SwapSlot) {
        self.check_in_use(slot);
        self.used.set(slot.index(), false);
    }

    pub fn capacity(&self) -> usize {
        self.used.len()
    }

    pub fn in_use(&self) -> usize {
        self.used.count_ones()
    }
}
