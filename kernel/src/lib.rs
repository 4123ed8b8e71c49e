#![cfg_attr(target_os = "none", no_std)]

//! Demand-paged virtual memory for KidneyOS.
//!
//! Each process owns an [`AddressSpace`](threading::process::AddressSpace): a
//! supplemental page table describing where every page's contents come from,
//! plus the hardware page directory. Physical frames are shared between all
//! processes through a single [`FrameTable`](mem::frame_table::FrameTable),
//! which evicts with a second-chance clock when the physical allocator runs
//! dry. Evicted anonymous pages go to swap; file-backed pages are re-read from
//! their file.

extern crate alloc;

pub mod config;
pub mod fs;
pub mod mem;
pub mod paging;
pub mod sync;
pub mod system;
pub mod threading;

#[cfg(test)]
mod testing;
