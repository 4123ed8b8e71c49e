use super::{Error, File, Result};
use crate::sync::Mutex;
use alloc::{sync::Arc, vec::Vec};
use core::sync::atomic::{AtomicBool, Ordering};

#[derive(Debug)]
struct Inode {
    data: Vec<u8>,
    open_count: usize,
}

/// A file whose contents live on the kernel heap.
///
/// Handles created with [`File::reopen`] share the same contents.
#[derive(Debug)]
pub struct MemFile {
    inode: Arc<Mutex<Inode>>,
    closed: AtomicBool,
}

impl MemFile {
    pub fn new(data: Vec<u8>) -> Arc<Self> {
        Arc::new(Self {
            inode: Arc::new(Mutex::new(Inode {
                data,
                open_count: 1,
            })),
            closed: AtomicBool::new(false),
        })
    }

    pub fn contents(&self) -> Vec<u8> {
        self.inode.lock().data.clone()
    }

    /// Open handles to this file's contents, across all reopens.
    pub fn open_count(&self) -> usize {
        self.inode.lock().open_count
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    fn check_open(&self) -> Result<()> {
        if self.is_closed() {
            Err(Error::Closed)
        } else {
            Ok(())
        }
    }
}

impl File for MemFile {
    fn read_at(&self, buf: &mut [u8], offset: u64) -> Result<usize> {
        self.check_open()?;
        let inode = self.inode.lock();
        let Ok(start) = usize::try_from(offset) else {
            return Ok(0);
        };
        if start >= inode.data.len() {
            return Ok(0);
        }
        let n = buf.len().min(inode.data.len() - start);
        buf[..n].copy_from_slice(&inode.data[start..start + n]);
        Ok(n)
    }

    fn write_at(&self, buf: &[u8], offset: u64) -> Result<usize> {
        self.check_open()?;
        let mut inode = self.inode.lock();
        let Ok(start) = usize::try_from(offset) else {
            return Ok(0);
        };
        if start >= inode.data.len() {
            return Ok(0);
        }
        let n = buf.len().min(inode.data.len() - start);
        inode.data[start..start + n].copy_from_slice(&buf[..n]);
        Ok(n)
    }

    fn length(&self) -> u64 {
        self.inode.lock().data.len() as u64
    }

    fn reopen(&self) -> Result<Arc<dyn File>> {
        self.check_open()?;
        self.inode.lock().open_count += 1;
        Ok(Arc::new(Self {
            inode: Arc::clone(&self.inode),
            closed: AtomicBool::new(false),
        }))
    }

    fn close(&self) {
        if !self.closed.swap(true, Ordering::AcqRel) {
            self.inode.lock().open_count -= 1;
        }
    }
}
