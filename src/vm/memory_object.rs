//! Memory Objects - File Service Interface
//!
//! The VM reads lazily loaded segments and file mappings through
//! [`BackingFile`]. The file system provides the real implementation;
//! [`MemFile`] is an in-memory file used by tests and by ramdisk images.
//!
//! Each mapping holds its own handle (obtained with `reopen`) so closing the
//! descriptor that created it does not tear the mapping down. Dropping the
//! last `Arc` closes the handle.

use alloc::sync::Arc;
use alloc::vec::Vec;
use core::sync::atomic::{AtomicU32, Ordering};
use spin::Mutex;

/// File handle as seen by the VM
pub trait BackingFile: Send + Sync {
    /// Current file length in bytes
    fn length(&self) -> u64;

    /// Read into `buf` starting at `offset`, returning bytes read
    fn read_at(&self, buf: &mut [u8], offset: u64) -> usize;

    /// Write `buf` at `offset`, returning bytes written (0 while denied)
    fn write_at(&self, buf: &[u8], offset: u64) -> usize;

    /// Independent handle to the same underlying file
    fn reopen(&self) -> Arc<dyn BackingFile>;

    /// Refuse writes until a matching `allow_write`
    fn deny_write(&self);

    /// Undo one `deny_write`
    fn allow_write(&self);

    /// Whether writes are currently refused
    fn write_denied(&self) -> bool;
}

/// Shared state behind every handle of a [`MemFile`]
#[derive(Debug, Default)]
struct MemInode {
    data: Mutex<Vec<u8>>,
    deny_count: AtomicU32,
}

/// In-memory file
#[derive(Debug, Clone, Default)]
pub struct MemFile {
    inode: Arc<MemInode>,
}

impl MemFile {
    /// Create a file holding `contents`
    pub fn new(contents: &[u8]) -> Self {
        Self {
            inode: Arc::new(MemInode {
                data: Mutex::new(contents.to_vec()),
                deny_count: AtomicU32::new(0),
            }),
        }
    }

    /// Handle to this file as a trait object
    pub fn handle(&self) -> Arc<dyn BackingFile> {
        Arc::new(self.clone())
    }

    /// Copy of the whole file
    pub fn contents(&self) -> Vec<u8> {
        self.inode.data.lock().clone()
    }
}

impl BackingFile for MemFile {
    fn length(&self) -> u64 {
        self.inode.data.lock().len() as u64
    }

    fn read_at(&self, buf: &mut [u8], offset: u64) -> usize {
        let data = self.inode.data.lock();
        let start = match usize::try_from(offset) {
            Ok(start) if start < data.len() => start,
            _ => return 0,
        };
        let count = buf.len().min(data.len() - start);
        buf[..count].copy_from_slice(&data[start..start + count]);
        count
    }

    fn write_at(&self, buf: &[u8], offset: u64) -> usize {
        if self.write_denied() {
            return 0;
        }

        let mut data = self.inode.data.lock();
        let start = match usize::try_from(offset) {
            Ok(start) if start <= data.len() => start,
            _ => return 0,
        };
        // Writes never grow the file
        let count = buf.len().min(data.len() - start);
        data[start..start + count].copy_from_slice(&buf[..count]);
        count
    }

    fn reopen(&self) -> Arc<dyn BackingFile> {
        self.handle()
    }

    fn deny_write(&self) {
        self.inode.deny_count.fetch_add(1, Ordering::SeqCst);
    }

    fn allow_write(&self) {
        let _ = self
            .inode
            .deny_count
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1));
    }

    fn write_denied(&self) -> bool {
        self.inode.deny_count.load(Ordering::SeqCst) > 0
    }
}
