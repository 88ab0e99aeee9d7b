//! File collaborators.
//!
//! The kernel core only needs to look files up by path and read them at
//! an offset. [`RamFs`] is an in-memory file system for boot images and
//! tests.

use alloc::string::String;
use alloc::sync::Arc;
use alloc::vec::Vec;
use hashbrown::HashMap;
use spin::Mutex;

use crate::error::{KernelError, KernelResult};

/// A readable file.
pub trait File {
    /// Length in bytes.
    fn len(&self) -> u32;

    /// Read up to `buf.len()` bytes at `offset`, returning the count.
    fn read_at(&self, offset: u32, buf: &mut [u8]) -> usize;
}

/// A directory of files.
pub trait FileSystem {
    fn lookup_file(&self, path: &str) -> Option<Arc<dyn File>>;
}

/// A file plus a seek position.
pub struct OpenFile {
    file: Arc<dyn File>,
    offset: Mutex<u32>,
}

impl OpenFile {
    pub fn new(file: Arc<dyn File>) -> Self {
        OpenFile {
            file,
            offset: Mutex::new(0),
        }
    }

    pub fn len(&self) -> u32 {
        self.file.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Move the position; positions past the end are clamped.
    pub fn seek(&self, pos: u32) -> u32 {
        let pos = pos.min(self.file.len());
        *self.offset.lock() = pos;
        pos
    }

    pub fn position(&self) -> u32 {
        *self.offset.lock()
    }

    /// Read at the current position and advance it.
    pub fn read(&self, buf: &mut [u8]) -> usize {
        let mut offset = self.offset.lock();
        let n = self.file.read_at(*offset, buf);
        *offset += n as u32;
        n
    }

    /// Fill `buf` completely or fail.
    pub fn read_fully(&self, buf: &mut [u8]) -> KernelResult<()> {
        let mut done = 0;
        while done < buf.len() {
            let n = self.read(&mut buf[done..]);
            if n == 0 {
                return Err(KernelError::BadExecutable);
            }
            done += n;
        }
        Ok(())
    }
}

/// In-memory file contents.
pub struct RamFile {
    bytes: Vec<u8>,
}

impl RamFile {
    pub fn new(bytes: Vec<u8>) -> Self {
        RamFile { bytes }
    }
}

impl File for RamFile {
    fn len(&self) -> u32 {
        self.bytes.len() as u32
    }

    fn read_at(&self, offset: u32, buf: &mut [u8]) -> usize {
        let start = (offset as usize).min(self.bytes.len());
        let n = buf.len().min(self.bytes.len() - start);
        buf[..n].copy_from_slice(&self.bytes[start..start + n]);
        n
    }
}

/// Flat in-memory file system keyed by path.
pub struct RamFs {
    files: Mutex<HashMap<String, Arc<RamFile>>>,
}

impl RamFs {
    pub fn new() -> Self {
        RamFs {
            files: Mutex::new(HashMap::new()),
        }
    }

    /// Add or replace a file.
    pub fn insert(&self, path: &str, bytes: Vec<u8>) {
        let key = String::from(Self::normalize(path));
        self.files.lock().insert(key, Arc::new(RamFile::new(bytes)));
    }

    pub fn len(&self) -> usize {
        self.files.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn normalize(path: &str) -> &str {
        path.trim_start_matches('/')
    }
}

impl Default for RamFs {
    fn default() -> Self {
        Self::new()
    }
}

impl FileSystem for RamFs {
    fn lookup_file(&self, path: &str) -> Option<Arc<dyn File>> {
        let file = self.files.lock().get(Self::normalize(path)).cloned()?;
        Some(file)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloc::vec;

    fn fs() -> RamFs {
        let fs = RamFs::new();
        fs.insert("/etc/motd", b"hello, kestrel".to_vec());
        fs
    }

    #[test]
    fn test_lookup_normalizes_leading_slash() {
        let fs = fs();
        assert!(fs.lookup_file("etc/motd").is_some());
        assert!(fs.lookup_file("/etc/motd").is_some());
        assert!(fs.lookup_file("/etc/passwd").is_none());
    }

    #[test]
    fn test_read_seek() {
        let file = OpenFile::new(fs().lookup_file("/etc/motd").unwrap());
        assert_eq!(file.len(), 14);
        let mut buf = [0u8; 5];
        assert_eq!(file.read(&mut buf), 5);
        assert_eq!(&buf, b"hello");
        assert_eq!(file.seek(7), 7);
        assert_eq!(file.read(&mut buf), 5);
        assert_eq!(&buf, b"kestr");
        assert_eq!(file.seek(100), 14);
        assert_eq!(file.read(&mut buf), 0);
    }

    #[test]
    fn test_read_fully_fails_at_eof() {
        let file = OpenFile::new(fs().lookup_file("/etc/motd").unwrap());
        let mut buf = vec![0u8; 20];
        assert_eq!(file.read_fully(&mut buf), Err(KernelError::BadExecutable));
        file.seek(0);
        let mut buf = vec![0u8; 14];
        assert_eq!(file.read_fully(&mut buf), Ok(()));
    }
}
