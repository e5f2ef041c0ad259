//! Positional-read file wrapper
//!
//! Many listeners share one open descriptor, so every read carries its own
//! offset. On unix this is `pread`; elsewhere the descriptor's seek position
//! is guarded by a mutex so concurrent readers cannot race it.

use std::fs::File;
use std::io;
use std::path::Path;

/// Shared read-only descriptor with positional reads.
#[derive(Debug)]
pub struct FileReader {
    #[cfg(unix)]
    file: File,
    #[cfg(not(unix))]
    file: std::sync::Mutex<File>,
    size: u64,
}

impl FileReader {
    /// Open a file read-only and capture its size.
    pub fn open(path: &Path) -> io::Result<Self> {
        let file = File::open(path)?;
        let size = file.metadata()?.len();
        Ok(Self {
            #[cfg(unix)]
            file,
            #[cfg(not(unix))]
            file: std::sync::Mutex::new(file),
            size,
        })
    }

    /// Size of the file at open time.
    pub fn size(&self) -> u64 {
        self.size
    }

    /// Read up to `buf.len()` bytes at `offset` without touching any shared
    /// seek position. Returns the number of bytes read; 0 means end of file.
    #[cfg(unix)]
    pub fn read_at(&self, buf: &mut [u8], offset: u64) -> io::Result<usize> {
        use std::os::unix::fs::FileExt;
        self.file.read_at(buf, offset)
    }

    #[cfg(not(unix))]
    pub fn read_at(&self, buf: &mut [u8], offset: u64) -> io::Result<usize> {
        use std::io::{Read, Seek, SeekFrom};
        let mut file = self.file.lock().unwrap();
        file.seek(SeekFrom::Start(offset))?;
        file.read(buf)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_read_at_offsets() {
        let mut tmp = tempfile::NamedTempFile::new().unwrap();
        tmp.write_all(b"0123456789").unwrap();
        tmp.flush().unwrap();

        let reader = FileReader::open(tmp.path()).unwrap();
        assert_eq!(reader.size(), 10);

        let mut buf = [0u8; 4];
        assert_eq!(reader.read_at(&mut buf, 3).unwrap(), 4);
        assert_eq!(&buf, b"3456");

        // reads at independent offsets do not interfere
        assert_eq!(reader.read_at(&mut buf, 0).unwrap(), 4);
        assert_eq!(&buf, b"0123");

        assert_eq!(reader.read_at(&mut buf, 10).unwrap(), 0);
    }
}
