use crate::vfs::{Error, FileHandle, FileSystem, INodeNum, Result, STDOUT_INODE};
use alloc::{collections::BTreeMap, string::String, vec::Vec};
use core::cmp::min;

struct TempFile {
    data: Vec<u8>,
    open_count: usize,
}

/// in-memory filesystem
///
/// A single flat directory of regular files, enough to back memory-mapped
/// regions and executables in tests. Open handles are counted per inode so
/// that leaks (a mapping that never releases its backing file) show up.
pub struct TempFs {
    inodes: BTreeMap<INodeNum, TempFile>,
    names: BTreeMap<String, INodeNum>,
    next_inode: INodeNum,
    write_count: u32,
}

const FIRST_INO: INodeNum = STDOUT_INODE + 1;

impl Default for TempFs {
    fn default() -> Self {
        Self::new()
    }
}

const NO_INODE: &str =
    "Couldn't find inode — either kernel is using filesystem incorrectly or we freed an inode when we shouldn't have.";

impl TempFs {
    pub fn new() -> TempFs {
        TempFs {
            inodes: BTreeMap::new(),
            names: BTreeMap::new(),
            next_inode: FIRST_INO,
            write_count: 0,
        }
    }

    /// Number of handles currently open on `inode`.
    pub fn open_count(&self, inode: INodeNum) -> usize {
        self.inodes.get(&inode).map_or(0, |f| f.open_count)
    }

    /// Number of successful write calls since creation.
    pub fn write_count(&self) -> u32 {
        self.write_count
    }

    fn get_file(&self, inode: INodeNum) -> Result<&TempFile> {
        self.inodes.get(&inode).ok_or(Error::NotFound)
    }
}

impl FileSystem for TempFs {
    fn create(&mut self, name: &str) -> Result<FileHandle> {
        if let Some(&inode) = self.names.get(name) {
            return self.open(inode);
        }
        let inode = self.next_inode;
        self.next_inode += 1;
        self.names.insert(String::from(name), inode);
        self.inodes.insert(
            inode,
            TempFile {
                data: Vec::new(),
                open_count: 1,
            },
        );
        Ok(FileHandle { inode })
    }

    fn lookup(&self, name: &str) -> Result<INodeNum> {
        self.names.get(name).copied().ok_or(Error::NotFound)
    }

    fn open(&mut self, inode: INodeNum) -> Result<FileHandle> {
        let file = self.inodes.get_mut(&inode).ok_or(Error::NotFound)?;
        file.open_count += 1;
        Ok(FileHandle { inode })
    }

    fn release(&mut self, inode: INodeNum) {
        let file = self.inodes.get_mut(&inode).expect(NO_INODE);
        assert!(file.open_count > 0, "release of a file that isn't open");
        file.open_count -= 1;
    }

    fn read(&self, file: FileHandle, offset: u64, buf: &mut [u8]) -> Result<usize> {
        let data = &self.get_file(file.inode)?.data;
        let offset = offset as usize;
        if offset >= data.len() {
            return Ok(0);
        }
        let n = min(buf.len(), data.len() - offset);
        buf[..n].copy_from_slice(&data[offset..offset + n]);
        Ok(n)
    }

    fn write(&mut self, file: FileHandle, offset: u64, buf: &[u8]) -> Result<usize> {
        let data = &mut self.inodes.get_mut(&file.inode).ok_or(Error::NotFound)?.data;
        let offset = offset as usize;
        let end = offset + buf.len();
        if end > data.len() {
            data.resize(end, 0);
        }
        data[offset..end].copy_from_slice(buf);
        self.write_count += 1;
        Ok(buf.len())
    }

    fn length(&self, file: FileHandle) -> Result<u64> {
        Ok(self.get_file(file.inode)?.data.len() as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn create_then_lookup() {
        let mut fs = TempFs::new();
        let file = fs.create("init").unwrap();
        assert_eq!(fs.lookup("init").unwrap(), file.inode);
        assert!(!file.is_console());
        assert_eq!(fs.lookup("missing"), Err(Error::NotFound));
    }

    #[test]
    fn create_existing_opens_without_truncating() {
        let mut fs = TempFs::new();
        let file = fs.create("data").unwrap();
        fs.write(file, 0, b"hello").unwrap();
        let again = fs.create("data").unwrap();
        assert_eq!(again.inode, file.inode);
        assert_eq!(fs.length(again).unwrap(), 5);
        assert_eq!(fs.open_count(file.inode), 2);
    }

    #[test]
    fn read_write_at_offsets() {
        let mut fs = TempFs::new();
        let file = fs.create("f").unwrap();
        fs.write(file, 0, b"abcdef").unwrap();
        fs.write(file, 2, b"XY").unwrap();

        let mut buf = [0u8; 6];
        assert_eq!(fs.read(file, 0, &mut buf).unwrap(), 6);
        assert_eq!(&buf, b"abXYef");

        // Short read at the tail, nothing past the end.
        let mut tail = [0u8; 4];
        assert_eq!(fs.read(file, 4, &mut tail).unwrap(), 2);
        assert_eq!(&tail[..2], b"ef");
        assert_eq!(fs.read(file, 100, &mut tail).unwrap(), 0);
    }

    #[test]
    fn write_past_end_zero_fills_gap() {
        let mut fs = TempFs::new();
        let file = fs.create("sparse").unwrap();
        fs.write(file, 8, b"z").unwrap();
        assert_eq!(fs.length(file).unwrap(), 9);
        let mut buf = [0xFFu8; 9];
        fs.read(file, 0, &mut buf).unwrap();
        assert_eq!(&buf[..8], &[0u8; 8]);
        assert_eq!(buf[8], b'z');
    }

    #[test]
    fn reopen_and_release_track_open_count() {
        let mut fs = TempFs::new();
        let file = fs.create("counted").unwrap();
        let dup = fs.reopen(file).unwrap();
        assert_eq!(dup.inode, file.inode);
        assert_eq!(fs.open_count(file.inode), 2);
        fs.release(file.inode);
        fs.release(file.inode);
        assert_eq!(fs.open_count(file.inode), 0);
        // Data survives; a flat teaching fs has no unlink.
        assert!(fs.lookup("counted").is_ok());
    }
}
