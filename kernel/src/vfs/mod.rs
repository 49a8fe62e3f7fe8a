pub mod tempfs;

pub type INodeNum = u64;

/// Inode numbers 0 and 1 stand for the console streams. They are never
/// handed out by a filesystem; the memory manager refuses to map them.
pub const STDIN_INODE: INodeNum = 0;
pub const STDOUT_INODE: INodeNum = 1;

/// Represents an open file
///
/// **IMPORTANT**: the kernel must call [`FileSystem::release`] when it closes
/// its last open handle to an inode. Otherwise, the filesystem will have to
/// keep around the file's data indefinitely!
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FileHandle {
    /// inode number of this file
    pub inode: INodeNum,
}

impl FileHandle {
    pub fn is_console(&self) -> bool {
        self.inode == STDIN_INODE || self.inode == STDOUT_INODE
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Error {
    /// file not found
    NotFound,
    /// no space left on device
    NoSpace,
    /// Target destination already exists
    Exists,
    /// underlying device failed mid-operation
    Io,
}

impl core::fmt::Display for Error {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            Self::NotFound => write!(f, "not found"),
            Self::NoSpace => write!(f, "no space left on device"),
            Self::Exists => write!(f, "destination already exists"),
            Self::Io => write!(f, "i/o error"),
        }
    }
}

impl core::error::Error for Error {}

pub type Result<T> = core::result::Result<T, Error>;

/// The slice of the filesystem the memory manager consumes: open files are
/// read and written at byte offsets, can be reopened (an independent
/// reference to the same inode), and report their length. The filesystem is
/// not internally thread-safe; callers hold its lock across each call.
pub trait FileSystem {
    /// Create a new empty file, or open it if it already exists (without
    /// truncating).
    fn create(&mut self, name: &str) -> Result<FileHandle>;
    /// Look up a file by name.
    fn lookup(&self, name: &str) -> Result<INodeNum>;
    /// Open an existing file.
    fn open(&mut self, inode: INodeNum) -> Result<FileHandle>;
    /// Obtain an independent handle to an already-open file. The new handle
    /// stays valid after the original is released.
    fn reopen(&mut self, file: FileHandle) -> Result<FileHandle> {
        self.open(file.inode)
    }
    /// Indicate that one handle to an open file is no longer in use.
    fn release(&mut self, inode: INodeNum);
    /// Read from file into buf at offset, returning the number of bytes read.
    ///
    /// Reads past the end of the file return fewer bytes than requested.
    fn read(&self, file: FileHandle, offset: u64, buf: &mut [u8]) -> Result<usize>;
    /// Write to file from buf at offset, returning the number of bytes
    /// written. Writing past the end of the file extends it; any gap is
    /// filled with null bytes.
    fn write(&mut self, file: FileHandle, offset: u64, buf: &[u8]) -> Result<usize>;
    /// Size of the file in bytes.
    fn length(&self, file: FileHandle) -> Result<u64>;
}

/// Supported filesystems
pub enum FsImpl {
    Temp(tempfs::TempFs),
}

impl FsImpl {
    fn unwrap(&self) -> &dyn FileSystem {
        match self {
            FsImpl::Temp(fs) => fs,
        }
    }

    fn unwrap_mut(&mut self) -> &mut dyn FileSystem {
        match self {
            FsImpl::Temp(fs) => fs,
        }
    }
}

impl FileSystem for FsImpl {
    fn create(&mut self, name: &str) -> Result<FileHandle> {
        self.unwrap_mut().create(name)
    }
    fn lookup(&self, name: &str) -> Result<INodeNum> {
        self.unwrap().lookup(name)
    }
    fn open(&mut self, inode: INodeNum) -> Result<FileHandle> {
        self.unwrap_mut().open(inode)
    }
    fn release(&mut self, inode: INodeNum) {
        self.unwrap_mut().release(inode);
    }
    fn read(&self, file: FileHandle, offset: u64, buf: &mut [u8]) -> Result<usize> {
        self.unwrap().read(file, offset, buf)
    }
    fn write(&mut self, file: FileHandle, offset: u64, buf: &[u8]) -> Result<usize> {
        self.unwrap_mut().write(file, offset, buf)
    }
    fn length(&self, file: FileHandle) -> Result<u64> {
        self.unwrap().length(file)
    }
}
