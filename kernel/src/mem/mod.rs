//! The virtual-memory core: supplemental page tables, demand paging, frame
//! eviction, swap, and memory-mapped files.
//!
//! All state is owned by one [`MemoryManager`] value injected at kernel
//! initialization. The frame table and swap table are shared by every
//! address space, so callers serialize all operations through a single
//! `sync::Mutex<MemoryManager>`; that one coarse lock is what keeps two
//! faulting threads from picking the same eviction victim or swap slot.
//! The filesystem has its own lock, held across each call into it.

pub mod fault;
pub mod frame_table;
pub mod mmap;
pub mod page;
pub mod pagedir;
pub mod palloc;
pub mod spt;
pub mod swap;

pub use frame_table::{FrameEntry, FrameIndex, FrameTable};
pub use page::{FileBacking, Page, PageKind, PageSpec, PageVariant};
pub use pagedir::PageDirectory;
pub use palloc::{FramePool, PhysFrame};
pub use spt::SupplementalPageTable;
pub use swap::{SwapSlot, SwapTable, SECTORS_PER_PAGE};

use crate::block::block_core::Block;
use crate::block::block_error::BlockError;
use crate::sync::Mutex;
use crate::vfs::{self, FileSystem, FsImpl};
use alloc::{collections::BTreeMap, sync::Arc, vec::Vec};
use core::cmp::min;
use core::fmt;
use log::warn;
use marrowos_shared::mem::{
    is_kernel_vaddr, is_page_aligned, page_round_down, OFFSET, PAGE_FRAME_SIZE, STACK_TOP,
};

/// Identifies one address space within the memory manager.
pub type AsId = u16;

/// The filesystem, behind its own lock. The backing filesystem is not
/// internally thread-safe, so the lock is held around every call into it.
pub type SharedFileSystem = Arc<Mutex<FsImpl>>;

/// Everything that can go wrong inside the VM core.
///
/// The first four variants are fatal to the faulting process: the caller is
/// expected to terminate it with a non-zero status. The rest are either
/// recoverable by the caller (mmap precondition violations, which leave no
/// side effects) or wrap a backing-store failure that aborts the enclosing
/// claim. Kernel-fatal conditions do not get a variant; they panic.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VmError {
    /// Access through the null page.
    NullPointer,
    /// User access to a kernel address.
    KernelAddress(usize),
    /// Fault on a virtual page nobody registered.
    NotRegistered(usize),
    /// Write fault on a present, read-only mapping.
    WriteProtected(usize),
    /// Registration collision.
    AlreadyMapped(usize),
    /// Mapping address not page-aligned or null.
    MisalignedAddress(usize),
    /// Mapping file offset not page-aligned.
    MisalignedOffset(u64),
    /// Mapping length zero, or no file content to map.
    InvalidLength,
    /// Attempt to map the console.
    ConsoleHandle,
    /// Operation against an address space that does not exist.
    NoSuchAddressSpace(AsId),
    /// Backing file operation failed.
    File(vfs::Error),
    /// Swap device operation failed.
    Disk(BlockError),
}

impl fmt::Display for VmError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NullPointer => write!(f, "access through the null page"),
            Self::KernelAddress(addr) => write!(f, "user access to kernel address {addr:#x}"),
            Self::NotRegistered(vpn) => write!(f, "fault on unregistered page {vpn:#x}"),
            Self::WriteProtected(addr) => write!(f, "write to read-only address {addr:#x}"),
            Self::AlreadyMapped(vpn) => write!(f, "page {vpn:#x} is already registered"),
            Self::MisalignedAddress(addr) => write!(f, "address {addr:#x} is not page-aligned"),
            Self::MisalignedOffset(ofs) => write!(f, "file offset {ofs:#x} is not page-aligned"),
            Self::InvalidLength => write!(f, "mapping has no content"),
            Self::ConsoleHandle => write!(f, "cannot map the console"),
            Self::NoSuchAddressSpace(id) => write!(f, "no address space {id}"),
            Self::File(err) => write!(f, "backing file error: {err}"),
            Self::Disk(err) => write!(f, "swap device error: {err}"),
        }
    }
}

impl core::error::Error for VmError {}

impl From<vfs::Error> for VmError {
    fn from(err: vfs::Error) -> Self {
        Self::File(err)
    }
}

impl From<BlockError> for VmError {
    fn from(err: BlockError) -> Self {
        Self::Disk(err)
    }
}

pub type Result<T> = core::result::Result<T, VmError>;

/// Per-process virtual-memory state: the supplemental page table, the
/// hardware page table, and the stack-growth bookkeeping.
pub struct AddressSpace {
    pub(crate) spt: SupplementalPageTable,
    pub(crate) pagedir: PageDirectory,
    /// Lowest stack address a fault has grown down to.
    pub(crate) stack_floor: usize,
    /// User stack pointer saved on entry to the kernel.
    pub(crate) user_stack_pointer: usize,
}

impl AddressSpace {
    fn new() -> Self {
        Self {
            spt: SupplementalPageTable::new(),
            pagedir: PageDirectory::new(),
            stack_floor: STACK_TOP,
            user_stack_pointer: STACK_TOP,
        }
    }

    pub fn spt(&self) -> &SupplementalPageTable {
        &self.spt
    }

    pub fn pagedir(&self) -> &PageDirectory {
        &self.pagedir
    }

    pub fn stack_floor(&self) -> usize {
        self.stack_floor
    }
}

/// The memory manager: frame pool, frame table, swap table, swap device and
/// filesystem handle, plus every live address space. One per kernel.
pub struct MemoryManager {
    pub(crate) pool: FramePool,
    pub(crate) frame_table: FrameTable,
    pub(crate) swap: SwapTable,
    pub(crate) fs: SharedFileSystem,
    pub(crate) spaces: BTreeMap<AsId, AddressSpace>,
    next_as: AsId,
}

impl MemoryManager {
    pub fn new(pool: FramePool, swap_device: Block, fs: SharedFileSystem) -> Self {
        Self {
            pool,
            frame_table: FrameTable::new(),
            swap: SwapTable::new(swap_device),
            fs,
            spaces: BTreeMap::new(),
            next_as: 1,
        }
    }

    pub fn create_address_space(&mut self) -> AsId {
        let id = self.next_as;
        self.next_as += 1;
        self.spaces.insert(id, AddressSpace::new());
        id
    }

    pub fn address_space(&self, id: AsId) -> Option<&AddressSpace> {
        self.spaces.get(&id)
    }

    pub(crate) fn space(&self, id: AsId) -> Result<&AddressSpace> {
        self.spaces.get(&id).ok_or(VmError::NoSuchAddressSpace(id))
    }

    pub(crate) fn space_mut(&mut self, id: AsId) -> Result<&mut AddressSpace> {
        self.spaces
            .get_mut(&id)
            .ok_or(VmError::NoSuchAddressSpace(id))
    }

    pub fn frame_pool(&self) -> &FramePool {
        &self.pool
    }

    pub fn swap_table(&self) -> &SwapTable {
        &self.swap
    }

    pub fn frame_table(&self) -> &FrameTable {
        &self.frame_table
    }

    pub fn filesystem(&self) -> &SharedFileSystem {
        &self.fs
    }

    /// Record the user stack pointer for `as_id`, sampled by the trap entry
    /// path. Stack-growth decisions compare fault addresses against it.
    pub fn set_user_stack_pointer(&mut self, as_id: AsId, sp: usize) -> Result<()> {
        self.space_mut(as_id)?.user_stack_pointer = sp;
        Ok(())
    }

    /// Register a lazily-loaded page. No I/O happens until the first claim.
    pub fn register_lazy(
        &mut self,
        as_id: AsId,
        vpn: usize,
        writable: bool,
        spec: PageSpec,
    ) -> Result<()> {
        if vpn < PAGE_FRAME_SIZE {
            return Err(VmError::NullPointer);
        }
        if is_kernel_vaddr(vpn) {
            return Err(VmError::KernelAddress(vpn));
        }
        if !is_page_aligned(vpn) {
            return Err(VmError::MisalignedAddress(vpn));
        }
        self.space_mut(as_id)?
            .spt
            .register(Page::new_lazy(vpn, writable, spec))
    }

    /// Register a lazily-loaded anonymous (zero-filled) page.
    pub fn alloc_anon(&mut self, as_id: AsId, vpn: usize, writable: bool) -> Result<()> {
        self.register_lazy(as_id, vpn, writable, PageSpec::Anon)
    }

    /// Copy user memory out of `as_id` at `addr`, faulting pages in the way
    /// hardware access would.
    pub fn read_user(&mut self, as_id: AsId, addr: usize, buf: &mut [u8]) -> Result<()> {
        if buf.is_empty() {
            return Ok(());
        }
        check_user_range(addr, buf.len())?;
        let mut pos = 0;
        while pos < buf.len() {
            let cur = addr + pos;
            let vpn = page_round_down(cur);
            let page_off = cur - vpn;
            let chunk = min(buf.len() - pos, PAGE_FRAME_SIZE - page_off);
            let frame = self.touch_page(as_id, cur, false)?;
            self.space_mut(as_id)?.pagedir.set_accessed(vpn);
            buf[pos..pos + chunk]
                .copy_from_slice(&self.pool.bytes(frame)[page_off..page_off + chunk]);
            pos += chunk;
        }
        Ok(())
    }

    /// Copy `buf` into `as_id`'s memory at `addr`, faulting pages in and
    /// setting the accessed and dirty bits the way hardware writes would.
    pub fn write_user(&mut self, as_id: AsId, addr: usize, buf: &[u8]) -> Result<()> {
        if buf.is_empty() {
            return Ok(());
        }
        check_user_range(addr, buf.len())?;
        let mut pos = 0;
        while pos < buf.len() {
            let cur = addr + pos;
            let vpn = page_round_down(cur);
            let page_off = cur - vpn;
            let chunk = min(buf.len() - pos, PAGE_FRAME_SIZE - page_off);
            let frame = self.touch_page(as_id, cur, true)?;
            let space = self.space_mut(as_id)?;
            space.pagedir.set_accessed(vpn);
            space.pagedir.set_dirty(vpn);
            self.pool.bytes_mut(frame)[page_off..page_off + chunk]
                .copy_from_slice(&buf[pos..pos + chunk]);
            pos += chunk;
        }
        Ok(())
    }

    /// Fault `addr`'s page in, as the MMU's retry loop would, until it is
    /// mapped with the required access. Returns the backing frame.
    fn touch_page(&mut self, as_id: AsId, addr: usize, write: bool) -> Result<PhysFrame> {
        let vpn = page_round_down(addr);
        loop {
            match self.space(as_id)?.pagedir.translate(vpn) {
                Some((_, writable)) if write && !writable => {
                    // Protection fault; always fatal (no copy-on-write).
                    self.handle_fault(as_id, addr, true, false)?;
                }
                Some((frame, _)) => return Ok(frame),
                None => self.handle_fault(as_id, addr, write, true)?,
            }
        }
    }

    /// Duplicate `src`'s address-space contents into `dst`, which must have a
    /// clean supplemental page table. Pages that are still lazy share their
    /// read-only load specification; materialized pages get a private frame
    /// in `dst` holding a byte copy of the current content. Copy-on-fork,
    /// not copy-on-write.
    pub fn fork_copy(&mut self, dst: AsId, src: AsId) -> Result<()> {
        assert!(dst != src, "fork_copy into the source address space");
        self.space(dst)?;
        let src_vpns: Vec<usize> = self.space(src)?.spt.iter().map(|(vpn, _)| vpn).collect();
        for vpn in src_vpns {
            let plan = {
                let page = self
                    .space(src)?
                    .spt
                    .lookup(vpn)
                    .expect("source page vanished during fork");
                let writable = page.writable();
                match page.variant() {
                    PageVariant::Uninit {
                        target: PageKind::Anon,
                        ..
                    } => (writable, ForkPlan::Lazy(PageSpec::Anon)),
                    PageVariant::Uninit {
                        target: PageKind::File,
                        backing,
                    } => {
                        let backing = backing
                            .as_ref()
                            .expect("file-destined page without backing")
                            .clone();
                        (writable, ForkPlan::Lazy(PageSpec::File(backing)))
                    }
                    PageVariant::Anon { .. } => (writable, ForkPlan::CopyAnon),
                    PageVariant::File { backing } => {
                        (writable, ForkPlan::CopyFile(Arc::clone(backing)))
                    }
                }
            };
            match plan {
                (writable, ForkPlan::Lazy(spec)) => {
                    self.register_lazy(dst, vpn, writable, spec)?;
                }
                (writable, copy) => {
                    // Bring the source page in, then snapshot it: a later
                    // claim for the child may evict it again.
                    self.claim(src, vpn)?;
                    let snapshot = {
                        let space = self.space(src)?;
                        let idx = space
                            .spt
                            .lookup(vpn)
                            .and_then(Page::frame)
                            .expect("claimed page is not resident");
                        let entry = self
                            .frame_table
                            .get(idx)
                            .expect("resident page has no frame entry");
                        self.pool.bytes(entry.frame).to_vec()
                    };
                    let variant = match copy {
                        ForkPlan::CopyAnon => PageVariant::Anon { swap_slot: None },
                        ForkPlan::CopyFile(backing) => PageVariant::File { backing },
                        ForkPlan::Lazy(_) => unreachable!(),
                    };
                    self.space_mut(dst)?
                        .spt
                        .register(Page::new_materialized(vpn, writable, variant))?;
                    self.claim(dst, vpn)?;
                    let frame = {
                        let space = self.space(dst)?;
                        let idx = space
                            .spt
                            .lookup(vpn)
                            .and_then(Page::frame)
                            .expect("claimed page is not resident");
                        self.frame_table
                            .get(idx)
                            .expect("resident page has no frame entry")
                            .frame
                    };
                    self.pool.bytes_mut(frame).copy_from_slice(&snapshot);
                    // A dirty file page's content only lives in memory; the
                    // child copy must stay marked for write-back too.
                    if self.space(src)?.pagedir.is_dirty(vpn) {
                        self.space_mut(dst)?.pagedir.set_dirty(vpn);
                    }
                }
            }
        }
        Ok(())
    }

    /// Tear an address space down: write dirty file-backed content back,
    /// release every frame, swap slot, and backing file reference.
    pub fn teardown(&mut self, as_id: AsId) -> Result<()> {
        let Some(mut space) = self.spaces.remove(&as_id) else {
            return Err(VmError::NoSuchAddressSpace(as_id));
        };
        for (vpn, page) in space.spt.take_pages() {
            if let (PageVariant::File { backing }, Some(idx)) = (page.variant(), page.frame()) {
                if space.pagedir.is_dirty(vpn) {
                    if let Some(entry) = self.frame_table.get(idx) {
                        if let Err(err) =
                            write_back(&self.fs, backing, self.pool.bytes(entry.frame))
                        {
                            warn!("teardown: write-back of {vpn:#x} failed: {err}");
                        }
                    }
                    space.pagedir.clear_dirty(vpn);
                }
            }
            destroy_page(
                page,
                &mut space.pagedir,
                &mut self.pool,
                &mut self.frame_table,
                &mut self.swap,
                &self.fs,
            );
        }
        Ok(())
    }
}

enum ForkPlan {
    Lazy(PageSpec),
    CopyAnon,
    CopyFile(Arc<FileBacking>),
}

fn check_user_range(addr: usize, len: usize) -> Result<()> {
    let end = addr
        .checked_add(len)
        .ok_or(VmError::KernelAddress(usize::MAX))?;
    if end > OFFSET {
        return Err(VmError::KernelAddress(addr));
    }
    Ok(())
}

/// Write a page's live content back to its file range.
pub(crate) fn write_back(
    fs: &SharedFileSystem,
    backing: &FileBacking,
    bytes: &[u8],
) -> Result<()> {
    let n = fs
        .lock()
        .write(backing.file, backing.offset, &bytes[..backing.read_bytes])?;
    if n != backing.read_bytes {
        return Err(VmError::File(vfs::Error::Io));
    }
    Ok(())
}

/// Release everything a page still holds: its frame, its swap slot, and its
/// backing file reference. Dirty write-back, when required, must already
/// have happened.
pub(crate) fn destroy_page(
    page: Page,
    pagedir: &mut PageDirectory,
    pool: &mut FramePool,
    frame_table: &mut FrameTable,
    swap: &mut SwapTable,
    fs: &SharedFileSystem,
) {
    let vpn = page.vpn();
    if let Some(idx) = page.frame() {
        if let Some(entry) = frame_table.remove(idx) {
            pool.dealloc(entry.frame);
        }
        pagedir.unmap(vpn);
    }
    match page.into_variant() {
        PageVariant::Anon {
            swap_slot: Some(slot),
        } => swap.release(slot),
        PageVariant::Anon { swap_slot: None } => {}
        PageVariant::File { backing }
        | PageVariant::Uninit {
            backing: Some(backing),
            ..
        } => release_backing(fs, backing),
        PageVariant::Uninit { backing: None, .. } => {}
    }
}

/// Fork shares a page's backing between address spaces; only the last
/// referent closes the file handle.
fn release_backing(fs: &SharedFileSystem, backing: Arc<FileBacking>) {
    if Arc::strong_count(&backing) == 1 {
        fs.lock().release(backing.file.inode);
    }
}
