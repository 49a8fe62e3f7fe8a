//! Page-fault handling and the claim protocol: the path that turns a
//! registered virtual page into a resident, mapped frame, evicting another
//! frame when the pool is dry.

use crate::mem::frame_table::{FrameEntry, FrameIndex, FrameTable};
use crate::mem::page::{PageKind, PageVariant};
use crate::mem::palloc::{FramePool, PhysFrame};
use crate::mem::swap::SwapTable;
use crate::mem::{
    write_back, AddressSpace, AsId, FileBacking, MemoryManager, Result, SharedFileSystem, VmError,
};
use crate::vfs::{self, FileSystem};
use alloc::collections::BTreeMap;
use log::{debug, trace};
use marrowos_shared::mem::{
    is_kernel_vaddr, page_round_down, MAX_STACK_SIZE, PAGE_FRAME_SIZE, STACK_TOP,
};

impl MemoryManager {
    /// Resolve a hardware page fault at `addr`. `is_write` and `not_present`
    /// come from the fault's error code.
    ///
    /// Faults into kernel space, through the null page, onto unregistered
    /// pages, or writes to read-only mappings are fatal to the faulting
    /// process. Registered pages are claimed; an unregistered write just
    /// below the stack grows it by one page.
    pub fn handle_fault(
        &mut self,
        as_id: AsId,
        addr: usize,
        is_write: bool,
        not_present: bool,
    ) -> Result<()> {
        if addr < PAGE_FRAME_SIZE {
            return Err(VmError::NullPointer);
        }
        if is_kernel_vaddr(addr) {
            return Err(VmError::KernelAddress(addr));
        }
        if !not_present {
            // The page is present, so this is a protection violation. There
            // is no copy-on-write; a write fault here is fatal.
            return if is_write {
                Err(VmError::WriteProtected(addr))
            } else {
                Ok(())
            };
        }

        let vpn = page_round_down(addr);
        if self.space(as_id)?.spt.contains(vpn) {
            return self.claim(as_id, vpn);
        }

        // Bounded stack growth: an unregistered write below the saved stack
        // pointer, within MAX_STACK_SIZE of the stack top and not above any
        // previously-touched stack address, grows the stack one page.
        let (sp, floor) = {
            let space = self.space(as_id)?;
            (space.user_stack_pointer, space.stack_floor)
        };
        let stack_limit = STACK_TOP - MAX_STACK_SIZE;
        if is_write && addr < sp && addr >= stack_limit && addr <= floor && floor > stack_limit {
            let new_floor = floor - PAGE_FRAME_SIZE;
            debug!("stack growth: new floor {new_floor:#x}");
            self.alloc_anon(as_id, new_floor, true)?;
            self.claim(as_id, new_floor)?;
            self.space_mut(as_id)?.stack_floor = new_floor;
            return Ok(());
        }

        Err(VmError::NotRegistered(vpn))
    }

    /// Bind the registered page covering `addr` to a physical frame and make
    /// its content resident. A claim of an already-resident page is a no-op.
    pub fn claim(&mut self, as_id: AsId, addr: usize) -> Result<()> {
        let vpn = page_round_down(addr);
        {
            let space = self.space(as_id)?;
            let Some(page) = space.spt.lookup(vpn) else {
                return Err(VmError::NotRegistered(vpn));
            };
            if page.is_resident() {
                return Ok(());
            }
        }
        trace!("claim: {vpn:#x} in address space {as_id}");

        let MemoryManager {
            pool,
            frame_table,
            swap,
            fs,
            spaces,
            ..
        } = self;

        let frame = acquire_frame(pool, frame_table, swap, spaces, fs)?;

        let space = spaces
            .get_mut(&as_id)
            .expect("address space vanished during claim");
        let index = frame_table.insert(FrameEntry {
            frame,
            owner: as_id,
            vpn,
        });
        let page = space
            .spt
            .lookup_mut(vpn)
            .expect("page vanished during claim");
        page.set_frame(index);
        let writable = page.writable();
        assert!(
            space.pagedir.map(vpn, frame, writable),
            "claim of {vpn:#x} found a stale hardware mapping"
        );

        if let Err(err) = materialize(page.variant_mut(), pool.bytes_mut(frame), swap, fs) {
            // Unwind: the fault propagates to the process, the kernel state
            // stays consistent.
            space.pagedir.unmap(vpn);
            frame_table.remove(index);
            page.clear_frame();
            pool.dealloc(frame);
            return Err(err);
        }
        Ok(())
    }
}

/// Fill `bytes` with the page's content and advance its variant state:
/// uninitialized pages run their initializer and transition exactly once;
/// materialized pages come back from the swap device or their backing file.
fn materialize(
    variant: &mut PageVariant,
    bytes: &mut [u8],
    swap: &mut SwapTable,
    fs: &SharedFileSystem,
) -> Result<()> {
    match variant {
        PageVariant::Uninit {
            target: PageKind::Anon,
            ..
        } => {
            bytes.fill(0);
            *variant = PageVariant::Anon { swap_slot: None };
        }
        PageVariant::Uninit {
            target: PageKind::File,
            backing,
        } => {
            {
                let backing = backing.as_ref().expect("file-destined page without backing");
                read_into(fs, backing, bytes)?;
            }
            let backing = backing.take().expect("file-destined page without backing");
            *variant = PageVariant::File { backing };
        }
        PageVariant::Anon { swap_slot } => {
            if let Some(slot) = *swap_slot {
                swap.read_page(slot, bytes)?;
                swap.release(slot);
                *swap_slot = None;
            } else {
                // Never evicted since materialization; fresh zero fill
                // (fork-time copies land here before their bytes arrive).
                bytes.fill(0);
            }
        }
        PageVariant::File { backing } => read_into(fs, backing, bytes)?,
    }
    Ok(())
}

/// Read a file-backed page's byte range and zero the tail.
fn read_into(fs: &SharedFileSystem, backing: &FileBacking, bytes: &mut [u8]) -> Result<()> {
    let n = fs
        .lock()
        .read(backing.file, backing.offset, &mut bytes[..backing.read_bytes])?;
    if n != backing.read_bytes {
        return Err(VmError::File(vfs::Error::Io));
    }
    bytes[backing.read_bytes..].fill(0);
    Ok(())
}

/// One physical frame, from the pool if it has one, otherwise by evicting.
fn acquire_frame(
    pool: &mut FramePool,
    frame_table: &mut FrameTable,
    swap: &mut SwapTable,
    spaces: &mut BTreeMap<AsId, AddressSpace>,
    fs: &SharedFileSystem,
) -> Result<PhysFrame> {
    if let Some(frame) = pool.alloc(false) {
        return Ok(frame);
    }
    evict_one(pool, frame_table, swap, spaces, fs)
}

/// Second-chance (clock) eviction. Scans from the saved cursor, giving
/// accessed frames a second chance; the first pass passes over dirty
/// file-backed frames (while still aging them) so clean and anonymous
/// candidates go first. The second pass accepts any frame whose accessed
/// bit is clear, which by then is all of them, so a victim is guaranteed
/// within two full passes.
///
/// The victim's content is persisted as its variant requires, its mapping
/// is torn down, and its frame is handed to the waiting allocation.
fn evict_one(
    pool: &mut FramePool,
    frame_table: &mut FrameTable,
    swap: &mut SwapTable,
    spaces: &mut BTreeMap<AsId, AddressSpace>,
    fs: &SharedFileSystem,
) -> Result<PhysFrame> {
    let slots = frame_table.slots();
    assert!(
        slots > 0,
        "frame pool exhausted with no evictable candidate"
    );

    let start = frame_table.cursor();
    let mut victim = None;
    for step in 0..2 * slots {
        let i = (start + step) % slots;
        let Some(entry) = frame_table.get(FrameIndex(i)) else {
            continue;
        };
        let (owner, vpn) = (entry.owner, entry.vpn);
        let space = spaces
            .get_mut(&owner)
            .expect("frame table entry without an address space");
        let kind = space
            .spt
            .lookup(vpn)
            .expect("resident frame without a page")
            .kind();

        let second_pass = step >= slots;
        if !second_pass && kind == PageKind::File && space.pagedir.is_dirty(vpn) {
            // Deferred: no synchronous write-back mid-scan while cleaner
            // candidates may remain. The frame still ages.
            if space.pagedir.is_accessed(vpn) {
                space.pagedir.clear_accessed(vpn);
            }
            continue;
        }
        if space.pagedir.is_accessed(vpn) {
            space.pagedir.clear_accessed(vpn);
            continue;
        }
        victim = Some((FrameIndex(i), owner, vpn));
        break;
    }

    let Some((index, owner, vpn)) = victim else {
        panic!("second-chance eviction found no victim in two full passes");
    };
    frame_table.set_cursor((index.0 + 1) % slots);

    let frame = frame_table
        .get(index)
        .expect("victim entry vanished")
        .frame;
    let space = spaces
        .get_mut(&owner)
        .expect("victim's address space vanished");
    let page = space
        .spt
        .lookup_mut(vpn)
        .expect("victim frame without a page");
    debug!("evict: {vpn:#x} of address space {owner}");

    match page.variant_mut() {
        PageVariant::Anon { swap_slot } => {
            let Some(slot) = swap.alloc_slot() else {
                panic!("swap exhausted while evicting anonymous page {vpn:#x}");
            };
            if let Err(err) = swap.write_page(slot, pool.bytes(frame)) {
                swap.release(slot);
                return Err(err.into());
            }
            *swap_slot = Some(slot);
        }
        PageVariant::File { backing } => {
            if space.pagedir.is_dirty(vpn) {
                write_back(fs, backing, pool.bytes(frame))?;
                space.pagedir.clear_dirty(vpn);
            }
        }
        PageVariant::Uninit { .. } => unreachable!("resident page is uninitialized"),
    }

    page.clear_frame();
    space.pagedir.unmap(vpn);
    frame_table.remove(index);
    Ok(frame)
}
