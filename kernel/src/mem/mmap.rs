//! Memory-mapped files: building a run of lazily-loaded file-backed pages
//! for a mapping request, and tearing it down with dirty write-back.

use crate::mem::page::{FileBacking, PageKind, PageSpec, PageVariant};
use crate::mem::{destroy_page, write_back, AsId, MemoryManager, Result, VmError};
use crate::vfs::{FileHandle, FileSystem};
use alloc::{sync::Arc, vec::Vec};
use core::cmp::min;
use log::debug;
use marrowos_shared::mem::{
    is_kernel_vaddr, is_page_aligned, page_round_down, PAGE_FRAME_SIZE,
};

impl MemoryManager {
    /// Map `length` bytes of `file` starting at `offset` into `as_id` at
    /// `addr`, one lazily-loaded page per page-sized chunk. No file content
    /// is read until a page is first touched.
    ///
    /// The effective read length is capped at the file's length; the final
    /// page's tail is zero-filled. Each page holds its own reopened
    /// reference to the file, so the caller may close its handle without
    /// invalidating the mapping.
    ///
    /// Returns the mapping address. If a precondition fails or any chunk
    /// collides with an existing registration, returns an error and leaves
    /// the supplemental page table exactly as it was.
    pub fn mmap(
        &mut self,
        as_id: AsId,
        addr: usize,
        length: usize,
        writable: bool,
        file: FileHandle,
        offset: u64,
    ) -> Result<usize> {
        if file.is_console() {
            return Err(VmError::ConsoleHandle);
        }
        if offset % PAGE_FRAME_SIZE as u64 != 0 {
            return Err(VmError::MisalignedOffset(offset));
        }
        if length == 0 {
            return Err(VmError::InvalidLength);
        }
        if addr == 0 {
            return Err(VmError::NullPointer);
        }
        if !is_page_aligned(addr) {
            return Err(VmError::MisalignedAddress(addr));
        }
        if is_kernel_vaddr(addr) {
            return Err(VmError::KernelAddress(addr));
        }
        if self.space(as_id)?.spt.contains(addr) {
            return Err(VmError::AlreadyMapped(addr));
        }

        let file_length = self.fs.lock().length(file)? as usize;
        let read_total = min(length, file_length);
        if read_total == 0 {
            return Err(VmError::InvalidLength);
        }

        let mut registered: Vec<usize> = Vec::new();
        let mut vpn = addr;
        let mut ofs = offset;
        let mut remaining = read_total;
        while remaining > 0 {
            let read_bytes = min(remaining, PAGE_FRAME_SIZE);
            let zero_bytes = PAGE_FRAME_SIZE - read_bytes;
            let handle = match self.fs.lock().reopen(file) {
                Ok(handle) => handle,
                Err(err) => {
                    self.rollback(as_id, registered);
                    return Err(err.into());
                }
            };
            let backing = Arc::new(FileBacking {
                file: handle,
                offset: ofs,
                read_bytes,
                zero_bytes,
            });
            if let Err(err) = self.register_lazy(as_id, vpn, writable, PageSpec::File(backing)) {
                self.fs.lock().release(handle.inode);
                self.rollback(as_id, registered);
                return Err(err);
            }
            registered.push(vpn);
            vpn += PAGE_FRAME_SIZE;
            ofs += read_bytes as u64;
            remaining -= read_bytes;
        }

        debug!("mmap: {} pages at {addr:#x}", registered.len());
        Ok(addr)
    }

    /// Unmap the file mapping at `addr`: walk forward while the supplemental
    /// page table holds a file-backed page, writing hardware-dirty pages
    /// back to their recorded file ranges, then releasing each page. A no-op
    /// once no further contiguous file-backed page is found.
    pub fn munmap(&mut self, as_id: AsId, addr: usize) -> Result<()> {
        self.space(as_id)?;
        let mut vpn = page_round_down(addr);
        loop {
            let MemoryManager {
                pool,
                frame_table,
                swap,
                fs,
                spaces,
                ..
            } = self;
            let space = spaces
                .get_mut(&as_id)
                .expect("address space vanished during munmap");
            let Some(page) = space.spt.lookup(vpn) else {
                break;
            };
            if page.kind() != PageKind::File {
                break;
            }

            if let (PageVariant::File { backing }, Some(index)) = (page.variant(), page.frame()) {
                if space.pagedir.is_dirty(vpn) {
                    let entry = frame_table
                        .get(index)
                        .expect("resident page has no frame entry");
                    write_back(fs, backing, pool.bytes(entry.frame))?;
                    space.pagedir.clear_dirty(vpn);
                }
            }

            let page = space
                .spt
                .remove(vpn)
                .expect("page vanished during munmap");
            destroy_page(page, &mut space.pagedir, pool, frame_table, swap, fs);
            vpn += PAGE_FRAME_SIZE;
        }
        Ok(())
    }

    /// Undo a partially-registered mapping.
    fn rollback(&mut self, as_id: AsId, vpns: Vec<usize>) {
        debug!("mmap: rolling back {} pages", vpns.len());
        let MemoryManager {
            pool,
            frame_table,
            swap,
            fs,
            spaces,
            ..
        } = self;
        let Some(space) = spaces.get_mut(&as_id) else {
            return;
        };
        for vpn in vpns {
            if let Some(page) = space.spt.remove(vpn) {
                destroy_page(page, &mut space.pagedir, pool, frame_table, swap, fs);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mem::test_util::{create_file, memory_manager, with_tempfs};
    use marrowos_shared::mem::OFFSET;

    const BASE: usize = 0x40000;
    const PAGE: usize = PAGE_FRAME_SIZE;

    #[test]
    fn preconditions_fail_without_side_effects() {
        let mut mm = memory_manager(4, 4);
        let a = mm.create_address_space();
        let file = create_file(&mm, "f", &[1u8; PAGE]);

        assert_eq!(
            mm.mmap(a, BASE, PAGE, true, file, 17),
            Err(VmError::MisalignedOffset(17))
        );
        assert_eq!(
            mm.mmap(a, BASE, 0, true, file, 0),
            Err(VmError::InvalidLength)
        );
        assert_eq!(
            mm.mmap(a, BASE + 3, PAGE, true, file, 0),
            Err(VmError::MisalignedAddress(BASE + 3))
        );
        assert_eq!(mm.mmap(a, 0, PAGE, true, file, 0), Err(VmError::NullPointer));
        assert_eq!(
            mm.mmap(a, OFFSET, PAGE, true, file, 0),
            Err(VmError::KernelAddress(OFFSET))
        );
        assert_eq!(
            mm.mmap(a, BASE, PAGE, true, FileHandle { inode: 0 }, 0),
            Err(VmError::ConsoleHandle)
        );
        assert_eq!(
            mm.mmap(a, BASE, PAGE, true, FileHandle { inode: 1 }, 0),
            Err(VmError::ConsoleHandle)
        );

        let empty = create_file(&mm, "empty", b"");
        assert_eq!(
            mm.mmap(a, BASE, PAGE, true, empty, 0),
            Err(VmError::InvalidLength)
        );

        mm.alloc_anon(a, BASE, true).unwrap();
        assert_eq!(
            mm.mmap(a, BASE, PAGE, true, file, 0),
            Err(VmError::AlreadyMapped(BASE))
        );

        // Only the explicit anonymous registration is present.
        assert_eq!(mm.address_space(a).unwrap().spt().len(), 1);
    }

    #[test]
    fn partial_registration_rolls_back_and_releases_handles() {
        let mut mm = memory_manager(4, 4);
        let a = mm.create_address_space();
        let file = create_file(&mm, "three", &[7u8; 3 * PAGE]);
        // A collision two pages in.
        mm.alloc_anon(a, BASE + 2 * PAGE, true).unwrap();

        let open_before = with_tempfs(&mm, |fs| fs.open_count(file.inode));
        assert_eq!(
            mm.mmap(a, BASE, 3 * PAGE, true, file, 0),
            Err(VmError::AlreadyMapped(BASE + 2 * PAGE))
        );
        assert!(!mm.address_space(a).unwrap().spt().contains(BASE));
        assert!(!mm.address_space(a).unwrap().spt().contains(BASE + PAGE));
        assert_eq!(with_tempfs(&mm, |fs| fs.open_count(file.inode)), open_before);
    }

    #[test]
    fn mapping_is_lazy_and_reads_through_page_faults() {
        let mut mm = memory_manager(4, 4);
        let a = mm.create_address_space();
        let mut content = vec![0u8; 2 * PAGE];
        content[0] = 0x10;
        content[PAGE] = 0x20;
        let file = create_file(&mm, "lazy", &content);

        let addr = mm.mmap(a, BASE, 2 * PAGE, false, file, 0).unwrap();
        assert_eq!(addr, BASE);
        // Nothing resident until touched.
        assert_eq!(mm.frame_table().resident(), 0);

        let mut byte = [0u8; 1];
        mm.read_user(a, BASE + PAGE, &mut byte).unwrap();
        assert_eq!(byte[0], 0x20);
        assert_eq!(mm.frame_table().resident(), 1);
        mm.read_user(a, BASE, &mut byte).unwrap();
        assert_eq!(byte[0], 0x10);
    }

    #[test]
    fn mapping_is_capped_at_file_length() {
        let mut mm = memory_manager(4, 4);
        let a = mm.create_address_space();
        let file = create_file(&mm, "short", &[9u8; PAGE + 100]);

        // Asking for four pages maps only the two the file can fill.
        mm.mmap(a, BASE, 4 * PAGE, false, file, 0).unwrap();
        let space = mm.address_space(a).unwrap();
        assert!(space.spt().contains(BASE));
        assert!(space.spt().contains(BASE + PAGE));
        assert!(!space.spt().contains(BASE + 2 * PAGE));
    }

    #[test]
    fn partial_final_page_is_zero_filled() {
        let mut mm = memory_manager(4, 4);
        let a = mm.create_address_space();
        let file = create_file(&mm, "tail", &[0x77u8; PAGE + 100]);
        mm.mmap(a, BASE, 2 * PAGE, false, file, 0).unwrap();

        let mut buf = [0xFFu8; 200];
        mm.read_user(a, BASE + PAGE, &mut buf).unwrap();
        assert!(buf[..100].iter().all(|&b| b == 0x77));
        assert!(buf[100..].iter().all(|&b| b == 0));
    }

    #[test]
    fn munmap_writes_back_exactly_the_dirty_pages() {
        let mut mm = memory_manager(4, 4);
        let a = mm.create_address_space();
        let file = create_file(&mm, "wb", &[0xABu8; 3 * PAGE]);

        mm.mmap(a, BASE, 3 * PAGE, true, file, 0).unwrap();
        // Touch all three, modify only the middle one.
        let mut buf = [0u8; 1];
        mm.read_user(a, BASE, &mut buf).unwrap();
        mm.read_user(a, BASE + 2 * PAGE, &mut buf).unwrap();
        mm.write_user(a, BASE + PAGE, b"middle").unwrap();

        let writes_before = with_tempfs(&mm, |fs| fs.write_count());
        mm.munmap(a, BASE).unwrap();

        // Exactly one write-back, at the middle page's offset.
        assert_eq!(with_tempfs(&mm, |fs| fs.write_count()), writes_before + 1);
        let mut out = [0u8; 6];
        mm.filesystem().lock().read(file, PAGE as u64, &mut out).unwrap();
        assert_eq!(&out, b"middle");
        let mut head = [0u8; 1];
        mm.filesystem().lock().read(file, 0, &mut head).unwrap();
        assert_eq!(head[0], 0xAB);

        // The mapping is gone, its frames returned.
        assert_eq!(mm.address_space(a).unwrap().spt().len(), 0);
        assert_eq!(mm.frame_table().resident(), 0);
        assert_eq!(mm.frame_pool().free_frames(), 4);

        // A second munmap at the same address is a no-op.
        mm.munmap(a, BASE).unwrap();
    }

    #[test]
    fn remapping_reproduces_written_content() {
        let mut mm = memory_manager(4, 4);
        let a = mm.create_address_space();
        let file = create_file(&mm, "persist", &[0u8; PAGE]);

        mm.mmap(a, BASE, PAGE, true, file, 0).unwrap();
        mm.write_user(a, BASE, b"written through the mapping").unwrap();
        mm.munmap(a, BASE).unwrap();

        mm.mmap(a, BASE, PAGE, true, file, 0).unwrap();
        let mut out = [0u8; 27];
        mm.read_user(a, BASE, &mut out).unwrap();
        assert_eq!(&out, b"written through the mapping");
        mm.munmap(a, BASE).unwrap();
    }

    #[test]
    fn munmap_releases_the_mapping_file_references() {
        let mut mm = memory_manager(4, 4);
        let a = mm.create_address_space();
        let file = create_file(&mm, "refs", &[1u8; 2 * PAGE]);

        let open_before = with_tempfs(&mm, |fs| fs.open_count(file.inode));
        mm.mmap(a, BASE, 2 * PAGE, true, file, 0).unwrap();
        assert_eq!(
            with_tempfs(&mm, |fs| fs.open_count(file.inode)),
            open_before + 2
        );
        mm.munmap(a, BASE).unwrap();
        assert_eq!(with_tempfs(&mm, |fs| fs.open_count(file.inode)), open_before);
    }

    #[test]
    fn mapping_survives_caller_closing_its_handle() {
        let mut mm = memory_manager(4, 4);
        let a = mm.create_address_space();
        let file = create_file(&mm, "closed", &[0x3Cu8; PAGE]);
        mm.mmap(a, BASE, PAGE, false, file, 0).unwrap();

        // The caller closes its own handle before the first touch.
        mm.filesystem().lock().release(file.inode);

        let mut out = [0u8; 4];
        mm.read_user(a, BASE, &mut out).unwrap();
        assert_eq!(out, [0x3C; 4]);
    }

    #[test]
    fn munmap_offset_mappings_write_back_at_recorded_offsets() {
        let mut mm = memory_manager(4, 4);
        let a = mm.create_address_space();
        let file = create_file(&mm, "offset", &[0u8; 3 * PAGE]);

        // Map only the file's last page.
        mm.mmap(a, BASE, PAGE, true, file, 2 * PAGE as u64).unwrap();
        mm.write_user(a, BASE, b"tail page").unwrap();
        mm.munmap(a, BASE).unwrap();

        let mut out = [0u8; 9];
        mm.filesystem()
            .lock()
            .read(file, 2 * PAGE as u64, &mut out)
            .unwrap();
        assert_eq!(&out, b"tail page");
    }
}
