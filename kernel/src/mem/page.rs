use crate::mem::frame_table::FrameIndex;
use crate::mem::swap::SwapSlot;
use crate::vfs::FileHandle;
use alloc::sync::Arc;
use marrowos_shared::mem::is_page_aligned;

/// Where a file-backed page's content lives: an independently-owned handle
/// plus the byte range to read and the tail to zero-fill. Shared by `Arc`
/// between a lazy page and its fork-time copies; the handle is released when
/// the last referent is destroyed.
#[derive(Debug)]
pub struct FileBacking {
    pub file: FileHandle,
    pub offset: u64,
    /// Bytes to read from `file` at `offset`.
    pub read_bytes: usize,
    /// Bytes to zero after the read portion. `read_bytes + zero_bytes` spans
    /// the whole page.
    pub zero_bytes: usize,
}

/// What a page will contain once materialized.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PageKind {
    Anon,
    File,
}

/// Lazy-load specification supplied at registration time.
pub enum PageSpec {
    Anon,
    File(Arc<FileBacking>),
}

/// Per-page state. `Uninit` pages have never been claimed; the transition to
/// `Anon` or `File` happens exactly once, at first claim, and never reverts.
pub enum PageVariant {
    Uninit {
        target: PageKind,
        backing: Option<Arc<FileBacking>>,
    },
    Anon {
        /// Occupied swap slot, present only while the page is swapped out.
        swap_slot: Option<SwapSlot>,
    },
    File {
        backing: Arc<FileBacking>,
    },
}

/// One virtual page of an address space: the single source of truth for what
/// should be at this address and how to materialize it.
pub struct Page {
    vpn: usize,
    writable: bool,
    variant: PageVariant,
    /// Back-reference into the frame table, present only while resident.
    frame: Option<FrameIndex>,
}

impl Page {
    /// A page in the uninitialized state, to be materialized at first claim.
    pub fn new_lazy(vpn: usize, writable: bool, spec: PageSpec) -> Self {
        assert!(is_page_aligned(vpn), "page at unaligned address {vpn:#x}");
        let variant = match spec {
            PageSpec::Anon => PageVariant::Uninit {
                target: PageKind::Anon,
                backing: None,
            },
            PageSpec::File(backing) => PageVariant::Uninit {
                target: PageKind::File,
                backing: Some(backing),
            },
        };
        Page {
            vpn,
            writable,
            variant,
            frame: None,
        }
    }

    /// A page born already materialized, for fork-time copies of live pages.
    pub(crate) fn new_materialized(vpn: usize, writable: bool, variant: PageVariant) -> Self {
        debug_assert!(!matches!(variant, PageVariant::Uninit { .. }));
        Page {
            vpn,
            writable,
            variant,
            frame: None,
        }
    }

    pub fn vpn(&self) -> usize {
        self.vpn
    }

    pub fn writable(&self) -> bool {
        self.writable
    }

    /// The page's eventual kind, regardless of whether it has been
    /// materialized yet.
    pub fn kind(&self) -> PageKind {
        match &self.variant {
            PageVariant::Uninit { target, .. } => *target,
            PageVariant::Anon { .. } => PageKind::Anon,
            PageVariant::File { .. } => PageKind::File,
        }
    }

    pub fn is_lazy(&self) -> bool {
        matches!(self.variant, PageVariant::Uninit { .. })
    }

    pub fn is_resident(&self) -> bool {
        self.frame.is_some()
    }

    pub fn variant(&self) -> &PageVariant {
        &self.variant
    }

    pub(crate) fn variant_mut(&mut self) -> &mut PageVariant {
        &mut self.variant
    }

    pub(crate) fn into_variant(self) -> PageVariant {
        self.variant
    }

    pub fn frame(&self) -> Option<FrameIndex> {
        self.frame
    }

    pub(crate) fn set_frame(&mut self, frame: FrameIndex) {
        debug_assert!(self.frame.is_none(), "page already resident");
        self.frame = Some(frame);
    }

    pub(crate) fn clear_frame(&mut self) {
        self.frame = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lazy_anon_page_reports_its_kind() {
        let page = Page::new_lazy(0x7000, true, PageSpec::Anon);
        assert_eq!(page.vpn(), 0x7000);
        assert!(page.writable());
        assert!(page.is_lazy());
        assert!(!page.is_resident());
        assert_eq!(page.kind(), PageKind::Anon);
    }

    #[test]
    fn lazy_file_page_reports_its_kind() {
        let backing = Arc::new(FileBacking {
            file: FileHandle { inode: 2 },
            offset: 0,
            read_bytes: 4096,
            zero_bytes: 0,
        });
        let page = Page::new_lazy(0x8000, false, PageSpec::File(backing));
        assert_eq!(page.kind(), PageKind::File);
        assert!(page.is_lazy());
    }

    #[test]
    #[should_panic(expected = "unaligned")]
    fn unaligned_vpn_is_rejected() {
        let _ = Page::new_lazy(0x7123, true, PageSpec::Anon);
    }
}
