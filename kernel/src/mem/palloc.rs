use alloc::{boxed::Box, vec};
use bitbybit::bitfield;
use marrowos_shared::mem::PAGE_FRAME_SIZE;

/// Number of a physical page frame within the pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PhysFrame(pub(crate) usize);

impl PhysFrame {
    pub fn number(self) -> usize {
        self.0
    }
}

#[bitfield(u8, default = 0)]
struct CoreMapEntry {
    #[bit(0, rw)]
    allocated: bool,
}

/// The physical-page allocator: a fixed arena of page frames and a core map
/// recording which are handed out. Single frames only; the memory manager
/// never needs contiguous runs.
pub struct FramePool {
    arena: Box<[u8]>,
    core_map: Box<[CoreMapEntry]>,
    // Next-fit scan position.
    position: usize,
    frames_allocated: usize,
}

impl FramePool {
    pub fn new(num_frames: usize) -> Self {
        assert!(num_frames > 0, "frame pool must hold at least one frame");
        FramePool {
            arena: vec![0; num_frames * PAGE_FRAME_SIZE].into_boxed_slice(),
            core_map: vec![CoreMapEntry::DEFAULT; num_frames].into_boxed_slice(),
            position: 0,
            frames_allocated: 0,
        }
    }

    pub fn num_frames(&self) -> usize {
        self.core_map.len()
    }

    pub fn free_frames(&self) -> usize {
        self.core_map.len() - self.frames_allocated
    }

    /// Allocate one frame, or `None` when the pool is exhausted. The frame's
    /// contents are unspecified unless `zeroed` is set.
    pub fn alloc(&mut self, zeroed: bool) -> Option<PhysFrame> {
        if self.frames_allocated == self.core_map.len() {
            return None;
        }
        let len = self.core_map.len();
        for step in 0..len {
            let i = (self.position + step) % len;
            if self.core_map[i].allocated() {
                continue;
            }
            self.core_map[i] = self.core_map[i].with_allocated(true);
            self.position = (i + 1) % len;
            self.frames_allocated += 1;
            let frame = PhysFrame(i);
            if zeroed {
                self.bytes_mut(frame).fill(0);
            }
            return Some(frame);
        }
        None
    }

    /// Return a frame to the pool.
    pub fn dealloc(&mut self, frame: PhysFrame) {
        assert!(
            self.core_map[frame.0].allocated(),
            "double free of physical frame {}",
            frame.0
        );
        self.core_map[frame.0] = self.core_map[frame.0].with_allocated(false);
        self.frames_allocated -= 1;
    }

    /// The frame's contents. Frames stand in for physical memory, so this is
    /// the kernel-virtual view a real kernel would get from its direct map.
    pub fn bytes(&self, frame: PhysFrame) -> &[u8] {
        let start = frame.0 * PAGE_FRAME_SIZE;
        &self.arena[start..start + PAGE_FRAME_SIZE]
    }

    pub fn bytes_mut(&mut self, frame: PhysFrame) -> &mut [u8] {
        let start = frame.0 * PAGE_FRAME_SIZE;
        &mut self.arena[start..start + PAGE_FRAME_SIZE]
    }

    /// Copy the full contents of `src` into `dst`.
    pub fn copy_frame(&mut self, dst: PhysFrame, src: PhysFrame) {
        self.arena.copy_within(
            src.0 * PAGE_FRAME_SIZE..(src.0 + 1) * PAGE_FRAME_SIZE,
            dst.0 * PAGE_FRAME_SIZE,
        );
    }
}
