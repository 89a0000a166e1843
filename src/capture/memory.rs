//! Slot memory bound to the device in user-pointer mode
//!
//! Each pool slot owns one page-aligned allocation whose address never
//! changes while the slot exists. The device writes into it while the slot is
//! queued; consumers read it while the slot is dequeued. Consumers hold an
//! `Arc` through their `Bytes`, so the allocation outlives the pool if a
//! consumer is slow to drop a frame after a stop.

use std::alloc::{self, Layout};
use std::ptr::NonNull;
use std::sync::Arc;

use bytes::Bytes;

use crate::error::CameraError;

pub struct SlotMemory {
    ptr: NonNull<u8>,
    layout: Layout,
}

// SAFETY: the allocation is plain bytes owned by this value. Writers (the
// device) and readers (consumers) are separated in time by the
// queue/dequeue protocol.
unsafe impl Send for SlotMemory {}
unsafe impl Sync for SlotMemory {}

impl SlotMemory {
    pub fn allocate(len: usize) -> Result<Self, CameraError> {
        if len == 0 {
            return Err(CameraError::AllocationFailed(
                "device reported a zero-length buffer".into(),
            ));
        }

        let layout = Layout::from_size_align(len, page_size::get())
            .map_err(|e| CameraError::AllocationFailed(e.to_string()))?;

        // SAFETY: layout has a non-zero size.
        let raw = unsafe { alloc::alloc_zeroed(layout) };
        let ptr = NonNull::new(raw)
            .ok_or_else(|| CameraError::AllocationFailed(format!("out of memory ({len} bytes)")))?;

        Ok(Self { ptr, layout })
    }

    pub fn len(&self) -> usize {
        self.layout.size()
    }

    pub fn is_empty(&self) -> bool {
        self.layout.size() == 0
    }

    /// Stable address handed to the device.
    pub fn as_ptr(&self) -> *mut u8 {
        self.ptr.as_ptr()
    }

    /// Mutable view for device-side writers.
    ///
    /// # Safety
    ///
    /// The caller must be the only party touching the slot, which holds for
    /// a device filling a buffer that is queued to it.
    pub(crate) unsafe fn as_mut_slice(&self) -> &mut [u8] {
        std::slice::from_raw_parts_mut(self.ptr.as_ptr(), self.layout.size())
    }
}

impl AsRef<[u8]> for SlotMemory {
    fn as_ref(&self) -> &[u8] {
        // SAFETY: ptr is valid for layout.size() bytes for the life of self.
        unsafe { std::slice::from_raw_parts(self.ptr.as_ptr(), self.layout.size()) }
    }
}

impl Drop for SlotMemory {
    fn drop(&mut self) {
        // SAFETY: allocated in `allocate` with the same layout.
        unsafe { alloc::dealloc(self.ptr.as_ptr(), self.layout) }
    }
}

/// The filled prefix of a slot, used as the owner behind a frame's `Bytes`.
struct FilledView {
    memory: Arc<SlotMemory>,
    len: usize,
}

impl AsRef<[u8]> for FilledView {
    fn as_ref(&self) -> &[u8] {
        &self.memory.as_ref()[..self.len]
    }
}

/// Zero-copy `Bytes` over the first `bytes_used` bytes of a slot.
pub fn frame_bytes(memory: &Arc<SlotMemory>, bytes_used: usize) -> Bytes {
    let len = bytes_used.min(memory.len());
    Bytes::from_owner(FilledView {
        memory: Arc::clone(memory),
        len,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn allocation_is_page_aligned_and_zeroed() {
        let mem = SlotMemory::allocate(4096 + 17).unwrap();
        assert_eq!(mem.as_ptr() as usize % page_size::get(), 0);
        assert_eq!(mem.len(), 4096 + 17);
        assert!(mem.as_ref().iter().all(|b| *b == 0));
    }

    #[test]
    fn zero_length_is_an_allocation_failure() {
        assert!(matches!(
            SlotMemory::allocate(0),
            Err(CameraError::AllocationFailed(_))
        ));
    }

    #[test]
    fn frame_bytes_share_the_slot_without_copying() {
        let mem = Arc::new(SlotMemory::allocate(64).unwrap());
        unsafe { mem.as_mut_slice()[..4].copy_from_slice(b"abcd") };

        let bytes = frame_bytes(&mem, 4);
        assert_eq!(&bytes[..], b"abcd");
        assert_eq!(bytes.as_ptr(), mem.as_ptr() as *const u8);

        // Clamped to the slot length.
        assert_eq!(frame_bytes(&mem, 1000).len(), 64);
        drop(mem);
        assert_eq!(&bytes[..2], b"ab");
    }
}
