use std::{mem, ptr::NonNull};

use crate::utils::{ALIGNMENT, align_down};

/// Size of one boundary tag. Every block carries two of them.
pub(crate) const TAG_SIZE: usize = mem::size_of::<Tag>();

/// Bytes of every block used by its header and footer.
pub const OVERHEAD: usize = 2 * TAG_SIZE;

/// The smallest block that can hold a header, a footer and one alignment unit
/// of payload.
pub const MIN_BLOCK_SIZE: usize = OVERHEAD + ALIGNMENT;

/// The largest size a block header may record.
pub const MAX_BLOCK_SIZE: usize = align_down(isize::MAX as usize, ALIGNMENT);

/// Size of the prologue sentinel. It has no payload, which makes it smaller than
/// any real block.
pub(crate) const PROLOGUE_SIZE: usize = OVERHEAD;

/// Size recorded in the terminator sentinel header.
pub(crate) const TERMINATOR_SIZE: usize = 0;

/// [`Tag::state`] of a free block.
pub(crate) const FREE: usize = 0;

/// [`Tag::state`] of an allocated block (sentinels included).
pub(crate) const ALLOCATED: usize = 1;

/// One boundary tag. Headers and footers share this layout so that a block can
/// be read from either end.
///
/// The state is a full word rather than a `bool` so that the validator can
/// read a tag out of possibly corrupted memory without producing an invalid
/// value.
#[repr(C, align(16))]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Tag {
    /// Size of the whole block, header and footer included.
    pub size: usize,
    /// Either [`FREE`] or [`ALLOCATED`].
    pub state: usize,
}

impl Tag {
    #[inline]
    pub const fn new(size: usize, allocated: bool) -> Self {
        Self {
            size,
            state: if allocated { ALLOCATED } else { FREE },
        }
    }

    #[inline]
    pub const fn is_allocated(&self) -> bool {
        self.state != FREE
    }
}

/// Handle to a block, identified by its payload address.
///
/// ```text
/// +---------------------+ <------+
/// |        size         |        |
/// +---------------------+        | -> Header (one Tag)
/// |        state        |        |
/// +---------------------+ <------+ <--- payload address
/// |       Payload       |        |
/// |         ...         |        | -> size - OVERHEAD bytes
/// |         ...         |        |
/// +---------------------+ <------+
/// |        size         |        |
/// +---------------------+        | -> Footer (one Tag)
/// |        state        |        |
/// +---------------------+ <------+ <--- next block's header
/// ```
///
/// Neighbours are never stored: the next block starts right after the footer
/// and the previous block's size is read from its footer, which sits right
/// before this block's header. The prologue and terminator sentinels at the
/// edges of every chunk are always allocated, so walking one block in either
/// direction from a payload block never leaves the chunk.
///
/// None of the accessors check anything. The caller guarantees the handle
/// points at a block of a well formed chunk; the validator does its own
/// bounds checks before it builds one.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Block {
    payload: NonNull<u8>,
}

impl Block {
    /// # Safety
    ///
    /// `payload` must be the payload address of a block (or sentinel) whose
    /// header lies inside a live chunk.
    #[inline]
    pub unsafe fn from_payload(payload: NonNull<u8>) -> Self {
        Self { payload }
    }

    #[inline]
    pub fn payload(self) -> NonNull<u8> {
        self.payload
    }

    #[inline]
    pub fn addr(self) -> usize {
        self.payload.as_ptr() as usize
    }

    #[inline]
    pub fn header_ptr(self) -> *mut Tag {
        self.payload.as_ptr().wrapping_sub(TAG_SIZE).cast()
    }

    /// Where the footer of this block would be if it had `size` bytes.
    #[inline]
    pub fn footer_ptr_for(self, size: usize) -> *mut Tag {
        self.payload
            .as_ptr()
            .wrapping_add(size)
            .wrapping_sub(OVERHEAD)
            .cast()
    }

    #[inline]
    pub unsafe fn header(self) -> Tag {
        unsafe { self.header_ptr().read() }
    }

    #[inline]
    pub unsafe fn footer(self) -> Tag {
        unsafe { self.footer_ptr_for(self.size()).read() }
    }

    #[inline]
    pub unsafe fn size(self) -> usize {
        unsafe { self.header().size }
    }

    #[inline]
    pub unsafe fn is_allocated(self) -> bool {
        unsafe { self.header().is_allocated() }
    }

    #[inline]
    pub unsafe fn is_prologue(self) -> bool {
        unsafe { self.size() == PROLOGUE_SIZE }
    }

    #[inline]
    pub unsafe fn is_terminator(self) -> bool {
        unsafe { self.size() == TERMINATOR_SIZE }
    }

    /// Writes both boundary tags of a block of `size` bytes.
    pub unsafe fn write(self, size: usize, allocated: bool) {
        let tag = Tag::new(size, allocated);

        unsafe {
            self.header_ptr().write(tag);
            self.footer_ptr_for(size).write(tag);
        }
    }

    /// Writes the header of a terminator. A terminator has no footer: its
    /// header is the last tag of the chunk.
    pub unsafe fn write_terminator(self) {
        unsafe { self.header_ptr().write(Tag::new(TERMINATOR_SIZE, true)) }
    }

    /// Flips the allocated state in both tags, keeping them in sync.
    pub unsafe fn set_allocated(self, allocated: bool) {
        unsafe { self.write(self.size(), allocated) }
    }

    /// The block physically after this one.
    #[inline]
    pub unsafe fn next(self) -> Block {
        unsafe { Block::from_payload(self.payload.add(self.size())) }
    }

    /// The block physically before this one, found through its footer.
    #[inline]
    pub unsafe fn prev(self) -> Block {
        unsafe {
            let prev_footer = self.payload.as_ptr().sub(OVERHEAD).cast::<Tag>();
            let prev_size = prev_footer.read().size;

            Block::from_payload(self.payload.sub(prev_size))
        }
    }

    /// Allocates this free block for a request of `needed` bytes (overhead
    /// included, already aligned).
    ///
    /// When the slack left over exceeds [`MIN_BLOCK_SIZE`] the block is split
    /// and the remainder becomes a new free block, which is returned. Otherwise
    /// the whole block is handed out and the slack is accepted as internal
    /// fragmentation.
    pub unsafe fn place(self, needed: usize) -> Option<Block> {
        unsafe {
            let size = self.size();
            let slack = size - needed;

            if slack > MIN_BLOCK_SIZE {
                self.write(needed, true);

                let rest = self.next();
                rest.write(slack, false);

                Some(rest)
            } else {
                self.write(size, true);

                None
            }
        }
    }

    /// Merges this freshly freed block with its free neighbours and returns
    /// the resulting block, which is this one or its predecessor.
    pub unsafe fn coalesce(self) -> Block {
        unsafe {
            let prev = self.prev();
            let next = self.next();

            match (prev.is_allocated(), next.is_allocated()) {
                (true, true) => self,
                (true, false) => {
                    self.write(self.size() + next.size(), false);
                    self
                }
                (false, true) => {
                    prev.write(prev.size() + self.size(), false);
                    prev
                }
                (false, false) => {
                    prev.write(prev.size() + self.size() + next.size(), false);
                    prev
                }
            }
        }
    }
}
