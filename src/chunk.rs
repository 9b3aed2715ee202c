use std::{mem, ptr::NonNull};

use crate::{
    block::{Block, MAX_BLOCK_SIZE, MIN_BLOCK_SIZE, PROLOGUE_SIZE, TAG_SIZE},
    config::HeapConfig,
    list::Node,
    utils::{ALIGNMENT, align},
};

/// Bytes taken by the [`Node<Chunk>`] written at the start of every chunk,
/// padded so that the prologue payload stays aligned.
pub(crate) const CHUNK_HEADER_SIZE: usize = align(mem::size_of::<Node<Chunk>>(), ALIGNMENT);

/// Bytes of every chunk that can never be handed out: the chunk header, the
/// prologue and the terminator header.
pub(crate) const CHUNK_OVERHEAD: usize = CHUNK_HEADER_SIZE + PROLOGUE_SIZE + TAG_SIZE;

/// Chunk specific metadata. As every other header, it is stored as a
/// [`Node<Chunk>`] so the registry can link chunks without allocating.
///
/// [`crate::PageMapper::map`] gives us page aligned regions but we cannot
/// assume they are adjacent, so every chunk is a self contained run of blocks
/// bounded by two sentinels:
///
/// ```text
///  base
///   |
///   v
/// +------------+----------+-------+-------+-----+-------+------------+
/// | Node<Chunk>| Prologue | Block | Block | ... | Block | Terminator |
/// |  (padded)  | (32, A)  |       |       |     |       |  (0, A)    |
/// +------------+----------+-------+-------+-----+-------+------------+
///                                                                    ^
///                                                             base + size
/// ```
///
/// Chunks are linked together in the heap's registry:
///
/// ```text
/// +-----------------------------------+      +-----------------------------------+
/// |       | +---+ +-------+ +---+ +-+ |      |       | +---+ +-------+ +---+ +-+ |
/// | Chunk | | P | | Block | |...| |T| | <--> | Chunk | | P | | Block | |...| |T| |
/// |       | +---+ +-------+ +---+ +-+ |      |       | +---+ +-------+ +---+ +-+ |
/// +-----------------------------------+      +-----------------------------------+
/// ```
pub(crate) struct Chunk {
    /// Size of the mapped region, chunk header included.
    pub size: usize,
}

/// Pointer to a chunk as stored in the registry.
pub(crate) type ChunkPtr = NonNull<Node<Chunk>>;

impl Chunk {
    #[inline]
    pub fn base(chunk: ChunkPtr) -> usize {
        chunk.as_ptr() as usize
    }

    #[inline]
    pub unsafe fn size(chunk: ChunkPtr) -> usize {
        unsafe { chunk.as_ref().data.size }
    }

    /// One past the last byte of the chunk, which is also the payload
    /// address of its terminator.
    #[inline]
    pub unsafe fn end(chunk: ChunkPtr) -> usize {
        unsafe { Self::base(chunk) + Self::size(chunk) }
    }

    /// Whether `addr` falls inside the part of the chunk after its header.
    #[inline]
    pub unsafe fn contains(chunk: ChunkPtr, addr: usize) -> bool {
        unsafe { addr > Self::base(chunk) + CHUNK_HEADER_SIZE && addr < Self::end(chunk) }
    }

    #[inline]
    pub unsafe fn prologue(chunk: ChunkPtr) -> Block {
        unsafe {
            let payload = chunk.cast::<u8>().add(CHUNK_HEADER_SIZE + TAG_SIZE);

            Block::from_payload(payload)
        }
    }

    #[inline]
    pub unsafe fn first_block(chunk: ChunkPtr) -> Block {
        unsafe {
            let payload = chunk.cast::<u8>().add(CHUNK_HEADER_SIZE + TAG_SIZE + PROLOGUE_SIZE);

            Block::from_payload(payload)
        }
    }

    /// The chunk whose prologue is `prologue`.
    #[inline]
    pub unsafe fn from_prologue(prologue: Block) -> ChunkPtr {
        unsafe {
            prologue
                .payload()
                .sub(CHUNK_HEADER_SIZE + TAG_SIZE)
                .cast::<Node<Chunk>>()
        }
    }

    /// Writes the prologue, one free block spanning everything in between and
    /// the terminator. The chunk header must already be in place.
    ///
    /// Returns the free block.
    pub unsafe fn format(chunk: ChunkPtr) -> Block {
        unsafe {
            let size = Self::size(chunk);

            let prologue = Self::prologue(chunk);
            prologue.write(PROLOGUE_SIZE, true);

            let block = prologue.next();
            block.write(size - CHUNK_OVERHEAD, false);
            block.next().write_terminator();

            block
        }
    }

    /// Payload blocks of the chunk, prologue and terminator excluded.
    #[inline]
    pub unsafe fn blocks(chunk: ChunkPtr) -> Blocks {
        Blocks {
            current: unsafe { Self::first_block(chunk) },
        }
    }

    /// First free block of the chunk with at least `needed` bytes.
    pub unsafe fn first_fit(chunk: ChunkPtr, needed: usize) -> Option<Block> {
        unsafe { Self::blocks(chunk).find(|block| !block.is_allocated() && block.size() >= needed) }
    }
}

/// Iterator over the payload blocks of a well formed chunk.
pub(crate) struct Blocks {
    current: Block,
}

impl Iterator for Blocks {
    type Item = Block;

    fn next(&mut self) -> Option<Self::Item> {
        let block = self.current;

        unsafe {
            if block.is_terminator() {
                return None;
            }

            self.current = block.next();
        }

        Some(block)
    }
}

/// Size of the chunk to map so that a block of `min_block` bytes fits, given
/// how many chunks were mapped before. See [`HeapConfig`] for the schedule.
///
/// A preferred size that cannot be represented gives way to the required one.
/// Returns `None` only if the required size itself cannot be represented.
pub(crate) fn chunk_size(
    min_block: usize,
    page_size: usize,
    growths: usize,
    config: &HeapConfig,
) -> Option<usize> {
    let required = required_chunk_size(min_block, page_size)?;

    let preferred = 1usize
        .checked_shl(config.growth_shift(growths))
        .and_then(|scale| {
            config
                .initial_pages
                .max(1)
                .checked_mul(page_size)?
                .checked_mul(scale)
        })
        .filter(|&size| size <= MAX_BLOCK_SIZE)
        .unwrap_or(0);

    Some(preferred.max(required))
}

/// Smallest page-aligned chunk holding a block of `min_block` bytes.
pub(crate) fn required_chunk_size(min_block: usize, page_size: usize) -> Option<usize> {
    min_block
        .max(MIN_BLOCK_SIZE)
        .checked_add(CHUNK_OVERHEAD)?
        .checked_add(page_size - 1)
        .map(|size| size & !(page_size - 1))
}
