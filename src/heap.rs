use std::ptr::NonNull;

use log::{debug, trace, warn};

use crate::{
    block::{Block, MAX_BLOCK_SIZE, MIN_BLOCK_SIZE, OVERHEAD},
    chunk::{Chunk, ChunkPtr, chunk_size, required_chunk_size},
    config::HeapConfig,
    error::HeapError,
    list::{Link, List, Node},
    mapper::{PageMapper, SystemMapper},
    utils::{ALIGNMENT, align},
};

/// A boundary-tag heap over chunks obtained from a [`PageMapper`].
///
/// Every allocation is served first-fit from the blocks of the mapped chunks,
/// starting with the chunk that served the previous request. When nothing
/// fits, a new chunk is mapped. Freed blocks are merged with their free
/// neighbours right away, and a chunk that becomes one single free block is
/// unmapped.
///
/// The heap is single threaded: it holds raw pointers into its chunks, so it
/// is neither `Send` nor `Sync`. Dropping it unmaps every chunk it still owns.
pub struct Heap<M: PageMapper = SystemMapper> {
    /// Where chunks come from and go back to.
    pub(crate) mapper: M,
    pub(crate) config: HeapConfig,
    /// Registry of mapped chunks, in mapping order.
    pub(crate) chunks: List<Chunk>,
    /// Chunk that served the last allocation.
    pub(crate) last_used: Link<Node<Chunk>>,
    /// Number of chunks mapped over the life of the heap.
    pub(crate) growths: usize,
}

impl Heap<SystemMapper> {
    /// Creates an empty heap over the operating system's pages.
    pub fn new() -> Self {
        Self::with_config(HeapConfig::default())
    }

    /// Creates an empty heap over the operating system's pages, sizing and
    /// releasing chunks as `config` says.
    pub fn with_config(config: HeapConfig) -> Self {
        Self::with_mapper(SystemMapper::new(), config)
    }
}

impl Default for Heap<SystemMapper> {
    fn default() -> Self {
        Self::new()
    }
}

impl<M: PageMapper> Heap<M> {
    /// Creates an empty heap. No memory is mapped until [`Heap::init`] or the
    /// first allocation.
    pub fn with_mapper(mapper: M, config: HeapConfig) -> Self {
        Self {
            mapper,
            config,
            chunks: List::new(),
            last_used: None,
            growths: 0,
        }
    }

    /// Maps the initial chunk. Calling it again on a heap that already owns a
    /// chunk does nothing.
    pub fn init(&mut self) -> Result<(), HeapError> {
        if !self.chunks.is_empty() {
            return Ok(());
        }

        let (chunk, _) = self.grow(MIN_BLOCK_SIZE)?;
        self.last_used = Some(chunk);

        Ok(())
    }

    /// Allocates at least `size` bytes and returns the payload address, which
    /// is always aligned to [`ALIGNMENT`].
    ///
    /// Fails without side effects when `size` is zero or too large, and when a
    /// new chunk was needed but could not be mapped.
    pub fn allocate(&mut self, size: usize) -> Result<NonNull<u8>, HeapError> {
        if size == 0 {
            return Err(HeapError::ZeroSize);
        }
        if size > MAX_BLOCK_SIZE - OVERHEAD {
            return Err(HeapError::TooLarge { size });
        }

        let needed = align(size + OVERHEAD, ALIGNMENT);

        let (chunk, block) = match self.find_fit(needed) {
            Some(found) => found,
            None => self.grow(needed)?,
        };

        unsafe {
            block.place(needed);
        }
        self.last_used = Some(chunk);

        trace!("allocate({size}) -> {:p} ({needed} byte block)", block.payload());

        Ok(block.payload())
    }

    /// Frees the block at `ptr`, merging it with free neighbours and
    /// unmapping its chunk if the chunk is left with nothing allocated.
    ///
    /// # Safety
    ///
    /// `ptr` must have been returned by [`Heap::allocate`] on this heap and not
    /// freed since. Nothing checks this here; use [`Heap::can_free`] first when
    /// the pointer is not trusted.
    pub unsafe fn deallocate(&mut self, ptr: NonNull<u8>) {
        unsafe {
            let block = Block::from_payload(ptr);
            block.set_allocated(false);

            let merged = block.coalesce();
            trace!(
                "deallocate({ptr:p}) -> free block {:p} of {} bytes",
                merged.payload(),
                merged.size()
            );

            self.release_if_empty(merged);
        }
    }

    /// Number of chunks currently mapped.
    pub fn chunk_count(&self) -> usize {
        self.chunks.len()
    }

    /// Number of chunks mapped since the heap was created, released ones
    /// included.
    pub fn growth_count(&self) -> usize {
        self.growths
    }

    /// Bytes currently mapped by the heap.
    pub fn mapped_bytes(&self) -> usize {
        self.chunks
            .nodes()
            .map(|chunk| unsafe { Chunk::size(chunk) })
            .sum()
    }

    /// Tunables the heap was created with.
    pub fn config(&self) -> &HeapConfig {
        &self.config
    }

    /// Mapper the chunks come from.
    pub fn mapper(&self) -> &M {
        &self.mapper
    }

    /// Unmaps every chunk. Every pointer handed out so far dangles afterwards.
    /// The heap can be used again and will map a fresh chunk when needed.
    pub fn teardown(&mut self) {
        while let Some(chunk) = self.chunks.first() {
            unsafe {
                self.chunks.remove(chunk);
                self.unmap_chunk(chunk);
            }
        }

        self.last_used = None;
    }

    /// Looks for a free block of at least `needed` bytes, first in the chunk
    /// that served the previous request and then in every other chunk in
    /// registry order.
    fn find_fit(&self, needed: usize) -> Option<(ChunkPtr, Block)> {
        if let Some(chunk) = self.last_used {
            if let Some(block) = unsafe { Chunk::first_fit(chunk, needed) } {
                return Some((chunk, block));
            }
        }

        self.chunks
            .nodes()
            .filter(|&chunk| Some(chunk) != self.last_used)
            .find_map(|chunk| unsafe { Chunk::first_fit(chunk, needed) }.map(|block| (chunk, block)))
    }

    /// Maps a new chunk able to hold a block of `needed` bytes, links it at the
    /// tail of the registry and returns it along with its single free block.
    fn grow(&mut self, needed: usize) -> Result<(ChunkPtr, Block), HeapError> {
        let page_size = self.mapper.page_size();

        let Some(mut size) = chunk_size(needed, page_size, self.growths, &self.config) else {
            warn!("cannot size a chunk for a {needed} byte block");
            return Err(HeapError::OutOfMemory { requested: needed });
        };

        let mut mapped = self.mapper.map(size);

        // The schedule may ask for more than the mapper can give.
        if mapped.is_none() {
            if let Some(required) =
                required_chunk_size(needed, page_size).filter(|&required| required < size)
            {
                warn!("failed to map a chunk of {size} bytes, retrying with {required}");
                size = required;
                mapped = self.mapper.map(size);
            }
        }

        let Some(addr) = mapped else {
            warn!("failed to map a chunk of {size} bytes");
            return Err(HeapError::OutOfMemory { requested: size });
        };

        unsafe {
            let chunk = self.chunks.append(Chunk { size }, addr);
            let block = Chunk::format(chunk);

            self.growths += 1;
            debug!(
                "mapped chunk #{} at {addr:p} ({size} bytes, {} chunks)",
                self.growths,
                self.chunks.len()
            );

            Ok((chunk, block))
        }
    }

    /// Unmaps the chunk of `block` if `block` is the only block between its
    /// prologue and its terminator.
    unsafe fn release_if_empty(&mut self, block: Block) {
        unsafe {
            let prev = block.prev();
            if !prev.is_prologue() || !block.next().is_terminator() {
                return;
            }

            if self.config.retain_last_chunk && self.chunks.len() == 1 {
                return;
            }

            let chunk = Chunk::from_prologue(prev);
            self.chunks.remove(chunk);

            if self.last_used == Some(chunk) {
                self.last_used = self.chunks.first();
            }

            debug!(
                "releasing chunk at {:p} ({} bytes, {} chunks left)",
                chunk,
                Chunk::size(chunk),
                self.chunks.len()
            );

            self.unmap_chunk(chunk);
        }
    }

    /// Gives the chunk back to the mapper. It must already be unlinked.
    unsafe fn unmap_chunk(&mut self, chunk: ChunkPtr) {
        unsafe {
            let size = Chunk::size(chunk);
            self.mapper.unmap(chunk.cast(), size);
        }
    }
}

impl<M: PageMapper> Drop for Heap<M> {
    fn drop(&mut self) {
        self.teardown();
    }
}
