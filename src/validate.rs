//! Read-only consistency checks over the heap.
//!
//! None of this runs on the allocation paths. [`Heap::check_heap`] audits the
//! whole heap and [`Heap::can_free`] tells whether a pointer may be given to
//! [`Heap::deallocate`]. Both assume nothing about the memory they walk: every
//! tag is bounds checked and asked to the mapper before it is read.

use std::ptr::NonNull;

use log::debug;

use crate::{
    Heap,
    block::{ALLOCATED, Block, FREE, MAX_BLOCK_SIZE, MIN_BLOCK_SIZE, PROLOGUE_SIZE, TAG_SIZE, Tag},
    chunk::{CHUNK_HEADER_SIZE, CHUNK_OVERHEAD, Chunk, ChunkPtr},
    error::HeapViolation,
    mapper::PageMapper,
    utils::{ALIGNMENT, is_aligned},
};

impl<M: PageMapper> Heap<M> {
    /// Walks every chunk and every block of the heap and tells whether all of
    /// its invariants hold.
    pub fn check_heap(&self) -> bool {
        self.verify().is_ok()
    }

    /// Like [`Heap::check_heap`], but reports the first violation found.
    pub fn verify(&self) -> Result<(), HeapViolation> {
        let result = self.verify_chunks();

        if let Err(violation) = &result {
            debug!("heap check failed: {violation}");
        }

        result
    }

    /// Tells whether `ptr` is the payload of a block of this heap that is
    /// currently allocated, that is, whether [`Heap::deallocate`] may be
    /// called with it.
    pub fn can_free(&self, ptr: *const u8) -> bool {
        let addr = ptr as usize;

        if ptr.is_null() || !is_aligned(addr, ALIGNMENT) {
            return false;
        }

        let Some(chunk) = self.owning_chunk(addr) else {
            return false;
        };

        if !self.mapper.is_mapped(ptr.wrapping_sub(TAG_SIZE), TAG_SIZE) {
            return false;
        }

        // Only block boundaries reached by walking the chunk count, which rules
        // out sentinels and pointers into the middle of a payload.
        for step in self.walk(chunk) {
            match step {
                Ok((block, tag)) if block.addr() == addr => return tag.is_allocated(),
                Ok((block, _)) if block.addr() > addr => return false,
                Ok(_) => {}
                Err(_) => return false,
            }
        }

        false
    }

    fn verify_chunks(&self) -> Result<(), HeapViolation> {
        if let Some(chunk) = self.last_used {
            if !self.chunks.contains(chunk) {
                return Err(HeapViolation::StaleCache {
                    chunk: Chunk::base(chunk),
                });
            }
        }

        for chunk in self.chunks.nodes() {
            self.verify_chunk(chunk)?;

            let mut prev_free = false;
            for step in self.walk(chunk) {
                let (block, tag) = step?;
                let free = !tag.is_allocated();

                if free && prev_free {
                    return Err(HeapViolation::AdjacentFree { addr: block.addr() });
                }
                prev_free = free;
            }
        }

        Ok(())
    }

    /// Checks the chunk itself and its prologue.
    fn verify_chunk(&self, chunk: ChunkPtr) -> Result<(), HeapViolation> {
        let base = Chunk::base(chunk);
        let page_size = self.mapper.page_size();

        if !self.mapper.is_mapped(chunk.as_ptr().cast::<u8>(), CHUNK_HEADER_SIZE) {
            return Err(HeapViolation::ChunkNotMapped { chunk: base });
        }

        let size = unsafe { Chunk::size(chunk) };
        if size % page_size != 0 || size < CHUNK_OVERHEAD + MIN_BLOCK_SIZE {
            return Err(HeapViolation::BadChunkSize { chunk: base, size });
        }

        if !self.mapper.is_mapped(chunk.as_ptr().cast::<u8>(), size) {
            return Err(HeapViolation::ChunkNotMapped { chunk: base });
        }

        unsafe {
            let prologue = Chunk::prologue(chunk);
            let header = prologue.header();

            // The footer is only located once the header size is known good.
            if header != Tag::new(PROLOGUE_SIZE, true) || prologue.footer() != header {
                return Err(HeapViolation::BadPrologue { chunk: base });
            }
        }

        Ok(())
    }

    /// The chunk whose blocks may contain `addr`.
    fn owning_chunk(&self, addr: usize) -> Option<ChunkPtr> {
        self.chunks
            .nodes()
            .find(|&chunk| unsafe { Chunk::contains(chunk, addr) })
    }

    /// Checked walk over the payload blocks of `chunk`.
    pub(crate) fn walk(&self, chunk: ChunkPtr) -> Walk<'_, M> {
        unsafe {
            Walk {
                mapper: &self.mapper,
                next: Chunk::first_block(chunk).addr(),
                end: Chunk::end(chunk),
                done: false,
            }
        }
    }
}

/// Iterator over the blocks of one chunk that checks each block before
/// yielding it, and checks the terminator at the end. It stops after the first
/// violation.
pub(crate) struct Walk<'a, M> {
    mapper: &'a M,
    /// Payload address of the next block to check.
    next: usize,
    /// End of the chunk, where the terminator's payload must be.
    end: usize,
    done: bool,
}

impl<M: PageMapper> Walk<'_, M> {
    fn step(&mut self) -> Result<Option<(Block, Tag)>, HeapViolation> {
        let addr = self.next;

        if addr > self.end {
            return Err(HeapViolation::OutOfChunk { addr });
        }
        if !is_aligned(addr, ALIGNMENT) {
            return Err(HeapViolation::Misaligned { addr });
        }

        let Some(payload) = NonNull::new(addr as *mut u8) else {
            return Err(HeapViolation::NotMapped { addr });
        };
        let block = unsafe { Block::from_payload(payload) };

        if !self.mapper.is_mapped(block.header_ptr().cast::<u8>(), TAG_SIZE) {
            return Err(HeapViolation::NotMapped { addr });
        }
        let header = unsafe { block.header() };

        if addr == self.end {
            if header != Tag::new(0, true) {
                return Err(HeapViolation::BadTerminator { addr });
            }
            return Ok(None);
        }
        if header.size == 0 {
            return Err(HeapViolation::BadTerminator { addr });
        }

        let size = header.size;
        if size < MIN_BLOCK_SIZE || size > MAX_BLOCK_SIZE || !is_aligned(size, ALIGNMENT) {
            return Err(HeapViolation::BadSize { addr, size });
        }
        if size > self.end - addr {
            return Err(HeapViolation::OutOfChunk { addr });
        }
        if header.state != FREE && header.state != ALLOCATED {
            return Err(HeapViolation::BadState {
                addr,
                state: header.state,
            });
        }

        let footer_ptr = block.footer_ptr_for(size);
        if !self.mapper.is_mapped(footer_ptr.cast::<u8>(), TAG_SIZE) {
            return Err(HeapViolation::NotMapped { addr });
        }
        let footer = unsafe { footer_ptr.read() };

        if footer != header {
            return Err(HeapViolation::TagMismatch {
                addr,
                header: (header.size, header.state),
                footer: (footer.size, footer.state),
            });
        }

        self.next = addr + size;

        Ok(Some((block, header)))
    }
}

impl<M: PageMapper> Iterator for Walk<'_, M> {
    type Item = Result<(Block, Tag), HeapViolation>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }

        match self.step() {
            Ok(Some(item)) => Some(Ok(item)),
            Ok(None) => {
                self.done = true;
                None
            }
            Err(violation) => {
                self.done = true;
                Some(Err(violation))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use crate::{
        Heap, HeapConfig, HeapViolation,
        block::{Block, Tag},
        chunk::Chunk,
        mapper::{PageMapper, testing::CountingMapper},
    };

    fn heap() -> Heap<CountingMapper> {
        let mut heap = Heap::with_mapper(CountingMapper::new(), HeapConfig::default());
        heap.init().unwrap();
        heap
    }

    #[test]
    fn empty_and_fresh_heaps_are_valid() {
        let empty = Heap::with_mapper(CountingMapper::new(), HeapConfig::default());
        assert!(empty.check_heap());

        let heap = heap();
        assert_eq!(heap.verify(), Ok(()));
    }

    #[test]
    fn can_free_only_live_allocations() {
        let mut heap = heap();
        let page = heap.mapper().page_size();

        let a = heap.allocate(48).unwrap();
        let b = heap.allocate(300).unwrap();
        let c = heap.allocate(3 * page).unwrap();

        for ptr in [a, b, c] {
            assert!(heap.can_free(ptr.as_ptr()));
        }

        unsafe { heap.deallocate(b) };
        assert!(!heap.can_free(b.as_ptr()));
        assert!(heap.can_free(a.as_ptr()));
        assert!(heap.can_free(c.as_ptr()));

        unsafe { heap.deallocate(c) };
        assert!(!heap.can_free(c.as_ptr()));

        let b2 = heap.allocate(300).unwrap();
        assert_eq!(b2, b);
        assert!(heap.can_free(b2.as_ptr()));
    }

    #[test]
    fn can_free_rejects_foreign_pointers() {
        let mut heap = heap();
        let mut other = self::heap();

        let ptr = heap.allocate(256).unwrap();
        let foreign = other.allocate(256).unwrap();

        assert!(!heap.can_free(std::ptr::null()));
        assert!(!heap.can_free(ptr.as_ptr().wrapping_add(1)));
        assert!(!heap.can_free(ptr.as_ptr().wrapping_add(16)));
        assert!(!heap.can_free(ptr.as_ptr().wrapping_add(64)));
        assert!(!heap.can_free(foreign.as_ptr()));
        assert!(other.can_free(foreign.as_ptr()));

        let local = 0u128;
        assert!(!heap.can_free(&local as *const u128 as *const u8));
    }

    #[test]
    fn can_free_rejects_sentinels() {
        let heap = heap();
        let chunk = heap.chunks.first().unwrap();

        unsafe {
            let prologue = Chunk::prologue(chunk);
            assert!(!heap.can_free(prologue.payload().as_ptr()));

            let terminator = Chunk::end(chunk) as *const u8;
            assert!(!heap.can_free(terminator));
        }
    }

    #[test]
    fn detects_mismatched_footer() {
        let mut heap = heap();
        let a = heap.allocate(64).unwrap();
        let _b = heap.allocate(64).unwrap();

        unsafe {
            let block = Block::from_payload(a);
            let footer = block.footer_ptr_for(block.size());
            let saved = footer.read();

            footer.write(Tag::new(saved.size + 16, true));
            assert!(matches!(heap.verify(), Err(HeapViolation::TagMismatch { .. })));
            assert!(!heap.check_heap());
            assert!(!heap.can_free(a.as_ptr()));

            footer.write(saved);
        }

        assert!(heap.check_heap());
        assert!(heap.can_free(a.as_ptr()));
    }

    #[test]
    fn detects_uncoalesced_neighbours() {
        let mut heap = heap();
        let a = heap.allocate(64).unwrap();
        let b = heap.allocate(64).unwrap();
        let _c = heap.allocate(64).unwrap();

        unsafe {
            Block::from_payload(a).set_allocated(false);
            Block::from_payload(b).set_allocated(false);
        }

        assert_eq!(
            heap.verify(),
            Err(HeapViolation::AdjacentFree {
                addr: b.as_ptr() as usize
            })
        );

        unsafe {
            Block::from_payload(a).set_allocated(true);
            Block::from_payload(b).set_allocated(true);
        }
        assert!(heap.check_heap());
    }

    #[test]
    fn detects_broken_prologue_and_sizes() {
        let mut heap = heap();
        let a = heap.allocate(64).unwrap();
        let chunk = heap.chunks.first().unwrap();

        unsafe {
            let prologue = Chunk::prologue(chunk);
            let saved = prologue.header();
            prologue.header_ptr().write(Tag::new(saved.size, false));

            assert_eq!(
                heap.verify(),
                Err(HeapViolation::BadPrologue {
                    chunk: Chunk::base(chunk)
                })
            );
            prologue.header_ptr().write(saved);

            let block = Block::from_payload(a);
            let saved = block.header();
            block.header_ptr().write(Tag::new(24, true));
            assert!(matches!(heap.verify(), Err(HeapViolation::BadSize { size: 24, .. })));

            block.header_ptr().write(Tag::new(1 << 30, true));
            assert!(matches!(
                heap.verify(),
                Err(HeapViolation::OutOfChunk { .. } | HeapViolation::BadSize { .. })
            ));

            block.header_ptr().write(Tag {
                size: saved.size,
                state: 7 << 8,
            });
            assert!(matches!(heap.verify(), Err(HeapViolation::BadState { .. })));

            block.header_ptr().write(saved);
        }

        assert!(heap.check_heap());
    }

    #[test]
    fn detects_unmapped_chunks() {
        let mut heap = Heap::with_mapper(
            CountingMapper::new(),
            HeapConfig::default().with_initial_pages(2),
        );
        heap.init().unwrap();
        let page = heap.mapper().page_size();
        let ptr = heap.allocate(64).unwrap();
        let chunk = heap.chunks.first().unwrap();
        let base = Chunk::base(chunk);

        heap.mapper().hide(base, 2 * page);
        assert_eq!(heap.verify(), Err(HeapViolation::ChunkNotMapped { chunk: base }));
        assert!(!heap.can_free(ptr.as_ptr()));

        // Header readable, tail of the chunk gone.
        heap.mapper().hide(base + page, page);
        assert_eq!(heap.verify(), Err(HeapViolation::ChunkNotMapped { chunk: base }));

        heap.mapper().reveal();
        assert!(heap.check_heap());
        assert!(heap.can_free(ptr.as_ptr()));
    }

    #[test]
    fn detects_unmapped_boundary_tags() {
        let mut heap = heap();
        let a = heap.allocate(64).unwrap();
        let b = heap.allocate(64).unwrap();
        let chunk = heap.chunks.first().unwrap();

        let header = unsafe { Block::from_payload(b) }.header_ptr() as usize;
        heap.mapper().hide(header, 16);

        let mut walk = heap.walk(chunk);
        assert!(matches!(walk.next(), Some(Ok((block, _))) if block.payload() == a));
        assert_eq!(
            walk.next(),
            Some(Err(HeapViolation::NotMapped {
                addr: b.as_ptr() as usize
            }))
        );
        assert!(walk.next().is_none());

        assert!(!heap.can_free(b.as_ptr()));
        assert!(heap.can_free(a.as_ptr()));

        // A hidden footer stops the walk at the block it closes.
        let footer = unsafe {
            let block = Block::from_payload(a);
            block.footer_ptr_for(block.size()) as usize
        };
        heap.mapper().hide(footer, 16);
        assert!(!heap.can_free(a.as_ptr()));
        assert_eq!(
            heap.walk(chunk).next(),
            Some(Err(HeapViolation::NotMapped {
                addr: a.as_ptr() as usize
            }))
        );

        heap.mapper().reveal();
        assert!(heap.can_free(a.as_ptr()));
        assert!(heap.can_free(b.as_ptr()));
    }

    #[test]
    fn detects_bad_chunk_sizes() {
        let heap = heap();
        let page = heap.mapper().page_size();
        let chunk = heap.chunks.first().unwrap();
        let base = Chunk::base(chunk);

        unsafe {
            let size = &raw mut (*chunk.as_ptr()).data.size;

            size.write(page + 16);
            assert_eq!(
                heap.verify(),
                Err(HeapViolation::BadChunkSize {
                    chunk: base,
                    size: page + 16
                })
            );

            size.write(0);
            assert!(matches!(heap.verify(), Err(HeapViolation::BadChunkSize { size: 0, .. })));

            size.write(page);
        }

        assert!(heap.check_heap());
    }

    #[test]
    fn detects_missing_terminator() {
        let heap = heap();
        let chunk = heap.chunks.first().unwrap();

        unsafe {
            let terminator = Block::from_payload(
                std::ptr::NonNull::new(Chunk::end(chunk) as *mut u8).unwrap(),
            );
            let saved = terminator.header();
            terminator.header_ptr().write(Tag::new(48, true));

            assert!(matches!(heap.verify(), Err(HeapViolation::BadTerminator { .. })));

            terminator.header_ptr().write(saved);
        }

        assert!(heap.check_heap());
    }
}
