//! Presentation of the heap layout, for debugging and tests.

use std::fmt;

use crate::{Heap, chunk::Chunk, mapper::PageMapper};

/// Point in time copy of the chunks and blocks of a heap.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HeapSnapshot {
    pub chunks: Vec<ChunkSnapshot>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChunkSnapshot {
    /// Address where the chunk was mapped.
    pub base: usize,
    pub size: usize,
    /// Payload blocks in address order, sentinels excluded.
    pub blocks: Vec<BlockSnapshot>,
    /// Whether the walk over the chunk ended on a well formed terminator.
    pub complete: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockSnapshot {
    /// Payload address.
    pub addr: usize,
    /// Size recorded in the header.
    pub size: usize,
    /// Size recorded in the footer.
    pub footer_size: usize,
    pub allocated: bool,
}

impl<M: PageMapper> Heap<M> {
    /// Copies the layout of every chunk. The walk is the validator's checked
    /// one, so a corrupted chunk is cut short at the first bad block instead of
    /// being read past.
    pub fn snapshot(&self) -> HeapSnapshot {
        let chunks = self
            .chunks
            .nodes()
            .map(|chunk| {
                let mut blocks = Vec::new();
                let mut complete = true;

                for step in self.walk(chunk) {
                    match step {
                        Ok((block, tag)) => blocks.push(BlockSnapshot {
                            addr: block.addr(),
                            size: tag.size,
                            footer_size: tag.size,
                            allocated: tag.is_allocated(),
                        }),
                        Err(_) => {
                            complete = false;
                            break;
                        }
                    }
                }

                ChunkSnapshot {
                    base: Chunk::base(chunk),
                    size: unsafe { Chunk::size(chunk) },
                    blocks,
                    complete,
                }
            })
            .collect();

        HeapSnapshot { chunks }
    }
}

impl HeapSnapshot {
    pub fn block_count(&self) -> usize {
        self.chunks.iter().map(|chunk| chunk.blocks.len()).sum()
    }

    pub fn free_bytes(&self) -> usize {
        self.chunks
            .iter()
            .flat_map(|chunk| &chunk.blocks)
            .filter(|block| !block.allocated)
            .map(|block| block.size)
            .sum()
    }
}

/// One line per chunk:
///
/// ```text
/// [chunk 0 @ 0x7f3a1c000000 | 4096 bytes] [80,1]=[80]--> [3936,0]=[3936]--> [X]
/// ```
impl fmt::Display for HeapSnapshot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (index, chunk) in self.chunks.iter().enumerate() {
            write!(f, "[chunk {index} @ {:#x} | {} bytes] ", chunk.base, chunk.size)?;

            for block in &chunk.blocks {
                write!(
                    f,
                    "[{},{}]=[{}]--> ",
                    block.size, block.allocated as u8, block.footer_size
                )?;
            }

            if chunk.complete {
                writeln!(f, "[X]")?;
            } else {
                writeln!(f, "[?]")?;
            }
        }

        Ok(())
    }
}
