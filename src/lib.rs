//! # chunkalloc
//!
//! A general purpose heap built directly on top of page mappings.
//!
//! Memory is requested from the kernel in whole pages (see [`PageMapper`]) and
//! carved into blocks. Every block carries a boundary tag at both ends, so the
//! heap can step to the previous block as easily as to the next one:
//!
//! ```text
//!   +--------+-----------------------+--------+--------+-----------+--------+
//!   | header |        payload        | footer | header |  payload  | footer | ...
//!   +--------+-----------------------+--------+--------+-----------+--------+
//!   |<---------------- size ----------------->|
//! ```
//!
//! Mapped regions are called chunks. Each one starts with a prologue block and
//! ends with a terminator block, two permanently allocated sentinels that keep
//! every walk and every merge inside the chunk. Chunks are kept in a doubly
//! linked list whose nodes live in the chunks themselves.
//!
//! - Allocation is first fit, starting with the chunk that served the previous
//!   request. Large free blocks are split; when nothing fits a new chunk is
//!   mapped, bigger the more the heap has grown (see [`HeapConfig`]).
//! - Freeing merges the block with its free neighbours at once, so no two free
//!   blocks are ever adjacent. A chunk left with a single free block is
//!   unmapped.
//! - [`Heap::check_heap`] and [`Heap::can_free`] audit the heap without
//!   touching it. [`Heap::deallocate`] itself trusts its caller.
//!
//! ```rust,no_run
//! use chunkalloc::Heap;
//!
//! let mut heap = Heap::new();
//! heap.init().expect("cannot map the first chunk");
//!
//! let ptr = heap.allocate(64).expect("out of memory");
//! unsafe { ptr.as_ptr().write_bytes(0, 64) };
//!
//! assert!(heap.can_free(ptr.as_ptr()));
//! unsafe { heap.deallocate(ptr) };
//! assert!(heap.check_heap());
//! ```
//!
//! ## Limitations
//!
//! - **Single-threaded only**: a [`Heap`] is neither `Send` nor `Sync`.
//! - **Fixed alignment**: payloads are aligned to [`ALIGNMENT`] bytes, no more.

mod block;
mod chunk;
mod config;
mod dump;
mod error;
mod heap;
mod list;
mod mapper;
mod utils;
mod validate;

pub use block::{MAX_BLOCK_SIZE, MIN_BLOCK_SIZE, OVERHEAD};
pub use config::{HeapConfig, MAX_GROWTH_SHIFT};
pub use dump::{BlockSnapshot, ChunkSnapshot, HeapSnapshot};
pub use error::{HeapError, HeapViolation};
pub use heap::Heap;
pub use mapper::{PageMapper, SystemMapper};
pub use utils::{ALIGNMENT, align};
