use thiserror::Error;

/// Why an allocation request failed. Every failure leaves the heap as it was.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum HeapError {
    #[error("Invalid size (must be > 0)")]
    ZeroSize,

    #[error("Request too large: {size} bytes")]
    TooLarge { size: usize },

    #[error("Out of memory (could not map a chunk of {requested} bytes)")]
    OutOfMemory { requested: usize },
}

/// First inconsistency found while walking the heap. Addresses are payload
/// addresses for blocks and base addresses for chunks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum HeapViolation {
    #[error("chunk {chunk:#x} is not mapped")]
    ChunkNotMapped { chunk: usize },

    #[error("chunk {chunk:#x} has an invalid size of {size} bytes")]
    BadChunkSize { chunk: usize, size: usize },

    #[error("chunk {chunk:#x} does not start with a prologue")]
    BadPrologue { chunk: usize },

    #[error("block {addr:#x} is not a valid terminator")]
    BadTerminator { addr: usize },

    #[error("block {addr:#x} is not aligned")]
    Misaligned { addr: usize },

    #[error("boundary tag of block {addr:#x} is not mapped")]
    NotMapped { addr: usize },

    #[error("block {addr:#x} has an invalid size of {size} bytes")]
    BadSize { addr: usize, size: usize },

    #[error("block {addr:#x} runs past the end of its chunk")]
    OutOfChunk { addr: usize },

    #[error("block {addr:#x} header {header:?} does not match footer {footer:?}")]
    TagMismatch {
        addr: usize,
        header: (usize, usize),
        footer: (usize, usize),
    },

    #[error("block {addr:#x} has an unknown state {state}")]
    BadState { addr: usize, state: usize },

    #[error("free blocks at {addr:#x} and its predecessor were not coalesced")]
    AdjacentFree { addr: usize },

    #[error("last used chunk {chunk:#x} is not in the registry")]
    StaleCache { chunk: usize },
}
