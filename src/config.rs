//! Tunables of a [`crate::Heap`].

/// Upper bound of [`HeapConfig::max_growth_shift`]. A one page schedule tops
/// out at 65536 pages per chunk.
pub const MAX_GROWTH_SHIFT: u32 = 16;

/// How a heap sizes the chunks it maps and whether it keeps its last chunk.
///
/// The preferred size of the `n`-th chunk is
/// `initial_pages * page_size * 2^min(n / growth_divisor, max_growth_shift)`,
/// so the heap maps bigger chunks the more it has grown, trading fewer map
/// calls for more memory held per chunk. A request that does not fit in the
/// preferred size gets a chunk rounded up to the pages it needs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HeapConfig {
    /// Pages of the first chunk and base unit of the growth schedule.
    pub initial_pages: usize,
    /// Number of growths between two doublings of the chunk size.
    pub growth_divisor: usize,
    /// Cap on the number of doublings, never above [`MAX_GROWTH_SHIFT`].
    pub max_growth_shift: u32,
    /// Keep the only remaining chunk mapped when it becomes entirely free.
    pub retain_last_chunk: bool,
}

impl HeapConfig {
    /// One page chunks, doubling every 4 growths up to 64 pages, and the last
    /// chunk kept mapped.
    pub const fn new() -> Self {
        Self {
            initial_pages: 1,
            growth_divisor: 4,
            max_growth_shift: 6,
            retain_last_chunk: true,
        }
    }

    /// Sets the pages of the first chunk. Zero is taken as one.
    pub const fn with_initial_pages(mut self, pages: usize) -> Self {
        self.initial_pages = if pages == 0 { 1 } else { pages };
        self
    }

    /// Sets how many growths separate two doublings. Zero is taken as one.
    pub const fn with_growth_divisor(mut self, divisor: usize) -> Self {
        self.growth_divisor = if divisor == 0 { 1 } else { divisor };
        self
    }

    /// Sets the cap on doublings, clamped to [`MAX_GROWTH_SHIFT`].
    pub const fn with_max_growth_shift(mut self, shift: u32) -> Self {
        self.max_growth_shift = if shift > MAX_GROWTH_SHIFT {
            MAX_GROWTH_SHIFT
        } else {
            shift
        };
        self
    }

    /// Sets whether the only chunk left stays mapped once it is all free.
    pub const fn with_retain_last_chunk(mut self, retain: bool) -> Self {
        self.retain_last_chunk = retain;
        self
    }

    /// Doublings applied to the chunk mapped after `growths` previous ones.
    pub(crate) fn growth_shift(&self, growths: usize) -> u32 {
        let steps = growths / self.growth_divisor.max(1);
        let cap = self.max_growth_shift.min(MAX_GROWTH_SHIFT);

        steps.min(cap as usize) as u32
    }
}

impl Default for HeapConfig {
    fn default() -> Self {
        Self::new()
    }
}
