use std::ptr::NonNull;

/// The page-granularity memory primitive the heap is built on.
///
/// As the allocator, our top level view of memory has nothing to do with the
/// concrete APIs offered by each kernel. The heap only ever asks for whole,
/// page-aligned regions and gives whole regions back, so this is all it needs.
pub trait PageMapper {
    /// Request a memory region of `len` bytes, `len` being a multiple of
    /// [`PageMapper::page_size`]. Returns `None` if the underlying call fails.
    fn map(&mut self, len: usize) -> Option<NonNull<u8>>;

    /// Returns the region of `len` bytes starting at `addr` back to the kernel.
    ///
    /// # Safety
    ///
    /// `addr` and `len` must describe exactly one region previously returned by
    /// [`PageMapper::map`] on this mapper, and nothing may access it afterwards.
    unsafe fn unmap(&mut self, addr: NonNull<u8>, len: usize);

    /// Virtual memory page size in bytes. Constant for the life of the mapper.
    fn page_size(&self) -> usize;

    /// Tells whether every byte of `[addr, addr + len)` is currently mapped.
    fn is_mapped(&self, addr: *const u8, len: usize) -> bool;
}

/// [`PageMapper`] backed by the operating system: `mmap` on unix and
/// `VirtualAlloc` on Windows.
#[derive(Debug, Clone, Copy)]
pub struct SystemMapper {
    page_size: usize,
}

/// Low level memory requests and syscalls, one implementation per platform.
trait PlatformMemory {
    /// Request a memory region of size `len`. It returns a Pointer to the
    /// given location or None if the underlying syscall fails.
    unsafe fn request_memory(len: usize) -> Option<NonNull<u8>>;

    /// Returns the memory of size `len` starting from `addr` back to the kernel.
    unsafe fn return_memory(addr: *mut u8, len: usize);

    /// Returns the virtual memory page size of the computer in bytes.
    unsafe fn page_size() -> usize;

    /// Asks the kernel whether `[addr, addr + len)` is mapped, `page_size`
    /// being the value returned by [`PlatformMemory::page_size`].
    unsafe fn query_mapped(addr: *const u8, len: usize, page_size: usize) -> bool;
}

impl SystemMapper {
    /// Creates a new mapper, querying the computer's page size once.
    pub fn new() -> Self {
        Self {
            page_size: unsafe { <Self as PlatformMemory>::page_size() },
        }
    }
}

impl Default for SystemMapper {
    fn default() -> Self {
        Self::new()
    }
}

impl PageMapper for SystemMapper {
    fn map(&mut self, len: usize) -> Option<NonNull<u8>> {
        if len == 0 || len % self.page_size != 0 {
            return None;
        }

        unsafe { Self::request_memory(len) }
    }

    unsafe fn unmap(&mut self, addr: NonNull<u8>, len: usize) {
        unsafe { Self::return_memory(addr.as_ptr(), len) }
    }

    fn page_size(&self) -> usize {
        self.page_size
    }

    fn is_mapped(&self, addr: *const u8, len: usize) -> bool {
        if addr.is_null() {
            return false;
        }
        if len == 0 {
            return true;
        }

        unsafe { Self::query_mapped(addr, len, self.page_size) }
    }
}

#[cfg(unix)]
mod unix {
    use super::{PlatformMemory, SystemMapper};
    use crate::utils::align_down;

    use log::warn;

    use libc::{mmap, munmap, off_t, size_t};

    use std::{
        os::raw::{c_int, c_void},
        ptr::NonNull,
    };

    /// Pages asked about per `mincore` call.
    const QUERY_PAGES: usize = 64;

    impl PlatformMemory for SystemMapper {
        unsafe fn request_memory(len: usize) -> Option<NonNull<u8>> {
            // mmap parameters.
            const ADDR: *mut c_void = std::ptr::null_mut::<c_void>();
            // Read-Write only memory.
            const PROT: c_int = libc::PROT_READ | libc::PROT_WRITE;
            const FLAGS: c_int = libc::MAP_PRIVATE | libc::MAP_ANONYMOUS;
            const FD: c_int = -1;
            const OFFSET: off_t = 0;

            unsafe {
                let addr = mmap(ADDR, len as size_t, PROT, FLAGS, FD, OFFSET);

                match addr {
                    libc::MAP_FAILED => None,
                    addr => NonNull::new(addr.cast::<u8>()),
                }
            }
        }

        unsafe fn return_memory(addr: *mut u8, len: usize) {
            let status = unsafe { munmap(addr as *mut c_void, len as size_t) };

            if status != 0 {
                warn!(
                    "munmap({addr:p}, {len}) failed: {}",
                    std::io::Error::last_os_error()
                );
            }
        }

        unsafe fn page_size() -> usize {
            unsafe { libc::sysconf(libc::_SC_PAGE_SIZE) as usize }
        }

        unsafe fn query_mapped(addr: *const u8, len: usize, page_size: usize) -> bool {
            let Some(end) = (addr as usize)
                .checked_add(len)
                .and_then(|end| end.checked_add(page_size - 1))
                .map(|end| align_down(end, page_size))
            else {
                return false;
            };

            // `mincore` fails with ENOMEM as soon as any page in the range is not mapped.
            let mut residency = [0u8; QUERY_PAGES];
            let mut page = align_down(addr as usize, page_size);

            while page < end {
                let span = ((end - page) / page_size).min(QUERY_PAGES) * page_size;
                let status = unsafe {
                    libc::mincore(
                        page as *mut c_void as _,
                        span as size_t,
                        residency.as_mut_ptr().cast(),
                    )
                };

                if status != 0 {
                    return false;
                }

                page += span;
            }

            true
        }
    }
}

#[cfg(windows)]
mod windows {
    use std::{
        mem::{self, MaybeUninit},
        os::raw::c_void,
        ptr::NonNull,
    };

    use super::{PlatformMemory, SystemMapper};

    use log::warn;
    use windows::Win32::System::{Memory, SystemInformation};

    impl PlatformMemory for SystemMapper {
        unsafe fn request_memory(len: usize) -> Option<NonNull<u8>> {
            // Read-Write only.
            let protection = Memory::PAGE_READWRITE;

            let flags = Memory::MEM_RESERVE | Memory::MEM_COMMIT;

            unsafe {
                let addr = Memory::VirtualAlloc(None, len, flags, protection);

                NonNull::new(addr.cast())
            }
        }

        unsafe fn return_memory(addr: *mut u8, len: usize) {
            let result = unsafe { Memory::VirtualFree(addr as *mut c_void, 0, Memory::MEM_RELEASE) };

            if let Err(error) = result {
                warn!("VirtualFree({addr:p}, {len}) failed: {error}");
            }
        }

        unsafe fn page_size() -> usize {
            unsafe {
                let mut system_info = MaybeUninit::uninit();
                SystemInformation::GetSystemInfo(system_info.as_mut_ptr());

                system_info.assume_init().dwPageSize as usize
            }
        }

        unsafe fn query_mapped(addr: *const u8, len: usize, _page_size: usize) -> bool {
            let Some(end) = (addr as usize).checked_add(len) else {
                return false;
            };
            let mut cursor = addr as usize;

            while cursor < end {
                let mut info = MaybeUninit::<Memory::MEMORY_BASIC_INFORMATION>::uninit();

                let written = unsafe {
                    Memory::VirtualQuery(
                        Some(cursor as *const c_void),
                        info.as_mut_ptr(),
                        mem::size_of::<Memory::MEMORY_BASIC_INFORMATION>(),
                    )
                };

                if written == 0 {
                    return false;
                }

                let info = unsafe { info.assume_init() };
                if info.State != Memory::MEM_COMMIT {
                    return false;
                }

                cursor = info.BaseAddress as usize + info.RegionSize;
            }

            true
        }
    }
}

/// Mappers used by the test suites of the heap.
#[cfg(test)]
pub(crate) mod testing {
    use std::{cell::Cell, ptr::NonNull, rc::Rc};

    use super::{PageMapper, SystemMapper};

    /// Counters shared between a [`CountingMapper`] and the test observing it,
    /// so they can still be read after the heap owning the mapper is dropped.
    #[derive(Debug, Default)]
    pub(crate) struct MapperStats {
        pub maps: Cell<usize>,
        pub unmaps: Cell<usize>,
        pub failures: Cell<usize>,
        pub live_bytes: Cell<usize>,
    }

    /// Wraps the [`SystemMapper`] and counts every call. It can refuse to map
    /// once a budget of successful maps is spent or when asked for more than a
    /// size limit, and it can pretend a range of memory is not mapped.
    pub(crate) struct CountingMapper {
        inner: SystemMapper,
        budget: Option<usize>,
        max_len: Option<usize>,
        hidden: Cell<Option<(usize, usize)>>,
        pub stats: Rc<MapperStats>,
    }

    impl CountingMapper {
        pub fn new() -> Self {
            Self {
                inner: SystemMapper::new(),
                budget: None,
                max_len: None,
                hidden: Cell::new(None),
                stats: Rc::default(),
            }
        }

        /// A mapper that maps successfully `maps` times and then fails.
        pub fn failing_after(maps: usize) -> Self {
            Self {
                budget: Some(maps),
                ..Self::new()
            }
        }

        /// Refuses every map of more than `len` bytes.
        pub fn refusing_above(mut self, len: usize) -> Self {
            self.max_len = Some(len);
            self
        }

        /// Reports `[addr, addr + len)` as unmapped until [`Self::reveal`].
        pub fn hide(&self, addr: usize, len: usize) {
            self.hidden.set(Some((addr, addr + len)));
        }

        pub fn reveal(&self) {
            self.hidden.set(None);
        }
    }

    impl PageMapper for CountingMapper {
        fn map(&mut self, len: usize) -> Option<NonNull<u8>> {
            let spent = self.budget.is_some_and(|budget| self.stats.maps.get() >= budget);
            let too_big = self.max_len.is_some_and(|max_len| len > max_len);

            if spent || too_big {
                self.stats.failures.set(self.stats.failures.get() + 1);
                return None;
            }

            let addr = self.inner.map(len)?;
            self.stats.maps.set(self.stats.maps.get() + 1);
            self.stats.live_bytes.set(self.stats.live_bytes.get() + len);

            Some(addr)
        }

        unsafe fn unmap(&mut self, addr: NonNull<u8>, len: usize) {
            self.stats.unmaps.set(self.stats.unmaps.get() + 1);
            self.stats.live_bytes.set(self.stats.live_bytes.get() - len);

            unsafe { self.inner.unmap(addr, len) }
        }

        fn page_size(&self) -> usize {
            self.inner.page_size()
        }

        fn is_mapped(&self, addr: *const u8, len: usize) -> bool {
            let start = addr as usize;

            if let Some((hidden_start, hidden_end)) = self.hidden.get() {
                if start < hidden_end && start.saturating_add(len) > hidden_start {
                    return false;
                }
            }

            self.inner.is_mapped(addr, len)
        }
    }
}
