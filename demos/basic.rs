use chunkalloc::Heap;

fn log_alloc(heap: &Heap, size: usize, addr: *mut u8) {
    println!("Requested {size} bytes of memory");
    println!("Received this address: {addr:?}");
    print!("{}", heap.snapshot());
}

fn main() {
    let mut heap = Heap::new();
    heap.init().expect("could not map the first chunk");

    let a = heap.allocate(48).unwrap();
    log_alloc(&heap, 48, a.as_ptr());

    let b = heap.allocate(2048).unwrap();
    log_alloc(&heap, 2048, b.as_ptr());

    // Bigger than the first chunk: the heap grows.
    let c = heap.allocate(16 * 1024).unwrap();
    log_alloc(&heap, 16 * 1024, c.as_ptr());

    unsafe {
        heap.deallocate(a);
    }
    println!("Freed {a:?}, heap valid: {}", heap.check_heap());

    let d = heap.allocate(32).unwrap();
    println!("Reused freed block: {}", d == a);

    for ptr in [b, c, d] {
        if heap.can_free(ptr.as_ptr()) {
            unsafe { heap.deallocate(ptr) };
        }
    }
    println!("Freeing {c:?} twice allowed: {}", heap.can_free(c.as_ptr()));

    print!("{}", heap.snapshot());
    println!("{} chunk(s), {} bytes mapped", heap.chunk_count(), heap.mapped_bytes());
}
