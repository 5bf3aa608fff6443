// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! Kernel heap for bare-metal builds.
//!
//! Arenas, spaces and run queues allocate from a first-fit list heap over a
//! region the boot code hands to `init` before `Kernel::new` runs.

use core::alloc::{GlobalAlloc, Layout};
use core::ptr::{self, NonNull};

use linked_list_allocator::Heap;
use spin::Mutex;

struct KernelHeap {
    inner: Mutex<Heap>,
}

unsafe impl GlobalAlloc for KernelHeap {
    unsafe fn alloc(&self, layout: Layout) -> *mut u8 {
        self.inner
            .lock()
            .allocate_first_fit(layout)
            .map_or(ptr::null_mut(), NonNull::as_ptr)
    }

    unsafe fn dealloc(&self, ptr: *mut u8, layout: Layout) {
        if let Some(ptr) = NonNull::new(ptr) {
            self.inner.lock().deallocate(ptr, layout);
        }
    }
}

#[global_allocator]
static HEAP: KernelHeap = KernelHeap { inner: Mutex::new(Heap::empty()) };

/// Hands `[base, base + size)` to the allocator. Called once on the boot processor.
///
/// # Safety
/// The region must be unused, writable and stay reserved for the heap.
pub unsafe fn init(base: *mut u8, size: usize) {
    HEAP.inner.lock().init(base, size);
    log_info!(target: "heap", "kernel heap {:p} size={:#x}", base, size);
}

/// Bytes currently handed out.
pub fn used() -> usize {
    HEAP.inner.lock().used()
}
