//! 页分配器的端到端测试：两 hart 的窃取剧本与守恒性质。

use std::alloc::{alloc, dealloc, Layout};
use std::sync::Arc;
use std::thread;

use kpool::consts::{ALLOC_JUNK, PGSIZE};
use kpool::{hart, Kmem};

/// 页对齐的测试内存区间。
struct Region {
    ptr: *mut u8,
    layout: Layout,
}

impl Region {
    fn new(pages: usize) -> Self {
        let layout = Layout::from_size_align(pages * PGSIZE, PGSIZE).unwrap();
        let ptr = unsafe { alloc(layout) };
        assert!(!ptr.is_null());
        Self { ptr, layout }
    }
}

impl Drop for Region {
    fn drop(&mut self) {
        unsafe { dealloc(self.ptr, self.layout) };
    }
}

fn on_hart<T: Send + 'static>(id: usize, f: impl FnOnce() -> T + Send + 'static) -> T {
    thread::spawn(move || {
        hart::bind(id);
        f()
    })
    .join()
    .unwrap()
}

/// 两 hart、两页的完整剧本：本地分配、窃取、耗尽、释放后恢复。
#[test]
fn two_hart_two_page_scenario() {
    let region = Region::new(2);
    let base = region.ptr as usize;

    // hart 16（分片 0）构造分配器：两页都落在它的链表上，
    // 随后分出一页交给 hart 17（分片 1）释放，形成一人一页的局面。
    let kmem = on_hart(16, move || {
        let kmem = Arc::new(unsafe { Kmem::new(base as *mut u8, 2 * PGSIZE) });
        assert_eq!(kmem.capacity(), 2);
        kmem
    });

    let moved = {
        let kmem = Arc::clone(&kmem);
        on_hart(16, move || kmem.kalloc().unwrap().as_ptr() as usize)
    };
    {
        let kmem = Arc::clone(&kmem);
        on_hart(17, move || unsafe { kmem.kfree(moved as *mut u8) });
    }
    assert_eq!(kmem.free_count(), 2);

    // hart 24（同样映射到分片 0）拿走两页：一页本地，一页从分片 1 窃取；
    // 第三次分配失败，释放一页后再次分配即恢复。
    let pages = {
        let kmem = Arc::clone(&kmem);
        on_hart(24, move || {
            let a = kmem.kalloc().unwrap().as_ptr() as usize;
            let b = kmem.kalloc().unwrap().as_ptr() as usize;
            assert!(kmem.kalloc().is_none());
            (a, b)
        })
    };
    {
        let kmem = Arc::clone(&kmem);
        on_hart(25, move || assert!(kmem.kalloc().is_none()));
    }

    {
        let kmem = Arc::clone(&kmem);
        on_hart(24, move || unsafe { kmem.kfree(pages.0 as *mut u8) });
    }
    {
        let kmem = Arc::clone(&kmem);
        on_hart(25, move || {
            let p = kmem.kalloc().unwrap();
            let bytes = unsafe { core::slice::from_raw_parts(p.as_ptr(), PGSIZE) };
            assert!(bytes.iter().all(|&b| b == ALLOC_JUNK));
            unsafe { kmem.kfree(p.as_ptr()) };
        });
    }

    {
        let kmem = Arc::clone(&kmem);
        on_hart(24, move || unsafe { kmem.kfree(pages.1 as *mut u8) });
    }
    assert_eq!(kmem.free_count(), kmem.capacity());
    drop(kmem);
}

#[test]
fn conservation_across_mixed_harts() {
    let region = Region::new(32);
    let base = region.ptr as usize;
    let kmem = Arc::new(unsafe { Kmem::new(base as *mut u8, 32 * PGSIZE) });
    let capacity = kmem.capacity();

    let mut handles = Vec::new();
    for t in 0..6usize {
        let kmem = Arc::clone(&kmem);
        handles.push(thread::spawn(move || {
            let mut held = Vec::new();
            for round in 0..300usize {
                match kmem.kalloc() {
                    Some(p) => held.push(p.as_ptr() as usize),
                    None => {
                        // 耗尽是可恢复条件：归还一页再继续
                        if let Some(addr) = held.pop() {
                            unsafe { kmem.kfree(addr as *mut u8) };
                        }
                    }
                }
                if (round + t) % 4 == 0 {
                    if let Some(addr) = held.pop() {
                        unsafe { kmem.kfree(addr as *mut u8) };
                    }
                }
            }
            held.len()
        }));
    }

    let mut outstanding = 0;
    for h in handles {
        outstanding += h.join().unwrap();
    }
    // 静止点守恒：空闲页数加上仍被持有的页数等于池容量
    assert_eq!(kmem.free_count() + outstanding, capacity);
    drop(kmem);
}
