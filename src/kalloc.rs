//! 物理页分配器。
//!
//! 为内核栈、页表页、管道缓冲等用途分配整页物理内存。空闲链表
//! 按 hart 分片：分配与释放走本地链表，常态下互不竞争；本地耗尽
//! 时才跨分片窃取。链表节点直接叠放在空闲页自身的开头，不占用
//! 任何附加元数据空间。

use array_macro::array;

use core::ptr::{self, NonNull};

use crate::consts::{ALLOC_JUNK, FREE_JUNK, NCPU, PGSIZE};
use crate::hart;
use crate::spinlock::SpinLock;

/// 空闲页链表节点，叠放在空闲页的第一个机器字上。
#[repr(C)]
struct Run {
    next: *mut Run,
}

/// 单个分片的空闲链表头。
struct FreeList {
    head: *mut Run,
}

/// 裸指针本身不跨线程移动任何数据，链表由外层自旋锁保护。
unsafe impl Send for FreeList {}

/// 分片式物理页分配器。
///
/// 在系统初始化阶段构造一次，管理一段调用者提供的页对齐物理区间，
/// 生命周期覆盖整个运行期间。页的分片归属跟随最后一次释放：
/// 哪个 hart 释放的页就挂到哪个 hart 的链表上，与最初由谁分配无关。
pub struct Kmem {
    shards: [SpinLock<FreeList>; NCPU],
    start: usize,
    end: usize,
}

impl Kmem {
    /// 构造分配器并把整个区间归还给池。
    ///
    /// # 功能说明
    /// 起始地址向上取整、结束地址向下取整到页边界后，逐页调用
    /// [`Kmem::kfree`] 把区间交给池。不做显式的均匀划分：初始时
    /// 全部容量都落在执行初始化的 hart 的链表上，其他 hart 靠窃取
    /// 起步，随着各自开始释放页而自然再均衡。
    ///
    /// # 安全性
    /// `[start, start + len)` 必须是调用者独占的有效内存区间，
    /// 且在 `Kmem` 存活期间保持有效；构造之后区间内的内存只能
    /// 通过本分配器取用。
    pub unsafe fn new(start: *mut u8, len: usize) -> Self {
        let pa_start = (start as usize + PGSIZE - 1) & !(PGSIZE - 1);
        let pa_end = (start as usize + len) & !(PGSIZE - 1);
        let kmem = Self {
            shards: array![_ => SpinLock::new(FreeList { head: ptr::null_mut() }, "kmem"); NCPU],
            start: pa_start,
            end: pa_end,
        };
        kmem.free_range();
        log::info!(
            "kmem: {} pages in [{:#x}, {:#x})",
            (pa_end - pa_start) / PGSIZE,
            pa_start,
            pa_end
        );
        kmem
    }

    /// 逐页归还整个管理区间。
    unsafe fn free_range(&self) {
        let mut pa = self.start;
        while pa + PGSIZE <= self.end {
            self.kfree(pa as *mut u8);
            pa += PGSIZE;
        }
    }

    /// 分配一页物理内存。
    ///
    /// # 流程解释
    /// - 在本 hart 分片的锁下弹出链表头；
    /// - 本地为空时，从前一个 hart 编号起反向轮询其他分片，
    ///   取第一个非空链表的头（一次只持有一把分片锁）；
    /// - 全部分片都为空时返回 `None`，由调用方把失败向上传递；
    /// - 返回前整页填入分配垃圾字节，保证旧内容不会悄悄穿过一次
    ///   重新分配，也让对未初始化页的读取在调试时可见。
    pub fn kalloc(&self) -> Option<NonNull<u8>> {
        let cid = hart::id() % NCPU;

        let mut list = self.shards[cid].lock();
        let mut r = list.head;
        if !r.is_null() {
            list.head = unsafe { (*r).next };
        }
        drop(list);

        if r.is_null() {
            // 本地链表已空，试着从其他 hart 的分片窃取
            let mut i = (cid + NCPU - 1) % NCPU;
            while i != cid {
                let mut list = self.shards[i].lock();
                r = list.head;
                if !r.is_null() {
                    list.head = unsafe { (*r).next };
                    drop(list);
                    log::trace!("kmem: hart {} takes a page from hart {}", cid, i);
                    break;
                }
                drop(list);
                i = (i + NCPU - 1) % NCPU;
            }
        }

        if r.is_null() {
            return None;
        }
        unsafe {
            ptr::write_bytes(r as *mut u8, ALLOC_JUNK, PGSIZE);
        }
        NonNull::new(r as *mut u8)
    }

    /// 释放一页物理内存，挂到调用 hart 的链表上。
    ///
    /// # 可能的错误
    /// - `pa` 未页对齐或不在管理区间内时 panic：这是损坏的征兆，
    ///   不作为可恢复条件处理。
    ///
    /// # 安全性
    /// `pa` 必须来自本分配器的 [`Kmem::kalloc`]（或初始化时的区间
    /// 归还），且调用之后不得再访问该页。
    pub unsafe fn kfree(&self, pa: *mut u8) {
        let addr = pa as usize;
        if addr % PGSIZE != 0 || addr < self.start || addr >= self.end {
            panic!("kfree");
        }

        // 填入垃圾字节，让悬空引用尽快暴露
        ptr::write_bytes(pa, FREE_JUNK, PGSIZE);

        let r = pa as *mut Run;
        let cid = hart::id() % NCPU;
        let mut list = self.shards[cid].lock();
        (*r).next = list.head;
        list.head = r;
    }

    /// 管理区间的总页数。
    pub fn capacity(&self) -> usize {
        (self.end - self.start) / PGSIZE
    }

    /// 当前空闲页总数，逐分片在锁下清点。
    ///
    /// 只在静止点有意义；有并发分配或释放在途时，结果只是瞬时快照。
    pub fn free_count(&self) -> usize {
        let mut n = 0;
        for shard in self.shards.iter() {
            let list = shard.lock();
            let mut r = list.head;
            while !r.is_null() {
                n += 1;
                r = unsafe { (*r).next };
            }
        }
        n
    }
}
