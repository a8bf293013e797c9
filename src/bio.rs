//! 块缓存层。
//!
//! 缓存持有磁盘块内容的内存副本，减少重复的磁盘读取，同时充当
//! 多个执行流访问同一磁盘块时的同步点。缓存按块号散列为 `NHASH`
//! 个分片，每个分片一把自旋锁和一条按使用新旧排序的双向链表；
//! 本分片无可回收槽位时向其他分片窃取，保证热点分片不会在冷分片
//! 还有空闲容量时挨饿。
//!
//! 接口：
//! * 取得某个磁盘块的缓冲区：调用 `bread`（或只取槽位不读盘的 `bget`）；
//! * 修改缓冲区内容之后：调用 `Buf::bwrite` 写回设备；
//! * 使用完毕：让 `Buf` 离开作用域，释放在 `Drop` 中完成；
//! * 同一时刻只有一个执行流可以使用某个缓冲区，不要长期持有。

use array_macro::array;

use core::cell::UnsafeCell;
use core::sync::atomic::{AtomicBool, Ordering};

use crate::consts::{BSIZE, BUCKET_MAGIC, NBUF, NBUF_PER, NHASH};
use crate::driver::BlockIo;
use crate::error::Result;
use crate::sleeplock::{SleepLock, SleepLockGuard};
use crate::spinlock::SpinLock;

/// 链表终止标记。
const NIL: usize = usize::MAX;

/// 由块号计算所属分片编号。
///
/// 只混入块号（不含设备号），相邻块号被常量异或打散后
/// 落到不同分片，把锁竞争摊到 `1/NHASH`。
#[inline]
fn bucket_of(blockno: u32) -> usize {
    ((blockno ^ BUCKET_MAGIC) as usize) & (NHASH - 1)
}

/// 分片式缓冲区缓存。
///
/// 在系统初始化阶段构造一次，生命周期覆盖整个运行期间。结构分为三部分：
/// 控制记录数组 `ctrl`（身份、引用计数、链表索引），分片链表头 `buckets`，
/// 以及数据槽位数组 `bufs`（块内容与其睡眠锁）。槽位 `i` 初始归属分片
/// `i / NBUF_PER`，此后随回收与窃取在分片之间迁移。
///
/// 访问协议：`ctrl[i]` 只允许在持有当前拥有槽位 `i` 的分片锁时访问；
/// 窃取路径上被摘链的槽位是唯一的例外，摘链后它从任何链表都不可达，
/// 只有窃取者一个执行流能触碰它。
pub struct Bcache<D: BlockIo> {
    /// 各分片的链表头尾，自旋锁保护。
    buckets: [SpinLock<BufBucket>; NHASH],

    /// 全部槽位的控制记录，见上方访问协议。
    ctrl: [UnsafeCell<BufCtrl>; NBUF],

    /// 槽位数据区：块内容由睡眠锁保护，`valid` 标志在持有
    /// 所属分片锁或数据睡眠锁时才允许访问。
    bufs: [BufInner; NBUF],

    /// 底层块设备。
    disk: D,
}

/// `ctrl` 的跨线程访问由分片锁（或窃取窗口的唯一可达性）保证。
unsafe impl<D: BlockIo> Sync for Bcache<D> {}

impl<D: BlockIo> Bcache<D> {
    /// 构造缓存并建立初始链表。
    pub fn new(disk: D) -> Self {
        let cache = Self {
            buckets: array![_ => SpinLock::new(BufBucket::new(), "bcache"); NHASH],
            ctrl: array![_ => UnsafeCell::new(BufCtrl::new()); NBUF],
            bufs: array![_ => BufInner::new(); NBUF],
            disk,
        };
        cache.binit();
        cache
    }

    /// 把每个槽位挂到它的初始分片上。
    fn binit(&self) {
        for h in 0..NHASH {
            let mut bucket = self.buckets[h].lock();
            for i in (h * NBUF_PER)..((h + 1) * NBUF_PER) {
                unsafe {
                    self.attach_head(&mut bucket, i);
                }
            }
        }
        log::info!("bcache: {} buckets, {} buffers each", NHASH, NBUF_PER);
    }

    /// 取得槽位控制记录的可变引用。
    ///
    /// # 安全性
    /// 调用者必须持有当前拥有槽位 `i` 的分片锁，或者刚把该槽位
    /// 从某条链表上摘下、尚未挂回（窃取窗口内只有窃取者可达）。
    /// 返回的引用不得跨越上述保护条件的失效点存活。
    #[allow(clippy::mut_from_ref)]
    unsafe fn ctrl(&self, i: usize) -> &mut BufCtrl {
        &mut *self.ctrl[i].get()
    }

    /// 把槽位挂到链表头部（最近使用端）。
    ///
    /// # 安全性
    /// 调用者持有 `bucket` 对应的分片锁，且 `i` 不在任何链表上。
    unsafe fn attach_head(&self, bucket: &mut BufBucket, i: usize) {
        let old_head = bucket.head;
        {
            let b = self.ctrl(i);
            b.prev = NIL;
            b.next = old_head;
        }
        if old_head != NIL {
            self.ctrl(old_head).prev = i;
        } else {
            bucket.tail = i;
        }
        bucket.head = i;
    }

    /// 把槽位挂到链表尾部（最久未用端）。
    ///
    /// # 安全性
    /// 同 [`Bcache::attach_head`]。
    unsafe fn attach_tail(&self, bucket: &mut BufBucket, i: usize) {
        let old_tail = bucket.tail;
        {
            let b = self.ctrl(i);
            b.prev = old_tail;
            b.next = NIL;
        }
        if old_tail != NIL {
            self.ctrl(old_tail).next = i;
        } else {
            bucket.head = i;
        }
        bucket.tail = i;
    }

    /// 把槽位从链表上摘下。
    ///
    /// # 安全性
    /// 调用者持有 `bucket` 对应的分片锁，且 `i` 在该分片的链表上。
    unsafe fn detach(&self, bucket: &mut BufBucket, i: usize) {
        let (prev, next) = {
            let b = self.ctrl(i);
            (b.prev, b.next)
        };
        if prev != NIL {
            self.ctrl(prev).next = next;
        } else {
            bucket.head = next;
        }
        if next != NIL {
            self.ctrl(next).prev = prev;
        } else {
            bucket.tail = prev;
        }
        let b = self.ctrl(i);
        b.prev = NIL;
        b.next = NIL;
    }

    /// 从头部起查找已缓存的 `(dev, blockno)`。
    ///
    /// # 安全性
    /// 调用者持有 `bucket` 对应的分片锁。
    unsafe fn find_cached(&self, bucket: &BufBucket, dev: u32, blockno: u32) -> Option<usize> {
        let mut i = bucket.head;
        while i != NIL {
            let b = self.ctrl(i);
            if b.dev == dev && b.blockno == blockno {
                return Some(i);
            }
            i = b.next;
        }
        None
    }

    /// 从尾部起查找一个引用计数为零的可回收槽位。
    ///
    /// # 安全性
    /// 调用者持有 `bucket` 对应的分片锁。
    unsafe fn lru_free(&self, bucket: &BufBucket) -> Option<usize> {
        let mut i = bucket.tail;
        while i != NIL {
            let b = self.ctrl(i);
            if b.refcnt == 0 {
                return Some(i);
            }
            i = b.prev;
        }
        None
    }

    /// 取得 `(dev, blockno)` 对应的缓冲区，返回已锁定的句柄。
    ///
    /// # 功能说明
    /// 缓存层的底层分配接口：命中则复用已缓存的槽位，未命中则按
    /// LRU 回收本分片的空闲槽位，本分片耗尽时向其他分片窃取。
    /// 不触发磁盘读写，调用者通过 `bread` 获得已装载的数据。
    ///
    /// # 流程解释
    /// - 持本分片锁扫描链表：命中则引用计数加一，放锁后获取槽位的
    ///   睡眠锁（可能在此阻塞，等待上一个使用者释放）；
    /// - 未命中则从尾部回收引用计数为零的槽位，就地改写身份；
    /// - 本分片无可回收槽位时放开本分片锁，从下一个分片起轮询：
    ///   在捐出方锁内摘下第一个空闲槽位（两把分片锁绝不同时持有）；
    /// - 重新取得本分片锁后先复查：无锁窗口期间其他执行流可能已把
    ///   同一块装入缓存，此时窃来的槽位按空闲挂到尾部，改用已有槽位，
    ///   保证同一身份在所有分片中至多出现一次；
    /// - 否则给窃来的槽位写入新身份并挂到头部。
    ///
    /// # 可能的错误
    /// - 所有分片都没有引用计数为零的槽位时 panic：并发持有的缓冲区
    ///   超过池容量属于配置错误，不作为可恢复条件处理。
    pub fn bget(&self, dev: u32, blockno: u32) -> Buf<'_, D> {
        let hid = bucket_of(blockno);

        let bucket = self.buckets[hid].lock();

        // 已经缓存了吗？
        if let Some(i) = unsafe { self.find_cached(&bucket, dev, blockno) } {
            unsafe {
                self.ctrl(i).refcnt += 1;
            }
            drop(bucket);
            return self.handle(i, dev, blockno);
        }

        // 未缓存：回收本分片最久未用的空闲槽位
        if let Some(i) = unsafe { self.lru_free(&bucket) } {
            unsafe {
                let b = self.ctrl(i);
                b.dev = dev;
                b.blockno = blockno;
                b.refcnt = 1;
            }
            self.bufs[i].valid.store(false, Ordering::Relaxed);
            drop(bucket);
            return self.handle(i, dev, blockno);
        }
        drop(bucket);

        // 本分片耗尽：从下一个分片起轮询窃取
        let mut victim = None;
        for k in 1..NHASH {
            let h = (hid + k) & (NHASH - 1);
            let mut donor = self.buckets[h].lock();
            if let Some(i) = unsafe { self.lru_free(&donor) } {
                unsafe {
                    self.detach(&mut donor, i);
                }
                drop(donor);
                log::trace!("bcache: bucket {} takes buffer {} from bucket {}", hid, i, h);
                victim = Some(i);
                break;
            }
        }
        let victim = match victim {
            Some(i) => i,
            None => panic!("bget: no buffers"),
        };

        let mut bucket = self.buckets[hid].lock();

        // 无锁窗口期间其他执行流可能已把同一块装入缓存
        if let Some(i) = unsafe { self.find_cached(&bucket, dev, blockno) } {
            unsafe {
                self.ctrl(i).refcnt += 1;
                // 窃来的槽位按空闲挂到尾部，随时可以再被回收
                self.attach_tail(&mut bucket, victim);
            }
            self.bufs[victim].valid.store(false, Ordering::Relaxed);
            drop(bucket);
            return self.handle(i, dev, blockno);
        }

        unsafe {
            let b = self.ctrl(victim);
            b.dev = dev;
            b.blockno = blockno;
            b.refcnt = 1;
            self.attach_head(&mut bucket, victim);
        }
        self.bufs[victim].valid.store(false, Ordering::Relaxed);
        drop(bucket);
        self.handle(victim, dev, blockno)
    }

    /// 在引用计数已经加一之后构造句柄，获取数据睡眠锁。
    fn handle(&self, index: usize, dev: u32, blockno: u32) -> Buf<'_, D> {
        Buf {
            cache: self,
            index,
            dev,
            blockno,
            data: Some(self.bufs[index].data.lock()),
        }
    }

    /// 返回包含指定块内容的已锁定缓冲区。
    ///
    /// # 功能说明
    /// 对外的读取接口：取得槽位后，若数据尚未从设备装载
    /// （`valid` 为 false），同步读一次设备再返回。
    ///
    /// # 可能的错误
    /// - 设备传输失败时原样上报；此时槽位保持无效并被正常释放，
    ///   后续对同一块的 `bread` 会重新尝试装载。
    pub fn bread(&self, dev: u32, blockno: u32) -> Result<Buf<'_, D>> {
        let mut b = self.bget(dev, blockno);
        if !self.bufs[b.index].valid.load(Ordering::Relaxed) {
            let guard = b.data.as_mut().unwrap();
            self.disk.rw(dev, blockno, &mut **guard, false)?;
            self.bufs[b.index].valid.store(true, Ordering::Relaxed);
        }
        Ok(b)
    }

    /// 释放一次引用；计数归零时把槽位移到链表头部。
    ///
    /// 头部是“最近刚空闲”的位置：可以被回收，但在 LRU 扫描中
    /// 排在最后，优先留给紧接着的复用。
    fn brelse(&self, index: usize, blockno: u32) {
        let hid = bucket_of(blockno);
        let mut bucket = self.buckets[hid].lock();
        unsafe {
            let b = self.ctrl(index);
            b.refcnt -= 1;
            if b.refcnt == 0 {
                self.detach(&mut bucket, index);
                self.attach_head(&mut bucket, index);
            }
        }
    }

    /// 只在分片锁下把引用计数加一。
    fn bpin(&self, index: usize, blockno: u32) {
        let hid = bucket_of(blockno);
        let _bucket = self.buckets[hid].lock();
        unsafe {
            self.ctrl(index).refcnt += 1;
        }
    }

    /// 只在分片锁下把引用计数减一；句柄自身持有的那次引用不允许在此归还。
    fn bunpin(&self, index: usize, blockno: u32) {
        let hid = bucket_of(blockno);
        let _bucket = self.buckets[hid].lock();
        unsafe {
            let b = self.ctrl(index);
            if b.refcnt <= 1 {
                panic!("buf unpin not match");
            }
            b.refcnt -= 1;
        }
    }
}

/// 已锁定的缓冲块句柄。
///
/// 代表一个特定 `(dev, blockno)` 的缓冲区，持有其数据的独占访问权
/// （内部的睡眠锁守卫），生命周期结束时自动释放：先放开数据锁，
/// 再在分片锁下归还引用并更新链表位置。
pub struct Buf<'a, D: BlockIo> {
    cache: &'a Bcache<D>,
    index: usize,
    dev: u32,
    blockno: u32,
    /// 整个生命周期内保持 `Some`，`Drop` 中先行取出以控制释放顺序。
    data: Option<SleepLockGuard<'a, BufData>>,
}

impl<'a, D: BlockIo> Buf<'a, D> {
    pub fn dev(&self) -> u32 {
        self.dev
    }

    pub fn blockno(&self) -> u32 {
        self.blockno
    }

    /// 块内容的只读视图。
    pub fn data(&self) -> &[u8; BSIZE] {
        self.data.as_ref().unwrap().bytes()
    }

    /// 块内容的可写视图，仅句柄持有者可达。
    pub fn data_mut(&mut self) -> &mut [u8; BSIZE] {
        self.data.as_mut().unwrap().bytes_mut()
    }

    /// 把缓冲区内容同步写入设备。
    ///
    /// 独占锁由句柄自身持有，无需额外校验；传输失败原样上报。
    pub fn bwrite(&mut self) -> Result<()> {
        let guard = self.data.as_mut().unwrap();
        self.cache.disk.rw(self.dev, self.blockno, &mut **guard, true)
    }

    /// 钉住缓冲块：在不持有数据锁的情况下多保有一次引用，
    /// 防止槽位在一段较长的逻辑操作期间被回收或窃取。
    /// 与 [`Buf::unpin`] 配对使用，钉住可以跨越句柄自身的生命周期。
    pub fn pin(&self) {
        self.cache.bpin(self.index, self.blockno);
    }

    /// 解除一次钉住。
    ///
    /// # 可能的错误
    /// - 未与 `pin` 配对（计数只剩句柄自身持有的一次）时 panic。
    pub fn unpin(&self) {
        self.cache.bunpin(self.index, self.blockno);
    }
}

impl<'a, D: BlockIo> Drop for Buf<'a, D> {
    /// 先释放数据睡眠锁（唤醒等待者），再归还引用。
    fn drop(&mut self) {
        drop(self.data.take());
        self.cache.brelse(self.index, self.blockno);
    }
}

/// 单个分片的链表头尾；控制记录里的索引构成双向链表。
struct BufBucket {
    head: usize,
    tail: usize,
}

impl BufBucket {
    const fn new() -> Self {
        Self { head: NIL, tail: NIL }
    }
}

/// 缓冲块控制记录：身份、引用计数与链表位置。
///
/// 不含块数据本身；`refcnt` 为 0 时身份不再有意义，槽位可被
/// 回收或窃取，大于 0 时 `(dev, blockno)` 在所有分片中唯一。
struct BufCtrl {
    dev: u32,
    blockno: u32,
    refcnt: usize,
    prev: usize,
    next: usize,
}

impl BufCtrl {
    const fn new() -> Self {
        Self {
            dev: 0,
            blockno: 0,
            refcnt: 0,
            prev: NIL,
            next: NIL,
        }
    }
}

/// 缓冲块的数据部分。
struct BufInner {
    /// 数据是否已从设备装载。由 `bget` 在改写身份时清除、
    /// `bread` 装载后设置；持有所属分片锁或数据睡眠锁时才允许访问。
    valid: AtomicBool,

    /// 块内容，睡眠锁保证同一时刻只有一个执行流访问。
    data: SleepLock<BufData>,
}

impl BufInner {
    fn new() -> Self {
        Self {
            valid: AtomicBool::new(false),
            data: SleepLock::new(BufData::new(), "buffer"),
        }
    }
}

/// 块内容的载体。对齐放宽到 8 字节，便于上层按更大粒度解读。
#[repr(C, align(8))]
pub struct BufData([u8; BSIZE]);

impl BufData {
    pub const fn new() -> Self {
        Self([0; BSIZE])
    }

    pub fn bytes(&self) -> &[u8; BSIZE] {
        &self.0
    }

    pub fn bytes_mut(&mut self) -> &mut [u8; BSIZE] {
        &mut self.0
    }
}

impl Default for BufData {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
impl<D: BlockIo> Bcache<D> {
    /// 锁住全部分片，校验池级不变量：每个槽位恰好在一条链表上，
    /// 引用计数大于零的身份全局唯一。
    fn check_conservation(&self) {
        let guards: Vec<_> = self.buckets.iter().map(|b| b.lock()).collect();
        let mut seen = [false; NBUF];
        let mut live = std::collections::HashSet::new();
        let mut total = 0;
        for g in guards.iter() {
            let mut i = g.head;
            while i != NIL {
                assert!(!seen[i], "slot {} linked twice", i);
                seen[i] = true;
                total += 1;
                let b = unsafe { self.ctrl(i) };
                if b.refcnt > 0 {
                    assert!(
                        live.insert((b.dev, b.blockno)),
                        "duplicate identity ({}, {})",
                        b.dev,
                        b.blockno
                    );
                }
                i = b.next;
            }
        }
        assert_eq!(total, NBUF, "slot missing from every list");
    }
}
