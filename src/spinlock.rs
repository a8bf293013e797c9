//! 自旋锁模块。
//! 自旋锁将数据包裹在自身内部以保护这些数据，用于保护分片的结构性状态：
//! 持有期间关闭本地抢占，临界区必须保持短小，绝不跨越 I/O 或睡眠锁的获取。

use core::cell::UnsafeCell;
use core::hint;
use core::ops::{Deref, DerefMut, Drop};
use core::sync::atomic::{fence, AtomicBool, AtomicIsize, Ordering};

use crate::hart;

/// 忙等待获取的互斥自旋锁。
///
/// 当锁被占用时，尝试获取锁的 hart 在循环中等待，直到锁被释放。
/// 锁会记录持有者的 hart 编号，用于调试与重入检测；
/// 获取锁的同时通过 [`hart::push_off`] 关闭本地抢占，
/// 防止与可能需要同一把锁的中断处理路径形成自死锁。
///
/// # 字段说明
/// - `lock`: 原子布尔值，`false` 表示未锁定；
/// - `name`: 锁的名称，用于调试；
/// - `hartid`: 当前持有锁的 hart 编号（-1 表示无持有者）；
/// - `data`: 被保护的数据，通过 `UnsafeCell` 实现内部可变性。
#[derive(Debug)]
pub struct SpinLock<T: ?Sized> {
    lock: AtomicBool,
    name: &'static str,
    hartid: AtomicIsize,
    data: UnsafeCell<T>,
}

unsafe impl<T: ?Sized + Send> Sync for SpinLock<T> {}

impl<T> SpinLock<T> {
    /// 创建一个新的自旋锁实例。
    pub const fn new(data: T, name: &'static str) -> Self {
        Self {
            lock: AtomicBool::new(false),
            name,
            hartid: AtomicIsize::new(-1),
            data: UnsafeCell::new(data),
        }
    }
}

impl<T: ?Sized> SpinLock<T> {
    /// 获取自旋锁并返回守卫对象。
    ///
    /// # 功能说明
    /// 通过忙等待获取锁的所有权。守卫实现了 `Deref` 与 `DerefMut`，
    /// 可直接访问被保护数据；守卫离开作用域时自动释放锁并恢复抢占状态。
    pub fn lock(&self) -> SpinLockGuard<'_, T> {
        self.acquire();
        SpinLockGuard {
            lock: self,
            data: unsafe { &mut *self.data.get() },
        }
    }

    /// 当前 hart 是否持有此锁。
    ///
    /// 只在抢占已关闭时调用（由 `acquire`/`release` 保证），
    /// 否则判定结果可能在返回前就已失效。
    fn holding(&self) -> bool {
        self.lock.load(Ordering::Relaxed)
            && self.hartid.load(Ordering::Relaxed) == hart::id() as isize
    }

    /// 获取锁的核心实现。
    ///
    /// # 流程解释
    /// 1. 关闭本地抢占；
    /// 2. 检查是否重入（重入直接 panic，视为逻辑损坏）；
    /// 3. 用原子比较交换忙等待，直到拿到锁；
    /// 4. 设置内存屏障，再记录持有者编号。
    fn acquire(&self) {
        hart::push_off();
        if self.holding() {
            panic!("spinlock {} acquire", self.name);
        }
        while self
            .lock
            .compare_exchange(false, true, Ordering::Acquire, Ordering::Acquire)
            .is_err()
        {
            hint::spin_loop();
        }
        fence(Ordering::SeqCst);
        self.hartid.store(hart::id() as isize, Ordering::Relaxed);
    }

    /// 释放锁的核心实现，由守卫的 `Drop` 调用。
    ///
    /// 先校验当前 hart 确实持有锁，再清除持有者记录并打开锁，
    /// 最后恢复一层抢占状态。
    fn release(&self) {
        if !self.holding() {
            panic!("spinlock {} release", self.name);
        }
        self.hartid.store(-1, Ordering::Relaxed);
        fence(Ordering::SeqCst);
        self.lock.store(false, Ordering::Release);
        hart::pop_off();
    }
}

/// 自旋锁守卫对象，存在期间表示锁被持有。
pub struct SpinLockGuard<'a, T: ?Sized> {
    lock: &'a SpinLock<T>,
    data: &'a mut T,
}

impl<'a, T: ?Sized> Deref for SpinLockGuard<'a, T> {
    type Target = T;

    fn deref(&self) -> &T {
        &*self.data
    }
}

impl<'a, T: ?Sized> DerefMut for SpinLockGuard<'a, T> {
    fn deref_mut(&mut self) -> &mut T {
        &mut *self.data
    }
}

impl<'a, T: ?Sized> Drop for SpinLockGuard<'a, T> {
    fn drop(&mut self) {
        self.lock.release();
    }
}
