//! 睡眠锁模块。
//! 提供阻塞式的独占锁，适用于可能长时间持有的场合（例如跨越磁盘 I/O）。
//!
//! 当锁被占用时，尝试获取锁的执行流挂入等待集合并让出处理器，
//! 避免忙等待；释放者恰好唤醒一个等待者。

use core::cell::{Cell, UnsafeCell};
use core::ops::{Deref, DerefMut, Drop};
use std::thread::{self, Thread};

use crate::spinlock::SpinLock;

/// 睡眠锁结构，提供阻塞式同步机制。
///
/// 与自旋锁不同，当锁被占用时，尝试获取的执行流进入挂起状态，
/// 直到锁被释放后被唤醒。内部用一把小自旋锁保护 `locked` 标志
/// 与等待集合的原子访问。
///
/// # 字段说明
/// - `lock`: 内部自旋锁，保护 `locked` 状态与等待集合；
/// - `locked`: 表示锁是否已被占用；
/// - `name`: 锁的标识名称，用于调试；
/// - `data`: 被保护的数据，通过 `UnsafeCell` 实现内部可变性。
pub struct SleepLock<T: ?Sized> {
    lock: SpinLock<WaitList>,
    locked: Cell<bool>,
    name: &'static str,
    data: UnsafeCell<T>,
}

unsafe impl<T: ?Sized + Send> Sync for SleepLock<T> {}

/// 等待集合：挂起中的执行流句柄。
///
/// 唤醒顺序不作保证，只保证每个等待者最终被唤醒。
struct WaitList {
    waiters: Vec<Thread>,
}

impl<T> SleepLock<T> {
    /// 创建一个新的睡眠锁实例。
    pub const fn new(data: T, name: &'static str) -> Self {
        Self {
            lock: SpinLock::new(WaitList { waiters: Vec::new() }, "sleeplock"),
            locked: Cell::new(false),
            name,
            data: UnsafeCell::new(data),
        }
    }
}

impl<T: ?Sized> SleepLock<T> {
    /// 获取睡眠锁，可能挂起当前执行流。
    ///
    /// # 流程解释
    /// 1. 获取内部自旋锁，保护状态检查；
    /// 2. 若锁已被占用：把自己挂入等待集合，释放自旋锁后挂起；
    ///    被唤醒后重新获取自旋锁并再次检查（唤醒不代表必然取得锁）；
    /// 3. 设置 `locked` 后释放自旋锁，返回守卫对象。
    ///
    /// 挂起发生在自旋锁释放之后，抢占保护此时已经恢复；
    /// 先入集合再挂起，配合挂起原语的令牌语义，不会错过唤醒。
    pub fn lock(&self) -> SleepLockGuard<'_, T> {
        let mut guard = self.lock.lock();

        while self.locked.get() {
            guard.waiters.push(thread::current());
            drop(guard);
            thread::park();
            guard = self.lock.lock();
        }

        self.locked.set(true);
        drop(guard);

        SleepLockGuard {
            lock: self,
            data: unsafe { &mut *self.data.get() },
        }
    }

    /// 释放锁并唤醒一个等待者，由守卫的 `Drop` 调用。
    fn unlock(&self) {
        let mut guard = self.lock.lock();
        if !self.locked.get() {
            panic!("sleeplock {} release", self.name);
        }
        self.locked.set(false);
        if let Some(waiter) = guard.waiters.pop() {
            waiter.unpark();
        }
        drop(guard);
    }
}

/// 睡眠锁守卫，提供对受保护数据的独占访问。
pub struct SleepLockGuard<'a, T: ?Sized> {
    lock: &'a SleepLock<T>,
    data: &'a mut T,
}

impl<'a, T: ?Sized> Deref for SleepLockGuard<'a, T> {
    type Target = T;

    fn deref(&self) -> &T {
        &*self.data
    }
}

impl<'a, T: ?Sized> DerefMut for SleepLockGuard<'a, T> {
    fn deref_mut(&mut self) -> &mut T {
        &mut *self.data
    }
}

impl<'a, T: ?Sized> Drop for SleepLockGuard<'a, T> {
    fn drop(&mut self) {
        self.lock.unlock();
    }
}
