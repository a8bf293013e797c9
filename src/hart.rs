//! hart（硬件线程）状态管理，提供 hart 编号与抢占保护开关。
//!
//! 宿主环境下每个内核执行流对应一个线程：线程在启动时通过 [`bind`]
//! 绑定自己的 hart 编号（对应内核启动时写入线程指针寄存器的动作），
//! 未绑定的线程在首次访问时自动获得一个进程内唯一的编号。

use core::cell::Cell;
use std::sync::atomic::{AtomicUsize, Ordering};

/// 自动分配 hart 编号的计数器。
static NEXT_ID: AtomicUsize = AtomicUsize::new(0);

std::thread_local! {
    static HART: Hart = Hart {
        id: Cell::new(None),
        noff: Cell::new(0),
        intena: Cell::new(false),
        intr: Cell::new(true),
    };
}

/// 单个 hart 的本地状态。
///
/// # 字段说明
/// - `id`: 绑定的 hart 编号，未绑定时为 `None`；
/// - `noff`: `push_off` 的嵌套深度；
/// - `intena`: 最外层 `push_off` 之前的抢占开关状态；
/// - `intr`: 模拟的本地中断（抢占）开关。
struct Hart {
    id: Cell<Option<usize>>,
    noff: Cell<usize>,
    intena: Cell<bool>,
    intr: Cell<bool>,
}

/// 把当前线程绑定为编号 `id` 的 hart。
///
/// # 功能说明
/// 对应内核启动路径里为每个 hart 写入自身编号的动作。绑定影响
/// 页分配器对“本地分片”的选择（按 `id % NCPU` 取模）。
///
/// # 可能的错误
/// - 当前线程已经持有一个不同的编号时 panic，绑定只允许发生一次。
pub fn bind(id: usize) {
    HART.with(|h| match h.id.get() {
        None => h.id.set(Some(id)),
        Some(old) if old == id => {}
        Some(_) => panic!("hart: already bound"),
    });
}

/// 返回当前线程的 hart 编号，未绑定时自动分配一个唯一编号。
pub fn id() -> usize {
    HART.with(|h| match h.id.get() {
        Some(id) => id,
        None => {
            let id = NEXT_ID.fetch_add(1, Ordering::Relaxed);
            h.id.set(Some(id));
            id
        }
    })
}

/// 关闭本地抢占，并记录嵌套深度。
///
/// # 流程解释
/// 1. 记下当前抢占开关状态并关闭抢占；
/// 2. 若是最外层调用，把先前的开关状态存入 `intena`；
/// 3. 嵌套深度加一。
///
/// 与 [`pop_off`] 成对使用，嵌套多少次就要恢复多少次。
pub(crate) fn push_off() {
    HART.with(|h| {
        let old = h.intr.get();
        h.intr.set(false);
        if h.noff.get() == 0 {
            h.intena.set(old);
        }
        h.noff.set(h.noff.get() + 1);
    });
}

/// 恢复一层 [`push_off`] 关闭的抢占。
///
/// # 可能的错误
/// - 抢占在调用时已经打开，说明配对关系被破坏，panic；
/// - 嵌套深度已经为 0 时再调用，panic。
pub(crate) fn pop_off() {
    HART.with(|h| {
        if h.intr.get() {
            panic!("pop_off(): interruptable");
        }
        let noff = h.noff.get();
        if noff < 1 {
            panic!("pop_off(): count not match");
        }
        h.noff.set(noff - 1);
        if noff == 1 && h.intena.get() {
            h.intr.set(true);
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn push_pop_nesting() {
        push_off();
        push_off();
        pop_off();
        pop_off();
        HART.with(|h| assert!(h.intr.get()));
    }

    #[test]
    fn bind_is_sticky() {
        std::thread::spawn(|| {
            bind(3);
            assert_eq!(id(), 3);
            bind(3);
        })
        .join()
        .unwrap();
    }
}
