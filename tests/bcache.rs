//! 缓存层的端到端测试：互斥交接、写回、钉住与窃取、设备故障恢复。

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;

use kpool::consts::{NBUF_PER, NHASH};
use kpool::{Bcache, BlockIo, BufData, DiskError, RamDisk};

/// 同余于 NHASH 的块号全部落在同一个缓存分片。
fn stride(base: u32, k: u32) -> u32 {
    base + k * NHASH as u32
}

#[test]
fn exclusive_handoff_between_contexts() {
    let cache = Arc::new(Bcache::new(RamDisk::new(64)));

    let mut handles = Vec::new();
    for _ in 0..8 {
        let cache = Arc::clone(&cache);
        handles.push(thread::spawn(move || {
            for _ in 0..500 {
                let mut b = cache.bread(0, 5).unwrap();
                let mut v = u64::from_le_bytes(b.data()[..8].try_into().unwrap());
                v += 1;
                b.data_mut()[..8].copy_from_slice(&v.to_le_bytes());
            }
        }));
    }
    for h in handles {
        h.join().unwrap();
    }

    // 丢失任何一次更新都说明独占交接被打破
    let b = cache.bread(0, 5).unwrap();
    assert_eq!(u64::from_le_bytes(b.data()[..8].try_into().unwrap()), 4000);
}

#[test]
fn written_back_block_survives_eviction() {
    let cache = Bcache::new(RamDisk::new(4096));
    {
        let mut b = cache.bread(0, stride(2, 0)).unwrap();
        b.data_mut()[0] = 0xcd;
        b.bwrite().unwrap();
    }
    // 用同分片的块把它挤出缓存
    for k in 1..=NBUF_PER as u32 {
        let _ = cache.bread(0, stride(2, k)).unwrap();
    }
    let b = cache.bread(0, stride(2, 0)).unwrap();
    assert_eq!(b.data()[0], 0xcd);
}

#[test]
fn pinned_block_survives_cache_pressure() {
    let cache = Bcache::new(RamDisk::new(4096));
    {
        let mut b = cache.bread(0, stride(1, 0)).unwrap();
        b.data_mut()[0] = 0x42;
        // 只改内存副本，不写回：钉住之后它必须留在缓存里
        b.pin();
    }
    for k in 1..=(NBUF_PER as u32 + 4) {
        let _ = cache.bread(0, stride(1, k)).unwrap();
    }
    let b = cache.bread(0, stride(1, 0)).unwrap();
    assert_eq!(b.data()[0], 0x42, "pinned buffer must not be recycled");
    b.unpin();
}

#[test]
fn get_steals_when_home_bucket_is_pinned() {
    let cache = Bcache::new(RamDisk::new(4096));

    // 钉满一个分片的全部槽位
    for k in 0..NBUF_PER as u32 {
        let b = cache.bread(0, stride(6, k)).unwrap();
        b.pin();
    }

    // 本分片已无可回收槽位，只能靠窃取满足
    let b = cache.bread(0, stride(6, NBUF_PER as u32)).unwrap();
    assert_eq!(b.blockno(), stride(6, NBUF_PER as u32));
    drop(b);

    for k in 0..NBUF_PER as u32 {
        let b = cache.bread(0, stride(6, k)).unwrap();
        b.unpin();
    }
}

/// 先失败指定次数、之后正常工作的设备。
struct FlakyDisk {
    inner: RamDisk,
    failures_left: AtomicUsize,
}

impl BlockIo for FlakyDisk {
    fn rw(&self, dev: u32, blockno: u32, data: &mut BufData, writing: bool) -> kpool::Result<()> {
        if self
            .failures_left
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
        {
            return Err(DiskError::Transfer { dev, blockno });
        }
        self.inner.rw(dev, blockno, data, writing)
    }
}

#[test]
fn device_failure_is_recoverable() {
    let cache = Bcache::new(FlakyDisk {
        inner: RamDisk::new(16),
        failures_left: AtomicUsize::new(1),
    });

    assert_eq!(
        cache.bread(0, 3).err(),
        Some(DiskError::Transfer { dev: 0, blockno: 3 })
    );

    // 失败的装载不会留下“有效”的空壳，重试重新读盘
    let b = cache.bread(0, 3).unwrap();
    assert!(b.data().iter().all(|&x| x == 0));
}
