//! 块设备接口。
//!
//! 缓存层只依赖一个同步的传输契约：调用返回时，读操作已把块内容
//! 填入缓冲区，写操作已把缓冲区内容提交给设备。真正的设备驱动
//! 在缓存之外实现；这里另提供一个内存盘作为参考设备。

use crate::bio::BufData;
use crate::consts::BSIZE;
use crate::error::{DiskError, Result};
use crate::spinlock::SpinLock;

/// 同步块设备契约，由缓存层在持有缓冲区独占锁时调用。
///
/// `writing` 为 false 时把 `(dev, blockno)` 的内容读入 `data`；
/// 为 true 时把 `data` 写入设备。没有部分传输的语义：
/// 要么整块成功，要么返回错误。
pub trait BlockIo: Send + Sync {
    fn rw(&self, dev: u32, blockno: u32, data: &mut BufData, writing: bool) -> Result<()>;
}

/// 内存盘：以内存数组模拟的单设备块存储。
///
/// 忽略 `dev` 编号（只模拟一个设备）。块数组由自旋锁保护，
/// 传输期间持锁完成整块拷贝，符合同步契约。
pub struct RamDisk {
    blocks: SpinLock<Vec<[u8; BSIZE]>>,
}

impl RamDisk {
    /// 创建一个含 `nblocks` 个全零块的内存盘。
    pub fn new(nblocks: usize) -> Self {
        Self {
            blocks: SpinLock::new(vec![[0; BSIZE]; nblocks], "ramdisk"),
        }
    }
}

impl BlockIo for RamDisk {
    fn rw(&self, dev: u32, blockno: u32, data: &mut BufData, writing: bool) -> Result<()> {
        let mut blocks = self.blocks.lock();
        let block = blocks
            .get_mut(blockno as usize)
            .ok_or(DiskError::BadBlock { dev, blockno })?;
        if writing {
            block.copy_from_slice(data.bytes());
        } else {
            data.bytes_mut().copy_from_slice(block);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn read_back_what_was_written() {
        let disk = RamDisk::new(4);
        let mut data = BufData::new();
        data.bytes_mut()[0] = 0xa5;
        disk.rw(0, 2, &mut data, true).unwrap();

        let mut out = BufData::new();
        disk.rw(0, 2, &mut out, false).unwrap();
        assert_eq!(out.bytes()[0], 0xa5);
        assert_eq!(out.bytes()[1], 0);
    }

    #[test]
    fn out_of_range_block_is_an_error() {
        let disk = RamDisk::new(4);
        let mut data = BufData::new();
        assert_eq!(
            disk.rw(0, 9, &mut data, false),
            Err(DiskError::BadBlock { dev: 0, blockno: 9 })
        );
    }
}
