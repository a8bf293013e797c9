//! 错误类型。
//!
//! 只收录可恢复的故障：设备传输失败沿调用链上报，由请求方决定重试或放弃。
//! 不变量被破坏（错误的释放、越界的页地址、缓存池耗尽）属于损坏征兆，
//! 一律 panic，不在此建模。

use thiserror::Error;

pub type Result<T> = core::result::Result<T, DiskError>;

/// 块设备传输层的可恢复错误。
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum DiskError {
    /// 设备上不存在请求的块。
    #[error("device {dev}: no such block {blockno}")]
    BadBlock { dev: u32, blockno: u32 },

    /// 设备报告一次传输失败。
    #[error("device {dev}: transfer failed at block {blockno}")]
    Transfer { dev: u32, blockno: u32 },
}
