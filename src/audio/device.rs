//! 设备契约
//!
//! 驱动层是外部协作者，这里只定义核心依赖的边界：
//! - PcmDevice: 打开/协商之后的设备句柄能做的事
//! - DeviceError: 写入/轮询的故障分类（瞬时可恢复 vs 不可恢复）
//! - DeviceStatus: 查询句柄得到的会话状态，驱动恢复分支

use std::fmt;

use super::format::StreamConfig;

/// 设备故障
///
/// Underrun / Suspended 属于瞬时故障，由会话状态机就地恢复；
/// 其余负值结果一律 Other，向上传播后终止进程
#[derive(Debug, Clone, thiserror::Error)]
pub enum DeviceError {
    /// 设备输出缓冲区被耗尽（buffer empty）
    #[error("buffer underrun")]
    Underrun,
    /// 设备被挂起（如电源管理）
    #[error("device suspended")]
    Suspended,
    /// 其他设备错误，携带因果码
    #[error("device error: {0}")]
    Other(DeviceCode),
}

/// 设备侧因果码（errno 风格负值 + 描述）
#[derive(Debug, Clone)]
pub struct DeviceCode {
    pub code: i32,
    pub what: &'static str,
}

impl DeviceCode {
    pub fn new(code: i32, what: &'static str) -> Self {
        Self { code, what }
    }

    /// 是否为"稍后重试"（resume 轮询的继续条件）
    #[inline]
    pub fn is_try_again(&self) -> bool {
        self.code == -libc::EAGAIN
    }
}

impl fmt::Display for DeviceCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} (code {})", self.what, self.code)
    }
}

/// 查询设备句柄得到的会话状态
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceStatus {
    /// 已配置/已 prepare，尚未运行
    Setup,
    /// 正在流式输出
    Running,
    /// 输出缓冲区已耗尽
    Underrun,
    /// 设备挂起
    Suspended,
    /// 不可恢复状态
    Fatal,
}

/// 就绪事件翻译结果
///
/// 由设备将原始 revents 掩码翻译成设备语义的就绪位
#[derive(Debug, Clone, Copy, Default)]
pub struct ReadyEvents {
    pub error: bool,
    pub output_ready: bool,
}

/// 协商完成后的播放设备句柄
///
/// 打开与参数协商发生在具体后端的构造函数里；到达这里的设备
/// 已持有一份不可变的 StreamConfig。关闭通过 Drop。
pub trait PcmDevice {
    /// 协商结果（调用方必须使用接受值，而非请求值）
    fn config(&self) -> &StreamConfig;

    /// prepare 过渡：使设备进入可写状态
    fn prepare(&mut self) -> Result<(), DeviceError>;

    /// 写入至多 frames 帧，返回实际接受的帧数（可能部分写入）
    ///
    /// `buf` 从本次写入的首帧起始，长度至少 frames * bytes_per_frame
    fn write(&mut self, buf: &[u8], frames: usize) -> Result<usize, DeviceError>;

    /// 设备的 OS 级等待描述符集合
    fn poll_descriptors(&mut self) -> Result<Vec<libc::pollfd>, DeviceError>;

    /// 将 poll 返回的 revents 翻译为设备语义的就绪位
    fn translate_ready_events(
        &mut self,
        fds: &mut [libc::pollfd],
    ) -> Result<ReadyEvents, DeviceError>;

    /// 从挂起状态恢复；Other(EAGAIN) 表示挂起尚未解除，稍后重试
    fn resume(&mut self) -> Result<(), DeviceError>;

    /// 查询当前会话状态
    fn status(&mut self) -> DeviceStatus;

    /// 清空残留缓冲（干净退出用）；默认无事可做
    fn drain(&mut self) -> Result<(), DeviceError> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_try_again_detection() {
        assert!(DeviceCode::new(-libc::EAGAIN, "resume pending").is_try_again());
        assert!(!DeviceCode::new(-libc::EIO, "io error").is_try_again());
    }

    #[test]
    fn test_error_display() {
        let err = DeviceError::Other(DeviceCode::new(-5, "write failed"));
        assert_eq!(err.to_string(), "device error: write failed (code -5)");
    }
}
