//! 流统计
//!
//! 传输循环是唯一写者（单线程阻塞 I/O 模型），普通计数器即可，
//! 不需要原子操作。退出时汇总输出一次。

/// 流统计计数器
#[derive(Debug, Default, Clone)]
pub struct StreamStats {
    /// 完整写出的周期数
    pub periods: u64,
    /// 写出的总帧数
    pub frames: u64,
    /// 部分写入（单次 write 未吃下全部剩余帧）次数
    pub short_writes: u64,
    /// underrun 恢复次数
    pub underruns: u64,
    /// 挂起恢复次数
    pub suspends: u64,
}

impl StreamStats {
    pub fn new() -> Self {
        Self::default()
    }

    /// 已播放秒数
    pub fn seconds_played(&self, rate: u32) -> f64 {
        self.frames as f64 / rate as f64
    }

    /// 退出时的汇总日志
    pub fn log_summary(&self, rate: u32) {
        log::info!(
            "stream summary: {} periods, {} frames ({:.1}s), {} short writes, {} underruns, {} suspends",
            self.periods,
            self.frames,
            self.seconds_played(rate),
            self.short_writes,
            self.underruns,
            self.suspends
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_seconds_played() {
        let mut stats = StreamStats::new();
        stats.frames = 44100 * 3;
        assert_eq!(stats.seconds_played(44100), 3.0);
    }
}
