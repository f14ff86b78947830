//! 传输循环
//!
//! 顶层控制流，组合生成器、会话状态机和就绪协调器：
//! 生成一个周期 → 写入设备（处理部分写入）→ 设备未就绪时阻塞等待 →
//! 故障走会话恢复 → 循环。没有自然终止点：持续实时输出不为
//! 非硬件原因停顿，直到收到关闭信号或致命错误。

use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::audio::device::{DeviceCode, DeviceError, DeviceStatus};
use crate::audio::format::{ConfigError, StreamConfig};
use crate::audio::poll::{wait_writable, Wait, WaitError, WakeHandle, WakePipe};
use crate::audio::session::{Session, SessionState};
use crate::audio::stats::StreamStats;
use crate::audio::synth::{ChannelLayout, PhaseState, SineGenerator};

/// 引擎错误
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),
    #[error("device error: {0}")]
    Device(#[from] DeviceError),
    #[error("readiness wait error: {0}")]
    Wait(#[from] WaitError),
    #[error("wake pipe setup failed: {0}")]
    WakePipe(io::Error),
}

/// 就绪门控的结果
enum Gate {
    /// 设备可写，继续
    Proceed,
    /// 走过了恢复路径，回到首写阶段、丢弃当前周期
    Restart,
    /// 收到关闭请求
    Stop,
}

/// 播放引擎
///
/// 独占持有样本缓冲区、相位状态和设备会话（经由 Session）。
/// 单线程阻塞模型：唯一的挂起点是就绪等待。
pub struct Engine {
    session: Session,
    wake: WakePipe,
    shutdown: Arc<AtomicBool>,
    config: StreamConfig,
    layout: ChannelLayout,
    generator: SineGenerator,
    phase: PhaseState,
    /// 一个周期的交织样本区；生成器写、设备读，无并发写者
    buf: Vec<u8>,
    stats: StreamStats,
}

impl Engine {
    /// 由协商完成的会话构造引擎
    ///
    /// 这里把配置契约一次性校验完：配置不变量、通道布局对齐。
    /// 之后的 fill/write 都工作在已验证的布局上。
    pub fn new(
        session: Session,
        freq: f64,
        shutdown: Arc<AtomicBool>,
    ) -> Result<Self, EngineError> {
        let config = session.config();
        config.validate()?;
        let layout = ChannelLayout::interleaved(&config)?;
        let wake = WakePipe::new().map_err(EngineError::WakePipe)?;

        Ok(Self {
            session,
            wake,
            shutdown,
            layout,
            generator: SineGenerator::new(config.format),
            phase: PhaseState::new(freq, config.rate),
            buf: vec![0u8; config.period_bytes()],
            stats: StreamStats::new(),
            config,
        })
    }

    /// 唤醒句柄，交给信号处理线程
    pub fn wake_handle(&self) -> io::Result<WakeHandle> {
        self.wake.wake_handle()
    }

    #[inline]
    pub fn stats(&self) -> &StreamStats {
        &self.stats
    }

    /// 无限期流式输出，直到关闭信号或致命错误
    pub fn run(&mut self) -> Result<(), EngineError> {
        self.session.prepare()?;
        let bytes_per_frame = self.config.bytes_per_frame();
        let period = self.config.period_frames;
        let mut first_write = true;

        'stream: loop {
            if self.shutdown.load(Ordering::Acquire) {
                break;
            }

            // 首写阶段设备缓冲区为空，直接写；之后每个周期先等可写
            if !first_write {
                match self.gate()? {
                    Gate::Proceed => {}
                    Gate::Restart => {
                        first_write = true;
                        continue;
                    }
                    Gate::Stop => break,
                }
            }

            self.generator
                .fill(&mut self.buf, &self.layout, 0, period, &mut self.phase);

            // 写整个周期；部分写入时推进字节游标重试剩余帧
            let mut offset_frames = 0usize;
            let mut remaining = period;
            while remaining > 0 {
                let start = offset_frames * bytes_per_frame;
                match self.session.write(&self.buf[start..], remaining) {
                    Ok(written) => {
                        self.stats.frames += written as u64;
                        if written < remaining {
                            self.stats.short_writes += 1;
                        }
                        offset_frames += written;
                        remaining -= written;
                        if self.session.state() == SessionState::Running {
                            first_write = false;
                        }
                        if remaining == 0 {
                            break;
                        }
                        // 初始缓冲可能装不下整个周期：等到有空间再写剩余
                        match self.gate()? {
                            Gate::Proceed => {}
                            Gate::Restart => {
                                first_write = true;
                                continue 'stream;
                            }
                            Gate::Stop => break 'stream,
                        }
                    }
                    Err(e) => {
                        self.note_fault(&e);
                        self.session.recover(&e)?;
                        first_write = true;
                        // 跳过本周期剩余部分
                        break;
                    }
                }
            }
            if remaining == 0 {
                self.stats.periods += 1;
            }
        }

        // 干净退出：把设备里残留的帧放完，别咔地掐断尾音
        if let Err(e) = self.session.drain() {
            log::warn!("drain on shutdown failed: {e}");
        }
        self.stats.log_summary(self.config.rate);
        Ok(())
    }

    /// 阻塞等待设备可写；错误条件按设备状态走恢复分支
    fn gate(&mut self) -> Result<Gate, EngineError> {
        match wait_writable(&mut self.session, &self.wake)? {
            Wait::Ready => Ok(Gate::Proceed),
            Wait::Cancelled => Ok(Gate::Stop),
            Wait::Error => {
                let err = match self.session.status() {
                    DeviceStatus::Underrun => DeviceError::Underrun,
                    DeviceStatus::Suspended => DeviceError::Suspended,
                    other => {
                        log::error!("poll error condition in state {other:?}");
                        let e = DeviceError::Other(DeviceCode::new(
                            -libc::EIO,
                            "poll signaled error condition",
                        ));
                        // 既非 underrun 也非挂起：不可恢复
                        let _ = self.session.recover(&e);
                        return Err(EngineError::Device(e));
                    }
                };
                self.note_fault(&err);
                self.session.recover(&err)?;
                Ok(Gate::Restart)
            }
        }
    }

    fn note_fault(&mut self, err: &DeviceError) {
        match err {
            DeviceError::Underrun => self.stats.underruns += 1,
            DeviceError::Suspended => self.stats.suspends += 1,
            DeviceError::Other(_) => {}
        }
    }
}
