//! 音频核心模块
//!
//! 包含：
//! - Format: 采样格式、流配置与纯打包函数
//! - Synth: 正弦波生成器与通道布局描述
//! - Device: 设备契约（trait + 故障分类）
//! - Session: 设备会话状态机与故障恢复
//! - Poll: 就绪协调器与可取消等待
//! - Stats: 流统计
//! - Alsa: 真实 ALSA 后端（feature = "alsa"）

pub mod device;
pub mod format;
pub mod poll;
pub mod session;
pub mod stats;
pub mod synth;

#[cfg(all(feature = "alsa", target_os = "linux"))]
pub mod alsa;

pub use device::{DeviceError, DeviceStatus, PcmDevice, ReadyEvents};
pub use format::{pack_sample, ConfigError, SampleFormat, StreamConfig};
pub use poll::{wait_writable, Wait, WakeHandle, WakePipe};
pub use session::{Session, SessionState};
pub use stats::StreamStats;
pub use synth::{ChannelArea, ChannelLayout, PhaseState, SineGenerator};
