//! Tonepipe - 正弦波 PCM 播放器
//!
//! 设计目标：
//! - 输出永不停顿：poll 节拍的阻塞写入循环，背压来自设备缓冲区本身
//! - 故障就地恢复：underrun / 挂起在会话状态机内消化，不打断输出
//! - 干净退出：Ctrl+C 经唤醒管道取消阻塞等待，排空尾音后汇总统计

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use clap::Parser;

use tonepipe::audio::alsa::{AlsaConfig, AlsaDevice};
use tonepipe::audio::{SampleFormat, Session};
use tonepipe::engine::Engine;

/// Tonepipe - poll-paced PCM tone player
#[derive(Parser)]
#[command(name = "tonepipe")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Playback device name
    #[arg(short = 'D', long, default_value = "plughw:0,0")]
    device: String,

    /// Sample format (s8, u8, s16_le, s16_be, ..., float_le, float_be)
    #[arg(short, long, default_value = "s16_le")]
    format: String,

    /// Stream rate in Hz
    #[arg(short, long, default_value = "44100")]
    rate: u32,

    /// Count of channels
    #[arg(short, long, default_value = "1")]
    channels: u16,

    /// Sine wave frequency in Hz
    #[arg(short = 'F', long, default_value = "440.0")]
    freq: f64,

    /// Ring buffer length in microseconds
    #[arg(short, long, default_value = "500000")]
    buffer_time: u32,

    /// Period time in microseconds
    #[arg(short, long, default_value = "100000")]
    period_time: u32,

    /// Disable driver-side resampling
    #[arg(short = 'n', long)]
    no_resample: bool,

    /// Produce a poll event after each period
    #[arg(short = 'e', long)]
    period_event: bool,

    /// Show verbose output (and dump the negotiated PCM setup)
    #[arg(short, long)]
    verbose: bool,
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // 初始化日志
    if cli.verbose {
        env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    } else {
        env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("warn")).init();
    }

    let format: SampleFormat = cli.format.parse()?;

    println!("Playback device is {}", cli.device);
    println!(
        "Stream parameters are {}Hz, {}, {} channels",
        cli.rate, format, cli.channels
    );
    println!("Sine wave rate is {:.4}Hz", cli.freq);

    // 打开并协商；之后 StreamConfig 不可变，尺寸一律取接受值
    let device = AlsaDevice::open(&AlsaConfig {
        device: cli.device.clone(),
        format,
        channels: cli.channels,
        rate: cli.rate,
        buffer_time_us: cli.buffer_time,
        period_time_us: cli.period_time,
        resample: !cli.no_resample,
        period_event: cli.period_event,
        dump_setup: cli.verbose,
    })?;

    let shutdown = Arc::new(AtomicBool::new(false));
    let session = Session::new(Box::new(device));
    let mut engine = Engine::new(session, cli.freq, shutdown.clone())?;

    // Ctrl+C：置关闭标志并唤醒阻塞中的就绪等待
    let wake = engine.wake_handle()?;
    ctrlc::set_handler(move || {
        shutdown.store(true, Ordering::Release);
        wake.wake();
    })?;

    println!("Press Ctrl+C to stop playback");
    engine.run()?;

    Ok(())
}
