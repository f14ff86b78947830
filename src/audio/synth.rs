//! 正弦波生成器
//!
//! 直接按设备描述的通道布局写入交织样本缓冲区：
//! - PhaseState: 跨周期持续推进的相位状态
//! - ChannelLayout: 每通道 {起始位偏移, 样本间位步长}，构造时校验字节对齐
//! - SineGenerator: 逐帧计算 sin(phase)，按格式打包进每个通道的容器

use std::f64::consts::PI;

use super::format::{pack_sample, ConfigError, SampleFormat, StreamConfig};

const MAX_PHASE: f64 = 2.0 * PI;

/// 相位状态
///
/// phase 始终保持在 [0, 2π) 内，避免长时间运行后的精度流失。
/// 由长生命周期的传输循环持有，跨周期累积，不随单次 fill 重置。
#[derive(Clone, Copy, Debug)]
pub struct PhaseState {
    phase: f64,
    step: f64,
}

impl PhaseState {
    /// 由目标频率和帧率导出每帧相位增量
    pub fn new(freq: f64, rate: u32) -> Self {
        Self {
            phase: 0.0,
            step: MAX_PHASE * freq / rate as f64,
        }
    }

    #[inline]
    pub fn phase(&self) -> f64 {
        self.phase
    }

    /// 推进一帧并对 2π 取模
    #[inline]
    fn advance(&mut self) {
        self.phase += self.step;
        if self.phase >= MAX_PHASE {
            self.phase -= MAX_PHASE;
        }
    }
}

/// 单通道布局描述
///
/// 纯数据：共享样本区内该通道首样本的位偏移和相邻样本的位步长
#[derive(Clone, Copy, Debug)]
pub struct ChannelArea {
    pub first_bits: usize,
    pub step_bits: usize,
}

/// 校验后的多通道布局
///
/// 偏移与步长必须字节对齐（8 的倍数）：这是配置契约，
/// 违反属于致命配置错误，在构造时拒绝，不属于运行期故障
#[derive(Clone, Debug)]
pub struct ChannelLayout {
    areas: Vec<ChannelArea>,
    format: SampleFormat,
}

impl ChannelLayout {
    /// 标准交织布局：通道 n 起始于 n 个物理样本宽，步长为整帧宽
    pub fn interleaved(config: &StreamConfig) -> Result<Self, ConfigError> {
        let phys_bits = config.format.phys_bits();
        let areas = (0..config.channels as usize)
            .map(|chn| ChannelArea {
                first_bits: chn * phys_bits,
                step_bits: config.channels as usize * phys_bits,
            })
            .collect();
        Self::from_areas(areas, config.format)
    }

    /// 从设备给出的任意布局构造，校验对齐
    pub fn from_areas(areas: Vec<ChannelArea>, format: SampleFormat) -> Result<Self, ConfigError> {
        for (chn, area) in areas.iter().enumerate() {
            if area.first_bits % 8 != 0 {
                return Err(ConfigError::UnalignedFirst {
                    channel: chn,
                    bits: area.first_bits,
                });
            }
            if area.step_bits % 8 != 0 {
                return Err(ConfigError::UnalignedStep {
                    channel: chn,
                    bits: area.step_bits,
                });
            }
        }
        Ok(Self { areas, format })
    }

    #[inline]
    pub fn channels(&self) -> usize {
        self.areas.len()
    }

    #[inline]
    pub fn format(&self) -> SampleFormat {
        self.format
    }
}

/// 正弦波生成器
///
/// 纯函数式：输出只取决于 PhaseState 与格式，相同输入产生逐位相同的字节
pub struct SineGenerator {
    format: SampleFormat,
    maxval: f64,
}

impl SineGenerator {
    pub fn new(format: SampleFormat) -> Self {
        Self {
            format,
            maxval: format.max_amplitude(),
        }
    }

    /// 向缓冲区写入 count 帧正弦样本
    ///
    /// `offset` 为布局内的起始帧号；每写一帧推进一次相位。
    /// 幅值：定点格式取 sin(phase) * maxval 截断；float 格式直接发射
    /// f32 位模式；无符号格式在转换后异或符号位做偏置。
    pub fn fill(
        &self,
        buf: &mut [u8],
        layout: &ChannelLayout,
        offset: usize,
        count: usize,
        phase: &mut PhaseState,
    ) {
        let format = self.format;
        let phys_bps = format.phys_bytes_per_sample();
        let to_unsigned = format.is_unsigned();
        let is_float = format.is_float();
        let sign_bit = 1i32 << (format.bits() - 1);

        // 每通道的字节游标（布局已在构造时保证字节对齐）
        let mut positions: Vec<usize> = layout
            .areas
            .iter()
            .map(|a| a.first_bits / 8 + offset * (a.step_bits / 8))
            .collect();
        let steps: Vec<usize> = layout.areas.iter().map(|a| a.step_bits / 8).collect();

        for _ in 0..count {
            let res = if is_float {
                (phase.phase.sin() as f32).to_bits() as i32
            } else {
                let mut res = (phase.phase.sin() * self.maxval) as i32;
                if to_unsigned {
                    res ^= sign_bit;
                }
                res
            };

            for (pos, step) in positions.iter_mut().zip(&steps) {
                pack_sample(res, format, &mut buf[*pos..*pos + phys_bps]);
                *pos += *step;
            }
            phase.advance();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn mono_s16_config(period: usize) -> StreamConfig {
        StreamConfig {
            format: SampleFormat::S16Le,
            channels: 1,
            rate: 44100,
            buffer_frames: period * 4,
            period_frames: period,
        }
    }

    fn decode_s16le(buf: &[u8]) -> Vec<i16> {
        buf.chunks_exact(2)
            .map(|c| i16::from_le_bytes([c[0], c[1]]))
            .collect()
    }

    #[test]
    fn test_deterministic_output() {
        // 相同初始相位 + 相同帧数 ⇒ 输出逐位一致
        let config = mono_s16_config(512);
        let layout = ChannelLayout::interleaved(&config).unwrap();
        let gen = SineGenerator::new(config.format);

        let mut buf_a = vec![0u8; config.period_bytes()];
        let mut buf_b = vec![0u8; config.period_bytes()];
        let mut phase_a = PhaseState::new(440.0, config.rate);
        let mut phase_b = PhaseState::new(440.0, config.rate);

        gen.fill(&mut buf_a, &layout, 0, 512, &mut phase_a);
        gen.fill(&mut buf_b, &layout, 0, 512, &mut phase_b);

        assert_eq!(buf_a, buf_b);
        assert_eq!(phase_a.phase(), phase_b.phase());
    }

    #[test]
    fn test_phase_stays_wrapped() {
        // 任意帧数之后 0 <= phase < 2π
        let config = mono_s16_config(256);
        let layout = ChannelLayout::interleaved(&config).unwrap();
        let gen = SineGenerator::new(config.format);
        let mut buf = vec![0u8; config.period_bytes()];
        let mut phase = PhaseState::new(997.3, config.rate);

        for _ in 0..200 {
            gen.fill(&mut buf, &layout, 0, 256, &mut phase);
            assert!(phase.phase() >= 0.0 && phase.phase() < MAX_PHASE);
        }
    }

    #[test]
    fn test_sine_accuracy_mono_s16() {
        // 端到端：mono S16_LE 44100Hz 440Hz，period 4410
        // 首样本为 0，全部样本落在理想值 ±1 LSB 内
        let config = mono_s16_config(4410);
        let layout = ChannelLayout::interleaved(&config).unwrap();
        let gen = SineGenerator::new(config.format);
        let mut buf = vec![0u8; config.period_bytes()];
        let mut phase = PhaseState::new(440.0, config.rate);

        gen.fill(&mut buf, &layout, 0, 4410, &mut phase);
        let samples = decode_s16le(&buf);

        assert_eq!(samples[0], 0);
        for (n, &s) in samples.iter().enumerate() {
            let ideal = (32767.0 * (MAX_PHASE * 440.0 * n as f64 / 44100.0).sin()).round();
            assert!(
                (s as f64 - ideal).abs() <= 1.0,
                "sample {n}: got {s}, ideal {ideal}"
            );
        }
    }

    #[test]
    fn test_stereo_interleave() {
        // 立体声：同一帧两个通道写入同一个值，位置按帧宽交织
        let config = StreamConfig {
            format: SampleFormat::S16Le,
            channels: 2,
            rate: 48000,
            buffer_frames: 1024,
            period_frames: 64,
        };
        let layout = ChannelLayout::interleaved(&config).unwrap();
        let gen = SineGenerator::new(config.format);
        let mut buf = vec![0u8; config.period_bytes()];
        let mut phase = PhaseState::new(1000.0, config.rate);

        gen.fill(&mut buf, &layout, 0, 64, &mut phase);
        let samples = decode_s16le(&buf);
        for frame in samples.chunks_exact(2) {
            assert_eq!(frame[0], frame[1]);
        }
    }

    #[test]
    fn test_unsigned_bias() {
        // U8：sin(0)=0 经符号位偏置后是 0x80（无符号中点）
        let config = StreamConfig {
            format: SampleFormat::U8,
            channels: 1,
            rate: 44100,
            buffer_frames: 64,
            period_frames: 16,
        };
        let layout = ChannelLayout::interleaved(&config).unwrap();
        let gen = SineGenerator::new(config.format);
        let mut buf = vec![0u8; config.period_bytes()];
        let mut phase = PhaseState::new(440.0, config.rate);

        gen.fill(&mut buf, &layout, 0, 16, &mut phase);
        assert_eq!(buf[0], 0x80);
    }

    #[test]
    fn test_float_emits_ieee_bits() {
        let config = StreamConfig {
            format: SampleFormat::FloatLe,
            channels: 1,
            rate: 44100,
            buffer_frames: 64,
            period_frames: 4,
        };
        let layout = ChannelLayout::interleaved(&config).unwrap();
        let gen = SineGenerator::new(config.format);
        let mut buf = vec![0u8; config.period_bytes()];
        let mut phase = PhaseState::new(440.0, config.rate);

        gen.fill(&mut buf, &layout, 0, 4, &mut phase);

        let step = MAX_PHASE * 440.0 / 44100.0;
        for n in 0..4 {
            let got = u32::from_le_bytes(buf[n * 4..n * 4 + 4].try_into().unwrap());
            let want = ((step * n as f64).sin() as f32).to_bits();
            assert_eq!(got, want, "frame {n}");
        }
    }

    #[test]
    fn test_offset_writes_later_frames() {
        // offset 指定布局内起始帧：后半段写入不触碰前半段
        let config = mono_s16_config(8);
        let layout = ChannelLayout::interleaved(&config).unwrap();
        let gen = SineGenerator::new(config.format);
        let mut buf = vec![0xAAu8; config.period_bytes()];
        let mut phase = PhaseState::new(440.0, config.rate);

        gen.fill(&mut buf, &layout, 4, 4, &mut phase);
        assert!(buf[..8].iter().all(|&b| b == 0xAA));
        assert_eq!(&buf[8..10], &[0, 0]); // sin(0) = 0
    }

    #[test]
    fn test_rejects_unaligned_layout() {
        let areas = vec![ChannelArea {
            first_bits: 4,
            step_bits: 16,
        }];
        assert!(matches!(
            ChannelLayout::from_areas(areas, SampleFormat::S16Le),
            Err(ConfigError::UnalignedFirst { channel: 0, .. })
        ));

        let areas = vec![ChannelArea {
            first_bits: 0,
            step_bits: 12,
        }];
        assert!(matches!(
            ChannelLayout::from_areas(areas, SampleFormat::S16Le),
            Err(ConfigError::UnalignedStep { channel: 0, .. })
        ));
    }
}
