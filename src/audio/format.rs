//! 采样格式与样本打包
//!
//! 格式模型：位宽（8/16/24/32 或 float）× 字节序 × 符号性
//! - 逻辑位宽 bits：样本的有效位数
//! - 物理位宽 phys_bits：样本在容器中占据的位数（24-bit 装在 32-bit 容器里）
//! - 打包时只发射 bits/8 个字节，容器内的 padding 位置由字节序决定

use std::fmt;
use std::str::FromStr;

/// 配置阶段错误
///
/// 全部属于流启动前的致命错误：配置本身不合法，不做任何重试
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("unknown sample format: {0}")]
    UnknownFormat(String),
    #[error("channel {channel} first bit offset {bits} is not byte aligned")]
    UnalignedFirst { channel: usize, bits: usize },
    #[error("channel {channel} step {bits} bits is not byte aligned")]
    UnalignedStep { channel: usize, bits: usize },
    #[error("buffer size {buffer} frames is smaller than period size {period} frames")]
    BufferSmallerThanPeriod { buffer: usize, period: usize },
    #[error("period size must be non-zero")]
    ZeroPeriod,
    #[error("channel count must be non-zero")]
    ZeroChannels,
}

/// 采样格式
///
/// 命名跟随 PCM 惯例：S/U + 位宽 + 字节序后缀，Float 固定 32-bit IEEE-754
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SampleFormat {
    S8,
    U8,
    S16Le,
    S16Be,
    U16Le,
    U16Be,
    S24Le,
    S24Be,
    U24Le,
    U24Be,
    S32Le,
    S32Be,
    U32Le,
    U32Be,
    FloatLe,
    FloatBe,
}

impl SampleFormat {
    /// 逻辑位宽（有效位数）
    #[inline]
    pub fn bits(&self) -> usize {
        match self {
            Self::S8 | Self::U8 => 8,
            Self::S16Le | Self::S16Be | Self::U16Le | Self::U16Be => 16,
            Self::S24Le | Self::S24Be | Self::U24Le | Self::U24Be => 24,
            Self::S32Le | Self::S32Be | Self::U32Le | Self::U32Be => 32,
            Self::FloatLe | Self::FloatBe => 32,
        }
    }

    /// 物理位宽（容器位数）
    ///
    /// 24-bit 格式装在 32-bit 容器中，其余格式容器与逻辑位宽一致
    #[inline]
    pub fn phys_bits(&self) -> usize {
        match self {
            Self::S24Le | Self::S24Be | Self::U24Le | Self::U24Be => 32,
            _ => self.bits(),
        }
    }

    /// 每样本发射的字节数
    #[inline]
    pub fn bytes_per_sample(&self) -> usize {
        self.bits() / 8
    }

    /// 每样本在缓冲区中占据的字节数
    #[inline]
    pub fn phys_bytes_per_sample(&self) -> usize {
        self.phys_bits() / 8
    }

    #[inline]
    pub fn is_big_endian(&self) -> bool {
        matches!(
            self,
            Self::S16Be
                | Self::U16Be
                | Self::S24Be
                | Self::U24Be
                | Self::S32Be
                | Self::U32Be
                | Self::FloatBe
        )
    }

    #[inline]
    pub fn is_unsigned(&self) -> bool {
        matches!(
            self,
            Self::U8
                | Self::U16Le
                | Self::U16Be
                | Self::U24Le
                | Self::U24Be
                | Self::U32Le
                | Self::U32Be
        )
    }

    #[inline]
    pub fn is_float(&self) -> bool {
        matches!(self, Self::FloatLe | Self::FloatBe)
    }

    /// 定点格式的满幅值：(1 << (bits-1)) - 1
    ///
    /// 32-bit 时中间值超出 i32，用 u64 计算
    #[inline]
    pub fn max_amplitude(&self) -> f64 {
        ((1u64 << (self.bits() - 1)) - 1) as f64
    }

    /// 所有支持的格式（测试与 CLI 帮助用）
    pub fn all() -> &'static [SampleFormat] {
        &[
            Self::S8,
            Self::U8,
            Self::S16Le,
            Self::S16Be,
            Self::U16Le,
            Self::U16Be,
            Self::S24Le,
            Self::S24Be,
            Self::U24Le,
            Self::U24Be,
            Self::S32Le,
            Self::S32Be,
            Self::U32Le,
            Self::U32Be,
            Self::FloatLe,
            Self::FloatBe,
        ]
    }
}

impl fmt::Display for SampleFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::S8 => "S8",
            Self::U8 => "U8",
            Self::S16Le => "S16_LE",
            Self::S16Be => "S16_BE",
            Self::U16Le => "U16_LE",
            Self::U16Be => "U16_BE",
            Self::S24Le => "S24_LE",
            Self::S24Be => "S24_BE",
            Self::U24Le => "U24_LE",
            Self::U24Be => "U24_BE",
            Self::S32Le => "S32_LE",
            Self::S32Be => "S32_BE",
            Self::U32Le => "U32_LE",
            Self::U32Be => "U32_BE",
            Self::FloatLe => "FLOAT_LE",
            Self::FloatBe => "FLOAT_BE",
        };
        f.write_str(name)
    }
}

impl FromStr for SampleFormat {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "s8" => Ok(Self::S8),
            "u8" => Ok(Self::U8),
            "s16" | "s16_le" => Ok(Self::S16Le),
            "s16_be" => Ok(Self::S16Be),
            "u16" | "u16_le" => Ok(Self::U16Le),
            "u16_be" => Ok(Self::U16Be),
            "s24" | "s24_le" => Ok(Self::S24Le),
            "s24_be" => Ok(Self::S24Be),
            "u24" | "u24_le" => Ok(Self::U24Le),
            "u24_be" => Ok(Self::U24Be),
            "s32" | "s32_le" => Ok(Self::S32Le),
            "s32_be" => Ok(Self::S32Be),
            "u32" | "u32_le" => Ok(Self::U32Le),
            "u32_be" => Ok(Self::U32Be),
            "float" | "float_le" => Ok(Self::FloatLe),
            "float_be" => Ok(Self::FloatBe),
            other => Err(ConfigError::UnknownFormat(other.to_string())),
        }
    }
}

/// 协商后的流配置
///
/// 协商完成后不可变：buffer/period 是驱动实际接受的值，不是请求值
#[derive(Clone, Copy, Debug)]
pub struct StreamConfig {
    pub format: SampleFormat,
    pub channels: u16,
    pub rate: u32,
    /// 设备环形缓冲区大小（帧）
    pub buffer_frames: usize,
    /// 每次传输的周期大小（帧）
    pub period_frames: usize,
}

impl StreamConfig {
    /// 校验配置不变量
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.channels == 0 {
            return Err(ConfigError::ZeroChannels);
        }
        if self.period_frames == 0 {
            return Err(ConfigError::ZeroPeriod);
        }
        if self.buffer_frames < self.period_frames {
            return Err(ConfigError::BufferSmallerThanPeriod {
                buffer: self.buffer_frames,
                period: self.period_frames,
            });
        }
        Ok(())
    }

    /// 每帧字节数（物理宽度）
    #[inline]
    pub fn bytes_per_frame(&self) -> usize {
        self.format.phys_bytes_per_sample() * self.channels as usize
    }

    /// 一个周期的样本缓冲区字节数
    #[inline]
    pub fn period_bytes(&self) -> usize {
        self.period_frames * self.bytes_per_frame()
    }
}

/// 将一个原始样本值按格式打包进容器
///
/// `res` 是生成器算出的原始整数（float 格式时是 f32 的位模式），
/// `out` 是该样本的物理容器，长度至少 phys_bytes_per_sample()。
/// 只发射 bytes_per_sample() 个字节：
/// - little-endian：LSB 起放在容器开头，padding 留在末尾
/// - big-endian：MSB 起放在容器末尾方向，padding 留在开头
pub fn pack_sample(res: i32, format: SampleFormat, out: &mut [u8]) {
    let bps = format.bytes_per_sample();
    let phys_bps = format.phys_bytes_per_sample();
    debug_assert!(out.len() >= phys_bps);

    if format.is_big_endian() {
        for i in 0..bps {
            out[phys_bps - 1 - i] = (res >> (i * 8)) as u8;
        }
    } else {
        for i in 0..bps {
            out[i] = (res >> (i * 8)) as u8;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// 按打包的逆序读回样本值（测试辅助）
    fn unpack_sample(format: SampleFormat, bytes: &[u8]) -> i32 {
        let bps = format.bytes_per_sample();
        let phys_bps = format.phys_bytes_per_sample();
        let mut res: u32 = 0;
        if format.is_big_endian() {
            for i in (0..bps).rev() {
                res |= (bytes[phys_bps - 1 - i] as u32) << (i * 8);
            }
        } else {
            for i in (0..bps).rev() {
                res |= (bytes[i] as u32) << (i * 8);
            }
        }
        res as i32
    }

    #[test]
    fn test_width_invariants() {
        // 所有格式：bytes*8 == bits，物理宽度 >= 逻辑宽度
        for &fmt in SampleFormat::all() {
            assert_eq!(fmt.bytes_per_sample() * 8, fmt.bits(), "{}", fmt);
            assert!(
                fmt.phys_bytes_per_sample() >= fmt.bytes_per_sample(),
                "{}",
                fmt
            );
            assert_eq!(fmt.phys_bytes_per_sample() * 8, fmt.phys_bits(), "{}", fmt);
        }
    }

    #[test]
    fn test_max_amplitude() {
        assert_eq!(SampleFormat::S8.max_amplitude(), 127.0);
        assert_eq!(SampleFormat::S16Le.max_amplitude(), 32767.0);
        assert_eq!(SampleFormat::S24Le.max_amplitude(), 8388607.0);
        assert_eq!(SampleFormat::S32Le.max_amplitude(), 2147483647.0);
    }

    #[test]
    fn test_pack_little_endian() {
        let mut out = [0u8; 2];
        pack_sample(0x1234, SampleFormat::S16Le, &mut out);
        assert_eq!(out, [0x34, 0x12]);
    }

    #[test]
    fn test_pack_big_endian_roundtrip() {
        // big-endian 路径打包后按相同字节数逆序读回，恢复截断后的样本值
        let values = [0i32, 1, -1, 0x1234, -0x1234, 0x7FFF, -0x8000];
        for &v in &values {
            let mut out = [0u8; 2];
            pack_sample(v, SampleFormat::S16Be, &mut out);
            let back = unpack_sample(SampleFormat::S16Be, &out) as i16 as i32;
            assert_eq!(back, v, "S16_BE roundtrip of {v}");
        }
    }

    #[test]
    fn test_pack_24bit_padding_side() {
        // 24-bit 装在 32-bit 容器：LE 时 padding 在末尾字节，BE 时在首字节
        let mut out = [0xEEu8; 4];
        pack_sample(0x123456, SampleFormat::S24Le, &mut out);
        assert_eq!(out, [0x56, 0x34, 0x12, 0xEE]);

        let mut out = [0xEEu8; 4];
        pack_sample(0x123456, SampleFormat::S24Be, &mut out);
        assert_eq!(out, [0xEE, 0x12, 0x34, 0x56]);
    }

    #[test]
    fn test_format_parse_display() {
        assert_eq!(
            "s16_le".parse::<SampleFormat>().unwrap(),
            SampleFormat::S16Le
        );
        assert_eq!(
            "FLOAT_BE".parse::<SampleFormat>().unwrap(),
            SampleFormat::FloatBe
        );
        assert!("dsd64".parse::<SampleFormat>().is_err());
        assert_eq!(SampleFormat::U24Be.to_string(), "U24_BE");
    }

    #[test]
    fn test_stream_config_validate() {
        let mut config = StreamConfig {
            format: SampleFormat::S16Le,
            channels: 2,
            rate: 44100,
            buffer_frames: 22050,
            period_frames: 4410,
        };
        assert!(config.validate().is_ok());
        assert_eq!(config.bytes_per_frame(), 4);
        assert_eq!(config.period_bytes(), 4410 * 4);

        config.buffer_frames = 100;
        assert!(matches!(
            config.validate(),
            Err(ConfigError::BufferSmallerThanPeriod { .. })
        ));

        config.buffer_frames = 22050;
        config.channels = 0;
        assert!(matches!(config.validate(), Err(ConfigError::ZeroChannels)));
    }
}
