//! ALSA PCM 后端
//!
//! 直接对 libasound 做 FFI，不经绑定 crate。范围只覆盖核心契约：
//! 打开、硬件/软件参数协商、交织写入、poll 描述符、prepare/resume。
//!
//! 协商规则：驱动可能把采样率和缓冲尺寸调整为硬件支持的值，
//! 之后一律使用接受值（写回 StreamConfig），请求值只作起点。

use std::ffi::{c_char, c_int, c_long, c_uint, c_ulong, c_ushort, c_void, CStr, CString};
use std::ptr;

use super::device::{DeviceCode, DeviceError, DeviceStatus, PcmDevice, ReadyEvents};
use super::format::{SampleFormat, StreamConfig};

// 不透明句柄
type SndPcm = c_void;
type SndPcmHwParams = c_void;
type SndPcmSwParams = c_void;
type SndOutput = c_void;

type SndPcmSframes = c_long;
type SndPcmUframes = c_ulong;

const SND_PCM_STREAM_PLAYBACK: c_int = 0;
const SND_PCM_ACCESS_RW_INTERLEAVED: c_int = 3;

// snd_pcm_state_t
const SND_PCM_STATE_OPEN: c_int = 0;
const SND_PCM_STATE_SETUP: c_int = 1;
const SND_PCM_STATE_PREPARED: c_int = 2;
const SND_PCM_STATE_RUNNING: c_int = 3;
const SND_PCM_STATE_XRUN: c_int = 4;
const SND_PCM_STATE_DRAINING: c_int = 5;
const SND_PCM_STATE_PAUSED: c_int = 6;
const SND_PCM_STATE_SUSPENDED: c_int = 7;

// snd_pcm_format_t
const SND_PCM_FORMAT_S8: c_int = 0;
const SND_PCM_FORMAT_U8: c_int = 1;
const SND_PCM_FORMAT_S16_LE: c_int = 2;
const SND_PCM_FORMAT_S16_BE: c_int = 3;
const SND_PCM_FORMAT_U16_LE: c_int = 4;
const SND_PCM_FORMAT_U16_BE: c_int = 5;
const SND_PCM_FORMAT_S24_LE: c_int = 6;
const SND_PCM_FORMAT_S24_BE: c_int = 7;
const SND_PCM_FORMAT_U24_LE: c_int = 8;
const SND_PCM_FORMAT_U24_BE: c_int = 9;
const SND_PCM_FORMAT_S32_LE: c_int = 10;
const SND_PCM_FORMAT_S32_BE: c_int = 11;
const SND_PCM_FORMAT_U32_LE: c_int = 12;
const SND_PCM_FORMAT_U32_BE: c_int = 13;
const SND_PCM_FORMAT_FLOAT_LE: c_int = 14;
const SND_PCM_FORMAT_FLOAT_BE: c_int = 15;

#[link(name = "asound")]
extern "C" {
    fn snd_pcm_open(
        pcm: *mut *mut SndPcm,
        name: *const c_char,
        stream: c_int,
        mode: c_int,
    ) -> c_int;
    fn snd_pcm_close(pcm: *mut SndPcm) -> c_int;
    fn snd_pcm_prepare(pcm: *mut SndPcm) -> c_int;
    fn snd_pcm_resume(pcm: *mut SndPcm) -> c_int;
    fn snd_pcm_drain(pcm: *mut SndPcm) -> c_int;
    fn snd_pcm_state(pcm: *mut SndPcm) -> c_int;
    fn snd_pcm_writei(pcm: *mut SndPcm, buffer: *const c_void, size: SndPcmUframes)
        -> SndPcmSframes;

    fn snd_pcm_poll_descriptors_count(pcm: *mut SndPcm) -> c_int;
    fn snd_pcm_poll_descriptors(
        pcm: *mut SndPcm,
        pfds: *mut libc::pollfd,
        space: c_uint,
    ) -> c_int;
    fn snd_pcm_poll_descriptors_revents(
        pcm: *mut SndPcm,
        pfds: *mut libc::pollfd,
        nfds: c_uint,
        revents: *mut c_ushort,
    ) -> c_int;

    fn snd_pcm_hw_params_malloc(ptr: *mut *mut SndPcmHwParams) -> c_int;
    fn snd_pcm_hw_params_free(obj: *mut SndPcmHwParams);
    fn snd_pcm_hw_params_any(pcm: *mut SndPcm, params: *mut SndPcmHwParams) -> c_int;
    fn snd_pcm_hw_params_set_rate_resample(
        pcm: *mut SndPcm,
        params: *mut SndPcmHwParams,
        val: c_uint,
    ) -> c_int;
    fn snd_pcm_hw_params_set_access(
        pcm: *mut SndPcm,
        params: *mut SndPcmHwParams,
        access: c_int,
    ) -> c_int;
    fn snd_pcm_hw_params_set_format(
        pcm: *mut SndPcm,
        params: *mut SndPcmHwParams,
        format: c_int,
    ) -> c_int;
    fn snd_pcm_hw_params_set_channels(
        pcm: *mut SndPcm,
        params: *mut SndPcmHwParams,
        val: c_uint,
    ) -> c_int;
    fn snd_pcm_hw_params_set_rate_near(
        pcm: *mut SndPcm,
        params: *mut SndPcmHwParams,
        val: *mut c_uint,
        dir: *mut c_int,
    ) -> c_int;
    fn snd_pcm_hw_params_set_buffer_time_near(
        pcm: *mut SndPcm,
        params: *mut SndPcmHwParams,
        val: *mut c_uint,
        dir: *mut c_int,
    ) -> c_int;
    fn snd_pcm_hw_params_get_buffer_size(
        params: *const SndPcmHwParams,
        val: *mut SndPcmUframes,
    ) -> c_int;
    fn snd_pcm_hw_params_set_period_time_near(
        pcm: *mut SndPcm,
        params: *mut SndPcmHwParams,
        val: *mut c_uint,
        dir: *mut c_int,
    ) -> c_int;
    fn snd_pcm_hw_params_get_period_size(
        params: *const SndPcmHwParams,
        val: *mut SndPcmUframes,
        dir: *mut c_int,
    ) -> c_int;
    fn snd_pcm_hw_params(pcm: *mut SndPcm, params: *mut SndPcmHwParams) -> c_int;

    fn snd_pcm_sw_params_malloc(ptr: *mut *mut SndPcmSwParams) -> c_int;
    fn snd_pcm_sw_params_free(obj: *mut SndPcmSwParams);
    fn snd_pcm_sw_params_current(pcm: *mut SndPcm, params: *mut SndPcmSwParams) -> c_int;
    fn snd_pcm_sw_params_set_start_threshold(
        pcm: *mut SndPcm,
        params: *mut SndPcmSwParams,
        val: SndPcmUframes,
    ) -> c_int;
    fn snd_pcm_sw_params_set_avail_min(
        pcm: *mut SndPcm,
        params: *mut SndPcmSwParams,
        val: SndPcmUframes,
    ) -> c_int;
    fn snd_pcm_sw_params_set_period_event(
        pcm: *mut SndPcm,
        params: *mut SndPcmSwParams,
        val: c_int,
    ) -> c_int;
    fn snd_pcm_sw_params(pcm: *mut SndPcm, params: *mut SndPcmSwParams) -> c_int;

    fn snd_pcm_dump(pcm: *mut SndPcm, out: *mut SndOutput) -> c_int;
    fn snd_output_buffer_open(outputp: *mut *mut SndOutput) -> c_int;
    fn snd_output_buffer_string(output: *mut SndOutput, buf: *mut *mut c_char) -> usize;
    fn snd_output_close(output: *mut SndOutput) -> c_int;

    fn snd_strerror(errnum: c_int) -> *const c_char;
}

/// libasound 的错误文本
fn strerror(code: c_int) -> String {
    unsafe {
        let ptr = snd_strerror(code);
        if ptr.is_null() {
            format!("error {code}")
        } else {
            CStr::from_ptr(ptr).to_string_lossy().into_owned()
        }
    }
}

/// 打开/协商阶段错误（流启动前，一律致命）
#[derive(Debug, thiserror::Error)]
pub enum AlsaError {
    #[error("playback open error on {device}: {msg}")]
    Open { device: String, msg: String },
    #[error("{stage} failed: {msg}")]
    Negotiate { stage: &'static str, msg: String },
    #[error("rate doesn't match (requested {requested}Hz, got {got}Hz)")]
    RateMismatch { requested: u32, got: u32 },
    #[error("invalid device name: {0}")]
    BadName(String),
}

/// 请求参数（协商起点）
#[derive(Clone, Debug)]
pub struct AlsaConfig {
    pub device: String,
    pub format: SampleFormat,
    pub channels: u16,
    pub rate: u32,
    /// 设备环形缓冲区时长（微秒）
    pub buffer_time_us: u32,
    /// 周期时长（微秒）
    pub period_time_us: u32,
    /// 允许驱动端重采样
    pub resample: bool,
    /// 每周期产生一次 poll 事件（中断风格）
    pub period_event: bool,
    /// 协商完成后 dump 一份 PCM 设置到日志
    pub dump_setup: bool,
}

impl Default for AlsaConfig {
    fn default() -> Self {
        Self {
            device: "plughw:0,0".to_string(),
            format: SampleFormat::S16Le,
            channels: 1,
            rate: 44100,
            buffer_time_us: 500_000,
            period_time_us: 100_000,
            resample: true,
            period_event: false,
            dump_setup: false,
        }
    }
}

fn to_alsa_format(format: SampleFormat) -> c_int {
    match format {
        SampleFormat::S8 => SND_PCM_FORMAT_S8,
        SampleFormat::U8 => SND_PCM_FORMAT_U8,
        SampleFormat::S16Le => SND_PCM_FORMAT_S16_LE,
        SampleFormat::S16Be => SND_PCM_FORMAT_S16_BE,
        SampleFormat::U16Le => SND_PCM_FORMAT_U16_LE,
        SampleFormat::U16Be => SND_PCM_FORMAT_U16_BE,
        SampleFormat::S24Le => SND_PCM_FORMAT_S24_LE,
        SampleFormat::S24Be => SND_PCM_FORMAT_S24_BE,
        SampleFormat::U24Le => SND_PCM_FORMAT_U24_LE,
        SampleFormat::U24Be => SND_PCM_FORMAT_U24_BE,
        SampleFormat::S32Le => SND_PCM_FORMAT_S32_LE,
        SampleFormat::S32Be => SND_PCM_FORMAT_S32_BE,
        SampleFormat::U32Le => SND_PCM_FORMAT_U32_LE,
        SampleFormat::U32Be => SND_PCM_FORMAT_U32_BE,
        SampleFormat::FloatLe => SND_PCM_FORMAT_FLOAT_LE,
        SampleFormat::FloatBe => SND_PCM_FORMAT_FLOAT_BE,
    }
}

/// hw params 的 RAII 守卫
struct HwParams(*mut SndPcmHwParams);

impl HwParams {
    fn alloc() -> Result<Self, AlsaError> {
        let mut ptr = ptr::null_mut();
        let err = unsafe { snd_pcm_hw_params_malloc(&mut ptr) };
        if err < 0 {
            return Err(AlsaError::Negotiate {
                stage: "hw params alloc",
                msg: strerror(err),
            });
        }
        Ok(Self(ptr))
    }
}

impl Drop for HwParams {
    fn drop(&mut self) {
        unsafe { snd_pcm_hw_params_free(self.0) };
    }
}

/// sw params 的 RAII 守卫
struct SwParams(*mut SndPcmSwParams);

impl SwParams {
    fn alloc() -> Result<Self, AlsaError> {
        let mut ptr = ptr::null_mut();
        let err = unsafe { snd_pcm_sw_params_malloc(&mut ptr) };
        if err < 0 {
            return Err(AlsaError::Negotiate {
                stage: "sw params alloc",
                msg: strerror(err),
            });
        }
        Ok(Self(ptr))
    }
}

impl Drop for SwParams {
    fn drop(&mut self) {
        unsafe { snd_pcm_sw_params_free(self.0) };
    }
}

/// 协商完成的 ALSA 播放设备
pub struct AlsaDevice {
    pcm: *mut SndPcm,
    config: StreamConfig,
}

impl AlsaDevice {
    /// 打开设备并执行完整参数协商
    pub fn open(req: &AlsaConfig) -> Result<Self, AlsaError> {
        let name = CString::new(req.device.as_str())
            .map_err(|_| AlsaError::BadName(req.device.clone()))?;

        let mut pcm: *mut SndPcm = ptr::null_mut();
        let err = unsafe { snd_pcm_open(&mut pcm, name.as_ptr(), SND_PCM_STREAM_PLAYBACK, 0) };
        if err < 0 {
            return Err(AlsaError::Open {
                device: req.device.clone(),
                msg: strerror(err),
            });
        }

        let mut device = Self {
            pcm,
            config: StreamConfig {
                format: req.format,
                channels: req.channels,
                rate: req.rate,
                buffer_frames: 0,
                period_frames: 0,
            },
        };

        device.set_hw_params(req)?;
        device.set_sw_params(req)?;

        log::info!(
            "negotiated: {} {}ch {}Hz, buffer {} frames, period {} frames",
            device.config.format,
            device.config.channels,
            device.config.rate,
            device.config.buffer_frames,
            device.config.period_frames
        );

        if req.dump_setup {
            device.dump_setup();
        }
        Ok(device)
    }

    fn negotiate_err(stage: &'static str, err: c_int) -> AlsaError {
        AlsaError::Negotiate {
            stage,
            msg: strerror(err),
        }
    }

    /// 硬件参数：访问方式/格式/通道/速率/缓冲与周期时长
    ///
    /// 速率与尺寸用 *_near 变体：驱动可调整，事后读回接受值
    fn set_hw_params(&mut self, req: &AlsaConfig) -> Result<(), AlsaError> {
        let params = HwParams::alloc()?;
        let pcm = self.pcm;
        unsafe {
            let err = snd_pcm_hw_params_any(pcm, params.0);
            if err < 0 {
                return Err(Self::negotiate_err("no configurations available", err));
            }
            let err = snd_pcm_hw_params_set_rate_resample(pcm, params.0, req.resample as c_uint);
            if err < 0 {
                return Err(Self::negotiate_err("resampling setup", err));
            }
            let err = snd_pcm_hw_params_set_access(pcm, params.0, SND_PCM_ACCESS_RW_INTERLEAVED);
            if err < 0 {
                return Err(Self::negotiate_err("access type", err));
            }
            let err = snd_pcm_hw_params_set_format(pcm, params.0, to_alsa_format(req.format));
            if err < 0 {
                return Err(Self::negotiate_err("sample format", err));
            }
            let err = snd_pcm_hw_params_set_channels(pcm, params.0, req.channels as c_uint);
            if err < 0 {
                return Err(Self::negotiate_err("channels count", err));
            }

            let mut rrate: c_uint = req.rate;
            let err = snd_pcm_hw_params_set_rate_near(pcm, params.0, &mut rrate, ptr::null_mut());
            if err < 0 {
                return Err(Self::negotiate_err("stream rate", err));
            }
            if rrate != req.rate {
                return Err(AlsaError::RateMismatch {
                    requested: req.rate,
                    got: rrate,
                });
            }

            let mut dir: c_int = 0;
            let mut buffer_time: c_uint = req.buffer_time_us;
            let err =
                snd_pcm_hw_params_set_buffer_time_near(pcm, params.0, &mut buffer_time, &mut dir);
            if err < 0 {
                return Err(Self::negotiate_err("buffer time", err));
            }
            let mut buffer_size: SndPcmUframes = 0;
            let err = snd_pcm_hw_params_get_buffer_size(params.0, &mut buffer_size);
            if err < 0 {
                return Err(Self::negotiate_err("buffer size", err));
            }

            let mut period_time: c_uint = req.period_time_us;
            let err =
                snd_pcm_hw_params_set_period_time_near(pcm, params.0, &mut period_time, &mut dir);
            if err < 0 {
                return Err(Self::negotiate_err("period time", err));
            }
            let mut period_size: SndPcmUframes = 0;
            let err = snd_pcm_hw_params_get_period_size(params.0, &mut period_size, &mut dir);
            if err < 0 {
                return Err(Self::negotiate_err("period size", err));
            }

            let err = snd_pcm_hw_params(pcm, params.0);
            if err < 0 {
                return Err(Self::negotiate_err("hw params commit", err));
            }

            self.config.rate = rrate;
            self.config.buffer_frames = buffer_size as usize;
            self.config.period_frames = period_size as usize;
        }
        Ok(())
    }

    /// 软件参数：启动阈值与可写水位
    ///
    /// 启动阈值 = 缓冲区向下取整到整周期：快满时才起播。
    /// avail_min = 周期大小；period_event 模式下改为整个缓冲区，
    /// 由周期事件代替水位机制。
    fn set_sw_params(&mut self, req: &AlsaConfig) -> Result<(), AlsaError> {
        let params = SwParams::alloc()?;
        let pcm = self.pcm;
        let buffer = self.config.buffer_frames as SndPcmUframes;
        let period = self.config.period_frames as SndPcmUframes;
        unsafe {
            let err = snd_pcm_sw_params_current(pcm, params.0);
            if err < 0 {
                return Err(Self::negotiate_err("current sw params", err));
            }
            let start = (buffer / period) * period;
            let err = snd_pcm_sw_params_set_start_threshold(pcm, params.0, start);
            if err < 0 {
                return Err(Self::negotiate_err("start threshold", err));
            }
            let avail_min = if req.period_event { buffer } else { period };
            let err = snd_pcm_sw_params_set_avail_min(pcm, params.0, avail_min);
            if err < 0 {
                return Err(Self::negotiate_err("avail min", err));
            }
            if req.period_event {
                let err = snd_pcm_sw_params_set_period_event(pcm, params.0, 1);
                if err < 0 {
                    return Err(Self::negotiate_err("period event", err));
                }
            }
            let err = snd_pcm_sw_params(pcm, params.0);
            if err < 0 {
                return Err(Self::negotiate_err("sw params commit", err));
            }
        }
        Ok(())
    }

    /// 把协商结果 dump 到日志（verbose 用）
    fn dump_setup(&self) {
        unsafe {
            let mut out: *mut SndOutput = ptr::null_mut();
            if snd_output_buffer_open(&mut out) < 0 {
                return;
            }
            snd_pcm_dump(self.pcm, out);
            let mut buf: *mut c_char = ptr::null_mut();
            let len = snd_output_buffer_string(out, &mut buf);
            if !buf.is_null() && len > 0 {
                let bytes = std::slice::from_raw_parts(buf as *const u8, len);
                for line in String::from_utf8_lossy(bytes).lines() {
                    log::info!("pcm dump: {line}");
                }
            }
            snd_output_close(out);
        }
    }

    fn map_io_error(err: c_int, what: &'static str) -> DeviceError {
        if err == -libc::EPIPE {
            DeviceError::Underrun
        } else if err == -libc::ESTRPIPE {
            DeviceError::Suspended
        } else {
            DeviceError::Other(DeviceCode::new(err, what))
        }
    }

    fn map_resume_error(err: c_int) -> DeviceError {
        if err == -libc::EAGAIN {
            DeviceError::Other(DeviceCode::new(err, "resume pending"))
        } else {
            Self::map_io_error(err, "resume failed")
        }
    }
}

impl PcmDevice for AlsaDevice {
    fn config(&self) -> &StreamConfig {
        &self.config
    }

    fn prepare(&mut self) -> Result<(), DeviceError> {
        let err = unsafe { snd_pcm_prepare(self.pcm) };
        if err < 0 {
            return Err(DeviceError::Other(DeviceCode::new(err, "prepare failed")));
        }
        Ok(())
    }

    fn write(&mut self, buf: &[u8], frames: usize) -> Result<usize, DeviceError> {
        debug_assert!(buf.len() >= frames * self.config.bytes_per_frame());
        let written = unsafe {
            snd_pcm_writei(self.pcm, buf.as_ptr() as *const c_void, frames as SndPcmUframes)
        };
        if written < 0 {
            return Err(Self::map_io_error(written as c_int, "write failed"));
        }
        Ok(written as usize)
    }

    fn poll_descriptors(&mut self) -> Result<Vec<libc::pollfd>, DeviceError> {
        let count = unsafe { snd_pcm_poll_descriptors_count(self.pcm) };
        if count <= 0 {
            return Err(DeviceError::Other(DeviceCode::new(
                count,
                "invalid poll descriptors count",
            )));
        }
        let mut fds = vec![
            libc::pollfd {
                fd: -1,
                events: 0,
                revents: 0,
            };
            count as usize
        ];
        let filled =
            unsafe { snd_pcm_poll_descriptors(self.pcm, fds.as_mut_ptr(), count as c_uint) };
        if filled < 0 {
            return Err(DeviceError::Other(DeviceCode::new(
                filled,
                "unable to obtain poll descriptors",
            )));
        }
        fds.truncate(filled as usize);
        Ok(fds)
    }

    fn translate_ready_events(
        &mut self,
        fds: &mut [libc::pollfd],
    ) -> Result<ReadyEvents, DeviceError> {
        let mut revents: c_ushort = 0;
        let err = unsafe {
            snd_pcm_poll_descriptors_revents(
                self.pcm,
                fds.as_mut_ptr(),
                fds.len() as c_uint,
                &mut revents,
            )
        };
        if err < 0 {
            return Err(Self::map_io_error(err, "revents translation failed"));
        }
        let revents = revents as c_int;
        Ok(ReadyEvents {
            error: revents & libc::POLLERR as c_int != 0,
            output_ready: revents & libc::POLLOUT as c_int != 0,
        })
    }

    fn resume(&mut self) -> Result<(), DeviceError> {
        let err = unsafe { snd_pcm_resume(self.pcm) };
        if err < 0 {
            // -EAGAIN: 挂起尚未解除，调用方退避后重试
            return Err(Self::map_resume_error(err));
        }
        Ok(())
    }

    fn status(&mut self) -> DeviceStatus {
        match unsafe { snd_pcm_state(self.pcm) } {
            SND_PCM_STATE_OPEN | SND_PCM_STATE_SETUP | SND_PCM_STATE_PREPARED => DeviceStatus::Setup,
            SND_PCM_STATE_RUNNING | SND_PCM_STATE_DRAINING | SND_PCM_STATE_PAUSED => {
                DeviceStatus::Running
            }
            SND_PCM_STATE_XRUN => DeviceStatus::Underrun,
            SND_PCM_STATE_SUSPENDED => DeviceStatus::Suspended,
            _ => DeviceStatus::Fatal,
        }
    }

    fn drain(&mut self) -> Result<(), DeviceError> {
        let err = unsafe { snd_pcm_drain(self.pcm) };
        if err < 0 {
            return Err(DeviceError::Other(DeviceCode::new(err, "drain failed")));
        }
        Ok(())
    }
}

impl Drop for AlsaDevice {
    fn drop(&mut self) {
        unsafe {
            snd_pcm_close(self.pcm);
        }
    }
}
