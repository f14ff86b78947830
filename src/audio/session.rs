//! 设备会话状态机
//!
//! 生命周期：Configured → Prepared → Running ⇄ Underrun ⇄ Suspended，
//! 任意状态遇到不可恢复错误进入 Fatal。
//!
//! 恢复策略（对传输循环之上完全不可见）：
//! - Underrun: 重新 prepare，回到 Prepared，静默续流
//! - Suspended: 以 1 秒退避轮询 resume 直到成功，再 prepare 回到 Prepared
//! - 其余负值结果：Fatal，由上层记录因果码后终止

use std::time::Duration;

use super::device::{DeviceError, DeviceStatus, PcmDevice, ReadyEvents};
use super::format::StreamConfig;

/// 挂起恢复的轮询退避
const RESUME_BACKOFF: Duration = Duration::from_secs(1);

/// 会话状态
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// 协商完成，尚未 prepare
    Configured,
    /// 设备可写，尚未观察到运行
    Prepared,
    /// 首次写入成功后观察到的运行态
    Running,
    /// 不可恢复，会话作废
    Fatal,
}

/// 设备会话
///
/// 持有设备句柄与显式状态，传输循环及其协作者通过引用传递本对象，
/// 不存在进程级全局。backoff 可注入，生产默认 thread::sleep。
pub struct Session {
    device: Box<dyn PcmDevice>,
    state: SessionState,
    backoff: Box<dyn FnMut(Duration)>,
}

impl Session {
    pub fn new(device: Box<dyn PcmDevice>) -> Self {
        Self {
            device,
            state: SessionState::Configured,
            backoff: Box::new(std::thread::sleep),
        }
    }

    /// 替换退避等待（测试用：计数代替真实睡眠）
    pub fn with_backoff(mut self, backoff: Box<dyn FnMut(Duration)>) -> Self {
        self.backoff = backoff;
        self
    }

    #[inline]
    pub fn state(&self) -> SessionState {
        self.state
    }

    #[inline]
    pub fn config(&self) -> StreamConfig {
        *self.device.config()
    }

    /// Configured → Prepared
    ///
    /// 这里失败说明配置本身不合法：标记 Fatal，不做重试
    pub fn prepare(&mut self) -> Result<(), DeviceError> {
        match self.device.prepare() {
            Ok(()) => {
                self.state = SessionState::Prepared;
                Ok(())
            }
            Err(e) => {
                self.state = SessionState::Fatal;
                Err(e)
            }
        }
    }

    /// 写入至多 frames 帧；成功后观察设备是否已进入运行态
    pub fn write(&mut self, buf: &[u8], frames: usize) -> Result<usize, DeviceError> {
        let written = self.device.write(buf, frames)?;
        if self.state != SessionState::Running && self.device.status() == DeviceStatus::Running {
            log::debug!("stream entered running state");
            self.state = SessionState::Running;
        }
        Ok(written)
    }

    pub fn poll_descriptors(&mut self) -> Result<Vec<libc::pollfd>, DeviceError> {
        self.device.poll_descriptors()
    }

    pub fn translate_ready_events(
        &mut self,
        fds: &mut [libc::pollfd],
    ) -> Result<ReadyEvents, DeviceError> {
        self.device.translate_ready_events(fds)
    }

    pub fn status(&mut self) -> DeviceStatus {
        self.device.status()
    }

    pub fn drain(&mut self) -> Result<(), DeviceError> {
        self.device.drain()
    }

    /// 故障恢复入口
    ///
    /// Ok(()) 表示已恢复（回到 Prepared）；Err 表示不可恢复，
    /// 会话进入 Fatal，调用方记录因果码并终止
    pub fn recover(&mut self, err: &DeviceError) -> Result<(), DeviceError> {
        match err {
            DeviceError::Underrun => {
                log::info!("underrun, re-preparing stream");
                self.reprepare("underrun")
            }
            DeviceError::Suspended => {
                log::info!("device suspended, polling resume");
                self.resume_from_suspend()?;
                self.reprepare("suspend")
            }
            DeviceError::Other(code) => {
                log::error!("unrecoverable device error: {code}");
                self.state = SessionState::Fatal;
                Err(err.clone())
            }
        }
    }

    fn reprepare(&mut self, cause: &str) -> Result<(), DeviceError> {
        match self.device.prepare() {
            Ok(()) => {
                self.state = SessionState::Prepared;
                Ok(())
            }
            Err(e) => {
                log::error!("can't recover from {cause}, prepare failed: {e}");
                self.state = SessionState::Fatal;
                Err(e)
            }
        }
    }

    /// 轮询 resume：EAGAIN 表示挂起尚未解除，退避后重试；
    /// 其他错误按不可恢复处理
    fn resume_from_suspend(&mut self) -> Result<(), DeviceError> {
        loop {
            match self.device.resume() {
                Ok(()) => return Ok(()),
                Err(DeviceError::Other(code)) if code.is_try_again() => {
                    (self.backoff)(RESUME_BACKOFF);
                }
                Err(e) => {
                    log::error!("can't recover from suspend, resume failed: {e}");
                    self.state = SessionState::Fatal;
                    return Err(e);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::device::DeviceCode;
    use crate::audio::format::SampleFormat;
    use std::cell::RefCell;
    use std::collections::VecDeque;
    use std::rc::Rc;

    #[derive(Default)]
    struct Calls {
        prepare: usize,
        resume: usize,
    }

    /// 按脚本返回结果的测试设备
    struct ScriptedDevice {
        config: StreamConfig,
        resume_script: VecDeque<Result<(), DeviceError>>,
        prepare_script: VecDeque<Result<(), DeviceError>>,
        status: DeviceStatus,
        calls: Rc<RefCell<Calls>>,
    }

    impl ScriptedDevice {
        fn new(calls: Rc<RefCell<Calls>>) -> Self {
            Self {
                config: StreamConfig {
                    format: SampleFormat::S16Le,
                    channels: 1,
                    rate: 44100,
                    buffer_frames: 22050,
                    period_frames: 4410,
                },
                resume_script: VecDeque::new(),
                prepare_script: VecDeque::new(),
                status: DeviceStatus::Setup,
                calls,
            }
        }
    }

    impl PcmDevice for ScriptedDevice {
        fn config(&self) -> &StreamConfig {
            &self.config
        }

        fn prepare(&mut self) -> Result<(), DeviceError> {
            self.calls.borrow_mut().prepare += 1;
            self.prepare_script.pop_front().unwrap_or(Ok(()))
        }

        fn write(&mut self, _buf: &[u8], frames: usize) -> Result<usize, DeviceError> {
            self.status = DeviceStatus::Running;
            Ok(frames)
        }

        fn poll_descriptors(&mut self) -> Result<Vec<libc::pollfd>, DeviceError> {
            Ok(vec![])
        }

        fn translate_ready_events(
            &mut self,
            _fds: &mut [libc::pollfd],
        ) -> Result<ReadyEvents, DeviceError> {
            Ok(ReadyEvents::default())
        }

        fn resume(&mut self) -> Result<(), DeviceError> {
            self.calls.borrow_mut().resume += 1;
            self.resume_script.pop_front().unwrap_or(Ok(()))
        }

        fn status(&mut self) -> DeviceStatus {
            self.status
        }
    }

    fn try_again() -> DeviceError {
        DeviceError::Other(DeviceCode::new(-libc::EAGAIN, "resume pending"))
    }

    #[test]
    fn test_underrun_recovery_reaches_prepared() {
        // 模拟 underrun + prepare 成功：回到 Prepared，绝不 Fatal
        let calls = Rc::new(RefCell::new(Calls::default()));
        let device = ScriptedDevice::new(calls.clone());
        let mut session = Session::new(Box::new(device));

        session.prepare().unwrap();
        assert!(session.recover(&DeviceError::Underrun).is_ok());
        assert_eq!(session.state(), SessionState::Prepared);
        assert_eq!(calls.borrow().prepare, 2);

        // 后续写入成功 → 观察到 Running
        let buf = vec![0u8; 8];
        session.write(&buf, 4).unwrap();
        assert_eq!(session.state(), SessionState::Running);
    }

    #[test]
    fn test_suspend_recovery_backoff_count() {
        // resume 恰好返回两次 TryAgain 再成功：恰好两次退避等待，随后 Prepared
        let calls = Rc::new(RefCell::new(Calls::default()));
        let mut device = ScriptedDevice::new(calls.clone());
        device.resume_script = VecDeque::from([Err(try_again()), Err(try_again()), Ok(())]);

        let waits = Rc::new(RefCell::new(0usize));
        let waits_in = waits.clone();
        let mut session = Session::new(Box::new(device)).with_backoff(Box::new(move |d| {
            assert_eq!(d, RESUME_BACKOFF);
            *waits_in.borrow_mut() += 1;
        }));

        assert!(session.recover(&DeviceError::Suspended).is_ok());
        assert_eq!(*waits.borrow(), 2);
        assert_eq!(calls.borrow().resume, 3);
        assert_eq!(session.state(), SessionState::Prepared);
    }

    #[test]
    fn test_resume_hard_failure_is_fatal() {
        let calls = Rc::new(RefCell::new(Calls::default()));
        let mut device = ScriptedDevice::new(calls.clone());
        device.resume_script =
            VecDeque::from([Err(DeviceError::Other(DeviceCode::new(-libc::EIO, "io")))]);

        let mut session = Session::new(Box::new(device));
        assert!(session.recover(&DeviceError::Suspended).is_err());
        assert_eq!(session.state(), SessionState::Fatal);
    }

    #[test]
    fn test_other_error_is_fatal() {
        let calls = Rc::new(RefCell::new(Calls::default()));
        let device = ScriptedDevice::new(calls.clone());
        let mut session = Session::new(Box::new(device));

        let err = DeviceError::Other(DeviceCode::new(-libc::EBADFD, "bad state"));
        assert!(session.recover(&err).is_err());
        assert_eq!(session.state(), SessionState::Fatal);
        // Other 不触发 prepare
        assert_eq!(calls.borrow().prepare, 0);
    }

    #[test]
    fn test_prepare_failure_during_recovery_is_fatal() {
        let calls = Rc::new(RefCell::new(Calls::default()));
        let mut device = ScriptedDevice::new(calls.clone());
        device.prepare_script =
            VecDeque::from([Err(DeviceError::Other(DeviceCode::new(-libc::EIO, "io")))]);

        let mut session = Session::new(Box::new(device));
        assert!(session.recover(&DeviceError::Underrun).is_err());
        assert_eq!(session.state(), SessionState::Fatal);
    }
}
