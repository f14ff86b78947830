//! 就绪协调器
//!
//! 用 poll(2) 在设备的通知描述符上无限期阻塞，等待设备可以接收数据。
//! 原始事件掩码由设备翻译成就绪位；两者都不出现视为虚假唤醒，继续等。
//!
//! 取消：设备描述符集合里合并一个自管道（self-pipe）的读端，
//! 信号处理线程写一个字节即可唤醒阻塞中的 poll，实现干净退出。

use std::io;
use std::os::unix::io::RawFd;

use super::device::DeviceError;
use super::session::Session;

/// 等待结果
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Wait {
    /// 设备可写
    Ready,
    /// 被唤醒管道取消（外部请求关闭）
    Cancelled,
    /// 设备发出错误条件；调用方查询 DeviceStatus 并走恢复路径
    Error,
}

/// 等待本身的失败（区别于设备发出的错误条件）
#[derive(Debug, thiserror::Error)]
pub enum WaitError {
    #[error("poll failed: {0}")]
    Poll(#[from] io::Error),
    #[error("device reported no poll descriptors")]
    NoDescriptors,
    #[error(transparent)]
    Device(#[from] DeviceError),
}

/// 自管道：读端进 poll 集合，写端交给信号处理线程
///
/// 两端都是非阻塞的；Drop 时关闭
pub struct WakePipe {
    read_fd: RawFd,
    write_fd: RawFd,
}

impl WakePipe {
    pub fn new() -> io::Result<Self> {
        let mut fds = [0 as RawFd; 2];
        if unsafe { libc::pipe(fds.as_mut_ptr()) } != 0 {
            return Err(io::Error::last_os_error());
        }
        for &fd in &fds {
            set_nonblocking(fd)?;
        }
        Ok(Self {
            read_fd: fds[0],
            write_fd: fds[1],
        })
    }

    /// 唤醒句柄（dup 写端，生命周期独立于管道本体）
    pub fn wake_handle(&self) -> io::Result<WakeHandle> {
        let fd = unsafe { libc::dup(self.write_fd) };
        if fd < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(WakeHandle { fd })
    }

    /// 排空读端积压的唤醒字节
    fn drain(&self) {
        let mut buf = [0u8; 16];
        loop {
            let n = unsafe { libc::read(self.read_fd, buf.as_mut_ptr() as *mut libc::c_void, buf.len()) };
            if n <= 0 {
                break;
            }
        }
    }
}

impl Drop for WakePipe {
    fn drop(&mut self) {
        unsafe {
            libc::close(self.read_fd);
            libc::close(self.write_fd);
        }
    }
}

/// 唤醒句柄：写一个字节到管道，唤醒阻塞中的等待
pub struct WakeHandle {
    fd: RawFd,
}

impl WakeHandle {
    pub fn wake(&self) {
        let byte = 1u8;
        // 管道满时写失败无妨：已有未消费的唤醒字节在途
        unsafe {
            libc::write(self.fd, &byte as *const u8 as *const libc::c_void, 1);
        }
    }
}

impl Drop for WakeHandle {
    fn drop(&mut self) {
        unsafe {
            libc::close(self.fd);
        }
    }
}

fn set_nonblocking(fd: RawFd) -> io::Result<()> {
    unsafe {
        let flags = libc::fcntl(fd, libc::F_GETFL);
        if flags < 0 {
            return Err(io::Error::last_os_error());
        }
        if libc::fcntl(fd, libc::F_SETFL, flags | libc::O_NONBLOCK) < 0 {
            return Err(io::Error::last_os_error());
        }
    }
    Ok(())
}

/// 阻塞到设备可写、等待被取消、或设备发出错误条件
///
/// 描述符集合每次调用重新获取（恢复之后设备可能更换描述符）。
/// poll 无超时；EINTR 与虚假唤醒都重新进入等待。
pub fn wait_writable(session: &mut Session, wake: &WakePipe) -> Result<Wait, WaitError> {
    let mut fds = session.poll_descriptors()?;
    if fds.is_empty() {
        return Err(WaitError::NoDescriptors);
    }
    let device_count = fds.len();
    fds.push(libc::pollfd {
        fd: wake.read_fd,
        events: libc::POLLIN,
        revents: 0,
    });

    loop {
        for fd in fds.iter_mut() {
            fd.revents = 0;
        }
        let rc = unsafe { libc::poll(fds.as_mut_ptr(), fds.len() as libc::nfds_t, -1) };
        if rc < 0 {
            let err = io::Error::last_os_error();
            if err.raw_os_error() == Some(libc::EINTR) {
                continue;
            }
            return Err(WaitError::Poll(err));
        }

        if fds[device_count].revents & libc::POLLIN != 0 {
            wake.drain();
            return Ok(Wait::Cancelled);
        }

        let events = session.translate_ready_events(&mut fds[..device_count])?;
        if events.error {
            return Ok(Wait::Error);
        }
        if events.output_ready {
            return Ok(Wait::Ready);
        }
        // 两个终止条件都没出现：虚假唤醒，继续等
    }
}
