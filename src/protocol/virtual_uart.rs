#[cfg(unix)]
use std::ffi::CStr;
#[cfg(unix)]
use std::io;
#[cfg(unix)]
use std::os::unix::io::RawFd;

#[cfg(unix)]
use crate::protocol::port_handler::PortHandler;

/// The master side of a PTY pair. Anything that opens the slave path and
/// speaks the protocol (an external simulator, a test script) looks exactly
/// like a device chain on a serial line.
#[cfg(unix)]
#[derive(Debug)]
pub struct VirtualUartPort {
    master_fd: RawFd,
    slave_path: String,
}

#[cfg(unix)]
impl VirtualUartPort {
    pub fn new() -> io::Result<VirtualUartPort> {
        unsafe {
            let fd = libc::posix_openpt(libc::O_RDWR | libc::O_NOCTTY);
            if fd < 0 {
                return Err(io::Error::last_os_error());
            }
            if libc::grantpt(fd) != 0 {
                let err = io::Error::last_os_error();
                libc::close(fd);
                return Err(err);
            }
            if libc::unlockpt(fd) != 0 {
                let err = io::Error::last_os_error();
                libc::close(fd);
                return Err(err);
            }

            let name_ptr = libc::ptsname(fd);
            if name_ptr.is_null() {
                let err = io::Error::last_os_error();
                libc::close(fd);
                return Err(err);
            }

            let cstr = CStr::from_ptr(name_ptr);
            let slave_path = cstr.to_string_lossy().into_owned();

            let flags = libc::fcntl(fd, libc::F_GETFL);
            if flags >= 0 {
                libc::fcntl(fd, libc::F_SETFL, flags | libc::O_NONBLOCK);
            }

            Ok(VirtualUartPort {
                master_fd: fd,
                slave_path,
            })
        }
    }

    pub fn slave_path(&self) -> &str {
        &self.slave_path
    }

    pub fn bytes_available(&self) -> usize {
        unsafe {
            let mut bytes: libc::c_int = 0;
            if libc::ioctl(self.master_fd, libc::FIONREAD, &mut bytes) == 0 {
                bytes as usize
            } else {
                0
            }
        }
    }
}

#[cfg(unix)]
impl Drop for VirtualUartPort {
    fn drop(&mut self) {
        unsafe {
            libc::close(self.master_fd);
        }
    }
}

#[cfg(unix)]
impl PortHandler for VirtualUartPort {
    fn read_port(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }
        let n = unsafe {
            libc::read(
                self.master_fd,
                buf.as_mut_ptr() as *mut libc::c_void,
                buf.len(),
            )
        };
        if n >= 0 {
            return Ok(n as usize);
        }
        let err = io::Error::last_os_error();
        if err.kind() == io::ErrorKind::WouldBlock {
            Ok(0)
        } else {
            Err(err)
        }
    }

    fn write_port(&mut self, data: &[u8]) -> io::Result<usize> {
        if data.is_empty() {
            return Ok(0);
        }
        let n = unsafe {
            libc::write(
                self.master_fd,
                data.as_ptr() as *const libc::c_void,
                data.len(),
            )
        };
        if n < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(n as usize)
    }
}

#[cfg(all(test, unix))]
mod tests {
    use std::fs::OpenOptions;
    use std::io::{Read, Write};
    use std::os::unix::fs::OpenOptionsExt;
    use std::os::unix::io::AsRawFd;
    use std::time::{Duration, Instant};

    use crate::protocol::port_handler::PortHandler;
    use crate::protocol::virtual_uart::VirtualUartPort;

    fn read_until_len<P: PortHandler>(port: &mut P, len: usize) -> Vec<u8> {
        let start = Instant::now();
        let mut out = vec![0u8; len];
        let mut filled = 0;
        while filled < len && start.elapsed() < Duration::from_secs(1) {
            match port.read_port(&mut out[filled..]) {
                Ok(0) => std::thread::sleep(Duration::from_millis(5)),
                Ok(n) => filled += n,
                Err(err) => panic!("read master: {err}"),
            }
        }
        out.truncate(filled);
        out
    }

    fn set_raw(fd: i32) {
        unsafe {
            let mut term: libc::termios = std::mem::zeroed();
            if libc::tcgetattr(fd, &mut term) != 0 {
                return;
            }
            libc::cfmakeraw(&mut term);
            let _ = libc::tcsetattr(fd, libc::TCSANOW, &term);
        }
    }

    #[test]
    fn virtual_uart_transfers_bytes() {
        let mut port = VirtualUartPort::new().expect("create virtual uart");
        let slave_path = port.slave_path().to_string();

        let mut slave = OpenOptions::new()
            .read(true)
            .write(true)
            .custom_flags(libc::O_NONBLOCK)
            .open(&slave_path)
            .expect("open slave");
        set_raw(slave.as_raw_fd());

        slave.write_all(b"hello").expect("write to slave");
        let read = read_until_len(&mut port, 5);
        assert_eq!(read, b"hello");

        let written = port.write_port(b"abc").expect("write to master");
        assert_eq!(written, 3);

        let mut buf = [0u8; 3];
        let start = Instant::now();
        while start.elapsed() < Duration::from_secs(1) {
            match slave.read(&mut buf) {
                Ok(0) => {
                    std::thread::sleep(Duration::from_millis(5));
                }
                Ok(n) => {
                    assert_eq!(&buf[..n], b"abc");
                    return;
                }
                Err(err) if err.kind() == std::io::ErrorKind::WouldBlock => {
                    std::thread::sleep(Duration::from_millis(5));
                }
                Err(err) => panic!("read slave: {err}"),
            }
        }

        panic!("timed out reading from slave");
    }
}
