//! Raw descriptors handed to the core for adoption.

use std::fs::File;
use std::io;
use std::net::{IpAddr, TcpStream, UdpSocket};
use std::os::fd::{AsRawFd, OwnedFd, RawFd};
use std::os::unix::net::UnixStream;

use socket2::Socket;

/// What the caller says the descriptor is. Roles claim descriptors by this tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DescriptorKind {
    /// Accepted stream socket speaking HTTP (TLS allowed when the vhost enables it).
    Http,
    /// Accepted stream socket carrying an opaque byte stream.
    RawSocket,
    /// Datagram socket.
    Udp,
    /// Already-open non-socket file descriptor (pipe, tty, regular file).
    File,
}

impl DescriptorKind {
    pub fn is_socket(self) -> bool {
        !matches!(self, DescriptorKind::File)
    }

    pub fn is_stream(self) -> bool {
        matches!(self, DescriptorKind::Http | DescriptorKind::RawSocket)
    }
}

/// An owned descriptor. Dropping it closes the fd.
#[derive(Debug)]
pub enum Descriptor {
    Socket(Socket),
    File(OwnedFd),
}

impl Descriptor {
    pub fn raw_fd(&self) -> RawFd {
        match self {
            Descriptor::Socket(s) => s.as_raw_fd(),
            Descriptor::File(f) => f.as_raw_fd(),
        }
    }

    /// Remote IP of a connected inet socket; `None` for files, unix sockets and
    /// unconnected datagram sockets.
    pub fn peer_ip(&self) -> Option<IpAddr> {
        match self {
            Descriptor::Socket(s) => s.peer_addr().ok()?.as_socket().map(|a| a.ip()),
            Descriptor::File(_) => None,
        }
    }

    pub(crate) fn set_nonblocking(&self) -> io::Result<()> {
        match self {
            Descriptor::Socket(s) => s.set_nonblocking(true),
            Descriptor::File(f) => set_fd_nonblocking(f.as_raw_fd()),
        }
    }

    /// One non-blocking read. `WouldBlock` means nothing is pending.
    pub fn read(&self, buf: &mut [u8]) -> io::Result<usize> {
        let n = unsafe {
            libc::read(
                self.raw_fd(),
                buf.as_mut_ptr() as *mut libc::c_void,
                buf.len(),
            )
        };
        if n < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(n as usize)
    }

    /// One non-blocking write; returns how much the kernel accepted.
    pub fn write(&self, buf: &[u8]) -> io::Result<usize> {
        let n = unsafe {
            libc::write(
                self.raw_fd(),
                buf.as_ptr() as *const libc::c_void,
                buf.len(),
            )
        };
        if n < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(n as usize)
    }
}

fn set_fd_nonblocking(fd: RawFd) -> io::Result<()> {
    let flags = unsafe { libc::fcntl(fd, libc::F_GETFL) };
    if flags < 0 {
        return Err(io::Error::last_os_error());
    }
    if flags & libc::O_NONBLOCK != 0 {
        return Ok(());
    }
    if unsafe { libc::fcntl(fd, libc::F_SETFL, flags | libc::O_NONBLOCK) } < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

impl From<Socket> for Descriptor {
    fn from(socket: Socket) -> Self {
        Descriptor::Socket(socket)
    }
}

impl From<TcpStream> for Descriptor {
    fn from(stream: TcpStream) -> Self {
        Descriptor::Socket(Socket::from(stream))
    }
}

impl From<UdpSocket> for Descriptor {
    fn from(socket: UdpSocket) -> Self {
        Descriptor::Socket(Socket::from(socket))
    }
}

impl From<UnixStream> for Descriptor {
    fn from(stream: UnixStream) -> Self {
        Descriptor::Socket(Socket::from(OwnedFd::from(stream)))
    }
}

impl From<File> for Descriptor {
    fn from(file: File) -> Self {
        Descriptor::File(OwnedFd::from(file))
    }
}
