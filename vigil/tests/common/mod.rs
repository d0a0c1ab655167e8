#![allow(dead_code)]

use std::net::{TcpListener, TcpStream};
use std::time::{Duration, Instant};

use vigil::{Poller, RawFd, Watch};

/// Connected loopback TCP pair, both ends non-blocking.
pub fn pair() -> (TcpStream, TcpStream) {
    let listener = TcpListener::bind("127.0.0.1:0").expect("Failed to bind listener");
    let addr = listener.local_addr().expect("Failed to get local address");

    let client = TcpStream::connect(addr).expect("Failed to connect to listener");
    let (server, _) = listener.accept().expect("Failed to accept connection");

    for stream in [&client, &server] {
        stream.set_nonblocking(true).expect("Failed to set non-blocking");
        stream.set_nodelay(true).expect("Failed to set nodelay");
    }

    (client, server)
}

#[cfg(unix)]
pub fn raw<S: std::os::fd::AsRawFd>(stream: &S) -> RawFd {
    stream.as_raw_fd()
}

#[cfg(windows)]
pub fn raw<S: std::os::windows::io::AsRawSocket>(stream: &S) -> RawFd {
    stream.as_raw_socket()
}

/// Makes closing `stream` reset the connection instead of shutting it down.
#[cfg(unix)]
pub fn set_linger_zero(stream: &TcpStream) {
    let linger = libc::linger {
        l_onoff: 1,
        l_linger: 0,
    };
    let rc = unsafe {
        libc::setsockopt(
            raw(stream),
            libc::SOL_SOCKET,
            libc::SO_LINGER,
            &linger as *const libc::linger as *const libc::c_void,
            std::mem::size_of::<libc::linger>() as libc::socklen_t,
        )
    };
    assert_eq!(rc, 0, "Failed to set SO_LINGER");
}

/// Makes closing `stream` reset the connection instead of shutting it down.
#[cfg(windows)]
pub fn set_linger_zero(stream: &TcpStream) {
    use windows_sys::Win32::Networking::WinSock::{LINGER, SO_LINGER, SOCKET, SOL_SOCKET, setsockopt};

    let linger = LINGER {
        l_onoff: 1,
        l_linger: 0,
    };
    let rc = unsafe {
        setsockopt(
            raw(stream) as SOCKET,
            SOL_SOCKET,
            SO_LINGER,
            &linger as *const LINGER as *const u8,
            std::mem::size_of::<LINGER>() as i32,
        )
    };
    assert_eq!(rc, 0, "Failed to set SO_LINGER");
}

/// Waits until `token` is reported, gathering the flags of every report.
///
/// Returns `None` if nothing for `token` shows up within `timeout`.
pub fn wait_for(poller: &mut Poller, token: u64, timeout: Duration) -> Option<Watch> {
    let deadline = Instant::now() + timeout;
    let mut events = [Watch::default(); 16];

    loop {
        let left = deadline.saturating_duration_since(Instant::now());
        let n = poller
            .wait_timeout(&mut events, Some(left))
            .expect("Failed to wait");

        if let Some(watch) = events[..n].iter().find(|w| w.token == token) {
            return Some(*watch);
        }
        if Instant::now() >= deadline {
            return None;
        }
    }
}
