//! Windows poller built on the AFD driver.
//!
//! Windows has no readiness API for sockets that scales, so `epoll` is
//! emulated with the AFD driver behind WinSock:
//! - [`afd`]: raw driver primitives (device and completion port, one
//!   asynchronous poll request per socket, cancellation, flag translation,
//!   base socket resolution),
//! - [`sock`]: the per-socket state machine tracking the in-flight request,
//! - [`port`]: the poll set, which batches re-arming and turns completions
//!   back into readiness reports.

mod afd;
mod port;
mod sock;

pub(crate) use port::IocpPoller;

use std::io;
use std::mem;
use std::sync::OnceLock;

use windows_sys::Win32::Foundation::{
    ERROR_ALREADY_EXISTS, ERROR_INVALID_HANDLE, ERROR_INVALID_PARAMETER, ERROR_NOT_FOUND,
};
use windows_sys::Win32::Networking::WinSock::{WSADATA, WSAStartup};

/// Raw descriptor type on Windows: a WinSock `SOCKET`.
pub type RawFd = std::os::windows::io::RawSocket;

/// Creates a MAKEWORD value for Winsock version.
#[inline]
const fn makeword(low: u8, high: u8) -> u16 {
    ((high as u16) << 8) | (low as u16)
}

/// Result of the one-time `WSAStartup` call.
static WINSOCK_INIT: OnceLock<i32> = OnceLock::new();

/// Initialize Winsock if not already initialized.
///
/// `WSAIoctl` refuses to run before `WSAStartup`, even on sockets created
/// by another component of the process. A failed startup is reported on
/// every call, not only the first.
pub(crate) fn ensure_winsock() -> io::Result<()> {
    let rc = *WINSOCK_INIT.get_or_init(|| unsafe {
        let mut data: WSADATA = mem::zeroed();
        WSAStartup(makeword(2, 2), &mut data as *mut _)
    });

    if rc != 0 {
        Err(io::Error::from_raw_os_error(rc))
    } else {
        Ok(())
    }
}

pub(crate) fn already_exists() -> io::Error {
    io::Error::from_raw_os_error(ERROR_ALREADY_EXISTS as i32)
}

pub(crate) fn not_found() -> io::Error {
    io::Error::from_raw_os_error(ERROR_NOT_FOUND as i32)
}

pub(crate) fn invalid_handle() -> io::Error {
    io::Error::from_raw_os_error(ERROR_INVALID_HANDLE as i32)
}

pub(crate) fn invalid_parameter() -> io::Error {
    io::Error::from_raw_os_error(ERROR_INVALID_PARAMETER as i32)
}
