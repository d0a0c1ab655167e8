//! Raw AFD driver primitives.
//!
//! The ancillary function driver behind WinSock (`\Device\Afd`) accepts an
//! undocumented `IOCTL_AFD_POLL` request: "complete when this socket reaches
//! one of these conditions". Issued asynchronously on a device handle bound
//! to a completion port, it is the only scalable readiness primitive the
//! platform offers for sockets.

use super::{ensure_winsock, invalid_handle};
use crate::event::Readiness;

use std::ffi::c_void;
use std::os::windows::io::RawSocket;
use std::ptr::{self, NonNull};
use std::sync::OnceLock;
use std::{fmt, io, mem};

use log::{debug, trace};
use windows_sys::Win32::Foundation::{
    CloseHandle, GetLastError, HANDLE, INVALID_HANDLE_VALUE, NTSTATUS, STATUS_CANCELLED,
    STATUS_NOT_FOUND, STATUS_PENDING, STATUS_SUCCESS, WAIT_TIMEOUT,
};
use windows_sys::Win32::Networking::WinSock::{
    INVALID_SOCKET, SIO_BASE_HANDLE, SIO_BSP_HANDLE_POLL, SOCKET, SOCKET_ERROR, WSAENOTSOCK,
    WSAGetLastError, WSAIoctl,
};
use windows_sys::Win32::Storage::FileSystem::{
    FILE_SHARE_READ, FILE_SHARE_WRITE, SetFileCompletionNotificationModes,
};
use windows_sys::Win32::System::IO::{
    CreateIoCompletionPort, GetQueuedCompletionStatusEx, OVERLAPPED, OVERLAPPED_ENTRY,
};
use windows_sys::Win32::System::LibraryLoader::{GetModuleHandleA, GetProcAddress};

pub(crate) const AFD_POLL_RECEIVE: u32 = 0x0001;
pub(crate) const AFD_POLL_RECEIVE_EXPEDITED: u32 = 0x0002;
pub(crate) const AFD_POLL_SEND: u32 = 0x0004;
pub(crate) const AFD_POLL_DISCONNECT: u32 = 0x0008;
pub(crate) const AFD_POLL_ABORT: u32 = 0x0010;
pub(crate) const AFD_POLL_LOCAL_CLOSE: u32 = 0x0020;
pub(crate) const AFD_POLL_ACCEPT: u32 = 0x0080;
pub(crate) const AFD_POLL_CONNECT_FAIL: u32 = 0x0100;

const IOCTL_AFD_POLL: u32 = 0x0001_2024;

const SYNCHRONIZE: u32 = 0x0010_0000;
const FILE_OPEN: u32 = 0x0000_0001;
const FILE_SKIP_SET_EVENT_ON_HANDLE: u8 = 0x2;

/// Device path; the trailing component is free-form.
const AFD_DEVICE: &str = "\\Device\\Afd\\Vigil";

#[repr(C)]
#[derive(Clone, Copy)]
union IoStatus {
    status: NTSTATUS,
    pointer: *mut c_void,
}

#[repr(C)]
#[derive(Clone, Copy)]
struct IoStatusBlock {
    u: IoStatus,
    information: usize,
}

#[repr(C)]
struct UnicodeString {
    length: u16,
    maximum_length: u16,
    buffer: *mut u16,
}

#[repr(C)]
struct ObjectAttributes {
    length: u32,
    root_directory: HANDLE,
    object_name: *mut UnicodeString,
    attributes: u32,
    security_descriptor: *mut c_void,
    security_quality_of_service: *mut c_void,
}

#[repr(C)]
#[derive(Clone, Copy)]
struct AfdPollHandleInfo {
    handle: HANDLE,
    events: u32,
    status: NTSTATUS,
}

#[repr(C)]
#[derive(Clone, Copy)]
struct AfdPollInfo {
    timeout: i64,
    number_of_handles: u32,
    exclusive: u32,
    handles: [AfdPollHandleInfo; 1],
}

type ApcRoutine = Option<unsafe extern "system" fn(*mut c_void, *mut IoStatusBlock, u32)>;

/// Declares a table of `ntdll.dll` entry points resolved at runtime.
macro_rules! ntdll_import {
    ($(
        fn $name:ident($($arg:ident: $arg_ty:ty),* $(,)?) -> $ret:ty;
    )*) => {
        #[allow(non_snake_case)]
        struct NtdllImports {
            $(
                $name: unsafe extern "system" fn($($arg_ty),*) -> $ret,
            )*
        }

        #[allow(non_snake_case, clippy::too_many_arguments)]
        impl NtdllImports {
            fn load() -> Result<Self, i32> {
                let ntdll = unsafe { GetModuleHandleA(c"ntdll.dll".as_ptr() as *const u8) };
                if ntdll.is_null() {
                    return Err(unsafe { GetLastError() } as i32);
                }

                Ok(Self {
                    $(
                        $name: {
                            let name = concat!(stringify!($name), "\0");
                            match unsafe { GetProcAddress(ntdll, name.as_ptr()) } {
                                Some(addr) => unsafe {
                                    mem::transmute::<
                                        unsafe extern "system" fn() -> isize,
                                        unsafe extern "system" fn($($arg_ty),*) -> $ret,
                                    >(addr)
                                },
                                None => return Err(unsafe { GetLastError() } as i32),
                            }
                        },
                    )*
                })
            }

            $(
                unsafe fn $name(&self, $($arg: $arg_ty),*) -> $ret {
                    unsafe { (self.$name)($($arg),*) }
                }
            )*
        }
    }
}

ntdll_import! {
    fn NtCancelIoFileEx(
        file_handle: HANDLE,
        io_request_to_cancel: *mut IoStatusBlock,
        io_status_block: *mut IoStatusBlock,
    ) -> NTSTATUS;

    fn NtCreateFile(
        file_handle: *mut HANDLE,
        desired_access: u32,
        object_attributes: *mut ObjectAttributes,
        io_status_block: *mut IoStatusBlock,
        allocation_size: *mut i64,
        file_attributes: u32,
        share_access: u32,
        create_disposition: u32,
        create_options: u32,
        ea_buffer: *mut c_void,
        ea_length: u32,
    ) -> NTSTATUS;

    fn NtDeviceIoControlFile(
        file_handle: HANDLE,
        event: HANDLE,
        apc_routine: ApcRoutine,
        apc_context: *mut c_void,
        io_status_block: *mut IoStatusBlock,
        io_control_code: u32,
        input_buffer: *mut c_void,
        input_buffer_length: u32,
        output_buffer: *mut c_void,
        output_buffer_length: u32,
    ) -> NTSTATUS;

    fn RtlNtStatusToDosError(status: NTSTATUS) -> u32;
}

impl NtdllImports {
    /// Get the process-wide table, loading it on first use.
    fn get() -> io::Result<&'static NtdllImports> {
        static IMPORTS: OnceLock<Result<NtdllImports, i32>> = OnceLock::new();

        match IMPORTS.get_or_init(NtdllImports::load) {
            Ok(imports) => Ok(imports),
            Err(code) => Err(io::Error::from_raw_os_error(*code)),
        }
    }
}

/// Converts an `NTSTATUS` into the matching Win32 error.
fn ntstatus_error(status: NTSTATUS) -> io::Error {
    match NtdllImports::get() {
        Ok(ntdll) => {
            let code = unsafe { ntdll.RtlNtStatusToDosError(status) };
            io::Error::from_raw_os_error(code as i32)
        }
        Err(err) => err,
    }
}

/// Translates interest flags into the AFD events to poll for.
///
/// `AFD_POLL_LOCAL_CLOSE` is always requested so a socket closed behind the
/// poller's back completes its request and can be dropped.
pub(crate) fn readiness_to_afd(events: Readiness) -> u32 {
    let mut afd = AFD_POLL_LOCAL_CLOSE;

    if events.intersects(Readiness::IN | Readiness::RDNORM) {
        afd |= AFD_POLL_RECEIVE | AFD_POLL_ACCEPT;
    }
    if events.intersects(Readiness::PRI | Readiness::RDBAND) {
        afd |= AFD_POLL_RECEIVE_EXPEDITED;
    }
    if events.intersects(Readiness::WRITE_SIDE) {
        afd |= AFD_POLL_SEND;
    }
    if events.intersects(Readiness::IN | Readiness::RDNORM | Readiness::RDHUP) {
        afd |= AFD_POLL_DISCONNECT;
    }
    if events.contains(Readiness::HUP) {
        afd |= AFD_POLL_ABORT;
    }
    if events.contains(Readiness::ERR) {
        afd |= AFD_POLL_CONNECT_FAIL;
    }

    afd
}

/// Translates the AFD events of a completed request into readiness flags.
pub(crate) fn afd_to_readiness(afd: u32) -> Readiness {
    let mut events = Readiness::empty();

    if afd & (AFD_POLL_RECEIVE | AFD_POLL_ACCEPT) != 0 {
        events |= Readiness::IN | Readiness::RDNORM;
    }
    if afd & AFD_POLL_RECEIVE_EXPEDITED != 0 {
        events |= Readiness::PRI | Readiness::RDBAND;
    }
    if afd & AFD_POLL_SEND != 0 {
        events |= Readiness::OUT | Readiness::WRNORM | Readiness::WRBAND;
    }
    if afd & AFD_POLL_DISCONNECT != 0 && afd & AFD_POLL_ABORT == 0 {
        events |= Readiness::IN | Readiness::RDNORM | Readiness::RDHUP;
    }
    if afd & AFD_POLL_ABORT != 0 {
        events |= Readiness::HUP;
    }
    if afd & AFD_POLL_CONNECT_FAIL != 0 {
        events |= Readiness::ERR;
    }

    events
}

/// Resolves the base provider socket beneath any layered service provider.
///
/// Some LSPs intercept `SIO_BASE_HANDLE`; `SIO_BSP_HANDLE_POLL` then peels
/// one layer at a time until the base handle query succeeds. A provider that
/// reports itself as its own base ends the loop with the original error.
pub(crate) fn base_socket(socket: RawSocket) -> io::Result<RawSocket> {
    ensure_winsock()?;

    let mut socket = socket;
    loop {
        let err = match socket_ioctl(socket, SIO_BASE_HANDLE) {
            Ok(base) => return Ok(base),
            Err(err) => err,
        };

        if err.raw_os_error() == Some(WSAENOTSOCK) {
            return Err(err);
        }

        match socket_ioctl(socket, SIO_BSP_HANDLE_POLL) {
            Ok(bsp) if bsp != socket => socket = bsp,
            _ => return Err(err),
        }
    }
}

fn socket_ioctl(socket: RawSocket, code: u32) -> io::Result<RawSocket> {
    let mut out: SOCKET = INVALID_SOCKET;
    let mut bytes = 0u32;

    let rc = unsafe {
        WSAIoctl(
            socket as SOCKET,
            code,
            ptr::null(),
            0,
            &mut out as *mut SOCKET as *mut c_void,
            mem::size_of::<SOCKET>() as u32,
            &mut bytes,
            ptr::null_mut(),
            None,
        )
    };

    if rc == SOCKET_ERROR || out == INVALID_SOCKET {
        Err(io::Error::from_raw_os_error(unsafe { WSAGetLastError() }))
    } else {
        Ok(out as RawSocket)
    }
}

/// What a completed poll request says about its socket.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum PollOutcome {
    /// The request was cancelled before any condition was met.
    Cancelled,

    /// The driver failed the request.
    Failed,

    /// The request completed without any handle signalled.
    Nothing,

    /// The socket was closed locally.
    Closed,

    /// The socket reached these conditions.
    Ready(Readiness),
}

/// Memory shared with the driver for one request.
///
/// `iosb` must stay first: the completion packet hands back its address.
#[repr(C)]
struct Request {
    iosb: IoStatusBlock,
    info: AfdPollInfo,
    key: usize,
}

/// Heap block for one socket's poll request.
///
/// The block never moves and is only written by the driver while a request
/// is in flight, so it is reached through a raw pointer rather than a
/// Rust reference.
pub(crate) struct PollState {
    request: NonNull<Request>,
    base_socket: RawSocket,
}

impl PollState {
    /// Allocates a block polling `base_socket`, reporting completions as `key`.
    pub(crate) fn new(base_socket: RawSocket, key: usize) -> Self {
        let request = Box::new(Request {
            iosb: IoStatusBlock {
                u: IoStatus { status: STATUS_SUCCESS },
                information: 0,
            },
            info: AfdPollInfo {
                timeout: i64::MAX,
                number_of_handles: 0,
                exclusive: 0,
                handles: [AfdPollHandleInfo {
                    handle: ptr::null_mut(),
                    events: 0,
                    status: 0,
                }],
            },
            key,
        });

        Self {
            request: NonNull::from(Box::leak(request)),
            base_socket,
        }
    }

    /// Key of the block behind a completion packet.
    ///
    /// # Safety
    ///
    /// `overlapped` must come from a completion of a request issued through
    /// [`Afd::poll`] whose `PollState` is still alive.
    pub(crate) unsafe fn key_of(overlapped: *mut OVERLAPPED) -> usize {
        let request = overlapped as *const Request;
        unsafe { ptr::addr_of!((*request).key).read() }
    }

    fn iosb(&self) -> *mut IoStatusBlock {
        unsafe { ptr::addr_of_mut!((*self.request.as_ptr()).iosb) }
    }

    fn status(&self) -> NTSTATUS {
        unsafe { ptr::addr_of!((*self.iosb()).u.status).read_volatile() }
    }

    /// Marks the block as in flight without issuing a request.
    #[cfg(test)]
    pub(crate) fn mark_pending(&self) {
        unsafe { ptr::addr_of_mut!((*self.iosb()).u.status).write_volatile(STATUS_PENDING) }
    }

    /// Classifies a completed request.
    pub(crate) fn outcome(&self) -> PollOutcome {
        let status = self.status();

        if status == STATUS_CANCELLED {
            return PollOutcome::Cancelled;
        }
        if status < 0 {
            return PollOutcome::Failed;
        }

        let info = unsafe { ptr::addr_of!((*self.request.as_ptr()).info).read() };
        if info.number_of_handles < 1 {
            return PollOutcome::Nothing;
        }

        let events = info.handles[0].events;
        if events & AFD_POLL_LOCAL_CLOSE != 0 {
            return PollOutcome::Closed;
        }

        PollOutcome::Ready(afd_to_readiness(events))
    }
}

impl Drop for PollState {
    fn drop(&mut self) {
        drop(unsafe { Box::from_raw(self.request.as_ptr()) });
    }
}

/// The completion port and the AFD device bound to it.
pub(crate) struct Afd {
    port: HANDLE,
    device: HANDLE,
}

unsafe impl Send for Afd {}

impl Afd {
    /// Opens a completion port and an AFD device associated with it.
    ///
    /// Either both handles are returned or neither stays open.
    pub(crate) fn new() -> io::Result<Self> {
        let port = unsafe { CreateIoCompletionPort(INVALID_HANDLE_VALUE, ptr::null_mut(), 0, 0) };
        if port.is_null() {
            return Err(io::Error::last_os_error());
        }

        let mut afd = Self {
            port,
            device: ptr::null_mut(),
        };
        afd.device = open_device()?;

        if unsafe { CreateIoCompletionPort(afd.device, afd.port, 0, 0) }.is_null() {
            return Err(io::Error::last_os_error());
        }

        if unsafe { SetFileCompletionNotificationModes(afd.device, FILE_SKIP_SET_EVENT_ON_HANDLE) }
            == 0
        {
            return Err(io::Error::last_os_error());
        }

        debug!("afd: opened port={:p} device={:p}", afd.port, afd.device);
        Ok(afd)
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.port.is_null()
    }

    /// Issues an asynchronous poll request for `events` on `state`'s socket.
    ///
    /// Immediate completion is not distinguished from a pending request:
    /// both deliver one completion packet later.
    pub(crate) fn poll(&self, state: &PollState, events: u32) -> io::Result<()> {
        if self.is_closed() {
            return Err(invalid_handle());
        }

        let ntdll = NtdllImports::get()?;
        let request = state.request.as_ptr();

        let (iosb, info) = unsafe {
            ptr::addr_of_mut!((*request).info).write(AfdPollInfo {
                timeout: i64::MAX,
                number_of_handles: 1,
                exclusive: 0,
                handles: [AfdPollHandleInfo {
                    handle: state.base_socket as HANDLE,
                    events,
                    status: 0,
                }],
            });
            ptr::addr_of_mut!((*request).iosb.u.status).write_volatile(STATUS_PENDING);

            (ptr::addr_of_mut!((*request).iosb), ptr::addr_of_mut!((*request).info))
        };

        let size = mem::size_of::<AfdPollInfo>() as u32;
        let status = unsafe {
            ntdll.NtDeviceIoControlFile(
                self.device,
                ptr::null_mut(),
                None,
                iosb as *mut c_void,
                iosb,
                IOCTL_AFD_POLL,
                info as *mut c_void,
                size,
                info as *mut c_void,
                size,
            )
        };

        trace!(
            "afd: poll socket={} events={events:#x} status={status:#x}",
            state.base_socket
        );

        match status {
            STATUS_SUCCESS | STATUS_PENDING => Ok(()),
            status => Err(ntstatus_error(status)),
        }
    }

    /// Cancels the request of `state`, if it is still in flight.
    ///
    /// A request that already completed, or was never issued, is left
    /// alone; its completion packet (if any) is still delivered.
    pub(crate) fn cancel(&self, state: &PollState) -> io::Result<()> {
        if state.status() != STATUS_PENDING {
            return Ok(());
        }
        if self.is_closed() {
            return Err(invalid_handle());
        }

        let ntdll = NtdllImports::get()?;
        let mut cancel_iosb = IoStatusBlock {
            u: IoStatus { status: 0 },
            information: 0,
        };

        let status = unsafe { ntdll.NtCancelIoFileEx(self.device, state.iosb(), &mut cancel_iosb) };
        trace!("afd: cancel socket={} status={status:#x}", state.base_socket);

        match status {
            STATUS_SUCCESS | STATUS_NOT_FOUND => Ok(()),
            status => Err(ntstatus_error(status)),
        }
    }

    /// Dequeues up to `entries.len()` completion packets.
    ///
    /// A timeout is an empty batch, not an error.
    pub(crate) fn wait(&self, entries: &mut [OVERLAPPED_ENTRY], timeout_ms: u32) -> io::Result<usize> {
        if self.is_closed() {
            return Err(invalid_handle());
        }

        let mut removed = 0u32;
        let ok = unsafe {
            GetQueuedCompletionStatusEx(
                self.port,
                entries.as_mut_ptr(),
                entries.len() as u32,
                &mut removed,
                timeout_ms,
                0,
            )
        };

        if ok == 0 {
            let err = io::Error::last_os_error();
            if err.raw_os_error() == Some(WAIT_TIMEOUT as i32) {
                return Ok(0);
            }
            return Err(err);
        }

        Ok(removed as usize)
    }

    /// Closes the device, then the port. A second call does nothing.
    ///
    /// Closing the device aborts every request still in flight.
    pub(crate) fn close(&mut self) -> io::Result<()> {
        let mut result = Ok(());

        for handle in [&mut self.device, &mut self.port] {
            let raw = mem::replace(handle, ptr::null_mut());
            if !raw.is_null() && unsafe { CloseHandle(raw) } == 0 && result.is_ok() {
                result = Err(io::Error::last_os_error());
            }
        }

        result
    }

    /// Closes the device only, so driver calls fail while the port stays open.
    #[cfg(test)]
    pub(crate) fn close_device(&mut self) {
        let device = mem::replace(&mut self.device, ptr::null_mut());
        if !device.is_null() {
            unsafe { CloseHandle(device) };
        }
    }
}

impl fmt::Debug for Afd {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Afd")
            .field("closed", &self.is_closed())
            .finish()
    }
}

impl Drop for Afd {
    fn drop(&mut self) {
        let _ = self.close();
    }
}

/// Opens a fresh handle on the AFD device.
fn open_device() -> io::Result<HANDLE> {
    let ntdll = NtdllImports::get()?;

    let mut name: Vec<u16> = AFD_DEVICE.encode_utf16().collect();
    let bytes = (name.len() * mem::size_of::<u16>()) as u16;

    let mut unicode = UnicodeString {
        length: bytes,
        maximum_length: bytes,
        buffer: name.as_mut_ptr(),
    };
    let mut attributes = ObjectAttributes {
        length: mem::size_of::<ObjectAttributes>() as u32,
        root_directory: ptr::null_mut(),
        object_name: &mut unicode,
        attributes: 0,
        security_descriptor: ptr::null_mut(),
        security_quality_of_service: ptr::null_mut(),
    };

    let mut device: HANDLE = ptr::null_mut();
    let mut iosb = IoStatusBlock {
        u: IoStatus { status: 0 },
        information: 0,
    };

    let status = unsafe {
        ntdll.NtCreateFile(
            &mut device,
            SYNCHRONIZE,
            &mut attributes,
            &mut iosb,
            ptr::null_mut(),
            0,
            FILE_SHARE_READ | FILE_SHARE_WRITE,
            FILE_OPEN,
            0,
            ptr::null_mut(),
            0,
        )
    };

    if status != STATUS_SUCCESS {
        return Err(ntstatus_error(status));
    }

    Ok(device)
}
