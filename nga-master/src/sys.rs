//! Small helpers around raw libc calls.

use std::{
    ffi::c_int,
    io,
};

/// Turns a `-1` return value into the `errno` error.
pub(crate) fn cvt(ret: c_int) -> io::Result<c_int> {
    if ret == -1 {
        Err(io::Error::last_os_error())
    }
    else {
        Ok(ret)
    }
}

/// Same as [`cvt`], but for `ssize_t` returning calls like `sendto`.
pub(crate) fn cvt_size(ret: libc::ssize_t) -> io::Result<usize> {
    if ret < 0 {
        Err(io::Error::last_os_error())
    }
    else {
        Ok(ret as usize)
    }
}

/// Retries a call while it fails with `EINTR`.
pub(crate) fn retry_interrupted<T>(mut f: impl FnMut() -> io::Result<T>) -> io::Result<T> {
    loop {
        match f() {
            Err(error) if error.kind() == io::ErrorKind::Interrupted => continue,
            result => return result,
        }
    }
}

const IOC_WRITE: u64 = 1;
const IOC_NRSHIFT: u64 = 0;
const IOC_TYPESHIFT: u64 = 8;
const IOC_SIZESHIFT: u64 = 16;
const IOC_DIRSHIFT: u64 = 30;

/// The `_IOW(type, nr, size)` macro from `<asm-generic/ioctl.h>`.
pub(crate) const fn iow(ty: u8, nr: u8, size: usize) -> u64 {
    (IOC_WRITE << IOC_DIRSHIFT)
        | ((ty as u64) << IOC_TYPESHIFT)
        | ((nr as u64) << IOC_NRSHIFT)
        | ((size as u64) << IOC_SIZESHIFT)
}

/// Copies an interface name into a fixed size, nul-terminated buffer.
///
/// Returns `None` if the name doesn't fit.
pub(crate) fn interface_name(name: &str) -> Option<[libc::c_char; libc::IFNAMSIZ]> {
    let bytes = name.as_bytes();
    if bytes.is_empty() || bytes.len() >= libc::IFNAMSIZ || bytes.contains(&0) {
        return None;
    }

    let mut buffer = [0 as libc::c_char; libc::IFNAMSIZ];
    for (dst, src) in buffer.iter_mut().zip(bytes) {
        *dst = *src as libc::c_char;
    }
    Some(buffer)
}
