use std::mem::size_of;
use std::os::unix::prelude::*;

/// `setsockopt` wrapper
///
/// The libc `setsockopt` function is set to set various options on a socket.
/// `set_socket_option` offers a somewhat type-safe wrapper that does not
/// require messing around with `*const c_void`s.
///
/// A proper `std::io::Error` will be returned on failure.
///
/// Note that the `val` parameter must be specified correctly; if an option
/// expects an integer, it is advisable to pass in a `c_int`, not the default
/// of `i32`.
pub(crate) fn set_socket_option<T>(
    fd: libc::c_int,
    level: libc::c_int,
    name: libc::c_int,
    val: &T,
) -> std::io::Result<()> {
    let result = unsafe {
        let val_ptr: *const T = val as *const T;

        libc::setsockopt(
            fd,
            level,
            name,
            val_ptr as *const libc::c_void,
            size_of::<T>() as libc::socklen_t,
        )
    };

    if result != 0 {
        return Err(std::io::Error::last_os_error());
    }

    Ok(())
}

pub(crate) fn set_nonblocking(fd: RawFd) -> std::io::Result<()> {
    let old_flags = unsafe { libc::fcntl(fd, libc::F_GETFL) };

    if old_flags == -1 {
        return Err(std::io::Error::last_os_error());
    }

    let new_flags = old_flags | libc::O_NONBLOCK;

    let result = unsafe { libc::fcntl(fd, libc::F_SETFL, new_flags) };

    if result != 0 {
        return Err(std::io::Error::last_os_error());
    }
    Ok(())
}

/// Monotonic clock in microseconds. All tick timing is derived from this so
/// that wall-clock adjustments cannot move deadlines.
pub(crate) fn monotonic_us() -> u64 {
    let mut ts = libc::timespec {
        tv_sec: 0,
        tv_nsec: 0,
    };
    unsafe {
        libc::clock_gettime(libc::CLOCK_MONOTONIC, &mut ts);
    }
    ts.tv_sec as u64 * 1_000_000 + ts.tv_nsec as u64 / 1_000
}

/// Read into a buffer from a raw descriptor.
pub(crate) fn read_fd(fd: RawFd, buf: &mut [u8]) -> std::io::Result<usize> {
    let n = unsafe { libc::read(fd, buf.as_mut_ptr() as *mut libc::c_void, buf.len()) };
    if n < 0 {
        return Err(std::io::Error::last_os_error());
    }
    Ok(n as usize)
}

/// Write a buffer to a raw descriptor.
pub(crate) fn write_fd(fd: RawFd, buf: &[u8]) -> std::io::Result<usize> {
    let n = unsafe { libc::write(fd, buf.as_ptr() as *const libc::c_void, buf.len()) };
    if n < 0 {
        return Err(std::io::Error::last_os_error());
    }
    Ok(n as usize)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn monotonic_is_monotonic() {
        let a = monotonic_us();
        let b = monotonic_us();
        assert!(b >= a);
    }
}
