//! Logging that is safe inside a signal handler
//!
//! Neither `log` nor `std::io::stderr` can be used while handling a crash,
//! a logger may allocate or take a lock held by a thread that is now frozen.
//! These helpers issue raw `write(2)` calls of static bytes and of integers
//! formatted on the stack.

/// Writes all of `bytes` to stderr, giving up silently on failure
pub fn write_stderr(bytes: &[u8]) {
    let mut written = 0;
    while written < bytes.len() {
        let rest = &bytes[written..];
        // SAFETY: the pointer and length describe the live slice
        let res = unsafe { libc::write(libc::STDERR_FILENO, rest.as_ptr().cast(), rest.len()) };
        if res < 0 {
            if nix::errno::Errno::last() == nix::errno::Errno::EINTR {
                continue;
            }
            return;
        }
        if res == 0 {
            return;
        }
        written += res as usize;
    }
}

/// Formats `value` in decimal into the end of `buf`, returning the digits
pub fn format_int(value: i64, buf: &mut [u8; 20]) -> &[u8] {
    let negative = value < 0;
    let mut magnitude = value.unsigned_abs();
    let mut pos = buf.len();

    loop {
        pos -= 1;
        buf[pos] = b'0' + (magnitude % 10) as u8;
        magnitude /= 10;
        if magnitude == 0 {
            break;
        }
    }
    if negative {
        pos -= 1;
        buf[pos] = b'-';
    }
    &buf[pos..]
}

pub fn write_stderr_int(value: i64) {
    let mut buf = [0u8; 20];
    write_stderr(format_int(value, &mut buf));
}

/// Logs a static message, optionally followed by an integer, to stderr
/// without allocating
///
/// ```ignore
/// signal_log!("clone failed, errno: ", nix::errno::Errno::last_raw());
/// ```
macro_rules! signal_log {
    ($msg:literal) => {
        $crate::signal_safe::write_stderr(concat!("minidump-handler: ", $msg, "\n").as_bytes())
    };
    ($msg:literal, $value:expr) => {{
        $crate::signal_safe::write_stderr(concat!("minidump-handler: ", $msg).as_bytes());
        $crate::signal_safe::write_stderr_int($value as i64);
        $crate::signal_safe::write_stderr(b"\n");
    }};
}
