//! Out of process dump requests
//!
//! A crashing client sends its [`crash_context::CrashContext`] verbatim as a
//! single `SOCK_SEQPACKET` message to a long lived crash server. The message
//! carries the write end of an acknowledgement socket, the server writes one
//! byte to it once the dump is done: `1` for success, `0` for failure.
//!
//! The layout of the context is only shared between builds of this crate, a
//! request of any other size is rejected.

use {
    super::{
        errors::{CrashGenerationError, WriterError},
        minidump_writer::MinidumpWriter,
    },
    error_graph::ErrorList,
    nix::{
        errno::Errno,
        sys::socket::{self, AddressFamily, ControlMessageOwned, MsgFlags, SockFlag, SockType},
    },
    std::{
        io::{IoSliceMut, Seek, Write},
        mem,
        os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd},
        ptr,
    },
};

type Result<T> = std::result::Result<T, CrashGenerationError>;

const ACK_SUCCESS: u8 = 1;
const ACK_FAILURE: u8 = 0;

/// Creates a connected pair of seqpacket sockets, one for the client and one
/// for the server
pub fn socket_pair() -> Result<(OwnedFd, OwnedFd)> {
    Ok(socket::socketpair(
        AddressFamily::Unix,
        SockType::SeqPacket,
        None,
        SockFlag::SOCK_CLOEXEC,
    )?)
}

/// The client end, used from the signal handler
///
/// Nothing in [`Self::request_dump`] allocates or takes a lock.
#[derive(Debug)]
pub struct CrashGenerationClient {
    server_fd: RawFd,
}

impl CrashGenerationClient {
    /// `server_fd` is a connected seqpacket socket, it stays owned by the
    /// caller
    pub fn new(server_fd: RawFd) -> Self {
        Self { server_fd }
    }

    /// Sends `context` to the server and blocks until it reports whether the
    /// dump was written
    pub fn request_dump(&self, context: &crash_context::CrashContext) -> Result<bool> {
        let mut fds = [-1; 2];
        // SAFETY: fds has room for the two descriptors
        if unsafe {
            libc::socketpair(
                libc::AF_UNIX,
                libc::SOCK_SEQPACKET | libc::SOCK_CLOEXEC,
                0,
                fds.as_mut_ptr(),
            )
        } == -1
        {
            return Err(Errno::last().into());
        }
        let [ack_read, ack_write] = fds;

        let sent = self.send(context.as_bytes(), ack_write);
        // The server holds its own copy of the write end now
        // SAFETY: we own the descriptor
        unsafe { libc::close(ack_write) };

        let result = sent.and_then(|()| read_ack(ack_read));
        // SAFETY: we own the descriptor
        unsafe { libc::close(ack_read) };
        result
    }

    fn send(&self, bytes: &[u8], ack_fd: RawFd) -> Result<()> {
        // Large enough for one SCM_RIGHTS descriptor on every supported
        // target, u64 keeps the header aligned
        let mut control = [0u64; 4];

        let mut iov = libc::iovec {
            iov_base: bytes.as_ptr() as *mut libc::c_void,
            iov_len: bytes.len(),
        };

        // SAFETY: all pointers in the header point to live locals, and the
        // control buffer is big and aligned enough for the single cmsg
        unsafe {
            let mut msg: libc::msghdr = mem::zeroed();
            msg.msg_iov = &mut iov;
            msg.msg_iovlen = 1;
            msg.msg_control = control.as_mut_ptr().cast();
            msg.msg_controllen = libc::CMSG_SPACE(mem::size_of::<libc::c_int>() as u32) as _;

            let cmsg = libc::CMSG_FIRSTHDR(&msg);
            if cmsg.is_null() {
                return Err(Errno::EINVAL.into());
            }
            (*cmsg).cmsg_level = libc::SOL_SOCKET;
            (*cmsg).cmsg_type = libc::SCM_RIGHTS;
            (*cmsg).cmsg_len = libc::CMSG_LEN(mem::size_of::<libc::c_int>() as u32) as _;
            ptr::write_unaligned(libc::CMSG_DATA(cmsg).cast::<libc::c_int>(), ack_fd);

            loop {
                let res = libc::sendmsg(self.server_fd, &msg, libc::MSG_NOSIGNAL);
                if res >= 0 {
                    return Ok(());
                }
                let errno = Errno::last();
                if errno != Errno::EINTR {
                    return Err(errno.into());
                }
            }
        }
    }
}

fn read_ack(fd: RawFd) -> Result<bool> {
    let mut ack = ACK_FAILURE;
    loop {
        // SAFETY: reads a single byte into a local
        let res = unsafe { libc::read(fd, (&mut ack as *mut u8).cast(), 1) };
        match res {
            1 => return Ok(ack == ACK_SUCCESS),
            0 => return Err(CrashGenerationError::Disconnected),
            _ => {
                let errno = Errno::last();
                if errno != Errno::EINTR {
                    return Err(errno.into());
                }
            }
        }
    }
}

/// A validated dump request, as seen by the crash server
pub struct CrashRequest {
    context: crash_context::CrashContext,
    ack: OwnedFd,
}

impl std::fmt::Debug for CrashRequest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CrashRequest")
            .field("pid", &self.context.pid)
            .field("tid", &self.context.tid)
            .field("signal", &self.context.siginfo.ssi_signo)
            .finish_non_exhaustive()
    }
}

impl CrashRequest {
    /// Blocks until a client sends a request on `fd`
    pub fn receive(fd: RawFd) -> Result<Self> {
        let expected = mem::size_of::<crash_context::CrashContext>();
        // One extra byte so oversized requests are detected
        let mut buffer = vec![0u8; expected + 1];
        let mut control = nix::cmsg_space!([RawFd; 1]);

        let (actual, fds) = {
            let mut iov = [IoSliceMut::new(&mut buffer)];
            let msg = socket::recvmsg::<()>(fd, &mut iov, Some(&mut control), MsgFlags::empty())?;

            let mut fds = Vec::new();
            for cmsg in msg.cmsgs()? {
                if let ControlMessageOwned::ScmRights(rights) = cmsg {
                    fds.extend(rights);
                }
            }
            (msg.bytes, fds)
        };

        // SAFETY: SCM_RIGHTS hands us fresh descriptors nobody else owns
        let mut fds = fds
            .into_iter()
            .map(|fd| unsafe { OwnedFd::from_raw_fd(fd) })
            .collect::<Vec<_>>()
            .into_iter();

        if actual == 0 {
            return Err(CrashGenerationError::Disconnected);
        }
        if actual != expected {
            return Err(CrashGenerationError::InvalidSize { expected, actual });
        }
        let ack = fds.next().ok_or(CrashGenerationError::MissingAckFd)?;

        let context = crash_context::CrashContext::from_bytes(&buffer[..actual])
            .ok_or(CrashGenerationError::InvalidSize { expected, actual })?;

        log::debug!(
            "crash request from pid {} thread {}",
            context.pid,
            context.tid
        );
        Ok(Self { context, ack })
    }

    #[inline]
    pub fn context(&self) -> &crash_context::CrashContext {
        &self.context
    }

    /// Writes the minidump of the requesting process to `destination`
    ///
    /// The crashing thread is described with the context it sent.
    pub fn dump(
        &self,
        destination: &mut (impl Write + Seek),
    ) -> std::result::Result<ErrorList<WriterError>, WriterError> {
        MinidumpWriter::new(self.context.pid, self.context.tid)
            .set_crash_context(self.context.clone().into())
            .dump(destination)
    }

    /// Tells the client whether its dump was written
    pub fn reply(self, success: bool) -> Result<()> {
        let ack = if success { ACK_SUCCESS } else { ACK_FAILURE };
        loop {
            match nix::unistd::write(&self.ack, &[ack]) {
                Ok(_) => return Ok(()),
                Err(Errno::EINTR) => continue,
                Err(e) => {
                    log::warn!(
                        "failed to acknowledge crash request on fd {}: {e}",
                        self.ack.as_raw_fd()
                    );
                    return Err(e.into());
                }
            }
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn test_context(tid: i32) -> crash_context::CrashContext {
        // SAFETY: POD
        let mut context: crash_context::CrashContext = unsafe { mem::zeroed() };
        context.pid = std::process::id() as i32;
        context.tid = tid;
        context.siginfo.ssi_signo = libc::SIGSEGV as u32;
        context.siginfo.ssi_addr = 0xdead_beef;
        context
    }

    #[test]
    fn request_round_trip() {
        let (client_fd, server_fd) = socket_pair().unwrap();

        let server = std::thread::spawn(move || {
            let request = CrashRequest::receive(server_fd.as_raw_fd()).unwrap();
            let context = request.context();
            assert_eq!(context.tid, 1234);
            assert_eq!(context.siginfo.ssi_signo, libc::SIGSEGV as u32);
            assert_eq!(context.siginfo.ssi_addr, 0xdead_beef);
            request.reply(true).unwrap();
        });

        let client = CrashGenerationClient::new(client_fd.as_raw_fd());
        assert!(client.request_dump(&test_context(1234)).unwrap());
        server.join().unwrap();
    }

    #[test]
    fn failure_is_reported_to_the_client() {
        let (client_fd, server_fd) = socket_pair().unwrap();

        let server = std::thread::spawn(move || {
            let request = CrashRequest::receive(server_fd.as_raw_fd()).unwrap();
            request.reply(false).unwrap();
        });

        let client = CrashGenerationClient::new(client_fd.as_raw_fd());
        assert!(!client.request_dump(&test_context(1)).unwrap());
        server.join().unwrap();
    }

    #[test]
    fn wrong_size_is_rejected() {
        let (client_fd, server_fd) = socket_pair().unwrap();

        for len in [16, mem::size_of::<crash_context::CrashContext>() + 8] {
            let payload = vec![0u8; len];
            nix::unistd::write(&client_fd, &payload).unwrap();

            match CrashRequest::receive(server_fd.as_raw_fd()) {
                Err(CrashGenerationError::InvalidSize { expected, actual }) => {
                    assert_eq!(expected, mem::size_of::<crash_context::CrashContext>());
                    assert_ne!(actual, expected);
                }
                other => panic!("unexpected result {other:?}"),
            }
        }
    }

    #[test]
    fn request_without_ack_fd_is_rejected() {
        let (client_fd, server_fd) = socket_pair().unwrap();

        let context = test_context(1);
        nix::unistd::write(&client_fd, context.as_bytes()).unwrap();
        assert!(matches!(
            CrashRequest::receive(server_fd.as_raw_fd()),
            Err(CrashGenerationError::MissingAckFd)
        ));
    }

    #[test]
    fn closed_client_is_a_disconnect() {
        let (client_fd, server_fd) = socket_pair().unwrap();
        drop(client_fd);
        assert!(matches!(
            CrashRequest::receive(server_fd.as_raw_fd()),
            Err(CrashGenerationError::Disconnected)
        ));
    }
}
