//! Wire-level details of the handover protocol (§4.J): socket-file naming, the greeting/reply
//! lines, and the raw `SCM_RIGHTS` send/receive primitives shared by [`crate::donor`] and
//! [`crate::recipient`].

use std::{
    io::{IoSlice, IoSliceMut},
    os::fd::RawFd,
    path::{Path, PathBuf},
};

use nix::{
    cmsg_space,
    sys::socket::{ControlMessage, ControlMessageOwned, MsgFlags, recvmsg, sendmsg},
};
use registry_facade_utils::HANDOVER_SOCKET_PREFIX;

use crate::error::{HandoverError, HandoverResult};

//--------------------------------------------------------------------------------------------------
// Constants
//--------------------------------------------------------------------------------------------------

/// The recipient's greeting, sent as plain bytes once connected.
pub const REQ_LINE: &[u8] = b"REQ\n";

/// The donor's reply, carried as the payload of the same message that transfers the listening
/// file descriptor as `SCM_RIGHTS` ancillary data.
pub const ACK_LINE: &[u8] = b"ACK\n";

//--------------------------------------------------------------------------------------------------
// Functions
//--------------------------------------------------------------------------------------------------

/// Builds the socket filename a donor publishes at the given Unix timestamp.
pub fn socket_filename(unix_secs: u64) -> String {
    format!("{HANDOVER_SOCKET_PREFIX}{unix_secs}.sock")
}

/// Returns `true` if `name` matches the handover socket filename grammar.
pub fn is_handover_socket(name: &str) -> bool {
    name.starts_with(HANDOVER_SOCKET_PREFIX) && name.ends_with(".sock")
}

/// Scans `dir` for handover socket files and returns the path of the lexicographically greatest
/// one, if any — donor timestamps sort monotonically, so this is the most recently published
/// donor.
pub fn pick_latest_socket(dir: &Path) -> HandoverResult<Option<PathBuf>> {
    let mut entries = match std::fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(err) => return Err(err.into()),
    };

    let mut latest: Option<String> = None;
    while let Some(entry) = entries.next().transpose()? {
        let Some(name) = entry.file_name().to_str().map(str::to_owned) else {
            continue;
        };
        if !is_handover_socket(&name) {
            continue;
        }
        if latest.as_deref().is_none_or(|cur| name.as_str() > cur) {
            latest = Some(name);
        }
    }

    Ok(latest.map(|name| dir.join(name)))
}

/// Sends `payload` as ancillary-carrying data over `fd`, with `fd_to_send` attached as a single
/// `SCM_RIGHTS` control message. Must be called from inside a [`tokio::net::UnixStream::try_io`]
/// writable callback so the non-blocking send integrates with the async runtime.
pub fn send_with_fd(fd: RawFd, payload: &[u8], fd_to_send: RawFd) -> HandoverResult<usize> {
    let iov = [IoSlice::new(payload)];
    let fds = [fd_to_send];
    let cmsg = [ControlMessage::ScmRights(&fds)];
    sendmsg::<()>(fd, &iov, &cmsg, MsgFlags::empty(), None).map_err(HandoverError::from)
}

/// Receives a payload and, if present, a single transferred file descriptor over `fd`. Must be
/// called from inside a [`tokio::net::UnixStream::try_io`] readable callback.
pub fn recv_with_fd(fd: RawFd, buf: &mut [u8]) -> HandoverResult<(usize, Option<RawFd>)> {
    let mut iov = [IoSliceMut::new(buf)];
    let mut cmsg_buffer = cmsg_space!(RawFd);
    let msg = recvmsg::<()>(fd, &mut iov, Some(&mut cmsg_buffer), MsgFlags::empty())?;

    let mut received_fd = None;
    for cmsg in msg.cmsgs()? {
        if let ControlMessageOwned::ScmRights(fds) = cmsg {
            received_fd = fds.first().copied();
        }
    }

    Ok((msg.bytes, received_fd))
}

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn socket_filename_matches_grammar() {
        let name = socket_filename(1_700_000_000);
        assert_eq!(name, "rf-handover-1700000000.sock");
        assert!(is_handover_socket(&name));
    }

    #[test]
    fn rejects_unrelated_filenames() {
        assert!(!is_handover_socket("other.sock"));
        assert!(!is_handover_socket("rf-handover-notanumber.txt"));
    }

    #[test]
    fn pick_latest_socket_prefers_greatest_timestamp() {
        let dir = tempfile::TempDir::new().unwrap();
        std::fs::write(dir.path().join(socket_filename(100)), b"").unwrap();
        std::fs::write(dir.path().join(socket_filename(300)), b"").unwrap();
        std::fs::write(dir.path().join(socket_filename(200)), b"").unwrap();
        std::fs::write(dir.path().join("unrelated.sock"), b"").unwrap();

        let picked = pick_latest_socket(dir.path()).unwrap().unwrap();
        assert_eq!(picked.file_name().unwrap().to_str().unwrap(), socket_filename(300));
    }

    #[test]
    fn pick_latest_socket_is_none_when_directory_absent() {
        let dir = tempfile::TempDir::new().unwrap();
        let missing = dir.path().join("does-not-exist");
        assert!(pick_latest_socket(&missing).unwrap().is_none());
    }
}
