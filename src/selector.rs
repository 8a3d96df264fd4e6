use crate::error::{Error, Result};
use crate::fd_table::{Direction, FdSelectEntry};
use crate::log::LogLevel::LogDebug;
use nix::errno::Errno;
use nix::poll::{poll, PollFd, PollFlags};

/// How long one selector pass may block, in milliseconds. Wait loops
/// re-snapshot the table between passes, and callers that poll with
/// `hang == false` are paced by this value even when there is nothing
/// to wait on.
pub const SELECT_TIMEOUT_MS: libc::c_int = 1000;

/// Wait for readiness on the fds in `snapshot`, for at most `timeout_ms`
/// (0 polls without blocking). Each entry that became ready in its
/// requested direction gets its `signalled` flag set; the count of ready
/// entries is returned. A wake without readiness (EINTR) reports 0.
///
/// An empty snapshot still sleeps for the timeout; the wait loops rely
/// on that pacing.
pub fn select(snapshot: &mut [FdSelectEntry], timeout_ms: libc::c_int) -> Result<usize> {
    let mut pollfds: Vec<PollFd> = snapshot
        .iter()
        .map(|entry| {
            let events = match entry.direction {
                Direction::Read => PollFlags::POLLIN,
                Direction::Write => PollFlags::POLLOUT,
            };
            PollFd::new(entry.fd, events)
        })
        .collect();

    match poll(&mut pollfds, timeout_ms) {
        Ok(_) => {}
        Err(err) => match err.as_errno() {
            Some(Errno::EINTR) => return Ok(0),
            Some(errno) => return Err(Error::System(errno)),
            None => return Err(Error::System(Errno::EINVAL)),
        },
    }

    let mut nready = 0;
    for (entry, pollfd) in snapshot.iter_mut().zip(pollfds.iter()) {
        let revents = pollfd.revents().unwrap_or_else(PollFlags::empty);
        if revents.contains(PollFlags::POLLNVAL) {
            // poll(2) reports a stale fd per-entry instead of failing the
            // call; surface it the way select(2) would have.
            return Err(Error::System(Errno::EBADF));
        }
        let ready = match entry.direction {
            Direction::Read => {
                revents.intersects(PollFlags::POLLIN | PollFlags::POLLHUP | PollFlags::POLLERR)
            }
            Direction::Write => revents.intersects(PollFlags::POLLOUT | PollFlags::POLLERR),
        };
        if ready {
            entry.signalled = true;
            nready += 1;
        }
    }
    if nready > 0 {
        log!(LogDebug, "{} of {} fds ready", nready, snapshot.len());
    }
    Ok(nready)
}
