use std::os::unix::io::RawFd;

/// Hook into the subprocess backend that drives an operation. The engine
/// owns every fd it hands to the core; the core calls back here when a
/// cancellation has to tear them down. Closing fds is never the fd
/// table's business.
pub trait Engine: Send + Sync {
    fn close_fd(&self, fd: RawFd);
}
