use crate::context::{self, LoopKind};
use crate::error::{Error, Result};
use crate::event::{engine_io_event, Event};
use crate::fd_table::FdTable;
use crate::log::LogLevel::{LogDebug, LogWarn};

/// Cancel the operation running in context `serial`: close every fd it
/// still has registered through its engine, drop the registrations, and
/// post a DONE carrying `err`/`op_err`.
///
/// Safe to call from inside a running callback; the callback runner
/// skips the entries that vanish under it. For a context on a
/// user-owned loop the DONE goes out through the application's event
/// hook; everything else lands on the done list where the wait calls
/// collect it.
pub fn cancel_with_err(serial: u64, err: Error, op_err: Option<Error>) -> Result<()> {
    if serial == 0 {
        return Err(Error::InvalidArgument("serial 0 is not a context"));
    }
    log!(LogDebug, "cancelling ctx {} with {}", serial, err);
    let fds = FdTable::global().drain(serial);
    let ctx = context::get_ctx(serial);
    match &ctx {
        Some(ctx) => match ctx.engine() {
            Some(engine) => {
                for fd in fds {
                    engine.close_fd(fd);
                }
            }
            None => {
                if !fds.is_empty() {
                    log!(
                        LogWarn,
                        "ctx {} has no engine, leaving {} fds open",
                        serial,
                        fds.len()
                    );
                }
            }
        },
        None => log!(LogWarn, "cancelling unknown ctx {}", serial),
    }
    match ctx {
        Some(ref ctx) if ctx.loop_kind() == LoopKind::User => {
            engine_io_event(ctx, Event::Done { err: Some(err), op_err });
        }
        _ => FdTable::global().set_done(serial, Some(err), op_err),
    }
    Ok(())
}
