use crate::context::{self, Context};
use crate::error::{Error, Result};
use crate::event::{engine_io_event, Event};
use crate::fd_table::{Direction, FdTable, FdTableFlags, IoCallback};
use crate::log::LogLevel::{LogDebug, LogWarn};
use crate::selector::{self, SELECT_TIMEOUT_MS};
use crate::user_loop::UserTag;
use std::os::unix::io::RawFd;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Handle to one registration, returned by `add_io_cb`/`add_io_cb_user`
/// and consumed by the matching removal. It carries the owning serial,
/// not a context reference, so holding on to it after the context went
/// away is harmless.
#[derive(Debug)]
pub struct IoCbTag {
    pub(crate) serial: u64,
    pub(crate) fd: RawFd,
    pub(crate) user_tag: Option<UserTag>,
}

impl IoCbTag {
    pub fn serial(&self) -> u64 {
        self.serial
    }

    pub fn fd(&self) -> RawFd {
        self.fd
    }
}

/// Register `fd` for `direction` on behalf of `ctx`. The registration
/// stays out of select passes until the context is activated. Used for
/// the global and the private wait loops.
pub fn add_io_cb(
    ctx: &Arc<Context>,
    fd: RawFd,
    direction: Direction,
    callback: IoCallback,
) -> Result<IoCbTag> {
    log!(
        LogDebug,
        "adding io callback: ctx={} fd={} {:?}",
        ctx.serial(),
        fd,
        direction
    );
    FdTable::global().set_io_cb(fd, ctx.serial(), direction, callback)?;
    Ok(IoCbTag {
        serial: ctx.serial(),
        fd,
        user_tag: None,
    })
}

/// Drop the registration behind `tag`. A registration that is already
/// gone (drained by cancellation or completion) is logged, not an error
/// the caller can act on.
pub fn remove_io_cb(tag: IoCbTag) {
    match FdTable::global().remove_io_cb(tag.fd, tag.serial) {
        Ok(()) => log!(LogDebug, "removed io callback: ctx={} fd={}", tag.serial, tag.fd),
        Err(err) => log!(
            LogWarn,
            "removing io callback for ctx={} fd={} failed: {}",
            tag.serial,
            tag.fd,
            err
        ),
    }
}

/// A finished operation as returned by the global wait loop. `status` is
/// the terminal transport error of the operation (None on success);
/// `op_err` carries the operation-specific sub-error, kept apart from
/// the transport error.
#[derive(Clone)]
pub struct Completion {
    pub ctx: Arc<Context>,
    pub status: Option<Error>,
    pub op_err: Option<Error>,
}

/// Drive the global event loop. With `ctx` given, only that context's
/// completion ends the wait; with None, any completion does and every
/// finished context is eventually returned in completion order. With
/// `hang == false` exactly one selector pass runs and "nothing finished
/// yet" comes back as `Ok(None)`. A selector failure aborts the wait
/// without touching any context's registrations.
pub fn wait_ext(ctx: Option<&Arc<Context>>, hang: bool) -> Result<Option<Completion>> {
    let scope = ctx.map_or(0, |ctx| ctx.serial());
    loop {
        let mut snapshot =
            FdTable::global().get_fds(scope, FdTableFlags::ACTIVE | FdTableFlags::CLEAR);
        // An empty snapshot still runs the selector so that its timeout
        // paces callers that spin on hang == false.
        selector::select(&mut snapshot, SELECT_TIMEOUT_MS)?;
        FdTable::global().set_signalled(&snapshot);
        let mut op_err = None;
        if let Err(err) = FdTable::global().run_io_cbs(scope, &mut op_err) {
            // A failing callback cancels its own context if the failure
            // is terminal; the dispatch pass just ended early.
            log!(LogDebug, "io callback pass stopped: {}", err);
        }
        if let Some(done) = FdTable::global().get_done(scope) {
            match context::get_ctx(done.serial) {
                Some(finished) => {
                    return Ok(Some(Completion {
                        ctx: finished,
                        status: done.err,
                        op_err: done.op_err,
                    }));
                }
                None => {
                    // The owner dropped the context before collecting its
                    // result; there is nobody left to hand it to.
                    log!(
                        LogWarn,
                        "finished ctx {} is gone, dropping its result",
                        done.serial
                    );
                }
            }
        }
        if !hang {
            return Ok(None);
        }
    }
}

/// `wait_ext` without the operation-error slot.
pub fn wait(ctx: Option<&Arc<Context>>, hang: bool) -> Result<Option<(Arc<Context>, Option<Error>)>> {
    Ok(wait_ext(ctx, hang)?.map(|done| (done.ctx, done.status)))
}

/// Drive `ctx` alone until its operation completes or `cond` is raised.
///
/// Blocking operations and the listings use this private loop. It
/// activates the context's fds itself on every pass, since the private
/// START handler deliberately does nothing and callbacks may register
/// further fds mid-operation. On a selector failure the context is
/// cancelled with that error before it is returned. An operation error
/// ends the wait and comes back in the Ok slot.
///
/// `cond` is observed with relaxed atomic loads; whoever raises it (a
/// callback, another thread, a signal handler) just stores true.
pub fn wait_on_condition(ctx: &Arc<Context>, cond: Option<&AtomicBool>) -> Result<Option<Error>> {
    let serial = ctx.serial();
    loop {
        FdTable::global().set_active(serial)?;
        let mut snapshot =
            FdTable::global().get_fds(serial, FdTableFlags::ACTIVE | FdTableFlags::CLEAR);
        if let Err(err) = selector::select(&mut snapshot, SELECT_TIMEOUT_MS) {
            // Close the context's fds and make the failure its result.
            if let Err(cancel_err) = crate::cancel::cancel_with_err(serial, err, None) {
                log!(LogWarn, "cancelling ctx {} failed: {}", serial, cancel_err);
            }
            return Err(err);
        }
        FdTable::global().set_signalled(&snapshot);
        let mut op_err = None;
        FdTable::global().run_io_cbs(serial, &mut op_err)?;
        if op_err.is_some() {
            return Ok(op_err);
        }
        if FdTable::global().io_cb_count(serial) == 0 {
            // The operation drained its I/O: emit the DONE through the
            // engine event hook and stop hanging.
            engine_io_event(ctx, Event::Done { err: None, op_err: None });
            return Ok(None);
        }
        if let Some(cond) = cond {
            if cond.load(Ordering::Relaxed) {
                return Ok(None);
            }
        }
    }
}

/// Wait until the blocking operation in `ctx` has finished. Not usable
/// for session-based protocols, which need the operation-error channel.
pub fn wait_one(ctx: &Arc<Context>) -> Result<()> {
    wait_on_condition(ctx, None).map(|_| ())
}

/// `wait_one` with the operation error reported to the caller. The right
/// variant for session-based protocols.
pub fn wait_one_ext(ctx: &Arc<Context>) -> Result<Option<Error>> {
    wait_on_condition(ctx, None)
}
