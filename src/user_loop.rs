use crate::context::{self, Context};
use crate::error::{Error, Result};
use crate::event::{engine_io_event, Event};
use crate::fd_table::{Direction, FdTable, IoCallback};
use crate::log::LogLevel::{LogDebug, LogWarn};
use crate::wait::{add_io_cb, remove_io_cb, IoCbTag};
use std::os::unix::io::RawFd;
use std::sync::Arc;

/// Opaque handle the application's event loop hands back for a
/// registration it accepted.
pub type UserTag = u64;

/// Callback vtable supplied by an application that owns the event loop.
/// When it is installed, the core never runs the selector for that
/// context: `add`/`remove` mirror the registrations into the
/// application's loop, and `event` lets the application observe the
/// context's lifecycle events.
#[derive(Clone)]
pub struct UserIoCbs {
    pub add: Arc<dyn Fn(RawFd, Direction, IoCallback) -> Result<UserTag> + Send + Sync>,
    pub remove: Arc<dyn Fn(UserTag) + Send + Sync>,
    pub event: Option<Arc<dyn Fn(&Event) + Send + Sync>>,
}

/// Wrapper installed into the application's loop; it runs when the
/// application reports readiness for `fd`. The report both activates
/// and signals the entry, then the context's ready callbacks run. When
/// that leaves the context without registrations, its DONE is
/// synthesised through the engine event hook so the application
/// observes completion exactly like the private loop would.
fn user_io_cb_handler(serial: u64, fd: RawFd) -> Result<()> {
    FdTable::global().mark_ready(fd, serial);
    let mut op_err = None;
    match FdTable::global().run_io_cbs(serial, &mut op_err) {
        Err(err) => {
            // The failing callback owns its error handling; the
            // application's loop only learns that readiness was consumed.
            log!(
                LogDebug,
                "user io callback pass for ctx {} stopped: {}",
                serial,
                err
            );
        }
        Ok(()) if op_err.is_some() => {}
        Ok(()) => {
            if FdTable::global().io_cb_count(serial) == 0 {
                if let Some(ctx) = context::get_ctx(serial) {
                    engine_io_event(&ctx, Event::Done { err: None, op_err: None });
                }
            }
        }
    }
    Ok(())
}

/// Register `fd` with both the fd table and the application's event
/// loop. If the application's `add` fails, the inner registration is
/// rolled back so no partial state remains.
pub fn add_io_cb_user(
    ctx: &Arc<Context>,
    fd: RawFd,
    direction: Direction,
    callback: IoCallback,
) -> Result<IoCbTag> {
    let cbs = ctx
        .user_io_cbs()
        .ok_or(Error::InvalidArgument("context has no user io callbacks"))?;
    let mut tag = add_io_cb(ctx, fd, direction, callback)?;
    let serial = tag.serial();
    let wrapper: IoCallback = Arc::new(move |ready_fd| user_io_cb_handler(serial, ready_fd));
    match (cbs.add)(fd, direction, wrapper) {
        Ok(user_tag) => {
            tag.user_tag = Some(user_tag);
            Ok(tag)
        }
        Err(err) => {
            log!(
                LogWarn,
                "user loop rejected fd {} of ctx {}: {}",
                fd,
                serial,
                err
            );
            remove_io_cb(tag);
            Err(err)
        }
    }
}

/// Remove a registration made with `add_io_cb_user`: from the
/// application's loop first, then from the fd table.
pub fn remove_io_cb_user(tag: IoCbTag) {
    if let Some(user_tag) = tag.user_tag {
        if let Some(ctx) = context::get_ctx(tag.serial()) {
            if let Some(cbs) = ctx.user_io_cbs() {
                (cbs.remove)(user_tag);
            }
        }
    }
    remove_io_cb(tag);
}
