//! I/O multiplexing and event-dispatch core for a client library that
//! drives long-running cryptographic subprocesses through pipes.
//!
//! Operation code registers `(fd, direction, callback)` tuples against a
//! [`Context`]; the process-wide [`FdTable`] tracks the registrations;
//! one of three wait loops selects on the union of the active fds and
//! dispatches the ready callbacks, which drive the engine I/O and
//! eventually post a DONE event back through [`engine_io_event`]:
//!
//! * the global loop ([`wait`]/[`wait_ext`]) drives all asynchronous
//!   contexts at once,
//! * the private loop ([`wait_on_condition`]) drives exactly one context
//!   for blocking and listing operations,
//! * the user loop ([`add_io_cb_user`]) hands the select to an event
//!   loop the embedding application owns.
//!
//! The core decides *when* somebody should read or write and *when* an
//! operation is done; it never touches the bytes and never closes an fd.

#[macro_use]
extern crate bitflags;
#[macro_use]
extern crate lazy_static;

#[macro_use]
mod log;

mod cancel;
mod context;
mod engine;
mod error;
mod event;
mod fd_table;
mod selector;
mod user_loop;
mod wait;

pub use crate::cancel::cancel_with_err;
pub use crate::context::{get_ctx, Context, LoopKind};
pub use crate::engine::Engine;
pub use crate::error::{Error, Result};
pub use crate::event::{engine_io_event, Event, Key, TrustItem};
pub use crate::fd_table::{Direction, DoneInfo, FdSelectEntry, FdTable, FdTableFlags, IoCallback};
pub use crate::selector::{select, SELECT_TIMEOUT_MS};
pub use crate::user_loop::{add_io_cb_user, remove_io_cb_user, UserIoCbs, UserTag};
pub use crate::wait::{
    add_io_cb, remove_io_cb, wait, wait_ext, wait_on_condition, wait_one, wait_one_ext, Completion,
    IoCbTag,
};
