use crate::context::{Context, LoopKind};
use crate::error::Error;
use crate::fd_table::FdTable;
use crate::log::LogLevel::LogDebug;
use std::sync::Arc;

/// Descriptor of a key streamed out of a keyring listing.
#[derive(Clone, Eq, PartialEq, Debug)]
pub struct Key {
    pub fingerprint: String,
}

/// Descriptor of a trust item streamed out of a trust listing.
#[derive(Clone, Eq, PartialEq, Debug)]
pub struct TrustItem {
    pub keyid: String,
}

/// Lifecycle events an engine posts while driving an operation.
#[derive(Clone, Debug)]
pub enum Event {
    Start,
    Done {
        err: Option<Error>,
        op_err: Option<Error>,
    },
    NextKey(Key),
    NextTrustItem(TrustItem),
}

/// Engine-facing hook. Engines post lifecycle events here; the event is
/// routed to the handler matching the wait loop the context runs under.
pub fn engine_io_event(ctx: &Arc<Context>, event: Event) {
    log!(LogDebug, "event {:?} for ctx {}", event, ctx.serial());
    match ctx.loop_kind() {
        LoopKind::Global => global_event_cb(ctx, event),
        LoopKind::Private => private_event_cb(ctx, event),
        LoopKind::User => user_event_cb(ctx, event),
    }
}

/// Handler for contexts driven by the global loop. A started context
/// joins the select set; a done context is parked on the done list until
/// a wait call collects it. The listing events have no business here:
/// listings run on private loops, so receiving one is a programmer
/// error, not a condition to paper over.
fn global_event_cb(ctx: &Arc<Context>, event: Event) {
    match event {
        Event::Start => {
            if let Err(err) = FdTable::global().set_active(ctx.serial()) {
                // Activation failed. Close the context's fds and turn the
                // error into its result.
                let _ = crate::cancel::cancel_with_err(ctx.serial(), err, None);
            }
        }
        Event::Done { err, op_err } => FdTable::global().set_done(ctx.serial(), err, op_err),
        Event::NextKey(_) => panic!("NEXT_KEY event delivered to the global event handler"),
        Event::NextTrustItem(_) => {
            panic!("NEXT_TRUSTITEM event delivered to the global event handler")
        }
    }
}

/// Handler for contexts driven by the private loop. START and DONE are
/// ignored: the loop itself only runs once setup is finished and detects
/// completion by watching the callback count. The listing events feed
/// the per-context accumulators.
fn private_event_cb(ctx: &Arc<Context>, event: Event) {
    match event {
        Event::Start | Event::Done { .. } => {}
        Event::NextKey(key) => ctx.push_key(key),
        Event::NextTrustItem(item) => ctx.push_trust_item(item),
    }
}

/// Handler for contexts driven by an application-owned loop: everything
/// is forwarded verbatim to the application's event hook, if installed.
fn user_event_cb(ctx: &Arc<Context>, event: Event) {
    if let Some(cbs) = ctx.user_io_cbs() {
        if let Some(event_cb) = &cbs.event {
            event_cb(&event);
        }
    }
}
