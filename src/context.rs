use crate::engine::Engine;
use crate::event::{Key, TrustItem};
use crate::log::LogLevel::LogDebug;
use crate::user_loop::UserIoCbs;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};

/// Which wait loop a context's events are routed to.
#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub enum LoopKind {
    /// Driven by `wait`/`wait_ext` together with all other global
    /// contexts.
    Global,
    /// Driven by `wait_on_condition` alone. Used by blocking operations
    /// and by the key and trust item listings.
    Private,
    /// Driven by an event loop the embedding application owns.
    User,
}

static NEXT_SERIAL: AtomicU64 = AtomicU64::new(1);

lazy_static! {
    static ref CONTEXTS: Mutex<HashMap<u64, Weak<Context>>> = Mutex::new(HashMap::new());
}

/// A handle for one logical operation in progress.
///
/// The core refers to contexts by serial and re-resolves the serial at
/// every use instead of holding strong references across callbacks, so a
/// context that went away simply stops resolving; there is no way for a
/// callback to outrun the owner into freed memory.
pub struct Context {
    serial: u64,
    loop_kind: LoopKind,
    engine: Mutex<Option<Arc<dyn Engine>>>,
    user_io_cbs: Mutex<Option<UserIoCbs>>,
    keys: Mutex<Vec<Key>>,
    trust_items: Mutex<Vec<TrustItem>>,
}

impl Context {
    pub fn new(loop_kind: LoopKind) -> Arc<Context> {
        let serial = NEXT_SERIAL.fetch_add(1, Ordering::Relaxed);
        let ctx = Arc::new(Context {
            serial,
            loop_kind,
            engine: Mutex::new(None),
            user_io_cbs: Mutex::new(None),
            keys: Mutex::new(Vec::new()),
            trust_items: Mutex::new(Vec::new()),
        });
        CONTEXTS.lock().unwrap().insert(serial, Arc::downgrade(&ctx));
        log!(LogDebug, "created ctx {} ({:?} loop)", serial, loop_kind);
        ctx
    }

    pub fn serial(&self) -> u64 {
        self.serial
    }

    pub fn loop_kind(&self) -> LoopKind {
        self.loop_kind
    }

    pub fn set_engine(&self, engine: Arc<dyn Engine>) {
        *self.engine.lock().unwrap() = Some(engine);
    }

    pub fn engine(&self) -> Option<Arc<dyn Engine>> {
        self.engine.lock().unwrap().clone()
    }

    /// Install the vtable bridging registrations into the application's
    /// event loop. Only meaningful for `LoopKind::User` contexts.
    pub fn set_user_io_cbs(&self, cbs: UserIoCbs) {
        *self.user_io_cbs.lock().unwrap() = Some(cbs);
    }

    pub fn user_io_cbs(&self) -> Option<UserIoCbs> {
        self.user_io_cbs.lock().unwrap().clone()
    }

    pub(crate) fn push_key(&self, key: Key) {
        self.keys.lock().unwrap().push(key);
    }

    pub(crate) fn push_trust_item(&self, item: TrustItem) {
        self.trust_items.lock().unwrap().push(item);
    }

    /// Drain the keys a listing operation has streamed out so far.
    pub fn take_keys(&self) -> Vec<Key> {
        std::mem::take(&mut *self.keys.lock().unwrap())
    }

    pub fn take_trust_items(&self) -> Vec<TrustItem> {
        std::mem::take(&mut *self.trust_items.lock().unwrap())
    }
}

impl Drop for Context {
    fn drop(&mut self) {
        CONTEXTS.lock().unwrap().remove(&self.serial);
        log!(LogDebug, "dropped ctx {}", self.serial);
    }
}

/// Resolve a serial to its context, if it is still alive.
pub fn get_ctx(serial: u64) -> Option<Arc<Context>> {
    CONTEXTS.lock().unwrap().get(&serial).and_then(Weak::upgrade)
}
