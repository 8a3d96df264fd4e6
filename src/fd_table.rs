use crate::error::{Error, Result};
use crate::log::LogLevel::{LogDebug, LogWarn};
use std::collections::{HashMap, VecDeque};
use std::os::unix::io::RawFd;
use std::sync::{Arc, Mutex};

/// An I/O callback as registered by operation code. The callback drives
/// one direction of engine I/O on one fd; it may re-enter the
/// registration, removal and cancellation APIs of this crate.
pub type IoCallback = Arc<dyn Fn(RawFd) -> Result<()> + Send + Sync>;

/// Direction a registered fd is waited on.
#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub enum Direction {
    Read,
    Write,
}

bitflags! {
    /// Filters for `FdTable::get_fds` snapshots.
    pub struct FdTableFlags: u32 {
        /// Only entries that take part in the next select pass.
        const ACTIVE = 1 << 0;
        /// Also clear `signalled` on every entry put into the snapshot.
        const CLEAR = 1 << 1;
    }
}

/// Lifecycle of a context as tracked by the table.
///
/// Transitions are total: an event arriving in an unexpected phase is
/// logged and ignored. The table never drives a context backwards.
#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub enum Phase {
    Idle,
    Started,
    Active,
    Done,
    Cancelled,
}

/// One occupied slot of the table. Slots are `Option<FdEntry>`, so a
/// free slot carries no stale fd or callback and every occupied entry
/// has a callback and a non-zero serial.
struct FdEntry {
    fd: RawFd,
    serial: u64,
    direction: Direction,
    callback: IoCallback,
    /// Whether this fd participates in the next select pass.
    active: bool,
    /// Set when the last select pass reported readiness; cleared by the
    /// callback runner before the callback is invoked.
    signalled: bool,
}

/// Per-context bookkeeping.
struct ContextState {
    phase: Phase,
    err: Option<Error>,
    op_err: Option<Error>,
    /// Number of occupied slots owned by the context. Derivable from the
    /// slots, but cached since `io_cb_count` sits on the wait-loop path.
    fd_count: usize,
}

impl ContextState {
    fn new() -> ContextState {
        ContextState {
            phase: Phase::Idle,
            err: None,
            op_err: None,
            fd_count: 0,
        }
    }

    fn done(&self) -> bool {
        self.phase == Phase::Done || self.phase == Phase::Cancelled
    }
}

/// One entry of a selector snapshot. The snapshot is independent of the
/// live table: callbacks may mutate the table while a snapshot is in
/// flight, so `set_signalled` re-checks `slot`/`fd`/`serial` before
/// touching an entry.
#[derive(Copy, Clone, Debug)]
pub struct FdSelectEntry {
    pub fd: RawFd,
    pub serial: u64,
    pub direction: Direction,
    pub slot: usize,
    /// Filled in by the selector when the fd became ready.
    pub signalled: bool,
}

/// Terminal state of a finished context, as collected by a wait loop.
#[derive(Copy, Clone, Debug)]
pub struct DoneInfo {
    pub serial: u64,
    pub err: Option<Error>,
    pub op_err: Option<Error>,
}

struct Inner {
    slots: Vec<Option<FdEntry>>,
    contexts: HashMap<u64, ContextState>,
    /// Completed serials in completion order; `get_done(0)` consumes from
    /// the front so every finished context is eventually returned.
    done_queue: VecDeque<u64>,
}

const MAX_SLOTS: usize = 1024;

/// Process-wide registry of `(fd, owner context, direction, callback)`
/// registrations.
///
/// All mutations go through the one inner mutex. The callback runner
/// holds it only to fetch the next entry; it is released for the duration
/// of each callback invocation so callbacks can re-enter the table.
pub struct FdTable {
    inner: Mutex<Inner>,
}

lazy_static! {
    static ref FDTABLE: FdTable = FdTable::new();
}

fn drain_slots(inner: &mut Inner, serial: u64) -> Vec<RawFd> {
    let mut fds = Vec::new();
    for slot in inner.slots.iter_mut() {
        if matches!(slot, Some(entry) if entry.serial == serial) {
            fds.push(slot.take().unwrap().fd);
        }
    }
    if let Some(state) = inner.contexts.get_mut(&serial) {
        state.fd_count = 0;
    }
    fds
}

impl FdTable {
    pub fn new() -> FdTable {
        FdTable {
            inner: Mutex::new(Inner {
                slots: Vec::new(),
                contexts: HashMap::new(),
                done_queue: VecDeque::new(),
            }),
        }
    }

    /// The process-wide table. Fds are a process-wide resource, so there
    /// is exactly one of these for the lifetime of the library.
    pub fn global() -> &'static FdTable {
        &FDTABLE
    }

    /// Store a registration for `fd`, owned by `serial`. An existing
    /// registration for the same fd is replaced wholesale, so occupied fd
    /// values stay unique across the table. The new entry is inactive
    /// until `set_active` runs for its owner.
    pub fn set_io_cb(
        &self,
        fd: RawFd,
        serial: u64,
        direction: Direction,
        callback: IoCallback,
    ) -> Result<()> {
        if fd < 0 {
            return Err(Error::InvalidArgument("negative fd"));
        }
        if serial == 0 {
            return Err(Error::InvalidArgument("serial 0 is not a context"));
        }
        let mut inner = self.inner.lock().unwrap();
        let slot = match inner
            .slots
            .iter()
            .position(|s| matches!(s, Some(entry) if entry.fd == fd))
        {
            Some(idx) => idx,
            None => match inner.slots.iter().position(|s| s.is_none()) {
                Some(idx) => idx,
                None => {
                    if inner.slots.len() >= MAX_SLOTS {
                        return Err(Error::ResourceExhausted);
                    }
                    inner.slots.push(None);
                    inner.slots.len() - 1
                }
            },
        };
        if let Some(old) = inner.slots[slot].take() {
            log!(
                LogWarn,
                "fd {} was still registered for ctx {}, replacing",
                fd,
                old.serial
            );
            if let Some(state) = inner.contexts.get_mut(&old.serial) {
                state.fd_count -= 1;
            }
        }
        inner.slots[slot] = Some(FdEntry {
            fd,
            serial,
            direction,
            callback,
            active: false,
            signalled: false,
        });
        inner
            .contexts
            .entry(serial)
            .or_insert_with(ContextState::new)
            .fd_count += 1;
        log!(
            LogDebug,
            "registered fd {} {:?} for ctx {} (slot {})",
            fd,
            direction,
            serial,
            slot
        );
        Ok(())
    }

    /// Drop the registration for `fd`. The fd itself is left alone;
    /// closing it is the engine's business.
    pub fn remove_io_cb(&self, fd: RawFd, serial: u64) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        let slot = inner
            .slots
            .iter()
            .position(|s| matches!(s, Some(entry) if entry.fd == fd && entry.serial == serial))
            .ok_or(Error::InvalidArgument("fd not registered for this context"))?;
        inner.slots[slot] = None;
        if let Some(state) = inner.contexts.get_mut(&serial) {
            state.fd_count -= 1;
        }
        log!(LogDebug, "removed fd {} of ctx {} (slot {})", fd, serial, slot);
        Ok(())
    }

    /// Mark all entries owned by `serial` as participating in select
    /// passes. Idempotent; run from the START event of the global loop
    /// and from the entry of the private loop.
    pub fn set_active(&self, serial: u64) -> Result<()> {
        if serial == 0 {
            return Err(Error::InvalidArgument("serial 0 is not a context"));
        }
        let mut inner = self.inner.lock().unwrap();
        let mut activated = 0;
        for entry in inner.slots.iter_mut().flatten() {
            if entry.serial == serial && !entry.active {
                entry.active = true;
                activated += 1;
            }
        }
        let state = inner
            .contexts
            .entry(serial)
            .or_insert_with(ContextState::new);
        match state.phase {
            Phase::Idle => state.phase = Phase::Started,
            Phase::Started | Phase::Active => {}
            phase => log!(LogWarn, "activating ctx {} in phase {:?}", serial, phase),
        }
        if activated > 0 {
            log!(LogDebug, "activated {} fds of ctx {}", activated, serial);
        }
        Ok(())
    }

    /// Snapshot the entries of `serial` (0 = all contexts) for a selector
    /// pass, filtered per `flags`.
    pub fn get_fds(&self, serial: u64, flags: FdTableFlags) -> Vec<FdSelectEntry> {
        let mut inner = self.inner.lock().unwrap();
        let mut snapshot = Vec::new();
        for (idx, slot) in inner.slots.iter_mut().enumerate() {
            let entry = match slot {
                Some(entry) => entry,
                None => continue,
            };
            if serial != 0 && entry.serial != serial {
                continue;
            }
            if flags.contains(FdTableFlags::ACTIVE) && !entry.active {
                continue;
            }
            if flags.contains(FdTableFlags::CLEAR) {
                entry.signalled = false;
            }
            snapshot.push(FdSelectEntry {
                fd: entry.fd,
                serial: entry.serial,
                direction: entry.direction,
                slot: idx,
                signalled: false,
            });
        }
        snapshot
    }

    /// Carry the selector's readiness report back into the table. Entries
    /// not listed in the snapshot are untouched; entries that vanished or
    /// changed owner since the snapshot are skipped.
    pub fn set_signalled(&self, snapshot: &[FdSelectEntry]) {
        let mut inner = self.inner.lock().unwrap();
        for snap in snapshot.iter().filter(|s| s.signalled) {
            if let Some(Some(entry)) = inner.slots.get_mut(snap.slot) {
                if entry.fd == snap.fd && entry.serial == snap.serial && entry.active {
                    entry.signalled = true;
                }
            }
        }
    }

    /// Mark one registration ready outside of a selector pass. The
    /// user-loop adapter uses this when the embedding application reports
    /// readiness for an fd: the report both activates the entry and flags
    /// it as signalled.
    pub(crate) fn mark_ready(&self, fd: RawFd, serial: u64) -> bool {
        let mut inner = self.inner.lock().unwrap();
        for entry in inner.slots.iter_mut().flatten() {
            if entry.fd == fd && entry.serial == serial {
                entry.active = true;
                entry.signalled = true;
                return true;
            }
        }
        false
    }

    /// Run the callbacks of every signalled entry in scope (`serial` 0 =
    /// all contexts). Each entry runs at most once per call; entries
    /// registered by a callback are not visited until the next call, and
    /// entries removed by a callback are skipped. A transport error from
    /// a callback stops the pass and is returned; an operation error
    /// stops the pass and lands in `op_err` instead.
    pub fn run_io_cbs(&self, serial: u64, op_err: &mut Option<Error>) -> Result<()> {
        let candidates: Vec<(usize, RawFd, u64)> = {
            let inner = self.inner.lock().unwrap();
            inner
                .slots
                .iter()
                .enumerate()
                .filter_map(|(idx, slot)| slot.as_ref().map(|entry| (idx, entry)))
                .filter(|(_, entry)| serial == 0 || entry.serial == serial)
                .filter(|(_, entry)| entry.active && entry.signalled)
                .map(|(idx, entry)| (idx, entry.fd, entry.serial))
                .collect()
        };
        for (idx, fd, owner) in candidates {
            let callback = {
                let mut inner = self.inner.lock().unwrap();
                let callback = match inner.slots.get_mut(idx) {
                    Some(Some(entry))
                        if entry.fd == fd
                            && entry.serial == owner
                            && entry.active
                            && entry.signalled =>
                    {
                        entry.signalled = false;
                        Some(entry.callback.clone())
                    }
                    // Removed or replaced by an earlier callback.
                    _ => None,
                };
                if callback.is_some() {
                    if let Some(state) = inner.contexts.get_mut(&owner) {
                        if state.phase == Phase::Started {
                            state.phase = Phase::Active;
                        }
                    }
                }
                callback
            };
            let callback = match callback {
                Some(callback) => callback,
                None => continue,
            };
            log!(LogDebug, "running io callback for fd {} (ctx {})", fd, owner);
            // The table lock is released across the invocation; the
            // callback may register, remove or cancel.
            if let Err(err) = callback(fd) {
                if let Error::Operation(_) = err {
                    log!(LogDebug, "io callback for fd {} reported op error: {}", fd, err);
                    *op_err = Some(err);
                    return Ok(());
                }
                log!(LogDebug, "io callback for fd {} failed: {}", fd, err);
                return Err(err);
            }
        }
        Ok(())
    }

    /// Number of registrations currently owned by `serial`. An operation
    /// that has dropped to zero has drained its I/O and is due a DONE.
    pub fn io_cb_count(&self, serial: u64) -> usize {
        let inner = self.inner.lock().unwrap();
        inner.contexts.get(&serial).map_or(0, |state| state.fd_count)
    }

    /// Record the terminal state of a context. The first result sticks;
    /// a later report for an already-finished context is dropped.
    pub fn set_done(&self, serial: u64, err: Option<Error>, op_err: Option<Error>) {
        if serial == 0 {
            log!(LogWarn, "set_done called with serial 0");
            return;
        }
        let mut inner = self.inner.lock().unwrap();
        let state = inner
            .contexts
            .entry(serial)
            .or_insert_with(ContextState::new);
        if state.done() {
            log!(LogDebug, "ctx {} already done, keeping first result", serial);
            return;
        }
        state.phase = if err == Some(Error::Cancelled) {
            Phase::Cancelled
        } else {
            Phase::Done
        };
        state.err = err;
        state.op_err = op_err;
        inner.done_queue.push_back(serial);
        log!(
            LogDebug,
            "ctx {} finished (err={:?} op_err={:?})",
            serial,
            err,
            op_err
        );
    }

    /// Collect a finished context in scope (`serial` 0 = any, in
    /// completion order). Consuming a done context also drains whatever
    /// registrations it still holds.
    pub fn get_done(&self, serial: u64) -> Option<DoneInfo> {
        let mut inner = self.inner.lock().unwrap();
        let pos = if serial == 0 {
            if inner.done_queue.is_empty() {
                return None;
            }
            0
        } else {
            inner.done_queue.iter().position(|s| *s == serial)?
        };
        let done_serial = inner.done_queue.remove(pos).unwrap();
        drain_slots(&mut inner, done_serial);
        let (err, op_err) = inner
            .contexts
            .remove(&done_serial)
            .map_or((None, None), |state| (state.err, state.op_err));
        log!(
            LogDebug,
            "collected done ctx {} (err={:?} op_err={:?})",
            done_serial,
            err,
            op_err
        );
        Some(DoneInfo {
            serial: done_serial,
            err,
            op_err,
        })
    }

    /// Remove every registration owned by `serial`, returning the fds
    /// that were still registered. Used by cancellation; safe while a
    /// `run_io_cbs` pass is underway, which then skips the vanished
    /// entries.
    pub(crate) fn drain(&self, serial: u64) -> Vec<RawFd> {
        let mut inner = self.inner.lock().unwrap();
        let fds = drain_slots(&mut inner, serial);
        if !fds.is_empty() {
            log!(LogDebug, "drained {} fds of ctx {}", fds.len(), serial);
        }
        fds
    }
}
