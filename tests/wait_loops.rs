//! End-to-end scenarios driving the wait loops over real pipes.
//!
//! Everything here shares the process-wide fd table, so the tests
//! serialize on one mutex and each test consumes the completions it
//! produces.

use keymux::{
    add_io_cb, add_io_cb_user, cancel_with_err, engine_io_event, get_ctx, remove_io_cb, wait,
    wait_ext, wait_on_condition, wait_one_ext, Context, Direction, Engine, Error, Event, FdTable,
    IoCallback, IoCbTag, LoopKind, UserIoCbs, UserTag,
};
use lazy_static::lazy_static;
use nix::errno::Errno;
use nix::unistd;
use std::collections::HashMap;
use std::os::unix::io::RawFd;
use std::sync::{Arc, Mutex};

lazy_static! {
    static ref TEST_LOCK: Mutex<()> = Mutex::new(());
}

fn test_lock() -> std::sync::MutexGuard<'static, ()> {
    // A panicking test must not wedge the remaining ones.
    TEST_LOCK.lock().unwrap_or_else(|e| e.into_inner())
}

fn sys_err(err: nix::Error) -> Error {
    Error::System(err.as_errno().unwrap_or(Errno::EIO))
}

/// Stand-in for a subprocess engine: records which fds the core asked it
/// to close, optionally really closing them.
struct TestEngine {
    really_close: bool,
    closed: Mutex<Vec<RawFd>>,
}

impl TestEngine {
    fn new(really_close: bool) -> Arc<TestEngine> {
        Arc::new(TestEngine {
            really_close,
            closed: Mutex::new(Vec::new()),
        })
    }

    fn closed_fds(&self) -> Vec<RawFd> {
        self.closed.lock().unwrap().clone()
    }
}

impl Engine for TestEngine {
    fn close_fd(&self, fd: RawFd) {
        if self.really_close {
            let _ = unistd::close(fd);
        }
        self.closed.lock().unwrap().push(fd);
    }
}

/// Read callback that consumes one byte and then removes its own
/// registration, the way an engine callback drains itself at EOF.
fn draining_read_cb(tags: Arc<Mutex<Vec<IoCbTag>>>) -> IoCallback {
    Arc::new(move |fd| {
        let mut buf = [0u8; 1];
        unistd::read(fd, &mut buf).map_err(sys_err)?;
        let mut tags = tags.lock().unwrap();
        if let Some(pos) = tags.iter().position(|tag| tag.fd() == fd) {
            let tag = tags.remove(pos);
            drop(tags);
            remove_io_cb(tag);
        }
        Ok(())
    })
}

/// Like `draining_read_cb`, but also posts the DONE event a finished
/// engine would post, for contexts on the global loop.
fn completing_read_cb(tags: Arc<Mutex<Vec<IoCbTag>>>, serial: u64) -> IoCallback {
    let drain = draining_read_cb(tags);
    Arc::new(move |fd| {
        drain(fd)?;
        if let Some(ctx) = get_ctx(serial) {
            engine_io_event(&ctx, Event::Done { err: None, op_err: None });
        }
        Ok(())
    })
}

#[test]
fn private_loop_completes_when_the_io_drains() {
    let _guard = test_lock();
    let ctx = Context::new(LoopKind::Private);
    ctx.set_engine(TestEngine::new(true));
    let (r1, w1) = unistd::pipe().unwrap();
    let (r2, w2) = unistd::pipe().unwrap();
    unistd::write(w1, b"x").unwrap();
    unistd::write(w2, b"y").unwrap();

    let tags = Arc::new(Mutex::new(Vec::new()));
    for fd in [r1, r2].iter() {
        let tag = add_io_cb(&ctx, *fd, Direction::Read, draining_read_cb(tags.clone())).unwrap();
        tags.lock().unwrap().push(tag);
    }
    engine_io_event(&ctx, Event::Start);

    assert_eq!(wait_on_condition(&ctx, None), Ok(None));
    assert_eq!(FdTable::global().io_cb_count(ctx.serial()), 0);
    assert!(tags.lock().unwrap().is_empty());

    for fd in [r1, w1, r2, w2].iter() {
        let _ = unistd::close(*fd);
    }
}

#[test]
fn wait_one_ext_reports_the_operation_error() {
    let _guard = test_lock();
    let ctx = Context::new(LoopKind::Private);
    ctx.set_engine(TestEngine::new(true));
    let (r, w) = unistd::pipe().unwrap();
    unistd::write(w, b"x").unwrap();

    let tag = add_io_cb(
        &ctx,
        r,
        Direction::Read,
        Arc::new(|fd| {
            let mut buf = [0u8; 1];
            unistd::read(fd, &mut buf).map_err(sys_err)?;
            Err(Error::Operation("bad passphrase"))
        }),
    )
    .unwrap();

    assert_eq!(
        wait_one_ext(&ctx),
        Ok(Some(Error::Operation("bad passphrase")))
    );

    remove_io_cb(tag);
    for fd in [r, w].iter() {
        let _ = unistd::close(*fd);
    }
}

#[test]
fn global_loop_returns_each_finished_context_once() {
    let _guard = test_lock();
    let ctx_a = Context::new(LoopKind::Global);
    let ctx_b = Context::new(LoopKind::Global);
    let mut pipes = Vec::new();
    for &ctx in [&ctx_a, &ctx_b].iter() {
        ctx.set_engine(TestEngine::new(true));
        let (r, w) = unistd::pipe().unwrap();
        unistd::write(w, b"x").unwrap();
        let tags = Arc::new(Mutex::new(Vec::new()));
        let tag = add_io_cb(
            ctx,
            r,
            Direction::Read,
            completing_read_cb(tags.clone(), ctx.serial()),
        )
        .unwrap();
        tags.lock().unwrap().push(tag);
        engine_io_event(ctx, Event::Start);
        pipes.push((r, w));
    }

    // Both contexts complete during the first selector pass; the two
    // non-hanging waits hand them out one at a time, never twice.
    let first = wait_ext(None, false).unwrap().expect("one context finished");
    let second = wait_ext(None, false).unwrap().expect("the other finished");
    assert_eq!(first.status, None);
    assert_eq!(second.status, None);
    let mut serials = vec![first.ctx.serial(), second.ctx.serial()];
    serials.sort();
    let mut expected = vec![ctx_a.serial(), ctx_b.serial()];
    expected.sort();
    assert_eq!(serials, expected);
    assert!(wait(None, false).unwrap().is_none());

    for (r, w) in pipes {
        let _ = unistd::close(r);
        let _ = unistd::close(w);
    }
}

#[test]
fn nonhanging_wait_times_out_quietly() {
    let _guard = test_lock();
    let ctx = Context::new(LoopKind::Global);
    ctx.set_engine(TestEngine::new(true));
    let (r, w) = unistd::pipe().unwrap();
    let tag = add_io_cb(&ctx, r, Direction::Read, Arc::new(|_| Ok(()))).unwrap();
    engine_io_event(&ctx, Event::Start);

    // The fd never becomes ready: one paced pass, then "nothing yet".
    match wait_ext(Some(&ctx), false) {
        Ok(None) => {}
        other => panic!("expected a quiet timeout, got {:?}", other.map(|c| c.map(|c| c.status))),
    }

    remove_io_cb(tag);
    for fd in [r, w].iter() {
        let _ = unistd::close(*fd);
    }
}

#[test]
fn cancellation_from_inside_a_callback_is_safe() {
    let _guard = test_lock();
    let ctx = Context::new(LoopKind::Global);
    let engine = TestEngine::new(true);
    ctx.set_engine(engine.clone());
    let (r1, w1) = unistd::pipe().unwrap();
    let (r2, w2) = unistd::pipe().unwrap();
    unistd::write(w1, b"x").unwrap();
    unistd::write(w2, b"y").unwrap();

    let serial = ctx.serial();
    add_io_cb(
        &ctx,
        r1,
        Direction::Read,
        Arc::new(move |_| {
            cancel_with_err(serial, Error::Cancelled, None)?;
            Ok(())
        }),
    )
    .unwrap();
    add_io_cb(
        &ctx,
        r2,
        Direction::Read,
        Arc::new(|_| panic!("the cancelled entry must not run")),
    )
    .unwrap();
    engine_io_event(&ctx, Event::Start);

    // Both fds are ready; the first callback cancels the context, the
    // second entry vanishes under the running pass.
    let done = wait_ext(Some(&ctx), false)
        .unwrap()
        .expect("cancellation finished the context");
    assert_eq!(done.ctx.serial(), serial);
    assert_eq!(done.status, Some(Error::Cancelled));
    assert_eq!(FdTable::global().io_cb_count(serial), 0);

    // The engine was asked to close both fds.
    let mut closed = engine.closed_fds();
    closed.sort();
    let mut expected = vec![r1, r2];
    expected.sort();
    assert_eq!(closed, expected);

    // Exactly one completion came out of it.
    assert!(wait_ext(Some(&ctx), false).unwrap().is_none());

    for fd in [w1, w2].iter() {
        let _ = unistd::close(*fd);
    }
}

#[test]
fn cancellation_drains_and_reports_exactly_once() {
    let _guard = test_lock();
    let ctx = Context::new(LoopKind::Global);
    let engine = TestEngine::new(false);
    ctx.set_engine(engine.clone());
    // Table-only fds; nothing real gets closed with really_close off.
    add_io_cb(&ctx, 801, Direction::Read, Arc::new(|_| Ok(()))).unwrap();
    add_io_cb(&ctx, 802, Direction::Write, Arc::new(|_| Ok(()))).unwrap();

    cancel_with_err(ctx.serial(), Error::Cancelled, None).unwrap();
    assert_eq!(FdTable::global().io_cb_count(ctx.serial()), 0);
    assert_eq!(engine.closed_fds().len(), 2);

    let done = FdTable::global().get_done(0).expect("cancel posted a DONE");
    assert_eq!(done.serial, ctx.serial());
    assert_eq!(done.err, Some(Error::Cancelled));
    assert!(FdTable::global().get_done(0).is_none());
}

#[test]
fn user_loop_synthesises_done_when_readiness_arrives_after_drain() {
    let _guard = test_lock();
    let ctx = Context::new(LoopKind::User);
    ctx.set_engine(TestEngine::new(true));

    // The application's event loop: a map of wrappers by tag plus a log
    // of observed lifecycle events.
    let registered: Arc<Mutex<HashMap<UserTag, IoCallback>>> = Arc::new(Mutex::new(HashMap::new()));
    let events: Arc<Mutex<Vec<String>>> = Arc::new(Mutex::new(Vec::new()));
    let next_tag = Arc::new(Mutex::new(1u64));
    {
        let registered_by_add = registered.clone();
        let registered_by_remove = registered.clone();
        let events = events.clone();
        ctx.set_user_io_cbs(UserIoCbs {
            add: Arc::new(move |_fd, _dir, wrapper| {
                let mut next = next_tag.lock().unwrap();
                let tag = *next;
                *next += 1;
                registered_by_add.lock().unwrap().insert(tag, wrapper);
                Ok(tag)
            }),
            remove: Arc::new(move |tag| {
                registered_by_remove.lock().unwrap().remove(&tag);
            }),
            event: Some(Arc::new(move |event| {
                events.lock().unwrap().push(format!("{:?}", event));
            })),
        });
    }

    let (r, w) = unistd::pipe().unwrap();
    unistd::write(w, b"x").unwrap();

    let tag = add_io_cb_user(
        &ctx,
        r,
        Direction::Read,
        Arc::new(|fd| {
            let mut buf = [0u8; 1];
            unistd::read(fd, &mut buf).map_err(sys_err)?;
            Ok(())
        }),
    )
    .unwrap();
    assert_eq!(registered.lock().unwrap().len(), 1);

    // The last callback is gone after this readiness pass, so the core
    // synthesises the DONE; drop the registration first so the count
    // reaches zero.
    let serial = ctx.serial();
    let wrapper = registered.lock().unwrap().values().next().unwrap().clone();
    keymux::remove_io_cb_user(tag);
    assert!(registered.lock().unwrap().is_empty());
    assert_eq!(FdTable::global().io_cb_count(serial), 0);
    wrapper(r).unwrap();

    let events = events.lock().unwrap();
    assert!(events.iter().any(|event| event.contains("Done")));

    for fd in [r, w].iter() {
        let _ = unistd::close(*fd);
    }
}

#[test]
fn user_loop_runs_callbacks_when_the_application_signals_readiness() {
    let _guard = test_lock();
    let ctx = Context::new(LoopKind::User);
    ctx.set_engine(TestEngine::new(true));

    let registered: Arc<Mutex<HashMap<UserTag, IoCallback>>> = Arc::new(Mutex::new(HashMap::new()));
    let events: Arc<Mutex<Vec<String>>> = Arc::new(Mutex::new(Vec::new()));
    {
        let registered_by_add = registered.clone();
        let registered_by_remove = registered.clone();
        let events = events.clone();
        ctx.set_user_io_cbs(UserIoCbs {
            add: Arc::new(move |fd, _dir, wrapper| {
                registered_by_add.lock().unwrap().insert(fd as UserTag, wrapper);
                Ok(fd as UserTag)
            }),
            remove: Arc::new(move |tag| {
                registered_by_remove.lock().unwrap().remove(&tag);
            }),
            event: Some(Arc::new(move |event| {
                events.lock().unwrap().push(format!("{:?}", event));
            })),
        });
    }

    let (r, w) = unistd::pipe().unwrap();
    unistd::write(w, b"x").unwrap();

    let tags = Arc::new(Mutex::new(Vec::new()));
    let consumed = Arc::new(Mutex::new(Vec::new()));
    {
        let tags_for_cb = tags.clone();
        let consumed = consumed.clone();
        let tag = add_io_cb_user(
            &ctx,
            r,
            Direction::Read,
            Arc::new(move |fd| {
                let mut buf = [0u8; 1];
                unistd::read(fd, &mut buf).map_err(sys_err)?;
                consumed.lock().unwrap().push(fd);
                let mut tags = tags_for_cb.lock().unwrap();
                if let Some(pos) = tags.iter().position(|t: &IoCbTag| t.fd() == fd) {
                    let tag = tags.remove(pos);
                    drop(tags);
                    keymux::remove_io_cb_user(tag);
                }
                Ok(())
            }),
        )
        .unwrap();
        tags.lock().unwrap().push(tag);
    }

    // The application sees readiness on the pipe and drives the wrapper.
    let wrapper = registered.lock().unwrap().get(&(r as UserTag)).unwrap().clone();
    wrapper(r).unwrap();

    assert_eq!(consumed.lock().unwrap().clone(), vec![r]);
    assert!(registered.lock().unwrap().is_empty());
    assert_eq!(FdTable::global().io_cb_count(ctx.serial()), 0);
    let events = events.lock().unwrap();
    assert!(events.iter().any(|event| event.contains("Done")));

    for fd in [r, w].iter() {
        let _ = unistd::close(*fd);
    }
}

#[test]
fn user_loop_rolls_back_when_the_application_rejects_the_fd() {
    let _guard = test_lock();
    let ctx = Context::new(LoopKind::User);
    ctx.set_user_io_cbs(UserIoCbs {
        add: Arc::new(|_, _, _| Err(Error::InvalidArgument("loop is full"))),
        remove: Arc::new(|_| {}),
        event: None,
    });

    let result = add_io_cb_user(&ctx, 803, Direction::Read, Arc::new(|_| Ok(())));
    assert_eq!(result.err(), Some(Error::InvalidArgument("loop is full")));
    // No partial registration persists.
    assert_eq!(FdTable::global().io_cb_count(ctx.serial()), 0);
}

#[test]
fn a_raised_condition_ends_the_private_wait() {
    let _guard = test_lock();
    let ctx = Context::new(LoopKind::Private);
    ctx.set_engine(TestEngine::new(true));
    let (r, w) = unistd::pipe().unwrap();
    // Never made ready: only the condition can end this wait.
    let tag = add_io_cb(&ctx, r, Direction::Read, Arc::new(|_| Ok(()))).unwrap();

    let cond = Arc::new(std::sync::atomic::AtomicBool::new(false));
    let raiser = {
        let cond = cond.clone();
        std::thread::spawn(move || {
            std::thread::sleep(std::time::Duration::from_millis(100));
            cond.store(true, std::sync::atomic::Ordering::Relaxed);
        })
    };

    assert_eq!(wait_on_condition(&ctx, Some(&cond)), Ok(None));
    // The operation itself is still in flight.
    assert_eq!(FdTable::global().io_cb_count(ctx.serial()), 1);
    raiser.join().unwrap();

    remove_io_cb(tag);
    for fd in [r, w].iter() {
        let _ = unistd::close(*fd);
    }
}

#[test]
fn selector_failure_cancels_the_private_context() {
    let _guard = test_lock();
    let ctx = Context::new(LoopKind::Private);
    let engine = TestEngine::new(false);
    ctx.set_engine(engine.clone());

    let (r, w) = unistd::pipe().unwrap();
    unistd::close(r).unwrap();
    unistd::close(w).unwrap();
    // The fd is stale by the time the selector sees it.
    add_io_cb(&ctx, r, Direction::Read, Arc::new(|_| Ok(()))).unwrap();

    assert_eq!(
        wait_on_condition(&ctx, None),
        Err(Error::System(Errno::EBADF))
    );
    assert_eq!(FdTable::global().io_cb_count(ctx.serial()), 0);
    assert_eq!(engine.closed_fds(), vec![r]);

    // Consume the terminal state the cancellation recorded.
    let done = FdTable::global().get_done(ctx.serial()).unwrap();
    assert_eq!(done.err, Some(Error::System(Errno::EBADF)));
}
