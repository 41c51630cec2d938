//! Timer behavior over a live loop: one-shot and periodic native timers,
//! coarse-timer coalescing and reentrancy, multiplexed dispatch.

use io_reactor::{CoarseTimer, Error, MultiplexedTimer, Reactor, Timer};
use std::cell::{Cell, RefCell};
use std::rc::Rc;
use std::time::{Duration, Instant};

fn run_until(reactor: &Reactor, done: impl Fn() -> bool + 'static) {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .try_init();
    let watchdog = Timer::create(reactor).unwrap();
    let handle = reactor.clone();
    let start = Instant::now();
    watchdog
        .start(Duration::from_millis(5), true, move || {
            if done() || start.elapsed() > Duration::from_secs(5) {
                handle.stop();
            }
        })
        .unwrap();
    reactor.run();
}

#[test]
fn test_one_shot_fires_once() {
    let reactor = Reactor::create().unwrap();
    let fired = Rc::new(Cell::new(0u32));

    let timer = Timer::create(&reactor).unwrap();
    let count = fired.clone();
    timer
        .start(Duration::from_millis(10), false, move || {
            count.set(count.get() + 1);
        })
        .unwrap();

    // give it room to misfire a second time
    let deadline = Instant::now() + Duration::from_millis(100);
    run_until(&reactor, move || Instant::now() > deadline);
    assert_eq!(fired.get(), 1);
}

#[test]
fn test_periodic_fires_repeatedly() {
    let reactor = Reactor::create().unwrap();
    let fired = Rc::new(Cell::new(0u32));

    let timer = Timer::create(&reactor).unwrap();
    let count = fired.clone();
    timer
        .start(Duration::from_millis(10), true, move || {
            count.set(count.get() + 1);
        })
        .unwrap();

    let count = fired.clone();
    run_until(&reactor, move || count.get() >= 3);
    assert!(fired.get() >= 3);
}

#[test]
fn test_cancel_before_fire() {
    let reactor = Reactor::create().unwrap();
    let fired = Rc::new(Cell::new(false));

    let timer = Timer::create(&reactor).unwrap();
    let flag = fired.clone();
    timer
        .start(Duration::from_millis(50), false, move || {
            flag.set(true);
        })
        .unwrap();
    timer.cancel();

    let deadline = Instant::now() + Duration::from_millis(150);
    run_until(&reactor, move || Instant::now() > deadline);
    assert!(!fired.get());
}

#[test]
fn test_coarse_timer_coalesces_in_order() {
    let reactor = Reactor::create().unwrap();
    let fired: Rc<RefCell<Vec<u64>>> = Rc::new(RefCell::new(Vec::new()));

    let order = fired.clone();
    let coarse = CoarseTimer::create(&reactor, Duration::from_millis(20), move |id| {
        order.borrow_mut().push(id);
    })
    .unwrap();

    coarse.set_timer(Duration::from_millis(10), 1).unwrap();
    coarse.set_timer(Duration::from_millis(30), 2).unwrap();
    coarse.set_timer(Duration::from_millis(50), 3).unwrap();
    coarse.cancel(2);

    let seen = fired.clone();
    run_until(&reactor, move || seen.borrow().len() >= 2);
    assert_eq!(*fired.borrow(), vec![1, 3]);
    assert_eq!(coarse.pending(), 0);
}

#[test]
fn test_coarse_timer_rejects_duplicate_id() {
    let reactor = Reactor::create().unwrap();
    let coarse = CoarseTimer::create(&reactor, Duration::from_millis(20), |_| {}).unwrap();

    coarse.set_timer(Duration::from_millis(40), 7).unwrap();
    assert!(matches!(
        coarse.set_timer(Duration::from_millis(80), 7),
        Err(Error::InvalidArgument(_))
    ));
    coarse.cancel(7);
    coarse.set_timer(Duration::from_millis(40), 7).unwrap();
}

#[test]
fn test_coarse_timer_reschedule_from_callback() {
    let reactor = Reactor::create().unwrap();
    let fired = Rc::new(Cell::new(0u32));
    let slot: Rc<RefCell<Option<CoarseTimer>>> = Rc::new(RefCell::new(None));

    let count = fired.clone();
    let rearm = slot.clone();
    let coarse = CoarseTimer::create(&reactor, Duration::from_millis(10), move |id| {
        count.set(count.get() + 1);
        if count.get() == 1 {
            // entry was erased before this ran, so the same id rearms cleanly
            let guard = rearm.borrow();
            guard
                .as_ref()
                .unwrap()
                .set_timer(Duration::from_millis(10), id)
                .unwrap();
        }
    })
    .unwrap();
    coarse.set_timer(Duration::from_millis(10), 42).unwrap();
    *slot.borrow_mut() = Some(coarse);

    let count = fired.clone();
    run_until(&reactor, move || count.get() >= 2);
    assert_eq!(fired.get(), 2);
}

#[test]
fn test_multiplexed_timer_dispatches_per_id() {
    let reactor = Reactor::create().unwrap();
    let fired: Rc<RefCell<Vec<&'static str>>> = Rc::new(RefCell::new(Vec::new()));

    let mux = MultiplexedTimer::create(&reactor, Duration::from_millis(10)).unwrap();
    let first = fired.clone();
    mux.set_timer(Duration::from_millis(10), 1, move |_| {
        first.borrow_mut().push("first");
    })
    .unwrap();
    let second = fired.clone();
    mux.set_timer(Duration::from_millis(30), 2, move |_| {
        second.borrow_mut().push("second");
    })
    .unwrap();
    let third = fired.clone();
    mux.set_timer(Duration::from_millis(50), 3, move |_| {
        third.borrow_mut().push("cancelled");
    })
    .unwrap();
    mux.cancel(3);

    let seen = fired.clone();
    run_until(&reactor, move || seen.borrow().len() >= 2);
    assert_eq!(*fired.borrow(), vec!["first", "second"]);
}
