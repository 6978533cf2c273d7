use eddy::{EventLoop, LoopHandle};

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{mpsc, Arc};
use std::thread;
use std::time::{Duration, Instant};

/// Runs a loop in its own thread and hands back its handle plus the
/// thread's join handle.
fn spawn_loop() -> (LoopHandle, thread::JoinHandle<()>) {
    let (tx, rx) = mpsc::channel();
    let join = thread::spawn(move || {
        let event_loop = EventLoop::new();
        tx.send(event_loop.handle())
            .expect("Failed to hand the loop handle back");
        event_loop.run();
    });
    let handle = rx.recv().expect("Loop thread died before handing a handle");
    (handle, join)
}

#[test]
#[should_panic(expected = "another EventLoop")]
fn second_loop_on_one_thread_panics() {
    let _first = EventLoop::new();
    let _second = EventLoop::new();
}

#[test]
fn loops_on_distinct_threads_coexist() {
    let (h1, j1) = spawn_loop();
    let (h2, j2) = spawn_loop();

    h1.quit();
    h2.quit();
    j1.join().expect("First loop thread panicked");
    j2.join().expect("Second loop thread panicked");
}

#[test]
fn a_thread_may_host_a_new_loop_after_its_old_one_is_dropped() {
    {
        let _old = EventLoop::new();
    }
    let _new = EventLoop::new();
}

#[test]
fn run_in_loop_from_the_loop_thread_is_synchronous() {
    let event_loop = EventLoop::new();

    let ran = Arc::new(AtomicBool::new(false));
    let r = ran.clone();
    event_loop.run_in_loop(move || r.store(true, Ordering::SeqCst));

    assert!(
        ran.load(Ordering::SeqCst),
        "task from the loop thread must run before run_in_loop returns"
    );
}

#[test]
fn cross_thread_task_runs_on_the_loop_thread_promptly() {
    let (handle, join) = spawn_loop();

    let (tx, rx) = mpsc::channel();
    let submitted = Instant::now();
    handle.run_in_loop(move || {
        tx.send((thread::current().id(), Instant::now()))
            .expect("Failed to report task execution");
    });

    let (ran_on, ran_at) = rx
        .recv_timeout(Duration::from_secs(5))
        .expect("Cross-thread task never ran");

    assert!(!handle.is_in_loop_thread());
    assert_ne!(ran_on, thread::current().id(), "task must run on the loop thread");
    // The poll timeout is ten seconds; the wakeup must not let the task
    // wait it out.
    assert!(
        ran_at - submitted < Duration::from_secs(1),
        "wakeup failed to cut the poll short"
    );

    handle.quit();
    join.join().expect("Loop thread panicked");
}

#[test]
fn task_queued_during_drain_runs_in_the_next_iteration() {
    let event_loop = EventLoop::new();
    let handle = event_loop.handle();

    let first_iteration = Arc::new(AtomicU64::new(0));
    let second_iteration = Arc::new(AtomicU64::new(0));

    // A task queued from the loop thread before `run` does not write the
    // wakeup; give the first poll a nearby timer to return on.
    event_loop.run_after(Duration::from_millis(5), || {});

    let fi = first_iteration.clone();
    let si = second_iteration.clone();
    let h = handle.clone();
    event_loop.queue_in_loop(move || {
        let current = EventLoop::current().expect("Task runs on the loop thread");
        fi.store(current.iteration(), Ordering::SeqCst);

        let si = si.clone();
        let h = h.clone();
        current.queue_in_loop(move || {
            let current = EventLoop::current().expect("Task runs on the loop thread");
            si.store(current.iteration(), Ordering::SeqCst);
            h.quit();
        });
    });

    event_loop.run();

    let first = first_iteration.load(Ordering::SeqCst);
    let second = second_iteration.load(Ordering::SeqCst);
    assert_eq!(
        second,
        first + 1,
        "a task queued mid-drain belongs to the following iteration"
    );
}

#[test]
fn quit_from_a_task_finishes_the_current_drain_first() {
    let event_loop = EventLoop::new();
    let handle = event_loop.handle();

    let later_task_ran = Arc::new(AtomicBool::new(false));

    // Unblock the first poll; see task_queued_during_drain_runs_in_the_next_iteration.
    event_loop.run_after(Duration::from_millis(5), || {});

    let h = handle.clone();
    event_loop.queue_in_loop(move || h.quit());
    let r = later_task_ran.clone();
    event_loop.queue_in_loop(move || r.store(true, Ordering::SeqCst));

    event_loop.run();

    assert!(
        later_task_ran.load(Ordering::SeqCst),
        "tasks behind the quit in the same drain still run"
    );
}

#[test]
fn tasks_run_in_submission_order() {
    let event_loop = EventLoop::new();
    let handle = event_loop.handle();

    let order = Arc::new(std::sync::Mutex::new(Vec::new()));

    // Unblock the first poll; see task_queued_during_drain_runs_in_the_next_iteration.
    event_loop.run_after(Duration::from_millis(5), || {});

    for i in 0..8 {
        let order = order.clone();
        event_loop.queue_in_loop(move || order.lock().expect("Order mutex poisoned").push(i));
    }
    let h = handle.clone();
    event_loop.queue_in_loop(move || h.quit());

    event_loop.run();

    let order = order.lock().expect("Order mutex poisoned");
    assert_eq!(*order, (0..8).collect::<Vec<_>>());
}

#[test]
fn iteration_counter_and_poll_return_time_advance() {
    let event_loop = EventLoop::new();
    let handle = event_loop.handle();

    assert_eq!(event_loop.iteration(), 0);
    let created = Instant::now();

    let h = handle.clone();
    event_loop.run_after(Duration::from_millis(20), move || h.quit());
    event_loop.run();

    assert!(event_loop.iteration() >= 1);
    assert!(event_loop.poll_return_time() >= created);
}

#[test]
fn handle_reports_loop_thread_membership() {
    let event_loop = EventLoop::new();
    let handle = event_loop.handle();

    assert!(handle.is_in_loop_thread());
    assert!(event_loop.is_in_loop_thread());

    let h = handle.clone();
    let probe = thread::spawn(move || h.is_in_loop_thread());
    assert!(!probe.join().expect("Probe thread panicked"));
}

#[test]
fn many_threads_can_push_work_into_one_loop() {
    let (handle, join) = spawn_loop();

    let counter = Arc::new(AtomicU64::new(0));
    let pushers: Vec<_> = (0..4)
        .map(|_| {
            let handle = handle.clone();
            let counter = counter.clone();
            thread::spawn(move || {
                for _ in 0..100 {
                    let counter = counter.clone();
                    handle.run_in_loop(move || {
                        counter.fetch_add(1, Ordering::SeqCst);
                    });
                }
            })
        })
        .collect();

    for pusher in pushers {
        pusher.join().expect("Pusher thread panicked");
    }

    // Drain whatever is still queued, then stop.
    let (tx, rx) = mpsc::channel();
    handle.run_in_loop(move || {
        tx.send(()).expect("Failed to signal drain completion");
    });
    rx.recv_timeout(Duration::from_secs(5))
        .expect("Loop never drained the queued work");

    handle.quit();
    join.join().expect("Loop thread panicked");

    assert_eq!(counter.load(Ordering::SeqCst), 400);
}
