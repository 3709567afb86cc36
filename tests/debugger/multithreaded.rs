use crate::common::{occupy_hw_slots, prepare_debugee_process, DebugeeRunInfo, TestHooks};
use crate::{assert_no_proc, fixture_or_skip};
use gostalker::debugger::{Debugger, Error};
use serial_test::serial;

#[test]
#[serial]
fn test_breakpoint_in_spawned_task() {
    let fixture = fixture_or_skip!("mtprog");
    let process = prepare_debugee_process(&fixture, &[]);
    let info = DebugeeRunInfo::default();
    let mut debugger = Debugger::new(process, TestHooks::new(info.clone())).unwrap();
    let debugee_pid = debugger.pid();

    // workers may land on threads spawned after the set, the breakpoint under
    // test must be a software one
    occupy_hw_slots(
        &mut debugger,
        ["main.pad1", "main.pad2", "main.pad3", "main.pad4"],
    );
    let worker_bp = debugger.set_breakpoint_at_fn("main.worker").unwrap();

    let mut worker_hits = 0;
    loop {
        match debugger.continue_execution() {
            Ok(()) => {}
            Err(Error::ProcessExited { .. }) => break,
            Err(e) => panic!("continue failed: {e}"),
        }
        if debugger.current_breakpoint().map(|bp| bp.id) == Some(worker_bp) {
            worker_hits += 1;
            assert_eq!(info.line.take(), Some(13));
        }
    }

    // simultaneous hits on different threads coalesce into one stop,
    // so the count may be below the number of workers
    assert!((1..=4).contains(&worker_hits), "worker hits: {worker_hits}");
    assert_no_proc!(debugee_pid);
}

#[test]
#[serial]
fn test_backtrace_of_stopped_thread() {
    let fixture = fixture_or_skip!("mtprog");
    let process = prepare_debugee_process(&fixture, &[]);
    let mut debugger = Debugger::new(process, TestHooks::default()).unwrap();

    occupy_hw_slots(
        &mut debugger,
        ["main.pad1", "main.pad2", "main.pad3", "main.pad4"],
    );
    debugger.set_breakpoint_at_fn("main.worker").unwrap();
    debugger.continue_execution().unwrap();

    let tid = debugger.current_thread();
    let backtrace = debugger.backtrace(tid, 40).unwrap();
    assert_eq!(backtrace[0].func_name.as_deref(), Some("main.worker"));
}

#[test]
#[serial]
fn test_thread_listing_and_switch() {
    let fixture = fixture_or_skip!("mtprog");
    let process = prepare_debugee_process(&fixture, &[]);
    let mut debugger = Debugger::new(process, TestHooks::default()).unwrap();

    occupy_hw_slots(
        &mut debugger,
        ["main.pad1", "main.pad2", "main.pad3", "main.pad4"],
    );
    debugger.set_breakpoint_at_fn("main.worker").unwrap();
    debugger.continue_execution().unwrap();

    // switching to an unknown thread fails
    let err = debugger
        .switch_thread(nix::unistd::Pid::from_raw(-1))
        .unwrap_err();
    assert!(matches!(err, Error::NoSuchThread(_)));

    // switching to any listed thread moves the focus
    let current = debugger.current_thread();
    let snapshots = debugger.thread_state();
    assert!(snapshots.iter().any(|s| s.in_focus));
    if let Some(other) = snapshots
        .iter()
        .find(|s| s.thread.pid != current)
        .map(|s| s.thread.pid)
    {
        debugger.switch_thread(other).unwrap();
        assert_eq!(debugger.current_thread(), other);
    }
}
