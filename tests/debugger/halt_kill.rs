use crate::common::{prepare_debugee_process, TestHooks};
use crate::{assert_no_proc, fixture_or_skip};
use gostalker::debugger::thread::ThreadStatus;
use gostalker::debugger::Debugger;
use serial_test::serial;
use std::time::Duration;

#[test]
#[serial]
fn test_halt_is_idempotent() {
    let fixture = fixture_or_skip!("testprog");
    let process = prepare_debugee_process(&fixture, &[]);
    let mut debugger = Debugger::new(process, TestHooks::default()).unwrap();

    debugger.set_breakpoint_at_fn("main.helloworld").unwrap();
    debugger.continue_execution().unwrap();

    debugger.halt().unwrap();
    debugger.halt().unwrap();

    for snap in debugger.thread_state() {
        assert_eq!(snap.thread.status, ThreadStatus::Stopped);
    }
    assert!(!debugger.running());
}

#[test]
#[serial]
fn test_manual_stop() {
    let fixture = fixture_or_skip!("loopprog");
    let process = prepare_debugee_process(&fixture, &[]);
    let mut debugger = Debugger::new(process, TestHooks::default()).unwrap();

    let handle = debugger.manual_stop_handle();
    let stopper = std::thread::spawn(move || {
        std::thread::sleep(Duration::from_millis(300));
        handle.request_stop();
    });

    // without breakpoints only the manual stop can end this wait
    debugger.continue_execution().unwrap();
    stopper.join().unwrap();

    assert!(!debugger.running());
    assert!(!debugger.exited());
    for snap in debugger.thread_state() {
        assert_eq!(snap.thread.status, ThreadStatus::Stopped);
    }
}

#[test]
#[serial]
fn test_kill() {
    let fixture = fixture_or_skip!("testprog");
    let process = prepare_debugee_process(&fixture, &[]);
    let mut debugger = Debugger::new(process, TestHooks::default()).unwrap();
    let debugee_pid = debugger.pid();

    debugger.set_breakpoint_at_fn("main.sleepytime").unwrap();
    debugger.continue_execution().unwrap();

    debugger.kill().unwrap();
    assert!(debugger.exited());

    #[cfg(target_os = "linux")]
    assert!(!std::path::Path::new(&format!("/proc/{debugee_pid}/")).exists());
    assert_no_proc!(debugee_pid);
}

#[test]
#[serial]
fn test_operations_fail_after_exit() {
    let fixture = fixture_or_skip!("continuetestprog");
    let process = prepare_debugee_process(&fixture, &[]);
    let mut debugger = Debugger::new(process, TestHooks::default()).unwrap();

    let _ = debugger.continue_execution().unwrap_err();
    assert!(debugger.exited());

    let err = debugger.continue_execution().unwrap_err();
    assert!(matches!(
        err,
        gostalker::debugger::Error::ProcessExited { .. }
    ));
}
