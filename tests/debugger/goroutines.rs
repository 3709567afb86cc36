use crate::common::{occupy_hw_slots, prepare_debugee_process, TestHooks};
use crate::fixture_or_skip;
use gostalker::debugger::unwind::Backtrace;
use gostalker::debugger::Debugger;
use serial_test::serial;

fn backtrace_contains_fn(backtrace: &Backtrace, f_name: &str) -> bool {
    backtrace.iter().any(|frame| {
        frame
            .func_name
            .as_ref()
            .map(|f| f.contains(f_name))
            .unwrap_or(false)
    })
}

#[test]
#[serial]
fn test_task_listing_and_stacks() {
    let fixture = fixture_or_skip!("goroutinestackprog");
    let process = prepare_debugee_process(&fixture, &[]);
    let mut debugger = Debugger::new(process, TestHooks::default()).unwrap();

    occupy_hw_slots(
        &mut debugger,
        ["main.pad1", "main.pad2", "main.pad3", "main.pad4"],
    );
    debugger.set_breakpoint_at_fn("main.stacktraceme").unwrap();
    debugger.continue_execution().unwrap();

    let tasks = debugger.goroutines().unwrap();
    // ten spawned tasks plus the main task plus runtime internals
    assert!(tasks.len() >= 11, "only {} tasks found", tasks.len());
    assert!(tasks.iter().any(|t| t.thread.is_some()));

    let mut main_count = 0;
    let mut spawned_count = 0;
    for task in &tasks {
        let Ok(backtrace) = debugger.goroutine_stacktrace(task, 40) else {
            continue;
        };
        if backtrace_contains_fn(&backtrace, "main.stacktraceme")
            && backtrace_contains_fn(&backtrace, "main.main")
        {
            main_count += 1;
        }
        if backtrace_contains_fn(&backtrace, "main.agoroutine")
            && backtrace_contains_fn(&backtrace, "chansend")
        {
            spawned_count += 1;
        }
    }

    assert_eq!(main_count, 1, "main task stack not found exactly once");
    assert!(
        (1..=10).contains(&spawned_count),
        "spawned task stacks found: {spawned_count}"
    );
}

#[test]
#[serial]
fn test_current_task_of_focused_thread() {
    let fixture = fixture_or_skip!("goroutinestackprog");
    let process = prepare_debugee_process(&fixture, &[]);
    let mut debugger = Debugger::new(process, TestHooks::default()).unwrap();

    occupy_hw_slots(
        &mut debugger,
        ["main.pad1", "main.pad2", "main.pad3", "main.pad4"],
    );
    debugger.set_breakpoint_at_fn("main.stacktraceme").unwrap();
    debugger.continue_execution().unwrap();

    let focus = debugger.current_thread();
    let tasks = debugger.goroutines().unwrap();
    let current = tasks
        .iter()
        .find(|t| t.thread == Some(focus))
        .expect("some task runs on the focused thread");
    assert!(current.id > 0);
}
