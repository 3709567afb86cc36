use crate::common::{prepare_debugee_process, DebugeeRunInfo, TestHooks};
use crate::fixture_or_skip;
use gostalker::debugger::Debugger;
use serial_test::serial;

#[test]
#[serial]
fn test_step_advances_pc() {
    let fixture = fixture_or_skip!("testprog");
    let process = prepare_debugee_process(&fixture, &[]);
    let mut debugger = Debugger::new(process, TestHooks::default()).unwrap();

    debugger.set_breakpoint_at_fn("main.helloworld").unwrap();
    debugger.continue_execution().unwrap();

    let pc_before = debugger.current_pc().unwrap();
    debugger.step().unwrap();
    let pc_after = debugger.current_pc().unwrap();

    assert!(
        pc_after > pc_before,
        "expected {pc_after} to be greater than {pc_before}"
    );
}

#[test]
#[serial]
fn test_next_straight_line() {
    let fixture = fixture_or_skip!("testnextprog");
    let process = prepare_debugee_process(&fixture, &[]);
    let info = DebugeeRunInfo::default();
    let mut debugger = Debugger::new(process, TestHooks::new(info.clone())).unwrap();

    debugger.set_breakpoint_at_fn("main.testnext").unwrap();
    debugger.continue_execution().unwrap();

    // straight-line body: stepping over line N lands on line N+1
    let testcases: [(u64, u64); 8] = [
        (16, 17),
        (17, 18),
        (18, 19),
        (19, 20),
        (20, 21),
        (21, 22),
        (22, 23),
        (23, 24),
    ];

    let mut line = info.line.take().expect("stopped with line info");
    for (begin, end) in testcases {
        assert_eq!(line, begin, "program is not stopped at the expected line");

        debugger.next().unwrap();
        line = info.line.take().expect("stopped with line info");
        assert_eq!(line, end, "next did not reach the expected line");

        // no temporary breakpoint survives a next
        assert!(debugger.breakpoints_snapshot().iter().all(|bp| !bp.temp));
    }

    // stepping over the last call leaves the function, landing either on the
    // closing line or back in the caller
    debugger.next().unwrap();
    let line = info.line.take().expect("stopped with line info");
    assert!(
        matches!(line, 25 | 37 | 38),
        "unexpected line {line} after stepping out of the function"
    );
}

#[test]
#[serial]
fn test_next_over_loop() {
    let fixture = fixture_or_skip!("testnextprog");
    let process = prepare_debugee_process(&fixture, &[]);
    let info = DebugeeRunInfo::default();
    let mut debugger = Debugger::new(process, TestHooks::new(info.clone())).unwrap();

    debugger.set_breakpoint_at_fn("main.loopnext").unwrap();
    debugger.continue_execution().unwrap();

    // step over lines until the loop is passed, the loop body must be visited
    // several times and stepping must never leave the source file
    let mut body_visits = 0;
    let mut reached_after_loop = false;
    for _ in 0..25 {
        debugger.next().unwrap();
        let line = info.line.take().expect("stopped with line info");
        let file = info.file.take().expect("stopped with file info");
        assert!(
            file.ends_with("testnextprog.go"),
            "stepped into a foreign file: {file}"
        );
        if line == 30 {
            body_visits += 1;
        }
        if line == 32 {
            reached_after_loop = true;
            break;
        }
    }

    assert!(reached_after_loop, "the loop was never stepped over");
    assert!(body_visits >= 2, "loop body seen {body_visits} times");
}
