use crate::common::{prepare_debugee_process, occupy_hw_slots, DebugeeRunInfo, TestHooks};
use crate::{assert_no_proc, fixture_or_skip};
use gostalker::debugger::breakpoint::BreakpointKind;
use gostalker::debugger::{Debugger, Error};
use serial_test::serial;

#[test]
#[serial]
fn test_exit() {
    let fixture = fixture_or_skip!("continuetestprog");
    let process = prepare_debugee_process(&fixture, &[]);
    let info = DebugeeRunInfo::default();
    let mut debugger = Debugger::new(process, TestHooks::new(info.clone())).unwrap();
    let debugee_pid = debugger.pid();

    let err = debugger.continue_execution().unwrap_err();
    match err {
        Error::ProcessExited { pid, status } => {
            assert_eq!(pid, debugee_pid);
            assert_eq!(status, 0);
        }
        other => panic!("unexpected error: {other}"),
    }
    assert_eq!(info.exit_code.take(), Some(0));
    assert!(debugger.exited());
    assert_no_proc!(debugee_pid);
}

#[test]
#[serial]
fn test_breakpoint_set_and_hit() {
    let fixture = fixture_or_skip!("testprog");
    let process = prepare_debugee_process(&fixture, &[]);
    let info = DebugeeRunInfo::default();
    let mut debugger = Debugger::new(process, TestHooks::new(info.clone())).unwrap();

    let addr = debugger.resolve_location("main.helloworld").unwrap();
    debugger.set_breakpoint(addr).unwrap();
    debugger.continue_execution().unwrap();

    // the engine rewinds PC after a software hit, a hardware hit stops exactly
    // on the address
    assert_eq!(debugger.current_pc().unwrap(), addr);
    assert!(matches!(info.line.take(), Some(8) | Some(9)));

    let bp = debugger.current_breakpoint().unwrap();
    assert_eq!(bp.addr, addr);
    assert_eq!(bp.function_name.as_deref(), Some("main.helloworld"));
}

#[test]
#[serial]
fn test_clear_restores_bytes() {
    let fixture = fixture_or_skip!("testprog");
    let process = prepare_debugee_process(&fixture, &[]);
    let mut debugger = Debugger::new(process, TestHooks::default()).unwrap();

    let addr = debugger.resolve_location("main.helloworld").unwrap();
    let original = debugger.read_memory(addr.as_usize(), 1).unwrap();

    debugger.set_breakpoint(addr).unwrap();
    debugger.continue_execution().unwrap();

    debugger.clear_breakpoint(addr).unwrap();
    let restored = debugger.read_memory(addr.as_usize(), 1).unwrap();
    assert_ne!(restored[0], 0xCC);
    assert_eq!(restored, original);
}

#[test]
#[serial]
fn test_software_breakpoint_patches_opcode() {
    let fixture = fixture_or_skip!("testprog");
    let process = prepare_debugee_process(&fixture, &[]);
    let mut debugger = Debugger::new(process, TestHooks::default()).unwrap();

    occupy_hw_slots(&mut debugger, ["main.f1", "main.f2", "main.f3", "main.f4"]);

    let addr = debugger.resolve_location("main.f5").unwrap();
    let original = debugger.read_memory(addr.as_usize(), 1).unwrap();
    let id = debugger.set_breakpoint(addr).unwrap();

    let bp = debugger
        .breakpoints_snapshot()
        .into_iter()
        .find(|bp| bp.id == id && !bp.temp)
        .unwrap();
    assert!(matches!(bp.kind, BreakpointKind::Software { .. }));

    // the opcode is installed while the breakpoint is set, and the original
    // bytes return on clear
    let patched = debugger.read_memory(addr.as_usize(), 1).unwrap();
    assert_eq!(patched[0], 0xCC);

    debugger.clear_breakpoint(addr).unwrap();
    let restored = debugger.read_memory(addr.as_usize(), 1).unwrap();
    assert_eq!(restored, original);
}

#[test]
#[serial]
fn test_breakpoint_at_invalid_address() {
    let fixture = fixture_or_skip!("testprog");
    let process = prepare_debugee_process(&fixture, &[]);
    let mut debugger = Debugger::new(process, TestHooks::default()).unwrap();

    let err = debugger.set_breakpoint(0_usize.into()).unwrap_err();
    assert!(matches!(err, Error::InvalidAddress(_)));
}

#[test]
#[serial]
fn test_duplicate_breakpoint() {
    let fixture = fixture_or_skip!("testprog");
    let process = prepare_debugee_process(&fixture, &[]);
    let mut debugger = Debugger::new(process, TestHooks::default()).unwrap();

    let addr = debugger.resolve_location("main.helloworld").unwrap();
    debugger.set_breakpoint(addr).unwrap();
    let err = debugger.set_breakpoint(addr).unwrap_err();
    assert!(matches!(err, Error::BreakpointExists(_)));
}

#[test]
#[serial]
fn test_breakpoint_ids_are_unique_and_monotonic() {
    let fixture = fixture_or_skip!("testprog");
    let process = prepare_debugee_process(&fixture, &[]);
    let mut debugger = Debugger::new(process, TestHooks::default()).unwrap();

    let mut ids = vec![];
    for name in ["main.f1", "main.f2", "main.f3", "main.f4", "main.f5"] {
        ids.push(debugger.set_breakpoint_at_fn(name).unwrap());
    }
    assert!(ids.windows(2).all(|w| w[0] < w[1]));

    // ids are never reused after a clear
    let addr = debugger.resolve_location("main.f3").unwrap();
    debugger.clear_breakpoint(addr).unwrap();
    let new_id = debugger.set_breakpoint(addr).unwrap();
    assert!(ids.iter().all(|&id| id < new_id));
}

#[test]
#[serial]
fn test_continue_multi() {
    let fixture = fixture_or_skip!("integrationprog");
    let process = prepare_debugee_process(&fixture, &[]);
    let mut debugger = Debugger::new(process, TestHooks::default()).unwrap();
    let debugee_pid = debugger.pid();

    let bp_main = debugger.set_breakpoint_at_fn("main.main").unwrap();
    let bp_sayhi = debugger.set_breakpoint_at_fn("main.sayhi").unwrap();

    let mut main_count = 0;
    let mut sayhi_count = 0;
    loop {
        match debugger.continue_execution() {
            Ok(()) => {}
            Err(Error::ProcessExited { .. }) => break,
            Err(e) => panic!("continue failed: {e}"),
        }
        match debugger.current_breakpoint().map(|bp| bp.id) {
            Some(id) if id == bp_main => main_count += 1,
            Some(id) if id == bp_sayhi => sayhi_count += 1,
            _ => {}
        }
    }

    assert_eq!(main_count, 1);
    assert_eq!(sayhi_count, 3);
    assert_no_proc!(debugee_pid);
}
