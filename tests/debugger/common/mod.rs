use gostalker::debugger::address::RelocatedAddress;
use gostalker::debugger::process::{Child, Template};
use gostalker::debugger::{Debugger, EventHook, PlaceDescriptorOwned};
use nix::sys::signal::Signal;
use once_cell::sync::Lazy;
use std::cell::Cell;
use std::collections::HashMap;
use std::io;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::sync::{Arc, Mutex};

/// Last stop position observed through the engine hooks.
#[derive(Clone, Default)]
pub struct DebugeeRunInfo {
    pub line: Arc<Cell<Option<u64>>>,
    pub file: Arc<Cell<Option<String>>>,
    pub exit_code: Arc<Cell<Option<i32>>>,
}

#[derive(Default)]
pub struct TestHooks {
    info: DebugeeRunInfo,
}

impl TestHooks {
    pub fn new(info: DebugeeRunInfo) -> Self {
        Self { info }
    }
}

impl EventHook for TestHooks {
    fn on_breakpoint(
        &self,
        _pc: RelocatedAddress,
        place: Option<PlaceDescriptorOwned>,
    ) -> anyhow::Result<()> {
        self.info
            .file
            .set(place.as_ref().map(|p| p.file.to_string_lossy().to_string()));
        self.info.line.set(place.map(|p| p.line_number));
        Ok(())
    }

    fn on_step(
        &self,
        _pc: RelocatedAddress,
        place: Option<PlaceDescriptorOwned>,
    ) -> anyhow::Result<()> {
        self.info
            .file
            .set(place.as_ref().map(|p| p.file.to_string_lossy().to_string()));
        self.info.line.set(place.map(|p| p.line_number));
        Ok(())
    }

    fn on_signal(&self, _: Signal) {}

    fn on_exit(&self, code: i32) {
        self.info.exit_code.set(Some(code));
    }
}

static GO_TOOLCHAIN: Lazy<bool> = Lazy::new(|| {
    Command::new("go")
        .arg("version")
        .output()
        .map(|out| out.status.success())
        .unwrap_or(false)
});

static BUILT_FIXTURES: Lazy<Mutex<HashMap<String, PathBuf>>> =
    Lazy::new(|| Mutex::new(HashMap::new()));

/// Compile a Go fixture program without optimizations and inlining.
/// Returns `None` when the Go toolchain is not installed.
pub fn build_fixture(name: &str) -> Option<PathBuf> {
    if !*GO_TOOLCHAIN {
        return None;
    }

    let mut built = BUILT_FIXTURES.lock().unwrap();
    if let Some(path) = built.get(name) {
        return Some(path.clone());
    }

    let src = PathBuf::from(env!("CARGO_MANIFEST_DIR"))
        .join("fixtures")
        .join(format!("{name}.go"));
    let out = PathBuf::from(env!("CARGO_TARGET_TMPDIR")).join(name);

    let status = Command::new("go")
        .arg("build")
        .arg("-gcflags=all=-N -l")
        .arg("-o")
        .arg(&out)
        .arg(&src)
        .status()
        .ok()?;
    if !status.success() {
        return None;
    }

    built.insert(name.to_string(), out.clone());
    Some(out)
}

/// Compile the fixture or skip the whole test when the toolchain is missing.
#[macro_export]
macro_rules! fixture_or_skip {
    ($name:expr) => {
        match $crate::common::build_fixture($name) {
            Some(path) => path,
            None => {
                eprintln!("skipping: go toolchain is not available");
                return;
            }
        }
    };
}

#[macro_export]
macro_rules! assert_no_proc {
    ($pid:expr) => {
        let sys = sysinfo::System::new_all();
        assert!(sys
            .process(sysinfo::Pid::from_u32($pid.as_raw() as u32))
            .is_none())
    };
}

/// Debugee process template with its output drained in the background.
pub fn prepare_debugee_process(path: &Path, args: &[&str]) -> Child<Template> {
    let (stdout_reader, stdout_writer) = os_pipe::pipe().unwrap();
    let (stderr_reader, stderr_writer) = os_pipe::pipe().unwrap();
    drain(stdout_reader);
    drain(stderr_reader);
    Child::new(
        path.to_string_lossy(),
        args.iter().map(|s| s.to_string()),
        stdout_writer,
        stderr_writer,
    )
}

fn drain(mut reader: os_pipe::PipeReader) {
    std::thread::spawn(move || {
        let _ = io::copy(&mut reader, &mut io::sink());
    });
}

/// Consume every hardware debug register slot so the next breakpoint set by a
/// test is guaranteed to be a software one (reliable across all threads,
/// including those spawned after the set).
pub fn occupy_hw_slots(debugger: &mut Debugger, functions: [&str; 4]) {
    for name in functions {
        debugger.set_breakpoint_at_fn(name).unwrap();
    }
}
