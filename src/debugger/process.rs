use crate::debugger::error::Error;
use crate::debugger::error::Error::Waitpid;
use nix::sys;
use nix::sys::wait::{waitpid, WaitPidFlag};
use nix::unistd::Pid;
use os_pipe::PipeWriter;
use std::marker::PhantomData;
use std::os::unix::process::CommandExt;
use std::path::PathBuf;
use std::process::Command;
use sysinfo::System;

/// Process state.
pub trait State {}

/// Process running and attached with trace-me semantics.
pub struct Installed;

impl State for Installed {}

/// Process prepared for instantiation by a `fork` call.
pub struct Template;

impl State for Template {}

/// Debugee process.
pub struct Child<S: State> {
    program: String,
    stdout: PipeWriter,
    stderr: PipeWriter,
    args: Vec<String>,
    pid: Option<Pid>,
    external: bool,
    _p: PhantomData<S>,
}

impl Child<Template> {
    /// Create new process, but don't start it.
    ///
    /// # Arguments
    ///
    /// * `program`: program name
    /// * `args`: program arguments
    /// * `stdout`: stdout pipe
    /// * `stderr`: stderr pipe
    pub fn new<ARGS: IntoIterator<Item = I>, I: Into<String>>(
        program: impl Into<String>,
        args: ARGS,
        stdout: PipeWriter,
        stderr: PipeWriter,
    ) -> Child<Template> {
        Self {
            stdout,
            stderr,
            program: program.into(),
            args: args.into_iter().map(Into::into).collect(),
            pid: None,
            external: false,
            _p: PhantomData,
        }
    }

    /// Instantiate the debugee with trace-me semantics: the child requests
    /// tracing before exec, so the kernel stops it at the first instruction
    /// of the new image, in its own process group.
    ///
    /// Must be called on the gate thread: the forking thread becomes the tracer.
    pub fn install(self) -> Result<Child<Installed>, Error> {
        let mut debugee_cmd = Command::new(&self.program);
        debugee_cmd
            .args(&self.args)
            .stdout(self.stdout.try_clone()?)
            .stderr(self.stderr.try_clone()?);

        unsafe {
            debugee_cmd.pre_exec(move || {
                #[cfg(target_os = "linux")]
                {
                    use nix::sys::personality::{self, Persona};
                    personality::set(Persona::ADDR_NO_RANDOMIZE)?;
                }
                nix::unistd::setpgid(Pid::from_raw(0), Pid::from_raw(0))?;
                sys::ptrace::traceme()?;
                Ok(())
            });
        }

        let child = debugee_cmd.spawn()?;
        let pid = Pid::from_raw(child.id() as i32);

        // the trace-me child stops with SIGTRAP when exec completes
        waitpid(pid, Some(WaitPidFlag::WSTOPPED)).map_err(Waitpid)?;

        Ok(Child {
            stdout: self.stdout,
            stderr: self.stderr,
            program: self.program,
            args: self.args,
            pid: Some(pid),
            external: false,
            _p: PhantomData,
        })
    }
}

impl Child<Installed> {
    /// Return running process pid.
    pub fn pid(&self) -> Pid {
        self.pid.expect("installed process has a pid")
    }

    /// Create [`Child`] from an already running external process.
    /// The caller is expected to attach to its threads afterwards.
    pub fn from_external(
        pid: Pid,
        stdout: PipeWriter,
        stderr: PipeWriter,
    ) -> Result<Self, Error> {
        let sys = System::new_all();
        let external_process = sys
            .process(sysinfo::Pid::from_u32(pid.as_raw() as u32))
            .ok_or(Error::NoSuchThread(pid))?;

        let program = external_process
            .exe()
            .ok_or(Error::NoSuchThread(pid))?
            .to_string_lossy()
            .to_string();
        let args = external_process
            .cmd()
            .iter()
            .skip(1)
            .cloned()
            .collect::<Vec<_>>();

        Ok(Self {
            stdout,
            stderr,
            program,
            args,
            pid: Some(pid),
            external: true,
            _p: PhantomData,
        })
    }
}

impl<S: State> Child<S> {
    /// Return a program name.
    pub fn program(&self) -> &str {
        self.program.as_str()
    }

    /// Return the program path on disk.
    pub fn program_path(&self) -> PathBuf {
        PathBuf::from(&self.program)
    }

    /// True when process was attached by its pid, false elsewhere.
    pub fn is_external(&self) -> bool {
        self.external
    }
}
