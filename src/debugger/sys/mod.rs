#[cfg(target_os = "linux")]
pub mod linux;
#[cfg(target_os = "macos")]
pub mod macos;

use nix::errno::Errno;
use nix::sys::signal::Signal;
use nix::unistd::Pid;

/// Failure model of trace primitives.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum TraceError {
    #[error("no such thread {0}")]
    NoSuchThread(Pid),
    #[error("not permitted (thread {0})")]
    NotPermitted(Pid),
    #[error("interrupted")]
    Interrupted,
    #[error("target exited with status {0}")]
    TargetExited(i32),
    #[error("transient os error: {0}")]
    TransientOs(Errno),
    #[error("os error: {0}")]
    Other(Errno),
}

impl TraceError {
    pub fn from_errno(tid: Pid, e: Errno) -> Self {
        match e {
            Errno::ESRCH => TraceError::NoSuchThread(tid),
            Errno::EPERM | Errno::EACCES => TraceError::NotPermitted(tid),
            Errno::EINTR => TraceError::Interrupted,
            Errno::EAGAIN | Errno::EBUSY => TraceError::TransientOs(e),
            _ => TraceError::Other(e),
        }
    }
}

pub type TraceResult<T> = Result<T, TraceError>;

/// What caused a SIGTRAP stop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrapCause {
    /// Software or hardware breakpoint hit.
    Breakpoint,
    /// Single instruction step completed.
    SingleStep,
    /// A traced thread spawned a new thread.
    CloneEvent(Pid),
    /// The initial exec of the debugee completed.
    ExecEvent,
    Unknown(i32),
}

/// Stop information of one thread, produced by the trace adapter wait loop.
#[derive(Debug, Clone, Copy, Default)]
pub struct WaitStatus {
    pub exited: bool,
    pub exit_status: i32,
    pub signaled: bool,
    pub signal: Option<Signal>,
    pub trap_cause: Option<TrapCause>,
}

impl WaitStatus {
    pub fn exited(status: i32) -> Self {
        WaitStatus {
            exited: true,
            exit_status: status,
            ..Default::default()
        }
    }

    pub fn stopped(signal: Signal, trap_cause: Option<TrapCause>) -> Self {
        WaitStatus {
            signaled: true,
            signal: Some(signal),
            trap_cause,
            ..Default::default()
        }
    }
}

/// Process-level event observed while waiting for the debugee.
#[derive(Debug, Clone, Copy)]
pub enum Event {
    /// Whole debugee process exited with code.
    Exited(i32),
    /// One thread (not the leader) exited.
    ThreadExited(Pid),
    /// A new traced thread appeared.
    ThreadSpawned { parent: Pid, child: Pid },
    /// Thread stopped by SIGTRAP.
    Trap(Pid, TrapCause),
    /// Thread stopped by some other signal.
    SignalStop(Pid, Signal),
    /// Thread vanished between wait and inspection.
    NoSuchThread(Pid),
}
