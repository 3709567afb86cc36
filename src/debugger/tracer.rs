use crate::debugger::gate::TraceGate;
use crate::debugger::register::RegisterMap;
use crate::debugger::sys::{Event, TraceResult};
use nix::sys::signal::Signal;
use nix::unistd::Pid;

/// Gate-wrapped facade over the OS trace back-end.
///
/// Every method submits the underlying primitive to the serialization gate and
/// blocks until it completes on the pinned trace thread. The exception is
/// [`Tracer::stop_thread`]: stop delivery must stay off the gate, it exists to
/// unblock a wait that currently occupies it.
pub struct Tracer {
    gate: TraceGate,
    proc_pid: Pid,
    /// Command name of the debugee, needed for the zombie-leader workaround.
    #[cfg(target_os = "linux")]
    comm: String,
    #[cfg(target_os = "macos")]
    target: crate::debugger::sys::macos::MachTarget,
}

#[cfg(target_os = "linux")]
impl Tracer {
    pub fn new(gate: TraceGate, proc_pid: Pid) -> TraceResult<Self> {
        let comm = gate.exec(move || super::sys::linux::proc_comm(proc_pid))?;
        Ok(Self {
            gate,
            proc_pid,
            comm,
        })
    }

    pub fn gate(&self) -> &TraceGate {
        &self.gate
    }

    pub fn proc_pid(&self) -> Pid {
        self.proc_pid
    }

    /// Attach to one thread of an already running process and wait for its stop.
    pub fn attach_thread(&self, tid: Pid) -> TraceResult<()> {
        self.gate.exec(move || super::sys::linux::attach_thread(tid))
    }

    pub fn set_trace_options(&self, tid: Pid) -> TraceResult<()> {
        self.gate
            .exec(move || super::sys::linux::set_trace_options(tid))
    }

    pub fn cont(&self, tid: Pid, signal: Option<Signal>) -> TraceResult<()> {
        self.gate
            .exec(move || super::sys::linux::cont_thread(tid, signal))
    }

    /// Advance one thread a single instruction, the trap is reaped internally.
    pub fn step(&self, tid: Pid) -> TraceResult<nix::sys::wait::WaitStatus> {
        self.gate.exec(move || super::sys::linux::step_thread(tid))
    }

    /// Release trace control of one thread.
    pub fn detach_thread(&self, tid: Pid, signal: Option<Signal>) -> TraceResult<()> {
        self.gate.exec(move || super::sys::linux::detach(tid, signal))
    }

    /// Deliver SIGSTOP to one thread, off the gate.
    pub fn stop_thread(&self, tid: Pid) -> TraceResult<()> {
        super::sys::linux::stop_thread(self.proc_pid, tid)
    }

    /// Block until any traced thread reports an event.
    pub fn wait_event(&self) -> TraceResult<Event> {
        let pid = self.proc_pid;
        self.gate.exec(move || super::sys::linux::wait_event(pid))
    }

    /// Wait for a stop of one specific thread.
    pub fn wait_thread(&self, tid: Pid) -> TraceResult<nix::sys::wait::WaitStatus> {
        self.gate.exec(move || {
            nix::sys::wait::waitpid(tid, Some(nix::sys::wait::WaitPidFlag::__WALL))
                .map_err(|e| super::sys::TraceError::from_errno(tid, e))
        })
    }

    pub fn read_memory(&self, tid: Pid, addr: usize, len: usize) -> TraceResult<Vec<u8>> {
        self.gate
            .exec(move || super::sys::linux::read_memory(tid, addr, len))
    }

    pub fn write_memory(&self, tid: Pid, addr: usize, data: &[u8]) -> TraceResult<()> {
        let data = data.to_vec();
        self.gate
            .exec(move || super::sys::linux::write_memory(tid, addr, &data))
    }

    pub fn registers(&self, tid: Pid) -> TraceResult<RegisterMap> {
        self.gate.exec(move || super::sys::linux::read_registers(tid))
    }

    pub fn set_registers(&self, tid: Pid, registers: RegisterMap) -> TraceResult<()> {
        self.gate
            .exec(move || super::sys::linux::write_registers(tid, registers))
    }

    /// True when the platform can arm CPU debug registers.
    pub fn supports_hw_breakpoints(&self) -> bool {
        true
    }

    pub fn set_hw_breakpoint(&self, tid: Pid, index: usize, addr: usize) -> TraceResult<()> {
        self.gate
            .exec(move || super::sys::linux::set_hw_breakpoint(tid, index, addr))
    }

    pub fn clear_hw_breakpoint(&self, tid: Pid, index: usize) -> TraceResult<()> {
        self.gate
            .exec(move || super::sys::linux::clear_hw_breakpoint(tid, index))
    }

    /// Thread identifiers of the debugee, from the kernel's point of view.
    pub fn enumerate_threads(&self) -> TraceResult<Vec<Pid>> {
        let pid = self.proc_pid;
        self.gate.exec(move || super::sys::linux::thread_ids(pid))
    }

    /// SIGKILL the debugee process group and reap the leader exit status.
    pub fn kill_and_reap(&self) -> TraceResult<i32> {
        let pid = self.proc_pid;
        let comm = self.comm.clone();
        self.gate.exec(move || {
            super::sys::linux::kill_group(pid)?;
            super::sys::linux::wait_leader_exit(pid, &comm)
        })
    }
}

#[cfg(target_os = "macos")]
impl Tracer {
    pub fn new(gate: TraceGate, proc_pid: Pid) -> TraceResult<Self> {
        let target = gate.exec(move || super::sys::macos::acquire_target(proc_pid))?;
        Ok(Self {
            gate,
            proc_pid,
            target,
        })
    }

    pub fn gate(&self) -> &TraceGate {
        &self.gate
    }

    pub fn proc_pid(&self) -> Pid {
        self.proc_pid
    }

    pub fn attach_thread(&self, _tid: Pid) -> TraceResult<()> {
        // attaching is task-wide on this OS, performed once in `new`
        Ok(())
    }

    pub fn set_trace_options(&self, _tid: Pid) -> TraceResult<()> {
        Ok(())
    }

    pub fn cont(&self, tid: Pid, signal: Option<Signal>) -> TraceResult<()> {
        let pid = self.proc_pid;
        self.gate
            .exec(move || super::sys::macos::cont_thread(pid, tid, signal))
    }

    pub fn step(&self, tid: Pid) -> TraceResult<nix::sys::wait::WaitStatus> {
        let pid = self.proc_pid;
        let target = self.target;
        self.gate
            .exec(move || super::sys::macos::step_thread(pid, &target, tid))?;
        Ok(nix::sys::wait::WaitStatus::StillAlive)
    }

    /// Release trace control. On this OS detaching is task-wide, it happens
    /// when the leader is detached.
    pub fn detach_thread(&self, tid: Pid, signal: Option<Signal>) -> TraceResult<()> {
        if tid != self.proc_pid {
            return Ok(());
        }
        let pid = self.proc_pid;
        let target = self.target;
        let threads = self.enumerate_threads()?;
        self.gate
            .exec(move || super::sys::macos::release_target(pid, &target, &threads))?;
        if let Some(sig) = signal {
            let _ = nix::sys::signal::kill(pid, sig);
        }
        Ok(())
    }

    /// Raise a synthetic exception on the exception port so the wait returns.
    pub fn stop_thread(&self, tid: Pid) -> TraceResult<()> {
        super::sys::macos::interrupt(self.proc_pid, &self.target, tid)
    }

    pub fn wait_event(&self) -> TraceResult<Event> {
        let pid = self.proc_pid;
        let target = self.target;
        self.gate
            .exec(move || super::sys::macos::wait_event(pid, &target))
    }

    pub fn wait_thread(&self, _tid: Pid) -> TraceResult<nix::sys::wait::WaitStatus> {
        Ok(nix::sys::wait::WaitStatus::StillAlive)
    }

    pub fn read_memory(&self, _tid: Pid, addr: usize, len: usize) -> TraceResult<Vec<u8>> {
        let pid = self.proc_pid;
        let target = self.target;
        self.gate
            .exec(move || super::sys::macos::read_memory(pid, &target, addr, len))
    }

    pub fn write_memory(&self, _tid: Pid, addr: usize, data: &[u8]) -> TraceResult<()> {
        let pid = self.proc_pid;
        let target = self.target;
        let data = data.to_vec();
        self.gate
            .exec(move || super::sys::macos::write_memory(pid, &target, addr, &data))
    }

    pub fn registers(&self, tid: Pid) -> TraceResult<RegisterMap> {
        self.gate.exec(move || super::sys::macos::read_registers(tid))
    }

    pub fn set_registers(&self, tid: Pid, registers: RegisterMap) -> TraceResult<()> {
        self.gate
            .exec(move || super::sys::macos::write_registers(tid, registers))
    }

    /// Hardware breakpoints are not supported on this OS.
    pub fn supports_hw_breakpoints(&self) -> bool {
        false
    }

    pub fn set_hw_breakpoint(&self, tid: Pid, _index: usize, _addr: usize) -> TraceResult<()> {
        Err(super::sys::TraceError::NotPermitted(tid))
    }

    pub fn clear_hw_breakpoint(&self, tid: Pid, _index: usize) -> TraceResult<()> {
        Err(super::sys::TraceError::NotPermitted(tid))
    }

    pub fn enumerate_threads(&self) -> TraceResult<Vec<Pid>> {
        let pid = self.proc_pid;
        let target = self.target;
        self.gate
            .exec(move || super::sys::macos::thread_ids(pid, &target))
    }

    pub fn kill_and_reap(&self) -> TraceResult<i32> {
        let pid = self.proc_pid;
        nix::sys::signal::kill(pid, Signal::SIGKILL)
            .map_err(|e| super::sys::TraceError::from_errno(pid, e))?;
        loop {
            match nix::sys::wait::waitpid(pid, None) {
                Ok(nix::sys::wait::WaitStatus::Exited(_, code)) => return Ok(code),
                Ok(nix::sys::wait::WaitStatus::Signaled(_, sig, _)) => return Ok(sig as i32),
                Ok(_) => continue,
                Err(nix::errno::Errno::ECHILD) => return Ok(Signal::SIGKILL as i32),
                Err(e) => return Err(super::sys::TraceError::from_errno(pid, e)),
            }
        }
    }
}
