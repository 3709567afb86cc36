use crate::debugger::address::RelocatedAddress;
use crate::debugger::sys::WaitStatus;
use log::debug;
use nix::unistd::Pid;
use std::collections::HashMap;

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum ThreadStatus {
    /// Thread is known (the kernel announced the clone) but not yet observed.
    Created,
    Stopped,
    Running,
    /// Thread not found in the thread map.
    OutOfReach,
}

/// One OS thread of the debugee.
#[derive(Clone, Debug)]
pub struct Thread {
    pub pid: Pid,
    pub status: ThreadStatus,
    /// Last observed stop information.
    pub wait_status: WaitStatus,
    /// Address of the breakpoint this thread is currently stopped on, if any.
    /// When set, the thread's program counter is already rewound to this address.
    pub current_breakpoint: Option<RelocatedAddress>,
    /// True while the engine single-steps this thread.
    pub single_stepping: bool,
}

impl Thread {
    fn new(pid: Pid, status: ThreadStatus) -> Self {
        Self {
            pid,
            status,
            wait_status: WaitStatus::default(),
            current_breakpoint: None,
            single_stepping: false,
        }
    }

    pub fn is_stopped(&self) -> bool {
        matches!(self.status, ThreadStatus::Stopped | ThreadStatus::Created)
    }
}

/// Registry of debugee threads with one thread in focus. The focused thread is
/// the default context for operations that need one.
pub struct ThreadCtl {
    process_pid: Pid,
    in_focus_tid: Pid,
    threads_state: HashMap<Pid, Thread>,
}

impl ThreadCtl {
    pub fn new(proc_pid: Pid) -> ThreadCtl {
        Self {
            process_pid: proc_pid,
            in_focus_tid: proc_pid,
            threads_state: HashMap::from([(
                proc_pid,
                Thread::new(proc_pid, ThreadStatus::Stopped),
            )]),
        }
    }

    /// Return pid of debugee process main thread.
    pub fn proc_pid(&self) -> Pid {
        self.process_pid
    }

    /// Set thread into focus.
    pub fn set_thread_to_focus(&mut self, tid: Pid) {
        self.in_focus_tid = tid
    }

    /// Return currently focused thread.
    pub fn thread_in_focus(&self) -> Pid {
        self.in_focus_tid
    }

    pub fn has_thread(&self, tid: Pid) -> bool {
        self.threads_state.contains_key(&tid)
    }

    pub fn thread(&self, tid: Pid) -> Option<&Thread> {
        self.threads_state.get(&tid)
    }

    pub fn thread_mut(&mut self, tid: Pid) -> Option<&mut Thread> {
        self.threads_state.get_mut(&tid)
    }

    /// Adds a thread in `created` status. `created` is actual for trace events
    /// announcing a new thread that has not stopped yet.
    pub fn register(&mut self, pid: Pid) -> &mut Thread {
        debug!(target: "tracer", "add new thread {pid}");
        self.threads_state
            .entry(pid)
            .or_insert_with(|| Thread::new(pid, ThreadStatus::Created))
    }

    /// Remove thread from the registry.
    pub fn remove(&mut self, pid: Pid) -> Option<Thread> {
        debug!(target: "tracer", "remove thread {pid}");
        let removed = self.threads_state.remove(&pid);
        if self.in_focus_tid == pid {
            self.in_focus_tid = self.process_pid;
        }
        removed
    }

    pub fn set_status(&mut self, tid: Pid, status: ThreadStatus) {
        if let Some(thread) = self.threads_state.get_mut(&tid) {
            thread.status = status;
        }
    }

    /// Return current thread status.
    /// [`ThreadStatus::OutOfReach`] returns if thread not found in the registry.
    pub fn status(&self, tid: Pid) -> ThreadStatus {
        self.threads_state
            .get(&tid)
            .map(|t| t.status)
            .unwrap_or(ThreadStatus::OutOfReach)
    }

    /// Reset per-stop state on every thread before a resume.
    pub fn reset_stop_state(&mut self) {
        for thread in self.threads_state.values_mut() {
            thread.current_breakpoint = None;
        }
    }

    pub fn tids(&self) -> Vec<Pid> {
        self.threads_state.keys().copied().collect()
    }

    pub fn snapshot(&self) -> Vec<Thread> {
        self.threads_state.values().cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_focus_falls_back_to_leader_on_remove() {
        let leader = Pid::from_raw(100);
        let worker = Pid::from_raw(101);
        let mut ctl = ThreadCtl::new(leader);
        ctl.register(worker);
        ctl.set_thread_to_focus(worker);
        assert_eq!(ctl.thread_in_focus(), worker);

        ctl.remove(worker);
        assert_eq!(ctl.thread_in_focus(), leader);
        assert_eq!(ctl.status(worker), ThreadStatus::OutOfReach);
    }

    #[test]
    fn test_register_is_idempotent() {
        let leader = Pid::from_raw(100);
        let mut ctl = ThreadCtl::new(leader);
        ctl.set_status(leader, ThreadStatus::Running);
        ctl.register(leader);
        assert_eq!(ctl.status(leader), ThreadStatus::Running);
    }
}
