//! Linux trace back-end: ptrace plus the `/proc` filesystem.
//!
//! Every function here issues kernel trace requests and must run on the pinned
//! gate thread (see [`crate::debugger::gate::TraceGate`]). The only exceptions
//! are plain signal deliveries and `/proc` reads, which the kernel does not
//! route by tracer identity.

use crate::debugger::register::RegisterMap;
use crate::debugger::sys::{Event, TraceError, TraceResult, TrapCause};
use log::{debug, warn};
use nix::errno::Errno;
use nix::libc::{c_long, c_void, user};
use nix::sys::ptrace::{self, Options};
use nix::sys::signal::{self, Signal};
use nix::sys::wait::{waitpid, WaitPidFlag, WaitStatus};
use nix::unistd::Pid;
use std::mem;
use std::path::PathBuf;
use std::thread;
use std::time::Duration;

// si_code values of a SIGTRAP stop.
pub const TRAP_BRKPT: i32 = 0x1;
pub const TRAP_TRACE: i32 = 0x2;
pub const TRAP_HWBKPT: i32 = 0x4;
pub const SI_KERNEL: i32 = 0x80;

fn trace_err(tid: Pid, e: nix::Error) -> TraceError {
    TraceError::from_errno(tid, e)
}

/// Attach to a single thread of an already running process and wait for it to stop.
pub fn attach_thread(tid: Pid) -> TraceResult<()> {
    match ptrace::attach(tid) {
        Ok(()) => {}
        // EPERM may mean the thread is already traced through PTRACE_O_TRACECLONE,
        // a true permission failure will surface on the next request.
        Err(Errno::EPERM) => return Ok(()),
        Err(e) => return Err(trace_err(tid, e)),
    }
    waitpid(tid, Some(WaitPidFlag::__WALL)).map_err(|e| trace_err(tid, e))?;
    Ok(())
}

/// Ask the kernel to report thread creation of an attached thread.
pub fn set_trace_options(tid: Pid) -> TraceResult<()> {
    let opts = Options::PTRACE_O_TRACECLONE;
    match ptrace::setoptions(tid, opts) {
        Ok(()) => Ok(()),
        Err(Errno::ESRCH) => {
            // thread stopped but not yet reported, reap the stop and retry once
            waitpid(tid, Some(WaitPidFlag::__WALL)).map_err(|e| trace_err(tid, e))?;
            ptrace::setoptions(tid, opts).map_err(|e| trace_err(tid, e))
        }
        Err(e) => Err(trace_err(tid, e)),
    }
}

pub fn cont_thread(tid: Pid, signal: Option<Signal>) -> TraceResult<()> {
    debug!(target: "tracer", "continue thread {tid} with signal {signal:?}");
    ptrace::cont(tid, signal).map_err(|e| trace_err(tid, e))
}

/// Advance one thread a single instruction and reap its trap.
pub fn step_thread(tid: Pid) -> TraceResult<WaitStatus> {
    debug!(target: "tracer", "single step thread {tid}");
    ptrace::step(tid, None).map_err(|e| trace_err(tid, e))?;
    waitpid(tid, Some(WaitPidFlag::__WALL)).map_err(|e| trace_err(tid, e))
}

pub fn detach(pid: Pid, signal: Option<Signal>) -> TraceResult<()> {
    ptrace::detach(pid, signal).map_err(|e| trace_err(pid, e))
}

/// Deliver SIGSTOP to one thread. Not a trace request, any host thread may call it.
pub fn stop_thread(proc_pid: Pid, tid: Pid) -> TraceResult<()> {
    let res = unsafe {
        nix::libc::syscall(
            nix::libc::SYS_tgkill,
            proc_pid.as_raw(),
            tid.as_raw(),
            nix::libc::SIGSTOP,
        )
    };
    if res == -1 {
        return Err(trace_err(tid, Errno::last()));
    }
    Ok(())
}

/// SIGKILL the whole debugee process group.
pub fn kill_group(pid: Pid) -> TraceResult<()> {
    signal::kill(Pid::from_raw(-pid.as_raw()), Signal::SIGKILL).map_err(|e| trace_err(pid, e))
}

pub fn read_memory(tid: Pid, addr: usize, len: usize) -> TraceResult<Vec<u8>> {
    let mut remainder = len as isize;
    let mut result = Vec::with_capacity(len);

    let word_size = mem::size_of::<c_long>();
    let mut addr = addr as *mut c_long;
    while remainder > 0 {
        let value = ptrace::read(tid, addr as *mut c_void).map_err(|e| trace_err(tid, e))?;
        result.extend(value.to_ne_bytes().into_iter().take(remainder as usize));

        remainder -= word_size as isize;
        addr = unsafe { addr.offset(1) };
    }

    debug_assert!(result.len() == len);
    Ok(result)
}

/// Write bytes into debugee memory, preserving the surrounding bytes of partial words.
pub fn write_memory(tid: Pid, addr: usize, data: &[u8]) -> TraceResult<()> {
    let word_size = mem::size_of::<c_long>();
    let word_cnt = data.len().div_ceil(word_size);

    for i in 0..word_cnt {
        let word_addr = (addr + i * word_size) as *mut c_void;
        let chunk = &data[i * word_size..(i * word_size + word_size).min(data.len())];

        let word = if chunk.len() == word_size {
            c_long::from_ne_bytes(chunk.try_into().expect("chunk is a full word"))
        } else {
            let old = ptrace::read(tid, word_addr).map_err(|e| trace_err(tid, e))?;
            let mut bytes = old.to_ne_bytes();
            bytes[..chunk.len()].copy_from_slice(chunk);
            c_long::from_ne_bytes(bytes)
        };

        unsafe {
            ptrace::write(tid, word_addr, word as *mut c_void).map_err(|e| trace_err(tid, e))?;
        }
    }
    Ok(())
}

pub fn read_registers(tid: Pid) -> TraceResult<RegisterMap> {
    RegisterMap::current(tid).map_err(|e| trace_err(tid, e))
}

pub fn write_registers(tid: Pid, registers: RegisterMap) -> TraceResult<()> {
    registers.persist(tid).map_err(|e| trace_err(tid, e))
}

fn debugreg_offset(index: usize) -> usize {
    mem::offset_of!(user, u_debugreg) + index * mem::size_of::<u64>()
}

/// Arm a hardware instruction breakpoint in debug register `index` of one thread.
pub fn set_hw_breakpoint(tid: Pid, index: usize, addr: usize) -> TraceResult<()> {
    unsafe {
        ptrace::write_user(tid, debugreg_offset(index) as *mut c_void, addr as *mut c_void)
            .map_err(|e| trace_err(tid, e))?;
    }
    let dr7 = ptrace::read_user(tid, debugreg_offset(7) as *mut c_void)
        .map_err(|e| trace_err(tid, e))?;
    // local-enable bit on, condition = instruction execution, length = 1
    let mut dr7 = dr7 as u64;
    dr7 |= 1 << (index * 2);
    dr7 &= !(0b1111 << (16 + index * 4));
    unsafe {
        ptrace::write_user(tid, debugreg_offset(7) as *mut c_void, dr7 as *mut c_void)
            .map_err(|e| trace_err(tid, e))
    }
}

pub fn clear_hw_breakpoint(tid: Pid, index: usize) -> TraceResult<()> {
    let dr7 = ptrace::read_user(tid, debugreg_offset(7) as *mut c_void)
        .map_err(|e| trace_err(tid, e))?;
    let dr7 = dr7 as u64 & !(1 << (index * 2));
    unsafe {
        ptrace::write_user(tid, debugreg_offset(7) as *mut c_void, dr7 as *mut c_void)
            .map_err(|e| trace_err(tid, e))?;
        ptrace::write_user(tid, debugreg_offset(index) as *mut c_void, std::ptr::null_mut())
            .map_err(|e| trace_err(tid, e))
    }
}

/// Block until any traced thread reports a stop or an exit, classify the result.
pub fn wait_event(proc_pid: Pid) -> TraceResult<Event> {
    let status =
        waitpid(Pid::from_raw(-1), Some(WaitPidFlag::__WALL)).map_err(|e| trace_err(proc_pid, e))?;
    classify(proc_pid, status)
}

fn classify(proc_pid: Pid, status: WaitStatus) -> TraceResult<Event> {
    match status {
        WaitStatus::Exited(pid, code) => {
            if pid == proc_pid {
                Ok(Event::Exited(code))
            } else {
                Ok(Event::ThreadExited(pid))
            }
        }
        WaitStatus::Signaled(pid, sig, _) => {
            // a killed target is reported as exited with the signal number as status
            if pid == proc_pid {
                Ok(Event::Exited(sig as i32))
            } else {
                Ok(Event::ThreadExited(pid))
            }
        }
        WaitStatus::PtraceEvent(pid, _, event) => match event {
            nix::libc::PTRACE_EVENT_CLONE => {
                let child = ptrace::getevent(pid).map_err(|e| trace_err(pid, e))?;
                Ok(Event::ThreadSpawned {
                    parent: pid,
                    child: Pid::from_raw(child as nix::libc::pid_t),
                })
            }
            nix::libc::PTRACE_EVENT_EXEC => Ok(Event::Trap(pid, TrapCause::ExecEvent)),
            _ => {
                warn!(target: "tracer", "unsupported ptrace event, code: {event}");
                Ok(Event::SignalStop(pid, Signal::SIGTRAP))
            }
        },
        WaitStatus::Stopped(pid, Signal::SIGTRAP) => {
            let info = match ptrace::getsiginfo(pid) {
                Ok(info) => info,
                Err(Errno::ESRCH) => return Ok(Event::NoSuchThread(pid)),
                Err(e) => return Err(trace_err(pid, e)),
            };
            let cause = match info.si_code {
                TRAP_BRKPT | SI_KERNEL | TRAP_HWBKPT => TrapCause::Breakpoint,
                TRAP_TRACE => TrapCause::SingleStep,
                code => TrapCause::Unknown(code),
            };
            Ok(Event::Trap(pid, cause))
        }
        WaitStatus::Stopped(pid, signal) => Ok(Event::SignalStop(pid, signal)),
        status => {
            warn!(target: "tracer", "unexpected wait status: {status:?}");
            Err(TraceError::Interrupted)
        }
    }
}

/// Reap the exit status of the process leader.
///
/// A plain blocking wait on a thread group leader can hang forever when the
/// leader is a zombie but child threads still exist. Poll with WNOHANG and
/// check the stat file for the zombie state between polls.
pub fn wait_leader_exit(proc_pid: Pid, comm: &str) -> TraceResult<i32> {
    loop {
        let status = waitpid(
            proc_pid,
            Some(WaitPidFlag::WNOHANG | WaitPidFlag::__WALL),
        );
        match status {
            Ok(WaitStatus::Exited(_, code)) => return Ok(code),
            Ok(WaitStatus::Signaled(_, sig, _)) => return Ok(sig as i32),
            Ok(WaitStatus::StillAlive) => {
                if proc_state(proc_pid, comm) == Some('Z') {
                    return Ok(0);
                }
                thread::sleep(Duration::from_millis(20));
            }
            Ok(_) => continue,
            Err(Errno::ECHILD) => return Ok(0),
            Err(e) => return Err(trace_err(proc_pid, e)),
        }
    }
}

/// Enumerate thread identifiers of a process from procfs.
pub fn thread_ids(pid: Pid) -> TraceResult<Vec<Pid>> {
    let task_dir = PathBuf::from(format!("/proc/{pid}/task"));
    let entries = std::fs::read_dir(task_dir).map_err(|_| TraceError::NoSuchThread(pid))?;

    let mut tids = vec![];
    for entry in entries.flatten() {
        if let Ok(tid) = entry.file_name().to_string_lossy().parse::<i32>() {
            tids.push(Pid::from_raw(tid));
        }
    }
    Ok(tids)
}

/// Command name of a process, escaped for stat-file parsing.
pub fn proc_comm(pid: Pid) -> TraceResult<String> {
    let comm = std::fs::read_to_string(format!("/proc/{pid}/comm"))
        .map_err(|_| TraceError::NoSuchThread(pid))?;
    Ok(comm.trim_end_matches('\n').to_string())
}

/// Single character state of a process from its stat file, `None` if it is gone.
///
/// The second stat field is the command name in parentheses, it may itself
/// contain parentheses and spaces, so skip past the known name instead of
/// splitting on whitespace.
pub fn proc_state(pid: Pid, comm: &str) -> Option<char> {
    let stat = std::fs::read_to_string(format!("/proc/{pid}/stat")).ok()?;
    let comm_wrapped = format!("({comm})");
    let after = stat.split_once(&comm_wrapped)?.1;
    after.trim_start().chars().next()
}

pub fn does_proc_exist(pid: Pid) -> bool {
    PathBuf::from(format!("/proc/{pid}")).exists()
}
