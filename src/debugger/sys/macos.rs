//! macOS trace back-end: Mach task control plus a minimal ptrace surface.
//!
//! Stops are delivered as Mach exceptions. At attach time an exception port is
//! installed on the target task and `PT_ATTACHEXC`/`PT_SIGEXC` converts UNIX
//! signals into Mach exceptions so a single `mach_msg` receive observes both.
//! A dead-name notification port reports target exit. Both ports are members
//! of one port set, which is what the wait primitive listens on.
//!
//! There is no kernel notification for new threads, the thread list is
//! re-enumerated opportunistically on every wait.
//!
//! As on Linux, every function here must run on the pinned gate thread.

use crate::debugger::register::RegisterMap;
use crate::debugger::sys::{Event, TraceError, TraceResult, TrapCause};
use libc::{c_int, pid_t};
use log::warn;
use mach2::exception_types::{
    EXCEPTION_DEFAULT, EXC_BREAKPOINT, EXC_MASK_ALL, EXC_SOFTWARE,
};
use mach2::kern_return::{kern_return_t, KERN_SUCCESS};
use mach2::mach_port::{
    mach_port_allocate, mach_port_deallocate, mach_port_destroy, mach_port_insert_right,
    mach_port_move_member, mach_port_request_notification,
};
use mach2::message::{
    mach_msg, mach_msg_header_t, MACH_MSG_TIMEOUT_NONE, MACH_MSG_TYPE_MAKE_SEND,
    MACH_RCV_INTERRUPTED, MACH_RCV_MSG, MACH_SEND_MSG,
};
use mach2::port::{mach_port_t, MACH_PORT_NULL, MACH_PORT_RIGHT_PORT_SET, MACH_PORT_RIGHT_RECEIVE};
use mach2::structs::x86_thread_state64_t;
use mach2::task::{task_resume, task_set_exception_ports, task_suspend, task_threads};
use mach2::thread_act::{thread_get_state, thread_resume, thread_set_state, thread_suspend};
use mach2::thread_status::x86_THREAD_STATE64;
use mach2::traps::{mach_task_self, task_for_pid};
use mach2::vm::{mach_vm_protect, mach_vm_read_overwrite, mach_vm_write};
use mach2::vm_prot::{VM_PROT_COPY, VM_PROT_EXECUTE, VM_PROT_READ, VM_PROT_WRITE};
use nix::unistd::Pid;
use std::mem;

const MACH_NOTIFY_DEAD_NAME: c_int = 0x48; // MACH_NOTIFY_FIRST + 6
const PT_SIGEXC: c_int = 12;
const PT_ATTACHEXC: c_int = 14;
const PT_THUPDATE: c_int = 6;

/// Mach-specific state of one traced process.
#[derive(Debug, Default, Clone, Copy)]
pub struct MachTarget {
    /// Task port of the debugee.
    pub task: mach_port_t,
    /// Port receiving exception messages (breakpoints, converted signals).
    pub exception_port: mach_port_t,
    /// Port receiving the dead-name notification on target exit.
    pub notification_port: mach_port_t,
    /// Port set combining the two above, the wait primitive listens here.
    pub port_set: mach_port_t,
}

fn kern_err(tid: Pid, kret: kern_return_t) -> TraceError {
    if kret == mach2::kern_return::KERN_INVALID_ARGUMENT {
        TraceError::NoSuchThread(tid)
    } else {
        TraceError::Other(nix::errno::Errno::EIO)
    }
}

/// Acquire the task port of `pid` and install exception and notification ports.
pub fn acquire_target(pid: Pid) -> TraceResult<MachTarget> {
    let mut target = MachTarget::default();
    let me = unsafe { mach_task_self() };

    unsafe {
        let kret = task_for_pid(me, pid.as_raw(), &mut target.task);
        if kret != KERN_SUCCESS {
            return Err(TraceError::NotPermitted(pid));
        }

        let checks = [
            mach_port_allocate(me, MACH_PORT_RIGHT_RECEIVE, &mut target.exception_port),
            mach_port_insert_right(
                me,
                target.exception_port,
                target.exception_port,
                MACH_MSG_TYPE_MAKE_SEND,
            ),
            task_set_exception_ports(
                target.task,
                EXC_MASK_ALL,
                target.exception_port,
                EXCEPTION_DEFAULT as _,
                x86_THREAD_STATE64,
            ),
            mach_port_allocate(me, MACH_PORT_RIGHT_RECEIVE, &mut target.notification_port),
        ];
        if checks.iter().any(|&kret| kret != KERN_SUCCESS) {
            return Err(TraceError::NotPermitted(pid));
        }

        let mut prev = MACH_PORT_NULL;
        let kret = mach_port_request_notification(
            me,
            target.task,
            MACH_NOTIFY_DEAD_NAME,
            0,
            target.notification_port,
            MACH_MSG_TYPE_MAKE_SEND as _,
            &mut prev,
        );
        if kret != KERN_SUCCESS {
            return Err(kern_err(pid, kret));
        }

        let kret = mach_port_allocate(me, MACH_PORT_RIGHT_PORT_SET, &mut target.port_set);
        if kret != KERN_SUCCESS {
            return Err(kern_err(pid, kret));
        }
        for member in [target.exception_port, target.notification_port] {
            let kret = mach_port_move_member(me, member, target.port_set);
            if kret != KERN_SUCCESS {
                return Err(kern_err(pid, kret));
            }
        }
    }

    // convert UNIX signals into Mach exceptions from now on
    let res = unsafe { libc::ptrace(PT_ATTACHEXC, pid.as_raw(), std::ptr::null_mut(), 0) };
    if res < 0 {
        return Err(TraceError::from_errno(pid, nix::errno::Errno::last()));
    }

    Ok(target)
}

/// Enable signal-to-exception conversion on a freshly launched child
/// (the child itself calls `PT_TRACE_ME` before exec).
pub fn setup_launched_child(pid: Pid) -> TraceResult<()> {
    let res = unsafe { libc::ptrace(PT_SIGEXC, pid.as_raw(), std::ptr::null_mut(), 0) };
    if res < 0 {
        return Err(TraceError::from_errno(pid, nix::errno::Errno::last()));
    }
    Ok(())
}

pub fn release_target(pid: Pid, target: &MachTarget, threads: &[Pid]) -> TraceResult<()> {
    unsafe {
        let kret = task_set_exception_ports(
            target.task,
            EXC_MASK_ALL,
            MACH_PORT_NULL,
            EXCEPTION_DEFAULT as _,
            x86_THREAD_STATE64,
        );
        if kret != KERN_SUCCESS {
            warn!(target: "tracer", "could not restore exception ports for {pid}");
        }

        let me = mach_task_self();
        for &tid in threads {
            mach_port_deallocate(me, tid.as_raw() as mach_port_t);
        }
        mach_port_destroy(me, target.notification_port);
        mach_port_deallocate(me, target.exception_port);
        mach_port_deallocate(me, target.task);
    }
    Ok(())
}

/// Enumerate the threads of the target. Thread identity on this OS is the
/// thread's Mach port name.
pub fn thread_ids(pid: Pid, target: &MachTarget) -> TraceResult<Vec<Pid>> {
    let mut list: *mut mach_port_t = std::ptr::null_mut();
    let mut count = 0;
    let kret = unsafe { task_threads(target.task, &mut list, &mut count) };
    if kret != KERN_SUCCESS {
        return Err(kern_err(pid, kret));
    }

    let ports = unsafe { std::slice::from_raw_parts(list, count as usize) };
    Ok(ports
        .iter()
        .map(|&port| Pid::from_raw(port as pid_t))
        .collect())
}

pub fn cont_thread(pid: Pid, tid: Pid, signal: Option<nix::sys::signal::Signal>) -> TraceResult<()> {
    // inject (or suppress) the pending signal before resuming
    let sig = signal.map(|s| s as c_int).unwrap_or(0);
    let res = unsafe { libc::ptrace(PT_THUPDATE, pid.as_raw(), tid.as_raw() as *mut _, sig) };
    if res < 0 {
        return Err(TraceError::from_errno(tid, nix::errno::Errno::last()));
    }
    let kret = unsafe { thread_resume(tid.as_raw() as mach_port_t) };
    if kret != KERN_SUCCESS {
        return Err(kern_err(tid, kret));
    }
    Ok(())
}

pub fn halt_thread(tid: Pid) -> TraceResult<()> {
    let kret = unsafe { thread_suspend(tid.as_raw() as mach_port_t) };
    if kret != KERN_SUCCESS {
        return Err(kern_err(tid, kret));
    }
    Ok(())
}

/// Advance one thread a single instruction: set the trap flag, resume the
/// thread alone (task kept suspended), wait for its breakpoint exception.
pub fn step_thread(pid: Pid, target: &MachTarget, tid: Pid) -> TraceResult<()> {
    const X86_TRAP_FLAG: u64 = 0x100;

    let mut regs = read_registers(tid)?;
    regs.set_rflags(regs.rflags() | X86_TRAP_FLAG);
    write_registers(tid, regs)?;

    unsafe {
        task_suspend(target.task);
        thread_resume(tid.as_raw() as mach_port_t);
    }
    let event = wait_event(pid, target)?;
    unsafe {
        task_resume(target.task);
    }
    match event {
        Event::Trap(_, _) => Ok(()),
        Event::Exited(code) => Err(TraceError::TargetExited(code)),
        _ => Err(TraceError::Interrupted),
    }
}

/// Raise a synthetic breakpoint exception so a blocked wait returns.
pub fn interrupt(pid: Pid, target: &MachTarget, tid: Pid) -> TraceResult<()> {
    #[repr(C)]
    struct RaiseRequest {
        header: mach_msg_header_t,
        body: [u8; 64],
    }

    // an EXC_BREAKPOINT message with no victim thread state: enough for the
    // receive loop to wake up and observe the manual-halt flag
    let mut msg: RaiseRequest = unsafe { mem::zeroed() };
    msg.header.msgh_bits = MACH_MSG_TYPE_MAKE_SEND;
    msg.header.msgh_remote_port = target.exception_port;
    msg.header.msgh_local_port = MACH_PORT_NULL;
    msg.header.msgh_size = mem::size_of::<RaiseRequest>() as u32;
    msg.header.msgh_id = EXC_BREAKPOINT as i32;

    let kret = unsafe {
        mach_msg(
            &mut msg.header,
            MACH_SEND_MSG,
            msg.header.msgh_size,
            0,
            MACH_PORT_NULL,
            MACH_MSG_TIMEOUT_NONE,
            MACH_PORT_NULL,
        )
    };
    if kret != KERN_SUCCESS {
        return Err(kern_err(tid, kret));
    }
    Ok(())
}

/// Block on the port set until an exception or a dead-name notification arrives.
pub fn wait_event(pid: Pid, target: &MachTarget) -> TraceResult<Event> {
    #[repr(C)]
    struct ReceiveBuffer {
        header: mach_msg_header_t,
        body: [u8; 1024],
    }

    loop {
        let mut msg: ReceiveBuffer = unsafe { mem::zeroed() };
        let kret = unsafe {
            mach_msg(
                &mut msg.header,
                MACH_RCV_MSG,
                0,
                mem::size_of::<ReceiveBuffer>() as u32,
                target.port_set,
                MACH_MSG_TIMEOUT_NONE,
                MACH_PORT_NULL,
            )
        };
        if kret == MACH_RCV_INTERRUPTED as kern_return_t {
            return Err(TraceError::Interrupted);
        }
        if kret != KERN_SUCCESS {
            return Err(kern_err(pid, kret));
        }

        if msg.header.msgh_local_port == target.notification_port {
            return Ok(Event::Exited(0));
        }

        // exception message: the victim thread port is the first port descriptor
        let thread_port = exception_thread_port(&msg.header);
        let tid = Pid::from_raw(thread_port as pid_t);
        match msg.header.msgh_id {
            id if id == EXC_BREAKPOINT as i32 => return Ok(Event::Trap(tid, TrapCause::Breakpoint)),
            id if id == EXC_SOFTWARE as i32 => {
                return Ok(Event::SignalStop(tid, nix::sys::signal::Signal::SIGSTOP))
            }
            other => {
                warn!(target: "tracer", "unhandled mach exception id {other}");
                continue;
            }
        }
    }
}

fn exception_thread_port(header: &mach_msg_header_t) -> mach_port_t {
    // exception_raise request layout: header, body, thread port descriptor
    unsafe {
        let base = header as *const mach_msg_header_t as *const u8;
        let descriptor = base.add(mem::size_of::<mach_msg_header_t>() + mem::size_of::<u32>());
        *(descriptor as *const mach_port_t)
    }
}

pub fn read_memory(pid: Pid, target: &MachTarget, addr: usize, len: usize) -> TraceResult<Vec<u8>> {
    let mut buf = vec![0u8; len];
    let mut read_len = 0u64;
    let kret = unsafe {
        mach_vm_read_overwrite(
            target.task,
            addr as u64,
            len as u64,
            buf.as_mut_ptr() as u64,
            &mut read_len,
        )
    };
    if kret != KERN_SUCCESS || read_len != len as u64 {
        return Err(kern_err(pid, kret));
    }
    Ok(buf)
}

pub fn write_memory(pid: Pid, target: &MachTarget, addr: usize, data: &[u8]) -> TraceResult<()> {
    unsafe {
        // code pages are mapped read-execute, make them writable for the patch
        mach_vm_protect(
            target.task,
            addr as u64,
            data.len() as u64,
            0,
            VM_PROT_READ | VM_PROT_WRITE | VM_PROT_COPY,
        );
        let kret = mach_vm_write(target.task, addr as u64, data.as_ptr() as _, data.len() as u32);
        mach_vm_protect(
            target.task,
            addr as u64,
            data.len() as u64,
            0,
            VM_PROT_READ | VM_PROT_EXECUTE,
        );
        if kret != KERN_SUCCESS {
            return Err(kern_err(pid, kret));
        }
    }
    Ok(())
}

pub fn read_registers(tid: Pid) -> TraceResult<RegisterMap> {
    let mut state = x86_thread_state64_t::new();
    let mut count = x86_thread_state64_t::count();
    let kret = unsafe {
        thread_get_state(
            tid.as_raw() as mach_port_t,
            x86_THREAD_STATE64,
            &mut state as *mut _ as *mut _,
            &mut count,
        )
    };
    if kret != KERN_SUCCESS {
        return Err(kern_err(tid, kret));
    }
    Ok(RegisterMap::from_thread_state(state))
}

pub fn write_registers(tid: Pid, registers: RegisterMap) -> TraceResult<()> {
    let mut state = registers.into_thread_state();
    let kret = unsafe {
        thread_set_state(
            tid.as_raw() as mach_port_t,
            x86_THREAD_STATE64,
            &mut state as *mut _ as *mut _,
            x86_thread_state64_t::count(),
        )
    };
    if kret != KERN_SUCCESS {
        return Err(kern_err(tid, kret));
    }
    Ok(())
}
