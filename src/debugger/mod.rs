pub mod address;
pub mod arch;
pub mod breakpoint;
pub mod debug_info;
pub mod error;
pub mod gate;
pub mod goroutine;
pub mod process;
pub mod register;
pub mod sys;
pub mod thread;
pub mod tracer;
pub mod unwind;

pub use crate::debugger::debug_info::lines::{PlaceDescriptor, PlaceDescriptorOwned};
pub use crate::debugger::error::Error;

use crate::debugger::address::RelocatedAddress;
use crate::debugger::arch::{Arch, Architecture};
use crate::debugger::breakpoint::{Breakpoint, BreakpointKind, BreakpointRegistry};
use crate::debugger::debug_info::DebugInfo;
use crate::debugger::gate::TraceGate;
use crate::debugger::goroutine::{Goroutine, TaskInspector};
use crate::debugger::process::{Child, Installed, Template};
use crate::debugger::register::Register;
use crate::debugger::sys::{Event, TraceError, TrapCause};
use crate::debugger::thread::{Thread, ThreadCtl, ThreadStatus};
use crate::debugger::tracer::Tracer;
use crate::debugger::unwind::{Backtrace, Unwinder};
use crate::{muted_error, weak_error};
use log::{debug, info, warn};
use nix::sys::signal::Signal;
use nix::unistd::Pid;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Functions the target runtime parks idle OS threads in. A thread stopped
/// inside one of them is not executing user code and is excluded from stepping.
const PARKED_FUNCTIONS: &[&str] = &["runtime.futex", "runtime.usleep", "runtime.clone"];

/// Name of the runtime's user-level break primitive.
const RUNTIME_BREAKPOINT_FN: &str = "runtime.breakpoint";

/// Function a task returns into when it finishes.
const TASK_EXIT_FN: &str = "runtime.goexit";

/// Engine stop observer. The console and the wire servers plug in here.
pub trait EventHook {
    fn on_breakpoint(
        &self,
        pc: RelocatedAddress,
        place: Option<PlaceDescriptorOwned>,
    ) -> anyhow::Result<()>;
    fn on_step(
        &self,
        pc: RelocatedAddress,
        place: Option<PlaceDescriptorOwned>,
    ) -> anyhow::Result<()>;
    fn on_signal(&self, signal: Signal);
    fn on_exit(&self, code: i32);
}

/// Hook that does nothing.
#[derive(Default)]
pub struct NopHook;

impl EventHook for NopHook {
    fn on_breakpoint(
        &self,
        _: RelocatedAddress,
        _: Option<PlaceDescriptorOwned>,
    ) -> anyhow::Result<()> {
        Ok(())
    }
    fn on_step(&self, _: RelocatedAddress, _: Option<PlaceDescriptorOwned>) -> anyhow::Result<()> {
        Ok(())
    }
    fn on_signal(&self, _: Signal) {}
    fn on_exit(&self, _: i32) {}
}

/// Out-of-band stop requester, safe to use from a signal handler thread while
/// an engine operation blocks. Sets the manual-halt flag and delivers a stop
/// so the engine's wait returns.
#[derive(Clone)]
pub struct ManualStopHandle {
    halt: Arc<AtomicBool>,
    pid: Pid,
}

impl ManualStopHandle {
    pub fn request_stop(&self) {
        self.halt.store(true, Ordering::SeqCst);
        let _ = nix::sys::signal::kill(self.pid, Signal::SIGSTOP);
    }
}

/// Thread snapshot handed to interfaces.
pub struct ThreadSnapshot {
    pub thread: Thread,
    pub place: Option<PlaceDescriptorOwned>,
    pub function: Option<String>,
    pub in_focus: bool,
}

/// Outcome of planting step-over breakpoints on one thread.
enum SetNextOutcome {
    Planted,
    /// The current function returns straight into the runtime's task exit
    /// routine: the task running on this thread is about to die.
    TaskExiting { task_id: u64 },
}

/// The debugger core: owns the traced process, all of its threads, the
/// breakpoint table, debug information and the trace gate, and implements the
/// user-visible execution operations on top of them.
pub struct Debugger {
    process: Child<Installed>,
    tracer: Tracer,
    threads: ThreadCtl,
    breakpoints: BreakpointRegistry,
    debug_info: DebugInfo,
    arch: Arch,
    hooks: Box<dyn EventHook>,
    /// Offset of the executable mapping in the debugee address space
    /// (zero for non-relocatable executables).
    mapping_offset: usize,
    halt: Arc<AtomicBool>,
    running: bool,
    exited: bool,
    exit_status: i32,
}

impl Debugger {
    /// Launch the debugee with trace-me semantics and prepare it for debugging:
    /// the process is left stopped before its first user instruction, debug
    /// information is loaded, the trace gate is pinned.
    pub fn new(process: Child<Template>, hooks: impl EventHook + 'static) -> Result<Self, Error> {
        let gate = TraceGate::new();
        let process = gate.exec(move || process.install())?;
        let pid = process.pid();
        info!(target: "debugger", "debugee {} started, pid {pid}", process.program());

        let tracer = Tracer::new(gate, pid).map_err(|e| trace_to_error(pid, e))?;
        tracer
            .set_trace_options(pid)
            .map_err(|e| trace_to_error(pid, e))?;

        let debug_info = DebugInfo::load(&process.program_path())?;
        let mapping_offset = define_mapping_offset(pid, &process, &debug_info)?;

        Ok(Self {
            tracer,
            threads: ThreadCtl::new(pid),
            breakpoints: BreakpointRegistry::new(),
            debug_info,
            arch: Arch::new(Architecture::Amd64),
            hooks: Box::new(hooks),
            mapping_offset,
            halt: Arc::new(AtomicBool::new(false)),
            running: false,
            exited: false,
            exit_status: 0,
            process,
        })
    }

    /// Attach to a running process: every OS thread is attached and waited for.
    pub fn attach(pid: Pid, hooks: impl EventHook + 'static) -> Result<Self, Error> {
        let (reader, stdout) = os_pipe::pipe()?;
        let (_reader2, stderr) = os_pipe::pipe()?;
        drop(reader);

        let process = Child::from_external(pid, stdout, stderr)?;
        let gate = TraceGate::new();
        let tracer = Tracer::new(gate, pid).map_err(|e| trace_to_error(pid, e))?;

        let mut threads = ThreadCtl::new(pid);
        for tid in tracer
            .enumerate_threads()
            .map_err(|e| trace_to_error(pid, e))?
        {
            tracer
                .attach_thread(tid)
                .map_err(|e| trace_to_error(tid, e))?;
            tracer
                .set_trace_options(tid)
                .map_err(|e| trace_to_error(tid, e))?;
            threads.register(tid).status = ThreadStatus::Stopped;
        }

        let debug_info = DebugInfo::load(&process.program_path())?;
        let mapping_offset = define_mapping_offset(pid, &process, &debug_info)?;

        Ok(Self {
            tracer,
            threads,
            breakpoints: BreakpointRegistry::new(),
            debug_info,
            arch: Arch::new(Architecture::Amd64),
            hooks: Box::new(hooks),
            mapping_offset,
            halt: Arc::new(AtomicBool::new(false)),
            running: false,
            exited: false,
            exit_status: 0,
            process,
        })
    }

    pub fn pid(&self) -> Pid {
        self.threads.proc_pid()
    }

    pub fn exited(&self) -> bool {
        self.exited
    }

    pub fn running(&self) -> bool {
        self.running
    }

    pub fn current_thread(&self) -> Pid {
        self.threads.thread_in_focus()
    }

    pub fn debug_info(&self) -> &DebugInfo {
        &self.debug_info
    }

    /// Handle for requesting an asynchronous stop (SIGINT mapping).
    pub fn manual_stop_handle(&self) -> ManualStopHandle {
        ManualStopHandle {
            halt: self.halt.clone(),
            pid: self.pid(),
        }
    }

    fn handle_trace_err(&mut self, e: TraceError) -> Error {
        if let TraceError::TargetExited(status) = e {
            self.exited = true;
            self.exit_status = status;
        }
        trace_to_error(self.pid(), e)
    }

    // ---------------------------------------------------------------------
    // memory & symbols
    // ---------------------------------------------------------------------

    /// Thread usable as the address-space handle for memory requests.
    fn memory_tid(&self) -> Pid {
        let focus = self.threads.thread_in_focus();
        if self.threads.has_thread(focus) {
            focus
        } else {
            self.pid()
        }
    }

    /// Read debugee memory.
    pub fn read_memory(&self, addr: usize, len: usize) -> Result<Vec<u8>, Error> {
        self.tracer
            .read_memory(self.memory_tid(), addr, len)
            .map_err(|e| trace_to_error(self.pid(), e))
    }

    /// Write debugee memory.
    pub fn write_memory(&self, addr: usize, data: &[u8]) -> Result<(), Error> {
        self.tracer
            .write_memory(self.memory_tid(), addr, data)
            .map_err(|e| trace_to_error(self.pid(), e))
    }

    /// Address and current bytes of a named global variable.
    pub fn read_global_variable(&self, name: &str) -> Result<(RelocatedAddress, Vec<u8>), Error> {
        let sym = self
            .debug_info
            .global_variable(name)
            .ok_or_else(|| Error::SymbolNotFound(name.to_string()))?;
        let addr = sym.addr.relocate(self.mapping_offset);
        let len = (sym.size as usize).clamp(1, 64);
        let bytes = self.read_memory(addr.as_usize(), len)?;
        Ok((addr, bytes))
    }

    fn task_inspector(&self) -> TaskInspector<'_, impl Fn(usize, usize) -> Result<Vec<u8>, Error> + '_> {
        TaskInspector::new(
            &self.debug_info,
            self.mapping_offset,
            self.arch.ptr_size(),
            move |addr, len| self.read_memory(addr, len),
        )
    }

    // ---------------------------------------------------------------------
    // breakpoints
    // ---------------------------------------------------------------------

    /// Set a breakpoint at a raw address. Hardware debug registers are
    /// preferred when the platform supports them and a slot is free, software
    /// code patching is the fallback.
    pub fn set_breakpoint(&mut self, addr: RelocatedAddress) -> Result<u32, Error> {
        self.set_breakpoint_inner(addr, false)
    }

    fn set_temp_breakpoint(&mut self, addr: RelocatedAddress) -> Result<u32, Error> {
        self.set_breakpoint_inner(addr, true)
    }

    fn set_breakpoint_inner(&mut self, addr: RelocatedAddress, temp: bool) -> Result<u32, Error> {
        if self.breakpoints.get(addr).is_some() {
            return Err(Error::BreakpointExists(addr));
        }

        let global = addr.into_global(self.mapping_offset);
        let function_name = self
            .debug_info
            .function_name_by_pc(global)
            .map(ToString::to_string);
        if function_name.is_none() {
            return Err(Error::InvalidAddress(addr));
        }
        let place = self.debug_info.find_place_from_pc(global).map(|p| p.to_owned());

        let id = self.breakpoints.allocate_id(temp);
        let kind = self.arm_breakpoint(addr)?;
        let bp = Breakpoint {
            addr,
            id,
            temp,
            kind,
            file: place.as_ref().map(|p| p.file.clone()),
            line: place.as_ref().map(|p| p.line_number),
            function_name,
        };
        self.breakpoints.insert(bp)?;
        Ok(id)
    }

    fn arm_breakpoint(&mut self, addr: RelocatedAddress) -> Result<BreakpointKind, Error> {
        if self.tracer.supports_hw_breakpoints() {
            if let Some(slot) = self.arch.free_hw_slot() {
                return self.arm_hardware(addr, slot);
            }
        }
        self.arm_software(addr)
    }

    fn arm_hardware(
        &mut self,
        addr: RelocatedAddress,
        slot: usize,
    ) -> Result<BreakpointKind, Error> {
        // debug registers are per thread: stop the running ones for the write
        let running: Vec<Pid> = self
            .threads
            .snapshot()
            .into_iter()
            .filter(|t| t.status == ThreadStatus::Running)
            .map(|t| t.pid)
            .collect();
        for &tid in &running {
            self.halt_thread(tid)?;
        }

        for tid in self.threads.tids() {
            match self.tracer.set_hw_breakpoint(tid, slot, addr.as_usize()) {
                Ok(()) => {}
                Err(TraceError::NoSuchThread(_)) => {
                    self.threads.remove(tid);
                }
                Err(e) => return Err(self.handle_trace_err(e)),
            }
        }

        for &tid in &running {
            if self.threads.has_thread(tid) {
                self.tracer
                    .cont(tid, None)
                    .map_err(|e| trace_to_error(tid, e))?;
                self.threads.set_status(tid, ThreadStatus::Running);
            }
        }

        self.arch.set_hw_slot_usage(slot, true);
        Ok(BreakpointKind::Hardware {
            register_index: slot,
        })
    }

    fn arm_software(&mut self, addr: RelocatedAddress) -> Result<BreakpointKind, Error> {
        let bp_size = self.arch.breakpoint_size();
        let original_bytes = self.read_memory(addr.as_usize(), bp_size)?;
        self.write_memory(addr.as_usize(), self.arch.breakpoint_instruction())?;
        Ok(BreakpointKind::Software { original_bytes })
    }

    fn disarm_breakpoint(&mut self, bp: &Breakpoint) -> Result<(), Error> {
        match &bp.kind {
            BreakpointKind::Software { original_bytes } => {
                self.write_memory(bp.addr.as_usize(), original_bytes)
            }
            BreakpointKind::Hardware { register_index } => {
                for tid in self.threads.tids() {
                    match self.tracer.clear_hw_breakpoint(tid, *register_index) {
                        Ok(()) | Err(TraceError::NoSuchThread(_)) => {}
                        Err(e) => return Err(self.handle_trace_err(e)),
                    }
                }
                self.arch.set_hw_slot_usage(*register_index, false);
                Ok(())
            }
        }
    }

    /// Remove the breakpoint at `addr` and restore the target state it patched.
    pub fn clear_breakpoint(&mut self, addr: RelocatedAddress) -> Result<Breakpoint, Error> {
        let bp = self
            .breakpoints
            .remove(addr)
            .ok_or(Error::NoBreakpointAt(addr))?;
        if !self.exited {
            self.disarm_breakpoint(&bp)?;
        }
        for tid in self.threads.tids() {
            if let Some(thread) = self.threads.thread_mut(tid) {
                if thread.current_breakpoint == Some(addr) {
                    thread.current_breakpoint = None;
                }
            }
        }
        Ok(bp)
    }

    /// Remove every user breakpoint.
    pub fn clear_all_breakpoints(&mut self) -> Result<(), Error> {
        let addrs: Vec<RelocatedAddress> = self
            .breakpoints
            .iter()
            .filter(|bp| !bp.temp)
            .map(|bp| bp.addr)
            .collect();
        for addr in addrs {
            self.clear_breakpoint(addr)?;
        }
        Ok(())
    }

    /// Remove and disarm every temporary breakpoint, keeping the first error.
    fn clear_temp_breakpoints(&mut self) -> Result<(), Error> {
        let temps = self.breakpoints.take_temporaries();
        let mut result = Ok(());
        for bp in temps {
            if self.exited {
                continue;
            }
            if let Err(e) = self.disarm_breakpoint(&bp) {
                if result.is_ok() {
                    result = Err(e);
                }
            }
            for tid in self.threads.tids() {
                if let Some(thread) = self.threads.thread_mut(tid) {
                    if thread.current_breakpoint == Some(bp.addr) {
                        thread.current_breakpoint = None;
                    }
                }
            }
        }
        result
    }

    pub fn breakpoints_snapshot(&self) -> Vec<Breakpoint> {
        let mut list: Vec<Breakpoint> = self.breakpoints.iter().cloned().collect();
        list.sort_by_key(|bp| (bp.temp, bp.id));
        list
    }

    /// Resolve a location string: `file:line`, a function name, a decimal
    /// breakpoint id, or a (hex) address.
    pub fn resolve_location(&self, loc: &str) -> Result<RelocatedAddress, Error> {
        if let Some((file, line)) = loc.rsplit_once(':') {
            let line: u64 = line
                .parse()
                .map_err(|_| Error::LocationNotFound(loc.to_string()))?;
            let place = self
                .debug_info
                .find_stmt_line(file, line)
                .ok_or_else(|| Error::LineNotFound(file.to_string(), line))?;
            return Ok(place.address.relocate(self.mapping_offset));
        }

        if let Some(function) = self.debug_info.function_by_name(loc) {
            return Ok(function.start.relocate(self.mapping_offset));
        }

        if let Some(hex) = loc.strip_prefix("0x").or_else(|| loc.strip_prefix("0X")) {
            let addr = usize::from_str_radix(hex, 16)
                .map_err(|_| Error::LocationNotFound(loc.to_string()))?;
            return Ok(RelocatedAddress::from(addr));
        }

        if let Ok(id) = loc.parse::<u32>() {
            if let Some(bp) = self.breakpoints.find_by_id(id) {
                return Ok(bp.addr);
            }
        }

        Err(Error::LocationNotFound(loc.to_string()))
    }

    pub fn set_breakpoint_at_location(&mut self, loc: &str) -> Result<u32, Error> {
        let addr = self.resolve_location(loc)?;
        self.set_breakpoint(addr)
    }

    pub fn clear_breakpoint_at_location(&mut self, loc: &str) -> Result<Breakpoint, Error> {
        let addr = self.resolve_location(loc)?;
        self.clear_breakpoint(addr)
    }

    /// Set a breakpoint at `file:line`.
    pub fn set_breakpoint_at_line(&mut self, file: &str, line: u64) -> Result<u32, Error> {
        let place = self
            .debug_info
            .find_stmt_line(file, line)
            .ok_or_else(|| Error::LineNotFound(file.to_string(), line))?;
        let addr = place.address.relocate(self.mapping_offset);
        self.set_breakpoint(addr)
    }

    /// Set a breakpoint at the entry of a function.
    pub fn set_breakpoint_at_fn(&mut self, name: &str) -> Result<u32, Error> {
        let function = self
            .debug_info
            .function_by_name(name)
            .ok_or_else(|| Error::SymbolNotFound(name.to_string()))?;
        let addr = function.start.relocate(self.mapping_offset);
        self.set_breakpoint(addr)
    }

    // ---------------------------------------------------------------------
    // thread control
    // ---------------------------------------------------------------------

    /// True when the thread's PC sits in runtime code known not to execute
    /// user code (parked on a futex, inside the scheduler glue).
    fn blocked(&self, tid: Pid) -> bool {
        let Ok(regs) = self.tracer.registers(tid) else {
            return false;
        };
        let global = regs.pc().into_global(self.mapping_offset);
        match self.debug_info.function_name_by_pc(global) {
            Some(name) => PARKED_FUNCTIONS.contains(&name),
            None => false,
        }
    }

    /// Stop one running thread and wait until the stop is observed.
    fn halt_thread(&mut self, tid: Pid) -> Result<(), Error> {
        if self.threads.status(tid) != ThreadStatus::Running {
            return Ok(());
        }
        match self.tracer.stop_thread(tid) {
            Ok(()) => {}
            Err(TraceError::NoSuchThread(_)) => {
                self.threads.remove(tid);
                return Ok(());
            }
            Err(e) => return Err(self.handle_trace_err(e)),
        }

        loop {
            match self.tracer.wait_thread(tid) {
                Ok(nix::sys::wait::WaitStatus::Stopped(_, Signal::SIGTRAP)) => {
                    // the thread hit a breakpoint right before the stop request,
                    // record the hit so it is not lost
                    self.threads.set_status(tid, ThreadStatus::Stopped);
                    weak_error!(self.recognize_breakpoint_hit(tid));
                    break;
                }
                Ok(nix::sys::wait::WaitStatus::Stopped(_, _)) => {
                    self.threads.set_status(tid, ThreadStatus::Stopped);
                    break;
                }
                Ok(nix::sys::wait::WaitStatus::Exited(_, _))
                | Ok(nix::sys::wait::WaitStatus::Signaled(_, _, _)) => {
                    self.threads.remove(tid);
                    break;
                }
                Ok(_) => {
                    self.threads.set_status(tid, ThreadStatus::Stopped);
                    break;
                }
                Err(TraceError::Interrupted) => continue,
                Err(TraceError::NoSuchThread(_)) => {
                    self.threads.remove(tid);
                    break;
                }
                Err(e) => return Err(self.handle_trace_err(e)),
            }
        }
        Ok(())
    }

    /// Stop every thread of the debugee.
    fn halt_all_threads(&mut self) -> Result<(), Error> {
        for tid in self.threads.tids() {
            self.halt_thread(tid)?;
        }
        Ok(())
    }

    /// Resume every stopped thread, stepping over breakpoints under their PCs.
    fn cont_all_threads(&mut self) -> Result<(), Error> {
        let stopped: Vec<Pid> = self
            .threads
            .snapshot()
            .into_iter()
            .filter(|t| t.is_stopped())
            .map(|t| t.pid)
            .collect();

        for &tid in &stopped {
            self.step_over_breakpoint(tid)?;
        }
        for &tid in &stopped {
            if !self.threads.has_thread(tid) {
                continue;
            }
            match self.tracer.cont(tid, None) {
                Ok(()) => self.threads.set_status(tid, ThreadStatus::Running),
                Err(TraceError::NoSuchThread(_)) => {
                    // it will be reaped by the wait loop
                    warn!(target: "debugger", "thread {tid} not found on continue");
                }
                Err(e) => return Err(self.handle_trace_err(e)),
            }
        }
        Ok(())
    }

    /// If the thread sits on an armed software breakpoint: transiently restore
    /// the original bytes, advance one instruction, re-arm the opcode.
    fn step_over_breakpoint(&mut self, tid: Pid) -> Result<(), Error> {
        let regs = match self.tracer.registers(tid) {
            Ok(regs) => regs,
            Err(TraceError::NoSuchThread(_)) => {
                self.threads.remove(tid);
                return Ok(());
            }
            Err(e) => return Err(self.handle_trace_err(e)),
        };
        let pc = regs.pc();

        let Some(bp) = self.breakpoints.get(pc) else {
            return Ok(());
        };
        let BreakpointKind::Software { original_bytes } = bp.kind.clone() else {
            return Ok(());
        };

        self.write_memory(pc.as_usize(), &original_bytes)?;
        let step_res = self.tracer.step(tid);
        self.write_memory(pc.as_usize(), self.arch.breakpoint_instruction())?;

        match step_res {
            Ok(nix::sys::wait::WaitStatus::Exited(_, _)) | Err(TraceError::NoSuchThread(_)) => {
                self.threads.remove(tid);
            }
            Ok(_) => {}
            Err(e) => return Err(self.handle_trace_err(e)),
        }
        Ok(())
    }

    /// Advance one thread a single instruction (with the transient-uninstall
    /// dance when it currently sits on a software breakpoint).
    fn single_step_thread(&mut self, tid: Pid) -> Result<(), Error> {
        if let Some(thread) = self.threads.thread_mut(tid) {
            thread.single_stepping = true;
        }
        let result = self.single_step_thread_inner(tid);
        if let Some(thread) = self.threads.thread_mut(tid) {
            thread.single_stepping = false;
        }
        result
    }

    fn single_step_thread_inner(&mut self, tid: Pid) -> Result<(), Error> {
        let pc = self
            .tracer
            .registers(tid)
            .map_err(|e| trace_to_error(tid, e))?
            .pc();

        if matches!(
            self.breakpoints.get(pc).map(|bp| &bp.kind),
            Some(BreakpointKind::Software { .. })
        ) {
            return self.step_over_breakpoint(tid);
        }

        match self.tracer.step(tid) {
            Ok(nix::sys::wait::WaitStatus::Exited(_, _)) | Err(TraceError::NoSuchThread(_)) => {
                self.threads.remove(tid);
                Ok(())
            }
            Ok(_) => Ok(()),
            Err(e) => Err(self.handle_trace_err(e)),
        }
    }

    /// Rewind PC after a software breakpoint hit and record the hit on the thread.
    /// Returns the breakpoint address when the stop was caused by a known breakpoint.
    fn recognize_breakpoint_hit(&mut self, tid: Pid) -> Result<Option<RelocatedAddress>, Error> {
        let mut regs = self
            .tracer
            .registers(tid)
            .map_err(|e| trace_to_error(tid, e))?;
        let pc = regs.pc();

        let Some(bp) = self.breakpoints.find_by_pc(pc, self.arch.breakpoint_size()) else {
            return Ok(None);
        };
        let (addr, is_hw) = (bp.addr, bp.is_hardware());

        if !is_hw && pc != addr {
            regs.set_pc(addr);
            self.tracer
                .set_registers(tid, regs)
                .map_err(|e| trace_to_error(tid, e))?;
        }
        if let Some(thread) = self.threads.thread_mut(tid) {
            thread.current_breakpoint = Some(addr);
        }
        Ok(Some(addr))
    }

    // ---------------------------------------------------------------------
    // the wait loop
    // ---------------------------------------------------------------------

    /// Wait until some thread traps, keeping the thread map in sync with
    /// clone/exit events along the way.
    ///
    /// On return the trapping thread is stopped, its PC rewound and its
    /// `current_breakpoint` recorded when the trap came from a known breakpoint.
    fn trap_wait(&mut self) -> Result<Pid, Error> {
        loop {
            let event = match self.tracer.wait_event() {
                Ok(event) => event,
                Err(TraceError::Interrupted) => continue,
                Err(e) => return Err(self.handle_trace_err(e)),
            };
            debug!(target: "debugger", "debugee event: {event:?}");

            match event {
                Event::Exited(code) => {
                    self.exited = true;
                    self.exit_status = code;
                    self.running = false;
                    self.hooks.on_exit(code);
                    return Err(Error::ProcessExited {
                        pid: self.pid(),
                        status: code,
                    });
                }
                Event::ThreadExited(tid) => {
                    self.threads.remove(tid);
                    continue;
                }
                Event::ThreadSpawned { parent, child } => {
                    self.threads.register(child);
                    match self.tracer.wait_thread(child) {
                        Ok(_) => {
                            if self.tracer.cont(child, None).is_ok() {
                                self.threads.set_status(child, ThreadStatus::Running);
                            }
                        }
                        Err(_) => {
                            // died between clone and attach
                            self.threads.remove(child);
                        }
                    }
                    if self.tracer.cont(parent, None).is_ok() {
                        self.threads.set_status(parent, ThreadStatus::Running);
                    }
                    continue;
                }
                Event::NoSuchThread(tid) => {
                    self.threads.remove(tid);
                    continue;
                }
                Event::Trap(tid, cause) => {
                    self.threads.register(tid);
                    self.threads.set_status(tid, ThreadStatus::Stopped);
                    if let Some(thread) = self.threads.thread_mut(tid) {
                        thread.wait_status =
                            sys::WaitStatus::stopped(Signal::SIGTRAP, Some(cause));
                    }

                    if cause == TrapCause::ExecEvent {
                        let _ = self.tracer.cont(tid, None);
                        self.threads.set_status(tid, ThreadStatus::Running);
                        continue;
                    }

                    if self.recognize_breakpoint_hit(tid)?.is_some() {
                        return Ok(tid);
                    }
                    if self.halt.load(Ordering::SeqCst) {
                        return Ok(tid);
                    }

                    let pc = self
                        .tracer
                        .registers(tid)
                        .map_err(|e| trace_to_error(tid, e))?
                        .pc();
                    let global = pc.into_global(self.mapping_offset);
                    if self.debug_info.function_name_by_pc(global) == Some(RUNTIME_BREAKPOINT_FN) {
                        // step twice to get back to user code
                        for _ in 0..2 {
                            self.single_step_thread(tid)?;
                        }
                        return Ok(tid);
                    }

                    return Err(Error::UnrecognizedStop(pc.as_u64()));
                }
                Event::SignalStop(tid, signal) => {
                    self.threads.register(tid);
                    self.threads.set_status(tid, ThreadStatus::Stopped);
                    if let Some(thread) = self.threads.thread_mut(tid) {
                        thread.wait_status = sys::WaitStatus::stopped(signal, None);
                    }

                    if signal == Signal::SIGSTOP {
                        // manual stop, or a group stop from outside: accept it
                        return Ok(tid);
                    }

                    self.hooks.on_signal(signal);
                    // deliver the signal to the debugee and keep waiting
                    if self.tracer.cont(tid, Some(signal)).is_ok() {
                        self.threads.set_status(tid, ThreadStatus::Running);
                    }
                    continue;
                }
            }
        }
    }

    // ---------------------------------------------------------------------
    // user-visible operations
    // ---------------------------------------------------------------------

    fn run_op(
        &mut self,
        f: impl FnOnce(&mut Self) -> Result<(), Error>,
    ) -> Result<(), Error> {
        if self.exited {
            return Err(Error::ProcessExited {
                pid: self.pid(),
                status: self.exit_status,
            });
        }
        self.running = true;
        self.halt.store(false, Ordering::SeqCst);
        self.threads.reset_stop_state();

        let result = f(self);
        self.running = false;
        result
    }

    /// Resume the whole debugee and wait for the next recognized stop.
    pub fn continue_execution(&mut self) -> Result<(), Error> {
        self.run_op(|dbg| {
            dbg.cont_all_threads()?;
            let tid = dbg.trap_wait()?;
            if dbg.threads.thread_in_focus() != tid {
                dbg.threads.set_thread_to_focus(tid);
            }
            dbg.halt_all_threads()?;
            dbg.report_stop(tid, true)
        })
    }

    /// Single-step every thread that is executing user code.
    pub fn step(&mut self) -> Result<(), Error> {
        self.run_op(|dbg| {
            let focus = dbg.threads.thread_in_focus();
            for tid in dbg.threads.tids() {
                if dbg.blocked(tid) {
                    continue;
                }
                dbg.single_step_thread(tid)?;
            }
            if !dbg.threads.has_thread(focus) {
                return Err(Error::ThreadExited(focus));
            }
            dbg.report_stop(focus, false)
        })
    }

    /// Step over one source line of the current task ("next").
    pub fn next(&mut self) -> Result<(), Error> {
        self.run_op(|dbg| {
            let result = dbg.next_inner();

            // temporary breakpoints are cleared on every exit path
            let cleanup = if dbg.exited {
                dbg.breakpoints.take_temporaries();
                Ok(())
            } else {
                dbg.halt_all_threads()
                    .and_then(|_| dbg.clear_temp_breakpoints())
            };

            result?;
            cleanup?;
            let focus = dbg.threads.thread_in_focus();
            dbg.report_stop(focus, false)
        })
    }

    fn next_inner(&mut self) -> Result<(), Error> {
        let current_tid = self.threads.thread_in_focus();
        let current_task = self.get_task_of_thread(current_tid)?;

        let chan_recv_count = self.set_chan_recv_breakpoints()?;

        // the function may be about to return into a deferred call
        if !current_task.defer_pc.is_null() {
            match self.set_temp_breakpoint(current_task.defer_pc) {
                Ok(_) | Err(Error::BreakpointExists(_)) => {}
                Err(e) => return Err(e),
            }
        }

        let mut task_exiting = false;
        let mut wait_count: isize = 0;
        for tid in self.threads.tids() {
            if self.blocked(tid) {
                continue;
            }
            wait_count += 1;
            match self.set_next_breakpoints(tid)? {
                SetNextOutcome::Planted => {}
                SetNextOutcome::TaskExiting { task_id } => {
                    wait_count = wait_count - 1 + chan_recv_count as isize;
                    if task_id == current_task.id {
                        task_exiting = true;
                    }
                }
            }
        }

        self.cont_all_threads()?;

        while wait_count > 0 {
            let tid = self.trap_wait()?;
            // a thread without a task descriptor is not running user code
            let trapped_task = muted_error!(self.get_task_of_thread(tid));
            let in_current_task = trapped_task
                .map(|t| t.id == current_task.id)
                .unwrap_or(false);
            if in_current_task || task_exiting {
                if self.threads.thread_in_focus() != tid {
                    self.threads.set_thread_to_focus(tid);
                }
            }
            wait_count -= 1;
        }
        Ok(())
    }

    /// For every task parked receiving on a channel, plant a temporary
    /// breakpoint at the return address of the blocking runtime call.
    fn set_chan_recv_breakpoints(&mut self) -> Result<usize, Error> {
        let mut recv_addrs: Vec<RelocatedAddress> = vec![];
        {
            let inspector = self.task_inspector();
            for task in inspector.enumerate()? {
                if !task.chan_recv_blocked() {
                    continue;
                }
                match inspector.chan_recv_return_addr(&task) {
                    Ok(addr) => recv_addrs.push(addr),
                    Err(Error::NullTaskAddress) => continue,
                    Err(e) => return Err(e),
                }
            }
        }

        let mut count = 0;
        for addr in recv_addrs {
            match self.set_temp_breakpoint(addr) {
                Ok(_) => count += 1,
                Err(Error::BreakpointExists(_)) | Err(Error::InvalidAddress(_)) => {}
                Err(e) => return Err(e),
            }
        }
        Ok(count)
    }

    /// Plant temporary breakpoints for one thread: every statement of the
    /// current function on a source line other than the current one, plus the
    /// function's return address. Stepping stays out of callees because only
    /// addresses of the current function are considered.
    fn set_next_breakpoints(&mut self, tid: Pid) -> Result<SetNextOutcome, Error> {
        let regs = self
            .tracer
            .registers(tid)
            .map_err(|e| trace_to_error(tid, e))?;
        let pc = regs.pc();
        let global = pc.into_global(self.mapping_offset);

        let function = self
            .debug_info
            .function_by_pc(global)
            .ok_or(Error::FunctionNotFound(pc))?
            .clone();
        let current_place = self
            .debug_info
            .find_place_from_pc(global)
            .map(|p| p.to_owned());

        // candidate stops inside the current function
        let mut covered = false;
        let mut candidates: Vec<RelocatedAddress> = vec![];
        for place in self
            .debug_info
            .stmt_places_between(function.start, function.end)
        {
            if place.address == global {
                covered = true;
            }
            let same_line = current_place
                .as_ref()
                .map(|cur| cur.file == place.file && cur.line_number == place.line_number)
                .unwrap_or(false);
            if !same_line && place.address != global {
                candidates.push(place.address.relocate(self.mapping_offset));
            }
        }

        // the function return address, recovered from frame information
        let unwinder = Unwinder::new(&self.debug_info, self.mapping_offset);
        let this = &*self;
        let return_addr = unwinder
            .caller_of(pc, regs.sp(), Some(regs.bp()), |addr, len| {
                this.read_memory(addr, len)
            })?
            .map(|(ret, _)| ret);

        // a frame that returns straight into the runtime's task exit routine
        // belongs to a task in its final moments
        if !covered {
            if let Some(ret) = return_addr {
                let ret_fn = self
                    .debug_info
                    .function_name_by_pc(ret.into_global(self.mapping_offset));
                if ret_fn == Some(TASK_EXIT_FN) {
                    let task_id = self.get_task_of_thread(tid)?.id;
                    return Ok(SetNextOutcome::TaskExiting { task_id });
                }
            }
        }

        for addr in candidates {
            match self.set_temp_breakpoint(addr) {
                Ok(_) | Err(Error::BreakpointExists(_)) => {}
                Err(e) => return Err(e),
            }
        }
        if let Some(ret) = return_addr {
            if !ret.is_null() {
                match self.set_temp_breakpoint(ret) {
                    Ok(_) | Err(Error::BreakpointExists(_)) | Err(Error::InvalidAddress(_)) => {}
                    Err(e) => return Err(e),
                }
            }
        }

        Ok(SetNextOutcome::Planted)
    }

    /// Stop the whole debugee. Idempotent: halting a stopped process is a no-op.
    pub fn halt(&mut self) -> Result<(), Error> {
        if self.exited {
            return Ok(());
        }
        self.halt.store(true, Ordering::SeqCst);
        self.halt_all_threads()?;
        self.running = false;
        Ok(())
    }

    /// Change the thread in focus.
    pub fn switch_thread(&mut self, tid: Pid) -> Result<(), Error> {
        if !self.threads.has_thread(tid) {
            return Err(Error::NoSuchThread(tid));
        }
        self.threads.set_thread_to_focus(tid);
        Ok(())
    }

    /// Synchronously kill the debugee: halt, disarm breakpoints, SIGKILL the
    /// process group, reap the exit status.
    pub fn kill(&mut self) -> Result<(), Error> {
        if self.exited {
            return Ok(());
        }
        self.halt.store(true, Ordering::SeqCst);
        self.halt_all_threads()?;

        let bps = self.breakpoints_snapshot();
        for bp in &bps {
            weak_error!(self.disarm_breakpoint(bp), "disarm on kill:");
        }

        let status = self
            .tracer
            .kill_and_reap()
            .map_err(|e| trace_to_error(self.pid(), e))?;
        self.exited = true;
        self.exit_status = status;
        self.running = false;
        self.hooks.on_exit(status);
        Ok(())
    }

    /// Release trace control, optionally killing the debugee.
    pub fn detach(&mut self, kill: bool) -> Result<(), Error> {
        if self.exited {
            return Ok(());
        }
        self.halt_all_threads()?;

        let addrs = self.breakpoints.addresses();
        for addr in addrs {
            weak_error!(self.clear_breakpoint(addr), "clear on detach:");
        }

        let signal = kill.then_some(Signal::SIGINT);
        for tid in self.threads.tids() {
            match self.tracer.detach_thread(tid, signal) {
                Ok(()) | Err(TraceError::NoSuchThread(_)) => {}
                Err(e) => return Err(self.handle_trace_err(e)),
            }
        }
        self.exited = true;
        Ok(())
    }

    // ---------------------------------------------------------------------
    // inspection
    // ---------------------------------------------------------------------

    /// Current PC of the focused thread.
    pub fn current_pc(&self) -> Result<RelocatedAddress, Error> {
        let tid = self.threads.thread_in_focus();
        Ok(self
            .tracer
            .registers(tid)
            .map_err(|e| trace_to_error(tid, e))?
            .pc())
    }

    /// Source position of the focused thread.
    pub fn current_place(&self) -> Result<Option<PlaceDescriptorOwned>, Error> {
        let pc = self.current_pc()?;
        Ok(self
            .debug_info
            .find_place_from_pc(pc.into_global(self.mapping_offset))
            .map(|p| p.to_owned()))
    }

    /// The breakpoint the focused thread is currently stopped on.
    pub fn current_breakpoint(&self) -> Option<Breakpoint> {
        let tid = self.threads.thread_in_focus();
        let addr = self.threads.thread(tid)?.current_breakpoint?;
        self.breakpoints.get(addr).cloned()
    }

    /// Snapshot of every known thread with its source position.
    pub fn thread_state(&self) -> Vec<ThreadSnapshot> {
        let focus = self.threads.thread_in_focus();
        self.threads
            .snapshot()
            .into_iter()
            .map(|thread| {
                let place = self
                    .tracer
                    .registers(thread.pid)
                    .ok()
                    .and_then(|regs| {
                        self.debug_info
                            .find_place_from_pc(regs.pc().into_global(self.mapping_offset))
                    })
                    .map(|p| p.to_owned());
                let function = self
                    .tracer
                    .registers(thread.pid)
                    .ok()
                    .and_then(|regs| {
                        self.debug_info
                            .function_name_by_pc(regs.pc().into_global(self.mapping_offset))
                    })
                    .map(ToString::to_string);
                ThreadSnapshot {
                    in_focus: thread.pid == focus,
                    thread,
                    place,
                    function,
                }
            })
            .collect()
    }

    /// Call stack of one OS thread.
    pub fn backtrace(&self, tid: Pid, depth: usize) -> Result<Backtrace, Error> {
        let regs = self
            .tracer
            .registers(tid)
            .map_err(|e| trace_to_error(tid, e))?;
        let unwinder = Unwinder::new(&self.debug_info, self.mapping_offset);
        unwinder.unwind(
            regs.pc(),
            regs.sp(),
            Some(regs.bp()),
            depth,
            |addr, len| self.read_memory(addr, len),
        )
    }

    /// Enumerate the tasks of the target runtime, correlating each with the
    /// OS thread currently running it (if any).
    pub fn goroutines(&self) -> Result<Vec<Goroutine>, Error> {
        let mut tasks = self.task_inspector().enumerate()?;

        let mut thread_of_task: HashMap<u64, Pid> = HashMap::new();
        for tid in self.threads.tids() {
            if self.blocked(tid) {
                continue;
            }
            if let Some(task) = muted_error!(self.get_task_of_thread(tid), "task of thread:") {
                thread_of_task.insert(task.id, tid);
            }
        }
        for task in &mut tasks {
            task.thread = thread_of_task.get(&task.id).copied();
        }
        Ok(tasks)
    }

    /// Call stack of one task. A task running on an OS thread is unwound from
    /// live registers, a parked one from its saved context.
    pub fn goroutine_stacktrace(
        &self,
        task: &Goroutine,
        depth: usize,
    ) -> Result<Backtrace, Error> {
        match task.thread {
            Some(tid) => self.backtrace(tid, depth),
            None => self.task_inspector().stacktrace(task, depth),
        }
    }

    /// The task currently scheduled onto an OS thread, read through the
    /// thread's TLS slot.
    fn get_task_of_thread(&self, tid: Pid) -> Result<Goroutine, Error> {
        let regs = self
            .tracer
            .registers(tid)
            .map_err(|e| trace_to_error(tid, e))?;

        #[cfg(target_os = "linux")]
        let slot = (regs.value(Register::FsBase) as usize).wrapping_sub(self.arch.ptr_size());
        #[cfg(target_os = "macos")]
        let slot = regs.value(Register::GsBase) as usize + 0x30;

        let ptr_bytes = self.read_memory(slot, self.arch.ptr_size())?;
        let descr_ptr = usize::from_ne_bytes(
            ptr_bytes
                .try_into()
                .map_err(|_| Error::NullTaskAddress)?,
        );

        let mut task = self
            .task_inspector()
            .parse_descriptor(RelocatedAddress::from(descr_ptr))?;
        task.thread = Some(tid);
        Ok(task)
    }

    fn report_stop(&self, tid: Pid, breakpoint: bool) -> Result<(), Error> {
        let pc = match self.tracer.registers(tid) {
            Ok(regs) => regs.pc(),
            Err(_) => return Ok(()),
        };
        let place = self
            .debug_info
            .find_place_from_pc(pc.into_global(self.mapping_offset))
            .map(|p| p.to_owned());
        let result = if breakpoint {
            self.hooks.on_breakpoint(pc, place)
        } else {
            self.hooks.on_step(pc, place)
        };
        result.map_err(Error::Hook)
    }
}

impl Drop for Debugger {
    fn drop(&mut self) {
        if self.exited {
            return;
        }
        if self.process.is_external() {
            weak_error!(self.detach(false), "detach on drop:");
        } else {
            weak_error!(self.kill(), "kill on drop:");
        }
    }
}

fn trace_to_error(pid: Pid, e: TraceError) -> Error {
    match e {
        TraceError::NoSuchThread(tid) => Error::NoSuchThread(tid),
        TraceError::NotPermitted(tid) => Error::NotPermitted(tid),
        TraceError::Interrupted => Error::Interrupted,
        TraceError::TargetExited(status) => Error::ProcessExited { pid, status },
        TraceError::TransientOs(errno) | TraceError::Other(errno) => {
            Error::Ptrace(errno)
        }
    }
}

/// Offset of the executable mapping in the debugee VAS, zero for
/// non-relocatable binaries.
#[cfg(target_os = "linux")]
fn define_mapping_offset(
    pid: Pid,
    process: &Child<Installed>,
    debug_info: &DebugInfo,
) -> Result<usize, Error> {
    if !debug_info.needs_relocation() {
        return Ok(0);
    }

    let absolute_path = process.program_path().canonicalize()?;
    let maps =
        proc_maps::get_process_maps(pid.as_raw()).map_err(|_| Error::MappingOffsetNotFound)?;
    maps.into_iter()
        .filter(|map| map.filename() == Some(absolute_path.as_path()))
        .map(|map| map.start())
        .min()
        .ok_or(Error::MappingOffsetNotFound)
}

#[cfg(target_os = "macos")]
fn define_mapping_offset(
    _pid: Pid,
    _process: &Child<Installed>,
    debug_info: &DebugInfo,
) -> Result<usize, Error> {
    if !debug_info.needs_relocation() {
        return Ok(0);
    }
    // the dynamic loader reports image slide through the task's dyld info,
    // position-independent executables are not supported on this OS yet
    Err(Error::MappingOffsetNotFound)
}
