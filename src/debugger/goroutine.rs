use crate::debugger::address::RelocatedAddress;
use crate::debugger::debug_info::DebugInfo;
use crate::debugger::error::Error;
use crate::debugger::unwind::{Backtrace, Unwinder};
use nix::unistd::Pid;

/// Runtime status values of a task descriptor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GoStatus {
    Idle,
    Runnable,
    Running,
    Syscall,
    Waiting,
    Dead,
    Other(u32),
}

impl GoStatus {
    fn from_raw(raw: u32) -> Self {
        match raw {
            0 => GoStatus::Idle,
            1 => GoStatus::Runnable,
            2 => GoStatus::Running,
            3 => GoStatus::Syscall,
            4 => GoStatus::Waiting,
            6 => GoStatus::Dead,
            other => GoStatus::Other(other),
        }
    }

    pub fn render(&self) -> String {
        match self {
            GoStatus::Idle => "idle".to_string(),
            GoStatus::Runnable => "runnable".to_string(),
            GoStatus::Running => "running".to_string(),
            GoStatus::Syscall => "syscall".to_string(),
            GoStatus::Waiting => "waiting".to_string(),
            GoStatus::Dead => "dead".to_string(),
            GoStatus::Other(raw) => format!("unknown ({raw})"),
        }
    }
}

/// One user-space task of the target runtime. Constructed lazily by reading
/// the descriptor out of target memory, never retained across a resume.
#[derive(Debug, Clone)]
pub struct Goroutine {
    pub id: u64,
    pub status: GoStatus,
    /// Saved program counter (valid when the task is off an OS thread).
    pub pc: RelocatedAddress,
    /// Saved stack pointer.
    pub sp: RelocatedAddress,
    /// Reason the task is parked, when the runtime recorded one.
    pub wait_reason: Option<String>,
    /// Entry of a pending deferred call, null when none.
    pub defer_pc: RelocatedAddress,
    /// OS thread currently running this task, if any.
    pub thread: Option<Pid>,
    /// Descriptor address in target memory.
    pub raw_ptr: RelocatedAddress,
}

impl Goroutine {
    /// True when the task is parked receiving on a channel - such tasks may be
    /// rescheduled onto any thread once the send happens, the step-over
    /// algorithm plants a temporary breakpoint at their resume point.
    pub fn chan_recv_blocked(&self) -> bool {
        self.status == GoStatus::Waiting
            && self
                .wait_reason
                .as_deref()
                .is_some_and(|reason| reason == "chan receive")
    }
}

/// Reads task descriptors out of the target runtime.
///
/// The runtime keeps every task in a global array: `allg` points at the
/// array of descriptor pointers, `allglen` holds its length.
pub struct TaskInspector<'a, F>
where
    F: Fn(usize, usize) -> Result<Vec<u8>, Error>,
{
    debug_info: &'a DebugInfo,
    mapping_offset: usize,
    ptr_size: usize,
    read_memory: F,
}

impl<'a, F> TaskInspector<'a, F>
where
    F: Fn(usize, usize) -> Result<Vec<u8>, Error>,
{
    pub fn new(
        debug_info: &'a DebugInfo,
        mapping_offset: usize,
        ptr_size: usize,
        read_memory: F,
    ) -> Self {
        Self {
            debug_info,
            mapping_offset,
            ptr_size,
            read_memory,
        }
    }

    fn read_word(&self, addr: usize) -> Result<u64, Error> {
        let bytes = (self.read_memory)(addr, 8)?;
        Ok(u64::from_ne_bytes(
            bytes.try_into().expect("read_memory returns len bytes"),
        ))
    }

    fn read_u32(&self, addr: usize) -> Result<u32, Error> {
        let bytes = (self.read_memory)(addr, 4)?;
        Ok(u32::from_ne_bytes(
            bytes.try_into().expect("read_memory returns len bytes"),
        ))
    }

    fn global_addr(&self, name: &str) -> Result<usize, Error> {
        let sym = self
            .debug_info
            .global_variable(name)
            .ok_or_else(|| Error::SymbolNotFound(name.to_string()))?;
        Ok(sym.addr.relocate(self.mapping_offset).as_usize())
    }

    fn member_offset(&self, type_name: &'static str, member: &'static str) -> Result<u64, Error> {
        self.debug_info
            .struct_layout(type_name)?
            .ok_or(Error::NoDebugInformation("runtime type information"))?
            .offset(member)
            .ok_or(Error::LayoutMember(type_name, member))
    }

    /// Walk the runtime task list and parse every descriptor.
    pub fn enumerate(&self) -> Result<Vec<Goroutine>, Error> {
        let allglen = self.read_word(self.global_addr("runtime.allglen")?)?;
        let allg = self.read_word(self.global_addr("runtime.allg")?)? as usize;

        let mut tasks = Vec::with_capacity(allglen as usize);
        for i in 0..allglen as usize {
            let descr_ptr = self.read_word(allg + i * self.ptr_size)? as usize;
            if descr_ptr == 0 {
                continue;
            }
            tasks.push(self.parse_descriptor(RelocatedAddress::from(descr_ptr))?);
        }
        Ok(tasks)
    }

    /// Parse one task descriptor at `addr`.
    pub fn parse_descriptor(&self, addr: RelocatedAddress) -> Result<Goroutine, Error> {
        if addr.is_null() {
            return Err(Error::NullTaskAddress);
        }
        let base = addr.as_usize();

        let id = self.read_word(base + self.member_offset("runtime.g", "goid")? as usize)?;
        let raw_status =
            self.read_u32(base + self.member_offset("runtime.g", "atomicstatus")? as usize)?;

        let sched = base + self.member_offset("runtime.g", "sched")? as usize;
        let pc = self.read_word(sched + self.member_offset("runtime.gobuf", "pc")? as usize)?;
        let sp = self.read_word(sched + self.member_offset("runtime.gobuf", "sp")? as usize)?;

        let wait_reason =
            self.read_wait_reason(base + self.member_offset("runtime.g", "waitreason")? as usize)?;
        let defer_pc = self.read_defer_pc(base)?;

        Ok(Goroutine {
            id,
            status: GoStatus::from_raw(raw_status),
            pc: RelocatedAddress::from(pc),
            sp: RelocatedAddress::from(sp),
            wait_reason,
            defer_pc: RelocatedAddress::from(defer_pc),
            thread: None,
            raw_ptr: addr,
        })
    }

    /// The runtime records the park reason as a string header (pointer, length).
    /// Runtimes that encode the reason differently yield an implausible header,
    /// treated as no reason at all.
    fn read_wait_reason(&self, addr: usize) -> Result<Option<String>, Error> {
        let str_ptr = self.read_word(addr)? as usize;
        let str_len = self.read_word(addr + self.ptr_size)? as usize;
        if str_ptr == 0 || str_len == 0 || str_len > 64 {
            return Ok(None);
        }
        let Ok(bytes) = (self.read_memory)(str_ptr, str_len) else {
            return Ok(None);
        };
        match String::from_utf8(bytes) {
            Ok(reason) => Ok(Some(reason)),
            Err(_) => Ok(None),
        }
    }

    /// Entry point of a pending deferred call: descriptor holds a pointer to a
    /// defer record whose `fn` member points at a funcval, the funcval's first
    /// word is the code address.
    fn read_defer_pc(&self, g_base: usize) -> Result<u64, Error> {
        let defer_ptr =
            self.read_word(g_base + self.member_offset("runtime.g", "_defer")? as usize)? as usize;
        if defer_ptr == 0 {
            return Ok(0);
        }
        let fn_ptr = self
            .read_word(defer_ptr + self.member_offset("runtime._defer", "fn")? as usize)?
            as usize;
        if fn_ptr == 0 {
            return Ok(0);
        }
        self.read_word(fn_ptr)
    }

    /// Call stack of a parked task, seeded from its saved context.
    pub fn stacktrace(&self, task: &Goroutine, depth: usize) -> Result<Backtrace, Error> {
        if task.pc.is_null() || task.sp.is_null() {
            return Err(Error::NullTaskAddress);
        }
        let unwinder = Unwinder::new(self.debug_info, self.mapping_offset);
        unwinder.unwind(task.pc, task.sp, None, depth, &self.read_memory)
    }

    /// Return address of the runtime function a task is blocked in: the deepest
    /// frame reachable within a few steps of unwinding from the saved context.
    /// The step-over algorithm parks a temporary breakpoint there.
    pub fn chan_recv_return_addr(&self, task: &Goroutine) -> Result<RelocatedAddress, Error> {
        let bt = self.stacktrace(task, 4)?;
        let last = bt.last().ok_or(Error::NullTaskAddress)?;
        Ok(last.ip)
    }
}
