use crate::debugger::address::RelocatedAddress;
use crate::debugger::error::Error;
use nix::unistd::Pid;

#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub enum Register {
    Rax,
    Rbx,
    Rcx,
    Rdx,
    Rdi,
    Rsi,
    Rbp,
    Rsp,
    R8,
    R9,
    R10,
    R11,
    R12,
    R13,
    R14,
    R15,
    Rip,
    Eflags,
    Cs,
    OrigRax,
    FsBase,
    GsBase,
    Fs,
    Gs,
    Ss,
    Ds,
    Es,
}

pub struct RegisterDescription {
    pub r: Register,
    pub dwarf_num: i32,
    pub name: &'static str,
}

impl RegisterDescription {
    const fn new(reg: Register, dwarf_num: i32, name: &'static str) -> Self {
        Self {
            r: reg,
            dwarf_num,
            name,
        }
    }
}

pub const LIST: [RegisterDescription; 27] = [
    RegisterDescription::new(Register::Rip, 16, "rip"),
    RegisterDescription::new(Register::OrigRax, -1, "orig_rax"),
    RegisterDescription::new(Register::Rax, 0, "rax"),
    RegisterDescription::new(Register::Rdx, 1, "rdx"),
    RegisterDescription::new(Register::Rcx, 2, "rcx"),
    RegisterDescription::new(Register::Rbx, 3, "rbx"),
    RegisterDescription::new(Register::Rsi, 4, "rsi"),
    RegisterDescription::new(Register::Rdi, 5, "rdi"),
    RegisterDescription::new(Register::Rbp, 6, "rbp"),
    RegisterDescription::new(Register::Rsp, 7, "rsp"),
    RegisterDescription::new(Register::R8, 8, "r8"),
    RegisterDescription::new(Register::R9, 9, "r9"),
    RegisterDescription::new(Register::R10, 10, "r10"),
    RegisterDescription::new(Register::R11, 11, "r11"),
    RegisterDescription::new(Register::R12, 12, "r12"),
    RegisterDescription::new(Register::R13, 13, "r13"),
    RegisterDescription::new(Register::R14, 14, "r14"),
    RegisterDescription::new(Register::R15, 15, "r15"),
    RegisterDescription::new(Register::Eflags, 49, "eflags"),
    RegisterDescription::new(Register::Es, 50, "es"),
    RegisterDescription::new(Register::Cs, 51, "cs"),
    RegisterDescription::new(Register::Ss, 52, "ss"),
    RegisterDescription::new(Register::Ds, 53, "ds"),
    RegisterDescription::new(Register::Fs, 54, "fs"),
    RegisterDescription::new(Register::Gs, 55, "gs"),
    RegisterDescription::new(Register::FsBase, 58, "fs_base"),
    RegisterDescription::new(Register::GsBase, 59, "gs_base"),
];

pub fn register_from_name(name: &str) -> Result<Register, Error> {
    LIST.iter()
        .find_map(|r| if r.name == name { Some(r.r) } else { None })
        .ok_or_else(|| Error::SymbolNotFound(name.to_string()))
}

/// Snapshot of one thread general purpose registers.
/// A snapshot must be written back with [`RegisterMap::persist`] for updates to take effect.
#[derive(Clone, Copy)]
pub struct RegisterMap {
    #[cfg(target_os = "linux")]
    regs: nix::libc::user_regs_struct,
    #[cfg(target_os = "macos")]
    regs: mach2::structs::x86_thread_state64_t,
}

#[cfg(target_os = "linux")]
impl RegisterMap {
    /// Read registers of a stopped thread.
    ///
    /// Must be called from the thread that traces `pid` (see [`crate::debugger::gate`]).
    pub fn current(pid: Pid) -> Result<Self, nix::Error> {
        Ok(Self {
            regs: nix::sys::ptrace::getregs(pid)?,
        })
    }

    pub fn value(&self, reg: Register) -> u64 {
        match reg {
            Register::Rax => self.regs.rax,
            Register::Rbx => self.regs.rbx,
            Register::Rcx => self.regs.rcx,
            Register::Rdx => self.regs.rdx,
            Register::Rdi => self.regs.rdi,
            Register::Rsi => self.regs.rsi,
            Register::Rbp => self.regs.rbp,
            Register::Rsp => self.regs.rsp,
            Register::R8 => self.regs.r8,
            Register::R9 => self.regs.r9,
            Register::R10 => self.regs.r10,
            Register::R11 => self.regs.r11,
            Register::R12 => self.regs.r12,
            Register::R13 => self.regs.r13,
            Register::R14 => self.regs.r14,
            Register::R15 => self.regs.r15,
            Register::Rip => self.regs.rip,
            Register::Eflags => self.regs.eflags,
            Register::Cs => self.regs.cs,
            Register::OrigRax => self.regs.orig_rax,
            Register::FsBase => self.regs.fs_base,
            Register::GsBase => self.regs.gs_base,
            Register::Fs => self.regs.fs,
            Register::Gs => self.regs.gs,
            Register::Ss => self.regs.ss,
            Register::Ds => self.regs.ds,
            Register::Es => self.regs.es,
        }
    }

    pub fn update(&mut self, reg: Register, value: u64) {
        match reg {
            Register::Rax => self.regs.rax = value,
            Register::Rbx => self.regs.rbx = value,
            Register::Rcx => self.regs.rcx = value,
            Register::Rdx => self.regs.rdx = value,
            Register::Rdi => self.regs.rdi = value,
            Register::Rsi => self.regs.rsi = value,
            Register::Rbp => self.regs.rbp = value,
            Register::Rsp => self.regs.rsp = value,
            Register::R8 => self.regs.r8 = value,
            Register::R9 => self.regs.r9 = value,
            Register::R10 => self.regs.r10 = value,
            Register::R11 => self.regs.r11 = value,
            Register::R12 => self.regs.r12 = value,
            Register::R13 => self.regs.r13 = value,
            Register::R14 => self.regs.r14 = value,
            Register::R15 => self.regs.r15 = value,
            Register::Rip => self.regs.rip = value,
            Register::Eflags => self.regs.eflags = value,
            Register::Cs => self.regs.cs = value,
            Register::OrigRax => self.regs.orig_rax = value,
            Register::FsBase => self.regs.fs_base = value,
            Register::GsBase => self.regs.gs_base = value,
            Register::Fs => self.regs.fs = value,
            Register::Gs => self.regs.gs = value,
            Register::Ss => self.regs.ss = value,
            Register::Ds => self.regs.ds = value,
            Register::Es => self.regs.es = value,
        };
    }

    /// Write snapshot back into a stopped thread.
    ///
    /// Must be called from the thread that traces `pid` (see [`crate::debugger::gate`]).
    pub fn persist(&self, pid: Pid) -> Result<(), nix::Error> {
        nix::sys::ptrace::setregs(pid, self.regs)
    }
}

#[cfg(target_os = "macos")]
impl RegisterMap {
    pub fn from_thread_state(state: mach2::structs::x86_thread_state64_t) -> Self {
        Self { regs: state }
    }

    pub fn into_thread_state(self) -> mach2::structs::x86_thread_state64_t {
        self.regs
    }

    pub fn rflags(&self) -> u64 {
        self.regs.__rflags
    }

    pub fn set_rflags(&mut self, value: u64) {
        self.regs.__rflags = value;
    }

    pub fn value(&self, reg: Register) -> u64 {
        match reg {
            Register::Rax => self.regs.__rax,
            Register::Rbx => self.regs.__rbx,
            Register::Rcx => self.regs.__rcx,
            Register::Rdx => self.regs.__rdx,
            Register::Rdi => self.regs.__rdi,
            Register::Rsi => self.regs.__rsi,
            Register::Rbp => self.regs.__rbp,
            Register::Rsp => self.regs.__rsp,
            Register::R8 => self.regs.__r8,
            Register::R9 => self.regs.__r9,
            Register::R10 => self.regs.__r10,
            Register::R11 => self.regs.__r11,
            Register::R12 => self.regs.__r12,
            Register::R13 => self.regs.__r13,
            Register::R14 => self.regs.__r14,
            Register::R15 => self.regs.__r15,
            Register::Rip => self.regs.__rip,
            Register::Eflags => self.regs.__rflags,
            Register::Cs => self.regs.__cs,
            Register::Fs => self.regs.__fs,
            Register::Gs => self.regs.__gs,
            // not part of the basic thread state on this OS
            _ => 0,
        }
    }

    pub fn update(&mut self, reg: Register, value: u64) {
        match reg {
            Register::Rax => self.regs.__rax = value,
            Register::Rbx => self.regs.__rbx = value,
            Register::Rcx => self.regs.__rcx = value,
            Register::Rdx => self.regs.__rdx = value,
            Register::Rdi => self.regs.__rdi = value,
            Register::Rsi => self.regs.__rsi = value,
            Register::Rbp => self.regs.__rbp = value,
            Register::Rsp => self.regs.__rsp = value,
            Register::R8 => self.regs.__r8 = value,
            Register::R9 => self.regs.__r9 = value,
            Register::R10 => self.regs.__r10 = value,
            Register::R11 => self.regs.__r11 = value,
            Register::R12 => self.regs.__r12 = value,
            Register::R13 => self.regs.__r13 = value,
            Register::R14 => self.regs.__r14 = value,
            Register::R15 => self.regs.__r15 = value,
            Register::Rip => self.regs.__rip = value,
            Register::Eflags => self.regs.__rflags = value,
            Register::Cs => self.regs.__cs = value,
            Register::Fs => self.regs.__fs = value,
            Register::Gs => self.regs.__gs = value,
            _ => {}
        }
    }
}

impl RegisterMap {
    pub fn pc(&self) -> RelocatedAddress {
        RelocatedAddress::from(self.value(Register::Rip))
    }

    pub fn sp(&self) -> RelocatedAddress {
        RelocatedAddress::from(self.value(Register::Rsp))
    }

    pub fn bp(&self) -> RelocatedAddress {
        RelocatedAddress::from(self.value(Register::Rbp))
    }

    pub fn set_pc(&mut self, value: RelocatedAddress) {
        self.update(Register::Rip, value.as_u64());
    }

    /// Register value by its dwarf number, used by the frame unwinder.
    pub fn value_dwarf(&self, dwarf_num: u16) -> Option<u64> {
        let descr = LIST.iter().find(|r| r.dwarf_num == dwarf_num as i32)?;
        Some(self.value(descr.r))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_register_from_name() {
        assert!(matches!(register_from_name("rip"), Ok(Register::Rip)));
        assert!(matches!(register_from_name("rsp"), Ok(Register::Rsp)));
        assert!(register_from_name("xmm0").is_err());
    }

    #[test]
    fn test_dwarf_numbering() {
        // stack pointer is dwarf register 7, return address column is 16 on amd64
        assert_eq!(
            LIST.iter().find(|d| d.dwarf_num == 7).map(|d| d.r),
            Some(Register::Rsp)
        );
        assert_eq!(
            LIST.iter().find(|d| d.dwarf_num == 16).map(|d| d.r),
            Some(Register::Rip)
        );
    }
}
