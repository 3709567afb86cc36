use crate::debugger::address::RelocatedAddress;
use nix::unistd::Pid;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    // --------------------------------- generic errors --------------------------------------------
    #[error(transparent)]
    IO(#[from] std::io::Error),

    // --------------------------------- target state errors ---------------------------------------
    #[error("process {pid} has exited with status {status}")]
    ProcessExited { pid: Pid, status: i32 },
    #[error("thread {0} has exited")]
    ThreadExited(Pid),
    #[error("thread {0} does not exist")]
    NoSuchThread(Pid),
    #[error("manual stop requested")]
    ManualStop,

    // --------------------------------- breakpoint errors -----------------------------------------
    #[error("breakpoint already exists at {0}")]
    BreakpointExists(RelocatedAddress),
    #[error("no breakpoint at {0}")]
    NoBreakpointAt(RelocatedAddress),
    #[error("address {0} lies in no known function")]
    InvalidAddress(RelocatedAddress),

    // --------------------------------- syscall errors --------------------------------------------
    #[error("operation not permitted on thread {0}")]
    NotPermitted(Pid),
    #[error("trace operation interrupted")]
    Interrupted,
    #[error("waitpid syscall error: {0}")]
    Waitpid(nix::Error),
    #[error("ptrace syscall error: {0}")]
    Ptrace(nix::Error),

    // --------------------------------- debug information errors ----------------------------------
    #[error("no debug information for {0}")]
    NoDebugInformation(&'static str),
    #[error("symbol not found: {0}")]
    SymbolNotFound(String),
    #[error("no line found for {0}:{1}")]
    LineNotFound(String, u64),
    #[error("function not found at address {0}")]
    FunctionNotFound(RelocatedAddress),
    #[error("unable to find location for {0}")]
    LocationNotFound(String),
    #[error("memory region offset not found")]
    MappingOffsetNotFound,

    // --------------------------------- parsing errors --------------------------------------------
    #[error("dwarf file parsing error: {0}")]
    DwarfParsing(#[from] gimli::Error),
    #[error("object file parsing error: {0}")]
    ObjParsing(#[from] object::Error),

    // --------------------------------- unwind errors ---------------------------------------------
    #[error("unwind: unsupported frame rule")]
    UnwindUnsupportedRule,

    // --------------------------------- runtime inspection errors ---------------------------------
    #[error("task descriptor at null address")]
    NullTaskAddress,
    #[error("runtime type layout missing member `{0}.{1}`")]
    LayoutMember(&'static str, &'static str),

    // --------------------------------- engine invariant violations -------------------------------
    #[error("unrecognized stop at {0:#x}")]
    UnrecognizedStop(u64),

    // --------------------------------- third party errors ----------------------------------------
    #[error("hook: {0}")]
    Hook(anyhow::Error),
}

impl Error {
    /// Return a hint to an interface - continue debugging after error or stop whole process.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Error::ProcessExited { .. } | Error::DwarfParsing(_) | Error::ObjParsing(_)
        )
    }
}

#[macro_export]
macro_rules! _error {
    ($log_fn: path, $res: expr) => {
        match $res {
            Ok(value) => Some(value),
            Err(e) => {
                $log_fn!(target: "debugger", "{:#}", e);
                None
            }
        }
    };
    ($log_fn: path, $res: expr, $msg: tt) => {
        match $res {
            Ok(value) => Some(value),
            Err(e) => {
                $log_fn!(target: "debugger", concat!($msg, " {:#}"), e);
                None
            }
        }
    };
}

/// Transforms `Result` into `Option` and logs an error if it occurs.
#[macro_export]
macro_rules! weak_error {
    ($res: expr) => {
        $crate::_error!(log::warn, $res)
    };
    ($res: expr, $msg: tt) => {
        $crate::_error!(log::warn, $res, $msg)
    };
}

/// Transforms `Result` into `Option` and put error into debug logs if it occurs.
#[macro_export]
macro_rules! muted_error {
    ($res: expr) => {
        $crate::_error!(log::debug, $res)
    };
    ($res: expr, $msg: tt) => {
        $crate::_error!(log::debug, $res, $msg)
    };
}
