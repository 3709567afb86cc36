use crate::debugger::address::RelocatedAddress;
use crate::debugger::debug_info::frame::ReturnAddressRule;
use crate::debugger::debug_info::lines::PlaceDescriptorOwned;
use crate::debugger::debug_info::DebugInfo;
use crate::debugger::error::Error;

/// Dwarf numbers of the registers the unwinder tracks.
const DWARF_RBP: gimli::Register = gimli::Register(6);
const DWARF_RSP: gimli::Register = gimli::Register(7);

/// Represents detailed information about single stack frame in the unwind path.
#[derive(Debug, Clone)]
pub struct FrameSpan {
    pub ip: RelocatedAddress,
    pub func_name: Option<String>,
    pub place: Option<PlaceDescriptorOwned>,
}

pub type Backtrace = Vec<FrameSpan>;

/// Call stack unwinder driven by call-frame information.
///
/// Works from a (pc, sp) seed instead of a full register file so it can walk
/// both live threads and tasks that only have a saved context. The walk stops
/// on a null return address, a frame with no unwind information, or a frame
/// whose recovery needs state the seed does not carry.
pub struct Unwinder<'a> {
    debug_info: &'a DebugInfo,
    mapping_offset: usize,
}

impl<'a> Unwinder<'a> {
    pub fn new(debug_info: &'a DebugInfo, mapping_offset: usize) -> Self {
        Self {
            debug_info,
            mapping_offset,
        }
    }

    fn frame_span(&self, pc: RelocatedAddress) -> FrameSpan {
        let global = pc.into_global(self.mapping_offset);
        FrameSpan {
            ip: pc,
            func_name: self
                .debug_info
                .function_name_by_pc(global)
                .map(ToString::to_string),
            place: self
                .debug_info
                .find_place_from_pc(global)
                .map(|p| p.to_owned()),
        }
    }

    /// Unwind at most `depth` frames starting from `pc`/`sp`.
    ///
    /// `read_memory` reads bytes of target memory at a relocated address.
    pub fn unwind<F>(
        &self,
        pc: RelocatedAddress,
        sp: RelocatedAddress,
        bp: Option<RelocatedAddress>,
        depth: usize,
        read_memory: F,
    ) -> Result<Backtrace, Error>
    where
        F: Fn(usize, usize) -> Result<Vec<u8>, Error>,
    {
        let mut bt = vec![self.frame_span(pc)];

        let mut pc = pc;
        let mut sp = sp;
        let mut bp = bp;
        while bt.len() < depth {
            let Some((ret, cfa)) = self.caller_of(pc, sp, bp, &read_memory)? else {
                break;
            };
            if ret.is_null() {
                break;
            }
            let prev = bt.last().expect("backtrace len > 0");
            if prev.ip == ret {
                break;
            }

            // the caller's stack pointer at the call site is the CFA,
            // its frame base register value is unknown from here on
            pc = ret;
            sp = cfa;
            bp = None;
            bt.push(self.frame_span(pc));
        }

        Ok(bt)
    }

    /// Return address of the frame at `pc`/`sp` and the canonical frame address,
    /// `None` when the frame has no recoverable caller.
    pub fn caller_of<F>(
        &self,
        pc: RelocatedAddress,
        sp: RelocatedAddress,
        bp: Option<RelocatedAddress>,
        read_memory: F,
    ) -> Result<Option<(RelocatedAddress, RelocatedAddress)>, Error>
    where
        F: Fn(usize, usize) -> Result<Vec<u8>, Error>,
    {
        let global = pc.into_global(self.mapping_offset);
        let Some(rule) = self.debug_info.unwind_rule(global)? else {
            return Ok(None);
        };

        let cfa_base = if rule.cfa_register == DWARF_RSP {
            sp
        } else if rule.cfa_register == DWARF_RBP {
            match bp {
                Some(bp) => bp,
                None => return Ok(None),
            }
        } else {
            return Ok(None);
        };
        let cfa = cfa_base.offset(rule.cfa_offset as isize);

        let ret = match rule.ra_rule {
            ReturnAddressRule::OffsetFromCfa(offset) => {
                let addr = cfa.offset(offset as isize);
                let bytes = read_memory(addr.as_usize(), 8)?;
                let bytes: [u8; 8] = bytes
                    .try_into()
                    .map_err(|_| Error::UnwindUnsupportedRule)?;
                RelocatedAddress::from(u64::from_ne_bytes(bytes))
            }
            ReturnAddressRule::Register(_) | ReturnAddressRule::Undefined => return Ok(None),
        };

        Ok(Some((ret, cfa)))
    }
}
