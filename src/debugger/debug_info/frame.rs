use crate::debugger::address::GlobalAddress;
use crate::debugger::debug_info::EndianArcSlice;
use crate::debugger::error::Error;
use gimli::{
    BaseAddresses, CfaRule, DebugFrame, EhFrame, RegisterRule, UnwindContext, UnwindSection,
};

/// How to recover the caller from a frame at some PC, extracted from the
/// matching unwind table row into an owned value.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UnwindRule {
    /// CFA = value of this dwarf register + offset.
    pub cfa_register: gimli::Register,
    pub cfa_offset: i64,
    /// How to recover the return address.
    pub ra_rule: ReturnAddressRule,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReturnAddressRule {
    /// Return address stored at CFA + offset.
    OffsetFromCfa(i64),
    /// Return address lives in a register.
    Register(gimli::Register),
    /// The frame has no caller (end of the call stack).
    Undefined,
}

/// Call-frame information of the debugee: `.eh_frame` when present,
/// `.debug_frame` as a fallback (the target toolchain emits the latter).
pub struct FrameTable {
    eh_frame: Option<(EhFrame<EndianArcSlice>, BaseAddresses)>,
    debug_frame: Option<(DebugFrame<EndianArcSlice>, BaseAddresses)>,
}

impl FrameTable {
    pub(super) fn new(
        eh_frame: Option<(EhFrame<EndianArcSlice>, BaseAddresses)>,
        debug_frame: Option<(DebugFrame<EndianArcSlice>, BaseAddresses)>,
    ) -> Self {
        Self {
            eh_frame,
            debug_frame,
        }
    }

    /// The unwind rule in effect at `pc`, `None` when no FDE covers it.
    pub fn unwind_rule(&self, pc: GlobalAddress) -> Result<Option<UnwindRule>, Error> {
        if let Some((section, bases)) = self.eh_frame.as_ref() {
            match Self::rule_from_section(section, bases, pc) {
                Ok(Some(rule)) => return Ok(Some(rule)),
                Ok(None) => {}
                Err(e) => return Err(e),
            }
        }
        if let Some((section, bases)) = self.debug_frame.as_ref() {
            return Self::rule_from_section(section, bases, pc);
        }
        Ok(None)
    }

    fn rule_from_section<S: UnwindSection<EndianArcSlice>>(
        section: &S,
        bases: &BaseAddresses,
        pc: GlobalAddress,
    ) -> Result<Option<UnwindRule>, Error> {
        let fde = match section.fde_for_address(bases, pc.into(), S::cie_from_offset) {
            Ok(fde) => fde,
            Err(gimli::Error::NoUnwindInfoForAddress) => return Ok(None),
            Err(e) => return Err(e.into()),
        };

        let mut ctx = Box::new(UnwindContext::new());
        let row = match fde.unwind_info_for_address(section, bases, &mut ctx, pc.into()) {
            Ok(row) => row,
            Err(gimli::Error::NoUnwindInfoForAddress) => return Ok(None),
            Err(e) => return Err(e.into()),
        };

        let (cfa_register, cfa_offset) = match row.cfa() {
            CfaRule::RegisterAndOffset { register, offset } => (*register, *offset),
            // expression-based CFA cannot be recovered from a pc/sp seed,
            // the walk ends at this frame
            CfaRule::Expression(_) => return Ok(None),
        };

        let ra_register = fde.cie().return_address_register();
        let ra_rule = match row.register(ra_register) {
            RegisterRule::Undefined => ReturnAddressRule::Undefined,
            RegisterRule::Offset(offset) => ReturnAddressRule::OffsetFromCfa(offset),
            RegisterRule::Register(reg) => ReturnAddressRule::Register(reg),
            RegisterRule::SameValue => ReturnAddressRule::Register(ra_register),
            _ => return Ok(None),
        };

        Ok(Some(UnwindRule {
            cfa_register,
            cfa_offset,
            ra_rule,
        }))
    }
}
