/// Target CPU architecture descriptor. All CPU-specific knowledge lives here:
/// pointer width, breakpoint opcode and its length, hardware debug register count.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum Architecture {
    Amd64,
}

impl Architecture {
    /// Size of a pointer in the target, in bytes.
    pub fn ptr_size(self) -> usize {
        match self {
            Architecture::Amd64 => 8,
        }
    }

    /// Instruction bytes that trap into the debugger (`int3` on amd64).
    pub fn breakpoint_instruction(self) -> &'static [u8] {
        match self {
            Architecture::Amd64 => &[0xCC],
        }
    }

    /// Length of the breakpoint instruction in bytes.
    pub fn breakpoint_size(self) -> usize {
        self.breakpoint_instruction().len()
    }

    /// Number of hardware debug registers available for instruction breakpoints.
    pub fn hw_breakpoint_count(self) -> usize {
        match self {
            Architecture::Amd64 => 4,
        }
    }
}

/// Architecture descriptor plus the mutable hardware debug register usage vector.
#[derive(Debug)]
pub struct Arch {
    kind: Architecture,
    hw_breakpoint_usage: Vec<bool>,
}

impl Arch {
    pub fn new(kind: Architecture) -> Self {
        Self {
            kind,
            hw_breakpoint_usage: vec![false; kind.hw_breakpoint_count()],
        }
    }

    pub fn kind(&self) -> Architecture {
        self.kind
    }

    pub fn ptr_size(&self) -> usize {
        self.kind.ptr_size()
    }

    pub fn breakpoint_instruction(&self) -> &'static [u8] {
        self.kind.breakpoint_instruction()
    }

    pub fn breakpoint_size(&self) -> usize {
        self.kind.breakpoint_size()
    }

    /// Find an unused hardware debug register slot.
    pub fn free_hw_slot(&self) -> Option<usize> {
        self.hw_breakpoint_usage.iter().position(|used| !used)
    }

    pub fn set_hw_slot_usage(&mut self, index: usize, used: bool) {
        self.hw_breakpoint_usage[index] = used;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_amd64_descriptor() {
        let arch = Architecture::Amd64;
        assert_eq!(arch.ptr_size(), 8);
        assert_eq!(arch.breakpoint_instruction(), &[0xCC]);
        assert_eq!(arch.breakpoint_size(), 1);
        assert_eq!(arch.hw_breakpoint_count(), 4);
    }

    #[test]
    fn test_hw_slot_allocation() {
        let mut arch = Arch::new(Architecture::Amd64);
        assert_eq!(arch.free_hw_slot(), Some(0));
        arch.set_hw_slot_usage(0, true);
        arch.set_hw_slot_usage(1, true);
        assert_eq!(arch.free_hw_slot(), Some(2));
        arch.set_hw_slot_usage(1, false);
        assert_eq!(arch.free_hw_slot(), Some(1));
    }
}
