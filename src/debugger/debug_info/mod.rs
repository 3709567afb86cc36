pub mod frame;
pub mod layout;
pub mod lines;
mod loader;
pub mod symbol;

use crate::debugger::address::GlobalAddress;
use crate::debugger::debug_info::frame::{FrameTable, UnwindRule};
use crate::debugger::debug_info::layout::{LayoutResolver, StructLayout};
use crate::debugger::debug_info::lines::{LineTable, PlaceDescriptor};
use crate::debugger::debug_info::symbol::{FunctionSymbol, ObjectSym, SymbolTab};
use crate::debugger::error::Error;
use object::ObjectKind;
use regex::Regex;
use std::path::{Path, PathBuf};
use std::rc::Rc;

pub type EndianArcSlice = gimli::EndianArcSlice<gimli::RunTimeEndian>;

/// Preparsed debug information of the debugee executable: the line-number
/// table, call-frame information, symbol table and type layouts. Read-only
/// after load, consulted whenever an address must be mapped to source or a
/// frame must be unwound.
pub struct DebugInfo {
    pub path: PathBuf,
    obj_kind: ObjectKind,
    lines: LineTable,
    frames: FrameTable,
    symbols: SymbolTab,
    layouts: LayoutResolver,
}

impl DebugInfo {
    pub fn load(path: &Path) -> Result<Self, Error> {
        let artifacts = loader::load(path)?;
        Ok(Self {
            path: path.to_path_buf(),
            obj_kind: artifacts.obj_kind,
            lines: artifacts.lines,
            frames: artifacts.frames,
            symbols: artifacts.symbols,
            layouts: LayoutResolver::new(artifacts.dwarf),
        })
    }

    /// True when the executable is position independent and a mapping offset
    /// must be added to every global address.
    pub fn needs_relocation(&self) -> bool {
        self.obj_kind == ObjectKind::Dynamic
    }

    pub fn find_place_from_pc(&self, pc: GlobalAddress) -> Option<PlaceDescriptor<'_>> {
        self.lines.find_place_from_pc(pc)
    }

    pub fn find_exact_place_from_pc(&self, pc: GlobalAddress) -> Option<PlaceDescriptor<'_>> {
        self.lines.find_exact_place_from_pc(pc)
    }

    pub fn find_stmt_line(&self, file: &str, line: u64) -> Option<PlaceDescriptor<'_>> {
        self.lines.find_stmt_line(file, line)
    }

    pub fn stmt_places_between(
        &self,
        begin: GlobalAddress,
        end: GlobalAddress,
    ) -> Vec<PlaceDescriptor<'_>> {
        self.lines.stmt_places_between(begin, end)
    }

    pub fn function_by_pc(&self, pc: GlobalAddress) -> Option<&FunctionSymbol> {
        self.symbols.function_by_pc(pc)
    }

    pub fn function_name_by_pc(&self, pc: GlobalAddress) -> Option<&str> {
        self.symbols.function_by_pc(pc).map(|f| f.name.as_str())
    }

    pub fn function_by_name(&self, name: &str) -> Option<&FunctionSymbol> {
        self.symbols.function_by_name(name)
    }

    pub fn find_functions(&self, regex: &Regex) -> Vec<&FunctionSymbol> {
        self.symbols.find_functions(regex)
    }

    /// Address and size of a global variable.
    pub fn global_variable(&self, name: &str) -> Option<ObjectSym> {
        self.symbols.object_by_name(name)
    }

    /// The frame unwind rule in effect at `pc`.
    pub fn unwind_rule(&self, pc: GlobalAddress) -> Result<Option<UnwindRule>, Error> {
        self.frames.unwind_rule(pc)
    }

    /// Member layout of a structure type in the target runtime.
    pub fn struct_layout(&self, type_name: &str) -> Result<Option<Rc<StructLayout>>, Error> {
        self.layouts.resolve(type_name)
    }
}
