use crate::debugger::debug_info::frame::FrameTable;
use crate::debugger::debug_info::lines::LineTable;
use crate::debugger::debug_info::symbol::SymbolTab;
use crate::debugger::debug_info::EndianArcSlice;
use crate::debugger::error::Error;
use gimli::{BaseAddresses, DebugFrame, EhFrame, RunTimeEndian, SectionId};
use object::{Object, ObjectKind, ObjectSection};
use std::borrow::Cow;
use std::path::Path;
use std::sync::Arc;

pub(super) struct Artifacts {
    pub obj_kind: ObjectKind,
    pub lines: LineTable,
    pub frames: FrameTable,
    pub symbols: SymbolTab,
    pub dwarf: gimli::Dwarf<EndianArcSlice>,
}

fn load_section(
    id: SectionId,
    file: &object::File,
    endian: RunTimeEndian,
) -> Result<EndianArcSlice, Error> {
    let data = file
        .section_by_name(id.name())
        .and_then(|section| section.uncompressed_data().ok())
        .unwrap_or(Cow::Borrowed(&[]));
    Ok(gimli::EndianArcSlice::new(Arc::from(&*data), endian))
}

fn load_frame_table(file: &object::File, endian: RunTimeEndian) -> Result<FrameTable, Error> {
    let text_addr = file
        .section_by_name(".text")
        .map(|s| s.address())
        .unwrap_or_default();

    let eh_frame = match file.section_by_name(SectionId::EhFrame.name()) {
        Some(section) if section.size() > 0 => {
            let data = load_section(SectionId::EhFrame, file, endian)?;
            let bases = BaseAddresses::default()
                .set_eh_frame(section.address())
                .set_text(text_addr);
            Some((EhFrame::from(data), bases))
        }
        _ => None,
    };

    let debug_frame = match file.section_by_name(SectionId::DebugFrame.name()) {
        Some(section) if section.size() > 0 => {
            let data = load_section(SectionId::DebugFrame, file, endian)?;
            let bases = BaseAddresses::default().set_text(text_addr);
            Some((DebugFrame::from(data), bases))
        }
        _ => None,
    };

    if eh_frame.is_none() && debug_frame.is_none() {
        return Err(Error::NoDebugInformation("call frame information"));
    }

    Ok(FrameTable::new(eh_frame, debug_frame))
}

/// Load every debug-info artifact from the executable on disk. The three
/// artifacts (line table, frame table, symbol table) are built in parallel.
pub(super) fn load(path: &Path) -> Result<Artifacts, Error> {
    let file = std::fs::File::open(path)?;
    let mmap = unsafe { memmap2::Mmap::map(&file)? };
    let object = object::File::parse(&*mmap)?;

    let endian = if object.is_little_endian() {
        RunTimeEndian::Little
    } else {
        RunTimeEndian::Big
    };

    let dwarf = gimli::Dwarf::load(|id| load_section(id, &object, endian))?;

    let (lines, (frames, symbols)) = rayon::join(
        || LineTable::parse(&dwarf),
        || {
            rayon::join(
                || load_frame_table(&object, endian),
                || SymbolTab::new(&object),
            )
        },
    );

    Ok(Artifacts {
        obj_kind: object.kind(),
        lines: lines?,
        frames: frames?,
        symbols,
        dwarf,
    })
}
