use crate::debugger::address::GlobalAddress;
use crate::debugger::debug_info::EndianArcSlice;
use crate::debugger::error::Error;
use gimli::Reader;
use std::collections::HashMap;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(super) struct LineRow {
    pub address: u64,
    pub file: usize,
    pub line: u64,
    pub is_stmt: bool,
    pub end_sequence: bool,
}

/// One position of the line-number program.
#[derive(Debug, Clone, Copy)]
pub struct PlaceDescriptor<'a> {
    pub file: &'a Path,
    pub address: GlobalAddress,
    pub line_number: u64,
    pub is_stmt: bool,
    table: &'a LineTable,
    row_idx: usize,
}

/// Like [`PlaceDescriptor`] but without borrowing the line table.
#[derive(Debug, Clone, PartialEq)]
pub struct PlaceDescriptorOwned {
    pub file: PathBuf,
    pub address: GlobalAddress,
    pub line_number: u64,
    pub is_stmt: bool,
}

impl<'a> PlaceDescriptor<'a> {
    /// Next place in address order, `None` at the end of the program or sequence.
    pub fn next(&self) -> Option<PlaceDescriptor<'a>> {
        self.table.place_at(self.row_idx + 1)
    }

    pub fn to_owned(&self) -> PlaceDescriptorOwned {
        PlaceDescriptorOwned {
            file: self.file.to_path_buf(),
            address: self.address,
            line_number: self.line_number,
            is_stmt: self.is_stmt,
        }
    }

    pub fn line_eq(&self, other: &PlaceDescriptor) -> bool {
        self.file == other.file && self.line_number == other.line_number
    }
}

/// Bidirectional PC <-> (file, line) map built from the line-number programs of
/// every compilation unit, rows sorted by address.
#[derive(Debug, Default)]
pub struct LineTable {
    files: Vec<PathBuf>,
    rows: Vec<LineRow>,
}

impl LineTable {
    pub(super) fn parse(dwarf: &gimli::Dwarf<EndianArcSlice>) -> Result<Self, Error> {
        let mut files: Vec<PathBuf> = vec![];
        let mut file_pool: HashMap<PathBuf, usize> = HashMap::new();
        let mut rows: Vec<LineRow> = vec![];

        let mut units = dwarf.units();
        while let Some(header) = units.next()? {
            let unit = dwarf.unit(header)?;
            let Some(program) = unit.line_program.clone() else {
                continue;
            };

            let mut unit_file_cache: HashMap<u64, usize> = HashMap::new();
            let mut rows_iter = program.rows();
            while let Some((header, row)) = rows_iter.next_row()? {
                if row.end_sequence() {
                    rows.push(LineRow {
                        address: row.address(),
                        file: 0,
                        line: 0,
                        is_stmt: false,
                        end_sequence: true,
                    });
                    continue;
                }

                let file_idx = match unit_file_cache.get(&row.file_index()) {
                    Some(idx) => *idx,
                    None => {
                        let path = render_file_path(dwarf, &unit, header, row.file_index())?;
                        let idx = *file_pool.entry(path.clone()).or_insert_with(|| {
                            files.push(path);
                            files.len() - 1
                        });
                        unit_file_cache.insert(row.file_index(), idx);
                        idx
                    }
                };

                rows.push(LineRow {
                    address: row.address(),
                    file: file_idx,
                    line: row.line().map(|l| l.get()).unwrap_or_default(),
                    is_stmt: row.is_stmt(),
                    end_sequence: false,
                });
            }
        }

        // a sequence-end marker may share its address with the first row of the
        // next sequence, the marker must sort before the real row
        rows.sort_unstable_by_key(|r| (r.address, !r.end_sequence));
        rows.dedup();

        Ok(Self { files, rows })
    }

    fn place_at(&self, row_idx: usize) -> Option<PlaceDescriptor<'_>> {
        let row = self.rows.get(row_idx)?;
        if row.end_sequence {
            return None;
        }
        Some(PlaceDescriptor {
            file: &self.files[row.file],
            address: GlobalAddress::from(row.address),
            line_number: row.line,
            is_stmt: row.is_stmt,
            table: self,
            row_idx,
        })
    }

    /// Source position covering `pc`: the last row at or before it.
    pub fn find_place_from_pc(&self, pc: GlobalAddress) -> Option<PlaceDescriptor<'_>> {
        let pc = u64::from(pc);
        let pos = self.rows.partition_point(|row| row.address <= pc);
        pos.checked_sub(1).and_then(|idx| self.place_at(idx))
    }

    /// Position whose row address equals `pc` exactly.
    pub fn find_exact_place_from_pc(&self, pc: GlobalAddress) -> Option<PlaceDescriptor<'_>> {
        self.find_place_from_pc(pc)
            .filter(|place| place.address == pc)
    }

    /// First statement row of `line` in a file whose path ends with `file`.
    pub fn find_stmt_line(&self, file: &str, line: u64) -> Option<PlaceDescriptor<'_>> {
        let mut best: Option<usize> = None;
        for (idx, row) in self.rows.iter().enumerate() {
            if row.end_sequence || !row.is_stmt || row.line != line {
                continue;
            }
            if !self.files[row.file].ends_with(file) {
                continue;
            }
            match best {
                Some(b) if self.rows[b].address <= row.address => {}
                _ => best = Some(idx),
            }
        }
        best.and_then(|idx| self.place_at(idx))
    }

    /// Statement rows with addresses inside `[begin, end)` - candidate stops for
    /// stepping over a source line.
    pub fn stmt_places_between(
        &self,
        begin: GlobalAddress,
        end: GlobalAddress,
    ) -> Vec<PlaceDescriptor<'_>> {
        let begin = u64::from(begin);
        let end = u64::from(end);
        let start = self.rows.partition_point(|row| row.address < begin);
        self.rows[start..]
            .iter()
            .take_while(|row| row.address < end)
            .enumerate()
            .filter(|(_, row)| row.is_stmt && !row.end_sequence)
            .filter_map(|(offset, _)| self.place_at(start + offset))
            .collect()
    }
}

fn render_file_path(
    dwarf: &gimli::Dwarf<EndianArcSlice>,
    unit: &gimli::Unit<EndianArcSlice>,
    header: &gimli::LineProgramHeader<EndianArcSlice>,
    file_index: u64,
) -> Result<PathBuf, Error> {
    let Some(file) = header.file(file_index) else {
        return Ok(PathBuf::from("???"));
    };

    let mut path = PathBuf::new();
    if let Some(comp_dir) = unit.comp_dir.as_ref() {
        path.push(comp_dir.to_string_lossy()?.as_ref());
    }
    if let Some(dir_attr) = file.directory(header) {
        let dir = dwarf.attr_string(unit, dir_attr)?;
        let dir = dir.to_string_lossy()?;
        if dir.starts_with('/') {
            path = PathBuf::from(dir.as_ref());
        } else {
            path.push(dir.as_ref());
        }
    }
    let name = dwarf.attr_string(unit, file.path_name())?;
    let name = name.to_string_lossy()?;
    if name.starts_with('/') {
        path = PathBuf::from(name.as_ref());
    } else {
        path.push(name.as_ref());
    }
    Ok(path)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn table() -> LineTable {
        LineTable {
            files: vec![PathBuf::from("/src/main.go"), PathBuf::from("/src/util.go")],
            rows: vec![
                LineRow { address: 0x100, file: 0, line: 10, is_stmt: true, end_sequence: false },
                LineRow { address: 0x108, file: 0, line: 10, is_stmt: false, end_sequence: false },
                LineRow { address: 0x110, file: 0, line: 11, is_stmt: true, end_sequence: false },
                LineRow { address: 0x120, file: 0, line: 12, is_stmt: true, end_sequence: false },
                LineRow { address: 0x130, file: 0, line: 0, is_stmt: false, end_sequence: true },
                LineRow { address: 0x200, file: 1, line: 5, is_stmt: true, end_sequence: false },
                LineRow { address: 0x210, file: 1, line: 0, is_stmt: false, end_sequence: true },
            ],
        }
    }

    #[test]
    fn test_find_place_from_pc() {
        let table = table();
        let place = table
            .find_place_from_pc(GlobalAddress::from(0x104_usize))
            .unwrap();
        assert_eq!(place.line_number, 10);

        let place = table
            .find_place_from_pc(GlobalAddress::from(0x110_usize))
            .unwrap();
        assert_eq!(place.line_number, 11);

        // between sequences there is no source position
        assert!(table
            .find_place_from_pc(GlobalAddress::from(0x150_usize))
            .is_none());
        // before the first row there is no source position
        assert!(table
            .find_place_from_pc(GlobalAddress::from(0x50_usize))
            .is_none());
    }

    #[test]
    fn test_place_iteration_stops_at_sequence_end() {
        let table = table();
        let place = table
            .find_place_from_pc(GlobalAddress::from(0x120_usize))
            .unwrap();
        assert!(place.next().is_none());
    }

    #[test]
    fn test_find_stmt_line_matches_file_suffix() {
        let table = table();
        let place = table.find_stmt_line("main.go", 12).unwrap();
        assert_eq!(place.address, GlobalAddress::from(0x120_usize));
        assert!(table.find_stmt_line("main.go", 99).is_none());
        assert!(table.find_stmt_line("other.go", 12).is_none());
    }

    #[test]
    fn test_stmt_places_between() {
        let table = table();
        let places = table.stmt_places_between(
            GlobalAddress::from(0x100_usize),
            GlobalAddress::from(0x130_usize),
        );
        let lines: Vec<u64> = places.iter().map(|p| p.line_number).collect();
        assert_eq!(lines, vec![10, 11, 12]);
    }
}
