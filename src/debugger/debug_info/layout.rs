use crate::debugger::debug_info::EndianArcSlice;
use crate::debugger::error::Error;
use gimli::{AttributeValue, DW_AT_byte_size, DW_AT_data_member_location, DW_AT_name, DW_TAG_member, DW_TAG_structure_type, Reader};
use std::cell::RefCell;
use std::collections::HashMap;
use std::rc::Rc;

/// Member offsets of one structure type in the target runtime.
#[derive(Debug, Default)]
pub struct StructLayout {
    pub byte_size: u64,
    members: HashMap<String, u64>,
}

impl StructLayout {
    pub fn offset(&self, member: &str) -> Option<u64> {
        self.members.get(member).copied()
    }
}

/// Resolves structure layouts (member byte offsets) from the type information,
/// used to read runtime descriptors such as task structs out of target memory.
/// Results are cached, lookups after the first are free.
pub struct LayoutResolver {
    dwarf: gimli::Dwarf<EndianArcSlice>,
    cache: RefCell<HashMap<String, Option<Rc<StructLayout>>>>,
}

impl LayoutResolver {
    pub(super) fn new(dwarf: gimli::Dwarf<EndianArcSlice>) -> Self {
        Self {
            dwarf,
            cache: RefCell::default(),
        }
    }

    /// Layout of the structure type named `type_name`, `None` when the type
    /// information does not describe it.
    pub fn resolve(&self, type_name: &str) -> Result<Option<Rc<StructLayout>>, Error> {
        if let Some(cached) = self.cache.borrow().get(type_name) {
            return Ok(cached.clone());
        }

        let layout = self.lookup(type_name)?.map(Rc::new);
        self.cache
            .borrow_mut()
            .insert(type_name.to_string(), layout.clone());
        Ok(layout)
    }

    fn lookup(&self, type_name: &str) -> Result<Option<StructLayout>, Error> {
        let mut units = self.dwarf.units();
        while let Some(header) = units.next()? {
            let unit = self.dwarf.unit(header)?;
            let mut entries = unit.entries();

            while let Some((_, entry)) = entries.next_dfs()? {
                if entry.tag() != DW_TAG_structure_type {
                    continue;
                }
                let Some(name) = self.entry_name(&unit, entry)? else {
                    continue;
                };
                if name != type_name {
                    continue;
                }

                let byte_size = match entry.attr_value(DW_AT_byte_size)? {
                    Some(attr) => attr.udata_value().unwrap_or_default(),
                    None => 0,
                };

                let mut layout = StructLayout {
                    byte_size,
                    members: HashMap::new(),
                };

                // members are the direct children of the structure die
                let mut member_tree = unit.entries_tree(Some(entry.offset()))?;
                let node = member_tree.root()?;
                let mut children = node.children();
                while let Some(child) = children.next()? {
                    let entry = child.entry();
                    if entry.tag() != DW_TAG_member {
                        continue;
                    }
                    let Some(member_name) = self.entry_name(&unit, entry)? else {
                        continue;
                    };
                    if let Some(offset) = member_offset(entry)? {
                        layout.members.insert(member_name, offset);
                    }
                }

                return Ok(Some(layout));
            }
        }
        Ok(None)
    }

    fn entry_name(
        &self,
        unit: &gimli::Unit<EndianArcSlice>,
        entry: &gimli::DebuggingInformationEntry<EndianArcSlice>,
    ) -> Result<Option<String>, Error> {
        let Some(attr) = entry.attr_value(DW_AT_name)? else {
            return Ok(None);
        };
        let name = self.dwarf.attr_string(unit, attr)?;
        Ok(Some(name.to_string_lossy()?.into_owned()))
    }
}

fn member_offset(
    entry: &gimli::DebuggingInformationEntry<EndianArcSlice>,
) -> Result<Option<u64>, Error> {
    let Some(attr) = entry.attr_value(DW_AT_data_member_location)? else {
        return Ok(None);
    };
    match attr {
        AttributeValue::Udata(offset) => Ok(Some(offset)),
        AttributeValue::Data1(offset) => Ok(Some(offset as u64)),
        AttributeValue::Data2(offset) => Ok(Some(offset as u64)),
        AttributeValue::Data4(offset) => Ok(Some(offset as u64)),
        AttributeValue::Data8(offset) => Ok(Some(offset)),
        // older producers encode the offset as `DW_OP_plus_uconst <uleb>`
        AttributeValue::Exprloc(expr) => {
            let mut reader = expr.0.clone();
            let opcode = gimli::Reader::read_u8(&mut reader)?;
            if opcode == gimli::DW_OP_plus_uconst.0 {
                Ok(Some(gimli::Reader::read_uleb128(&mut reader)?))
            } else {
                Ok(None)
            }
        }
        _ => Ok(None),
    }
}
