use crate::debugger::address::GlobalAddress;
use object::{Object, ObjectSymbol, SymbolKind};
use regex::Regex;

/// A function known from the symbol table.
#[derive(Debug, Clone)]
pub struct FunctionSymbol {
    pub name: String,
    pub start: GlobalAddress,
    pub end: GlobalAddress,
}

impl FunctionSymbol {
    pub fn contains(&self, pc: GlobalAddress) -> bool {
        pc >= self.start && pc < self.end
    }

    pub fn range(&self) -> gimli::Range {
        gimli::Range {
            begin: self.start.into(),
            end: self.end.into(),
        }
    }
}

/// A global data object known from the symbol table.
#[derive(Debug, Clone, Copy)]
pub struct ObjectSym {
    pub addr: GlobalAddress,
    pub size: u64,
}

/// Symbol table of the debugee: function names to entry addresses and ranges,
/// global variable names to addresses. Names come unmangled from the target
/// toolchain (`main.main`, `runtime.allg`, ...).
#[derive(Debug, Default)]
pub struct SymbolTab {
    functions: Vec<FunctionSymbol>,
    objects: std::collections::HashMap<String, ObjectSym>,
}

impl SymbolTab {
    pub(super) fn new(object_file: &object::File) -> Self {
        let mut functions = vec![];
        let mut objects = std::collections::HashMap::new();

        for symbol in object_file.symbols() {
            let Ok(name) = symbol.name() else { continue };
            if name.is_empty() {
                continue;
            }
            match symbol.kind() {
                SymbolKind::Text => {
                    functions.push(FunctionSymbol {
                        name: name.to_string(),
                        start: GlobalAddress::from(symbol.address()),
                        end: GlobalAddress::from(symbol.address() + symbol.size()),
                    });
                }
                SymbolKind::Data => {
                    objects.insert(
                        name.to_string(),
                        ObjectSym {
                            addr: GlobalAddress::from(symbol.address()),
                            size: symbol.size(),
                        },
                    );
                }
                _ => {}
            }
        }

        functions.sort_unstable_by_key(|f| f.start);
        SymbolTab { functions, objects }
    }

    pub fn function_by_pc(&self, pc: GlobalAddress) -> Option<&FunctionSymbol> {
        let pos = self.functions.partition_point(|f| f.start <= pc);
        let func = &self.functions[pos.checked_sub(1)?];
        func.contains(pc).then_some(func)
    }

    pub fn function_by_name(&self, name: &str) -> Option<&FunctionSymbol> {
        self.functions.iter().find(|f| f.name == name)
    }

    pub fn find_functions(&self, regex: &Regex) -> Vec<&FunctionSymbol> {
        self.functions
            .iter()
            .filter(|f| regex.find(&f.name).is_some())
            .collect()
    }

    pub fn object_by_name(&self, name: &str) -> Option<ObjectSym> {
        self.objects.get(name).copied()
    }

    pub fn functions(&self) -> &[FunctionSymbol] {
        &self.functions
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tab() -> SymbolTab {
        SymbolTab {
            functions: vec![
                FunctionSymbol {
                    name: "main.main".to_string(),
                    start: GlobalAddress::from(0x1000_usize),
                    end: GlobalAddress::from(0x1100_usize),
                },
                FunctionSymbol {
                    name: "main.helper".to_string(),
                    start: GlobalAddress::from(0x1100_usize),
                    end: GlobalAddress::from(0x1180_usize),
                },
            ],
            objects: std::collections::HashMap::from([(
                "runtime.allglen".to_string(),
                ObjectSym {
                    addr: GlobalAddress::from(0x8000_usize),
                    size: 8,
                },
            )]),
        }
    }

    #[test]
    fn test_function_by_pc() {
        let tab = tab();
        assert_eq!(
            tab.function_by_pc(GlobalAddress::from(0x1050_usize))
                .map(|f| f.name.as_str()),
            Some("main.main")
        );
        assert_eq!(
            tab.function_by_pc(GlobalAddress::from(0x1100_usize))
                .map(|f| f.name.as_str()),
            Some("main.helper")
        );
        assert!(tab.function_by_pc(GlobalAddress::from(0x2000_usize)).is_none());
        assert!(tab.function_by_pc(GlobalAddress::from(0x100_usize)).is_none());
    }

    #[test]
    fn test_object_lookup() {
        let tab = tab();
        let obj = tab.object_by_name("runtime.allglen").unwrap();
        assert_eq!(obj.addr, GlobalAddress::from(0x8000_usize));
        assert!(tab.object_by_name("runtime.allg").is_none());
    }
}
