//! Mach-O object emission.
//!
//! Collects the compiled functions of one unit into an ARM64 relocatable
//! Mach-O: code in `__TEXT,__text`, NUL-terminated (deduplicated) string
//! literals in `__TEXT,__cstring`, initialized globals in `__DATA,__data`
//! and zero-initialized ones in `__DATA,__bss`; a symbol table with
//! external symbols for defined functions and referenced runtime routines,
//! local symbols for literals; and explicit ARM64 relocation types
//! (BRANCH26 / PAGE21 / PAGEOFF12 / UNSIGNED). The file carries
//! LC_BUILD_VERSION for macOS 11.0.
//!
//! The heavy lifting is done by the `object` crate; this module maps the
//! backend's relocation and symbol model onto it.

use crate::binemit::{Reloc, RelocEntry};
use crate::flat::GlobalData;
use crate::fx::FxHashMap;
use crate::ir::{Func, GlobalId, SymRef};
use crate::result::{CodegenError, CodegenResult};
use cranelift_entity::PrimaryMap;
use log::debug;
use object::macho;
use object::write::{
    MachOBuildVersion, Object, Relocation, StandardSection, Symbol, SymbolId, SymbolSection,
};
use object::{
    Architecture, BinaryFormat, Endianness, RelocationFlags, SectionKind, SymbolFlags,
    SymbolKind, SymbolScope,
};
use target_lexicon::{OperatingSystem, Triple};

/// Builder for one relocatable object.
pub struct ObjectBuilder {
    obj: Object<'static>,
    text: object::write::SectionId,
    cstring: object::write::SectionId,
    /// Function and runtime symbols by name.
    func_syms: FxHashMap<String, SymbolId>,
    /// Deduplicated string literals by payload.
    str_syms: FxHashMap<Box<[u8]>, SymbolId>,
    /// Global variable symbols.
    global_syms: FxHashMap<GlobalId, SymbolId>,
    str_count: usize,
}

impl ObjectBuilder {
    /// Create a builder for `triple`, which must name an AArch64 Apple
    /// target.
    pub fn new(triple: &Triple) -> CodegenResult<Self> {
        if !matches!(triple.architecture, target_lexicon::Architecture::Aarch64(_)) {
            return Err(CodegenError::Unsupported(format!(
                "architecture {}",
                triple.architecture
            )));
        }
        match triple.operating_system {
            OperatingSystem::Darwin | OperatingSystem::MacOSX { .. } => {}
            os => {
                return Err(CodegenError::Unsupported(format!(
                    "{os} is not a Mach-O platform"
                )))
            }
        }

        let mut obj = Object::new(BinaryFormat::MachO, Architecture::Aarch64, Endianness::Little);
        let mut version = MachOBuildVersion::default();
        version.platform = macho::PLATFORM_MACOS;
        version.minos = 11 << 16;
        version.sdk = 11 << 16;
        obj.set_macho_build_version(version);

        let text = obj.add_section(
            b"__TEXT".to_vec(),
            b"__text".to_vec(),
            SectionKind::Text,
        );
        let cstring = obj.add_section(
            b"__TEXT".to_vec(),
            b"__cstring".to_vec(),
            SectionKind::ReadOnlyString,
        );
        Ok(Self {
            obj,
            text,
            cstring,
            func_syms: FxHashMap::default(),
            str_syms: FxHashMap::default(),
            global_syms: FxHashMap::default(),
            str_count: 0,
        })
    }

    /// Place every global of the unit: initialized data in `__data`,
    /// zero-initialized in `__bss`.
    pub fn declare_globals(&mut self, globals: &PrimaryMap<GlobalId, GlobalData>) {
        for (id, global) in globals.iter() {
            let sym = self.obj.add_symbol(Symbol {
                name: global.name.clone().into_bytes(),
                value: 0,
                size: 0,
                kind: SymbolKind::Data,
                scope: SymbolScope::Linkage,
                weak: false,
                section: SymbolSection::Undefined,
                flags: SymbolFlags::None,
            });
            match &global.init {
                Some(bytes) => {
                    assert_eq!(bytes.len() as u32, global.size, "{}: bad initializer", global.name);
                    let section = self.obj.section_id(StandardSection::Data);
                    self.obj.add_symbol_data(sym, section, bytes, 8);
                }
                None => {
                    let section = self.obj.section_id(StandardSection::UninitializedData);
                    self.obj
                        .add_symbol_bss(sym, section, global.size as u64, 8);
                }
            }
            self.global_syms.insert(id, sym);
        }
    }

    /// An external (defined or not-yet-defined) function symbol.
    fn func_symbol(&mut self, name: &str) -> SymbolId {
        if let Some(&sym) = self.func_syms.get(name) {
            return sym;
        }
        let sym = self.obj.add_symbol(Symbol {
            name: name.as_bytes().to_vec(),
            value: 0,
            size: 0,
            kind: SymbolKind::Text,
            scope: SymbolScope::Linkage,
            weak: false,
            section: SymbolSection::Undefined,
            flags: SymbolFlags::None,
        });
        self.func_syms.insert(name.to_string(), sym);
        sym
    }

    /// A local symbol for one interned literal, shared across functions
    /// with identical payloads. The stored bytes gain a NUL terminator.
    fn string_symbol(&mut self, bytes: &[u8]) -> SymbolId {
        if let Some(&sym) = self.str_syms.get(bytes) {
            return sym;
        }
        let name = format!("l_.str.{}", self.str_count);
        self.str_count += 1;
        let sym = self.obj.add_symbol(Symbol {
            name: name.into_bytes(),
            value: 0,
            size: 0,
            kind: SymbolKind::Data,
            scope: SymbolScope::Compilation,
            weak: false,
            section: SymbolSection::Undefined,
            flags: SymbolFlags::None,
        });
        let mut payload = bytes.to_vec();
        payload.push(0);
        self.obj.add_symbol_data(sym, self.cstring, &payload, 1);
        self.str_syms.insert(bytes.into(), sym);
        sym
    }

    fn resolve(&mut self, func: &Func, target: &SymRef) -> SymbolId {
        match target {
            SymRef::Func(name) => self.func_symbol(name),
            SymRef::Str(lit) => {
                let bytes: Box<[u8]> = func.strings[*lit].clone();
                self.string_symbol(&bytes)
            }
            SymRef::Global(id) => *self
                .global_syms
                .get(id)
                .unwrap_or_else(|| panic!("undeclared global {id}")),
        }
    }

    /// Add one compiled function: its code and its relocations.
    pub fn define_function(
        &mut self,
        func: &Func,
        code: Vec<u8>,
        relocs: Vec<RelocEntry>,
    ) -> CodegenResult<()> {
        let sym = self.func_symbol(&func.name);
        let base = self.obj.add_symbol_data(sym, self.text, &code, 4);
        debug!(
            "obj: {} at {:#x}, {} bytes, {} relocs",
            func.name,
            base,
            code.len(),
            relocs.len()
        );

        for reloc in relocs {
            let symbol = self.resolve(func, &reloc.target);
            let (r_type, r_pcrel, r_length) = match reloc.kind {
                Reloc::Branch26 => (macho::ARM64_RELOC_BRANCH26, true, 2),
                Reloc::Page21 => (macho::ARM64_RELOC_PAGE21, true, 2),
                Reloc::PageOff12 => (macho::ARM64_RELOC_PAGEOFF12, false, 2),
                Reloc::Abs8 => (macho::ARM64_RELOC_UNSIGNED, false, 3),
            };
            self.obj.add_relocation(
                self.text,
                Relocation {
                    offset: base + reloc.offset as u64,
                    symbol,
                    addend: reloc.addend,
                    flags: RelocationFlags::MachO {
                        r_type,
                        r_pcrel,
                        r_length,
                    },
                },
            )?;
        }
        Ok(())
    }

    /// Serialize the finished object.
    pub fn finish(self) -> CodegenResult<Vec<u8>> {
        Ok(self.obj.write()?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::{types, Signature};
    use object::read::{Object as _, ObjectSection as _, ObjectSymbol as _};
    use std::str::FromStr;

    fn builder() -> ObjectBuilder {
        let triple = Triple::from_str("aarch64-apple-darwin").unwrap();
        ObjectBuilder::new(&triple).unwrap()
    }

    #[test]
    fn rejects_non_apple_targets() {
        let triple = Triple::from_str("x86_64-unknown-linux-gnu").unwrap();
        assert!(ObjectBuilder::new(&triple).is_err());
        let triple = Triple::from_str("aarch64-unknown-linux-gnu").unwrap();
        assert!(ObjectBuilder::new(&triple).is_err());
    }

    #[test]
    fn writes_a_readable_macho() {
        let mut builder = builder();
        let func = Func::new("answer", Signature::new(vec![], types::I64));
        let code = vec![
            0x40, 0x05, 0x80, 0xD2, // movz x0, #42
            0xC0, 0x03, 0x5F, 0xD6, // ret
        ];
        builder.define_function(&func, code, vec![]).unwrap();
        let bytes = builder.finish().unwrap();

        let parsed = object::read::File::parse(&*bytes).unwrap();
        assert_eq!(parsed.format(), BinaryFormat::MachO);
        assert_eq!(parsed.architecture(), Architecture::Aarch64);
        let text = parsed.section_by_name("__text").unwrap();
        assert_eq!(text.data().unwrap().len(), 8);
        assert!(parsed
            .symbols()
            .any(|s| s.name().unwrap().contains("answer")));
    }

    #[test]
    fn branch26_relocation_round_trips() {
        let mut builder = builder();
        let mut func = Func::new("caller", Signature::new(vec![], types::VOID));
        let _ = &mut func;
        let code = vec![
            0x00, 0x00, 0x00, 0x94, // bl callee
            0xC0, 0x03, 0x5F, 0xD6, // ret
        ];
        let relocs = vec![RelocEntry {
            offset: 0,
            kind: Reloc::Branch26,
            target: SymRef::Func("callee".into()),
            addend: 0,
        }];
        builder.define_function(&func, code, relocs).unwrap();
        let bytes = builder.finish().unwrap();

        let parsed = object::read::File::parse(&*bytes).unwrap();
        let text = parsed.section_by_name("__text").unwrap();
        let relocs: Vec<_> = text.relocations().collect();
        assert_eq!(relocs.len(), 1);
        assert_eq!(relocs[0].0, 0);
    }

    #[test]
    fn string_literals_are_deduplicated() {
        let mut builder = builder();
        let mut func = Func::new("f", Signature::new(vec![], types::VOID));
        let a = func.add_string(b"hello".as_slice().into());
        let b = func.add_string(b"hello".as_slice().into());
        let sa = builder.resolve(&func, &SymRef::Str(a));
        let sb = builder.resolve(&func, &SymRef::Str(b));
        assert_eq!(sa, sb);
        let code = vec![0xC0, 0x03, 0x5F, 0xD6];
        builder.define_function(&func, code, vec![]).unwrap();
        let bytes = builder.finish().unwrap();
        let parsed = object::read::File::parse(&*bytes).unwrap();
        let cstring = parsed.section_by_name("__cstring").unwrap();
        // One payload, NUL-terminated.
        assert_eq!(cstring.data().unwrap(), b"hello\0");
    }
}
