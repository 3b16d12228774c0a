//! Object linking layer.
//!
//! Linking runs in three steps so that modules referencing each other can
//! both be linked:
//!
//! 1. `load` places the object's sections in fresh memory and records its
//!    exported addresses in the library as emitted.
//! 2. `relocate` resolves external references (which may take another
//!    module's emitted addresses), patches relocations and applies final
//!    protections.
//! 3. `publish` makes the symbols visible to lookups.
//!
//! A failure at any step releases the memory and publishes nothing.

use std::collections::HashMap;
use std::sync::Arc;

use super::library::{Library, Ticket};
use super::memory::{MemoryBlock, MemoryManager};
use super::object::{ObjectBuffer, RelocKind, Relocation, SectionKind};
use super::symbols::{MangleAndInterner, Symbol, SymbolFlags};
use crate::error::LinkError;

/// An object placed in memory with its relocations still unapplied.
pub struct LoadedObject {
    object: ObjectBuffer,
    block: Option<MemoryBlock>,
    symbols: Vec<Symbol>,
}

impl LoadedObject {
    /// Exported symbols at their final addresses.
    pub fn symbols(&self) -> &[Symbol] {
        &self.symbols
    }
}

/// A relocated, finalized object waiting to be published.
pub struct LinkedObject {
    module: String,
    block: Option<MemoryBlock>,
    symbols: Vec<Symbol>,
}

pub struct ObjectLinkingLayer {
    memory: Arc<MemoryManager>,
    mangler: MangleAndInterner,
}

impl ObjectLinkingLayer {
    pub fn new(memory: Arc<MemoryManager>, mangler: MangleAndInterner) -> Self {
        Self { memory, mangler }
    }

    /// Allocate and fill section memory for `object`, then record its
    /// exported addresses as emitted by `ticket` in `library`.
    pub fn load(&self, object: ObjectBuffer, library: &Library, ticket: Ticket) -> Result<LoadedObject, LinkError> {
        let _guard = library.lock_for_link();

        let sizes = object.section_sizes();
        let mut block = if sizes.text + sizes.rodata + sizes.data > 0 {
            Some(self.memory.allocate(sizes).map_err(LinkError::Allocation)?)
        } else {
            None
        };

        let placed = match block.as_mut() {
            Some(block) => self.place(&object, block),
            None => Ok(Vec::new()),
        }
        .and_then(|symbols| {
            library.emit(ticket, &symbols)?;
            Ok(symbols)
        });

        match placed {
            Ok(symbols) => Ok(LoadedObject {
                object,
                block,
                symbols,
            }),
            Err(err) => {
                self.release(block);
                Err(err)
            }
        }
    }

    /// Resolve external references, patch relocations and finalize.
    ///
    /// `resolve` supplies addresses for names the object references but does
    /// not define. It runs before the library's link lock is taken, since it
    /// may wait for other in-flight modules.
    pub fn relocate<R>(&self, loaded: LoadedObject, library: &Library, resolve: R) -> Result<LinkedObject, LinkError>
    where
        R: FnMut(&str) -> Result<u64, LinkError>,
    {
        let LoadedObject {
            object,
            mut block,
            symbols,
        } = loaded;

        match self.apply_relocations(&object, block.as_mut(), library, resolve) {
            Ok(()) => Ok(LinkedObject {
                module: object.module,
                block,
                symbols,
            }),
            Err(err) => {
                self.release(block);
                Err(err)
            }
        }
    }

    /// Publish a linked object's symbols into `library`, handing it the
    /// object's memory.
    pub fn publish(&self, linked: LinkedObject, library: &Library, ticket: Ticket) -> Result<Vec<Symbol>, LinkError> {
        let _guard = library.lock_for_link();
        let LinkedObject {
            module,
            block,
            symbols,
        } = linked;

        library.publish(ticket, symbols.clone(), block)?;
        tracing::debug!(
            module = %module,
            library = library.name(),
            symbols = symbols.len(),
            "linked object"
        );
        Ok(symbols)
    }

    /// Drop a linked object that will never be published.
    pub fn discard(&self, linked: LinkedObject) {
        self.release(linked.block);
    }

    fn release(&self, block: Option<MemoryBlock>) {
        if let Some(block) = block {
            self.memory.release(block);
        }
    }

    /// Copy sections into `block` and compute the exported addresses.
    fn place(&self, object: &ObjectBuffer, block: &mut MemoryBlock) -> Result<Vec<Symbol>, LinkError> {
        for kind in [SectionKind::Text, SectionKind::ReadOnlyData, SectionKind::Data] {
            let bytes = object.section(kind);
            if !bytes.is_empty() {
                block.write(kind, 0, bytes).map_err(LinkError::Allocation)?;
            }
        }

        object
            .exported_symbols()
            .map(|exported| {
                let address = section_base(block, exported.section)? + exported.offset as u64;
                let flags = match exported.section {
                    SectionKind::Text => SymbolFlags::FUNCTION,
                    SectionKind::ReadOnlyData | SectionKind::Data => SymbolFlags::DATA,
                };
                Ok(Symbol::new(self.mangler.intern_mangled(&exported.name), address, flags))
            })
            .collect()
    }

    fn apply_relocations<R>(
        &self,
        object: &ObjectBuffer,
        block: Option<&mut MemoryBlock>,
        library: &Library,
        mut resolve: R,
    ) -> Result<(), LinkError>
    where
        R: FnMut(&str) -> Result<u64, LinkError>,
    {
        let mut externals = HashMap::new();
        for name in object.external_references() {
            let address = resolve(name)?;
            externals.insert(name.to_string(), address);
        }

        let Some(block) = block else {
            return Ok(());
        };
        let _guard = library.lock_for_link();

        let locals = object.symbol_map();
        for reloc in &object.relocations {
            let target = match locals.get(reloc.target.as_str()) {
                Some(local) => section_base(block, local.section)? + local.offset as u64,
                None => externals.get(&reloc.target).copied().ok_or_else(|| {
                    LinkError::UnresolvedSymbol {
                        symbol: reloc.target.clone(),
                        module: object.module.clone(),
                    }
                })?,
            };
            apply_relocation(block, reloc, target.wrapping_add_signed(reloc.addend))?;
        }

        self.memory.finalize(block).map_err(LinkError::Allocation)
    }
}

fn section_base(block: &MemoryBlock, kind: SectionKind) -> Result<u64, LinkError> {
    block.base(kind).ok_or_else(|| LinkError::Relocation {
        symbol: String::new(),
        message: format!("object has no {} section", kind),
    })
}

/// Patch one relocation site with its final value.
fn apply_relocation(block: &mut MemoryBlock, reloc: &Relocation, value: u64) -> Result<(), LinkError> {
    let fail = |message: String| LinkError::Relocation {
        symbol: reloc.target.clone(),
        message,
    };

    match reloc.kind {
        RelocKind::Abs64 => block
            .write(reloc.section, reloc.offset, &value.to_le_bytes())
            .map_err(|e| fail(e.to_string())),
        RelocKind::Aarch64MovWide => {
            let mut patched = [0u8; 16];
            for i in 0..4 {
                let offset = reloc.offset + 4 * i;
                let word = block
                    .read_u32(reloc.section, offset)
                    .map_err(|e| fail(e.to_string()))?;
                let word = patch_mov_wide(word, value, i);
                patched[4 * i..4 * i + 4].copy_from_slice(&word.to_le_bytes());
            }
            block
                .write(reloc.section, reloc.offset, &patched)
                .map_err(|e| fail(e.to_string()))
        }
    }
}

/// Place the `i`th 16-bit chunk of `value` in a MOVZ/MOVK imm16 field.
fn patch_mov_wide(word: u32, value: u64, i: usize) -> u32 {
    let imm16 = ((value >> (16 * i)) & 0xFFFF) as u32;
    (word & !(0xFFFF << 5)) | (imm16 << 5)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::jit::library::Status;
    use crate::jit::object::ObjectSymbol;
    use crate::jit::symbols::SymbolStringPool;

    fn setup(limit: Option<usize>) -> (ObjectLinkingLayer, Arc<MemoryManager>) {
        let mangler = MangleAndInterner::new(Arc::new(SymbolStringPool::new()), None);
        let memory = Arc::new(MemoryManager::new(limit));
        (ObjectLinkingLayer::new(Arc::clone(&memory), mangler), memory)
    }

    /// Object with one exported data word holding the address of `target`.
    fn pointer_object(target: &str) -> ObjectBuffer {
        let mut object = ObjectBuffer::new("ptr");
        object.data = vec![0; 8];
        object.rodata = 42i64.to_le_bytes().to_vec();
        object.symbols.push(ObjectSymbol {
            name: "slot".into(),
            section: SectionKind::Data,
            offset: 0,
            size: 8,
            exported: true,
        });
        object.symbols.push(ObjectSymbol {
            name: "answer".into(),
            section: SectionKind::ReadOnlyData,
            offset: 0,
            size: 8,
            exported: false,
        });
        object.relocations.push(Relocation {
            section: SectionKind::Data,
            offset: 0,
            kind: RelocKind::Abs64,
            target: target.into(),
            addend: 0,
        });
        object
    }

    fn reserve(layer: &ObjectLinkingLayer, library: &Library, ticket: Ticket, name: &str) {
        library
            .reserve(ticket, &[layer.mangler.intern_mangled(name)])
            .unwrap();
    }

    fn link<R>(
        layer: &ObjectLinkingLayer,
        object: ObjectBuffer,
        library: &Library,
        ticket: Ticket,
        resolve: R,
    ) -> Result<Vec<Symbol>, LinkError>
    where
        R: FnMut(&str) -> Result<u64, LinkError>,
    {
        let loaded = layer.load(object, library, ticket)?;
        let linked = layer.relocate(loaded, library, resolve)?;
        layer.publish(linked, library, ticket)
    }

    #[test]
    fn test_local_relocation() {
        let (layer, _) = setup(None);
        let library = Library::new("main");
        reserve(&layer, &library, 1, "slot");

        let symbols = link(&layer, pointer_object("answer"), &library, 1, |name| {
            panic!("unexpected external {}", name)
        })
        .unwrap();
        assert_eq!(symbols.len(), 1);
        assert_eq!(symbols[0].name.as_str(), "slot");
        assert_eq!(symbols[0].flags, SymbolFlags::DATA);

        // The slot now holds the address of the private rodata word
        let slot = symbols[0].address as *const u64;
        let answer = unsafe { *slot } as *const i64;
        assert_eq!(unsafe { *answer }, 42);
    }

    #[test]
    fn test_external_relocation() {
        let (layer, _) = setup(None);
        let library = Library::new("main");
        reserve(&layer, &library, 1, "slot");

        let symbols = link(&layer, pointer_object("elsewhere"), &library, 1, |name| {
            assert_eq!(name, "elsewhere");
            Ok(0x1234_5678)
        })
        .unwrap();
        assert_eq!(unsafe { *(symbols[0].address as *const u64) }, 0x1234_5678);
    }

    #[test]
    fn test_load_emits_before_relocation() {
        let (layer, _) = setup(None);
        let library = Library::new("main");
        reserve(&layer, &library, 1, "slot");
        let slot = layer.mangler.intern_mangled("slot");

        let loaded = layer.load(pointer_object("elsewhere"), &library, 1).unwrap();
        let address = loaded.symbols()[0].address;
        assert_eq!(library.status(&slot), Status::Emitted(1, loaded.symbols()[0].clone()));
        assert!(library.symbols().is_empty());

        let linked = layer.relocate(loaded, &library, |_| Ok(7)).unwrap();
        let symbols = layer.publish(linked, &library, 1).unwrap();
        assert_eq!(symbols[0].address, address);
        assert!(matches!(library.status(&slot), Status::Published(_)));
    }

    #[test]
    fn test_unresolved_rolls_back() {
        let (layer, memory) = setup(None);
        let library = Library::new("main");
        reserve(&layer, &library, 1, "slot");

        let err = link(&layer, pointer_object("missing"), &library, 1, |name| {
            Err(LinkError::UnresolvedSymbol {
                symbol: name.to_string(),
                module: "ptr".into(),
            })
        })
        .unwrap_err();
        assert!(matches!(err, LinkError::UnresolvedSymbol { .. }));
        assert!(library.symbols().is_empty());
        assert_eq!(memory.live_bytes(), 0);
    }

    #[test]
    fn test_discard_releases_memory() {
        let (layer, memory) = setup(None);
        let library = Library::new("main");
        reserve(&layer, &library, 1, "slot");

        let loaded = layer.load(pointer_object("answer"), &library, 1).unwrap();
        let linked = layer.relocate(loaded, &library, |_| Ok(0)).unwrap();
        assert_eq!(linked.module, "ptr");
        assert!(memory.live_bytes() > 0);
        layer.discard(linked);
        assert_eq!(memory.live_bytes(), 0);
    }

    #[test]
    fn test_memory_limit() {
        let (layer, _) = setup(Some(1));
        let library = Library::new("main");
        reserve(&layer, &library, 1, "slot");

        let err = link(&layer, pointer_object("answer"), &library, 1, |_| Ok(0)).unwrap_err();
        assert!(matches!(err, LinkError::Allocation(_)));
        assert!(library.symbols().is_empty());
    }

    #[test]
    fn test_code_is_not_writable_after_link() {
        let (layer, memory) = setup(None);
        let library = Library::new("main");
        let mut object = ObjectBuffer::new("code");
        object.text = vec![0xC3];
        object.symbols.push(ObjectSymbol {
            name: "f".into(),
            section: SectionKind::Text,
            offset: 0,
            size: 1,
            exported: true,
        });
        reserve(&layer, &library, 1, "f");

        let symbols = link(&layer, object, &library, 1, |_| Ok(0)).unwrap();
        assert_eq!(symbols[0].flags, SymbolFlags::FUNCTION);
        assert!(memory.live_bytes() > 0);
    }

    #[test]
    fn test_patch_mov_wide() {
        // movz x16, #0 / movk x16, #0, lsl #16 / ...
        let words = [0xD2800010u32, 0xF2A00010, 0xF2C00010, 0xF2E00010];
        let value = 0x1122_3344_5566_7788u64;
        let patched: Vec<u32> = words
            .iter()
            .enumerate()
            .map(|(i, &w)| patch_mov_wide(w, value, i))
            .collect();
        assert_eq!(patched[0], 0xD2800010 | (0x7788 << 5));
        assert_eq!(patched[1], 0xF2A00010 | (0x5566 << 5));
        assert_eq!(patched[2], 0xF2C00010 | (0x3344 << 5));
        assert_eq!(patched[3], 0xF2E00010 | (0x1122 << 5));
    }
}
