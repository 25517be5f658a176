//! Minimal view of the two input files. We only pull out the tables that the
//! later phases need: program headers, section headers, the symbol table and
//! RELA entries. Everything is borrowed straight from the mapped file bytes.

use crate::error::Result;
use anyhow::bail;
use anyhow::Context as _;
use object::LittleEndian;
use object::read::elf::FileHeader as _;
use object::read::elf::SectionHeader as _;

pub(crate) type FileHeader = object::elf::FileHeader64<LittleEndian>;
pub(crate) type ProgramHeader = object::elf::ProgramHeader64<LittleEndian>;
pub(crate) type SectionHeader = object::elf::SectionHeader64<LittleEndian>;
pub(crate) type Symbol = object::elf::Sym64<LittleEndian>;
pub(crate) type Rela = object::elf::Rela64<LittleEndian>;

pub(crate) type SectionTable<'data> = object::read::elf::SectionTable<'data, FileHeader>;
pub(crate) type SymbolTable<'data> = object::read::elf::SymbolTable<'data, FileHeader>;

/// The alignment unit for all segment offsets and addresses. Every load
/// segment we create is page aligned and the header-space shift is exactly
/// one page.
pub(crate) const PAGE_SIZE: u64 = 0x1000;

pub(crate) const FILE_HEADER_SIZE: u16 = size_of::<FileHeader>() as u16;
pub(crate) const PROGRAM_HEADER_SIZE: u16 = size_of::<ProgramHeader>() as u16;
pub(crate) const SECTION_HEADER_SIZE: u16 = size_of::<SectionHeader>() as u16;

/// Name prefix of sections that hold RELA entries. The rest of the name is
/// the name of the section that the relocations apply to.
pub(crate) const RELA_PREFIX: &[u8] = b".rela";

pub(crate) struct File<'data> {
    pub(crate) data: &'data [u8],
    pub(crate) header: &'data FileHeader,
    pub(crate) segments: &'data [ProgramHeader],
    pub(crate) sections: SectionTable<'data>,

    /// Empty if the file carries no symtab. A stripped executable still
    /// links as long as the relocatable doesn't reference its symbols.
    pub(crate) symbols: SymbolTable<'data>,
}

/// The entries of one `.rela.X` section together with the section X that
/// they patch.
pub(crate) struct RelaSection<'data> {
    /// Index of the target section in the relocatable's section table.
    pub(crate) target: object::SectionIndex,

    /// Name of the target section, e.g. `.text`.
    pub(crate) target_name: &'data [u8],

    pub(crate) entries: &'data [Rela],
}

impl<'data> File<'data> {
    pub(crate) fn parse(data: &'data [u8]) -> Result<Self> {
        let e = LittleEndian;
        let header = FileHeader::parse(data)?;
        let phnum = header.e_phnum.get(e);
        if phnum > 0 && header.e_phentsize.get(e) != PROGRAM_HEADER_SIZE {
            bail!(
                "Unsupported program header entry size {}",
                header.e_phentsize.get(e)
            );
        }
        if header.e_shnum.get(e) > 0 && header.e_shentsize.get(e) != SECTION_HEADER_SIZE {
            bail!(
                "Unsupported section header entry size {}",
                header.e_shentsize.get(e)
            );
        }
        let segments = header.program_headers(e, data)?;
        let sections = header.sections(e, data)?;

        let mut symbols = SymbolTable::default();
        for (i, section) in sections.iter().enumerate() {
            if section.sh_type.get(e) == object::elf::SHT_SYMTAB {
                symbols =
                    SymbolTable::parse(e, data, &sections, object::SectionIndex(i), section)?;
                break;
            }
        }

        Ok(Self {
            data,
            header,
            segments,
            sections,
            symbols,
        })
    }

    pub(crate) fn num_sections(&self) -> usize {
        self.sections.len()
    }

    pub(crate) fn section_name(&self, section: &SectionHeader) -> Result<&'data [u8]> {
        Ok(self.sections.section_name(LittleEndian, section)?)
    }

    pub(crate) fn symbol(&self, index: object::SymbolIndex) -> Result<&'data Symbol> {
        self.symbols
            .symbol(index)
            .with_context(|| format!("Invalid symbol index {}", index.0))
    }

    pub(crate) fn symbol_name(&self, symbol: &Symbol) -> Result<&'data [u8]> {
        Ok(self.symbols.symbol_name(LittleEndian, symbol)?)
    }

    /// Finds a symbol defined by this file with the supplied name. Undefined
    /// symbols (imports) don't count as definitions.
    pub(crate) fn definition_by_name(&self, name: &[u8]) -> Option<&'data Symbol> {
        let e = LittleEndian;
        self.symbols.iter().find(|sym| {
            sym.st_shndx.get(e) != object::elf::SHN_UNDEF
                && self.symbol_name(sym).is_ok_and(|n| n == name)
        })
    }

    /// Returns all RELA sections paired with the section their entries
    /// apply to. The target is derived from the `.rela` name prefix; a RELA
    /// section whose remainder names no section in this file is an error.
    pub(crate) fn rela_sections(&self) -> Result<Vec<RelaSection<'data>>> {
        let e = LittleEndian;
        let mut out = Vec::new();
        for section in self.sections.iter() {
            if section.sh_type.get(e) != object::elf::SHT_RELA {
                continue;
            }
            let name = self.section_name(section)?;
            let Some(target_name) = name.strip_prefix(RELA_PREFIX) else {
                bail!(
                    "Relocation section `{}` is not named .rela.X",
                    String::from_utf8_lossy(name)
                );
            };
            let Some((target, _)) = self.sections.section_by_name(e, target_name) else {
                bail!(
                    "Could not find section `{}`",
                    String::from_utf8_lossy(target_name)
                );
            };
            out.push(RelaSection {
                target,
                target_name,
                entries: section.data_as_array(e, self.data)?,
            });
        }
        Ok(out)
    }
}

/// ELF64_R_SYM.
pub(crate) fn rela_symbol_index(rela: &Rela) -> object::SymbolIndex {
    object::SymbolIndex((rela.r_info.get(LittleEndian) >> 32) as usize)
}

/// ELF64_R_TYPE.
pub(crate) fn rela_type(rela: &Rela) -> u32 {
    rela.r_info.get(LittleEndian) as u32
}

#[cfg(test)]
mod tests {
    use super::*;
    use object::I64;
    use object::U64;

    #[test]
    fn test_rela_info_split() {
        let e = LittleEndian;
        let rela = Rela {
            r_offset: U64::new(e, 0x10),
            r_info: U64::new(e, (7u64 << 32) | u64::from(object::elf::R_X86_64_PC32)),
            r_addend: I64::new(e, -4),
        };
        assert_eq!(rela_symbol_index(&rela), object::SymbolIndex(7));
        assert_eq!(rela_type(&rela), object::elf::R_X86_64_PC32);
    }
}
