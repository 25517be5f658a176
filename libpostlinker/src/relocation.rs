//! Resolves the relocatable's RELA entries against the combined symbol space
//! of both inputs and patches the already-written output bytes. This is the
//! last phase that touches section content; only the file header is written
//! after it.

use crate::elf;
use crate::elf::Symbol;
use crate::error::Result;
use crate::layout::Layout;
use anyhow::bail;
use anyhow::Context as _;
use object::read::elf::Sym as _;
use object::LittleEndian;

/// The entry point gets redirected to this symbol of the relocatable.
pub(crate) const START_SYMBOL_NAME: &[u8] = b"_start";

/// Pseudo-symbol that resolves to the original executable's entry point,
/// letting the injected code chain to it.
pub(crate) const ORIG_START_SYMBOL_NAME: &[u8] = b"orig_start";

/// Applies all relocations, then returns the output's new entry point: the
/// virtual address of the relocatable's `_start`.
#[tracing::instrument(skip_all, name = "Apply relocations")]
pub(crate) fn apply_relocations(
    out: &mut [u8],
    exec: &elf::File,
    rel: &elf::File,
    layout: &Layout,
) -> Result<u64> {
    for rela_section in rel.rela_sections()? {
        if !layout.section_offsets.contains(rela_section.target) {
            // The target wasn't loaded (e.g. a debug section), so there is
            // nothing in the output to patch.
            tracing::debug!(
                target = %String::from_utf8_lossy(rela_section.target_name),
                "skipping relocations for unloaded section"
            );
            continue;
        }
        let target_offset = layout.section_offsets.get(rela_section.target)?;
        for rela in rela_section.entries {
            apply_rela(out, exec, rel, layout, target_offset, rela).with_context(|| {
                format!(
                    "Failed to apply relocation in `{}`",
                    String::from_utf8_lossy(rela_section.target_name)
                )
            })?;
        }
    }

    entry_point(rel, layout)
}

fn apply_rela(
    out: &mut [u8],
    exec: &elf::File,
    rel: &elf::File,
    layout: &Layout,
    target_offset: u64,
    rela: &elf::Rela,
) -> Result {
    let e = LittleEndian;
    let r_type = elf::rela_type(rela);
    if !is_supported_relocation(r_type) {
        return Ok(());
    }
    let symbol = rel.symbol(elf::rela_symbol_index(rela))?;
    if !is_resolvable_symbol_type(symbol.st_type()) {
        return Ok(());
    }

    let value = symbol_value(exec, rel, layout, symbol)?;
    let addend = rela.r_addend.get(e);
    // By construction every packed section sits at
    // `base_address + its file offset`, so the patch address and the patch
    // file position differ by exactly the base.
    let place = target_offset + rela.r_offset.get(e) + layout.base_address;
    let file_pos = place - layout.base_address;

    match r_type {
        object::elf::R_X86_64_PC32 | object::elf::R_X86_64_PLT32 => {
            let relative = value.wrapping_add_signed(addend).wrapping_sub(place) as i64;
            write_value(out, file_pos, &i32_bytes(relative, rel, symbol)?)
        }
        object::elf::R_X86_64_32 => {
            let absolute = value.wrapping_add_signed(addend);
            let absolute = u32::try_from(absolute)
                .map_err(|_| value_out_of_range(rel, symbol))?;
            write_value(out, file_pos, &absolute.to_le_bytes())
        }
        object::elf::R_X86_64_32S => {
            let absolute = value.wrapping_add_signed(addend) as i64;
            write_value(out, file_pos, &i32_bytes(absolute, rel, symbol)?)
        }
        object::elf::R_X86_64_64 => {
            let absolute = value.wrapping_add_signed(addend);
            write_value(out, file_pos, &absolute.to_le_bytes())
        }
        _ => unreachable!(),
    }
}

/// Address that `symbol` refers to at runtime.
fn symbol_value(
    exec: &elf::File,
    rel: &elf::File,
    layout: &Layout,
    symbol: &Symbol,
) -> Result<u64> {
    let e = LittleEndian;
    let shndx = symbol.st_shndx.get(e);
    match shndx {
        object::elf::SHN_UNDEF => {
            let name = rel.symbol_name(symbol)?;
            if name == ORIG_START_SYMBOL_NAME {
                return Ok(layout.orig_start);
            }
            // Not defined by the relocatable, so it has to come from the
            // executable. Its symbol values are already virtual addresses.
            let Some(exec_symbol) = exec.definition_by_name(name) else {
                bail!("Could not find symbol {}", String::from_utf8_lossy(name));
            };
            Ok(exec_symbol.st_value.get(e))
        }
        object::elf::SHN_ABS => Ok(symbol.st_value.get(e)),
        _ => {
            let section_offset = layout
                .section_offsets
                .get(object::SectionIndex(usize::from(shndx)))
                .with_context(|| {
                    format!(
                        "Symbol {} lives in a section that was not loaded",
                        String::from_utf8_lossy(rel.symbol_name(symbol).unwrap_or_default())
                    )
                })?;
            Ok(section_offset + symbol.st_value.get(e) + layout.base_address)
        }
    }
}

/// Virtual address of the relocatable's `_start` in the output image.
fn entry_point(rel: &elf::File, layout: &Layout) -> Result<u64> {
    let e = LittleEndian;
    let Some(start) = rel.definition_by_name(START_SYMBOL_NAME) else {
        bail!("Could not find symbol _start");
    };
    let section_offset = layout
        .section_offsets
        .get(object::SectionIndex(usize::from(start.st_shndx.get(e))))
        .context("_start lives in a section that was not loaded")?;
    Ok(start.st_value.get(e) + section_offset + layout.base_address)
}

fn is_supported_relocation(r_type: u32) -> bool {
    matches!(
        r_type,
        object::elf::R_X86_64_PC32
            | object::elf::R_X86_64_PLT32
            | object::elf::R_X86_64_32
            | object::elf::R_X86_64_32S
            | object::elf::R_X86_64_64
    )
}

fn is_resolvable_symbol_type(st_type: u8) -> bool {
    matches!(
        st_type,
        object::elf::STT_NOTYPE
            | object::elf::STT_FUNC
            | object::elf::STT_OBJECT
            | object::elf::STT_SECTION
    )
}

fn i32_bytes(value: i64, rel: &elf::File, symbol: &Symbol) -> Result<[u8; 4]> {
    let value = i32::try_from(value).map_err(|_| value_out_of_range(rel, symbol))?;
    Ok(value.to_le_bytes())
}

fn value_out_of_range(rel: &elf::File, symbol: &Symbol) -> crate::error::Error {
    anyhow::anyhow!(
        "Relocation against {} does not fit in 32 bits",
        String::from_utf8_lossy(rel.symbol_name(symbol).unwrap_or_default())
    )
}

fn write_value(out: &mut [u8], file_pos: u64, bytes: &[u8]) -> Result {
    let start = usize::try_from(file_pos).context("Relocation offset too large")?;
    let patch = out
        .get_mut(start..start + bytes.len())
        .with_context(|| format!("Relocation writes outside the output file at {file_pos:#x}"))?;
    patch.copy_from_slice(bytes);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_supported_relocations() {
        assert!(is_supported_relocation(object::elf::R_X86_64_PC32));
        assert!(is_supported_relocation(object::elf::R_X86_64_PLT32));
        assert!(is_supported_relocation(object::elf::R_X86_64_32));
        assert!(is_supported_relocation(object::elf::R_X86_64_32S));
        assert!(is_supported_relocation(object::elf::R_X86_64_64));
        assert!(!is_supported_relocation(object::elf::R_X86_64_NONE));
        assert!(!is_supported_relocation(object::elf::R_X86_64_GOTPCREL));
    }

    #[test]
    fn test_resolvable_symbol_types() {
        assert!(is_resolvable_symbol_type(object::elf::STT_NOTYPE));
        assert!(is_resolvable_symbol_type(object::elf::STT_FUNC));
        assert!(is_resolvable_symbol_type(object::elf::STT_OBJECT));
        assert!(is_resolvable_symbol_type(object::elf::STT_SECTION));
        assert!(!is_resolvable_symbol_type(object::elf::STT_TLS));
        assert!(!is_resolvable_symbol_type(object::elf::STT_FILE));
    }

    #[test]
    fn test_write_value_bounds() {
        let mut out = vec![0u8; 8];
        write_value(&mut out, 2, &0x11223344u32.to_le_bytes()).unwrap();
        assert_eq!(out, [0, 0, 0x44, 0x33, 0x22, 0x11, 0, 0]);
        assert!(write_value(&mut out, 6, &0u32.to_le_bytes()).is_err());
    }
}
