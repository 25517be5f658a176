//! Code to double-check that what we wrote is what we meant to write.
//! Generally only used in debug builds, or when POSTLINKER_VALIDATE_OUTPUT=1.

use crate::elf;
use crate::error::Result;
use crate::layout::Layout;
use crate::section_class::ClassifiedSections;
use crate::section_class::SECTION_CLASSES;
use anyhow::bail;
use anyhow::Context as _;
use object::LittleEndian;

#[tracing::instrument(skip_all, name = "Validate output")]
pub(crate) fn validate_bytes(
    out: &[u8],
    classes: &ClassifiedSections,
    layout: &Layout,
) -> Result {
    let object = elf::File::parse(out).context("Failed to parse our output file")?;
    validate_object(&object, classes, layout).context("Output validation failed")
}

fn validate_object(object: &elf::File, classes: &ClassifiedSections, layout: &Layout) -> Result {
    let e = LittleEndian;

    if object.segments.len() != layout.segments.len() {
        bail!(
            "e_phnum is {} but the layout has {} segments",
            object.segments.len(),
            layout.segments.len()
        );
    }

    let lowest_load_address = object
        .segments
        .iter()
        .filter(|p| p.p_type.get(e) == object::elf::PT_LOAD)
        .map(|p| p.p_vaddr.get(e))
        .min();
    if lowest_load_address != Some(layout.base_address) {
        bail!(
            "Base address {:#x} doesn't match the written segments",
            layout.base_address
        );
    }

    // The segments we added must be page aligned and congruent with their
    // file offsets relative to the base.
    for segment in &object.segments[layout.num_original_segments..] {
        let offset = segment.p_offset.get(e);
        let vaddr = segment.p_vaddr.get(e);
        if segment.p_type.get(e) != object::elf::PT_LOAD {
            bail!("Added a non-load segment");
        }
        if offset % elf::PAGE_SIZE != 0 {
            bail!("New segment at {offset:#x} is not page aligned");
        }
        if vaddr.wrapping_sub(offset) != layout.base_address {
            bail!("New segment at {offset:#x} is not congruent with its address {vaddr:#x}");
        }
        if segment.p_filesz.get(e) != segment.p_memsz.get(e) {
            bail!("New segment at {offset:#x} has mismatched file and memory sizes");
        }
    }

    // Packed sections must sit where the planner put them, with their
    // requested alignment.
    for class in SECTION_CLASSES {
        for section in classes.class(class) {
            let offset = layout.section_offsets.get(section.index)?;
            let align = section.header.sh_addralign.get(e).max(1);
            if offset % align != 0 {
                bail!("Packed section at {offset:#x} ignores its alignment {align}");
            }
        }
    }

    // The entry point has to land inside an executable load segment.
    let entry = object.header.e_entry.get(e);
    let entry_is_mapped = object.segments.iter().any(|p| {
        p.p_type.get(e) == object::elf::PT_LOAD
            && p.p_flags.get(e) & object::elf::PF_X != 0
            && (p.p_vaddr.get(e)..p.p_vaddr.get(e) + p.p_memsz.get(e)).contains(&entry)
    });
    if !entry_is_mapped {
        bail!("Entry point {entry:#x} is not in any executable segment");
    }

    Ok(())
}
