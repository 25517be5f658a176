//! Decides where everything goes in the output file: appends one load
//! segment per non-empty permission class, then slides the whole original
//! image down by one page so that the grown program header table still sits
//! inside the first loaded page.
//!
//! The offsets recorded here are final. The writer and the relocation engine
//! both consume them; neither recomputes anything.

use crate::elf;
use crate::elf::ProgramHeader;
use crate::elf::PAGE_SIZE;
use crate::error::Result;
use crate::section_class::ClassifiedSection;
use crate::section_class::ClassifiedSections;
use crate::section_class::SectionClass;
use crate::section_class::SECTION_CLASSES;
use anyhow::bail;
use anyhow::ensure;
use object::LittleEndian;
use object::U32;
use object::U64;

/// Where each packed section of the relocatable starts in the output file.
/// Indexed by the section's index in the relocatable's section table. This
/// is the single source of truth for packed content placement.
pub(crate) struct SectionOffsets {
    offsets: Vec<Option<u64>>,
}

impl SectionOffsets {
    pub(crate) fn new(num_sections: usize) -> SectionOffsets {
        SectionOffsets {
            offsets: vec![None; num_sections],
        }
    }

    fn set(&mut self, index: object::SectionIndex, offset: u64) {
        self.offsets[index.0] = Some(offset);
    }

    pub(crate) fn contains(&self, index: object::SectionIndex) -> bool {
        self.offsets.get(index.0).is_some_and(|o| o.is_some())
    }

    /// File offset of a packed section. Asking for a section that wasn't
    /// packed is a logic error on the caller's part, reported by index.
    pub(crate) fn get(&self, index: object::SectionIndex) -> Result<u64> {
        match self.offsets.get(index.0) {
            Some(Some(offset)) => Ok(*offset),
            _ => bail!("Section {} was not assigned a load segment", index.0),
        }
    }

    fn shift(&mut self, delta: u64) {
        for offset in self.offsets.iter_mut().flatten() {
            *offset += delta;
        }
    }
}

pub(crate) struct Layout {
    /// Entry point of the original executable. Relocations against the
    /// pseudo-symbol `orig_start` resolve to this.
    pub(crate) orig_start: u64,

    /// Lowest `p_vaddr` of any load segment, after the one-page shift.
    pub(crate) base_address: u64,

    /// The complete output program header table: the original segments
    /// (shifted) followed by the new load segments.
    pub(crate) segments: Vec<ProgramHeader>,

    pub(crate) section_offsets: SectionOffsets,

    /// Number of entries in `segments` that came from the executable.
    pub(crate) num_original_segments: usize,

    /// `e_shoff` for the output: the original table location plus the shift.
    pub(crate) shdr_offset: u64,

    /// Total size of the output file.
    pub(crate) file_size: u64,
}

#[tracing::instrument(skip_all, name = "Compute layout")]
pub(crate) fn compute(exec: &elf::File, classes: &ClassifiedSections) -> Result<Layout> {
    let e = LittleEndian;
    let mut planner = Planner {
        base_address: find_base_address(exec.segments)?,
        file_end: exec.data.len() as u64,
        segments: exec.segments.to_vec(),
        section_offsets: SectionOffsets::new(classes.num_rel_sections),
    };
    for class in SECTION_CLASSES {
        planner.add_segment(class, classes.class(class));
    }
    planner.make_space_for_headers(exec.header.e_phoff.get(e), exec.segments.len())?;

    Ok(Layout {
        orig_start: exec.header.e_entry.get(e),
        base_address: planner.base_address,
        segments: planner.segments,
        section_offsets: planner.section_offsets,
        num_original_segments: exec.segments.len(),
        shdr_offset: exec.header.e_shoff.get(e) + PAGE_SIZE,
        file_size: planner.file_end + PAGE_SIZE,
    })
}

/// The load origin of the image: the smallest `p_vaddr` across load
/// segments.
fn find_base_address(segments: &[ProgramHeader]) -> Result<u64> {
    let e = LittleEndian;
    segments
        .iter()
        .filter(|p| p.p_type.get(e) == object::elf::PT_LOAD)
        .map(|p| p.p_vaddr.get(e))
        .min()
        .ok_or_else(|| anyhow::anyhow!("Executable has no load segments"))
}

struct Planner {
    base_address: u64,
    file_end: u64,
    segments: Vec<ProgramHeader>,
    section_offsets: SectionOffsets,
}

impl Planner {
    /// Appends one load segment holding `sections`, in order, at the end of
    /// the file. Constructed so that `p_vaddr == p_offset + base_address`,
    /// which lets later phases treat file offsets and addresses as the same
    /// thing modulo the base.
    fn add_segment(&mut self, class: SectionClass, sections: &[ClassifiedSection]) {
        if sections.is_empty() {
            return;
        }
        let e = LittleEndian;
        let new_off = self.file_end.next_multiple_of(PAGE_SIZE);
        self.file_end = new_off;

        let mut size: u64 = 0;
        for section in sections {
            let align = section.header.sh_addralign.get(e).max(1);
            size = size.next_multiple_of(align);
            self.section_offsets.set(section.index, new_off + size);
            size += section.header.sh_size.get(e);
        }

        tracing::debug!(?class, offset = new_off, size, "planned segment");
        self.segments.push(ProgramHeader {
            p_type: U32::new(e, object::elf::PT_LOAD),
            p_flags: U32::new(e, class.segment_flags()),
            p_offset: U64::new(e, new_off),
            p_vaddr: U64::new(e, new_off + self.base_address),
            p_paddr: U64::new(e, new_off + self.base_address),
            p_filesz: U64::new(e, size),
            p_memsz: U64::new(e, size),
            p_align: U64::new(e, PAGE_SIZE),
        });
        self.file_end += size;
    }

    /// Inserts one page of file and address space in front of the original
    /// image so the grown program header table has somewhere to live.
    ///
    /// Every segment that overlaps the original header region keeps its
    /// content addresses stable by growing downwards in virtual space; every
    /// later file offset slides up by one page.
    fn make_space_for_headers(&mut self, phoff: u64, num_original_segments: usize) -> Result {
        let e = LittleEndian;
        let phent = u64::from(elf::PROGRAM_HEADER_SIZE);
        ensure!(
            phoff >= u64::from(elf::FILE_HEADER_SIZE),
            "Program header table at {phoff:#x} overlaps the file header"
        );
        ensure!(
            phoff + self.segments.len() as u64 * phent <= PAGE_SIZE,
            "Program header table with {} entries does not fit in one page",
            self.segments.len()
        );
        let original_table_end = phoff + num_original_segments as u64 * phent;

        for segment in &mut self.segments {
            if segment.p_offset.get(e) < original_table_end {
                segment
                    .p_vaddr
                    .set(e, segment.p_vaddr.get(e).saturating_sub(PAGE_SIZE));
                segment
                    .p_paddr
                    .set(e, segment.p_paddr.get(e).saturating_sub(PAGE_SIZE));
                if segment.p_type.get(e) == object::elf::PT_LOAD {
                    segment
                        .p_filesz
                        .set(e, segment.p_filesz.get(e) + PAGE_SIZE);
                    segment.p_memsz.set(e, segment.p_memsz.get(e) + PAGE_SIZE);
                }
            }
        }

        self.base_address = find_base_address(&self.segments)?;

        for segment in &mut self.segments {
            if segment.p_type.get(e) != object::elf::PT_PHDR && segment.p_offset.get(e) != 0 {
                segment.p_offset.set(e, segment.p_offset.get(e) + PAGE_SIZE);
            }
        }

        self.section_offsets.shift(PAGE_SIZE);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::elf::SectionHeader;

    fn load_segment(offset: u64, vaddr: u64, size: u64) -> ProgramHeader {
        let e = LittleEndian;
        ProgramHeader {
            p_type: U32::new(e, object::elf::PT_LOAD),
            p_flags: U32::new(e, object::elf::PF_R | object::elf::PF_X),
            p_offset: U64::new(e, offset),
            p_vaddr: U64::new(e, vaddr),
            p_paddr: U64::new(e, vaddr),
            p_filesz: U64::new(e, size),
            p_memsz: U64::new(e, size),
            p_align: U64::new(e, PAGE_SIZE),
        }
    }

    fn alloc_section(index: usize, size: u64, addralign: u64) -> ClassifiedSection {
        let e = LittleEndian;
        let header = SectionHeader {
            sh_name: U32::new(e, 0),
            sh_type: U32::new(e, object::elf::SHT_PROGBITS),
            sh_flags: U64::new(e, u64::from(object::elf::SHF_ALLOC)),
            sh_addr: U64::new(e, 0),
            sh_offset: U64::new(e, 0),
            sh_size: U64::new(e, size),
            sh_link: U32::new(e, 0),
            sh_info: U32::new(e, 0),
            sh_addralign: U64::new(e, addralign),
            sh_entsize: U64::new(e, 0),
        };
        ClassifiedSection {
            index: object::SectionIndex(index),
            header,
        }
    }

    fn planner_with_one_load() -> Planner {
        Planner {
            base_address: 0x400000,
            file_end: 0x2a8,
            segments: vec![load_segment(0, 0x400000, 0x2a8)],
            section_offsets: SectionOffsets::new(8),
        }
    }

    #[test]
    fn test_add_segment_packs_with_alignment() {
        let e = LittleEndian;
        let mut planner = planner_with_one_load();
        planner.add_segment(
            SectionClass::Rx,
            &[alloc_section(1, 0x11, 16), alloc_section(2, 0x20, 32)],
        );

        // First section at the page boundary, second bumped to the next
        // multiple of its alignment.
        assert_eq!(planner.section_offsets.get(object::SectionIndex(1)).unwrap(), 0x1000);
        assert_eq!(planner.section_offsets.get(object::SectionIndex(2)).unwrap(), 0x1020);

        let segment = &planner.segments[1];
        assert_eq!(segment.p_offset.get(e), 0x1000);
        assert_eq!(segment.p_vaddr.get(e), 0x401000);
        assert_eq!(segment.p_filesz.get(e), 0x40);
        assert_eq!(planner.file_end, 0x1040);
    }

    #[test]
    fn test_add_segment_skips_empty_class() {
        let mut planner = planner_with_one_load();
        planner.add_segment(SectionClass::R, &[]);
        assert_eq!(planner.segments.len(), 1);
        assert_eq!(planner.file_end, 0x2a8);
    }

    #[test]
    fn test_make_space_shifts_image_by_one_page() {
        let e = LittleEndian;
        let mut planner = planner_with_one_load();
        planner
            .segments
            .push(load_segment(0x200, 0x401200, 0x80));
        planner.add_segment(SectionClass::Rx, &[alloc_section(1, 0x20, 16)]);
        planner.make_space_for_headers(0x40, 2).unwrap();

        // The first load segment covers the header page: address down one
        // page, sizes up one page, offset still zero.
        let first = &planner.segments[0];
        assert_eq!(first.p_vaddr.get(e), 0x3ff000);
        assert_eq!(first.p_filesz.get(e), 0x2a8 + PAGE_SIZE);
        assert_eq!(first.p_offset.get(e), 0);
        assert_eq!(planner.base_address, 0x3ff000);

        // Later segments keep their addresses but move one page further into
        // the file.
        let second = &planner.segments[1];
        assert_eq!(second.p_offset.get(e), 0x200 + PAGE_SIZE);
        assert_eq!(second.p_vaddr.get(e), 0x401200);

        // The new segment moves too, and stays congruent with its address.
        let new = &planner.segments[2];
        assert_eq!(new.p_offset.get(e), 0x2000);
        assert_eq!(new.p_vaddr.get(e), 0x401000);
        assert_eq!(
            new.p_vaddr.get(e) - new.p_offset.get(e),
            planner.base_address
        );
        assert_eq!(
            planner.section_offsets.get(object::SectionIndex(1)).unwrap(),
            0x2000
        );
    }

    #[test]
    fn test_make_space_rejects_oversized_table() {
        let mut planner = planner_with_one_load();
        planner.segments = (0..73u64).map(|i| load_segment(i * 0x10, 0x400000, 8)).collect();
        assert!(planner.make_space_for_headers(0x40, 73).is_err());
    }

    #[test]
    fn test_section_offsets_unassigned() {
        let offsets = SectionOffsets::new(4);
        assert!(offsets.get(object::SectionIndex(2)).is_err());
        assert!(offsets.get(object::SectionIndex(9)).is_err());
        assert!(!offsets.contains(object::SectionIndex(2)));
    }
}
