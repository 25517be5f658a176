//! Partitions the relocatable's allocatable sections by the memory
//! permissions they need. Each non-empty class later becomes one load
//! segment.

use crate::elf;
use crate::elf::SectionHeader;
use crate::error::Result;
use object::LittleEndian;

/// Permission class of a loadable section. The discriminant order is the
/// order in which segments are planned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum SectionClass {
    R,
    Rw,
    Rx,
    Rwx,
}

pub(crate) const SECTION_CLASSES: [SectionClass; 4] = [
    SectionClass::R,
    SectionClass::Rw,
    SectionClass::Rx,
    SectionClass::Rwx,
];

impl SectionClass {
    pub(crate) fn segment_flags(self) -> u32 {
        match self {
            SectionClass::R => object::elf::PF_R,
            SectionClass::Rw => object::elf::PF_R | object::elf::PF_W,
            SectionClass::Rx => object::elf::PF_R | object::elf::PF_X,
            SectionClass::Rwx => object::elf::PF_R | object::elf::PF_W | object::elf::PF_X,
        }
    }

    fn from_section_flags(sh_flags: u64) -> SectionClass {
        let writable = sh_flags & u64::from(object::elf::SHF_WRITE) != 0;
        let executable = sh_flags & u64::from(object::elf::SHF_EXECINSTR) != 0;
        match (writable, executable) {
            (true, true) => SectionClass::Rwx,
            (true, false) => SectionClass::Rw,
            (false, true) => SectionClass::Rx,
            (false, false) => SectionClass::R,
        }
    }

    fn index(self) -> usize {
        self as usize
    }
}

/// A section that will be packed into one of our new segments, together
/// with its index in the relocatable's section table.
#[derive(Clone, Copy)]
pub(crate) struct ClassifiedSection {
    pub(crate) index: object::SectionIndex,
    pub(crate) header: SectionHeader,
}

pub(crate) struct ClassifiedSections {
    by_class: [Vec<ClassifiedSection>; 4],

    /// Total number of sections in the relocatable, packed or not.
    pub(crate) num_rel_sections: usize,
}

impl ClassifiedSections {
    pub(crate) fn class(&self, class: SectionClass) -> &[ClassifiedSection] {
        &self.by_class[class.index()]
    }

    /// How many load segments we'll create.
    pub(crate) fn num_non_empty_classes(&self) -> usize {
        self.by_class.iter().filter(|c| !c.is_empty()).count()
    }
}

/// Selects the sections that need to be present in memory at runtime and
/// groups them by permission class. Empty sections are dropped; order within
/// a class follows the section table.
#[tracing::instrument(skip_all, name = "Classify sections")]
pub(crate) fn classify_sections(rel: &elf::File) -> Result<ClassifiedSections> {
    let e = LittleEndian;
    let mut by_class: [Vec<ClassifiedSection>; 4] = Default::default();
    for (i, section) in rel.sections.iter().enumerate() {
        let sh_flags = section.sh_flags.get(e);
        if sh_flags & u64::from(object::elf::SHF_ALLOC) == 0 || section.sh_size.get(e) == 0 {
            continue;
        }
        let class = SectionClass::from_section_flags(sh_flags);
        tracing::debug!(
            section = %String::from_utf8_lossy(rel.section_name(section)?),
            ?class,
            "pack"
        );
        by_class[class.index()].push(ClassifiedSection {
            index: object::SectionIndex(i),
            header: *section,
        });
    }
    Ok(ClassifiedSections {
        by_class,
        num_rel_sections: rel.num_sections(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    const SHF_ALLOC: u64 = object::elf::SHF_ALLOC as u64;
    const SHF_WRITE: u64 = object::elf::SHF_WRITE as u64;
    const SHF_EXECINSTR: u64 = object::elf::SHF_EXECINSTR as u64;

    #[test]
    fn test_class_from_flags() {
        assert_eq!(
            SectionClass::from_section_flags(SHF_ALLOC),
            SectionClass::R
        );
        assert_eq!(
            SectionClass::from_section_flags(SHF_ALLOC | SHF_WRITE),
            SectionClass::Rw
        );
        assert_eq!(
            SectionClass::from_section_flags(SHF_ALLOC | SHF_EXECINSTR),
            SectionClass::Rx
        );
        assert_eq!(
            SectionClass::from_section_flags(SHF_ALLOC | SHF_WRITE | SHF_EXECINSTR),
            SectionClass::Rwx
        );
    }

    #[test]
    fn test_segment_flags() {
        assert_eq!(SectionClass::R.segment_flags(), 0x4);
        assert_eq!(SectionClass::Rx.segment_flags(), 0x5);
        assert_eq!(SectionClass::Rw.segment_flags(), 0x6);
        assert_eq!(SectionClass::Rwx.segment_flags(), 0x7);
    }
}
