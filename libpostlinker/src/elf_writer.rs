//! Produces the output file. The original executable is copied one page
//! further into the file than it was, the rewritten header tables and the
//! packed sections are laid over that, and the file header goes in last
//! once the relocation engine has settled the entry point.

use crate::elf;
use crate::elf::SectionHeader;
use crate::elf::PAGE_SIZE;
use crate::error::Result;
use crate::layout::Layout;
use crate::section_class::ClassifiedSections;
use crate::section_class::SECTION_CLASSES;
use anyhow::Context as _;
use memmap2::MmapOptions;
use object::read::elf::SectionHeader as _;
use object::LittleEndian;
use std::io::Write as _;
use std::ops::Deref;
use std::ops::DerefMut;
use std::path::Path;
use std::path::PathBuf;

pub(crate) struct Output {
    file: std::fs::File,
    buffer: PatchBuffer,
    path: PathBuf,
}

/// Every phase after planning rewrites bytes that an earlier phase already
/// placed (header tables over the blank page, relocation sites inside
/// copied sections), so the whole sized file needs to be addressable as one
/// mutable byte range. Mapping the output gives us that directly; when the
/// file can't be sized or mapped, the image is assembled on the heap
/// instead and only hits the disk in `finish`.
enum PatchBuffer {
    Mapped(memmap2::MmapMut),
    Assembled(Vec<u8>),
}

impl Output {
    #[tracing::instrument(skip_all, name = "Create output file")]
    pub(crate) fn create(path: &Path, file_size: u64) -> Result<Output> {
        let mut open_options = std::fs::OpenOptions::new();

        // If we spawn a subprocess from some wrapper, we don't want it to
        // inherit a descriptor for the half-written output.
        std::os::unix::fs::OpenOptionsExt::custom_flags(&mut open_options, libc::O_CLOEXEC);

        let file = open_options
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(path)
            .with_context(|| format!("Failed to open `{}`", path.display()))?;

        let buffer = match file
            .set_len(file_size)
            .and_then(|()| unsafe { MmapOptions::new().map_mut(&file) })
        {
            Ok(mmap) => PatchBuffer::Mapped(mmap),
            Err(error) => {
                tracing::debug!(%error, "can't map the output, assembling it in memory");
                PatchBuffer::Assembled(vec![0; file_size as usize])
            }
        };

        Ok(Output {
            file,
            buffer,
            path: path.to_owned(),
        })
    }

    #[tracing::instrument(skip_all, name = "Write output file")]
    pub(crate) fn write_content(
        &mut self,
        exec: &elf::File,
        rel: &elf::File,
        classes: &ClassifiedSections,
        layout: &Layout,
    ) -> Result {
        self.copy_original_image(exec)?;
        self.write_program_headers(exec, layout)?;
        self.write_section_headers(exec, layout)?;
        self.write_packed_sections(rel, classes, layout)
    }

    /// Byte-for-byte copy of the original executable, one page further in.
    /// The first page of the output stays zero for now; the header tables
    /// land there afterwards.
    fn copy_original_image(&mut self, exec: &elf::File) -> Result {
        self.write_at(PAGE_SIZE, exec.data)
    }

    /// The program header table keeps its original file offset, which is now
    /// one page before the content it used to sit beside. That's exactly the
    /// room `make_space_for_headers` created for the extra entries.
    fn write_program_headers(&mut self, exec: &elf::File, layout: &Layout) -> Result {
        let phoff = exec.header.e_phoff.get(LittleEndian);
        self.write_at(phoff, object::bytes_of_slice(&layout.segments))
    }

    /// The section header table moves with the content. Every entry except
    /// the null entry points at content that moved one page, so the offsets
    /// move with it; addresses are unchanged.
    fn write_section_headers(&mut self, exec: &elf::File, layout: &Layout) -> Result {
        let e = LittleEndian;
        let mut headers: Vec<SectionHeader> = exec.sections.iter().copied().collect();
        for header in headers.iter_mut().skip(1) {
            header.sh_offset.set(e, header.sh_offset.get(e) + PAGE_SIZE);
        }
        self.write_at(layout.shdr_offset, object::bytes_of_slice(&headers))
    }

    fn write_packed_sections(
        &mut self,
        rel: &elf::File,
        classes: &ClassifiedSections,
        layout: &Layout,
    ) -> Result {
        let e = LittleEndian;
        for class in SECTION_CLASSES {
            for section in classes.class(class) {
                if section.header.sh_type.get(e) == object::elf::SHT_NOBITS {
                    // Occupies its slot in the segment, but has no file
                    // content; the buffer is already zeroed.
                    continue;
                }
                let data = section.header.data(e, rel.data)?;
                self.write_at(layout.section_offsets.get(section.index)?, data)?;
            }
        }
        Ok(())
    }

    /// Written last: the entry point isn't known until the relocation engine
    /// has run.
    #[tracing::instrument(skip_all, name = "Write file header")]
    pub(crate) fn write_file_header(
        &mut self,
        exec: &elf::File,
        layout: &Layout,
        entry: u64,
    ) -> Result {
        let e = LittleEndian;
        let mut header = *exec.header;
        header.e_entry.set(e, entry);
        header.e_shoff.set(e, layout.shdr_offset);
        header.e_phnum.set(
            e,
            u16::try_from(layout.segments.len()).context("Too many program headers")?,
        );
        self.write_at(0, object::bytes_of(&header))
    }

    fn write_at(&mut self, offset: u64, bytes: &[u8]) -> Result {
        let start = usize::try_from(offset).context("Write offset too large")?;
        let out: &mut [u8] = self;
        out.get_mut(start..start + bytes.len())
            .with_context(|| format!("Write outside the output file at {offset:#x}"))?
            .copy_from_slice(bytes);
        Ok(())
    }

    /// Flushes (if the image was assembled in memory) and makes the output
    /// runnable.
    #[tracing::instrument(skip_all, name = "Finish output file")]
    pub(crate) fn finish(mut self) -> Result {
        match &self.buffer {
            PatchBuffer::Mapped(_) => {}
            PatchBuffer::Assembled(bytes) => self
                .file
                .write_all(bytes)
                .with_context(|| format!("Failed to write to `{}`", self.path.display()))?,
        }
        crate::fs::make_executable(&self.file)
            .with_context(|| format!("Failed to chmod `{}`", self.path.display()))
    }
}

impl Deref for Output {
    type Target = [u8];

    fn deref(&self) -> &Self::Target {
        match &self.buffer {
            PatchBuffer::Mapped(mmap) => mmap,
            PatchBuffer::Assembled(bytes) => bytes,
        }
    }
}

impl DerefMut for Output {
    fn deref_mut(&mut self) -> &mut Self::Target {
        match &mut self.buffer {
            PatchBuffer::Mapped(mmap) => mmap,
            PatchBuffer::Assembled(bytes) => bytes,
        }
    }
}
