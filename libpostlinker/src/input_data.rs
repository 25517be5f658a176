//! Maps the two input files into memory and checks that each one is the
//! kind of ELF we expect before any other phase looks at it.

use crate::args::Args;
use crate::error::Result;
use crate::file_kind::FileKind;
use anyhow::bail;
use anyhow::Context as _;
use memmap2::Mmap;
use std::path::Path;
use std::path::PathBuf;

pub(crate) struct InputData {
    pub(crate) exec: InputFile,
    pub(crate) rel: InputFile,
}

pub(crate) struct InputFile {
    pub(crate) path: PathBuf,
    bytes: Mmap,
}

impl InputData {
    #[tracing::instrument(skip_all, name = "Open input files")]
    pub(crate) fn from_args(args: &Args) -> Result<InputData> {
        Ok(InputData {
            exec: InputFile::new(&args.exec, FileKind::Executable)?,
            rel: InputFile::new(&args.rel, FileKind::Relocatable)?,
        })
    }
}

impl InputFile {
    fn new(path: &Path, expected_kind: FileKind) -> Result<InputFile> {
        let file = std::fs::File::open(path)
            .with_context(|| format!("Failed to open `{}`", path.display()))?;

        // Safety: The file is an input; we never write through this mapping
        // and assume nobody modifies the file while we're linking it.
        let bytes = unsafe { Mmap::map(&file) }
            .with_context(|| format!("Failed to mmap `{}`", path.display()))?;

        let kind = FileKind::identify_bytes(&bytes)
            .with_context(|| format!("Failed to parse `{}`", path.display()))?;
        if kind != expected_kind {
            bail!(
                "`{}` is {} but {} was expected",
                path.display(),
                kind.describe(),
                expected_kind.describe()
            );
        }

        Ok(InputFile {
            path: path.to_owned(),
            bytes,
        })
    }

    pub(crate) fn data(&self) -> &[u8] {
        &self.bytes
    }
}

impl FileKind {
    fn describe(self) -> &'static str {
        match self {
            FileKind::Executable => "an executable (ET_EXEC)",
            FileKind::Relocatable => "a relocatable object (ET_REL)",
        }
    }
}
