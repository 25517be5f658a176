//! Code for identifying what sort of file we're dealing with based on the
//! bytes of the file.

use crate::elf;
use crate::error::Result;
use anyhow::bail;
use object::LittleEndian;

#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub(crate) enum FileKind {
    /// A fully linked, non-relocatable executable (ET_EXEC).
    Executable,

    /// A relocatable object file (ET_REL).
    Relocatable,
}

impl FileKind {
    pub(crate) fn identify_bytes(bytes: &[u8]) -> Result<FileKind> {
        if !bytes.starts_with(&object::elf::ELFMAG) {
            bail!("Not an ELF file");
        }
        const HEADER_LEN: usize = size_of::<elf::FileHeader>();
        if bytes.len() < HEADER_LEN {
            bail!("Invalid ELF file");
        }
        let header: &elf::FileHeader = object::from_bytes(&bytes[..HEADER_LEN])
            .map_err(|()| anyhow::anyhow!("Invalid ELF file"))?
            .0;
        if header.e_ident.class != object::elf::ELFCLASS64 {
            bail!("Only 64 bit ELF is supported");
        }
        if header.e_ident.data != object::elf::ELFDATA2LSB {
            bail!("Only little endian is supported");
        }
        let e = LittleEndian;
        if header.e_machine.get(e) != object::elf::EM_X86_64 {
            bail!("Only x86-64 is supported");
        }
        match header.e_type.get(e) {
            object::elf::ET_EXEC => Ok(FileKind::Executable),
            object::elf::ET_REL => Ok(FileKind::Relocatable),
            t => bail!("Unsupported ELF kind {t}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::FileKind;

    #[test]
    fn test_identify_rejects_non_elf() {
        assert!(FileKind::identify_bytes(b"!<arch>\n").is_err());
        assert!(FileKind::identify_bytes(b"").is_err());
        assert!(FileKind::identify_bytes(&[0x7f, b'E', b'L', b'F']).is_err());
    }
}
