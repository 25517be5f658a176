use crate::error::Result;
use std::fs::File;

/// Marks the output as runnable. The output is always an executable, so
/// unlike a regular linker we don't derive the execute bits from the read
/// bits; the mode is fixed.
pub(crate) fn make_executable(file: &File) -> Result {
    use std::os::unix::prelude::PermissionsExt as _;

    file.set_permissions(std::fs::Permissions::from_mode(0o755))?;
    Ok(())
}
