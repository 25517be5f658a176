pub use anyhow::Error;

pub type Result<T = (), E = Error> = core::result::Result<T, E>;

/// Prints the full error chain, then terminates the process with a non-zero
/// exit code. A failed run never leaves the process alive: there is no retry
/// and no partial-success recovery, although a partially written output file
/// is left on disk.
pub fn report_error_and_exit(error: &Error) -> ! {
    eprintln!("postlinker: error: {error:#}");
    std::process::exit(1);
}
