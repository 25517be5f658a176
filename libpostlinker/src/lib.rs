//! Takes a fully linked static executable and a relocatable object, and
//! produces an executable that additionally carries the object's code and
//! data. The object's `_start` becomes the entry point and can chain to the
//! original entry point via the pseudo-symbol `orig_start`.

use anyhow::Context as _;
use tracing_subscriber::fmt;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

pub mod args;
pub(crate) mod elf;
pub(crate) mod elf_writer;
pub mod error;
pub(crate) mod file_kind;
pub(crate) mod fs;
pub(crate) mod input_data;
pub(crate) mod layout;
pub(crate) mod relocation;
pub(crate) mod section_class;
pub(crate) mod validation;

pub use args::Args;

/// Runs the whole pipeline. Each phase consumes what the previous one
/// produced, so the ordering here is load-bearing: planning fixes the
/// offsets, the writer materialises them, and the relocation engine patches
/// bytes the writer already placed.
pub fn run(args: &Args) -> error::Result {
    let _ = tracing_subscriber::registry()
        .with(fmt::layer())
        .with(EnvFilter::from_default_env())
        .try_init();

    let input_data = input_data::InputData::from_args(args)?;
    let exec = elf::File::parse(input_data.exec.data())
        .with_context(|| format!("Failed to parse `{}`", input_data.exec.path.display()))?;
    let rel = elf::File::parse(input_data.rel.data())
        .with_context(|| format!("Failed to parse `{}`", input_data.rel.path.display()))?;

    let classes = section_class::classify_sections(&rel)?;
    let layout = layout::compute(&exec, &classes)?;

    let mut output = elf_writer::Output::create(&args.output, layout.file_size)?;
    output.write_content(&exec, &rel, &classes, &layout)?;
    let entry = relocation::apply_relocations(&mut output, &exec, &rel, &layout)?;
    output.write_file_header(&exec, &layout, entry)?;

    if args.validate_output || cfg!(debug_assertions) {
        validation::validate_bytes(&output, &classes, &layout)?;
    }

    output.finish()
}
