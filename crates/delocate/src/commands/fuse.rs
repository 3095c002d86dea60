use std::fmt::Write;

use anyhow::{Context, Result};

use delocate_cli::FuseArgs;
use delocate_core::wheel;

use crate::commands::{ExitStatus, parent_dir};
use crate::printer::Printer;

/// Fuse `FROM_WHEEL` into `TO_WHEEL`.
///
/// Without `--wheel-dir`, the fused wheel replaces `TO_WHEEL`.
pub(crate) fn fuse(args: &FuseArgs, printer: Printer) -> Result<ExitStatus> {
    let out_dir = args
        .wheel_dir
        .clone()
        .unwrap_or_else(|| parent_dir(&args.to_wheel));

    let out_wheel = wheel::fuse_wheels(&args.to_wheel, &args.from_wheel, &out_dir)
        .with_context(|| {
            format!(
                "Failed to fuse `{}` into `{}`",
                args.from_wheel.display(),
                args.to_wheel.display()
            )
        })?;
    writeln!(printer.verbose(), "Wrote {}", out_wheel.display())?;

    if args.wheel_dir.is_none() && out_wheel.file_name() != args.to_wheel.file_name() {
        fs_err::remove_file(&args.to_wheel)?;
        writeln!(
            printer.verbose(),
            "Deleted old wheel {}",
            args.to_wheel.display()
        )?;
    }

    Ok(ExitStatus::Success)
}
