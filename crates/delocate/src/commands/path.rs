use std::fmt::Write;

use anyhow::{Context, Result};

use delocate_cli::PathArgs;

use crate::commands::{ExitStatus, delocate_options};
use crate::printer::Printer;

/// Delocate each directory tree in place.
pub(crate) fn path(args: &PathArgs, printer: Printer) -> Result<ExitStatus> {
    let options = delocate_options(&args.delocate);

    for path in &args.paths {
        if !path.is_dir() {
            anyhow::bail!("`{}` is not a directory", path.display());
        }

        let report = delocate_core::delocate_tree(path, &options)
            .with_context(|| format!("Failed to delocate `{}`", path.display()))?;

        if !report.copied.is_empty() {
            writeln!(
                printer.verbose(),
                "Copied to {} directory in {}:",
                options.lib_sdir,
                path.display()
            )?;
            for source in report.copied.keys() {
                writeln!(printer.verbose(), "  {}", source.display())?;
            }
        }
    }

    Ok(ExitStatus::Success)
}
