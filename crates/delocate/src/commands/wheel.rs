use std::fmt::Write;

use anyhow::{Context, Result};
use tracing::debug;

use delocate_cli::WheelArgs;
use delocate_core::DelocateOptions;

use crate::commands::{ExitStatus, delocate_options, parent_dir};
use crate::printer::Printer;

/// Delocate each wheel, writing the result to `--wheel-dir` or over the input.
pub(crate) fn wheel(args: &WheelArgs, printer: Printer) -> Result<ExitStatus> {
    let options = DelocateOptions {
        check_archs: args.check_archs,
        require_archs: args
            .require_archs
            .as_ref()
            .map(|archs| archs.0.clone())
            .unwrap_or_default(),
        target_macos_version: args.require_target_macos_version,
        ..delocate_options(&args.delocate)
    };

    if let Some(wheel_dir) = &args.wheel_dir {
        fs_err::create_dir_all(wheel_dir)?;
    }

    for wheel in &args.wheels {
        let dest_dir = args
            .wheel_dir
            .clone()
            .unwrap_or_else(|| parent_dir(wheel));

        writeln!(printer.stdout(), "Fixing: {}", wheel.display())?;
        let delocated = delocate_core::delocate_wheel(wheel, &dest_dir, &options)
            .with_context(|| format!("Failed to delocate `{}`", wheel.display()))?;
        debug!("Wrote {}", delocated.path.display());

        if !delocated.report.copied.is_empty() {
            writeln!(
                printer.verbose(),
                "Copied to package {} directory:",
                options.lib_sdir
            )?;
            for source in delocated.report.copied.keys() {
                writeln!(printer.verbose(), "  {}", source.display())?;
            }
        }
    }

    Ok(ExitStatus::Success)
}
