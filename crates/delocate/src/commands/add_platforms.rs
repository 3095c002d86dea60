use std::fmt::Write;
use std::path::Path;

use anyhow::{Context, Result};

use delocate_cli::AddPlatformsArgs;
use delocate_core::wheel;

use crate::commands::{ExitStatus, parent_dir};
use crate::printer::Printer;

/// Add platform tags to each wheel.
pub(crate) fn add_platforms(args: &AddPlatformsArgs, printer: Printer) -> Result<ExitStatus> {
    let tags = args.platform_tags()?;
    if tags.is_empty() {
        anyhow::bail!("Need at least one `--osx-ver` or `--plat-tag`");
    }
    let tag_names = tags.iter().map(ToString::to_string).collect::<Vec<_>>();

    if let Some(wheel_dir) = &args.wheel_dir {
        fs_err::create_dir_all(wheel_dir)?;
    }

    let multiple = args.wheels.len() > 1;
    for wheel in &args.wheels {
        let message = format!(
            "Setting platform tags {} for wheel {}",
            tag_names.join(","),
            wheel.display()
        );
        if multiple {
            writeln!(printer.stdout(), "{message}")?;
        } else {
            writeln!(printer.verbose(), "{message}")?;
        }

        let out_dir = args.wheel_dir.clone().unwrap_or_else(|| parent_dir(wheel));
        let written = match wheel::add_platforms(wheel, &tags, &out_dir, args.clobber) {
            Ok(written) => written,
            Err(err) if args.skip_errors => {
                writeln!(
                    printer.stdout(),
                    "Cannot modify {} because {err}",
                    wheel.display()
                )?;
                continue;
            }
            Err(err) => {
                return Err(err)
                    .with_context(|| format!("Failed to modify `{}`", wheel.display()));
            }
        };

        let Some(written) = written else {
            writeln!(
                printer.verbose(),
                "{} already has tags {}",
                wheel.display(),
                tag_names.join(", ")
            )?;
            continue;
        };
        writeln!(printer.verbose(), "Wrote {}", written.display())?;

        if args.rm_orig && !is_same_file(&written, wheel) {
            fs_err::remove_file(wheel)?;
            writeln!(printer.verbose(), "Deleted old wheel {}", wheel.display())?;
        }
    }

    Ok(ExitStatus::Success)
}

fn is_same_file(a: &Path, b: &Path) -> bool {
    match (a.canonicalize(), b.canonicalize()) {
        (Ok(a), Ok(b)) => a == b,
        _ => false,
    }
}
