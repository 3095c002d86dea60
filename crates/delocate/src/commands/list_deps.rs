use std::fmt::Write;

use anyhow::{Context, Result};

use delocate_cli::ListDepsArgs;

use crate::commands::ExitStatus;
use crate::printer::Printer;

/// Print the libraries each wheel or directory depends on.
pub(crate) fn list_deps(args: &ListDepsArgs, printer: Printer) -> Result<ExitStatus> {
    let multiple = args.paths.len() > 1;
    let indent = if multiple { "    " } else { "" };

    for path in &args.paths {
        let dependencies = delocate_core::list_dependencies(path, args.all)
            .with_context(|| format!("Failed to list dependencies of `{}`", path.display()))?;

        if multiple {
            writeln!(printer.stdout(), "{}:", path.display())?;
        }
        for (library, consumers) in &dependencies {
            if !args.depending {
                writeln!(printer.stdout(), "{indent}{library}")?;
                continue;
            }
            writeln!(printer.stdout(), "{indent}{library}:")?;
            for consumer in consumers {
                // Consumers in a directory are shown as paths that can be opened from here.
                let consumer = if path.is_dir() {
                    path.join(consumer)
                } else {
                    consumer.clone()
                };
                writeln!(printer.stdout(), "{indent}    {}", consumer.display())?;
            }
        }
    }

    Ok(ExitStatus::Success)
}
