use std::fmt::Write;

use anyhow::{Context, Result};

use delocate_cli::PatchBinaryArgs;
use delocate_core::BinaryEdits;

use crate::commands::ExitStatus;
use crate::printer::Printer;

/// Edit the load commands of a single binary.
pub(crate) fn patch_binary(args: &PatchBinaryArgs, printer: Printer) -> Result<ExitStatus> {
    let mut edits = BinaryEdits {
        install_id: args.id.clone(),
        add_rpaths: args.add_rpath.clone(),
        delete_rpaths: args.delete_rpath.clone(),
        ..BinaryEdits::default()
    };
    for pair in args.change.chunks_exact(2) {
        edits.change(pair[0].as_str(), pair[1].as_str());
    }

    if edits.is_empty() {
        anyhow::bail!("No edits specified; use `--id`, `--change`, `--add-rpath`, or `--delete-rpath`");
    }

    let signer = args.signer.signer();
    let modified = delocate_core::patch_binary(&args.file, &edits, signer.as_ref())
        .with_context(|| format!("Failed to edit `{}`", args.file.display()))?;

    if modified {
        writeln!(printer.verbose(), "Patched {}", args.file.display())?;
    } else {
        writeln!(printer.verbose(), "{} is unchanged", args.file.display())?;
    }

    Ok(ExitStatus::Success)
}
