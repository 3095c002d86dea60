use std::path::{Path, PathBuf};
use std::process::ExitCode;

use delocate_cli::DelocateArgs;
use delocate_core::DelocateOptions;

pub(crate) use add_platforms::add_platforms;
pub(crate) use fuse::fuse;
pub(crate) use list_deps::list_deps;
pub(crate) use patch_binary::patch_binary;
pub(crate) use path::path;
pub(crate) use wheel::wheel;

mod add_platforms;
mod fuse;
mod list_deps;
mod patch_binary;
mod path;
mod wheel;

#[derive(Copy, Clone)]
pub(crate) enum ExitStatus {
    /// The command succeeded.
    Success,

    /// The command failed due to an error in the user input.
    #[allow(unused)]
    Failure,

    /// The command failed with an unexpected error.
    Error,
}

impl From<ExitStatus> for ExitCode {
    fn from(status: ExitStatus) -> Self {
        match status {
            ExitStatus::Success => Self::from(0),
            ExitStatus::Failure => Self::from(1),
            ExitStatus::Error => Self::from(2),
        }
    }
}

/// The [`DelocateOptions`] for the shared command-line arguments.
fn delocate_options(args: &DelocateArgs) -> DelocateOptions {
    DelocateOptions {
        lib_sdir: args.lib_sdir.clone(),
        exclude: args.exclude.clone(),
        exclude_prefixes: args.exclude_prefixes.clone(),
        dylibs_only: args.dylibs_only,
        sanitize_rpaths: !args.no_sanitize_rpaths,
        signer: args.signer,
        ..DelocateOptions::default()
    }
}

/// The directory containing a file, which is `.` for a bare file name.
fn parent_dir(path: &Path) -> PathBuf {
    path.parent()
        .filter(|parent| !parent.as_os_str().is_empty())
        .map_or_else(|| PathBuf::from("."), Path::to_path_buf)
}
