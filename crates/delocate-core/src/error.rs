use std::path::PathBuf;

use thiserror::Error;

use delocate_filename::WheelFilenameError;
use delocate_platform::Arch;

#[derive(Debug, Error)]
pub enum DelocateError {
    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    WalkDir(#[from] walkdir::Error),

    #[error("Failed to read or write wheel archive")]
    Zip(#[from] zip::result::ZipError),

    #[error("Failed to write RECORD file")]
    Csv(#[from] csv::Error),

    #[error("Not a Mach-O binary: `{}`", path.display())]
    NotMachO { path: PathBuf },

    #[error("Failed to parse Mach-O binary: {0}")]
    MachOParse(String),

    #[error("Could not find `{install_name}` referenced by `{}`", consumer.display())]
    UnresolvedDependency {
        install_name: String,
        consumer: PathBuf,
    },

    #[error("Failed to patch `{}`", path.display())]
    Patch {
        path: PathBuf,
        #[source]
        source: PatchError,
    },

    #[error("{}", fuse_conflict_message(path, *arch))]
    FuseConflict { path: PathBuf, arch: Option<Arch> },

    #[error("Required architecture `{arch}` missing from `{}`", path.display())]
    MissingArchitecture { arch: Arch, path: PathBuf },

    #[error("Some missing architectures in wheel\n{}", _0.join("\n"))]
    ArchitectureMismatch(Vec<String>),

    #[error(
        "Library `{}` requires macOS {library_version}, but the wheel targets macOS {wheel_version}",
        library.display()
    )]
    IncompatibleMacOSVersion {
        library: PathBuf,
        library_version: String,
        wheel_version: String,
    },

    #[error("Invalid wheel filename `{filename}`")]
    InvalidWheelFilename {
        filename: String,
        #[source]
        err: WheelFilenameError,
    },

    #[error("Not a wheel path: `{}`", path.display())]
    InvalidWheelPath { path: PathBuf },

    #[error("Wheel is missing a `.dist-info` directory")]
    MissingDistInfo,

    #[error("Path `{}` is not inside `{}`", path.display(), wheel_dir.display())]
    PathNotInWheel { path: PathBuf, wheel_dir: PathBuf },

    #[error("Cannot add platform tags to a pure wheel: `{filename}`")]
    PureWheel { filename: String },

    #[error("Wheel already exists: `{}` (use `--clobber` to overwrite)", path.display())]
    WheelExists { path: PathBuf },

    #[error("No platform tags specified")]
    MissingPlatformTags,
}

fn fuse_conflict_message(path: &std::path::Path, arch: Option<Arch>) -> String {
    match arch {
        Some(arch) => format!(
            "Cannot fuse `{}`: both inputs contain a different `{arch}` slice",
            path.display()
        ),
        None => format!(
            "Cannot fuse `{}`: the inputs differ and are not Mach-O binaries",
            path.display()
        ),
    }
}

/// An error raised while rewriting the load commands or signature of a single binary.
#[derive(Debug, Error)]
pub enum PatchError {
    #[error("Malformed Mach-O: {0}")]
    Malformed(String),

    #[error(
        "Not enough header padding for the new load commands ({needed} bytes needed, {available} available); relink with `-headerpad_max_install_names`"
    )]
    HeaderPadExhausted { needed: usize, available: usize },

    #[error("Unsupported Mach-O format")]
    UnsupportedFormat,

    #[error("Binary has no install name (`LC_ID_DYLIB`)")]
    MissingInstallId,

    #[error("No such dependency: `{0}`")]
    DependencyNotFound(String),

    #[error("No such rpath: `{0}`")]
    RpathNotFound(String),

    #[error("Failed to sign binary: {0}")]
    Signature(String),

    #[error("`codesign` failed: {stderr}")]
    CodesignFailed { stderr: String },

    #[error("Patched binary failed verification: {0}")]
    Verification(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}
