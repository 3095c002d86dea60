#![allow(dead_code)]

use std::path::{Path, PathBuf};

use assert_cmd::Command;
use tempfile::TempDir;

use delocate_test::{CPU_TYPE_X86_64, MachOBuilder, wheel_metadata, write_wheel};

pub const WHEEL_NAME: &str = "foo-1.0-cp312-cp312-macosx_10_9_x86_64.whl";

/// A temporary directory, with symlinks resolved.
pub fn temp_root() -> (TempDir, PathBuf) {
    let temp = TempDir::new().unwrap();
    let root = temp.path().canonicalize().unwrap();
    (temp, root)
}

/// A `delocate` command running in `dir`, isolated from the caller's environment.
pub fn delocate_command(dir: &Path) -> Command {
    let mut command = Command::new(env!("CARGO_BIN_EXE_delocate"));
    command
        .current_dir(dir)
        .env_remove("RUST_LOG")
        .env_remove("MACOSX_DEPLOYMENT_TARGET")
        .env_remove("DELOCATE_EXCLUDE_PREFIXES")
        .env("NO_COLOR", "1");
    command
}

/// Write `<root>/lib/libfoo.dylib`, returning its path.
pub fn external_library(root: &Path) -> PathBuf {
    let libfoo = root.join("lib").join("libfoo.dylib");
    MachOBuilder::dylib(CPU_TYPE_X86_64, &libfoo.to_string_lossy()).write(&libfoo)
}

/// Write a wheel named [`WHEEL_NAME`] into `dir` whose extension module links `library`.
pub fn wheel_linking(dir: &Path, library: &Path) -> PathBuf {
    let ext = MachOBuilder::bundle(CPU_TYPE_X86_64)
        .dependency(&library.to_string_lossy())
        .dependency("/usr/lib/libSystem.B.dylib")
        .build();
    let metadata = wheel_metadata(&["cp312-cp312-macosx_10_9_x86_64"]);
    write_wheel(
        &dir.join(WHEEL_NAME),
        &[
            ("foo/__init__.py", b""),
            ("foo/ext.so", &ext),
            ("foo-1.0.dist-info/WHEEL", metadata.as_bytes()),
            ("foo-1.0.dist-info/RECORD", b""),
        ],
    )
}
