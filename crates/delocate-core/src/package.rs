//! The directory tree being delocated.

use std::path::{Path, PathBuf};

use fs_err as fs;
use walkdir::WalkDir;

use crate::error::DelocateError;
use crate::macho;

/// A package tree and the directory inside it that receives copied libraries.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Package {
    root: PathBuf,
    lib_dir: PathBuf,
}

impl Package {
    /// Open a tree whose libraries are copied to `<root>/<lib_sdir>`.
    pub fn open(root: &Path, lib_sdir: &str) -> Result<Self, DelocateError> {
        let root = root.canonicalize()?;
        let lib_dir = root.join(lib_sdir);
        Ok(Self { root, lib_dir })
    }

    /// Open a tree whose libraries are copied to `lib_dir`, which must lie inside `root`.
    pub fn with_lib_dir(root: &Path, lib_dir: &Path) -> Result<Self, DelocateError> {
        let root = root.canonicalize()?;
        let lib_dir = if lib_dir.is_absolute() {
            lib_dir.to_path_buf()
        } else {
            root.join(lib_dir)
        };
        if !lib_dir.starts_with(&root) {
            return Err(DelocateError::PathNotInWheel {
                path: lib_dir,
                wheel_dir: root,
            });
        }
        Ok(Self { root, lib_dir })
    }

    /// The real path of the package root.
    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn lib_dir(&self) -> &Path {
        &self.lib_dir
    }

    /// Find the Mach-O binaries in the package.
    pub fn find_binaries(&self, dylibs_only: bool) -> Result<Vec<PathBuf>, DelocateError> {
        find_binaries(&self.root, dylibs_only)
    }

    /// Express a path inside the package relative to its root.
    pub fn relative<'a>(&self, path: &'a Path) -> &'a Path {
        path.strip_prefix(&self.root).unwrap_or(path)
    }
}

/// Find all Mach-O binaries in a directory, sorted by path.
///
/// With `dylibs_only`, only files with a `.so` or `.dylib` extension are considered; otherwise
/// every regular file is sniffed for a Mach-O header.
pub fn find_binaries(dir: &Path, dylibs_only: bool) -> Result<Vec<PathBuf>, DelocateError> {
    let mut binaries = Vec::new();

    for entry in WalkDir::new(dir).sort_by_file_name() {
        let entry = entry?;
        if !entry.file_type().is_file() {
            continue;
        }

        let path = entry.path();
        if dylibs_only {
            let ext = path.extension().and_then(|ext| ext.to_str());
            if !matches!(ext, Some("so" | "dylib")) {
                continue;
            }
        }

        if macho::is_macho_file(path)? {
            binaries.push(path.to_path_buf());
        }
    }

    Ok(binaries)
}

/// Find the directory of the top-level package named by a wheel, falling back to the wheel root.
pub(crate) fn find_package_dir(wheel_dir: &Path, name: &str) -> Result<PathBuf, DelocateError> {
    let name = name.replace('-', "_");
    let mut entries = fs::read_dir(wheel_dir)?.collect::<Result<Vec<_>, _>>()?;
    entries.sort_by_key(fs::DirEntry::file_name);

    for entry in entries {
        if !entry.file_type()?.is_dir() {
            continue;
        }

        let dir_name = entry.file_name();
        let dir_name = dir_name.to_string_lossy();

        // Skip `.dist-info` and `.data` directories.
        if dir_name.ends_with(".dist-info") || dir_name.ends_with(".data") {
            continue;
        }

        if dir_name.replace('-', "_").eq_ignore_ascii_case(&name) {
            return Ok(entry.path());
        }
    }

    Ok(wheel_dir.to_path_buf())
}

#[cfg(test)]
mod tests {
    use delocate_test::{CPU_TYPE_X86_64, MachOBuilder};

    use super::*;

    #[test]
    fn binaries() {
        let temp = tempfile::tempdir().unwrap();
        let root = temp.path();
        MachOBuilder::bundle(CPU_TYPE_X86_64).write(&root.join("pkg").join("ext.so"));
        MachOBuilder::dylib(CPU_TYPE_X86_64, "@rpath/libfoo.dylib")
            .write(&root.join("pkg").join("libfoo.dylib"));
        MachOBuilder::bundle(CPU_TYPE_X86_64).write(&root.join("pkg").join("helper"));
        fs::write(root.join("pkg").join("__init__.py"), "").unwrap();
        fs::write(root.join("pkg").join("fake.so"), "not a binary").unwrap();

        let package = Package::open(root, ".dylibs").unwrap();
        let found = package.find_binaries(false).unwrap();
        let names = found
            .iter()
            .map(|path| package.relative(path).to_string_lossy().into_owned())
            .collect::<Vec<_>>();
        assert_eq!(names, ["pkg/ext.so", "pkg/helper", "pkg/libfoo.dylib"]);

        let found = package.find_binaries(true).unwrap();
        assert_eq!(found.len(), 2);
        assert_eq!(package.lib_dir(), package.root().join(".dylibs"));
    }

    #[test]
    fn package_dir() {
        let temp = tempfile::tempdir().unwrap();
        let root = temp.path();
        fs::create_dir_all(root.join("foo_bar-1.0.dist-info")).unwrap();
        fs::create_dir_all(root.join("foo_bar-1.0.data")).unwrap();
        fs::create_dir_all(root.join("foo_bar")).unwrap();
        assert_eq!(
            find_package_dir(root, "foo-bar").unwrap(),
            root.join("foo_bar")
        );
        assert_eq!(find_package_dir(root, "other").unwrap(), root);
    }

    #[test]
    fn lib_dir_outside_root() {
        let temp = tempfile::tempdir().unwrap();
        let err = Package::with_lib_dir(temp.path(), Path::new("/elsewhere")).unwrap_err();
        assert!(matches!(err, DelocateError::PathNotInWheel { .. }));
    }
}
