//! Fusing packages built for different architectures.

use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};

use fs_err as fs;
use tracing::{debug, trace};
use walkdir::WalkDir;

use delocate_platform::Arch;

use crate::error::{DelocateError, PatchError};
use crate::fat::{self, Container, Slice};
use crate::macho;

/// What happened to a file while fusing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FuseAction {
    /// Present in one input only, or identical in both.
    Copied,
    /// A Mach-O binary whose slices were merged.
    Merged,
}

/// Fuse the trees `to` and `from` into `out`.
///
/// Files present in one tree are copied. Files present in both must be identical, or Mach-O
/// binaries whose architecture slices are either distinct or identical; the slices of such
/// binaries are merged into a fat binary. Anything else is a [`DelocateError::FuseConflict`].
///
/// Returns the relative path of every file written, with what was done to it.
pub fn fuse_trees(
    to: &Path,
    from: &Path,
    out: &Path,
) -> Result<BTreeMap<PathBuf, FuseAction>, DelocateError> {
    let to_files = relative_files(to)?;
    let from_files = relative_files(from)?;

    let mut actions = BTreeMap::new();
    for relative in to_files.union(&from_files) {
        let destination = out.join(relative);
        if let Some(parent) = destination.parent() {
            fs::create_dir_all(parent)?;
        }

        let action = match (to_files.contains(relative), from_files.contains(relative)) {
            (true, false) => {
                fs::copy(to.join(relative), &destination)?;
                FuseAction::Copied
            }
            (false, _) => {
                fs::copy(from.join(relative), &destination)?;
                FuseAction::Copied
            }
            (true, true) => fuse_file(
                &to.join(relative),
                &from.join(relative),
                relative,
                &destination,
            )?,
        };
        trace!("{}: {action:?}", relative.display());
        actions.insert(relative.clone(), action);
    }

    debug!(
        "Fused {} files ({} binaries merged)",
        actions.len(),
        actions
            .values()
            .filter(|action| **action == FuseAction::Merged)
            .count()
    );
    Ok(actions)
}

fn fuse_file(
    to: &Path,
    from: &Path,
    relative: &Path,
    destination: &Path,
) -> Result<FuseAction, DelocateError> {
    let to_data = fs::read(to)?;
    let from_data = fs::read(from)?;
    if to_data == from_data {
        fs::copy(to, destination)?;
        return Ok(FuseAction::Copied);
    }

    if !macho::is_macho_bytes(&to_data) || !macho::is_macho_bytes(&from_data) {
        return Err(DelocateError::FuseConflict {
            path: relative.to_path_buf(),
            arch: None,
        });
    }

    let fused = fuse_binaries(relative, &to_data, &from_data)?;
    fs::write(destination, fused)?;
    fs::set_permissions(destination, fs::metadata(to)?.permissions())?;
    Ok(FuseAction::Merged)
}

/// Merge the architecture slices of two Mach-O binaries.
///
/// Slices are ordered by CPU type and subtype, so the result does not depend on the order of
/// the inputs. A single resulting slice is written as a thin binary.
pub fn fuse_binaries(path: &Path, to: &[u8], from: &[u8]) -> Result<Vec<u8>, DelocateError> {
    let wrap = |source: PatchError| DelocateError::Patch {
        path: path.to_path_buf(),
        source,
    };
    let to = Container::parse(to).map_err(wrap)?;
    let from = Container::parse(from).map_err(wrap)?;

    let mut slices: BTreeMap<(u32, u32), Slice<'_>> = BTreeMap::new();
    for slice in to.slices().iter().chain(from.slices()) {
        let key = (slice.cputype, slice.cpusubtype);
        match slices.get(&key) {
            Some(existing) if existing.data != slice.data => {
                return Err(DelocateError::FuseConflict {
                    path: path.to_path_buf(),
                    arch: Some(Arch::from_cputype(slice.cputype)),
                });
            }
            Some(_) => {}
            None => {
                slices.insert(key, *slice);
            }
        }
    }

    let slices = slices.into_values().collect::<Vec<_>>();
    match slices.as_slice() {
        [slice] => Ok(slice.data.to_vec()),
        slices => fat::assemble(slices).map_err(wrap),
    }
}

/// The relative paths of all files in a tree.
fn relative_files(root: &Path) -> Result<BTreeSet<PathBuf>, DelocateError> {
    let mut files = BTreeSet::new();
    for entry in WalkDir::new(root) {
        let entry = entry?;
        if !entry.file_type().is_file() {
            continue;
        }
        let relative = entry
            .path()
            .strip_prefix(root)
            .map_err(|_| DelocateError::PathNotInWheel {
                path: entry.path().to_path_buf(),
                wheel_dir: root.to_path_buf(),
            })?;
        files.insert(relative.to_path_buf());
    }
    Ok(files)
}
