//! Applying load command edits to a binary on disk.

use std::io::Write;
use std::path::Path;

use fs_err as fs;
use tracing::{debug, trace};

use crate::codesign::{AdhocSigner, CodeSigner};
use crate::error::{DelocateError, PatchError};
use crate::fat::{self, Container};
use crate::macho::{self, MachOFile};
use crate::writer::MachOWriter;

/// The edits to apply to every architecture slice of one binary.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct BinaryEdits {
    /// A new install name (`LC_ID_DYLIB`).
    pub install_id: Option<String>,
    /// Pairs of `(old, new)` dependency install names.
    pub changes: Vec<(String, String)>,
    pub add_rpaths: Vec<String>,
    pub delete_rpaths: Vec<String>,
}

impl BinaryEdits {
    pub fn is_empty(&self) -> bool {
        self.install_id.is_none()
            && self.changes.is_empty()
            && self.add_rpaths.is_empty()
            && self.delete_rpaths.is_empty()
    }

    /// Record a dependency change, replacing an earlier change of the same install name.
    pub fn change(&mut self, old: impl Into<String>, new: impl Into<String>) {
        let old = old.into();
        let new = new.into();
        if let Some(existing) = self.changes.iter_mut().find(|(from, _)| *from == old) {
            existing.1 = new;
        } else {
            self.changes.push((old, new));
        }
    }
}

/// Apply `edits` to the binary at `path`, re-signing any slice that was signed.
///
/// All slices are edited in memory and the result replaces the file atomically. Returns `false`
/// if the edits left the binary unchanged, in which case the file is not rewritten.
pub fn patch_binary(
    path: &Path,
    edits: &BinaryEdits,
    signer: &dyn CodeSigner,
) -> Result<bool, DelocateError> {
    let data = fs::read(path)?;
    let Some(output) = patch_bytes(path, &data, edits, signer)? else {
        return Ok(false);
    };
    write_atomic(path, &output)?;
    debug!("Patched {}", path.display());
    Ok(true)
}

/// Apply `edits` to the contents of the binary that will live at `path`.
///
/// The file name of `path` is the signing identifier. Returns `None` if the edits leave the
/// contents unchanged.
pub(crate) fn patch_bytes(
    path: &Path,
    data: &[u8],
    edits: &BinaryEdits,
    signer: &dyn CodeSigner,
) -> Result<Option<Vec<u8>>, DelocateError> {
    let wrap = |source: PatchError| DelocateError::Patch {
        path: path.to_path_buf(),
        source,
    };

    let container = Container::parse(data).map_err(|err| match err {
        PatchError::UnsupportedFormat => DelocateError::NotMachO {
            path: path.to_path_buf(),
        },
        err => wrap(err),
    })?;
    let identifier = path
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_default();

    let mut rewritten = Vec::with_capacity(container.slices().len());
    let mut found_id = false;
    let mut found_changes = vec![false; edits.changes.len()];
    let mut found_deletes = vec![false; edits.delete_rpaths.len()];
    for slice in container.slices() {
        let mut writer = MachOWriter::new(slice.data).map_err(wrap)?;
        if let Some(id) = &edits.install_id {
            if writer.install_id().is_some() {
                writer.set_install_id(id).map_err(wrap)?;
                found_id = true;
            }
        }
        for ((old, new), found) in edits.changes.iter().zip(&mut found_changes) {
            // A reference that already points at `new` counts as done.
            *found |= writer.change_dylib(old, new).map_err(wrap)? || writer.has_dependency(new);
        }
        for (rpath, found) in edits.delete_rpaths.iter().zip(&mut found_deletes) {
            *found |= writer.delete_rpath(rpath);
        }
        for rpath in &edits.add_rpaths {
            writer.add_rpath(rpath).map_err(wrap)?;
        }

        let mut bytes = writer.build().map_err(wrap)?;
        if bytes.as_slice() != slice.data && macho_has_signature(&bytes) {
            trace!("Re-signing {} slice of {}", slice.cputype, path.display());
            bytes = signer.sign(bytes, &identifier).map_err(wrap)?;
        }
        rewritten.push(bytes);
    }

    if edits.install_id.is_some() && !found_id {
        return Err(wrap(PatchError::MissingInstallId));
    }
    if let Some(((old, _), _)) = edits
        .changes
        .iter()
        .zip(&found_changes)
        .find(|(_, found)| !**found)
    {
        return Err(wrap(PatchError::DependencyNotFound(old.clone())));
    }
    if let Some((rpath, _)) = edits
        .delete_rpaths
        .iter()
        .zip(&found_deletes)
        .find(|(_, found)| !**found)
    {
        return Err(wrap(PatchError::RpathNotFound(rpath.clone())));
    }

    let output = match &container {
        Container::Thin(_) => rewritten.into_iter().next().unwrap_or_default(),
        Container::Fat(slices) => {
            let slices = slices
                .iter()
                .zip(&rewritten)
                .map(|(slice, bytes)| fat::Slice {
                    data: bytes.as_slice(),
                    ..*slice
                })
                .collect::<Vec<_>>();
            fat::assemble(&slices).map_err(wrap)?
        }
    };

    if output == data {
        trace!("No changes to {}", path.display());
        return Ok(None);
    }

    verify(&output, edits).map_err(wrap)?;
    Ok(Some(output))
}

fn macho_has_signature(slice: &[u8]) -> bool {
    macho::parse_macho_bytes(slice).is_ok_and(|macho| macho.has_code_signature)
}

/// Replace `path` with `contents` via a temporary file in the same directory.
pub(crate) fn write_atomic(path: &Path, contents: &[u8]) -> Result<(), DelocateError> {
    let parent = path
        .parent()
        .filter(|parent| !parent.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."));
    let permissions = fs::metadata(path)?.permissions();
    let mut temp = tempfile::NamedTempFile::new_in(parent)?;
    temp.write_all(contents)?;
    temp.as_file().set_permissions(permissions)?;
    temp.persist(path).map_err(|err| DelocateError::Io(err.error))?;
    Ok(())
}

/// Re-parse a patched binary and check that every edit is in place.
fn verify(data: &[u8], edits: &BinaryEdits) -> Result<(), PatchError> {
    let macho: MachOFile = macho::parse_macho_bytes(data)
        .map_err(|err| PatchError::Verification(err.to_string()))?;

    if let Some(id) = &edits.install_id {
        if macho.install_id.as_deref() != Some(id.as_str()) {
            return Err(PatchError::Verification(format!(
                "install name is `{}`, expected `{id}`",
                macho.install_id.as_deref().unwrap_or_default()
            )));
        }
    }
    for (old, new) in &edits.changes {
        if old != new && macho.dependencies.contains(old) {
            return Err(PatchError::Verification(format!(
                "`{old}` is still referenced"
            )));
        }
        if !macho.dependencies.contains(new) {
            return Err(PatchError::Verification(format!("`{new}` is not referenced")));
        }
    }
    for rpath in &edits.add_rpaths {
        if !macho.rpaths.contains(rpath) {
            return Err(PatchError::Verification(format!("rpath `{rpath}` is missing")));
        }
    }
    for rpath in &edits.delete_rpaths {
        if !edits.add_rpaths.contains(rpath) && macho.rpaths.contains(rpath) {
            return Err(PatchError::Verification(format!(
                "rpath `{rpath}` is still present"
            )));
        }
    }
    Ok(())
}

/// Change a dependency install name in a Mach-O binary file.
pub fn change_install_name(
    path: &Path,
    old_name: &str,
    new_name: &str,
) -> Result<(), DelocateError> {
    let edits = BinaryEdits {
        changes: vec![(old_name.to_string(), new_name.to_string())],
        ..BinaryEdits::default()
    };
    patch_binary(path, &edits, &AdhocSigner)?;
    Ok(())
}

/// Change the install name (`LC_ID_DYLIB`) of a Mach-O library.
pub fn change_install_id(path: &Path, new_id: &str) -> Result<(), DelocateError> {
    let edits = BinaryEdits {
        install_id: Some(new_id.to_string()),
        ..BinaryEdits::default()
    };
    patch_binary(path, &edits, &AdhocSigner)?;
    Ok(())
}

/// Add a runtime search path to a Mach-O binary.
pub fn add_rpath(path: &Path, rpath: &str) -> Result<(), DelocateError> {
    let edits = BinaryEdits {
        add_rpaths: vec![rpath.to_string()],
        ..BinaryEdits::default()
    };
    patch_binary(path, &edits, &AdhocSigner)?;
    Ok(())
}

/// Delete a runtime search path from a Mach-O binary.
pub fn delete_rpath(path: &Path, rpath: &str) -> Result<(), DelocateError> {
    let edits = BinaryEdits {
        delete_rpaths: vec![rpath.to_string()],
        ..BinaryEdits::default()
    };
    patch_binary(path, &edits, &AdhocSigner)?;
    Ok(())
}
