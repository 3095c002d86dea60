//! Copying internalized libraries into the package.

use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};

use filetime::FileTime;
use fs_err as fs;
use sha2::{Digest, Sha256};
use tracing::{debug, trace};

use crate::codesign::AdhocSigner;
use crate::error::DelocateError;
use crate::macho;
use crate::patch::{self, BinaryEdits};
use crate::resolve::{DependencyClass, DependencyGraph};

/// A library to copy into the package, and the binaries that must be repointed at the copy.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CopyEntry {
    /// The real path of the library.
    pub source: PathBuf,
    /// The path of the copy inside the library directory.
    pub destination: PathBuf,
    /// `(consumer, install name)` pairs, in the order they were discovered.
    pub consumers: Vec<(PathBuf, String)>,
}

impl CopyEntry {
    /// The file name of the copy.
    pub fn name(&self) -> String {
        self.destination
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_default()
    }
}

/// The set of copies to make, keyed by real source path.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CopyPlan {
    pub lib_dir: PathBuf,
    pub entries: BTreeMap<PathBuf, CopyEntry>,
}

impl CopyPlan {
    /// Plan a copy of every library the graph marks for internalizing.
    ///
    /// Libraries are named after their source file. When a name is already taken, either by an
    /// earlier library or by an unrelated file in `lib_dir`, the copy gets a suffix derived from
    /// its source path, e.g., `libz-1a2b3c4d.1.dylib`.
    pub fn new(graph: &DependencyGraph, lib_dir: &Path) -> Result<Self, DelocateError> {
        let mut entries: BTreeMap<PathBuf, CopyEntry> = graph
            .internalized()
            .into_iter()
            .map(|source| {
                (
                    source.to_path_buf(),
                    CopyEntry {
                        source: source.to_path_buf(),
                        destination: PathBuf::new(),
                        consumers: Vec::new(),
                    },
                )
            })
            .collect();

        for edge in &graph.edges {
            if edge.class != DependencyClass::Internalize {
                continue;
            }
            let Some(entry) = edge
                .target
                .as_ref()
                .and_then(|target| entries.get_mut(target))
            else {
                continue;
            };
            let consumer = (edge.consumer.clone(), edge.install_name.clone());
            if !entry.consumers.contains(&consumer) {
                entry.consumers.push(consumer);
            }
        }

        let mut taken = BTreeSet::new();
        for entry in entries.values_mut() {
            let Some(file_name) = entry.source.file_name() else {
                return Err(DelocateError::Io(std::io::Error::new(
                    std::io::ErrorKind::InvalidInput,
                    format!("Library path has no file name: {}", entry.source.display()),
                )));
            };
            let file_name = file_name.to_string_lossy().into_owned();

            let mut destination = lib_dir.join(&file_name);
            if taken.contains(&file_name) || is_unrelated(&entry.source, &destination)? {
                let renamed = disambiguate(&file_name, &entry.source);
                debug!(
                    "Library name `{file_name}` is taken; copying {} as `{renamed}`",
                    entry.source.display()
                );
                destination = lib_dir.join(&renamed);
                taken.insert(renamed);
            } else {
                taken.insert(file_name);
            }
            entry.destination = destination;
        }

        Ok(Self {
            lib_dir: lib_dir.to_path_buf(),
            entries,
        })
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = &CopyEntry> {
        self.entries.values()
    }

    /// The planned copy of a library, by real source path.
    pub fn destination(&self, source: &Path) -> Option<&Path> {
        self.entries
            .get(source)
            .map(|entry| entry.destination.as_path())
    }

    /// The real source path of a planned copy, by destination.
    pub fn source(&self, destination: &Path) -> Option<&Path> {
        self.entries
            .values()
            .find(|entry| entry.destination == destination)
            .map(|entry| entry.source.as_path())
    }

    /// Make the copies, returning the destinations that were written.
    ///
    /// A destination that already matches its source in size and modification time is skipped.
    pub fn apply(&self) -> Result<Vec<PathBuf>, DelocateError> {
        if self.entries.is_empty() {
            return Ok(Vec::new());
        }
        fs::create_dir_all(&self.lib_dir)?;

        let mut copied = Vec::new();
        for entry in self.entries.values() {
            if is_up_to_date(&entry.source, &entry.destination)? {
                trace!("Already copied: {}", entry.destination.display());
                continue;
            }
            trace!(
                "Copying {} to {}",
                entry.source.display(),
                entry.destination.display()
            );
            fs::copy(&entry.source, &entry.destination)?;

            // Libraries installed read-only must still be patched.
            #[cfg(unix)]
            {
                use std::os::unix::fs::PermissionsExt;

                let permissions = fs::metadata(&entry.destination)?.permissions();
                if permissions.mode() & 0o200 == 0 {
                    fs::set_permissions(
                        &entry.destination,
                        std::fs::Permissions::from_mode(permissions.mode() | 0o200),
                    )?;
                }
            }

            let modified = FileTime::from_last_modification_time(&fs::metadata(&entry.source)?);
            filetime::set_file_mtime(&entry.destination, modified)?;
            copied.push(entry.destination.clone());
        }
        Ok(copied)
    }
}

/// Insert a short hash of the source path before the first `.` of the file name.
fn disambiguate(file_name: &str, source: &Path) -> String {
    let digest = Sha256::digest(source.as_os_str().as_encoded_bytes());
    let suffix = format!(
        "{:08x}",
        u32::from_be_bytes([digest[0], digest[1], digest[2], digest[3]])
    );
    match file_name.split_once('.') {
        Some((stem, rest)) => format!("{stem}-{suffix}.{rest}"),
        None => format!("{file_name}-{suffix}"),
    }
}

/// Whether `destination` exists and is not a previous copy of `source`.
fn is_unrelated(source: &Path, destination: &Path) -> Result<bool, DelocateError> {
    if !destination.exists() || is_up_to_date(source, destination)? {
        return Ok(false);
    }
    Ok(!is_patched_copy(source, destination))
}

/// Whether `destination` is a copy of `source` that an earlier run already patched.
///
/// The edits that separate the two are replayed on `source`, which must reproduce `destination`
/// exactly.
fn is_patched_copy(source: &Path, destination: &Path) -> bool {
    let (Ok(original), Ok(copy)) = (fs::read(source), fs::read(destination)) else {
        return false;
    };
    let (Ok(before), Ok(after)) = (
        macho::parse_macho_bytes(&original),
        macho::parse_macho_bytes(&copy),
    ) else {
        return false;
    };
    if before.archs != after.archs || before.dependencies.len() != after.dependencies.len() {
        return false;
    }

    let edits = BinaryEdits {
        install_id: after.install_id.filter(|_| before.install_id.is_some()),
        changes: before
            .dependencies
            .iter()
            .zip(&after.dependencies)
            .filter(|(old, new)| old != new)
            .map(|(old, new)| (old.clone(), new.clone()))
            .collect(),
        add_rpaths: Vec::new(),
        delete_rpaths: before
            .rpaths
            .iter()
            .filter(|rpath| !after.rpaths.contains(rpath))
            .cloned()
            .collect(),
    };
    match patch::patch_bytes(destination, &original, &edits, &AdhocSigner) {
        Ok(Some(output)) => output == copy,
        _ => false,
    }
}

fn is_up_to_date(source: &Path, destination: &Path) -> Result<bool, DelocateError> {
    let Ok(existing) = fs::metadata(destination) else {
        return Ok(false);
    };
    let source = fs::metadata(source)?;
    Ok(existing.len() == source.len()
        && FileTime::from_last_modification_time(&existing)
            == FileTime::from_last_modification_time(&source))
}

#[cfg(test)]
mod tests {
    use delocate_test::{CPU_TYPE_X86_64, MachOBuilder};

    use crate::resolve::{ExclusionPolicy, resolve};

    use super::*;

    #[test]
    fn disambiguate_names() {
        let source = Path::new("/opt/a/libz.1.dylib");
        let renamed = disambiguate("libz.1.dylib", source);
        assert!(renamed.starts_with("libz-"));
        assert!(renamed.ends_with(".1.dylib"));
        assert_eq!(renamed.len(), "libz-12345678.1.dylib".len());
        // Deterministic for the same source, distinct for another.
        assert_eq!(renamed, disambiguate("libz.1.dylib", source));
        assert_ne!(
            renamed,
            disambiguate("libz.1.dylib", Path::new("/opt/b/libz.1.dylib"))
        );
        assert!(disambiguate("libz", source).starts_with("libz-"));
    }

    #[test]
    fn plan_collisions_and_apply() {
        let temp = tempfile::tempdir().unwrap();
        let root = temp.path().canonicalize().unwrap();
        let package = root.join("package");
        let first = root.join("a").join("libz.dylib");
        let second = root.join("b").join("libz.dylib");

        MachOBuilder::dylib(CPU_TYPE_X86_64, &first.to_string_lossy())
            .tag("a")
            .write(&first);
        MachOBuilder::dylib(CPU_TYPE_X86_64, &second.to_string_lossy())
            .tag("b")
            .write(&second);
        let one = MachOBuilder::bundle(CPU_TYPE_X86_64)
            .dependency(&first.to_string_lossy())
            .write(&package.join("one.so"));
        let two = MachOBuilder::bundle(CPU_TYPE_X86_64)
            .dependency(&second.to_string_lossy())
            .write(&package.join("two.so"));

        let graph = resolve(&[one.clone(), two.clone()], &package, &ExclusionPolicy::default())
            .unwrap();
        let lib_dir = package.join(".dylibs");
        let plan = CopyPlan::new(&graph, &lib_dir).unwrap();
        assert_eq!(plan.len(), 2);

        // Sorted by source path: the first keeps its name.
        assert_eq!(plan.destination(&first), Some(lib_dir.join("libz.dylib").as_path()));
        let renamed = plan.destination(&second).unwrap();
        assert_ne!(renamed, lib_dir.join("libz.dylib"));
        assert_eq!(renamed.parent(), Some(lib_dir.as_path()));
        assert_eq!(
            plan.entries[&second].consumers,
            vec![(two, second.to_string_lossy().into_owned())]
        );

        let copied = plan.apply().unwrap();
        assert_eq!(copied.len(), 2);
        assert_eq!(fs::read(&first).unwrap(), fs::read(lib_dir.join("libz.dylib")).unwrap());

        // Copies that are already in place are not made again, and are not collisions.
        assert!(plan.apply().unwrap().is_empty());
        assert_eq!(CopyPlan::new(&graph, &lib_dir).unwrap(), plan);
    }

    #[test]
    fn existing_file_is_a_collision() {
        let temp = tempfile::tempdir().unwrap();
        let root = temp.path().canonicalize().unwrap();
        let package = root.join("package");
        let external = root.join("lib").join("libfoo.dylib");
        MachOBuilder::dylib(CPU_TYPE_X86_64, &external.to_string_lossy()).write(&external);
        let ext = MachOBuilder::bundle(CPU_TYPE_X86_64)
            .dependency(&external.to_string_lossy())
            .write(&package.join("ext.so"));
        let lib_dir = package.join(".dylibs");
        fs::create_dir_all(&lib_dir).unwrap();
        fs::write(lib_dir.join("libfoo.dylib"), "unrelated").unwrap();

        let graph = resolve(&[ext], &package, &ExclusionPolicy::default()).unwrap();
        let plan = CopyPlan::new(&graph, &lib_dir).unwrap();
        let entry = plan.iter().next().unwrap();
        assert_ne!(entry.name(), "libfoo.dylib");
        assert!(entry.name().starts_with("libfoo-"));
    }

    #[test]
    #[cfg(unix)]
    fn read_only_source() {
        use std::os::unix::fs::PermissionsExt;

        let temp = tempfile::tempdir().unwrap();
        let root = temp.path().canonicalize().unwrap();
        let package = root.join("package");
        let external = root.join("lib").join("libfoo.dylib");
        MachOBuilder::dylib(CPU_TYPE_X86_64, &external.to_string_lossy()).write(&external);
        fs::set_permissions(&external, std::fs::Permissions::from_mode(0o444)).unwrap();
        let ext = MachOBuilder::bundle(CPU_TYPE_X86_64)
            .dependency(&external.to_string_lossy())
            .write(&package.join("ext.so"));

        let graph = resolve(&[ext], &package, &ExclusionPolicy::default()).unwrap();
        let plan = CopyPlan::new(&graph, &package.join(".dylibs")).unwrap();
        let copied = plan.apply().unwrap();
        let mode = fs::metadata(&copied[0]).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o644);
        let source_mtime = FileTime::from_last_modification_time(&fs::metadata(&external).unwrap());
        let copy_mtime = FileTime::from_last_modification_time(&fs::metadata(&copied[0]).unwrap());
        assert_eq!(source_mtime, copy_mtime);
    }
}
