//! Delocate operations for macOS packages and wheels.

use std::collections::{BTreeMap, BTreeSet};
use std::env;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use fs_err as fs;
use tracing::{debug, trace, warn};

use delocate_filename::WheelFilename;
use delocate_platform::{Arch, MacOSVersion, PlatformTag};
use delocate_static::EnvVars;

use crate::codesign::SignerKind;
use crate::copy::CopyPlan;
use crate::error::{DelocateError, PatchError};
use crate::macho;
use crate::package::{self, Package};
use crate::patch::{self, BinaryEdits};
use crate::resolve::{self, DependencyClass, DependencyGraph, ExclusionPolicy, ExclusionRule};
use crate::wheel;

/// Options for delocating a wheel.
#[derive(Debug, Clone)]
pub struct DelocateOptions {
    /// Subdirectory within the package to store copied libraries.
    /// Defaults to ".dylibs".
    pub lib_sdir: String,
    /// Required architectures to validate.
    pub require_archs: Vec<Arch>,
    /// Check that every library provides the architectures of the binaries that load it.
    pub check_archs: bool,
    /// Libraries to exclude from delocating (by name pattern).
    pub exclude: Vec<String>,
    /// Path prefixes to exclude from delocating, in addition to the system directories.
    pub exclude_prefixes: Vec<PathBuf>,
    /// Only inspect files with a `.so` or `.dylib` extension.
    pub dylibs_only: bool,
    /// Remove rpaths that do not start with `@` from binaries.
    /// This prevents issues when wheels are installed in different locations.
    pub sanitize_rpaths: bool,
    /// Check that bundled libraries don't require a newer macOS version than
    /// `target_macos_version`.
    pub check_version_compatibility: bool,
    /// Target macOS version. If set, bundled libraries may not require a newer version.
    /// This can also be set via the `MACOSX_DEPLOYMENT_TARGET` environment variable.
    pub target_macos_version: Option<MacOSVersion>,
    /// How modified binaries are re-signed.
    pub signer: SignerKind,
}

impl Default for DelocateOptions {
    fn default() -> Self {
        let target_macos_version = env::var(EnvVars::MACOSX_DEPLOYMENT_TARGET)
            .ok()
            .and_then(|value| MacOSVersion::parse(&value));

        Self {
            lib_sdir: ".dylibs".to_string(),
            require_archs: Vec::new(),
            check_archs: false,
            exclude: Vec::new(),
            exclude_prefixes: Vec::new(),
            dylibs_only: false,
            sanitize_rpaths: true,
            check_version_compatibility: true,
            target_macos_version,
            signer: SignerKind::default(),
        }
    }
}

impl DelocateOptions {
    /// The exclusion rules: the system directories, then the user's prefixes and patterns.
    pub fn exclusion_policy(&self) -> ExclusionPolicy {
        let mut policy = ExclusionPolicy::system();
        for prefix in &self.exclude_prefixes {
            policy.push(ExclusionRule::Prefix(prefix.clone()));
        }
        for pattern in &self.exclude {
            policy.push(ExclusionRule::Pattern(pattern.clone()));
        }
        policy
    }
}

/// The outcome of delocating a package.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DelocateReport {
    /// The libraries that were internalized, by real source path, with the path of their copy.
    pub copied: BTreeMap<PathBuf, PathBuf>,
    /// The binaries that were rewritten.
    pub patched: Vec<PathBuf>,
    /// The newest minimum macOS version required by any binary in the package or its copies.
    pub max_macos_version: Option<MacOSVersion>,
}

impl DelocateReport {
    /// Returns `true` if the package was modified.
    pub fn is_modified(&self) -> bool {
        !self.copied.is_empty() || !self.patched.is_empty()
    }
}

/// Delocate a directory tree in place, copying libraries to `<root>/<lib_sdir>`.
pub fn delocate_tree(
    root: &Path,
    options: &DelocateOptions,
) -> Result<DelocateReport, DelocateError> {
    debug!("Delocating tree: {}", root.display());
    let package = Package::open(root, &options.lib_sdir)?;
    delocate_package(&package, options)
}

/// Copy the external libraries of a package into it and repoint its binaries at the copies.
pub fn delocate_package(
    package: &Package,
    options: &DelocateOptions,
) -> Result<DelocateReport, DelocateError> {
    let binaries = package.find_binaries(options.dylibs_only)?;
    if binaries.is_empty() {
        debug!("No binaries found in {}", package.root().display());
        return Ok(DelocateReport::default());
    }
    trace!("Found {} binaries", binaries.len());

    let graph = resolve::resolve(&binaries, package.root(), &options.exclusion_policy())?;

    check_required_archs(&graph, &options.require_archs)?;
    if options.check_archs {
        check_dependency_archs(&graph, package)?;
    }

    let plan = CopyPlan::new(&graph, package.lib_dir())?;
    if options.check_version_compatibility {
        if let Some(target) = options.target_macos_version {
            check_macos_versions(&graph, &plan, target)?;
        }
    }
    let max_macos_version = graph
        .nodes
        .values()
        .filter_map(|node| node.min_macos_version)
        .max();

    if plan.is_empty() {
        debug!("No external dependencies found");
    } else {
        debug!("Found {} external libraries to bundle", plan.len());
    }

    // Every edit is made in memory before the package is touched, so a binary that cannot be
    // patched leaves the package as it was.
    let edits = plan_edits(&graph, &plan, package, options);
    let signer = options.signer.signer();
    let mut outputs = Vec::new();
    for (path, edits) in &edits {
        if edits.is_empty() {
            continue;
        }
        trace!("Patching {}", path.display());
        // A copy is patched from its source, since it has not been made yet.
        let source = plan.source(path).unwrap_or(path);
        let data = fs::read(source)?;
        if let Some(output) = patch::patch_bytes(path, &data, edits, signer.as_ref())? {
            outputs.push((path.clone(), output));
        }
    }

    plan.apply()?;
    let mut patched = Vec::with_capacity(outputs.len());
    for (path, output) in outputs {
        patch::write_atomic(&path, &output)?;
        debug!("Patched {}", package.relative(&path).display());
        patched.push(path);
    }

    verify_references(&plan, package)?;

    Ok(DelocateReport {
        copied: plan
            .iter()
            .map(|entry| (entry.source.clone(), entry.destination.clone()))
            .collect(),
        patched,
        max_macos_version,
    })
}

/// The path of a binary inside the package: itself, or the copy of an internalized library.
fn package_path(path: &Path, plan: &CopyPlan) -> PathBuf {
    plan.destination(path)
        .map_or_else(|| path.to_path_buf(), Path::to_path_buf)
}

/// The install name that resolves to `library` when loaded from `consumer`.
fn loader_path(consumer: &Path, library: &Path) -> String {
    let name = library
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_default();
    let relative = match (library.parent(), consumer.parent()) {
        (Some(lib_dir), Some(consumer_dir)) => pathdiff::diff_paths(lib_dir, consumer_dir),
        _ => None,
    };
    match relative {
        Some(relative) if !relative.as_os_str().is_empty() => {
            format!("@loader_path/{}/{name}", relative.to_string_lossy())
        }
        _ => format!("@loader_path/{name}"),
    }
}

/// Gather the edits for every file, so that each is patched once.
fn plan_edits(
    graph: &DependencyGraph,
    plan: &CopyPlan,
    package: &Package,
    options: &DelocateOptions,
) -> BTreeMap<PathBuf, BinaryEdits> {
    let mut edits: BTreeMap<PathBuf, BinaryEdits> = BTreeMap::new();

    for entry in plan.iter() {
        let has_id = graph
            .nodes
            .get(&entry.source)
            .is_some_and(|node| node.install_id.is_some());
        if has_id {
            edits.entry(entry.destination.clone()).or_default().install_id =
                Some(format!("@loader_path/{}/{}", options.lib_sdir, entry.name()));
        }

        for (consumer, install_name) in &entry.consumers {
            let consumer = package_path(consumer, plan);
            let new_name = loader_path(&consumer, &entry.destination);
            trace!(
                "{}: `{install_name}` -> `{new_name}`",
                package.relative(&consumer).display()
            );
            edits
                .entry(consumer)
                .or_default()
                .change(install_name.clone(), new_name);
        }
    }

    // References to libraries already in the package by absolute or bare path break when the
    // package moves.
    for edge in &graph.edges {
        if edge.class != DependencyClass::Internal || edge.install_name.starts_with('@') {
            continue;
        }
        let Some(target) = &edge.target else {
            continue;
        };
        let consumer = package_path(&edge.consumer, plan);
        let new_name = loader_path(&consumer, target);
        trace!(
            "{}: `{}` -> `{new_name}`",
            package.relative(&consumer).display(),
            edge.install_name
        );
        edits
            .entry(consumer)
            .or_default()
            .change(edge.install_name.clone(), new_name);
    }

    if options.sanitize_rpaths {
        for node in graph.nodes.values() {
            let path = package_path(&node.path, plan);
            if !path.starts_with(package.root()) {
                continue;
            }
            for rpath in &node.rpaths {
                if rpath.starts_with('@') {
                    continue;
                }
                debug!(
                    "Removing rpath `{rpath}` from {}",
                    package.relative(&path).display()
                );
                let delete_rpaths = &mut edits.entry(path.clone()).or_default().delete_rpaths;
                if !delete_rpaths.contains(rpath) {
                    delete_rpaths.push(rpath.clone());
                }
            }
        }
    }

    edits
}

/// Check that every rewritten reference resolves to the intended copy.
fn verify_references(plan: &CopyPlan, package: &Package) -> Result<(), DelocateError> {
    for entry in plan.iter() {
        let expected = entry.destination.canonicalize()?;
        let consumers = entry
            .consumers
            .iter()
            .map(|(consumer, _)| package_path(consumer, plan))
            .collect::<BTreeSet<_>>();
        for consumer in consumers {
            let macho = macho::parse_macho(&consumer)?;
            let resolves = macho.dependencies.iter().any(|name| {
                resolve::resolve_dynamic_path(name, &consumer, &macho.rpaths).as_ref()
                    == Some(&expected)
            });
            if !resolves {
                return Err(DelocateError::Patch {
                    path: consumer.clone(),
                    source: PatchError::Verification(format!(
                        "no reference resolves to `{}`",
                        package.relative(&expected).display()
                    )),
                });
            }
        }
    }
    Ok(())
}

/// Check that every binary and library provides the required architectures.
fn check_required_archs(graph: &DependencyGraph, required: &[Arch]) -> Result<(), DelocateError> {
    for node in graph.nodes.values() {
        if let Some(arch) = required.iter().find(|arch| !node.archs.contains(arch)) {
            return Err(DelocateError::MissingArchitecture {
                arch: *arch,
                path: node.path.clone(),
            });
        }
    }
    Ok(())
}

/// Check that every library provides the architectures of each binary that loads it.
fn check_dependency_archs(graph: &DependencyGraph, package: &Package) -> Result<(), DelocateError> {
    let mut problems = Vec::new();
    for edge in &graph.edges {
        if edge.class == DependencyClass::Excluded {
            continue;
        }
        let (Some(consumer), Some(library)) = (
            graph.nodes.get(&edge.consumer),
            edge.target.as_ref().and_then(|target| graph.nodes.get(target)),
        ) else {
            continue;
        };
        for arch in consumer.archs.difference(&library.archs) {
            problems.push(format!(
                "{} needs arch {arch} missing from {}",
                package.relative(&consumer.path).display(),
                package.relative(&library.path).display()
            ));
        }
    }
    if problems.is_empty() {
        Ok(())
    } else {
        Err(DelocateError::ArchitectureMismatch(problems))
    }
}

/// Check that no internalized library requires a newer macOS than the target.
fn check_macos_versions(
    graph: &DependencyGraph,
    plan: &CopyPlan,
    target: MacOSVersion,
) -> Result<(), DelocateError> {
    for entry in plan.iter() {
        let Some(node) = graph.nodes.get(&entry.source) else {
            continue;
        };
        if let Some(version) = node.min_macos_version {
            if version > target {
                return Err(DelocateError::IncompatibleMacOSVersion {
                    library: entry.source.clone(),
                    library_version: version.to_string(),
                    wheel_version: target.to_string(),
                });
            }
        }
    }
    Ok(())
}

/// Update platform tags to reflect a newer minimum macOS version.
///
/// For example, `macosx_10_9_x86_64` with version 11.0 becomes `macosx_11_0_x86_64`.
/// Non-macOS tags, and macOS tags that are already new enough, are preserved unchanged.
pub fn update_platform_tags(
    platform_tags: &[PlatformTag],
    version: MacOSVersion,
) -> Vec<PlatformTag> {
    let mut updated = Vec::with_capacity(platform_tags.len());
    for tag in platform_tags {
        let tag = match tag.macos_version() {
            Some(current) if current < version.tag_version() => tag.with_macos_version(version),
            _ => tag.clone(),
        };
        if !updated.contains(&tag) {
            updated.push(tag);
        }
    }
    updated
}

/// The result of delocating a wheel.
#[derive(Debug, Clone)]
pub struct DelocatedWheel {
    /// The written wheel.
    pub path: PathBuf,
    pub report: DelocateReport,
}

/// Parse the filename of a wheel path.
pub(crate) fn parse_wheel_path(wheel_path: &Path) -> Result<WheelFilename, DelocateError> {
    let filename_str = wheel_path
        .file_name()
        .and_then(|name| name.to_str())
        .ok_or_else(|| DelocateError::InvalidWheelPath {
            path: wheel_path.to_path_buf(),
        })?;
    WheelFilename::from_str(filename_str).map_err(|err| DelocateError::InvalidWheelFilename {
        filename: filename_str.to_string(),
        err,
    })
}

/// Delocate a wheel: copy external libraries and update install names.
///
/// The wheel is written to `dest_dir`. If the binaries require a newer macOS than the wheel's
/// platform tag, the tag is raised. When `dest_dir` is the wheel's own directory and the name
/// changed, the input wheel is removed.
pub fn delocate_wheel(
    wheel_path: &Path,
    dest_dir: &Path,
    options: &DelocateOptions,
) -> Result<DelocatedWheel, DelocateError> {
    debug!("Delocating wheel: {}", wheel_path.display());

    let filename = parse_wheel_path(wheel_path)?;
    let temp_dir = tempfile::tempdir()?;
    let wheel_dir = temp_dir.path().canonicalize()?;
    let wheel_dir = wheel_dir.as_path();
    wheel::unpack_wheel(wheel_path, wheel_dir)?;

    let package_dir = package::find_package_dir(wheel_dir, &filename.name)?;
    let package = Package::with_lib_dir(wheel_dir, &package_dir.join(&options.lib_sdir))?;
    let report = delocate_package(&package, options)?;

    // Raise the platform tag if the binaries require a newer macOS.
    let platform_tags = match (filename.macos_version(), report.max_macos_version) {
        (Some(wheel_version), Some(required)) if required.tag_version() > wheel_version => {
            warn!(
                "Binaries in {filename} require macOS {required}; updating the platform tag"
            );
            update_platform_tags(filename.platform_tags(), required)
        }
        _ => filename.platform_tags().to_vec(),
    };
    let output_filename = filename.with_platform_tags(&platform_tags);
    let output_path = dest_dir.join(output_filename.to_string());
    fs::create_dir_all(dest_dir)?;

    if !report.is_modified() && output_filename == filename {
        debug!("Wheel is unchanged");
        if !is_same_file(wheel_path, &output_path) {
            fs::copy(wheel_path, &output_path)?;
        }
        return Ok(DelocatedWheel {
            path: output_path,
            report,
        });
    }

    let dist_info = wheel::find_dist_info(wheel_dir)?;
    if output_filename != filename {
        wheel::write_wheel_tags(wheel_dir, &dist_info, &output_filename.expanded_tags(), true)?;
    }
    wheel::update_record(wheel_dir, &dist_info)?;
    wheel::pack_wheel(wheel_dir, &output_path)?;

    // A renamed wheel replaces the original.
    if output_path.file_name() != wheel_path.file_name()
        && is_same_dir(wheel_path, &output_path)
    {
        debug!("Removing {}", wheel_path.display());
        fs::remove_file(wheel_path)?;
    }

    Ok(DelocatedWheel {
        path: output_path,
        report,
    })
}

fn is_same_file(a: &Path, b: &Path) -> bool {
    match (a.canonicalize(), b.canonicalize()) {
        (Ok(a), Ok(b)) => a == b,
        _ => false,
    }
}

fn is_same_dir(a: &Path, b: &Path) -> bool {
    let parent = |path: &Path| {
        path.parent()
            .filter(|parent| !parent.as_os_str().is_empty())
            .unwrap_or(Path::new("."))
            .canonicalize()
            .ok()
    };
    matches!((parent(a), parent(b)), (Some(a), Some(b)) if a == b)
}

/// List the libraries the binaries of a wheel or directory depend on.
///
/// Returns each library with the binaries that load it. Libraries inside the tree are named
/// relative to its root, as are the consumers. With `all`, excluded (system) libraries are
/// included.
pub fn list_dependencies(
    path: &Path,
    all: bool,
) -> Result<BTreeMap<String, BTreeSet<PathBuf>>, DelocateError> {
    let temp_dir;
    let root = if path.is_dir() {
        path.to_path_buf()
    } else {
        temp_dir = tempfile::tempdir()?;
        wheel::unpack_wheel(path, temp_dir.path())?;
        temp_dir.path().to_path_buf()
    };

    let package = Package::open(&root, ".dylibs")?;
    let binaries = package.find_binaries(false)?;
    let graph = resolve::resolve(&binaries, package.root(), &ExclusionPolicy::system())?;

    let mut dependencies: BTreeMap<String, BTreeSet<PathBuf>> = BTreeMap::new();
    for edge in &graph.edges {
        if edge.class == DependencyClass::Excluded && !all {
            continue;
        }
        let library = match &edge.target {
            Some(target) => package.relative(target).to_string_lossy().into_owned(),
            None => edge.install_name.clone(),
        };
        dependencies
            .entry(library)
            .or_default()
            .insert(package.relative(&edge.consumer).to_path_buf());
    }
    Ok(dependencies)
}
