//! Resolving install names and walking the dependency graph.

use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::env;
use std::fmt;
use std::path::{Path, PathBuf};

use tracing::{debug, trace};

use delocate_platform::{Arch, MacOSVersion};
use delocate_static::EnvVars;

use crate::error::DelocateError;
use crate::macho;

/// A single rule of an [`ExclusionPolicy`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExclusionRule {
    /// Matches install names and resolved paths under a directory, e.g., `/usr/lib`.
    Prefix(PathBuf),
    /// Matches install names and resolved paths containing a substring.
    Pattern(String),
}

impl ExclusionRule {
    fn matches_name(&self, install_name: &str) -> bool {
        match self {
            Self::Prefix(prefix) => Path::new(install_name).starts_with(prefix),
            Self::Pattern(pattern) => install_name.contains(pattern.as_str()),
        }
    }

    fn matches_path(&self, path: &Path) -> bool {
        match self {
            Self::Prefix(prefix) => path.starts_with(prefix),
            Self::Pattern(pattern) => path.to_string_lossy().contains(pattern.as_str()),
        }
    }
}

impl fmt::Display for ExclusionRule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Prefix(prefix) => write!(f, "prefix `{}`", prefix.display()),
            Self::Pattern(pattern) => write!(f, "pattern `{pattern}`"),
        }
    }
}

/// An ordered list of rules deciding which libraries stay outside the package.
///
/// The first matching rule wins.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExclusionPolicy {
    rules: Vec<ExclusionRule>,
}

/// System library prefixes that should not be bundled.
///
/// See: <https://github.com/matthew-brett/delocate/blob/d0ec232826dd31cc80bfcc8adedfd8be78aff0b4/delocate/libsana.py#L35>
const SYSTEM_PREFIXES: &[&str] = &["/usr/lib", "/System"];

impl Default for ExclusionPolicy {
    fn default() -> Self {
        Self::system()
    }
}

impl ExclusionPolicy {
    /// A policy that excludes nothing.
    pub fn empty() -> Self {
        Self { rules: Vec::new() }
    }

    /// A policy that excludes the macOS system library directories.
    pub fn system() -> Self {
        Self {
            rules: SYSTEM_PREFIXES
                .iter()
                .map(|prefix| ExclusionRule::Prefix(PathBuf::from(prefix)))
                .collect(),
        }
    }

    pub fn push(&mut self, rule: ExclusionRule) {
        self.rules.push(rule);
    }

    #[must_use]
    pub fn with_rule(mut self, rule: ExclusionRule) -> Self {
        self.push(rule);
        self
    }

    pub fn rules(&self) -> &[ExclusionRule] {
        &self.rules
    }

    /// The first rule matching a literal install name.
    pub fn matches_name(&self, install_name: &str) -> Option<&ExclusionRule> {
        self.rules
            .iter()
            .find(|rule| rule.matches_name(install_name))
    }

    /// The first rule matching a resolved path.
    pub fn matches_path(&self, path: &Path) -> Option<&ExclusionRule> {
        self.rules.iter().find(|rule| rule.matches_path(path))
    }
}

/// Search for a library in DYLD environment paths.
fn search_dyld_paths(lib_name: &str) -> Option<PathBuf> {
    const DEFAULT_FALLBACK_PATHS: &[&str] = &["/usr/local/lib", "/usr/lib"];

    let from_env = |var: &str| {
        env::var(var)
            .map(|paths| {
                paths
                    .split(':')
                    .filter(|dir| !dir.is_empty())
                    .map(PathBuf::from)
                    .collect::<Vec<_>>()
            })
            .unwrap_or_default()
    };

    from_env(EnvVars::DYLD_LIBRARY_PATH)
        .into_iter()
        .chain(from_env(EnvVars::DYLD_FALLBACK_LIBRARY_PATH))
        .chain(DEFAULT_FALLBACK_PATHS.iter().map(PathBuf::from))
        .find_map(|dir| dir.join(lib_name).canonicalize().ok())
}

/// Expand a leading `@loader_path/` or `@executable_path/` relative to the binary's directory.
///
/// Packages have no main executable, so `@executable_path` is treated like `@loader_path`.
fn expand_loader_token(path: &str, binary_path: &Path) -> Option<PathBuf> {
    let relative = path
        .strip_prefix("@loader_path/")
        .or_else(|| path.strip_prefix("@executable_path/"))?;
    Some(binary_path.parent()?.join(relative))
}

/// Resolve an install name referenced by `binary_path` to a real path on disk.
///
/// Handles the `@loader_path`, `@executable_path` and `@rpath` tokens, absolute paths, paths
/// relative to the binary, and bare names found on the DYLD search paths.
pub fn resolve_dynamic_path(
    install_name: &str,
    binary_path: &Path,
    rpaths: &[String],
) -> Option<PathBuf> {
    if let Some(path) = expand_loader_token(install_name, binary_path) {
        return path.canonicalize().ok();
    }

    if let Some(relative) = install_name.strip_prefix("@rpath/") {
        return rpaths.iter().find_map(|rpath| {
            let base = if rpath.starts_with('@') {
                expand_loader_token(rpath, binary_path)?
            } else {
                PathBuf::from(rpath)
            };
            base.join(relative).canonicalize().ok()
        });
    }

    if install_name.starts_with('@') {
        return None;
    }

    let path = Path::new(install_name);
    if path.is_absolute() {
        if let Ok(resolved) = path.canonicalize() {
            return Some(resolved);
        }
    } else if let Some(resolved) = binary_path
        .parent()
        .and_then(|parent| parent.join(path).canonicalize().ok())
    {
        return Some(resolved);
    }

    // Try DYLD environment paths for the bare library name.
    let lib_name = path.file_name()?;
    search_dyld_paths(&lib_name.to_string_lossy())
}

/// How a dependency reference is handled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum DependencyClass {
    /// Provided by the system; left alone.
    Excluded,
    /// Already inside the package.
    Internal,
    /// Outside the package; must be copied in.
    Internalize,
}

/// A Mach-O file visited while resolving.
#[derive(Debug, Clone)]
pub struct BinaryNode {
    /// The real path of the binary.
    pub path: PathBuf,
    pub archs: BTreeSet<Arch>,
    pub install_id: Option<String>,
    /// Whether the binary was one of the roots, rather than reached through a reference.
    pub is_root: bool,
    pub has_code_signature: bool,
    pub min_macos_version: Option<MacOSVersion>,
    pub rpaths: Vec<String>,
}

/// A reference from one binary to a library.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DependencyEdge {
    pub consumer: PathBuf,
    /// The install name exactly as written in the consumer.
    pub install_name: String,
    /// The resolved real path, absent when excluded before resolution.
    pub target: Option<PathBuf>,
    pub class: DependencyClass,
}

/// The transitive dependencies of a set of root binaries.
#[derive(Debug, Clone, Default)]
pub struct DependencyGraph {
    pub nodes: BTreeMap<PathBuf, BinaryNode>,
    pub edges: Vec<DependencyEdge>,
}

impl DependencyGraph {
    /// The real paths of all libraries that must be copied into the package.
    pub fn internalized(&self) -> BTreeSet<&Path> {
        self.edges
            .iter()
            .filter(|edge| edge.class == DependencyClass::Internalize)
            .filter_map(|edge| edge.target.as_deref())
            .collect()
    }

    /// The references that resolve to `target`.
    pub fn edges_to<'a>(&'a self, target: &'a Path) -> impl Iterator<Item = &'a DependencyEdge> {
        self.edges
            .iter()
            .filter(move |edge| edge.target.as_deref() == Some(target))
    }

    /// The references made by `consumer`.
    pub fn edges_from<'a>(
        &'a self,
        consumer: &'a Path,
    ) -> impl Iterator<Item = &'a DependencyEdge> {
        self.edges
            .iter()
            .filter(move |edge| edge.consumer == consumer)
    }

    pub fn roots(&self) -> impl Iterator<Item = &BinaryNode> {
        self.nodes.values().filter(|node| node.is_root)
    }
}

/// Walk the dependencies of `roots`, breadth first.
///
/// Every reference is classified against `policy` and `package_root`. A reference that does not
/// resolve to an existing file is an error.
pub fn resolve(
    roots: &[PathBuf],
    package_root: &Path,
    policy: &ExclusionPolicy,
) -> Result<DependencyGraph, DelocateError> {
    let package_root = package_root.canonicalize()?;
    let mut roots = roots
        .iter()
        .map(|root| root.canonicalize())
        .collect::<Result<Vec<_>, _>>()?;
    roots.sort();
    roots.dedup();

    let mut graph = DependencyGraph::default();
    let mut queued: BTreeSet<PathBuf> = roots.iter().cloned().collect();
    let mut queue: VecDeque<(PathBuf, bool)> =
        roots.into_iter().map(|root| (root, true)).collect();

    while let Some((path, is_root)) = queue.pop_front() {
        trace!("Inspecting {}", path.display());
        let macho = macho::parse_macho(&path)?;

        for install_name in &macho.dependencies {
            if let Some(rule) = policy.matches_name(install_name) {
                trace!("`{install_name}` excluded by {rule}");
                graph.edges.push(DependencyEdge {
                    consumer: path.clone(),
                    install_name: install_name.clone(),
                    target: None,
                    class: DependencyClass::Excluded,
                });
                continue;
            }

            let target = resolve_dynamic_path(install_name, &path, &macho.rpaths).ok_or_else(
                || DelocateError::UnresolvedDependency {
                    install_name: install_name.clone(),
                    consumer: path.clone(),
                },
            )?;

            if target == path {
                continue;
            }

            let class = if let Some(rule) = policy.matches_path(&target) {
                debug!(
                    "`{install_name}` ({}) excluded by {rule}",
                    target.display()
                );
                DependencyClass::Excluded
            } else if target.starts_with(&package_root) {
                DependencyClass::Internal
            } else {
                DependencyClass::Internalize
            };

            if class != DependencyClass::Excluded && queued.insert(target.clone()) {
                queue.push_back((target.clone(), false));
            }
            graph.edges.push(DependencyEdge {
                consumer: path.clone(),
                install_name: install_name.clone(),
                target: Some(target),
                class,
            });
        }

        graph.nodes.insert(
            path.clone(),
            BinaryNode {
                path,
                archs: macho.archs,
                install_id: macho.install_id,
                is_root,
                has_code_signature: macho.has_code_signature,
                min_macos_version: macho.min_macos_version,
                rpaths: macho.rpaths,
            },
        );
    }

    debug!(
        "Resolved {} binaries with {} libraries to internalize",
        graph.nodes.len(),
        graph.internalized().len()
    );
    Ok(graph)
}

#[cfg(test)]
mod tests {
    use fs_err as fs;

    use delocate_test::{CPU_TYPE_X86_64, MachOBuilder};

    use super::*;

    #[test]
    fn system_policy() {
        let policy = ExclusionPolicy::system();
        assert!(policy.matches_name("/usr/lib/libSystem.B.dylib").is_some());
        assert!(
            policy
                .matches_name("/System/Library/Frameworks/CoreFoundation.framework/CoreFoundation")
                .is_some()
        );
        assert!(policy.matches_name("/usr/local/lib/libfoo.dylib").is_none());
        assert!(policy.matches_name("/opt/homebrew/lib/libbar.dylib").is_none());
        // Prefixes match whole path components.
        assert!(policy.matches_name("/usr/library/libfoo.dylib").is_none());
        assert!(policy.matches_name("@rpath/libfoo.dylib").is_none());
    }

    #[test]
    fn first_rule_wins() {
        let policy = ExclusionPolicy::empty()
            .with_rule(ExclusionRule::Pattern("libgfortran".to_string()))
            .with_rule(ExclusionRule::Prefix(PathBuf::from("/opt")));
        assert_eq!(
            policy.matches_name("/opt/gcc/libgfortran.5.dylib"),
            Some(&ExclusionRule::Pattern("libgfortran".to_string()))
        );
        assert_eq!(
            policy.matches_path(Path::new("/opt/gcc/libquadmath.0.dylib")),
            Some(&ExclusionRule::Prefix(PathBuf::from("/opt")))
        );
        assert_eq!(policy.rules().len(), 2);
        assert!(ExclusionPolicy::empty().matches_name("/usr/lib/libc.dylib").is_none());
    }

    #[test]
    fn resolve_tokens() {
        let temp = tempfile::tempdir().unwrap();
        let root = temp.path().canonicalize().unwrap();
        let lib_dir = root.join("lib");
        fs::create_dir_all(&lib_dir).unwrap();
        fs::write(lib_dir.join("libfoo.dylib"), "").unwrap();
        let binary = root.join("pkg").join("ext.so");
        let expected = lib_dir.join("libfoo.dylib");

        assert_eq!(
            resolve_dynamic_path("@loader_path/../lib/libfoo.dylib", &binary, &[]),
            Some(expected.clone())
        );
        assert_eq!(
            resolve_dynamic_path("@executable_path/../lib/libfoo.dylib", &binary, &[]),
            Some(expected.clone())
        );
        assert_eq!(
            resolve_dynamic_path(
                "@rpath/libfoo.dylib",
                &binary,
                &["/nonexistent".to_string(), "@loader_path/../lib".to_string()]
            ),
            Some(expected.clone())
        );
        assert_eq!(
            resolve_dynamic_path(
                "@rpath/libfoo.dylib",
                &binary,
                &[lib_dir.to_string_lossy().into_owned()]
            ),
            Some(expected.clone())
        );
        assert_eq!(
            resolve_dynamic_path(&expected.to_string_lossy(), &binary, &[]),
            Some(expected.clone())
        );
        assert_eq!(
            resolve_dynamic_path("../lib/libfoo.dylib", &binary, &[]),
            Some(expected)
        );
        assert_eq!(resolve_dynamic_path("@rpath/libfoo.dylib", &binary, &[]), None);
        assert_eq!(resolve_dynamic_path("@unknown/libfoo.dylib", &binary, &[]), None);
    }

    #[test]
    fn transitive_with_cycle() {
        let temp = tempfile::tempdir().unwrap();
        let root = temp.path().canonicalize().unwrap();
        let external = root.join("external");
        let package = root.join("package");
        let libfoo = external.join("libfoo.dylib");
        let libbar = external.join("libbar.dylib");

        MachOBuilder::dylib(CPU_TYPE_X86_64, &libfoo.to_string_lossy())
            .dependency(&libbar.to_string_lossy())
            .dependency("/usr/lib/libSystem.B.dylib")
            .write(&libfoo);
        // `libbar` refers back to `libfoo` and to itself.
        MachOBuilder::dylib(CPU_TYPE_X86_64, &libbar.to_string_lossy())
            .dependency(&libfoo.to_string_lossy())
            .dependency("@loader_path/libbar.dylib")
            .write(&libbar);
        let ext = MachOBuilder::bundle(CPU_TYPE_X86_64)
            .dependency("@rpath/libfoo.dylib")
            .rpath(&external.to_string_lossy())
            .write(&package.join("ext.so"));

        let graph = resolve(&[ext.clone()], &package, &ExclusionPolicy::default()).unwrap();
        assert_eq!(graph.nodes.len(), 3);
        assert!(graph.nodes[&ext].is_root);
        assert!(!graph.nodes[&libfoo].is_root);
        assert_eq!(
            graph.internalized(),
            BTreeSet::from([libbar.as_path(), libfoo.as_path()])
        );

        let to_foo = graph.edges_to(&libfoo).collect::<Vec<_>>();
        assert_eq!(to_foo.len(), 2);
        assert_eq!(to_foo[0].consumer, ext);
        assert_eq!(to_foo[0].install_name, "@rpath/libfoo.dylib");
        assert_eq!(to_foo[1].consumer, libbar);

        let excluded = graph
            .edges_from(&libfoo)
            .filter(|edge| edge.class == DependencyClass::Excluded)
            .collect::<Vec<_>>();
        assert_eq!(excluded.len(), 1);
        assert_eq!(excluded[0].install_name, "/usr/lib/libSystem.B.dylib");
        assert_eq!(excluded[0].target, None);
        assert_eq!(graph.roots().count(), 1);
    }

    #[test]
    fn internal_and_excluded_by_path() {
        let temp = tempfile::tempdir().unwrap();
        let root = temp.path().canonicalize().unwrap();
        let package = root.join("package");
        let vendored = package.join(".dylibs").join("libz.dylib");
        let external = root.join("opt").join("libgfortran.dylib");

        MachOBuilder::dylib(CPU_TYPE_X86_64, "@loader_path/.dylibs/libz.dylib").write(&vendored);
        MachOBuilder::dylib(CPU_TYPE_X86_64, "/opt/libgfortran.dylib").write(&external);
        let ext = MachOBuilder::bundle(CPU_TYPE_X86_64)
            .dependency("@loader_path/.dylibs/libz.dylib")
            .dependency(&external.to_string_lossy())
            .write(&package.join("ext.so"));

        let policy = ExclusionPolicy::default().with_rule(ExclusionRule::Prefix(root.join("opt")));
        let graph = resolve(&[ext.clone()], &package, &policy).unwrap();

        let edges = graph.edges_from(&ext).collect::<Vec<_>>();
        assert_eq!(edges[0].class, DependencyClass::Internal);
        assert_eq!(edges[0].target.as_deref(), Some(vendored.as_path()));
        assert_eq!(edges[1].class, DependencyClass::Excluded);
        assert_eq!(edges[1].target.as_deref(), Some(external.as_path()));
        assert!(graph.internalized().is_empty());
        // Internal libraries are inspected; excluded ones are not.
        assert!(graph.nodes.contains_key(&vendored));
        assert!(!graph.nodes.contains_key(&external));
    }

    #[test]
    fn unresolved() {
        let temp = tempfile::tempdir().unwrap();
        let ext = MachOBuilder::bundle(CPU_TYPE_X86_64)
            .dependency("/nonexistent/libmissing.dylib")
            .write(&temp.path().join("ext.so"));
        let err = resolve(&[ext], temp.path(), &ExclusionPolicy::default()).unwrap_err();
        assert!(matches!(
            err,
            DelocateError::UnresolvedDependency { install_name, .. }
                if install_name == "/nonexistent/libmissing.dylib"
        ));
    }
}
