//! Delocating directory trees built from synthetic Mach-O binaries.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use fs_err as fs;
use tempfile::TempDir;
use walkdir::WalkDir;

use delocate_core::resolve::resolve_dynamic_path;
use delocate_core::{DelocateError, DelocateOptions, ExclusionPolicy, parse_macho};
use delocate_platform::Arch;
use delocate_test::{CPU_TYPE_ARM64, CPU_TYPE_X86_64, MachOBuilder, fat};

/// A temporary directory, with symlinks resolved.
fn temp_root() -> (TempDir, PathBuf) {
    let temp = TempDir::new().unwrap();
    let root = temp.path().canonicalize().unwrap();
    (temp, root)
}

fn options() -> DelocateOptions {
    DelocateOptions {
        target_macos_version: None,
        ..DelocateOptions::default()
    }
}

/// The contents of every file in a tree, by relative path.
fn snapshot(root: &Path) -> BTreeMap<PathBuf, Vec<u8>> {
    WalkDir::new(root)
        .into_iter()
        .map(Result::unwrap)
        .filter(|entry| entry.file_type().is_file())
        .map(|entry| {
            (
                entry.path().strip_prefix(root).unwrap().to_path_buf(),
                fs::read(entry.path()).unwrap(),
            )
        })
        .collect()
}

/// Every non-system reference of every binary in the package resolves to a file inside it.
fn assert_closed(package: &Path) {
    let policy = ExclusionPolicy::system();
    for binary in delocate_core::find_binaries(package, false).unwrap() {
        let macho = parse_macho(&binary).unwrap();
        for name in &macho.dependencies {
            if policy.matches_name(name).is_some() {
                continue;
            }
            let resolved = resolve_dynamic_path(name, &binary, &macho.rpaths)
                .unwrap_or_else(|| panic!("`{name}` in {} does not resolve", binary.display()));
            assert!(
                resolved.starts_with(package),
                "`{name}` in {} resolves outside the package: {}",
                binary.display(),
                resolved.display()
            );
        }
    }
}

#[test]
fn test_example_scenario() {
    let (_temp, root) = temp_root();
    let lib_dir = root.join("usr").join("local").join("lib");
    let libfoo = lib_dir.join("libfoo.dylib");
    let libbar = lib_dir.join("libbar.dylib");
    MachOBuilder::dylib(CPU_TYPE_X86_64, &libfoo.to_string_lossy())
        .dependency(&libbar.to_string_lossy())
        .dependency("/usr/lib/libSystem.B.dylib")
        .write(&libfoo);
    MachOBuilder::dylib(CPU_TYPE_X86_64, &libbar.to_string_lossy())
        .dependency("/usr/lib/libSystem.B.dylib")
        .write(&libbar);

    let package = root.join("package");
    let module = MachOBuilder::bundle(CPU_TYPE_X86_64)
        .dependency(&libfoo.to_string_lossy())
        .dependency("/usr/lib/libSystem.B.dylib")
        .write(&package.join("mod.so"));

    let report = delocate_core::delocate_tree(&package, &options()).unwrap();
    assert_eq!(
        report.copied,
        BTreeMap::from([
            (libbar.clone(), package.join(".dylibs").join("libbar.dylib")),
            (libfoo.clone(), package.join(".dylibs").join("libfoo.dylib")),
        ])
    );
    assert_eq!(report.patched.len(), 3);

    let module = parse_macho(&module).unwrap();
    assert_eq!(
        module.dependencies,
        [
            "@loader_path/.dylibs/libfoo.dylib",
            "/usr/lib/libSystem.B.dylib"
        ]
    );

    let copied_foo = parse_macho(&package.join(".dylibs").join("libfoo.dylib")).unwrap();
    assert_eq!(
        copied_foo.install_id.as_deref(),
        Some("@loader_path/.dylibs/libfoo.dylib")
    );
    assert_eq!(
        copied_foo.dependencies,
        ["@loader_path/libbar.dylib", "/usr/lib/libSystem.B.dylib"]
    );

    // The originals are untouched.
    let original = parse_macho(&libfoo).unwrap();
    assert_eq!(original.dependencies[0], libbar.to_string_lossy());

    assert_closed(&package);
}

#[test]
fn test_idempotent() {
    let (_temp, root) = temp_root();
    let libfoo = root.join("lib").join("libfoo.dylib");
    MachOBuilder::dylib(CPU_TYPE_X86_64, &libfoo.to_string_lossy())
        .signed()
        .write(&libfoo);
    let package = root.join("package");
    MachOBuilder::bundle(CPU_TYPE_X86_64)
        .dependency("@rpath/libfoo.dylib")
        .rpath(&root.join("lib").to_string_lossy())
        .signed()
        .write(&package.join("pkg").join("ext.so"));

    let first = delocate_core::delocate_tree(&package, &options()).unwrap();
    assert!(first.is_modified());
    let before = snapshot(&package);

    let second = delocate_core::delocate_tree(&package, &options()).unwrap();
    assert!(second.copied.is_empty());
    assert!(second.patched.is_empty());
    assert_eq!(snapshot(&package), before);

    // The absolute rpath is gone, and the signature is still present.
    let ext = parse_macho(&package.join("pkg").join("ext.so")).unwrap();
    assert!(ext.rpaths.is_empty());
    assert!(ext.has_code_signature);
    assert_eq!(ext.dependencies, ["@loader_path/../.dylibs/libfoo.dylib"]);
    assert_closed(&package);
}

#[test]
fn test_deduplication() {
    let (_temp, root) = temp_root();
    let lib_dir = root.join("lib");
    let libfoo = lib_dir.join("libfoo.dylib");
    MachOBuilder::dylib(CPU_TYPE_X86_64, "@rpath/libfoo.dylib").write(&libfoo);

    let package = root.join("package");
    MachOBuilder::bundle(CPU_TYPE_X86_64)
        .dependency(&libfoo.to_string_lossy())
        .write(&package.join("a.so"));
    MachOBuilder::bundle(CPU_TYPE_X86_64)
        .dependency("@rpath/libfoo.dylib")
        .rpath(&lib_dir.to_string_lossy())
        .write(&package.join("sub").join("b.so"));

    let report = delocate_core::delocate_tree(&package, &options()).unwrap();
    assert_eq!(report.copied.len(), 1);
    let copies = fs::read_dir(package.join(".dylibs")).unwrap().count();
    assert_eq!(copies, 1);

    assert_eq!(
        parse_macho(&package.join("a.so")).unwrap().dependencies,
        ["@loader_path/.dylibs/libfoo.dylib"]
    );
    assert_eq!(
        parse_macho(&package.join("sub").join("b.so"))
            .unwrap()
            .dependencies,
        ["@loader_path/../.dylibs/libfoo.dylib"]
    );
    assert_closed(&package);
}

#[test]
fn test_exclusion_leaves_commands() {
    let (_temp, root) = temp_root();
    let excluded = root.join("opt").join("libgfortran.dylib");
    MachOBuilder::dylib(CPU_TYPE_X86_64, &excluded.to_string_lossy()).write(&excluded);
    let package = root.join("package");
    let ext = MachOBuilder::bundle(CPU_TYPE_X86_64)
        .dependency(&excluded.to_string_lossy())
        .write(&package.join("ext.so"));
    let before = fs::read(&ext).unwrap();

    let by_prefix = DelocateOptions {
        exclude_prefixes: vec![root.join("opt")],
        ..options()
    };
    let report = delocate_core::delocate_tree(&package, &by_prefix).unwrap();
    assert!(!report.is_modified());
    assert_eq!(fs::read(&ext).unwrap(), before);
    assert!(!package.join(".dylibs").exists());

    let by_pattern = DelocateOptions {
        exclude: vec!["libgfortran".to_string()],
        ..options()
    };
    let report = delocate_core::delocate_tree(&package, &by_pattern).unwrap();
    assert!(!report.is_modified());
    assert_eq!(fs::read(&ext).unwrap(), before);

    // Without the exclusion, the library is copied.
    let report = delocate_core::delocate_tree(&package, &options()).unwrap();
    assert_eq!(report.copied.len(), 1);
}

#[test]
fn test_rpath_sanitization() {
    let (_temp, root) = temp_root();
    let package = root.join("package");
    let ext = MachOBuilder::bundle(CPU_TYPE_X86_64)
        .rpath("/opt/build/lib")
        .rpath("@loader_path/lib")
        .write(&package.join("ext.so"));

    let keep = DelocateOptions {
        sanitize_rpaths: false,
        ..options()
    };
    let report = delocate_core::delocate_tree(&package, &keep).unwrap();
    assert!(!report.is_modified());
    assert_eq!(
        parse_macho(&ext).unwrap().rpaths,
        ["/opt/build/lib", "@loader_path/lib"]
    );

    let report = delocate_core::delocate_tree(&package, &options()).unwrap();
    assert_eq!(report.patched, [ext.clone()]);
    assert_eq!(parse_macho(&ext).unwrap().rpaths, ["@loader_path/lib"]);
}

#[test]
fn test_fat_package() {
    let (_temp, root) = temp_root();
    let libfoo = root.join("lib").join("libfoo.dylib");
    let id = libfoo.to_string_lossy().into_owned();
    fs::create_dir_all(root.join("lib")).unwrap();
    fs::write(
        &libfoo,
        fat(&[
            MachOBuilder::dylib(CPU_TYPE_X86_64, &id).build(),
            MachOBuilder::dylib(CPU_TYPE_ARM64, &id).build(),
        ]),
    )
    .unwrap();

    let package = root.join("package");
    fs::create_dir_all(&package).unwrap();
    fs::write(
        package.join("ext.so"),
        fat(&[
            MachOBuilder::bundle(CPU_TYPE_X86_64).dependency(&id).build(),
            MachOBuilder::bundle(CPU_TYPE_ARM64).dependency(&id).build(),
        ]),
    )
    .unwrap();

    let options = DelocateOptions {
        require_archs: vec![Arch::X86_64, Arch::Arm64],
        check_archs: true,
        ..options()
    };
    delocate_core::delocate_tree(&package, &options).unwrap();

    let ext = parse_macho(&package.join("ext.so")).unwrap();
    assert_eq!(ext.slices.len(), 2);
    for slice in &ext.slices {
        assert_eq!(slice.dependencies.len(), 1);
        assert_eq!(
            slice.dependencies[0].name,
            "@loader_path/.dylibs/libfoo.dylib"
        );
    }
    let copy = parse_macho(&package.join(".dylibs").join("libfoo.dylib")).unwrap();
    assert_eq!(copy.archs.len(), 2);
    assert_closed(&package);
}

#[test]
fn test_unresolved_dependency() {
    let (_temp, root) = temp_root();
    let package = root.join("package");
    let ext = MachOBuilder::bundle(CPU_TYPE_X86_64)
        .dependency("@rpath/libmissing.dylib")
        .write(&package.join("ext.so"));
    let before = fs::read(&ext).unwrap();

    let err = delocate_core::delocate_tree(&package, &options()).unwrap_err();
    let DelocateError::UnresolvedDependency {
        install_name,
        consumer,
    } = err
    else {
        panic!("expected an unresolved dependency, got: {err}");
    };
    assert_eq!(install_name, "@rpath/libmissing.dylib");
    assert_eq!(consumer, ext);
    assert_eq!(fs::read(&ext).unwrap(), before);
}

#[test]
fn test_name_collision() {
    let (_temp, root) = temp_root();
    let first = root.join("a").join("libz.1.dylib");
    let second = root.join("b").join("libz.1.dylib");
    MachOBuilder::dylib(CPU_TYPE_X86_64, &first.to_string_lossy())
        .tag("a")
        .write(&first);
    MachOBuilder::dylib(CPU_TYPE_X86_64, &second.to_string_lossy())
        .tag("b")
        .write(&second);
    let package = root.join("package");
    MachOBuilder::bundle(CPU_TYPE_X86_64)
        .dependency(&first.to_string_lossy())
        .dependency(&second.to_string_lossy())
        .write(&package.join("ext.so"));

    let report = delocate_core::delocate_tree(&package, &options()).unwrap();
    assert_eq!(report.copied.len(), 2);
    let renamed = report.copied[&second]
        .file_name()
        .unwrap()
        .to_string_lossy()
        .into_owned();
    assert!(renamed.starts_with("libz-"));
    assert!(renamed.ends_with(".1.dylib"));

    let ext = parse_macho(&package.join("ext.so")).unwrap();
    assert_eq!(
        ext.dependencies,
        [
            "@loader_path/.dylibs/libz.1.dylib".to_string(),
            format!("@loader_path/.dylibs/{renamed}"),
        ]
    );
    let copy = parse_macho(&report.copied[&second]).unwrap();
    assert_eq!(
        copy.install_id,
        Some(format!("@loader_path/.dylibs/{renamed}"))
    );
    assert_closed(&package);
}

#[test]
fn test_retry_after_failure() {
    let (_temp, root) = temp_root();
    let lib_dir = root.join("lib");
    let libfoo = lib_dir.join("libfoo.dylib");
    MachOBuilder::dylib(CPU_TYPE_X86_64, "@rpath/libfoo.dylib")
        .signed()
        .write(&libfoo);

    let package = root.join("package");
    let consumer = |builder: MachOBuilder| {
        builder
            .dependency("@rpath/libfoo.dylib")
            .rpath(&lib_dir.to_string_lossy())
    };
    consumer(MachOBuilder::bundle(CPU_TYPE_X86_64)).write(&package.join("a.so"));
    // No room to lengthen the reference.
    consumer(MachOBuilder::bundle(CPU_TYPE_X86_64).tight()).write(&package.join("z.so"));
    let before = snapshot(&package);

    let options = DelocateOptions {
        sanitize_rpaths: false,
        ..options()
    };
    let err = delocate_core::delocate_tree(&package, &options).unwrap_err();
    assert!(
        matches!(&err, DelocateError::Patch { path, .. } if path.ends_with("z.so")),
        "unexpected error: {err}"
    );
    // Nothing was copied or rewritten.
    assert_eq!(snapshot(&package), before);
    assert!(!package.join(".dylibs").exists());

    consumer(MachOBuilder::bundle(CPU_TYPE_X86_64)).write(&package.join("z.so"));
    let report = delocate_core::delocate_tree(&package, &options).unwrap();
    assert_eq!(report.copied.len(), 1);
    let copies = fs::read_dir(package.join(".dylibs"))
        .unwrap()
        .map(|entry| entry.unwrap().file_name())
        .collect::<Vec<_>>();
    assert_eq!(copies, ["libfoo.dylib"]);
    assert_closed(&package);
}

#[test]
fn test_reuse_patched_copy() {
    let (_temp, root) = temp_root();
    let libfoo = root.join("lib").join("libfoo.dylib");
    MachOBuilder::dylib(CPU_TYPE_X86_64, &libfoo.to_string_lossy())
        .signed()
        .write(&libfoo);

    // A copy left behind by an earlier run, already given its new install name.
    let package = root.join("package");
    let copy = package.join(".dylibs").join("libfoo.dylib");
    fs::create_dir_all(copy.parent().unwrap()).unwrap();
    fs::copy(&libfoo, &copy).unwrap();
    delocate_core::patch::change_install_id(&copy, "@loader_path/.dylibs/libfoo.dylib").unwrap();

    MachOBuilder::bundle(CPU_TYPE_X86_64)
        .dependency(&libfoo.to_string_lossy())
        .write(&package.join("ext.so"));

    let report = delocate_core::delocate_tree(&package, &options()).unwrap();
    assert_eq!(report.copied[&libfoo], copy);
    assert_eq!(fs::read_dir(package.join(".dylibs")).unwrap().count(), 1);
    assert_eq!(
        parse_macho(&package.join("ext.so")).unwrap().dependencies,
        ["@loader_path/.dylibs/libfoo.dylib"]
    );
    assert_closed(&package);
}

#[test]
fn test_absolute_reference_inside_package() {
    let (_temp, root) = temp_root();
    let package = root.join("package");
    let libbar = package.join("libs").join("libbar.dylib");
    MachOBuilder::dylib(CPU_TYPE_X86_64, &libbar.to_string_lossy()).write(&libbar);
    MachOBuilder::bundle(CPU_TYPE_X86_64)
        .dependency(&libbar.to_string_lossy())
        .write(&package.join("pkg").join("ext.so"));

    let report = delocate_core::delocate_tree(&package, &options()).unwrap();
    assert!(report.copied.is_empty());
    assert_eq!(
        parse_macho(&package.join("pkg").join("ext.so"))
            .unwrap()
            .dependencies,
        ["@loader_path/../libs/libbar.dylib"]
    );
    assert!(!package.join(".dylibs").exists());

    // The package still works after it moves.
    let moved = root.join("moved");
    fs::rename(&package, &moved).unwrap();
    assert_closed(&moved);
}
