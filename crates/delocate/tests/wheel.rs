//! Tests for the wheel commands: `wheel`, `list-deps`, `fuse`, and `add-platforms`.

use std::collections::BTreeSet;
use std::path::Path;

use fs_err as fs;
use indoc::formatdoc;
use predicates::prelude::*;

use delocate_core::macho::parse_macho_bytes;
use delocate_platform::Arch;
use delocate_test::{
    CPU_TYPE_ARM64, CPU_TYPE_X86_64, MachOBuilder, read_wheel, wheel_metadata, write_wheel,
};

use crate::common::{WHEEL_NAME, delocate_command, external_library, temp_root, wheel_linking};

mod common;

#[test]
fn test_wheel_verbose() {
    let (_temp, root) = temp_root();
    let library = external_library(&root);
    wheel_linking(&root.join("dist"), &library);

    delocate_command(&root)
        .args(["wheel", "-v", "-w", "wheelhouse"])
        .arg(Path::new("dist").join(WHEEL_NAME))
        .assert()
        .success()
        .stdout(predicate::str::diff(formatdoc! {"
            Fixing: {wheel}
            Copied to package .dylibs directory:
              {library}
            ",
            wheel = Path::new("dist").join(WHEEL_NAME).display(),
            library = library.display(),
        }));

    // The delocated wheel only depends on its own copy.
    delocate_command(&root)
        .arg("list-deps")
        .arg(Path::new("wheelhouse").join(WHEEL_NAME))
        .assert()
        .success()
        .stdout("foo/.dylibs/libfoo.dylib\n");
}

#[test]
fn test_wheel_in_place() {
    let (_temp, root) = temp_root();
    let library = external_library(&root);
    let wheel = wheel_linking(&root, &library);

    delocate_command(&root)
        .args(["wheel", WHEEL_NAME])
        .assert()
        .success()
        .stdout(format!("Fixing: {WHEEL_NAME}\n"));

    let files = read_wheel(&wheel);
    assert!(files.contains_key("foo/.dylibs/libfoo.dylib"));

    // A second run leaves the wheel alone.
    let before = fs::read(&wheel).unwrap();
    delocate_command(&root)
        .args(["wheel", "-q", WHEEL_NAME])
        .assert()
        .success()
        .stdout("");
    assert_eq!(fs::read(&wheel).unwrap(), before);
}

#[test]
fn test_wheel_unresolved() {
    let (_temp, root) = temp_root();
    let missing = root.join("lib").join("libmissing.dylib");
    let wheel = wheel_linking(&root, &missing);
    let before = fs::read(&wheel).unwrap();

    delocate_command(&root)
        .args(["wheel", WHEEL_NAME])
        .assert()
        .code(2)
        .stderr(
            predicate::str::contains(format!("error: Failed to delocate `{WHEEL_NAME}`")).and(
                predicate::str::contains(format!(
                    "Caused by: Could not find `{}` referenced by",
                    missing.display()
                )),
            ),
        );
    assert_eq!(fs::read(&wheel).unwrap(), before);
}

#[test]
fn test_list_deps_directory() {
    let (_temp, root) = temp_root();
    let library = external_library(&root);
    MachOBuilder::bundle(CPU_TYPE_X86_64)
        .dependency(&library.to_string_lossy())
        .dependency("/usr/lib/libSystem.B.dylib")
        .write(&root.join("pkg").join("foo").join("ext.so"));
    fs::create_dir_all(root.join("empty")).unwrap();

    delocate_command(&root)
        .args(["list-deps", "pkg"])
        .assert()
        .success()
        .stdout(format!("{}\n", library.display()));

    delocate_command(&root)
        .args(["list-deps", "--all", "--depending", "pkg"])
        .assert()
        .success()
        .stdout(formatdoc! {"
            {library}:
                {ext}
            /usr/lib/libSystem.B.dylib:
                {ext}
            ",
            library = library.display(),
            ext = Path::new("pkg").join("foo").join("ext.so").display(),
        });

    delocate_command(&root)
        .args(["list-deps", "pkg", "empty"])
        .assert()
        .success()
        .stdout(formatdoc! {"
            pkg:
                {library}
            empty:
            ",
            library = library.display(),
        });
}

/// Write a wheel for a single architecture, returning its file name.
fn arch_wheel(dir: &Path, cputype: u32, platform: &str) -> String {
    let name = format!("foo-1.0-cp312-cp312-{platform}.whl");
    let ext = MachOBuilder::bundle(cputype).build();
    let metadata = wheel_metadata(&[&format!("cp312-cp312-{platform}")]);
    write_wheel(
        &dir.join(&name),
        &[
            ("foo/__init__.py", b""),
            ("foo/ext.so", &ext),
            ("foo-1.0.dist-info/WHEEL", metadata.as_bytes()),
        ],
    );
    name
}

#[test]
fn test_fuse() {
    let (_temp, root) = temp_root();
    let x86 = arch_wheel(&root.join("x86"), CPU_TYPE_X86_64, "macosx_10_9_x86_64");
    let arm = arch_wheel(&root.join("arm"), CPU_TYPE_ARM64, "macosx_11_0_arm64");
    let fused = "foo-1.0-cp312-cp312-macosx_10_9_x86_64.macosx_11_0_arm64.whl";

    delocate_command(&root)
        .arg("fuse")
        .arg(Path::new("x86").join(&x86))
        .arg(Path::new("arm").join(&arm))
        .args(["-w", "out"])
        .assert()
        .success()
        .stdout("");

    let files = read_wheel(&root.join("out").join(fused));
    let ext = parse_macho_bytes(&files["foo/ext.so"]).unwrap();
    assert_eq!(ext.archs, BTreeSet::from([Arch::X86_64, Arch::Arm64]));
    assert!(files.contains_key("foo-1.0.dist-info/RECORD"));
    let metadata = String::from_utf8(files["foo-1.0.dist-info/WHEEL"].clone()).unwrap();
    assert!(metadata.contains("Tag: cp312-cp312-macosx_10_9_x86_64\n"));
    assert!(metadata.contains("Tag: cp312-cp312-macosx_11_0_arm64\n"));

    // Without `--wheel-dir`, the fused wheel replaces the first wheel.
    delocate_command(&root)
        .arg("fuse")
        .arg(Path::new("x86").join(&x86))
        .arg(Path::new("arm").join(&arm))
        .arg("-v")
        .assert()
        .success()
        .stdout(formatdoc! {"
            Wrote {fused}
            Deleted old wheel {x86}
            ",
            fused = Path::new("x86").join(fused).display(),
            x86 = Path::new("x86").join(&x86).display(),
        });
    assert_eq!(read_wheel(&root.join("x86").join(fused)), files);
    assert!(!root.join("x86").join(&x86).exists());
}

#[test]
fn test_fuse_conflict() {
    let (_temp, root) = temp_root();
    let name = arch_wheel(&root.join("a"), CPU_TYPE_X86_64, "macosx_10_9_x86_64");
    let ext = MachOBuilder::bundle(CPU_TYPE_X86_64).tag("rebuilt").build();
    let metadata = wheel_metadata(&["cp312-cp312-macosx_10_9_x86_64"]);
    write_wheel(
        &root.join("b").join(&name),
        &[
            ("foo/ext.so", &ext),
            ("foo-1.0.dist-info/WHEEL", metadata.as_bytes()),
        ],
    );

    delocate_command(&root)
        .arg("fuse")
        .arg(Path::new("a").join(&name))
        .arg(Path::new("b").join(&name))
        .assert()
        .code(2)
        .stderr(predicate::str::contains(
            "Caused by: Cannot fuse `foo/ext.so`: both inputs contain a different `x86_64` slice",
        ));
    assert!(root.join("a").join(&name).exists());
}

#[test]
fn test_add_platforms() {
    let (_temp, root) = temp_root();
    let metadata = wheel_metadata(&["cp312-cp312-macosx_10_9_x86_64"]);
    write_wheel(
        &root.join(WHEEL_NAME),
        &[
            ("foo/__init__.py", b""),
            ("foo-1.0.dist-info/WHEEL", metadata.as_bytes()),
        ],
    );

    let output = delocate_command(&root)
        .args(["add-platforms", "-v", "-x", "10_9", WHEEL_NAME])
        .assert()
        .success();
    let stdout = String::from_utf8(output.get_output().stdout.clone()).unwrap();
    insta::assert_snapshot!(stdout, @r"
    Setting platform tags macosx_10_9_intel,macosx_10_9_x86_64 for wheel foo-1.0-cp312-cp312-macosx_10_9_x86_64.whl
    Wrote ./foo-1.0-cp312-cp312-macosx_10_9_x86_64.macosx_10_9_intel.whl
    ");

    let renamed = "foo-1.0-cp312-cp312-macosx_10_9_x86_64.macosx_10_9_intel.whl";
    let files = read_wheel(&root.join(renamed));
    let metadata = String::from_utf8(files["foo-1.0.dist-info/WHEEL"].clone()).unwrap();
    assert!(metadata.contains("Tag: cp312-cp312-macosx_10_9_x86_64\n"));
    assert!(metadata.contains("Tag: cp312-cp312-macosx_10_9_intel\n"));
    // The original is kept without `--rm-orig`.
    assert!(root.join(WHEEL_NAME).exists());

    // Adding the same tags again is a no-op.
    let output = delocate_command(&root)
        .args(["add-platforms", "-v", "-x", "10_9", renamed])
        .assert()
        .success();
    let stdout = String::from_utf8(output.get_output().stdout.clone()).unwrap();
    insta::assert_snapshot!(stdout, @r"
    Setting platform tags macosx_10_9_intel,macosx_10_9_x86_64 for wheel foo-1.0-cp312-cp312-macosx_10_9_x86_64.macosx_10_9_intel.whl
    foo-1.0-cp312-cp312-macosx_10_9_x86_64.macosx_10_9_intel.whl already has tags macosx_10_9_intel, macosx_10_9_x86_64
    ");

    // An existing output is only replaced with `--clobber`.
    delocate_command(&root)
        .args(["add-platforms", "-x", "10_9", WHEEL_NAME])
        .assert()
        .code(2)
        .stderr(predicate::str::contains("Wheel already exists"));
    delocate_command(&root)
        .args(["add-platforms", "-c", "-r", "-x", "10_9", WHEEL_NAME])
        .assert()
        .success();
    assert!(!root.join(WHEEL_NAME).exists());
    assert!(root.join(renamed).exists());
}

#[test]
fn test_add_platforms_pure() {
    let (_temp, root) = temp_root();
    let pure = "foo-1.0-py3-none-any.whl";
    write_wheel(
        &root.join(pure),
        &[
            ("foo/__init__.py", b""),
            ("foo-1.0.dist-info/WHEEL", wheel_metadata(&["py3-none-any"]).as_bytes()),
        ],
    );

    delocate_command(&root)
        .args(["add-platforms", "-p", "macosx_11_0_arm64", pure])
        .assert()
        .code(2)
        .stderr(predicate::str::contains(
            "Cannot add platform tags to a pure wheel",
        ));

    delocate_command(&root)
        .args(["add-platforms", "-k", "-p", "macosx_11_0_arm64", pure])
        .assert()
        .success()
        .stdout(format!(
            "Cannot modify {pure} because Cannot add platform tags to a pure wheel: `{pure}`\n"
        ));

    delocate_command(&root)
        .args(["add-platforms", pure])
        .assert()
        .code(2)
        .stderr(predicate::str::contains(
            "Need at least one `--osx-ver` or `--plat-tag`",
        ));
}
