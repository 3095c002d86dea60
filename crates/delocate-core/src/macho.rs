//! Mach-O binary inspection.
//!
//! Detects Mach-O binaries and reads, per architecture slice, the libraries a binary depends on,
//! its runtime search paths, its own install name, whether it carries a code signature, and the
//! minimum macOS version it targets.

use std::collections::BTreeSet;
use std::io::Read;
use std::path::Path;

use fs_err as fs;
use goblin::Hint;
use goblin::mach::MachO;
use goblin::mach::load_command::CommandVariant;
use scroll::Pread;

use delocate_platform::{Arch, MacOSVersion};

use crate::error::DelocateError;
use crate::fat::{self, Container};

/// The kind of load command that references a dependency.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DylibKind {
    /// `LC_LOAD_DYLIB`
    Load,
    /// `LC_LOAD_WEAK_DYLIB`
    Weak,
    /// `LC_REEXPORT_DYLIB`
    Reexport,
    /// `LC_LAZY_LOAD_DYLIB`
    Lazy,
    /// `LC_LOAD_UPWARD_DYLIB`
    Upward,
}

/// A library referenced by a Mach-O slice.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Dependency {
    /// The install name, exactly as written in the load command.
    pub name: String,
    pub kind: DylibKind,
    pub current_version: u32,
    pub compatibility_version: u32,
}

/// A single architecture within a (possibly fat) Mach-O file.
#[derive(Debug, Clone)]
pub struct ArchSlice {
    pub arch: Arch,
    pub cputype: u32,
    pub cpusubtype: u32,
    /// Byte offset of the slice within the file.
    pub offset: u64,
    /// Byte length of the slice.
    pub size: u64,
    /// Alignment of the slice, as a power of two.
    pub align: u32,
    pub dependencies: Vec<Dependency>,
    pub rpaths: Vec<String>,
    pub install_id: Option<String>,
    pub has_code_signature: bool,
    pub min_macos_version: Option<MacOSVersion>,
}

/// Parsed Mach-O file information, merged across architecture slices.
#[derive(Debug, Clone)]
pub struct MachOFile {
    pub slices: Vec<ArchSlice>,
    /// Architectures present in the binary.
    pub archs: BTreeSet<Arch>,
    /// Dependency install names, in order of first appearance across slices.
    pub dependencies: Vec<String>,
    /// Runtime search paths (`LC_RPATH`), in order of first appearance across slices.
    pub rpaths: Vec<String>,
    /// Install name of this library (`LC_ID_DYLIB`), if present.
    pub install_id: Option<String>,
    /// Whether any slice carries `LC_CODE_SIGNATURE`.
    pub has_code_signature: bool,
    /// Minimum macOS version required, maximized across slices.
    pub min_macos_version: Option<MacOSVersion>,
}

impl MachOFile {
    /// Returns `true` if the binary is a dynamic library with an install name.
    pub fn is_dylib(&self) -> bool {
        self.install_id.is_some()
    }
}

/// Check if a file is a Mach-O binary by examining its magic bytes.
///
/// Missing and short files are not Mach-O.
pub fn is_macho_file(path: &Path) -> Result<bool, DelocateError> {
    let mut file = match fs::File::open(path) {
        Ok(f) => f,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(false),
        Err(e) => return Err(e.into()),
    };

    let mut bytes = [0u8; 16];
    if file.read_exact(&mut bytes).is_err() {
        return Ok(false);
    }

    Ok(is_macho_bytes(&bytes))
}

pub(crate) fn is_macho_bytes(bytes: &[u8]) -> bool {
    if fat::is_fat_header(bytes) {
        return true;
    }
    let Ok(bytes) = <[u8; 16]>::try_from(&bytes[..bytes.len().min(16)]) else {
        return false;
    };
    matches!(goblin::mach::peek_bytes(&bytes), Ok(Hint::Mach(_)))
}

/// Parse a Mach-O file and extract dependency information.
pub fn parse_macho(path: &Path) -> Result<MachOFile, DelocateError> {
    let data = fs::read(path)?;
    if !is_macho_bytes(&data) {
        return Err(DelocateError::NotMachO {
            path: path.to_path_buf(),
        });
    }
    parse_macho_bytes(&data)
}

/// Parse Mach-O data from bytes.
pub fn parse_macho_bytes(data: &[u8]) -> Result<MachOFile, DelocateError> {
    let container =
        Container::parse(data).map_err(|err| DelocateError::MachOParse(err.to_string()))?;

    let slices = container
        .slices()
        .iter()
        .map(parse_slice)
        .collect::<Result<Vec<_>, _>>()?;

    let mut dependencies: Vec<String> = Vec::new();
    let mut rpaths: Vec<String> = Vec::new();
    for slice in &slices {
        for dep in &slice.dependencies {
            if !dependencies.contains(&dep.name) {
                dependencies.push(dep.name.clone());
            }
        }
        for rpath in &slice.rpaths {
            if !rpaths.contains(rpath) {
                rpaths.push(rpath.clone());
            }
        }
    }

    Ok(MachOFile {
        archs: slices.iter().map(|slice| slice.arch).collect(),
        dependencies,
        rpaths,
        install_id: slices.iter().find_map(|slice| slice.install_id.clone()),
        has_code_signature: slices.iter().any(|slice| slice.has_code_signature),
        min_macos_version: slices
            .iter()
            .filter_map(|slice| slice.min_macos_version)
            .max(),
        slices,
    })
}

fn parse_slice(slice: &fat::Slice<'_>) -> Result<ArchSlice, DelocateError> {
    let data = slice.data;
    let macho =
        MachO::parse(data, 0).map_err(|err| DelocateError::MachOParse(err.to_string()))?;

    let read_str = |offset: usize| -> Result<String, DelocateError> {
        data.pread::<&str>(offset)
            .map(ToString::to_string)
            .map_err(|err| DelocateError::MachOParse(err.to_string()))
    };

    let mut dependencies = Vec::new();
    let mut rpaths = Vec::new();
    let mut install_id = None;
    let mut has_code_signature = false;
    let mut min_macos_version: Option<MacOSVersion> = None;

    for lc in &macho.load_commands {
        let (kind, dylib) = match &lc.command {
            CommandVariant::LoadDylib(cmd) => (DylibKind::Load, &cmd.dylib),
            CommandVariant::LoadWeakDylib(cmd) => (DylibKind::Weak, &cmd.dylib),
            CommandVariant::ReexportDylib(cmd) => (DylibKind::Reexport, &cmd.dylib),
            CommandVariant::LazyLoadDylib(cmd) => (DylibKind::Lazy, &cmd.dylib),
            CommandVariant::LoadUpwardDylib(cmd) => (DylibKind::Upward, &cmd.dylib),
            CommandVariant::IdDylib(cmd) => {
                install_id = Some(read_str(lc.offset + cmd.dylib.name as usize)?);
                continue;
            }
            CommandVariant::Rpath(cmd) => {
                rpaths.push(read_str(lc.offset + cmd.path as usize)?);
                continue;
            }
            CommandVariant::CodeSignature(_) => {
                has_code_signature = true;
                continue;
            }
            CommandVariant::BuildVersion(cmd) => {
                // Platform 1 is macOS.
                if cmd.platform == 1 {
                    let version = MacOSVersion::from_packed(cmd.minos);
                    min_macos_version = min_macos_version.max(Some(version));
                }
                continue;
            }
            CommandVariant::VersionMinMacosx(cmd) => {
                let version = MacOSVersion::from_packed(cmd.version);
                min_macos_version = min_macos_version.max(Some(version));
                continue;
            }
            _ => continue,
        };
        dependencies.push(Dependency {
            name: read_str(lc.offset + dylib.name as usize)?,
            kind,
            current_version: dylib.current_version,
            compatibility_version: dylib.compatibility_version,
        });
    }

    Ok(ArchSlice {
        arch: Arch::from_cputype(slice.cputype),
        cputype: slice.cputype,
        cpusubtype: slice.cpusubtype,
        offset: slice.offset,
        size: data.len() as u64,
        align: slice.align,
        dependencies,
        rpaths,
        install_id,
        has_code_signature,
        min_macos_version,
    })
}

/// Check if a binary has all the required architectures.
pub fn check_archs(path: &Path, required: &[Arch]) -> Result<(), DelocateError> {
    let macho = parse_macho(path)?;

    for arch in required {
        if !macho.archs.contains(arch) {
            return Err(DelocateError::MissingArchitecture {
                arch: *arch,
                path: path.to_path_buf(),
            });
        }
    }

    Ok(())
}
