//! Re-establishing code signatures after a binary has been modified.
//!
//! Editing a load command invalidates the page hashes of an embedded signature, and Apple Silicon
//! refuses to load a binary whose signature does not match. Signed slices are therefore re-signed
//! with an ad-hoc signature after every edit.

use std::fmt;
use std::process::Command;
use std::str::FromStr;

use fs_err as fs;
use goblin::mach::cputype::CPU_TYPE_ARM64;
use goblin::mach::header::{MH_CIGAM, MH_CIGAM_64, MH_EXECUTE, MH_MAGIC, MH_MAGIC_64};
use goblin::mach::load_command::{LC_CODE_SIGNATURE, LC_SEGMENT, LC_SEGMENT_64};
use scroll::{BE, Endian, Pread, Pwrite};
use sha2::{Digest, Sha256};
use tracing::trace;

use crate::error::PatchError;

const CSMAGIC_EMBEDDED_SIGNATURE: u32 = 0xfade_0cc0;
const CSMAGIC_CODEDIRECTORY: u32 = 0xfade_0c02;
const CSMAGIC_EMBEDDED_ENTITLEMENTS: u32 = 0xfade_7171;
const CSMAGIC_EMBEDDED_ENTITLEMENTS_DER: u32 = 0xfade_7172;
const CSSLOT_CODEDIRECTORY: u32 = 0;
const CSSLOT_ENTITLEMENTS: u32 = 5;
const CSSLOT_ENTITLEMENTS_DER: u32 = 7;
const CS_ADHOC: u32 = 0x2;
const CS_LINKER_SIGNED: u32 = 0x2_0000;
const CS_EXECSEG_MAIN_BINARY: u64 = 0x1;
const CS_HASHTYPE_SHA256: u8 = 2;
const CS_VERSION: u32 = 0x2_0400;
const CS_PAGE_SIZE: usize = 4096;
const CS_PAGE_SIZE_LOG2: u8 = 12;
const CODE_DIRECTORY_SIZE: usize = 88;
const HASH_SIZE: usize = 32;

/// Produces a fresh signature for a single-architecture Mach-O slice.
pub trait CodeSigner {
    /// Sign a thin slice that already carries an `LC_CODE_SIGNATURE` command.
    fn sign(&self, slice: Vec<u8>, identifier: &str) -> Result<Vec<u8>, PatchError>;
}

/// Which [`CodeSigner`] to use.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub enum SignerKind {
    /// Sign in-process.
    #[default]
    Adhoc,
    /// Sign with the system `codesign` tool (macOS only).
    Codesign,
}

impl SignerKind {
    pub fn signer(self) -> Box<dyn CodeSigner> {
        match self {
            Self::Adhoc => Box::new(AdhocSigner),
            Self::Codesign => Box::new(CodesignTool),
        }
    }
}

impl FromStr for SignerKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "adhoc" => Ok(Self::Adhoc),
            "codesign" => Ok(Self::Codesign),
            _ => Err(format!("Unknown signer: {s}")),
        }
    }
}

impl fmt::Display for SignerKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Adhoc => f.write_str("adhoc"),
            Self::Codesign => f.write_str("codesign"),
        }
    }
}

/// An in-process ad-hoc signer using SHA-256 page hashes.
///
/// Entitlements (both the plist and the DER encoding) and the linker-signed flag of the previous signature are carried over.
#[derive(Debug, Default, Clone, Copy)]
pub struct AdhocSigner;

/// Signs by running `codesign --force --sign -` on a staged copy of the slice.
#[derive(Debug, Default, Clone, Copy)]
pub struct CodesignTool;

/// The parts of a slice's load commands that signing reads or updates.
#[derive(Debug)]
struct Layout {
    endian: Endian,
    is_64: bool,
    is_executable: bool,
    page_size: u64,
    /// Offset of the `LC_CODE_SIGNATURE` command.
    signature_cmd: usize,
    signature_offset: usize,
    signature_size: usize,
    /// Offset of the `__LINKEDIT` segment command.
    linkedit_cmd: usize,
    linkedit_fileoff: u64,
    linkedit_vmsize: u64,
    text_fileoff: u64,
    text_filesize: u64,
}

fn malformed(err: scroll::Error) -> PatchError {
    PatchError::Malformed(err.to_string())
}

fn segment_name(bytes: &[u8]) -> &str {
    std::str::from_utf8(bytes)
        .unwrap_or("")
        .trim_end_matches('\0')
}

impl Layout {
    fn parse(data: &[u8]) -> Result<Self, PatchError> {
        let magic: u32 = data
            .pread_with(0, scroll::LE)
            .map_err(|_| PatchError::UnsupportedFormat)?;
        let (endian, is_64) = match magic {
            MH_MAGIC => (scroll::LE, false),
            MH_MAGIC_64 => (scroll::LE, true),
            MH_CIGAM => (scroll::BE, false),
            MH_CIGAM_64 => (scroll::BE, true),
            _ => return Err(PatchError::UnsupportedFormat),
        };
        let cputype: u32 = data.pread_with(4, endian).map_err(malformed)?;
        let filetype: u32 = data.pread_with(12, endian).map_err(malformed)?;
        let ncmds: u32 = data.pread_with(16, endian).map_err(malformed)?;

        let mut signature = None;
        let mut linkedit = None;
        let mut text = (0, 0);
        let mut offset = if is_64 { 32 } else { 28 };
        for _ in 0..ncmds {
            let cmd: u32 = data.pread_with(offset, endian).map_err(malformed)?;
            let cmdsize: u32 = data.pread_with(offset + 4, endian).map_err(malformed)?;
            let name = || {
                data.get(offset + 8..offset + 24)
                    .map(segment_name)
                    .unwrap_or_default()
            };
            match cmd {
                LC_CODE_SIGNATURE => {
                    let dataoff: u32 = data.pread_with(offset + 8, endian).map_err(malformed)?;
                    let datasize: u32 = data.pread_with(offset + 12, endian).map_err(malformed)?;
                    signature = Some((offset, dataoff as usize, datasize as usize));
                }
                LC_SEGMENT_64 => {
                    let vmsize: u64 = data.pread_with(offset + 32, endian).map_err(malformed)?;
                    let fileoff: u64 = data.pread_with(offset + 40, endian).map_err(malformed)?;
                    let filesize: u64 = data.pread_with(offset + 48, endian).map_err(malformed)?;
                    match name() {
                        "__LINKEDIT" => linkedit = Some((offset, fileoff, vmsize)),
                        "__TEXT" => text = (fileoff, filesize),
                        _ => {}
                    }
                }
                LC_SEGMENT => {
                    let vmsize: u32 = data.pread_with(offset + 28, endian).map_err(malformed)?;
                    let fileoff: u32 = data.pread_with(offset + 32, endian).map_err(malformed)?;
                    let filesize: u32 = data.pread_with(offset + 36, endian).map_err(malformed)?;
                    match name() {
                        "__LINKEDIT" => {
                            linkedit = Some((offset, u64::from(fileoff), u64::from(vmsize)));
                        }
                        "__TEXT" => text = (u64::from(fileoff), u64::from(filesize)),
                        _ => {}
                    }
                }
                _ => {}
            }
            offset += cmdsize as usize;
        }

        let (signature_cmd, signature_offset, signature_size) = signature
            .ok_or_else(|| PatchError::Signature("missing `LC_CODE_SIGNATURE`".to_string()))?;
        let (linkedit_cmd, linkedit_fileoff, linkedit_vmsize) = linkedit
            .ok_or_else(|| PatchError::Signature("missing `__LINKEDIT` segment".to_string()))?;

        Ok(Self {
            endian,
            is_64,
            is_executable: filetype == MH_EXECUTE,
            page_size: if cputype == CPU_TYPE_ARM64 {
                0x4000
            } else {
                0x1000
            },
            signature_cmd,
            signature_offset,
            signature_size,
            linkedit_cmd,
            linkedit_fileoff,
            linkedit_vmsize,
            text_fileoff: text.0,
            text_filesize: text.1,
        })
    }
}

/// Iterate over the `(slot, offset)` index of an embedded signature `SuperBlob`.
fn blob_index(signature: &[u8]) -> impl Iterator<Item = (u32, usize)> + '_ {
    let count = match signature.pread_with::<u32>(0, BE) {
        Ok(CSMAGIC_EMBEDDED_SIGNATURE) => signature.pread_with::<u32>(8, BE).unwrap_or(0),
        _ => 0,
    };
    (0..count as usize).map_while(move |index| {
        let slot = signature.pread_with::<u32>(12 + index * 8, BE).ok()?;
        let offset = signature.pread_with::<u32>(16 + index * 8, BE).ok()?;
        Some((slot, offset as usize))
    })
}

/// The special slots carried over from a previous signature, with the magic of their blob.
const PRESERVED_SLOTS: [(u32, u32); 2] = [
    (CSSLOT_ENTITLEMENTS, CSMAGIC_EMBEDDED_ENTITLEMENTS),
    (CSSLOT_ENTITLEMENTS_DER, CSMAGIC_EMBEDDED_ENTITLEMENTS_DER),
];

/// The entitlement blobs embedded in a signature, headers included, ordered by slot.
fn entitlement_blobs(signature: &[u8]) -> Vec<(u32, &[u8])> {
    let mut blobs: Vec<(u32, &[u8])> = blob_index(signature)
        .filter_map(|(slot, offset)| {
            let (_, expected) = PRESERVED_SLOTS.iter().find(|(known, _)| *known == slot)?;
            let magic = signature.pread_with::<u32>(offset, BE).ok()?;
            let length = signature.pread_with::<u32>(offset + 4, BE).ok()? as usize;
            if magic != *expected || length < 8 {
                return None;
            }
            Some((slot, signature.get(offset..offset + length)?))
        })
        .collect();
    blobs.sort_by_key(|(slot, _)| *slot);
    blobs.dedup_by_key(|(slot, _)| *slot);
    blobs
}

/// Whether the code directory of a signature carries `CS_LINKER_SIGNED`.
fn is_linker_signed(signature: &[u8]) -> bool {
    blob_index(signature).any(|(slot, offset)| {
        slot == CSSLOT_CODEDIRECTORY
            && signature
                .pread_with::<u32>(offset + 12, BE)
                .is_ok_and(|flags| flags & CS_LINKER_SIGNED != 0)
    })
}

impl CodeSigner for AdhocSigner {
    fn sign(&self, mut slice: Vec<u8>, identifier: &str) -> Result<Vec<u8>, PatchError> {
        let layout = Layout::parse(&slice)?;
        let code_limit = layout.signature_offset;
        if code_limit > slice.len() || code_limit + layout.signature_size < slice.len() {
            return Err(PatchError::Signature(
                "the code signature is not at the end of the binary".to_string(),
            ));
        }
        if (code_limit as u64) < layout.linkedit_fileoff {
            return Err(PatchError::Signature(
                "the code signature lies outside `__LINKEDIT`".to_string(),
            ));
        }

        let previous = &slice[code_limit..];
        let preserved: Vec<(u32, Vec<u8>)> = entitlement_blobs(previous)
            .into_iter()
            .map(|(slot, blob)| (slot, blob.to_vec()))
            .collect();
        let linker_signed = is_linker_signed(previous);
        trace!(
            "Signing `{identifier}` ({} bytes of code, {} entitlement blobs)",
            code_limit,
            preserved.len()
        );

        // Sizes.
        let n_code_slots = code_limit.div_ceil(CS_PAGE_SIZE);
        let n_special_slots = preserved.last().map_or(0, |(slot, _)| *slot as usize);
        let blob_count = 1 + preserved.len();
        let ident_offset = CODE_DIRECTORY_SIZE;
        let hash_offset = ident_offset + identifier.len() + 1 + n_special_slots * HASH_SIZE;
        let directory_size = hash_offset + n_code_slots * HASH_SIZE;
        let directory_offset = 12 + blob_count * 8;
        let blobs_offset = directory_offset + directory_size;
        let blobs_size: usize = preserved.iter().map(|(_, blob)| blob.len()).sum();
        let content_size = blobs_offset + blobs_size;
        let signature_size = content_size.next_multiple_of(8);

        let to_u32 = |value: usize| {
            u32::try_from(value)
                .map_err(|_| PatchError::Signature("binary too large to sign".to_string()))
        };

        // The load commands are covered by the page hashes, so update them first.
        slice
            .pwrite_with(to_u32(signature_size)?, layout.signature_cmd + 12, layout.endian)
            .map_err(malformed)?;
        let linkedit_filesize =
            (code_limit + signature_size) as u64 - layout.linkedit_fileoff;
        let linkedit_vmsize = if linkedit_filesize > layout.linkedit_vmsize {
            linkedit_filesize.next_multiple_of(layout.page_size)
        } else {
            layout.linkedit_vmsize
        };
        if layout.is_64 {
            slice
                .pwrite_with(linkedit_vmsize, layout.linkedit_cmd + 32, layout.endian)
                .map_err(malformed)?;
            slice
                .pwrite_with(linkedit_filesize, layout.linkedit_cmd + 48, layout.endian)
                .map_err(malformed)?;
        } else {
            let vmsize = u32::try_from(linkedit_vmsize)
                .map_err(|_| PatchError::Signature("`__LINKEDIT` too large".to_string()))?;
            let filesize = u32::try_from(linkedit_filesize)
                .map_err(|_| PatchError::Signature("`__LINKEDIT` too large".to_string()))?;
            slice
                .pwrite_with(vmsize, layout.linkedit_cmd + 28, layout.endian)
                .map_err(malformed)?;
            slice
                .pwrite_with(filesize, layout.linkedit_cmd + 36, layout.endian)
                .map_err(malformed)?;
        }
        slice.truncate(code_limit);

        let mut signature = vec![0u8; signature_size];
        let offset = &mut 0;

        // `SuperBlob` header and index.
        signature
            .gwrite_with(CSMAGIC_EMBEDDED_SIGNATURE, offset, BE)
            .map_err(malformed)?;
        signature
            .gwrite_with(to_u32(content_size)?, offset, BE)
            .map_err(malformed)?;
        signature
            .gwrite_with(to_u32(blob_count)?, offset, BE)
            .map_err(malformed)?;
        signature
            .gwrite_with(CSSLOT_CODEDIRECTORY, offset, BE)
            .map_err(malformed)?;
        signature
            .gwrite_with(to_u32(directory_offset)?, offset, BE)
            .map_err(malformed)?;
        let mut blob_offset = blobs_offset;
        for (slot, blob) in &preserved {
            signature.gwrite_with(*slot, offset, BE).map_err(malformed)?;
            signature
                .gwrite_with(to_u32(blob_offset)?, offset, BE)
                .map_err(malformed)?;
            blob_offset += blob.len();
        }

        // `CodeDirectory` header.
        let mut flags = CS_ADHOC;
        if linker_signed {
            flags |= CS_LINKER_SIGNED;
        }
        let exec_seg_flags = if layout.is_executable {
            CS_EXECSEG_MAIN_BINARY
        } else {
            0
        };
        for value in [
            CSMAGIC_CODEDIRECTORY,
            to_u32(directory_size)?,
            CS_VERSION,
            flags,
            to_u32(hash_offset)?,
            to_u32(ident_offset)?,
            to_u32(n_special_slots)?,
            to_u32(n_code_slots)?,
            to_u32(code_limit)?,
        ] {
            signature.gwrite_with(value, offset, BE).map_err(malformed)?;
        }
        // Hash size, hash type, platform, page size.
        for value in [32u8, CS_HASHTYPE_SHA256, 0, CS_PAGE_SIZE_LOG2] {
            signature.gwrite(value, offset).map_err(malformed)?;
        }
        // Spare, scatter offset, team offset, spare.
        *offset += 16;
        for value in [
            0u64,
            layout.text_fileoff,
            layout.text_filesize,
            exec_seg_flags,
        ] {
            signature.gwrite_with(value, offset, BE).map_err(malformed)?;
        }
        debug_assert_eq!(*offset, directory_offset + CODE_DIRECTORY_SIZE);

        // Identifier.
        signature[*offset..*offset + identifier.len()].copy_from_slice(identifier.as_bytes());
        *offset += identifier.len() + 1;

        // Special slots are stored in reverse, so slot `n` sits `n` hashes before the code
        // hashes. Unused slots stay zeroed.
        let mut blob_offset = blobs_offset;
        for (slot, blob) in &preserved {
            let start = *offset + (n_special_slots - *slot as usize) * HASH_SIZE;
            signature[start..start + HASH_SIZE].copy_from_slice(&Sha256::digest(blob));
            signature[blob_offset..blob_offset + blob.len()].copy_from_slice(blob);
            blob_offset += blob.len();
        }
        *offset += n_special_slots * HASH_SIZE;

        // Code page hashes.
        for page in slice.chunks(CS_PAGE_SIZE) {
            let digest = Sha256::digest(page);
            signature[*offset..*offset + HASH_SIZE].copy_from_slice(&digest);
            *offset += HASH_SIZE;
        }

        slice.extend_from_slice(&signature);
        Ok(slice)
    }
}

impl CodeSigner for CodesignTool {
    fn sign(&self, slice: Vec<u8>, identifier: &str) -> Result<Vec<u8>, PatchError> {
        let temp_dir = tempfile::tempdir()?;
        let path = temp_dir.path().join(identifier);
        fs::write(&path, slice)?;

        trace!("Running `codesign --force --sign -` on {}", path.display());
        let output = Command::new("codesign")
            .args(["--force", "--sign", "-"])
            .arg(&path)
            .output()?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
            return Err(PatchError::CodesignFailed { stderr });
        }
        Ok(fs::read(&path)?)
    }
}
