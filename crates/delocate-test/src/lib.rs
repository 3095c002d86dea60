//! Test support: synthetic Mach-O images and wheel archives.
//!
//! The images built here are small but structurally complete: a `__TEXT` segment with one
//! section, the requested load commands, a `__LINKEDIT` segment and, optionally, an embedded
//! code signature at the end of `__LINKEDIT`.

// The `unreachable_pub` is to silence false positives in RustRover.
#![allow(dead_code, unreachable_pub)]

use std::collections::BTreeMap;
use std::io::{Read, Write};
use std::path::{Path, PathBuf};

use fs_err as fs;
use zip::ZipWriter;
use zip::write::FileOptions;

pub const CPU_TYPE_X86_64: u32 = 0x0100_0007;
pub const CPU_TYPE_ARM64: u32 = 0x0100_000c;
pub const CPU_SUBTYPE_X86_64_ALL: u32 = 3;
pub const CPU_SUBTYPE_ARM64_ALL: u32 = 0;

const MH_MAGIC_64: u32 = 0xfeed_facf;
const MH_DYLIB: u32 = 0x6;
const MH_BUNDLE: u32 = 0x8;
const LC_SEGMENT_64: u32 = 0x19;
const LC_ID_DYLIB: u32 = 0xd;
const LC_LOAD_DYLIB: u32 = 0xc;
const LC_LOAD_WEAK_DYLIB: u32 = 0x18 | 0x8000_0000;
const LC_RPATH: u32 = 0x1c | 0x8000_0000;
const LC_BUILD_VERSION: u32 = 0x32;
const LC_CODE_SIGNATURE: u32 = 0x1d;

const HEADER_SIZE: usize = 32;
const TEXT_SIZE: usize = 0x1000;
const SECTION_CONTENT: usize = 0x40;
const LINKEDIT_CONTENT: usize = 0x40;

/// Builder for a thin 64-bit little-endian Mach-O image.
#[derive(Debug, Clone)]
pub struct MachOBuilder {
    cputype: u32,
    cpusubtype: u32,
    filetype: u32,
    id: Option<String>,
    dependencies: Vec<(u32, String)>,
    rpaths: Vec<String>,
    min_macos: Option<(u16, u16)>,
    header_pad: Option<usize>,
    signed: bool,
    tag: String,
}

impl MachOBuilder {
    /// A dynamic library (`MH_DYLIB`) with the given install name.
    pub fn dylib(cputype: u32, id: &str) -> Self {
        Self {
            filetype: MH_DYLIB,
            id: Some(id.to_string()),
            ..Self::bundle(cputype)
        }
    }

    /// A loadable bundle (`MH_BUNDLE`), as used for Python extension modules.
    pub fn bundle(cputype: u32) -> Self {
        let cpusubtype = if cputype == CPU_TYPE_ARM64 {
            CPU_SUBTYPE_ARM64_ALL
        } else {
            CPU_SUBTYPE_X86_64_ALL
        };
        Self {
            cputype,
            cpusubtype,
            filetype: MH_BUNDLE,
            id: None,
            dependencies: Vec::new(),
            rpaths: Vec::new(),
            min_macos: None,
            header_pad: Some(0x800),
            signed: false,
            tag: String::new(),
        }
    }

    #[must_use]
    pub fn dependency(mut self, name: &str) -> Self {
        self.dependencies.push((LC_LOAD_DYLIB, name.to_string()));
        self
    }

    #[must_use]
    pub fn weak_dependency(mut self, name: &str) -> Self {
        self.dependencies
            .push((LC_LOAD_WEAK_DYLIB, name.to_string()));
        self
    }

    #[must_use]
    pub fn rpath(mut self, path: &str) -> Self {
        self.rpaths.push(path.to_string());
        self
    }

    #[must_use]
    pub fn min_macos(mut self, major: u16, minor: u16) -> Self {
        self.min_macos = Some((major, minor));
        self
    }

    /// Place the first section at the given file offset.
    #[must_use]
    pub fn header_pad(mut self, offset: usize) -> Self {
        self.header_pad = Some(offset);
        self
    }

    /// Place the first section immediately after the load commands, leaving no room to grow.
    #[must_use]
    pub fn tight(mut self) -> Self {
        self.header_pad = None;
        self
    }

    /// Embed a code signature placeholder.
    #[must_use]
    pub fn signed(mut self) -> Self {
        self.signed = true;
        self
    }

    /// Distinguish images that are otherwise identical.
    #[must_use]
    pub fn tag(mut self, tag: &str) -> Self {
        self.tag = tag.to_string();
        self
    }

    pub fn build(&self) -> Vec<u8> {
        let mut commands: Vec<Vec<u8>> = Vec::new();

        // `__TEXT` is patched once the section offset is known.
        commands.push(Vec::new());
        if let Some(id) = &self.id {
            commands.push(dylib_command(LC_ID_DYLIB, id));
        }
        for (cmd, name) in &self.dependencies {
            commands.push(dylib_command(*cmd, name));
        }
        for rpath in &self.rpaths {
            commands.push(rpath_command(rpath));
        }
        if let Some((major, minor)) = self.min_macos {
            let packed = (u32::from(major) << 16) | (u32::from(minor) << 8);
            let mut cmd = Vec::new();
            put_u32(&mut cmd, LC_BUILD_VERSION);
            put_u32(&mut cmd, 24);
            // Platform 1 is macOS.
            put_u32(&mut cmd, 1);
            put_u32(&mut cmd, packed);
            put_u32(&mut cmd, packed);
            put_u32(&mut cmd, 0);
            commands.push(cmd);
        }
        // `__LINKEDIT` and the signature are patched once the signature size is known.
        let linkedit_index = commands.len();
        commands.push(Vec::new());
        let signature_index = if self.signed {
            commands.push(Vec::new());
            Some(commands.len() - 1)
        } else {
            None
        };

        let signature = if self.signed {
            placeholder_signature()
        } else {
            Vec::new()
        };
        let sizeofcmds = 152
            + 72
            + if self.signed { 16 } else { 0 }
            + commands
                .iter()
                .map(Vec::len)
                .sum::<usize>();
        let header_pad = self
            .header_pad
            .unwrap_or_else(|| (HEADER_SIZE + sizeofcmds).next_multiple_of(16));
        assert!(
            HEADER_SIZE + sizeofcmds <= header_pad,
            "load commands overflow the header padding"
        );
        assert!(header_pad + SECTION_CONTENT <= TEXT_SIZE);

        commands[0] = text_segment(header_pad);
        let signature_offset = TEXT_SIZE + LINKEDIT_CONTENT;
        commands[linkedit_index] = linkedit_segment(LINKEDIT_CONTENT + signature.len());
        if let Some(index) = signature_index {
            let mut cmd = Vec::new();
            put_u32(&mut cmd, LC_CODE_SIGNATURE);
            put_u32(&mut cmd, 16);
            put_u32(&mut cmd, u32::try_from(signature_offset).unwrap());
            put_u32(&mut cmd, u32::try_from(signature.len()).unwrap());
            commands[index] = cmd;
        }

        let mut data = Vec::new();
        put_u32(&mut data, MH_MAGIC_64);
        put_u32(&mut data, self.cputype);
        put_u32(&mut data, self.cpusubtype);
        put_u32(&mut data, self.filetype);
        put_u32(&mut data, u32::try_from(commands.len()).unwrap());
        put_u32(&mut data, u32::try_from(sizeofcmds).unwrap());
        // MH_NOUNDEFS | MH_DYLDLINK | MH_TWOLEVEL
        put_u32(&mut data, 0x85);
        put_u32(&mut data, 0);
        for cmd in &commands {
            data.extend_from_slice(cmd);
        }
        assert_eq!(data.len(), HEADER_SIZE + sizeofcmds);

        data.resize(header_pad, 0);
        let marker = format!("{}:{}", self.cputype, self.tag);
        data.extend(marker.bytes().cycle().take(SECTION_CONTENT));
        data.resize(TEXT_SIZE, 0);
        data.extend((0..LINKEDIT_CONTENT).map(|byte| u8::try_from(byte).unwrap()));
        data.extend_from_slice(&signature);
        data
    }

    /// Build the image and write it to `path`, creating parent directories.
    pub fn write(&self, path: &Path) -> PathBuf {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).unwrap();
        }
        fs::write(path, self.build()).unwrap();
        path.to_path_buf()
    }
}

fn put_u32(buf: &mut Vec<u8>, value: u32) {
    buf.extend_from_slice(&value.to_le_bytes());
}

fn put_u64(buf: &mut Vec<u8>, value: u64) {
    buf.extend_from_slice(&value.to_le_bytes());
}

fn put_name(buf: &mut Vec<u8>, name: &str) {
    let mut bytes = [0u8; 16];
    bytes[..name.len()].copy_from_slice(name.as_bytes());
    buf.extend_from_slice(&bytes);
}

fn padded_string(buf: &mut Vec<u8>, value: &str) {
    buf.extend_from_slice(value.as_bytes());
    buf.push(0);
    let padded = buf.len().next_multiple_of(8);
    buf.resize(padded, 0);
    let cmdsize = u32::try_from(buf.len()).unwrap();
    buf[4..8].copy_from_slice(&cmdsize.to_le_bytes());
}

fn dylib_command(cmd: u32, name: &str) -> Vec<u8> {
    let mut buf = Vec::new();
    put_u32(&mut buf, cmd);
    put_u32(&mut buf, 0);
    put_u32(&mut buf, 24);
    // Timestamp, current version (1.0.0), compatibility version (1.0.0).
    put_u32(&mut buf, 2);
    put_u32(&mut buf, 0x0001_0000);
    put_u32(&mut buf, 0x0001_0000);
    padded_string(&mut buf, name);
    buf
}

fn rpath_command(path: &str) -> Vec<u8> {
    let mut buf = Vec::new();
    put_u32(&mut buf, LC_RPATH);
    put_u32(&mut buf, 0);
    put_u32(&mut buf, 12);
    padded_string(&mut buf, path);
    buf
}

fn text_segment(section_offset: usize) -> Vec<u8> {
    let mut buf = Vec::new();
    put_u32(&mut buf, LC_SEGMENT_64);
    put_u32(&mut buf, 72 + 80);
    put_name(&mut buf, "__TEXT");
    put_u64(&mut buf, 0);
    put_u64(&mut buf, TEXT_SIZE as u64);
    put_u64(&mut buf, 0);
    put_u64(&mut buf, TEXT_SIZE as u64);
    put_u32(&mut buf, 5);
    put_u32(&mut buf, 5);
    put_u32(&mut buf, 1);
    put_u32(&mut buf, 0);

    put_name(&mut buf, "__text");
    put_name(&mut buf, "__TEXT");
    put_u64(&mut buf, section_offset as u64);
    put_u64(&mut buf, SECTION_CONTENT as u64);
    put_u32(&mut buf, u32::try_from(section_offset).unwrap());
    put_u32(&mut buf, 4);
    put_u32(&mut buf, 0);
    put_u32(&mut buf, 0);
    put_u32(&mut buf, 0x8000_0400);
    put_u32(&mut buf, 0);
    put_u32(&mut buf, 0);
    put_u32(&mut buf, 0);
    buf
}

fn linkedit_segment(filesize: usize) -> Vec<u8> {
    let mut buf = Vec::new();
    put_u32(&mut buf, LC_SEGMENT_64);
    put_u32(&mut buf, 72);
    put_name(&mut buf, "__LINKEDIT");
    put_u64(&mut buf, TEXT_SIZE as u64);
    put_u64(&mut buf, 0x1000);
    put_u64(&mut buf, TEXT_SIZE as u64);
    put_u64(&mut buf, filesize as u64);
    put_u32(&mut buf, 1);
    put_u32(&mut buf, 1);
    put_u32(&mut buf, 0);
    put_u32(&mut buf, 0);
    buf
}

/// An empty embedded-signature `SuperBlob`, padded to 16 bytes.
fn placeholder_signature() -> Vec<u8> {
    let mut buf = Vec::new();
    buf.extend_from_slice(&0xfade_0cc0_u32.to_be_bytes());
    buf.extend_from_slice(&12_u32.to_be_bytes());
    buf.extend_from_slice(&0_u32.to_be_bytes());
    buf.resize(16, 0);
    buf
}

/// Combine thin images into a fat (universal) binary, in the given order.
pub fn fat(slices: &[Vec<u8>]) -> Vec<u8> {
    let mut data = Vec::new();
    data.extend_from_slice(&0xcafe_babe_u32.to_be_bytes());
    data.extend_from_slice(&u32::try_from(slices.len()).unwrap().to_be_bytes());

    let mut offset = 8 + 20 * slices.len();
    let mut placed = Vec::new();
    for slice in slices {
        let cputype = u32::from_le_bytes(slice[4..8].try_into().unwrap());
        let cpusubtype = u32::from_le_bytes(slice[8..12].try_into().unwrap());
        let align: u32 = if cputype == CPU_TYPE_ARM64 { 14 } else { 12 };
        offset = offset.next_multiple_of(1 << align);
        data.extend_from_slice(&cputype.to_be_bytes());
        data.extend_from_slice(&cpusubtype.to_be_bytes());
        data.extend_from_slice(&u32::try_from(offset).unwrap().to_be_bytes());
        data.extend_from_slice(&u32::try_from(slice.len()).unwrap().to_be_bytes());
        data.extend_from_slice(&align.to_be_bytes());
        placed.push(offset);
        offset += slice.len();
    }
    for (slice, offset) in slices.iter().zip(placed) {
        data.resize(offset, 0);
        data.extend_from_slice(slice);
    }
    data
}

/// Write a wheel archive containing the given files.
pub fn write_wheel(path: &Path, files: &[(&str, &[u8])]) -> PathBuf {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).unwrap();
    }
    let file = fs::File::create(path).unwrap();
    let mut zip = ZipWriter::new(file);
    for (name, contents) in files {
        let mode = if name.ends_with(".so") || name.ends_with(".dylib") {
            0o755
        } else {
            0o644
        };
        let options = FileOptions::<()>::default()
            .compression_method(zip::CompressionMethod::Deflated)
            .unix_permissions(mode);
        zip.start_file(*name, options).unwrap();
        zip.write_all(contents).unwrap();
    }
    zip.finish().unwrap();
    path.to_path_buf()
}

/// The `WHEEL` metadata file for the given tags.
pub fn wheel_metadata(tags: &[&str]) -> String {
    let mut metadata = String::from("Wheel-Version: 1.0\nGenerator: bdist_wheel (0.37.1)\nRoot-Is-Purelib: false\n");
    for tag in tags {
        metadata.push_str("Tag: ");
        metadata.push_str(tag);
        metadata.push('\n');
    }
    metadata
}

/// Read every file in a wheel archive.
pub fn read_wheel(path: &Path) -> BTreeMap<String, Vec<u8>> {
    let file = fs::File::open(path).unwrap();
    let mut archive = zip::ZipArchive::new(file).unwrap();
    let mut files = BTreeMap::new();
    for index in 0..archive.len() {
        let mut entry = archive.by_index(index).unwrap();
        if entry.is_dir() {
            continue;
        }
        let mut contents = Vec::new();
        entry.read_to_end(&mut contents).unwrap();
        files.insert(entry.name().to_string(), contents);
    }
    files
}
