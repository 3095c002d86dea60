//! Rewriting the load commands of a thin Mach-O image.
//!
//! The header and each load command are read into owned records, edited, and then laid back
//! down in the command area. The area may grow into the zero padding that separates it from the
//! first section or segment content; it is never moved.

use goblin::mach::load_command::{
    LC_ID_DYLIB, LC_LAZY_LOAD_DYLIB, LC_LOAD_DYLIB, LC_LOAD_UPWARD_DYLIB, LC_LOAD_WEAK_DYLIB,
    LC_REEXPORT_DYLIB, LC_RPATH, LC_SEGMENT, LC_SEGMENT_64,
};
use goblin::mach::header::{MH_CIGAM, MH_CIGAM_64, MH_MAGIC, MH_MAGIC_64};
use scroll::{Endian, Pread, Pwrite};
use tracing::trace;

use crate::error::PatchError;

const DEPENDENCY_COMMANDS: [u32; 5] = [
    LC_LOAD_DYLIB,
    LC_LOAD_WEAK_DYLIB,
    LC_REEXPORT_DYLIB,
    LC_LAZY_LOAD_DYLIB,
    LC_LOAD_UPWARD_DYLIB,
];

/// Section types that occupy no file space.
const ZEROFILL_SECTION_TYPES: [u32; 3] = [0x1, 0xc, 0x12];

#[derive(Debug, Clone)]
struct Record {
    cmd: u32,
    bytes: Vec<u8>,
}

/// An editor for the load commands of one architecture slice.
#[derive(Debug)]
pub(crate) struct MachOWriter<'a> {
    data: &'a [u8],
    endian: Endian,
    is_64: bool,
    header_size: usize,
    original_size: usize,
    /// The first file offset that holds mapped content; the command area must end before it.
    pad_limit: usize,
    records: Vec<Record>,
}

fn malformed(err: scroll::Error) -> PatchError {
    PatchError::Malformed(err.to_string())
}

impl<'a> MachOWriter<'a> {
    pub(crate) fn new(data: &'a [u8]) -> Result<Self, PatchError> {
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
        let header_size = if is_64 { 32 } else { 28 };
        let ncmds: u32 = data.pread_with(16, endian).map_err(malformed)?;
        let sizeofcmds: u32 = data.pread_with(20, endian).map_err(malformed)?;
        let original_size = sizeofcmds as usize;
        if header_size + original_size > data.len() {
            return Err(PatchError::Malformed(
                "load commands extend past the end of the file".to_string(),
            ));
        }

        let mut records = Vec::with_capacity(ncmds as usize);
        let mut pad_limit = data.len();
        let mut offset = header_size;
        for _ in 0..ncmds {
            let cmd: u32 = data.pread_with(offset, endian).map_err(malformed)?;
            let cmdsize = data.pread_with::<u32>(offset + 4, endian).map_err(malformed)? as usize;
            if cmdsize < 8 || offset + cmdsize > header_size + original_size {
                return Err(PatchError::Malformed(format!(
                    "load command at offset {offset} has invalid size {cmdsize}"
                )));
            }
            let bytes = data[offset..offset + cmdsize].to_vec();
            if let Some(limit) = content_start(cmd, &bytes, endian)? {
                pad_limit = pad_limit.min(limit);
            }
            records.push(Record { cmd, bytes });
            offset += cmdsize;
        }

        Ok(Self {
            data,
            endian,
            is_64,
            header_size,
            original_size,
            pad_limit,
            records,
        })
    }

    /// The install name (`LC_ID_DYLIB`), if any.
    pub(crate) fn install_id(&self) -> Option<String> {
        self.records
            .iter()
            .find(|record| record.cmd == LC_ID_DYLIB)
            .and_then(|record| self.read_string(record, 8))
    }

    /// Replace the install name. Returns `false` if it already had that value.
    pub(crate) fn set_install_id(&mut self, id: &str) -> Result<bool, PatchError> {
        let index = self
            .records
            .iter()
            .position(|record| record.cmd == LC_ID_DYLIB)
            .ok_or(PatchError::MissingInstallId)?;
        if self.read_string(&self.records[index], 8).as_deref() == Some(id) {
            return Ok(false);
        }
        trace!("Setting install id to `{id}`");
        let rebuilt = self.dylib_record(&self.records[index], id)?;
        self.records[index] = rebuilt;
        Ok(true)
    }

    /// Point every dependency on `old` at `new`. Returns `false` if no command referenced `old`.
    pub(crate) fn change_dylib(&mut self, old: &str, new: &str) -> Result<bool, PatchError> {
        let mut changed = false;
        for index in 0..self.records.len() {
            let record = &self.records[index];
            if !DEPENDENCY_COMMANDS.contains(&record.cmd)
                || self.read_string(record, 8).as_deref() != Some(old)
            {
                continue;
            }
            trace!("Changing dependency `{old}` to `{new}`");
            let rebuilt = self.dylib_record(record, new)?;
            self.records[index] = rebuilt;
            changed = true;
        }
        Ok(changed)
    }

    /// Returns `true` if any dependency command references `name`.
    pub(crate) fn has_dependency(&self, name: &str) -> bool {
        self.records.iter().any(|record| {
            DEPENDENCY_COMMANDS.contains(&record.cmd)
                && self.read_string(record, 8).as_deref() == Some(name)
        })
    }

    /// The runtime search paths, in command order.
    pub(crate) fn rpaths(&self) -> Vec<String> {
        self.records
            .iter()
            .filter(|record| record.cmd == LC_RPATH)
            .filter_map(|record| self.read_string(record, 8))
            .collect()
    }

    /// Append an `LC_RPATH`. Returns `false` if the path was already present.
    pub(crate) fn add_rpath(&mut self, path: &str) -> Result<bool, PatchError> {
        if self.rpaths().iter().any(|rpath| rpath == path) {
            return Ok(false);
        }
        trace!("Adding rpath `{path}`");
        let mut bytes = vec![0u8; 12];
        bytes.pwrite_with(LC_RPATH, 0, self.endian).map_err(malformed)?;
        bytes.pwrite_with(12u32, 8, self.endian).map_err(malformed)?;
        self.finish_string_command(&mut bytes, path)?;
        self.records.push(Record {
            cmd: LC_RPATH,
            bytes,
        });
        Ok(true)
    }

    /// Remove every `LC_RPATH` equal to `path`. Returns `false` if there was none.
    pub(crate) fn delete_rpath(&mut self, path: &str) -> bool {
        let before = self.records.len();
        let endian = self.endian;
        self.records.retain(|record| {
            record.cmd != LC_RPATH || read_cstr(&record.bytes, 8, endian).as_deref() != Some(path)
        });
        let removed = self.records.len() != before;
        if removed {
            trace!("Deleted rpath `{path}`");
        }
        removed
    }

    /// Lay the edited commands back down into a copy of the slice.
    pub(crate) fn build(&self) -> Result<Vec<u8>, PatchError> {
        let new_size: usize = self.records.iter().map(|record| record.bytes.len()).sum();
        let available = self.pad_limit.saturating_sub(self.header_size);
        if new_size > available {
            return Err(PatchError::HeaderPadExhausted {
                needed: new_size,
                available,
            });
        }

        let mut out = self.data.to_vec();
        let ncmds = u32::try_from(self.records.len())
            .map_err(|_| PatchError::Malformed("too many load commands".to_string()))?;
        let sizeofcmds = u32::try_from(new_size)
            .map_err(|_| PatchError::Malformed("load commands too large".to_string()))?;
        out.pwrite_with(ncmds, 16, self.endian).map_err(malformed)?;
        out.pwrite_with(sizeofcmds, 20, self.endian)
            .map_err(malformed)?;

        let mut offset = self.header_size;
        for record in &self.records {
            out[offset..offset + record.bytes.len()].copy_from_slice(&record.bytes);
            offset += record.bytes.len();
        }
        // Clear what remains of the previous, larger command area.
        let old_end = self.header_size + self.original_size;
        if offset < old_end {
            out[offset..old_end].fill(0);
        }
        Ok(out)
    }

    fn read_string(&self, record: &Record, field: usize) -> Option<String> {
        read_cstr(&record.bytes, field, self.endian)
    }

    /// Rebuild a dylib command with a new name, keeping its timestamp and versions.
    fn dylib_record(&self, record: &Record, name: &str) -> Result<Record, PatchError> {
        let mut bytes = record
            .bytes
            .get(..24)
            .ok_or_else(|| PatchError::Malformed("truncated dylib command".to_string()))?
            .to_vec();
        bytes.pwrite_with(24u32, 8, self.endian).map_err(malformed)?;
        self.finish_string_command(&mut bytes, name)?;
        Ok(Record {
            cmd: record.cmd,
            bytes,
        })
    }

    /// Append a NUL-terminated string, pad to the pointer size, and set `cmdsize`.
    fn finish_string_command(&self, bytes: &mut Vec<u8>, value: &str) -> Result<(), PatchError> {
        bytes.extend_from_slice(value.as_bytes());
        bytes.push(0);
        let align = if self.is_64 { 8 } else { 4 };
        bytes.resize(bytes.len().next_multiple_of(align), 0);
        let cmdsize = u32::try_from(bytes.len())
            .map_err(|_| PatchError::Malformed("load command too large".to_string()))?;
        bytes.pwrite_with(cmdsize, 4, self.endian).map_err(malformed)?;
        Ok(())
    }
}

/// Read the string referenced by the `lc_str` offset stored at `field` within a command.
fn read_cstr(bytes: &[u8], field: usize, endian: Endian) -> Option<String> {
    let offset = bytes.pread_with::<u32>(field, endian).ok()? as usize;
    let tail = bytes.get(offset..)?;
    let end = tail.iter().position(|&byte| byte == 0).unwrap_or(tail.len());
    std::str::from_utf8(&tail[..end]).ok().map(ToString::to_string)
}

/// The file offset at which a segment command's mapped content begins, if it has any.
fn content_start(cmd: u32, bytes: &[u8], endian: Endian) -> Result<Option<usize>, PatchError> {
    let (fileoff, filesize, nsects, sections, section_size, section_offset, section_flags) =
        match cmd {
            LC_SEGMENT_64 => (
                bytes.pread_with::<u64>(40, endian).map_err(malformed)?,
                bytes.pread_with::<u64>(48, endian).map_err(malformed)?,
                bytes.pread_with::<u32>(64, endian).map_err(malformed)?,
                72,
                80,
                48,
                64,
            ),
            LC_SEGMENT => (
                u64::from(bytes.pread_with::<u32>(32, endian).map_err(malformed)?),
                u64::from(bytes.pread_with::<u32>(36, endian).map_err(malformed)?),
                bytes.pread_with::<u32>(48, endian).map_err(malformed)?,
                56,
                68,
                40,
                56,
            ),
            _ => return Ok(None),
        };

    let mut start: Option<u64> = None;
    if fileoff > 0 && filesize > 0 {
        start = Some(fileoff);
    }
    for index in 0..nsects as usize {
        let base = sections + index * section_size;
        let offset = bytes
            .pread_with::<u32>(base + section_offset, endian)
            .map_err(malformed)?;
        let flags = bytes
            .pread_with::<u32>(base + section_flags, endian)
            .map_err(malformed)?;
        if offset == 0 || ZEROFILL_SECTION_TYPES.contains(&(flags & 0xff)) {
            continue;
        }
        let offset = u64::from(offset);
        start = Some(start.map_or(offset, |start| start.min(offset)));
    }
    Ok(start.map(|start| usize::try_from(start).unwrap_or(usize::MAX)))
}

#[cfg(test)]
mod tests {
    use delocate_test::{CPU_TYPE_X86_64, MachOBuilder};

    use crate::macho::parse_macho_bytes;

    use super::*;

    #[test]
    fn change_dependency_and_id() {
        let data = MachOBuilder::dylib(CPU_TYPE_X86_64, "/usr/local/lib/libfoo.dylib")
            .dependency("/usr/local/lib/libbar.dylib")
            .dependency("/usr/lib/libSystem.B.dylib")
            .build();
        let mut writer = MachOWriter::new(&data).unwrap();
        assert_eq!(
            writer.install_id().as_deref(),
            Some("/usr/local/lib/libfoo.dylib")
        );
        assert!(
            writer
                .set_install_id("@loader_path/.dylibs/libfoo.dylib")
                .unwrap()
        );
        assert!(
            writer
                .change_dylib(
                    "/usr/local/lib/libbar.dylib",
                    "@loader_path/libbar.dylib"
                )
                .unwrap()
        );
        assert!(!writer.change_dylib("/missing.dylib", "@rpath/x").unwrap());

        let out = writer.build().unwrap();
        assert_eq!(out.len(), data.len());
        let macho = parse_macho_bytes(&out).unwrap();
        assert_eq!(
            macho.install_id.as_deref(),
            Some("@loader_path/.dylibs/libfoo.dylib")
        );
        assert_eq!(
            macho.dependencies,
            vec!["@loader_path/libbar.dylib", "/usr/lib/libSystem.B.dylib"]
        );
        // Versions survive the rewrite.
        assert_eq!(
            macho.slices[0].dependencies[0].compatibility_version,
            0x0001_0000
        );
        // Section content is untouched.
        assert_eq!(out[0x800..0x1000], data[0x800..0x1000]);
    }

    #[test]
    fn rpaths() {
        let data = MachOBuilder::bundle(CPU_TYPE_X86_64)
            .rpath("/opt/build/lib")
            .rpath("@loader_path/lib")
            .build();
        let mut writer = MachOWriter::new(&data).unwrap();
        assert_eq!(writer.rpaths(), vec!["/opt/build/lib", "@loader_path/lib"]);
        assert!(writer.delete_rpath("/opt/build/lib"));
        assert!(!writer.delete_rpath("/opt/build/lib"));
        assert!(!writer.add_rpath("@loader_path/lib").unwrap());
        assert!(writer.add_rpath("@loader_path/../libs").unwrap());

        let macho = parse_macho_bytes(&writer.build().unwrap()).unwrap();
        assert_eq!(macho.rpaths, vec!["@loader_path/lib", "@loader_path/../libs"]);
    }

    #[test]
    fn shrink_clears_stale_bytes() {
        let data = MachOBuilder::bundle(CPU_TYPE_X86_64)
            .dependency("/usr/local/lib/a-rather-long-library-name-for-testing.dylib")
            .build();
        let mut writer = MachOWriter::new(&data).unwrap();
        writer
            .change_dylib(
                "/usr/local/lib/a-rather-long-library-name-for-testing.dylib",
                "@rpath/a.dylib",
            )
            .unwrap();
        let out = writer.build().unwrap();
        let sizeofcmds = u32::from_le_bytes(out[20..24].try_into().unwrap()) as usize;
        assert!(out[32 + sizeofcmds..0x800].iter().all(|&byte| byte == 0));
        assert!(
            !out.windows(b"rather-long".len())
                .any(|window| window == b"rather-long")
        );
    }

    #[test]
    fn header_pad_exhausted() {
        let data = MachOBuilder::bundle(CPU_TYPE_X86_64)
            .dependency("/usr/local/lib/libfoo.dylib")
            .tight()
            .build();
        let mut writer = MachOWriter::new(&data).unwrap();
        writer
            .change_dylib(
                "/usr/local/lib/libfoo.dylib",
                "@loader_path/../../some/much/longer/path/to/libfoo.dylib",
            )
            .unwrap();
        let err = writer.build().unwrap_err();
        assert!(matches!(err, PatchError::HeaderPadExhausted { .. }));

        // Shorter names still fit.
        let mut writer = MachOWriter::new(&data).unwrap();
        writer
            .change_dylib("/usr/local/lib/libfoo.dylib", "@rpath/libfoo.dylib")
            .unwrap();
        writer.build().unwrap();
    }

    #[test]
    fn missing_install_id() {
        let data = MachOBuilder::bundle(CPU_TYPE_X86_64).build();
        let mut writer = MachOWriter::new(&data).unwrap();
        assert!(matches!(
            writer.set_install_id("@rpath/libfoo.dylib"),
            Err(PatchError::MissingInstallId)
        ));
    }
}
