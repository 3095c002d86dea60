//! Splitting and re-assembling fat (universal) Mach-O containers.

use goblin::mach::cputype::CPU_TYPE_ARM64;
use goblin::mach::fat::{FAT_MAGIC, SIZEOF_FAT_ARCH, SIZEOF_FAT_HEADER};
use goblin::mach::header::{MH_CIGAM, MH_CIGAM_64, MH_MAGIC, MH_MAGIC_64};
use scroll::{BE, Pread, Pwrite};

use crate::error::PatchError;

/// The 64-bit fat header magic, used when a slice lies beyond 4 GiB.
pub(crate) const FAT_MAGIC_64: u32 = 0xcafe_babf;
const SIZEOF_FAT_ARCH_64: usize = 32;

/// Java class files share `FAT_MAGIC`; they are told apart by the architecture count, which for a
/// class file is the version number and is always at least 0x2d.
const MAX_FAT_ARCHS: u32 = 0x2d;

/// A single architecture slice of a Mach-O file.
#[derive(Debug, Clone, Copy)]
pub struct Slice<'a> {
    pub cputype: u32,
    pub cpusubtype: u32,
    /// The offset of the slice within the file (zero for thin files).
    pub offset: u64,
    /// The alignment of the slice as a power of two.
    pub align: u32,
    pub data: &'a [u8],
}

/// The container layout of a Mach-O file.
#[derive(Debug)]
pub enum Container<'a> {
    Thin(Slice<'a>),
    Fat(Vec<Slice<'a>>),
}

impl<'a> Container<'a> {
    /// Split a file into its architecture slices.
    pub fn parse(data: &'a [u8]) -> Result<Self, PatchError> {
        let magic = data
            .pread_with::<u32>(0, BE)
            .map_err(|_| PatchError::UnsupportedFormat)?;
        match magic {
            FAT_MAGIC | FAT_MAGIC_64 => parse_fat(data, magic == FAT_MAGIC_64).map(Self::Fat),
            _ => {
                let (cputype, cpusubtype) = thin_cputype(data)?;
                Ok(Self::Thin(Slice {
                    cputype,
                    cpusubtype,
                    offset: 0,
                    align: default_align(cputype),
                    data,
                }))
            }
        }
    }

    pub fn slices(&self) -> &[Slice<'a>] {
        match self {
            Self::Thin(slice) => std::slice::from_ref(slice),
            Self::Fat(slices) => slices,
        }
    }

    pub fn is_fat(&self) -> bool {
        matches!(self, Self::Fat(_))
    }
}

/// Returns `true` if the bytes start with a fat header that plausibly belongs to a Mach-O file.
pub(crate) fn is_fat_header(data: &[u8]) -> bool {
    let Ok(magic) = data.pread_with::<u32>(0, BE) else {
        return false;
    };
    let Ok(count) = data.pread_with::<u32>(4, BE) else {
        return false;
    };
    matches!(magic, FAT_MAGIC | FAT_MAGIC_64) && count > 0 && count < MAX_FAT_ARCHS
}

fn thin_cputype(data: &[u8]) -> Result<(u32, u32), PatchError> {
    let magic = data
        .pread_with::<u32>(0, scroll::LE)
        .map_err(|_| PatchError::UnsupportedFormat)?;
    let endian = match magic {
        MH_MAGIC | MH_MAGIC_64 => scroll::LE,
        MH_CIGAM | MH_CIGAM_64 => scroll::BE,
        _ => return Err(PatchError::UnsupportedFormat),
    };
    let cputype = data
        .pread_with::<u32>(4, endian)
        .map_err(|err| PatchError::Malformed(err.to_string()))?;
    let cpusubtype = data
        .pread_with::<u32>(8, endian)
        .map_err(|err| PatchError::Malformed(err.to_string()))?;
    Ok((cputype, cpusubtype))
}

fn parse_fat(data: &[u8], is_64: bool) -> Result<Vec<Slice<'_>>, PatchError> {
    if !is_fat_header(data) {
        return Err(PatchError::UnsupportedFormat);
    }
    let count = data
        .pread_with::<u32>(4, BE)
        .map_err(|err| PatchError::Malformed(err.to_string()))?;

    let malformed = |err: scroll::Error| PatchError::Malformed(err.to_string());
    let mut slices = Vec::with_capacity(count as usize);
    let mut offset = SIZEOF_FAT_HEADER;
    for _ in 0..count {
        let cputype: u32 = data.gread_with(&mut offset, BE).map_err(malformed)?;
        let cpusubtype: u32 = data.gread_with(&mut offset, BE).map_err(malformed)?;
        let (start, size, align) = if is_64 {
            let start: u64 = data.gread_with(&mut offset, BE).map_err(malformed)?;
            let size: u64 = data.gread_with(&mut offset, BE).map_err(malformed)?;
            let align: u32 = data.gread_with(&mut offset, BE).map_err(malformed)?;
            // Reserved.
            offset += 4;
            (start, size, align)
        } else {
            let start: u32 = data.gread_with(&mut offset, BE).map_err(malformed)?;
            let size: u32 = data.gread_with(&mut offset, BE).map_err(malformed)?;
            let align: u32 = data.gread_with(&mut offset, BE).map_err(malformed)?;
            (u64::from(start), u64::from(size), align)
        };

        let range = usize::try_from(start)
            .ok()
            .zip(usize::try_from(start.saturating_add(size)).ok())
            .filter(|(_, end)| *end <= data.len())
            .ok_or_else(|| {
                PatchError::Malformed(format!(
                    "fat slice at offset {start} with size {size} exceeds the file"
                ))
            })?;
        slices.push(Slice {
            cputype,
            cpusubtype,
            offset: start,
            align,
            data: &data[range.0..range.1],
        });
    }
    Ok(slices)
}

/// The page alignment used for a slice of the given CPU type.
pub(crate) fn default_align(cputype: u32) -> u32 {
    if cputype == CPU_TYPE_ARM64 { 14 } else { 12 }
}

/// Build a fat file from the given slices, in order.
///
/// Slices are placed at increasing offsets honoring each slice's alignment. The 64-bit header
/// is used only when an offset or size does not fit in 32 bits.
pub(crate) fn assemble(slices: &[Slice<'_>]) -> Result<Vec<u8>, PatchError> {
    let count = u32::try_from(slices.len())
        .map_err(|_| PatchError::Malformed("too many slices".to_string()))?;

    let layout = |entry_size: usize| {
        let mut offsets = Vec::with_capacity(slices.len());
        let mut cursor = (SIZEOF_FAT_HEADER + entry_size * slices.len()) as u64;
        for slice in slices {
            let align = 1u64 << slice.align.min(31);
            cursor = cursor.next_multiple_of(align);
            offsets.push(cursor);
            cursor += slice.data.len() as u64;
        }
        (offsets, cursor)
    };

    let (mut offsets, mut total) = layout(SIZEOF_FAT_ARCH);
    let is_64 = total > u64::from(u32::MAX);
    if is_64 {
        (offsets, total) = layout(SIZEOF_FAT_ARCH_64);
    }

    let total = usize::try_from(total)
        .map_err(|_| PatchError::Malformed("fat file too large".to_string()))?;
    let mut out = vec![0u8; total];
    let scroll_err = |err: scroll::Error| PatchError::Malformed(err.to_string());
    let mut cursor = 0;
    out.gwrite_with(if is_64 { FAT_MAGIC_64 } else { FAT_MAGIC }, &mut cursor, BE)
        .map_err(scroll_err)?;
    out.gwrite_with(count, &mut cursor, BE).map_err(scroll_err)?;
    for (slice, &offset) in slices.iter().zip(&offsets) {
        out.gwrite_with(slice.cputype, &mut cursor, BE)
            .map_err(scroll_err)?;
        out.gwrite_with(slice.cpusubtype, &mut cursor, BE)
            .map_err(scroll_err)?;
        if is_64 {
            out.gwrite_with(offset, &mut cursor, BE).map_err(scroll_err)?;
            out.gwrite_with(slice.data.len() as u64, &mut cursor, BE)
                .map_err(scroll_err)?;
            out.gwrite_with(slice.align, &mut cursor, BE)
                .map_err(scroll_err)?;
            out.gwrite_with(0u32, &mut cursor, BE).map_err(scroll_err)?;
        } else {
            // Both fit: the total size is below 4 GiB.
            #[allow(clippy::cast_possible_truncation)]
            {
                out.gwrite_with(offset as u32, &mut cursor, BE)
                    .map_err(scroll_err)?;
                out.gwrite_with(slice.data.len() as u32, &mut cursor, BE)
                    .map_err(scroll_err)?;
            }
            out.gwrite_with(slice.align, &mut cursor, BE)
                .map_err(scroll_err)?;
        }
    }
    for (slice, offset) in slices.iter().zip(offsets) {
        #[allow(clippy::cast_possible_truncation)]
        let start = offset as usize;
        out[start..start + slice.data.len()].copy_from_slice(slice.data);
    }
    Ok(out)
}
