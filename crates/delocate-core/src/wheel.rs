//! Python wheel file operations.
//!
//! Provides functionality for unpacking, modifying, and repacking wheel files,
//! including RECORD file updates.

use std::collections::BTreeSet;
use std::io::{self, Read};
use std::path::{Path, PathBuf};

use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use fs_err as fs;
use fs_err::File;
use serde::Serialize;
use sha2::{Digest, Sha256};
use tracing::{debug, trace};
use walkdir::WalkDir;
use zip::write::FileOptions;
use zip::{ZipArchive, ZipWriter};

use delocate_platform::PlatformTag;

use crate::delocate::parse_wheel_path;
use crate::error::DelocateError;
use crate::fuse;

/// Unpack a wheel to a directory.
///
/// Unix permissions stored in the archive are restored.
pub fn unpack_wheel(wheel_path: &Path, dest_dir: &Path) -> Result<(), DelocateError> {
    let file = File::open(wheel_path)?;
    let mut archive = ZipArchive::new(file)?;

    for index in 0..archive.len() {
        let mut entry = archive.by_index(index)?;
        let Some(relative) = entry.enclosed_name() else {
            return Err(DelocateError::PathNotInWheel {
                path: PathBuf::from(entry.name()),
                wheel_dir: dest_dir.to_path_buf(),
            });
        };
        let path = dest_dir.join(relative);

        if entry.is_dir() {
            fs::create_dir_all(&path)?;
            continue;
        }
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }

        let mut out = File::create(&path)?;
        io::copy(&mut entry, &mut out)?;

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            if let Some(mode) = entry.unix_mode() {
                fs::set_permissions(&path, std::fs::Permissions::from_mode(mode & 0o777))?;
            }
        }
    }

    Ok(())
}

/// Repack a directory into a wheel file.
///
/// Entries are sorted, with the `.dist-info` directory last. The wheel is written to a temporary
/// file next to `wheel_path` and then moved into place.
pub fn pack_wheel(source_dir: &Path, wheel_path: &Path) -> Result<(), DelocateError> {
    let parent = wheel_path
        .parent()
        .filter(|parent| !parent.as_os_str().is_empty())
        .unwrap_or(Path::new("."));
    let temp = tempfile::NamedTempFile::new_in(parent)?;
    let mut zip = ZipWriter::new(temp.as_file());

    let options = FileOptions::<()>::default()
        .compression_method(zip::CompressionMethod::Deflated)
        .unix_permissions(0o644);

    let walkdir = WalkDir::new(source_dir);
    let mut paths = Vec::new();
    for entry in walkdir {
        let entry = entry?;
        if !entry.file_type().is_file() {
            continue;
        }
        let relative = entry
            .path()
            .strip_prefix(source_dir)
            .map_err(|_| DelocateError::PathNotInWheel {
                path: entry.path().to_path_buf(),
                wheel_dir: source_dir.to_path_buf(),
            })?
            .to_string_lossy()
            .replace('\\', "/");
        paths.push((relative, entry.into_path()));
    }

    // Sort for reproducibility, with the metadata (and its `RECORD`) at the end.
    paths.sort_by(|(a, _), (b, _)| {
        (is_dist_info(a), a.as_str()).cmp(&(is_dist_info(b), b.as_str()))
    });

    for (relative, path) in paths {
        // Determine permissions.
        #[cfg(unix)]
        let options = {
            use std::os::unix::fs::PermissionsExt;
            let metadata = fs::metadata(&path)?;
            let mode = metadata.permissions().mode();
            options.unix_permissions(mode)
        };

        trace!("Adding {relative}");
        zip.start_file(relative, options)?;

        let mut f = File::open(&path)?;
        io::copy(&mut f, &mut zip)?;
    }

    zip.finish()?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        fs::set_permissions(temp.path(), std::fs::Permissions::from_mode(0o644))?;
    }
    temp.persist(wheel_path).map_err(|err| err.error)?;
    Ok(())
}

fn is_dist_info(relative: &str) -> bool {
    relative
        .split('/')
        .next()
        .is_some_and(|top| top.ends_with(".dist-info"))
}

/// Compute the SHA256 hash of a file in the format used by RECORD files.
fn hash_file(path: &Path) -> Result<(String, u64), DelocateError> {
    let mut file = File::open(path)?;
    let mut hasher = Sha256::new();
    let mut buffer = [0u8; 8192];
    let mut size = 0u64;

    loop {
        let n = file.read(&mut buffer)?;
        if n == 0 {
            break;
        }
        hasher.update(&buffer[..n]);
        size += n as u64;
    }

    let hash = hasher.finalize();
    let hash_str = format!("sha256={}", URL_SAFE_NO_PAD.encode(hash));

    Ok((hash_str, size))
}

/// A single entry in a RECORD file.
///
/// See: <https://packaging.python.org/en/latest/specifications/recording-installed-packages/#the-record-file>
#[derive(Serialize, PartialOrd, PartialEq, Ord, Eq)]
struct RecordEntry {
    path: String,
    hash: Option<String>,
    size: Option<u64>,
}

/// Update the RECORD file in a wheel directory.
pub fn update_record(wheel_dir: &Path, dist_info_dir: &str) -> Result<(), DelocateError> {
    let record_path = wheel_dir.join(dist_info_dir).join("RECORD");
    let record_name = format!("{dist_info_dir}/RECORD");

    let mut records = vec![RecordEntry {
        path: record_name.clone(),
        hash: None,
        size: None,
    }];

    for entry in WalkDir::new(wheel_dir) {
        let entry = entry?;
        if !entry.file_type().is_file() {
            continue;
        }

        let path = entry.path();
        let relative = path
            .strip_prefix(wheel_dir)
            .map_err(|_| DelocateError::PathNotInWheel {
                path: path.to_path_buf(),
                wheel_dir: wheel_dir.to_path_buf(),
            })?;

        let relative_str = relative.to_string_lossy().replace('\\', "/");

        // RECORD file itself has no hash.
        if relative_str == record_name {
            continue;
        }
        let (hash, size) = hash_file(path)?;
        records.push(RecordEntry {
            path: relative_str,
            hash: Some(hash),
            size: Some(size),
        });
    }

    // Sort for reproducibility.
    records.sort();

    let mut writer = csv::WriterBuilder::new()
        .has_headers(false)
        .escape(b'"')
        .from_path(&record_path)?;
    for record in records {
        writer.serialize(record)?;
    }
    writer.flush()?;

    Ok(())
}

/// Find the .dist-info directory in an unpacked wheel.
pub fn find_dist_info(wheel_dir: &Path) -> Result<String, DelocateError> {
    let mut entries = fs::read_dir(wheel_dir)?.collect::<Result<Vec<_>, _>>()?;
    entries.sort_by_key(fs::DirEntry::file_name);

    for entry in entries {
        let name = entry.file_name();
        let name_str = name.to_string_lossy();
        if name_str.ends_with(".dist-info") && entry.file_type()?.is_dir() {
            return Ok(name_str.into_owned());
        }
    }

    Err(DelocateError::MissingDistInfo)
}

/// Add `Tag` lines to the `WHEEL` metadata file, returning `true` if it changed.
///
/// With `replace`, the existing `Tag` lines are removed first.
pub fn write_wheel_tags(
    wheel_dir: &Path,
    dist_info_dir: &str,
    tags: &[String],
    replace: bool,
) -> Result<bool, DelocateError> {
    let path = wheel_dir.join(dist_info_dir).join("WHEEL");
    let contents = fs::read_to_string(&path)?;

    let mut lines = contents
        .lines()
        .filter(|line| !(replace && line.starts_with("Tag:")))
        .map(ToString::to_string)
        .collect::<Vec<_>>();
    while lines.last().is_some_and(|line| line.trim().is_empty()) {
        lines.pop();
    }
    let existing = lines
        .iter()
        .filter_map(|line| line.strip_prefix("Tag:"))
        .map(|tag| tag.trim().to_string())
        .collect::<BTreeSet<_>>();

    for tag in tags {
        if !existing.contains(tag) {
            lines.push(format!("Tag: {tag}"));
        }
    }

    let mut updated = lines.join("\n");
    updated.push('\n');
    if updated == contents {
        return Ok(false);
    }
    fs::write(&path, updated)?;
    Ok(true)
}

/// Read the `Tag` lines of a wheel's `WHEEL` metadata file.
pub fn read_wheel_tags(
    wheel_dir: &Path,
    dist_info_dir: &str,
) -> Result<Vec<String>, DelocateError> {
    let contents = fs::read_to_string(wheel_dir.join(dist_info_dir).join("WHEEL"))?;
    Ok(contents
        .lines()
        .filter_map(|line| line.strip_prefix("Tag:"))
        .map(|tag| tag.trim().to_string())
        .collect())
}

/// Fuse two wheels built for different architectures, writing the result to `out_dir`.
///
/// The result is named after `to_wheel` with the union of both wheels' platform tags, and its
/// `WHEEL` file carries the union of both `Tag` sets. The `RECORD` files of both inputs are
/// discarded and regenerated for the result. Returns the path of the fused wheel.
pub fn fuse_wheels(
    to_wheel: &Path,
    from_wheel: &Path,
    out_dir: &Path,
) -> Result<PathBuf, DelocateError> {
    let to_filename = parse_wheel_path(to_wheel)?;
    let from_filename = parse_wheel_path(from_wheel)?;
    let platform_tags = to_filename
        .platform_tags()
        .iter()
        .chain(from_filename.platform_tags())
        .cloned()
        .collect::<BTreeSet<_>>()
        .into_iter()
        .collect::<Vec<_>>();
    let out_wheel = out_dir.join(to_filename.with_platform_tags(&platform_tags).to_string());

    debug!(
        "Fusing {} and {} into {}",
        to_wheel.display(),
        from_wheel.display(),
        out_wheel.display()
    );
    let to_dir = tempfile::tempdir()?;
    let from_dir = tempfile::tempdir()?;
    let out_tree = tempfile::tempdir()?;

    // `WHEEL` and `RECORD` differ between architectures; they are merged and regenerated below.
    let mut tags = BTreeSet::new();
    let mut metadata = None;
    let mut dist_infos = Vec::new();
    for (wheel, dir) in [(to_wheel, to_dir.path()), (from_wheel, from_dir.path())] {
        unpack_wheel(wheel, dir)?;
        let dist_info = find_dist_info(dir)?;
        let record = dir.join(&dist_info).join("RECORD");
        if record.exists() {
            fs::remove_file(record)?;
        }
        let wheel_file = dir.join(&dist_info).join("WHEEL");
        if wheel_file.exists() {
            tags.extend(read_wheel_tags(dir, &dist_info)?);
            let contents = fs::read_to_string(&wheel_file)?;
            metadata.get_or_insert(contents);
            fs::remove_file(wheel_file)?;
        }
        dist_infos.push(dist_info);
    }

    fuse::fuse_trees(to_dir.path(), from_dir.path(), out_tree.path())?;

    // The metadata directory may be empty after removing `WHEEL` and `RECORD`.
    let dist_info = dist_infos.swap_remove(0);
    fs::create_dir_all(out_tree.path().join(&dist_info))?;
    if let Some(metadata) = metadata {
        fs::write(out_tree.path().join(&dist_info).join("WHEEL"), metadata)?;
        let tags = tags.into_iter().collect::<Vec<_>>();
        write_wheel_tags(out_tree.path(), &dist_info, &tags, true)?;
    }
    update_record(out_tree.path(), &dist_info)?;
    fs::create_dir_all(out_dir)?;
    pack_wheel(out_tree.path(), &out_wheel)?;
    Ok(out_wheel)
}

/// Add platform tags to a wheel's filename and `WHEEL` metadata.
///
/// The result is written to `out_dir`, and its path is returned. Returns `None` if the wheel
/// already carries every tag.
pub fn add_platforms(
    wheel_path: &Path,
    tags: &[PlatformTag],
    out_dir: &Path,
    clobber: bool,
) -> Result<Option<PathBuf>, DelocateError> {
    let filename = parse_wheel_path(wheel_path)?;
    if tags.is_empty() {
        return Err(DelocateError::MissingPlatformTags);
    }
    if filename.is_pure() {
        return Err(DelocateError::PureWheel {
            filename: filename.to_string(),
        });
    }

    let mut platform_tags = filename.platform_tags().to_vec();
    for tag in tags {
        if !platform_tags.contains(tag) {
            platform_tags.push(tag.clone());
        }
    }
    let output_filename = filename.with_platform_tags(&platform_tags);
    let output_path = out_dir.join(output_filename.to_string());
    let renamed = output_filename != filename;

    if renamed && output_path.exists() && !clobber {
        return Err(DelocateError::WheelExists { path: output_path });
    }

    let temp_dir = tempfile::tempdir()?;
    let wheel_dir = temp_dir.path();
    unpack_wheel(wheel_path, wheel_dir)?;
    let dist_info = find_dist_info(wheel_dir)?;
    let tags_changed =
        write_wheel_tags(wheel_dir, &dist_info, &output_filename.expanded_tags(), false)?;

    if !renamed && !tags_changed {
        debug!("{filename} already has the requested tags");
        return Ok(None);
    }

    update_record(wheel_dir, &dist_info)?;
    fs::create_dir_all(out_dir)?;
    pack_wheel(wheel_dir, &output_path)?;
    Ok(Some(output_path))
}
