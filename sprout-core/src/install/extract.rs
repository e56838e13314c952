// sprout-core/src/install/extract.rs
use std::fs::{self, File};
use std::io::{self, Read, Seek};
use std::path::{Component, Path, PathBuf};

use bzip2::read::BzDecoder;
use flate2::read::GzDecoder;
use sprout_common::error::{Result, SproutError};
use tar::Archive;
use tracing::{debug, error};
use xz2::read::XzDecoder;
use zip::read::ZipArchive;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArchiveKind {
    TarGz,
    TarBz2,
    TarXz,
    Tar,
    Zip,
}

impl ArchiveKind {
    /// Infers the archive format from a file name such as `foo-macos-arm64.tar.gz`.
    pub fn from_file_name(name: &str) -> Option<Self> {
        let lower = name.to_ascii_lowercase();
        let kind = if lower.ends_with(".tar.gz") || lower.ends_with(".tgz") {
            Self::TarGz
        } else if lower.ends_with(".tar.bz2") || lower.ends_with(".tbz") || lower.ends_with(".tbz2")
        {
            Self::TarBz2
        } else if lower.ends_with(".tar.xz") || lower.ends_with(".txz") {
            Self::TarXz
        } else if lower.ends_with(".tar") {
            Self::Tar
        } else if lower.ends_with(".zip") {
            Self::Zip
        } else {
            return None;
        };
        Some(kind)
    }
}

/// Unpacks `archive_path` into `target_dir`, refusing entries that would land outside it.
pub fn extract_archive(archive_path: &Path, target_dir: &Path) -> Result<()> {
    let file_name = archive_path
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_default();
    let kind = ArchiveKind::from_file_name(&file_name).ok_or_else(|| {
        SproutError::Generic(format!(
            "Unsupported archive type for {}",
            archive_path.display()
        ))
    })?;
    debug!(
        "Extracting archive '{}' ({:?}) to '{}'",
        archive_path.display(),
        kind,
        target_dir.display()
    );

    fs::create_dir_all(target_dir)?;
    let file = File::open(archive_path)?;

    match kind {
        ArchiveKind::Zip => extract_zip_archive(file, target_dir, archive_path),
        ArchiveKind::TarGz => extract_tar_archive(GzDecoder::new(file), target_dir, archive_path),
        ArchiveKind::TarBz2 => extract_tar_archive(BzDecoder::new(file), target_dir, archive_path),
        ArchiveKind::TarXz => extract_tar_archive(XzDecoder::new(file), target_dir, archive_path),
        ArchiveKind::Tar => extract_tar_archive(file, target_dir, archive_path),
    }
}

fn checked_relative_path(raw: &Path, archive_path_for_log: &Path) -> Result<Option<PathBuf>> {
    let mut relative = PathBuf::new();
    for comp in raw.components() {
        match comp {
            Component::Normal(p) => relative.push(p),
            Component::CurDir => {}
            Component::ParentDir | Component::Prefix(_) | Component::RootDir => {
                let msg = format!(
                    "Unsafe component {:?} in path {} within {}",
                    comp,
                    raw.display(),
                    archive_path_for_log.display()
                );
                error!("{}", msg);
                return Err(SproutError::Generic(msg));
            }
        }
    }
    if relative.as_os_str().is_empty() {
        return Ok(None);
    }
    Ok(Some(relative))
}

fn extract_tar_archive<R: Read>(
    reader: R,
    target_dir: &Path,
    archive_path_for_log: &Path,
) -> Result<()> {
    let mut archive = Archive::new(reader);
    archive.set_preserve_permissions(true);
    archive.set_overwrite(true);

    for entry_result in archive.entries()? {
        let mut entry = entry_result.map_err(|e| {
            SproutError::Generic(format!(
                "Error reading TAR entry from {}: {}",
                archive_path_for_log.display(),
                e
            ))
        })?;
        let original_path = entry
            .path()
            .map_err(|e| {
                SproutError::Generic(format!(
                    "Invalid path in TAR entry from {}: {}",
                    archive_path_for_log.display(),
                    e
                ))
            })?
            .into_owned();
        if checked_relative_path(&original_path, archive_path_for_log)?.is_none() {
            continue;
        }
        // unpack_in re-validates the path and link targets against target_dir.
        let unpacked = entry.unpack_in(target_dir).map_err(|e| {
            SproutError::Generic(format!(
                "Failed to unpack {} from {}: {}",
                original_path.display(),
                archive_path_for_log.display(),
                e
            ))
        })?;
        if !unpacked {
            return Err(SproutError::Generic(format!(
                "Refused to unpack {} outside of {}",
                original_path.display(),
                target_dir.display()
            )));
        }
    }

    debug!("Finished TAR extraction for {}", archive_path_for_log.display());
    Ok(())
}

fn extract_zip_archive<R: Read + Seek>(
    reader: R,
    target_dir: &Path,
    archive_path_for_log: &Path,
) -> Result<()> {
    let mut archive = ZipArchive::new(reader).map_err(|e| {
        SproutError::Generic(format!(
            "Failed to open ZIP {}: {}",
            archive_path_for_log.display(),
            e
        ))
    })?;

    for i in 0..archive.len() {
        let mut file = archive.by_index(i).map_err(|e| {
            SproutError::Generic(format!(
                "Error reading ZIP index {} in {}: {}",
                i,
                archive_path_for_log.display(),
                e
            ))
        })?;
        let raw = PathBuf::from(file.name());
        let Some(relative) = checked_relative_path(&raw, archive_path_for_log)? else {
            continue;
        };
        let out_path = target_dir.join(relative);

        if file.is_dir() {
            fs::create_dir_all(&out_path)?;
            continue;
        }
        if let Some(parent) = out_path.parent() {
            fs::create_dir_all(parent)?;
        }
        let mut outfile = File::create(&out_path)?;
        io::copy(&mut file, &mut outfile)?;

        #[cfg(unix)]
        if let Some(mode) = file.unix_mode() {
            use std::os::unix::fs::PermissionsExt;
            fs::set_permissions(&out_path, fs::Permissions::from_mode(mode))?;
        }
    }

    debug!("Finished ZIP extraction for {}", archive_path_for_log.display());
    Ok(())
}

/// Directory that install sources are relative to: the sole top-level directory of the
/// extracted tree if there is exactly one entry and it is a directory, else the tree itself.
pub fn source_root(extracted: &Path) -> Result<PathBuf> {
    let entries: Vec<_> = fs::read_dir(extracted)?.collect::<io::Result<Vec<_>>>()?;
    if let [only] = entries.as_slice() {
        if only.file_type()?.is_dir() {
            debug!("Archive has a single root directory: {}", only.path().display());
            return Ok(only.path());
        }
    }
    Ok(extracted.to_path_buf())
}

#[cfg(test)]
mod tests {
    use flate2::write::GzEncoder;
    use flate2::Compression;
    use tempfile::TempDir;

    use super::*;

    fn tar_gz(path: &Path, entries: &[(&str, &[u8])]) {
        let file = File::create(path).unwrap();
        let mut builder = tar::Builder::new(GzEncoder::new(file, Compression::default()));
        for (name, data) in entries {
            let mut header = tar::Header::new_gnu();
            header.set_size(data.len() as u64);
            header.set_mode(0o755);
            header.set_cksum();
            builder.append_data(&mut header, name, *data).unwrap();
        }
        builder.into_inner().unwrap().finish().unwrap();
    }

    #[test]
    fn kinds_from_names() {
        assert_eq!(ArchiveKind::from_file_name("a-macos-arm64.tar.gz"), Some(ArchiveKind::TarGz));
        assert_eq!(ArchiveKind::from_file_name("A.TGZ"), Some(ArchiveKind::TarGz));
        assert_eq!(ArchiveKind::from_file_name("a.tar.xz"), Some(ArchiveKind::TarXz));
        assert_eq!(ArchiveKind::from_file_name("a.zip"), Some(ArchiveKind::Zip));
        assert_eq!(ArchiveKind::from_file_name("a.dmg"), None);
    }

    #[test]
    fn extracts_and_finds_single_root() {
        let dir = TempDir::new().unwrap();
        let archive = dir.path().join("pkg.tar.gz");
        tar_gz(&archive, &[("pkg-0.5.1/tool", b"#!/bin/sh\necho hi\n")]);
        let out = dir.path().join("out");

        extract_archive(&archive, &out).unwrap();
        let root = source_root(&out).unwrap();
        assert_eq!(root, out.join("pkg-0.5.1"));
        assert!(root.join("tool").is_file());
    }

    #[test]
    fn flat_archive_root_is_the_tree() {
        let dir = TempDir::new().unwrap();
        let archive = dir.path().join("pkg.tgz");
        tar_gz(&archive, &[("a", b"1"), ("b", b"2")]);
        let out = dir.path().join("out");

        extract_archive(&archive, &out).unwrap();
        assert_eq!(source_root(&out).unwrap(), out);
    }

    #[test]
    fn parent_components_are_rejected() {
        let raw = Path::new("../../etc/passwd");
        assert!(checked_relative_path(raw, Path::new("x.tar")).is_err());
        assert_eq!(
            checked_relative_path(Path::new("./bin/tool"), Path::new("x.tar")).unwrap(),
            Some(PathBuf::from("bin/tool"))
        );
    }

    #[test]
    fn unknown_format_fails() {
        let dir = TempDir::new().unwrap();
        let archive = dir.path().join("pkg.dmg");
        fs::write(&archive, b"nope").unwrap();
        assert!(extract_archive(&archive, &dir.path().join("out")).is_err());
    }
}
