use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use flate2::read::GzDecoder;
use zip::ZipArchive;

use crate::error::AtomsError;
use crate::store::atomic_rename_dir;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArchiveKind {
    Zip,
    Tar,
    TarGz,
}

impl ArchiveKind {
    pub fn detect(path: &Path) -> Option<Self> {
        let name = path.file_name()?.to_str()?.to_ascii_lowercase();
        if name.ends_with(".zip") {
            Some(ArchiveKind::Zip)
        } else if name.ends_with(".tar.gz") || name.ends_with(".tgz") {
            Some(ArchiveKind::TarGz)
        } else if name.ends_with(".tar") {
            Some(ArchiveKind::Tar)
        } else {
            None
        }
    }
}

/// Unpacks `archive` into a sibling `<file name>-extracted` directory and
/// returns it. An existing extraction is reused as-is.
pub fn unpack_archive(archive: &Path) -> Result<PathBuf, AtomsError> {
    let file_name = archive
        .file_name()
        .and_then(|name| name.to_str())
        .ok_or_else(|| {
            AtomsError::Filesystem(format!("invalid archive path {}", archive.display()))
        })?;
    let parent = archive.parent().unwrap_or_else(|| Path::new("."));
    let extract_to = parent.join(format!("{file_name}-extracted"));
    if extract_to.exists() {
        tracing::debug!(path = %extract_to.display(), "reusing extracted archive");
        return Ok(extract_to);
    }

    let kind = ArchiveKind::detect(archive).ok_or_else(|| {
        AtomsError::Filesystem(format!("unsupported archive format: {}", archive.display()))
    })?;
    tracing::info!(archive = %archive.display(), "unpacking");

    let staging = tempfile::Builder::new()
        .prefix(".load-atoms-extract")
        .tempdir_in(parent)
        .map_err(|err| AtomsError::Filesystem(err.to_string()))?;
    match kind {
        ArchiveKind::Zip => extract_zip(archive, staging.path())?,
        ArchiveKind::Tar => extract_tar(archive, staging.path(), false)?,
        ArchiveKind::TarGz => extract_tar(archive, staging.path(), true)?,
    }
    let staging = staging.keep();
    atomic_rename_dir(&staging, &extract_to)
        .map_err(|err| AtomsError::Filesystem(err.to_string()))?;
    Ok(extract_to)
}

pub fn extract_zip(zip_path: &Path, target_dir: &Path) -> Result<(), AtomsError> {
    let file = fs::File::open(zip_path)
        .map_err(|err| AtomsError::Filesystem(format!("open zip {}: {err}", zip_path.display())))?;
    let mut archive =
        ZipArchive::new(file).map_err(|err| AtomsError::Filesystem(err.to_string()))?;

    for i in 0..archive.len() {
        let mut entry = archive
            .by_index(i)
            .map_err(|err| AtomsError::Filesystem(err.to_string()))?;
        let entry_path = match entry.enclosed_name() {
            Some(path) => target_dir.join(path),
            None => {
                return Err(AtomsError::Filesystem(
                    "zip entry path traversal detected".to_string(),
                ));
            }
        };

        if entry.is_dir() {
            fs::create_dir_all(&entry_path)
                .map_err(|err| AtomsError::Filesystem(err.to_string()))?;
            continue;
        }

        if let Some(parent) = entry_path.parent() {
            fs::create_dir_all(parent).map_err(|err| AtomsError::Filesystem(err.to_string()))?;
        }
        let mut outfile =
            fs::File::create(&entry_path).map_err(|err| AtomsError::Filesystem(err.to_string()))?;
        io::copy(&mut entry, &mut outfile).map_err(|err| AtomsError::Filesystem(err.to_string()))?;
    }
    Ok(())
}

pub fn extract_tar(tar_path: &Path, target_dir: &Path, gzipped: bool) -> Result<(), AtomsError> {
    let file = fs::File::open(tar_path)
        .map_err(|err| AtomsError::Filesystem(format!("open tar {}: {err}", tar_path.display())))?;
    fs::create_dir_all(target_dir).map_err(|err| AtomsError::Filesystem(err.to_string()))?;
    let result = if gzipped {
        tar::Archive::new(GzDecoder::new(file)).unpack(target_dir)
    } else {
        tar::Archive::new(file).unpack(target_dir)
    };
    result.map_err(|err| AtomsError::Filesystem(format!("unpack {}: {err}", tar_path.display())))
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use flate2::Compression;
    use flate2::write::GzEncoder;

    use super::*;

    fn write_tar_gz(path: &Path, entries: &[(&str, &str)]) {
        let file = fs::File::create(path).unwrap();
        let encoder = GzEncoder::new(file, Compression::default());
        let mut builder = tar::Builder::new(encoder);
        for (name, body) in entries {
            let mut header = tar::Header::new_gnu();
            header.set_size(body.len() as u64);
            header.set_mode(0o644);
            header.set_cksum();
            builder.append_data(&mut header, name, body.as_bytes()).unwrap();
        }
        builder.into_inner().unwrap().finish().unwrap();
    }

    #[test]
    fn unpacks_tar_gz_once() {
        let temp = tempfile::tempdir().unwrap();
        let archive = temp.path().join("data.tar.gz");
        write_tar_gz(&archive, &[("run/a.jsonl", "{}"), ("run/b.jsonl", "{}")]);

        let extracted = unpack_archive(&archive).unwrap();
        assert_eq!(extracted, temp.path().join("data.tar.gz-extracted"));
        assert!(extracted.join("run/a.jsonl").exists());

        fs::remove_file(extracted.join("run/b.jsonl")).unwrap();
        let again = unpack_archive(&archive).unwrap();
        assert_eq!(again, extracted);
        assert!(!again.join("run/b.jsonl").exists());
    }

    #[test]
    fn unpacks_zip() {
        let temp = tempfile::tempdir().unwrap();
        let archive = temp.path().join("data.zip");
        {
            let file = fs::File::create(&archive).unwrap();
            let mut writer = zip::ZipWriter::new(file);
            writer
                .start_file("inner/x.txt", zip::write::SimpleFileOptions::default())
                .unwrap();
            writer.write_all(b"x").unwrap();
            writer.finish().unwrap();
        }
        let extracted = unpack_archive(&archive).unwrap();
        assert_eq!(fs::read_to_string(extracted.join("inner/x.txt")).unwrap(), "x");
    }

    #[test]
    fn rejects_unknown_formats() {
        let temp = tempfile::tempdir().unwrap();
        let archive = temp.path().join("data.rar");
        fs::write(&archive, b"nope").unwrap();
        assert!(unpack_archive(&archive).is_err());
    }
}
