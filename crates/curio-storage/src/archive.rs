//! Archive-safety gate and tar extraction.
//!
//! Every entry is validated before anything is written: an archive with a
//! single entry resolving outside the destination is rejected as a whole.

use std::fs::{self, File};
use std::io::Read;
use std::path::{Component, Path, PathBuf};

use curio_core::CurioError;
use flate2::read::GzDecoder;
use tar::{Archive, EntryType};
use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArchiveKind {
    Tar,
    TarGz,
}

impl ArchiveKind {
    pub fn detect(path: &Path) -> Option<Self> {
        let name = path.file_name()?.to_string_lossy().to_ascii_lowercase();
        if name.ends_with(".tar.gz") || name.ends_with(".tgz") {
            Some(ArchiveKind::TarGz)
        } else if name.ends_with(".tar") {
            Some(ArchiveKind::Tar)
        } else {
            None
        }
    }
}

/// Resolve `entry` lexically under `dest`, rejecting anything that escapes it.
pub fn safe_entry_path(dest: &Path, entry: &Path) -> Result<PathBuf, CurioError> {
    let normalized = normalize_relative(entry).ok_or_else(|| {
        CurioError::integrity(format!(
            "archive entry {} escapes destination {}",
            entry.display(),
            dest.display()
        ))
    })?;
    Ok(dest.join(normalized))
}

fn normalize_relative(entry: &Path) -> Option<PathBuf> {
    let mut parts: Vec<&std::ffi::OsStr> = Vec::new();
    for component in entry.components() {
        match component {
            Component::Normal(part) => parts.push(part),
            Component::CurDir => {}
            Component::ParentDir => {
                parts.pop()?;
            }
            Component::RootDir | Component::Prefix(_) => return None,
        }
    }
    if parts.is_empty() {
        return None;
    }
    Some(parts.iter().collect())
}

fn open_archive(path: &Path, kind: ArchiveKind) -> Result<Archive<Box<dyn Read>>, CurioError> {
    let file = File::open(path).map_err(|e| CurioError::io(path.display(), e))?;
    let reader: Box<dyn Read> = match kind {
        ArchiveKind::Tar => Box::new(file),
        ArchiveKind::TarGz => Box::new(GzDecoder::new(file)),
    };
    Ok(Archive::new(reader))
}

fn check_link(entry_rel: &Path, link: &Path, kind: EntryType) -> Result<(), CurioError> {
    if link.is_absolute() {
        return Err(CurioError::integrity(format!(
            "archive link {} points to absolute path {}",
            entry_rel.display(),
            link.display()
        )));
    }
    // Symlinks resolve relative to their own directory, hard links to the archive root.
    let base = if kind == EntryType::Symlink {
        entry_rel.parent().map(Path::to_path_buf).unwrap_or_default()
    } else {
        PathBuf::new()
    };
    if normalize_relative(&base.join(link)).is_none() {
        return Err(CurioError::integrity(format!(
            "archive link {} -> {} escapes destination",
            entry_rel.display(),
            link.display()
        )));
    }
    Ok(())
}

/// First pass: walk every entry and fail on the first unsafe one.
pub fn validate_archive(path: &Path, dest: &Path) -> Result<Vec<PathBuf>, CurioError> {
    let kind = ArchiveKind::detect(path).ok_or_else(|| {
        CurioError::integrity(format!("{} is not a supported archive", path.display()))
    })?;
    let mut archive = open_archive(path, kind)?;
    let entries = archive
        .entries()
        .map_err(|e| CurioError::integrity(format!("reading archive {}: {e}", path.display())))?;

    let mut planned = Vec::new();
    for entry in entries {
        let entry = entry
            .map_err(|e| CurioError::integrity(format!("reading archive {}: {e}", path.display())))?;
        let raw = entry
            .path()
            .map_err(|e| CurioError::integrity(format!("bad entry path in {}: {e}", path.display())))?
            .into_owned();
        let resolved = safe_entry_path(dest, &raw)?;
        let entry_type = entry.header().entry_type();
        if matches!(entry_type, EntryType::Symlink | EntryType::Link) {
            let link = entry
                .link_name()
                .map_err(|e| CurioError::integrity(format!("bad link in {}: {e}", path.display())))?
                .ok_or_else(|| {
                    CurioError::integrity(format!("link entry {} has no target", raw.display()))
                })?;
            check_link(&raw, &link, entry_type)?;
        }
        planned.push(resolved);
    }
    Ok(planned)
}

/// Validate, then extract into `dest`. Returns the regular files written.
pub fn extract_archive(path: &Path, dest: &Path) -> Result<Vec<PathBuf>, CurioError> {
    validate_archive(path, dest)?;
    let kind = ArchiveKind::detect(path).ok_or_else(|| {
        CurioError::integrity(format!("{} is not a supported archive", path.display()))
    })?;

    fs::create_dir_all(dest).map_err(|e| CurioError::io(dest.display(), e))?;
    let mut archive = open_archive(path, kind)?;
    let entries = archive
        .entries()
        .map_err(|e| CurioError::integrity(format!("reading archive {}: {e}", path.display())))?;

    let mut written = Vec::new();
    for entry in entries {
        let mut entry = entry
            .map_err(|e| CurioError::integrity(format!("reading archive {}: {e}", path.display())))?;
        let raw = entry
            .path()
            .map_err(|e| CurioError::integrity(format!("bad entry path in {}: {e}", path.display())))?
            .into_owned();
        let out = safe_entry_path(dest, &raw)?;
        let entry_type = entry.header().entry_type();
        if entry_type.is_dir() {
            fs::create_dir_all(&out).map_err(|e| CurioError::io(out.display(), e))?;
            continue;
        }
        if let Some(parent) = out.parent() {
            fs::create_dir_all(parent).map_err(|e| CurioError::io(parent.display(), e))?;
        }
        entry
            .unpack(&out)
            .map_err(|e| CurioError::io(format!("unpacking {}", out.display()), e))?;
        if entry_type.is_file() {
            written.push(out);
        }
    }
    debug!(archive = %path.display(), files = written.len(), "extracted archive");
    Ok(written)
}

#[cfg(test)]
mod tests {
    use super::*;
    use flate2::write::GzEncoder;
    use flate2::Compression;
    use tempfile::tempdir;

    fn raw_entry_header(name: &[u8], size: u64) -> tar::Header {
        let mut header = tar::Header::new_old();
        header.as_old_mut().name[..name.len()].copy_from_slice(name);
        header.set_size(size);
        header.set_mode(0o644);
        header.set_entry_type(EntryType::Regular);
        header.set_cksum();
        header
    }

    fn write_tar_gz(path: &Path, entries: &[(&[u8], &[u8])]) {
        let file = File::create(path).unwrap();
        let encoder = GzEncoder::new(file, Compression::default());
        let mut builder = tar::Builder::new(encoder);
        for (name, data) in entries {
            let header = raw_entry_header(name, data.len() as u64);
            builder.append(&header, *data).unwrap();
        }
        builder.into_inner().unwrap().finish().unwrap();
    }

    #[test]
    fn safe_entry_path_rejects_escapes() {
        let dest = Path::new("/data/raw/t1");
        assert!(safe_entry_path(dest, Path::new("../evil")).is_err());
        assert!(safe_entry_path(dest, Path::new("a/../../evil")).is_err());
        assert!(safe_entry_path(dest, Path::new("/etc/passwd")).is_err());
        assert_eq!(
            safe_entry_path(dest, Path::new("./a/b/../c.txt")).unwrap(),
            dest.join("a/c.txt")
        );
    }

    #[test]
    fn extraction_rejects_traversal_before_writing_anything() {
        let dir = tempdir().unwrap();
        let archive = dir.path().join("bundle.tar.gz");
        write_tar_gz(
            &archive,
            &[(b"good.txt", b"fine"), (b"../evil.txt", b"evil")],
        );
        let dest = dir.path().join("out");

        let err = extract_archive(&archive, &dest).unwrap_err();
        assert!(matches!(err, CurioError::Integrity(_)));
        assert!(!dest.join("good.txt").exists());
        assert!(!dir.path().join("evil.txt").exists());
    }

    #[test]
    fn extraction_writes_nested_files() {
        let dir = tempdir().unwrap();
        let archive = dir.path().join("bundle.tgz");
        write_tar_gz(&archive, &[(b"docs/a.txt", b"alpha"), (b"b.txt", b"beta")]);
        let dest = dir.path().join("out");

        let written = extract_archive(&archive, &dest).unwrap();
        assert_eq!(written.len(), 2);
        assert_eq!(fs::read_to_string(dest.join("docs/a.txt")).unwrap(), "alpha");
    }

    #[test]
    fn escaping_symlink_is_rejected() {
        let err = check_link(Path::new("a/link"), Path::new("../../etc"), EntryType::Symlink)
            .unwrap_err();
        assert!(matches!(err, CurioError::Integrity(_)));
        assert!(check_link(Path::new("a/link"), Path::new("../b.txt"), EntryType::Symlink).is_ok());
    }
}
