//! On-disk layout of the storage root
//!
//! ```text
//! {root}/records.json                              chapter record index
//! {root}/chapters/{content}/{chapter}/NNNN-{md5}.{ext}  finalized pages
//! {root}/staging/{content}/{chapter}/NNNN-{md5}.{ext}   chapters in progress
//! ```
//!
//! Content ids and chapter labels are sanitized into single path segments.
//! When sanitizing changes a value, a short digest of the original is
//! appended so two distinct ids never share a directory.

use std::io::Write;
use std::path::{Path, PathBuf};

use tracing::error;

use crate::app::hash::Md5Hash;
use crate::app::models::ChapterKey;
use crate::constants::storage;
use crate::errors::{StorageError, StorageResult};

/// Image container detected from leading magic bytes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ImageFormat {
    Jpeg,
    Png,
    Gif,
    Webp,
}

impl ImageFormat {
    /// Detect the format from the first bytes of a file
    pub fn sniff(bytes: &[u8]) -> Option<Self> {
        if bytes.starts_with(&[0xFF, 0xD8, 0xFF]) {
            Some(ImageFormat::Jpeg)
        } else if bytes.starts_with(&[0x89, b'P', b'N', b'G', 0x0D, 0x0A, 0x1A, 0x0A]) {
            Some(ImageFormat::Png)
        } else if bytes.starts_with(b"GIF87a") || bytes.starts_with(b"GIF89a") {
            Some(ImageFormat::Gif)
        } else if bytes.len() >= 12 && &bytes[..4] == b"RIFF" && &bytes[8..12] == b"WEBP" {
            Some(ImageFormat::Webp)
        } else {
            None
        }
    }

    pub fn extension(&self) -> &'static str {
        match self {
            ImageFormat::Jpeg => "jpg",
            ImageFormat::Png => "png",
            ImageFormat::Gif => "gif",
            ImageFormat::Webp => "webp",
        }
    }
}

/// Extension used when the bytes are not a recognised image
pub const UNKNOWN_EXTENSION: &str = "bin";

/// Page file name: zero-padded page number, content hash, extension
pub fn page_file_name(page_number: u32, hash: &Md5Hash, bytes: &[u8]) -> String {
    let ext = ImageFormat::sniff(bytes)
        .map(|f| f.extension())
        .unwrap_or(UNKNOWN_EXTENSION);
    format!("{:04}-{}.{}", page_number, hash, ext)
}

/// Inverse of [`page_file_name`]; `None` for anything else in the directory
pub fn parse_page_file_name(name: &str) -> Option<(u32, Md5Hash)> {
    let (page, rest) = name.split_once('-')?;
    let (hash, _ext) = rest.rsplit_once('.')?;
    let page_number = page.parse::<u32>().ok()?;
    let hash = Md5Hash::from_hex(hash).ok()?;
    Some((page_number, hash))
}

/// Turn an arbitrary id into one safe path segment
pub fn sanitize_segment(raw: &str) -> String {
    let cleaned: String = raw
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.') {
                c
            } else {
                '_'
            }
        })
        .collect();

    let reserved = cleaned.is_empty() || cleaned.chars().all(|c| c == '.');
    if cleaned == raw && !reserved {
        return cleaned;
    }
    let digest = Md5Hash::compute(raw.as_bytes()).to_hex();
    format!("{}~{}", cleaned.trim_matches('.'), &digest[..8])
}

/// Path generation for one storage root
#[derive(Debug, Clone)]
pub struct StorageLayout {
    root: PathBuf,
}

impl StorageLayout {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn index_path(&self) -> PathBuf {
        self.root.join(storage::INDEX_FILE)
    }

    pub fn chapters_dir(&self) -> PathBuf {
        self.root.join(storage::CHAPTERS_DIR)
    }

    pub fn staging_dir(&self) -> PathBuf {
        self.root.join(storage::STAGING_DIR)
    }

    /// Directory holding a finalized chapter
    pub fn chapter_dir(&self, key: &ChapterKey) -> PathBuf {
        Self::keyed(self.chapters_dir(), key)
    }

    /// Directory holding a chapter still being assembled
    pub fn staging_chapter_dir(&self, key: &ChapterKey) -> PathBuf {
        Self::keyed(self.staging_dir(), key)
    }

    fn keyed(base: PathBuf, key: &ChapterKey) -> PathBuf {
        base.join(sanitize_segment(&key.content_id))
            .join(sanitize_segment(&key.chapter))
    }
}

/// Write `bytes` to `path` via a temp file in the same directory and a rename
///
/// Readers never observe a partially written file under `path`.
pub async fn write_atomic(path: &Path, bytes: Vec<u8>) -> StorageResult<()> {
    let final_path = path.to_path_buf();
    tokio::task::spawn_blocking(move || write_atomic_blocking(&final_path, &bytes))
        .await
        .map_err(|e| StorageError::Io(std::io::Error::other(e)))?
}

fn write_atomic_blocking(final_path: &Path, bytes: &[u8]) -> StorageResult<()> {
    let dir = final_path
        .parent()
        .ok_or_else(|| StorageError::DirectoryNotAccessible {
            path: final_path.to_path_buf(),
        })?;
    std::fs::create_dir_all(dir)?;

    let mut temp = tempfile::Builder::new()
        .suffix(storage::TEMP_FILE_SUFFIX)
        .tempfile_in(dir)?;
    temp.write_all(bytes)?;
    temp.as_file().sync_all()?;

    let temp_path = temp.path().to_path_buf();
    temp.persist(final_path).map_err(|e| {
        if e.error.kind() == std::io::ErrorKind::StorageFull {
            return StorageError::Io(e.error);
        }
        error!("Failed to rename temporary file: {}", e.error);
        StorageError::AtomicOperationFailed {
            temp_path,
            final_path: final_path.to_path_buf(),
        }
    })?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_sniff_formats() {
        assert_eq!(ImageFormat::sniff(&[0xFF, 0xD8, 0xFF, 0xE0]), Some(ImageFormat::Jpeg));
        assert_eq!(
            ImageFormat::sniff(b"\x89PNG\r\n\x1a\n\0\0"),
            Some(ImageFormat::Png)
        );
        assert_eq!(ImageFormat::sniff(b"GIF89a..."), Some(ImageFormat::Gif));
        assert_eq!(ImageFormat::sniff(b"RIFF\0\0\0\0WEBPVP8 "), Some(ImageFormat::Webp));
        assert_eq!(ImageFormat::sniff(b"<html>"), None);
    }

    #[test]
    fn test_page_file_name_parses_back() {
        let bytes = [0xFF, 0xD8, 0xFF, 0xE0, 1, 2, 3];
        let hash = Md5Hash::compute(&bytes);
        let name = page_file_name(7, &hash, &bytes);
        assert!(name.starts_with("0007-"));
        assert!(name.ends_with(".jpg"));
        assert_eq!(parse_page_file_name(&name), Some((7, hash)));
        assert_eq!(parse_page_file_name(".tmpXYZ.part"), None);
    }

    #[test]
    fn test_sanitize_segment() {
        assert_eq!(sanitize_segment("one-piece"), "one-piece");
        assert_eq!(sanitize_segment("12.5"), "12.5");

        let slash = sanitize_segment("a/b");
        let underscore = sanitize_segment("a_b");
        assert_ne!(slash, underscore);
        assert!(!slash.contains('/'));

        assert_ne!(sanitize_segment(".."), "..");
        assert!(!sanitize_segment("").is_empty());
    }

    #[test]
    fn test_layout_paths() {
        let layout = StorageLayout::new("/data");
        let key = ChapterKey::new("berserk", "1");
        assert_eq!(layout.chapter_dir(&key), PathBuf::from("/data/chapters/berserk/1"));
        assert_eq!(
            layout.staging_chapter_dir(&key),
            PathBuf::from("/data/staging/berserk/1")
        );
        assert_eq!(layout.index_path(), PathBuf::from("/data/records.json"));
    }

    #[tokio::test]
    async fn test_write_atomic_replaces_content() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("nested").join("file.bin");

        write_atomic(&path, b"first".to_vec()).await.unwrap();
        write_atomic(&path, b"second".to_vec()).await.unwrap();

        assert_eq!(std::fs::read(&path).unwrap(), b"second");
        let leftovers = std::fs::read_dir(path.parent().unwrap()).unwrap().count();
        assert_eq!(leftovers, 1);
    }
}
