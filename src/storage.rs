//! Part-file storage
//!
//! Verified pieces land in sparse part files under the incomplete
//! directory and are renamed into their final paths once the torrent
//! completes. A piece that straddles file boundaries is split into
//! per-file sub-writes by the descriptor's slice mapping, so every byte
//! of the content stream is written exactly once, at its exact offset.
//!
//! The read path serves streaming consumers while the download runs: an
//! optional before-read hook lets the session shift its focus window
//! ahead of the reader position.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use parking_lot::RwLock;
use tokio::fs::{self, File, OpenOptions};
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt, SeekFrom};
use tracing::info;

use crate::error::{EngineError, Result, StorageErrorKind};
use crate::metainfo::Torrent;

/// Called with `(file index, offset, len)` before every read.
pub type ReadHook = Arc<dyn Fn(usize, u64, u64) + Send + Sync>;

/// Storage for one torrent's content.
pub struct PartStore {
    torrent: Arc<Torrent>,
    /// Per-torrent directory holding the part files
    parts_root: PathBuf,
    /// Where completed files end up
    download_dir: PathBuf,
    read_hook: RwLock<Option<ReadHook>>,
}

impl PartStore {
    /// Open storage for a torrent, creating the part directory.
    pub async fn open(
        torrent: Arc<Torrent>,
        incomplete_dir: &Path,
        download_dir: &Path,
    ) -> Result<Self> {
        // Torrent fields are public, so the descriptor cannot be
        // assumed parser-validated here
        for file in &torrent.files {
            validate_content_path(&file.path)?;
        }
        let parts_root = incomplete_dir.join(fs_safe_name(&torrent.name));
        fs::create_dir_all(&parts_root)
            .await
            .map_err(|e| storage_err(StorageErrorKind::Io, &parts_root, &e))?;
        fs::create_dir_all(download_dir)
            .await
            .map_err(|e| storage_err(StorageErrorKind::Io, download_dir, &e))?;
        Ok(Self {
            torrent,
            parts_root,
            download_dir: download_dir.to_path_buf(),
            read_hook: RwLock::new(None),
        })
    }

    /// Fail if any final destination path is already taken.
    pub async fn check_destinations(&self) -> Result<()> {
        for i in 0..self.torrent.files.len() {
            let path = self.final_path(i);
            if fs::try_exists(&path).await.unwrap_or(false) {
                return Err(EngineError::AlreadyExists(path));
            }
        }
        Ok(())
    }

    /// Install the before-read hook.
    pub fn set_read_hook(&self, hook: ReadHook) {
        *self.read_hook.write() = Some(hook);
    }

    /// Where the resumable session snapshot lives. It sits with the part
    /// files and disappears with them at materialization.
    pub fn session_path(&self) -> PathBuf {
        self.parts_root.join("session.json")
    }

    fn part_path(&self, file: usize) -> PathBuf {
        let mut path = self.parts_root.clone();
        for component in self.torrent.files[file].path.components() {
            path.push(fs_safe_name(&component.as_os_str().to_string_lossy()));
        }
        let mut name = path.into_os_string();
        name.push(".part");
        PathBuf::from(name)
    }

    fn final_path(&self, file: usize) -> PathBuf {
        if self.torrent.files.len() == 1 {
            return self.download_dir.join(fs_safe_name(&self.torrent.name));
        }
        let mut path = self.download_dir.join(fs_safe_name(&self.torrent.name));
        for component in self.torrent.files[file].path.components() {
            path.push(fs_safe_name(&component.as_os_str().to_string_lossy()));
        }
        path
    }

    /// True when the file's part exists on disk. Resume uses this to
    /// decide which progress bits are still backed by data.
    pub async fn has_part(&self, file: usize) -> bool {
        fs::try_exists(self.part_path(file)).await.unwrap_or(false)
    }

    /// Open a part file presized (sparsely) to its full length.
    async fn open_part(&self, file: usize) -> Result<File> {
        let path = self.part_path(file);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .await
                .map_err(|e| storage_err(StorageErrorKind::Io, parent, &e))?;
        }
        let handle = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&path)
            .await
            .map_err(|e| storage_err(StorageErrorKind::Io, &path, &e))?;

        let expected = self.torrent.files[file].length;
        let meta = handle
            .metadata()
            .await
            .map_err(|e| storage_err(StorageErrorKind::Io, &path, &e))?;
        if meta.len() != expected {
            handle
                .set_len(expected)
                .await
                .map_err(|e| storage_err(StorageErrorKind::Io, &path, &e))?;
        }
        Ok(handle)
    }

    /// Write one verified piece, splitting it across file boundaries.
    pub async fn write_piece(&self, piece: u32, data: &[u8]) -> Result<()> {
        let mut consumed = 0usize;
        for slice in self.torrent.slices_for_piece(piece) {
            let chunk = &data[consumed..consumed + slice.len as usize];
            consumed += slice.len as usize;

            let mut handle = self.open_part(slice.file).await?;
            handle
                .seek(SeekFrom::Start(slice.offset))
                .await
                .map_err(|e| storage_err(StorageErrorKind::Io, self.part_path(slice.file), &e))?;
            handle
                .write_all(chunk)
                .await
                .map_err(|e| storage_err(StorageErrorKind::Io, self.part_path(slice.file), &e))?;
            handle
                .flush()
                .await
                .map_err(|e| storage_err(StorageErrorKind::Io, self.part_path(slice.file), &e))?;
        }
        debug_assert_eq!(consumed, data.len());
        Ok(())
    }

    /// Read from one file, clamped to its length. Regions not yet
    /// downloaded read as zeros; waiting for verified data is the
    /// session's job, not storage's.
    pub async fn read(&self, file: usize, offset: u64, len: usize) -> Result<Vec<u8>> {
        if let Some(hook) = self.read_hook.read().clone() {
            hook(file, offset, len as u64);
        }

        let file_len = self.torrent.files[file].length;
        if offset >= file_len {
            return Ok(Vec::new());
        }
        let len = len.min((file_len - offset) as usize);

        // During the session data lives in the part; afterwards in the
        // final path
        let part = self.part_path(file);
        let path = if fs::try_exists(&part).await.unwrap_or(false) {
            part
        } else {
            self.final_path(file)
        };

        let mut handle = File::open(&path)
            .await
            .map_err(|e| storage_err(StorageErrorKind::from_io(&e), &path, &e))?;
        handle
            .seek(SeekFrom::Start(offset))
            .await
            .map_err(|e| storage_err(StorageErrorKind::Io, &path, &e))?;
        let mut buf = vec![0u8; len];
        handle
            .read_exact(&mut buf)
            .await
            .map_err(|e| storage_err(StorageErrorKind::Io, &path, &e))?;
        Ok(buf)
    }

    /// Length of a file per the descriptor.
    pub fn file_len(&self, file: usize) -> u64 {
        self.torrent.files[file].length
    }

    /// Number of files.
    pub fn file_count(&self) -> usize {
        self.torrent.files.len()
    }

    /// Move every completed part into its final path. Zero-length files
    /// never received a part and are created empty here.
    pub async fn materialize_all(&self) -> Result<Vec<PathBuf>> {
        let mut finals = Vec::with_capacity(self.torrent.files.len());
        for i in 0..self.torrent.files.len() {
            let part = self.part_path(i);
            let dest = self.final_path(i);
            if let Some(parent) = dest.parent() {
                fs::create_dir_all(parent)
                    .await
                    .map_err(|e| storage_err(StorageErrorKind::Io, parent, &e))?;
            }

            if fs::try_exists(&part).await.unwrap_or(false) {
                move_file(&part, &dest).await?;
            } else if self.torrent.files[i].length == 0 {
                File::create(&dest)
                    .await
                    .map_err(|e| storage_err(StorageErrorKind::Io, &dest, &e))?;
            } else {
                return Err(storage_missing(&part));
            }
            finals.push(dest);
        }

        // Best-effort cleanup of the emptied part tree
        let _ = fs::remove_dir_all(&self.parts_root).await;
        info!(name = %self.torrent.name, files = finals.len(), "download materialized");
        Ok(finals)
    }
}

/// A content path must be plain relative components: no `..`, no root,
/// no drive prefix, nothing empty. Separators smuggled inside a single
/// component are neutralized later by `fs_safe_name`.
fn validate_content_path(path: &Path) -> Result<()> {
    use std::path::Component;
    if path.as_os_str().is_empty() {
        return Err(EngineError::storage(
            StorageErrorKind::InvalidPath,
            path,
            "file entry has an empty path",
        ));
    }
    for component in path.components() {
        match component {
            Component::Normal(_) => {}
            Component::ParentDir => {
                return Err(EngineError::storage(
                    StorageErrorKind::PathTraversal,
                    path,
                    "file path climbs out of the content root",
                ));
            }
            Component::RootDir | Component::Prefix(_) | Component::CurDir => {
                return Err(EngineError::storage(
                    StorageErrorKind::InvalidPath,
                    path,
                    "file path is not plain relative components",
                ));
            }
        }
    }
    Ok(())
}

/// Rename with a copy fallback for cross-device moves.
async fn move_file(from: &Path, to: &Path) -> Result<()> {
    match fs::rename(from, to).await {
        Ok(()) => Ok(()),
        Err(_) => {
            fs::copy(from, to)
                .await
                .map_err(|e| storage_err(StorageErrorKind::Io, to, &e))?;
            fs::remove_file(from)
                .await
                .map_err(|e| storage_err(StorageErrorKind::Io, from, &e))?;
            Ok(())
        }
    }
}

/// Persist a fetched info dictionary as a loadable .torrent document
/// next to the part files. Written to a temporary name first so a crash
/// never leaves a half-written document behind.
pub async fn save_metadata_file(dir: &Path, name: &str, info: &[u8]) -> Result<PathBuf> {
    fs::create_dir_all(dir)
        .await
        .map_err(|e| storage_err(StorageErrorKind::Io, dir, &e))?;

    let mut document = Vec::with_capacity(info.len() + 8);
    document.extend_from_slice(b"d4:info");
    document.extend_from_slice(info);
    document.push(b'e');

    let dest = dir.join(format!("{}.torrent", fs_safe_name(name)));
    let tmp = dir.join(format!("{}.torrent.part", fs_safe_name(name)));
    fs::write(&tmp, &document)
        .await
        .map_err(|e| storage_err(StorageErrorKind::Io, &tmp, &e))?;
    move_file(&tmp, &dest).await?;
    Ok(dest)
}

/// Map a torrent-supplied name onto something every filesystem accepts.
/// Reserved characters become underscores; trailing dots and spaces are
/// trimmed (Windows rejects them).
pub fn fs_safe_name(name: &str) -> String {
    let mut safe: String = name
        .chars()
        .map(|c| match c {
            '/' | '\\' | ':' | '*' | '?' | '"' | '<' | '>' | '|' => '_',
            c if (c as u32) < 0x20 => '_',
            c => c,
        })
        .collect();
    while safe.ends_with(['.', ' ']) {
        safe.pop();
    }
    if safe.is_empty() {
        safe.push('_');
    }
    safe
}

impl StorageErrorKind {
    fn from_io(err: &std::io::Error) -> Self {
        match err.kind() {
            std::io::ErrorKind::NotFound => StorageErrorKind::NotFound,
            std::io::ErrorKind::PermissionDenied => StorageErrorKind::PermissionDenied,
            _ => StorageErrorKind::Io,
        }
    }
}

fn storage_err(
    kind: StorageErrorKind,
    path: impl Into<PathBuf>,
    err: &std::io::Error,
) -> EngineError {
    EngineError::storage(kind, path, err.to_string())
}

fn storage_missing(path: &Path) -> EngineError {
    EngineError::storage(
        StorageErrorKind::NotFound,
        path,
        "part file missing for a completed torrent",
    )
}
