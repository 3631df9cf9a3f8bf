use std::path::{Component, Path, PathBuf};

use futures_util::{Stream, StreamExt};
use serde::Serialize;
use tokio::io::AsyncWriteExt;

const MAX_READ_BYTES: u64 = 4 * 1024 * 1024;

#[derive(Debug, thiserror::Error)]
pub enum FsError {
    #[error("invalid path: {0}")]
    InvalidPath(&'static str),
    #[error("file not found")]
    NotFound,
    #[error("path is a directory")]
    IsDirectory,
    #[error("path is not a directory")]
    NotDirectory,
    #[error("destination already exists")]
    AlreadyExists,
    #[error("path escapes the data directory or targets its root")]
    Forbidden,
    #[error("file is too large to open in the editor ({size} bytes, limit {limit})")]
    TooLarge { size: u64, limit: u64 },
    #[error("only .tar.gz, .tgz and .zip archives can be extracted")]
    UnsupportedFormat,
    #[error("archive entry escapes the destination: {0}")]
    UnsafeEntry(String),
    #[error("archive is unreadable: {0}")]
    BadArchive(String),
    #[error("upload failed: {0}")]
    Upload(String),
    #[error("filesystem error: {0}")]
    Io(#[source] std::io::Error),
}

impl FsError {
    pub fn code(&self) -> &'static str {
        match self {
            Self::InvalidPath(_) => "invalid_path",
            Self::NotFound => "file_not_found",
            Self::IsDirectory => "is_directory",
            Self::NotDirectory => "not_directory",
            Self::AlreadyExists => "already_exists",
            Self::Forbidden => "forbidden",
            Self::TooLarge { .. } => "too_large",
            Self::UnsupportedFormat => "unsupported_format",
            Self::UnsafeEntry(_) => "unsafe_archive_entry",
            Self::BadArchive(_) => "invalid_archive",
            Self::Upload(_) => "upload_failed",
            Self::Io(_) => "io_error",
        }
    }
}

impl From<std::io::Error> for FsError {
    fn from(e: std::io::Error) -> Self {
        match e.kind() {
            std::io::ErrorKind::NotFound => Self::NotFound,
            std::io::ErrorKind::AlreadyExists => Self::AlreadyExists,
            std::io::ErrorKind::PermissionDenied => Self::Forbidden,
            _ => Self::Io(e),
        }
    }
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct FileInfo {
    pub name: String,
    pub path: String,
    pub is_dir: bool,
    pub size: u64,
    pub mod_time: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub extension: Option<String>,
}

/// Request paths are relative to the data directory; a leading `/` is tolerated.
fn normalize_rel_path(rel: &str) -> Result<PathBuf, FsError> {
    let rel = rel.trim().trim_start_matches('/');
    let mut out = PathBuf::new();
    for c in Path::new(rel).components() {
        match c {
            Component::CurDir => {}
            Component::Normal(seg) => out.push(seg),
            Component::ParentDir => return Err(FsError::InvalidPath("path traversal is not allowed")),
            Component::Prefix(_) | Component::RootDir => {
                return Err(FsError::InvalidPath("path must be relative"));
            }
        }
    }
    Ok(out)
}

fn rel_display(rel: &Path) -> String {
    rel.components()
        .map(|c| c.as_os_str().to_string_lossy())
        .collect::<Vec<_>>()
        .join("/")
}

fn format_mtime(meta: &std::fs::Metadata) -> String {
    meta.modified()
        .map(|t| chrono::DateTime::<chrono::Utc>::from(t).to_rfc3339())
        .unwrap_or_default()
}

/// Blocking twin of `FileTree::ensure_inside`, for use inside archive extraction.
fn ensure_within(root: &Path, path: &Path) -> Result<(), FsError> {
    let mut probe = path;
    loop {
        match std::fs::canonicalize(probe) {
            Ok(canon) if canon.starts_with(root) => return Ok(()),
            Ok(_) => return Err(FsError::Forbidden),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                probe = probe.parent().ok_or(FsError::Forbidden)?;
            }
            Err(e) => return Err(e.into()),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ArchiveKind {
    TarGz,
    Zip,
}

impl ArchiveKind {
    fn detect(path: &Path) -> Option<Self> {
        let name = path.file_name()?.to_string_lossy().to_ascii_lowercase();
        if name.ends_with(".tar.gz") || name.ends_with(".tgz") {
            Some(Self::TarGz)
        } else if name.ends_with(".zip") {
            Some(Self::Zip)
        } else {
            None
        }
    }
}

/// Entry names must stay relative: absolute names and `..` are refused outright.
fn archive_entry_path(name: &Path) -> Result<PathBuf, FsError> {
    let mut out = PathBuf::new();
    for c in name.components() {
        match c {
            Component::CurDir => {}
            Component::Normal(seg) => out.push(seg),
            Component::ParentDir | Component::RootDir | Component::Prefix(_) => {
                return Err(FsError::UnsafeEntry(name.display().to_string()));
            }
        }
    }
    Ok(out)
}

fn bad_archive(e: impl std::fmt::Display) -> FsError {
    FsError::BadArchive(e.to_string())
}

type TarGz = tar::Archive<flate2::read::GzDecoder<std::fs::File>>;

fn open_tar_gz(path: &Path) -> Result<TarGz, FsError> {
    let file = std::fs::File::open(path)?;
    Ok(tar::Archive::new(flate2::read::GzDecoder::new(file)))
}

/// Every entry name is checked before anything is written, so a hostile archive leaves the
/// destination untouched. Links and special files are skipped.
fn extract_tar_gz(archive: &Path, dest: &Path) -> Result<Vec<String>, FsError> {
    let mut check = open_tar_gz(archive)?;
    for entry in check.entries().map_err(bad_archive)? {
        let entry = entry.map_err(bad_archive)?;
        archive_entry_path(&entry.path().map_err(bad_archive)?)?;
    }

    let mut extracted = Vec::new();
    let mut tar = open_tar_gz(archive)?;
    for entry in tar.entries().map_err(bad_archive)? {
        let mut entry = entry.map_err(bad_archive)?;
        let rel = archive_entry_path(&entry.path().map_err(bad_archive)?)?;
        if rel.as_os_str().is_empty() {
            continue;
        }
        let target = dest.join(&rel);
        let kind = entry.header().entry_type();
        if kind.is_dir() {
            ensure_within(dest, &target)?;
            std::fs::create_dir_all(&target)?;
        } else if kind.is_file() {
            ensure_within(dest, &target)?;
            if let Some(parent) = target.parent() {
                std::fs::create_dir_all(parent)?;
            }
            entry.unpack(&target)?;
        } else {
            continue;
        }
        extracted.push(rel_display(&rel));
    }
    Ok(extracted)
}

fn extract_zip(archive: &Path, dest: &Path) -> Result<Vec<String>, FsError> {
    let file = std::fs::File::open(archive)?;
    let mut reader = zip::ZipArchive::new(file).map_err(bad_archive)?;

    let mut entries = Vec::with_capacity(reader.len());
    for i in 0..reader.len() {
        let entry = reader.by_index(i).map_err(bad_archive)?;
        let rel = archive_entry_path(Path::new(entry.name()))?;
        entries.push((rel, entry.is_dir()));
    }

    let mut extracted = Vec::new();
    for (i, (rel, is_dir)) in entries.into_iter().enumerate() {
        if rel.as_os_str().is_empty() {
            continue;
        }
        let target = dest.join(&rel);
        ensure_within(dest, &target)?;
        if is_dir {
            std::fs::create_dir_all(&target)?;
        } else {
            if let Some(parent) = target.parent() {
                std::fs::create_dir_all(parent)?;
            }
            let mut entry = reader.by_index(i).map_err(bad_archive)?;
            let mut out = std::fs::File::create(&target)?;
            std::io::copy(&mut entry, &mut out)?;
        }
        extracted.push(rel_display(&rel));
    }
    Ok(extracted)
}

/// Outcome of an archive extraction, paths relative to the data directory.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct ExtractReport {
    pub source: String,
    pub destination: String,
    pub extracted_files: Vec<String>,
    pub count: usize,
}

/// File operations scoped to the server's data directory.
#[derive(Debug, Clone)]
pub struct FileTree {
    root: PathBuf,
}

impl FileTree {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn scoped(&self, rel: &str) -> Result<(PathBuf, PathBuf), FsError> {
        let rel = normalize_rel_path(rel)?;
        Ok((self.root.join(&rel), rel))
    }

    fn scoped_non_root(&self, rel: &str) -> Result<(PathBuf, PathBuf), FsError> {
        let (abs, rel) = self.scoped(rel)?;
        if rel.as_os_str().is_empty() {
            return Err(FsError::Forbidden);
        }
        Ok((abs, rel))
    }

    /// Resolves symlinks on the deepest existing ancestor and refuses anything that lands
    /// outside the root.
    async fn ensure_inside(&self, path: &Path) -> Result<(), FsError> {
        let root = tokio::fs::canonicalize(&self.root).await?;
        let mut probe = path;
        loop {
            match tokio::fs::canonicalize(probe).await {
                Ok(canon) => {
                    if canon.starts_with(&root) {
                        return Ok(());
                    }
                    return Err(FsError::Forbidden);
                }
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                    probe = probe.parent().ok_or(FsError::Forbidden)?;
                }
                Err(e) => return Err(e.into()),
            }
        }
    }

    pub async fn list(&self, rel: &str) -> Result<Vec<FileInfo>, FsError> {
        let (abs, rel) = self.scoped(rel)?;
        self.ensure_inside(&abs).await?;
        if !tokio::fs::metadata(&abs).await?.is_dir() {
            return Err(FsError::NotDirectory);
        }

        let mut out = Vec::new();
        let mut rd = tokio::fs::read_dir(&abs).await?;
        while let Some(entry) = rd.next_entry().await? {
            let meta = match entry.metadata().await {
                Ok(m) => m,
                Err(_) => continue,
            };
            let name = entry.file_name().to_string_lossy().into_owned();
            let is_dir = meta.is_dir();
            let extension = if is_dir {
                None
            } else {
                Path::new(&name)
                    .extension()
                    .map(|e| e.to_string_lossy().to_ascii_lowercase())
            };
            out.push(FileInfo {
                path: rel_display(&rel.join(&name)),
                name,
                is_dir,
                size: if is_dir { 0 } else { meta.len() },
                mod_time: format_mtime(&meta),
                extension,
            });
        }

        out.sort_by(|a, b| b.is_dir.cmp(&a.is_dir).then_with(|| a.name.cmp(&b.name)));
        Ok(out)
    }

    pub async fn read(&self, rel: &str) -> Result<String, FsError> {
        let (abs, _) = self.scoped(rel)?;
        self.ensure_inside(&abs).await?;
        let meta = tokio::fs::metadata(&abs).await?;
        if meta.is_dir() {
            return Err(FsError::IsDirectory);
        }
        if meta.len() > MAX_READ_BYTES {
            return Err(FsError::TooLarge {
                size: meta.len(),
                limit: MAX_READ_BYTES,
            });
        }
        let bytes = tokio::fs::read(&abs).await?;
        Ok(String::from_utf8_lossy(&bytes).into_owned())
    }

    /// Resolves a writable file path and creates its missing parent directories.
    async fn prepare_write(&self, rel: &str) -> Result<PathBuf, FsError> {
        let (abs, _) = self.scoped_non_root(rel)?;
        self.ensure_inside(&abs).await?;
        if let Ok(meta) = tokio::fs::metadata(&abs).await
            && meta.is_dir()
        {
            return Err(FsError::IsDirectory);
        }
        if let Some(parent) = abs.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        Ok(abs)
    }

    /// Creates missing parent directories.
    pub async fn write(&self, rel: &str, content: &str) -> Result<(), FsError> {
        let abs = self.prepare_write(rel).await?;
        tokio::fs::write(&abs, content.as_bytes()).await?;
        Ok(())
    }

    /// Streams an upload into place through a hidden sibling, so a broken upload never
    /// replaces an existing file. Returns the byte count.
    pub async fn write_stream<S, B, E>(&self, rel: &str, body: S) -> Result<u64, FsError>
    where
        S: Stream<Item = Result<B, E>>,
        B: AsRef<[u8]>,
        E: std::fmt::Display,
    {
        let abs = self.prepare_write(rel).await?;
        let name = abs.file_name().ok_or(FsError::Forbidden)?.to_string_lossy();
        let tmp = abs.with_file_name(format!(".{name}.upload"));

        let res = async {
            let mut file = tokio::fs::File::create(&tmp).await?;
            let mut body = std::pin::pin!(body);
            let mut written: u64 = 0;
            while let Some(chunk) = body.next().await {
                let chunk = chunk.map_err(|e| FsError::Upload(e.to_string()))?;
                let chunk = chunk.as_ref();
                file.write_all(chunk).await?;
                written += chunk.len() as u64;
            }
            file.flush().await?;
            tokio::fs::rename(&tmp, &abs).await?;
            Ok::<_, FsError>(written)
        }
        .await;
        if res.is_err() {
            let _ = tokio::fs::remove_file(&tmp).await;
        }
        res
    }

    /// Unpacks a `.tar.gz`, `.tgz` or `.zip` archive. Without a destination the archive's own
    /// directory is used.
    pub async fn extract(
        &self,
        rel: &str,
        destination: Option<&str>,
    ) -> Result<ExtractReport, FsError> {
        let (archive, archive_rel) = self.scoped_non_root(rel)?;
        self.ensure_inside(&archive).await?;
        if tokio::fs::metadata(&archive).await?.is_dir() {
            return Err(FsError::IsDirectory);
        }
        let kind = ArchiveKind::detect(&archive).ok_or(FsError::UnsupportedFormat)?;

        let dest_rel = match destination.map(str::trim).filter(|d| !d.is_empty()) {
            Some(d) => normalize_rel_path(d)?,
            None => archive_rel
                .parent()
                .map(Path::to_path_buf)
                .unwrap_or_default(),
        };
        let dest = self.root.join(&dest_rel);
        self.ensure_inside(&dest).await?;
        tokio::fs::create_dir_all(&dest).await?;
        let dest = tokio::fs::canonicalize(&dest).await?;

        let extracted_files = tokio::task::spawn_blocking(move || match kind {
            ArchiveKind::TarGz => extract_tar_gz(&archive, &dest),
            ArchiveKind::Zip => extract_zip(&archive, &dest),
        })
        .await
        .map_err(|e| FsError::Io(std::io::Error::other(e)))??;

        Ok(ExtractReport {
            source: rel_display(&archive_rel),
            destination: rel_display(&dest_rel),
            count: extracted_files.len(),
            extracted_files,
        })
    }

    pub async fn mkdir(&self, rel: &str) -> Result<(), FsError> {
        let (abs, _) = self.scoped_non_root(rel)?;
        self.ensure_inside(&abs).await?;
        tokio::fs::create_dir_all(&abs).await?;
        Ok(())
    }

    pub async fn rename(&self, from: &str, to: &str) -> Result<(), FsError> {
        let (src, _) = self.scoped_non_root(from)?;
        let (dst, _) = self.scoped_non_root(to)?;
        self.ensure_inside(&src).await?;
        self.ensure_inside(&dst).await?;
        tokio::fs::symlink_metadata(&src).await?;
        if tokio::fs::symlink_metadata(&dst).await.is_ok() {
            return Err(FsError::AlreadyExists);
        }
        if let Some(parent) = dst.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::rename(&src, &dst).await?;
        Ok(())
    }

    /// Files only; directories are rejected.
    pub async fn copy(&self, from: &str, to: &str) -> Result<(), FsError> {
        let (src, _) = self.scoped_non_root(from)?;
        let (dst, _) = self.scoped_non_root(to)?;
        self.ensure_inside(&src).await?;
        self.ensure_inside(&dst).await?;
        if tokio::fs::metadata(&src).await?.is_dir() {
            return Err(FsError::IsDirectory);
        }
        if tokio::fs::symlink_metadata(&dst).await.is_ok() {
            return Err(FsError::AlreadyExists);
        }
        if let Some(parent) = dst.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::copy(&src, &dst).await?;
        Ok(())
    }

    /// Removes a file, a symlink (not its target) or a whole directory tree.
    pub async fn remove(&self, rel: &str) -> Result<(), FsError> {
        let (abs, _) = self.scoped_non_root(rel)?;
        let parent = abs.parent().ok_or(FsError::Forbidden)?;
        self.ensure_inside(parent).await?;

        let meta = tokio::fs::symlink_metadata(&abs).await?;
        if meta.is_dir() {
            tokio::fs::remove_dir_all(&abs).await?;
        } else {
            tokio::fs::remove_file(&abs).await?;
        }
        Ok(())
    }
}
