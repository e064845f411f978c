pub mod cleanup;

use crate::errors::{AppError, AppResult};
use cleanup::CleanupQueue;
use once_cell::sync::Lazy;
use rand::Rng;
use regex::Regex;
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;
use tokio::io::AsyncWriteExt;

pub const PUBLIC_PREFIX: &str = "/uploads/";
const MB: u64 = 1024 * 1024;

static IMAGE_TYPES: Lazy<Regex> = Lazy::new(|| Regex::new(r"jpeg|jpg|png|gif|webp").expect("valid regex"));

const DOCUMENT_MIME_TYPES: &[&str] = &[
    "application/pdf",
    "application/msword",
    "application/vnd.openxmlformats-officedocument.wordprocessingml.document",
    "application/vnd.ms-excel",
    "application/vnd.openxmlformats-officedocument.spreadsheetml.sheet",
];
const DOCUMENT_EXTENSIONS: &[&str] = &[".pdf", ".doc", ".docx", ".xls", ".xlsx"];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileFilter {
    Image,
    Document,
}

impl FileFilter {
    fn accepts(self, extension: &str, mime: &str) -> bool {
        let extension = extension.to_ascii_lowercase();
        match self {
            Self::Image => IMAGE_TYPES.is_match(&extension) && IMAGE_TYPES.is_match(mime),
            Self::Document => {
                DOCUMENT_MIME_TYPES.contains(&mime) && DOCUMENT_EXTENSIONS.contains(&extension.as_str())
            }
        }
    }

    fn rejection_message(self) -> &'static str {
        match self {
            Self::Image => "Only image files are allowed",
            Self::Document => "File type is not allowed",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UploadKind {
    EventImage,
    Document,
    ReminderImage,
    WorkplanFile,
}

impl UploadKind {
    pub const ALL: [UploadKind; 4] = [Self::EventImage, Self::Document, Self::ReminderImage, Self::WorkplanFile];

    pub fn folder(self) -> &'static str {
        match self {
            Self::EventImage => "events",
            Self::Document => "documents",
            Self::ReminderImage => "reminders",
            Self::WorkplanFile => "workplan",
        }
    }

    pub fn prefix(self) -> &'static str {
        match self {
            Self::EventImage => "event-",
            Self::Document => "doc-",
            Self::ReminderImage => "reminder-",
            Self::WorkplanFile => "workplan-",
        }
    }

    pub fn max_bytes(self) -> u64 {
        match self {
            Self::EventImage | Self::ReminderImage => 5 * MB,
            Self::Document | Self::WorkplanFile => 10 * MB,
        }
    }

    pub fn filter(self) -> FileFilter {
        match self {
            Self::EventImage | Self::ReminderImage => FileFilter::Image,
            Self::Document | Self::WorkplanFile => FileFilter::Document,
        }
    }

    pub fn accepts(self, original_name: &str, mime: &str) -> bool {
        self.filter().accepts(&extension_of(original_name), mime)
    }

    /// `<prefix><unix-millis>-<random><ext>`
    pub fn generate_filename(self, original_name: &str) -> String {
        let millis = chrono::Utc::now().timestamp_millis();
        let suffix: u32 = rand::rng().random_range(0..1_000_000_000);
        format!("{}{}-{}{}", self.prefix(), millis, suffix, extension_of(original_name))
    }
}

/// Extension including the dot, as submitted; empty when the name has none.
fn extension_of(original_name: &str) -> String {
    Path::new(original_name)
        .extension()
        .and_then(|ext| ext.to_str())
        .filter(|ext| ext.chars().all(|c| c.is_ascii_alphanumeric()))
        .map(|ext| format!(".{ext}"))
        .unwrap_or_default()
}

#[derive(Clone)]
pub struct UploadManager {
    root: Arc<PathBuf>,
    cleanup: CleanupQueue,
}

impl UploadManager {
    pub fn new(root: impl Into<PathBuf>, cleanup: CleanupQueue) -> AppResult<Self> {
        let root = root.into();
        for kind in UploadKind::ALL {
            std::fs::create_dir_all(root.join(kind.folder()))?;
        }
        Ok(Self {
            root: Arc::new(root),
            cleanup,
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn cleanup(&self) -> &CleanupQueue {
        &self.cleanup
    }

    /// Rejects disallowed types before anything touches the disk.
    pub async fn stage(&self, kind: UploadKind, original_name: &str, mime: &str) -> AppResult<StagedFile> {
        if !kind.accepts(original_name, mime) {
            tracing::warn!(kind = ?kind, file = %original_name, mime = %mime, "upload rejected by type filter");
            return Err(AppError::BadRequest(kind.filter().rejection_message().to_string()));
        }

        let filename = kind.generate_filename(original_name);
        let path = self.root.join(kind.folder()).join(&filename);
        let file = tokio::fs::File::create(&path).await?;

        Ok(StagedFile {
            public_url: format!("{PUBLIC_PREFIX}{}/{filename}", kind.folder()),
            path,
            kind,
            written: 0,
            file: Some(file),
            cleanup: self.cleanup.clone(),
            kept: false,
        })
    }

    /// Maps `/uploads/<folder>/<name>` to a path under the root; anything
    /// that could escape the root yields `None`.
    pub fn resolve_public_url(&self, public_url: &str) -> Option<PathBuf> {
        let relative = Path::new(public_url.strip_prefix(PUBLIC_PREFIX)?);
        let mut components = 0usize;
        for component in relative.components() {
            match component {
                Component::Normal(_) => components += 1,
                _ => return None,
            }
        }
        (components > 0).then(|| self.root.join(relative))
    }

    pub fn schedule_removal(&self, public_url: &str) {
        match self.resolve_public_url(public_url) {
            Some(path) => self.cleanup.schedule(path),
            None => tracing::warn!(url = %public_url, "refusing to remove file outside uploads root"),
        }
    }
}

/// An uploaded file written before the request finished. Dropping it without
/// [`StagedFile::keep`] hands the file to the cleanup queue.
pub struct StagedFile {
    path: PathBuf,
    public_url: String,
    kind: UploadKind,
    written: u64,
    file: Option<tokio::fs::File>,
    cleanup: CleanupQueue,
    kept: bool,
}

impl StagedFile {
    pub fn public_url(&self) -> &str {
        &self.public_url
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn size(&self) -> u64 {
        self.written
    }

    pub async fn write_chunk(&mut self, chunk: &[u8]) -> AppResult<()> {
        let limit = self.kind.max_bytes();
        if self.written + chunk.len() as u64 > limit {
            return Err(AppError::BadRequest(format!(
                "File too large (max {} MB)",
                limit / MB
            )));
        }
        let Some(file) = self.file.as_mut() else {
            return Err(AppError::Internal("staged file already finished".to_string()));
        };
        file.write_all(chunk).await?;
        self.written += chunk.len() as u64;
        Ok(())
    }

    pub async fn finish(&mut self) -> AppResult<()> {
        if let Some(mut file) = self.file.take() {
            file.flush().await?;
            file.sync_all().await?;
        }
        Ok(())
    }

    /// Marks the file as referenced by a persisted record.
    pub fn keep(mut self) -> String {
        self.kept = true;
        std::mem::take(&mut self.public_url)
    }
}

impl Drop for StagedFile {
    fn drop(&mut self) {
        if self.kept {
            return;
        }
        self.file.take();
        self.cleanup.schedule(self.path.clone());
    }
}
