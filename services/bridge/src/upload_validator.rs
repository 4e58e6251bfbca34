use crate::config::UploadConfig;
use thiserror::Error;
use tracing::trace;

const IMAGE_EXTENSIONS: &[&str] = &["jpg", "jpeg", "png", "gif", "webp"];
const DOCUMENT_EXTENSIONS: &[&str] = &["pdf", "epub", "mobi", "doc", "docx"];
const VIDEO_EXTENSIONS: &[&str] = &["mp4", "avi", "mov", "wmv", "flv"];

/// Upload rejected before touching the object store
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ValidationError {
    #[error("file type {extension:?} is not allowed")]
    UnsupportedFileType { extension: String },

    #[error("file size {size} exceeds maximum allowed size {max_size}")]
    FileTooLarge { size: u64, max_size: u64 },
}

/// Category an allowed extension belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileCategory {
    Image,
    Document,
    Video,
}

impl FileCategory {
    /// Classify a bare extension (no dot), case-insensitively
    pub fn from_extension(extension: &str) -> Option<Self> {
        let extension = extension.to_ascii_lowercase();
        let ext = extension.as_str();

        if IMAGE_EXTENSIONS.contains(&ext) {
            Some(FileCategory::Image)
        } else if DOCUMENT_EXTENSIONS.contains(&ext) {
            Some(FileCategory::Document)
        } else if VIDEO_EXTENSIONS.contains(&ext) {
            Some(FileCategory::Video)
        } else {
            None
        }
    }
}

/// A file that passed validation
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidatedFile {
    /// Lowercased extension without the dot
    pub extension: String,
    pub category: FileCategory,
    pub mime_type: &'static str,
}

/// Enforces the extension allow-lists and per-category size ceilings
#[derive(Debug, Clone)]
pub struct UploadValidator {
    max_file_bytes: u64,
    max_document_bytes: u64,
}

impl UploadValidator {
    pub fn new(config: &UploadConfig) -> Self {
        Self {
            max_file_bytes: config.max_file_bytes,
            max_document_bytes: config.max_document_bytes,
        }
    }

    /// Size ceiling for a category
    pub fn max_size(&self, category: FileCategory) -> u64 {
        match category {
            FileCategory::Document => self.max_document_bytes,
            FileCategory::Image | FileCategory::Video => self.max_file_bytes,
        }
    }

    /// Validate a filename and its size.
    ///
    /// The category is derived from the extension, so an extension outside every
    /// allow-list is rejected before the size is looked at.
    pub fn validate(&self, filename: &str, size: u64) -> Result<ValidatedFile, ValidationError> {
        let extension = file_extension(filename).unwrap_or_default();

        let category = FileCategory::from_extension(&extension).ok_or_else(|| {
            ValidationError::UnsupportedFileType {
                extension: extension.clone(),
            }
        })?;

        let max_size = self.max_size(category);
        if size > max_size {
            return Err(ValidationError::FileTooLarge { size, max_size });
        }

        trace!(filename, size, ?category, "Upload validated");

        Ok(ValidatedFile {
            mime_type: mime_type(&extension),
            extension,
            category,
        })
    }
}

impl Default for UploadValidator {
    fn default() -> Self {
        Self::new(&UploadConfig::default())
    }
}

/// Split the final path component at its last dot into name and extension.
///
/// A leading dot counts, so `.png` is an empty name with extension `png`.
pub fn split_filename(filename: &str) -> (&str, Option<&str>) {
    let base = filename.rsplit(['/', '\\']).next().unwrap_or(filename);

    match base.rfind('.') {
        Some(dot) => (&base[..dot], Some(&base[dot + 1..]).filter(|ext| !ext.is_empty())),
        None => (base, None),
    }
}

/// Lowercased extension of the final path component, without the dot
pub fn file_extension(filename: &str) -> Option<String> {
    split_filename(filename).1.map(|ext| ext.to_ascii_lowercase())
}

/// Get content type for an extension
pub fn mime_type(extension: &str) -> &'static str {
    match extension.to_ascii_lowercase().as_str() {
        "jpg" | "jpeg" => "image/jpeg",
        "png" => "image/png",
        "gif" => "image/gif",
        "webp" => "image/webp",
        "pdf" => "application/pdf",
        "epub" => "application/epub+zip",
        "mobi" => "application/x-mobipocket-ebook",
        "doc" => "application/msword",
        "docx" => "application/vnd.openxmlformats-officedocument.wordprocessingml.document",
        "mp4" => "video/mp4",
        "avi" => "video/x-msvideo",
        "mov" => "video/quicktime",
        _ => "application/octet-stream",
    }
}
