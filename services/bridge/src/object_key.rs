//! Object key construction.
//!
//! Keys look like `<folder>/<name>_<YYYYMMDD_HHMMSS>_<suffix>.<ext>`. The suffix is eight
//! random hex characters followed by a four-hex-digit process-local sequence, so one process
//! cannot hand out the same key twice within 65,536 consecutive generations, and separate
//! processes are kept apart by the random half. Nothing checks the bucket for an existing key.

use crate::upload_validator::split_filename;
use chrono::{DateTime, Utc};
use std::sync::atomic::{AtomicU16, Ordering};
use uuid::Uuid;

/// Generates unique object keys for uploads
#[derive(Debug, Default)]
pub struct KeyGenerator {
    sequence: AtomicU16,
}

impl KeyGenerator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Generate a key for `original_filename` under `folder` using the current time
    pub fn generate_key(&self, original_filename: &str, folder: &str) -> String {
        self.generate_key_at(original_filename, folder, Utc::now())
    }

    /// Generate a key with an explicit timestamp
    pub fn generate_key_at(
        &self,
        original_filename: &str,
        folder: &str,
        now: DateTime<Utc>,
    ) -> String {
        let (stem, extension) = split_filename(original_filename);
        let mut name = sanitize_name(stem);
        if name.is_empty() {
            name = "file".to_string();
        }
        let extension = extension.map(|ext| format!(".{ext}")).unwrap_or_default();

        let timestamp = now.format("%Y%m%d_%H%M%S");
        let suffix = self.next_suffix();

        let folder = folder.trim_matches('/');
        if folder.is_empty() {
            format!("{name}_{timestamp}_{suffix}{extension}")
        } else {
            format!("{folder}/{name}_{timestamp}_{suffix}{extension}")
        }
    }

    fn next_suffix(&self) -> String {
        let random = Uuid::new_v4().simple().to_string();
        let sequence = self.sequence.fetch_add(1, Ordering::Relaxed);
        format!("{}{:04x}", &random[..8], sequence)
    }
}

/// Lowercase the base name and replace whitespace with underscores
fn sanitize_name(name: &str) -> String {
    name.chars()
        .map(|c| if c.is_whitespace() { '_' } else { c })
        .collect::<String>()
        .to_lowercase()
}

/// Folder for a user's profile image
pub fn user_profile_folder(user_id: i64) -> String {
    format!("users/{user_id}/profile")
}

/// Folder for an article cover image
pub fn article_cover_folder(article_id: i64) -> String {
    format!("articles/{article_id}/cover")
}

/// Folder for e-book files
pub fn ebook_folder() -> String {
    "ebooks".to_string()
}

/// Folder for an e-book thumbnail
pub fn ebook_thumbnail_folder(ebook_id: i64) -> String {
    format!("ebooks/{ebook_id}/thumbnail")
}

/// Folder for a user's harvest proof photos
pub fn harvest_proof_folder(user_id: i64) -> String {
    format!("harvests/{user_id}/proof")
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use std::collections::HashSet;

    #[test]
    fn test_key_layout() {
        let generator = KeyGenerator::new();
        let now = Utc.with_ymd_and_hms(2024, 1, 15, 10, 30, 45).unwrap();

        let key = generator.generate_key_at("My Nest Photo.JPG", &user_profile_folder(42), now);

        assert!(key.starts_with("users/42/profile/my_nest_photo_20240115_103045_"));
        assert!(key.ends_with(".JPG"));

        let suffix = key
            .trim_start_matches("users/42/profile/my_nest_photo_20240115_103045_")
            .trim_end_matches(".JPG");
        assert_eq!(suffix.len(), 12);
        assert!(suffix.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn test_key_without_folder() {
        let generator = KeyGenerator::new();
        let key = generator.generate_key("report.pdf", "");
        assert!(!key.contains('/'));
        assert!(key.starts_with("report_"));
        assert!(key.ends_with(".pdf"));
    }

    #[test]
    fn test_directory_components_are_stripped() {
        let generator = KeyGenerator::new();
        let key = generator.generate_key("../../etc/passwd.png", "ebooks");
        assert!(key.starts_with("ebooks/passwd_"));
    }

    #[test]
    fn test_dotfile_keeps_extension() {
        let generator = KeyGenerator::new();
        let now = Utc.with_ymd_and_hms(2024, 1, 15, 10, 30, 45).unwrap();

        let key = generator.generate_key_at(".png", &article_cover_folder(7), now);

        assert!(key.starts_with("articles/7/cover/file_20240115_103045_"));
        assert!(key.ends_with(".png"));
    }

    #[test]
    fn test_folders() {
        assert_eq!(article_cover_folder(7), "articles/7/cover");
        assert_eq!(ebook_folder(), "ebooks");
        assert_eq!(ebook_thumbnail_folder(3), "ebooks/3/thumbnail");
        assert_eq!(harvest_proof_folder(9), "harvests/9/proof");
    }

    #[test]
    fn test_no_collisions_in_same_folder() {
        let generator = KeyGenerator::new();
        let now = Utc::now();

        let keys: HashSet<String> = (0..10_000)
            .map(|_| generator.generate_key_at("profile.png", "users/1/profile", now))
            .collect();

        assert_eq!(keys.len(), 10_000);
    }

    #[test]
    fn test_concurrent_generation_is_unique() {
        let generator = std::sync::Arc::new(KeyGenerator::new());

        let handles: Vec<_> = (0..2)
            .map(|_| {
                let generator = generator.clone();
                std::thread::spawn(move || {
                    (0..5_000)
                        .map(|_| generator.generate_key("same.png", "users/1/profile"))
                        .collect::<Vec<_>>()
                })
            })
            .collect();

        let mut keys = HashSet::new();
        for handle in handles {
            for key in handle.join().unwrap() {
                assert!(keys.insert(key));
            }
        }
        assert_eq!(keys.len(), 10_000);
    }
}
