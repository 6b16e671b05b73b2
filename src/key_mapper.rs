//! Key to path mapping.
//!
//! Client keys are `/`-separated and may be percent-encoded. They are turned
//! into [`PathSegments`] whose parts only contain `[A-Za-z0-9-]`, except for
//! the final part which keeps its extension (`.` followed by lower-case
//! `[a-z0-9]+`). Since `.` can only appear as the first character of that
//! extension, a segment can never be `.` or `..`.
//!
//! The mapping is a pure function of the key. The conversion stage depends
//! on this to re-derive the same location the write used.

use std::fmt;

pub const KEY_SEPARATOR: char = '/';

/// Replaces intermediate segments that sanitize to nothing, so the depth of
/// the hierarchy is preserved.
pub const EMPTY_SEGMENT_PLACEHOLDER: &str = "untitled";

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("invalid key {key:?}: {reason}")]
pub struct InvalidKey {
    pub key: String,
    pub reason: &'static str,
}

impl InvalidKey {
    fn new(key: &str, reason: &'static str) -> Self {
        Self {
            key: key.to_string(),
            reason,
        }
    }
}

/// Sanitized, ordered components addressing one stored item.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PathSegments {
    segments: Vec<String>,
    extension: Option<String>,
}

impl PathSegments {
    pub fn segments(&self) -> &[String] {
        &self.segments
    }

    /// Top-level segment, used as the item's category.
    pub fn category(&self) -> &str {
        &self.segments[0]
    }

    pub fn file_name(&self) -> &str {
        &self.segments[self.segments.len() - 1]
    }

    /// Lower-cased extension of the final segment, including the leading dot.
    pub fn extension(&self) -> Option<&str> {
        self.extension.as_deref()
    }

    /// Final segment without its extension.
    pub fn file_stem(&self) -> &str {
        let name = self.file_name();
        match &self.extension {
            Some(ext) => &name[..name.len() - ext.len()],
            None => name,
        }
    }

    pub fn parent(&self) -> &[String] {
        &self.segments[..self.segments.len() - 1]
    }

    /// Sibling item in the same directory with the final segment's extension
    /// replaced. `extension` must itself be a valid extension.
    pub fn with_extension(&self, extension: &str) -> Option<PathSegments> {
        let extension = parse_extension(extension)?;
        let mut segments = self.parent().to_vec();
        segments.push(format!("{}{}", self.file_stem(), extension));
        Some(PathSegments {
            segments,
            extension: Some(extension),
        })
    }
}

impl fmt::Display for PathSegments {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&map_path_to_key(self))
    }
}

/// Maps a raw client key onto sanitized path segments.
pub fn map_key_to_path(key: &str) -> Result<PathSegments, InvalidKey> {
    let raw: Vec<&str> = key.split(KEY_SEPARATOR).filter(|s| !s.is_empty()).collect();
    let Some((last, dirs)) = raw.split_last() else {
        return Err(InvalidKey::new(key, "key has no segments"));
    };

    let file_name = base_name(&decode_segment(key, last)?);
    let (stem, extension) = split_extension(&file_name);

    let mut segments = Vec::with_capacity(raw.len());
    for dir in dirs {
        let decoded = base_name(&decode_segment(key, dir)?);
        let decoded = match extension.as_deref() {
            Some(ext) => decoded.strip_suffix(ext).unwrap_or(&decoded).to_string(),
            None => decoded,
        };
        let sanitized = sanitize(&decoded);
        if sanitized.is_empty() {
            segments.push(EMPTY_SEGMENT_PLACEHOLDER.to_string());
        } else {
            segments.push(sanitized);
        }
    }

    let stem = sanitize(stem);
    if stem.is_empty() {
        return Err(InvalidKey::new(
            key,
            "file name is empty after sanitization",
        ));
    }
    segments.push(format!("{}{}", stem, extension.as_deref().unwrap_or("")));

    Ok(PathSegments {
        segments,
        extension,
    })
}

/// Display form of mapped segments, also the byte store key.
pub fn map_path_to_key(path: &PathSegments) -> String {
    path.segments.join("/")
}

fn decode_segment(key: &str, segment: &str) -> Result<String, InvalidKey> {
    urlencoding::decode(segment)
        .map(|s| s.into_owned())
        .map_err(|_| InvalidKey::new(key, "segment is not valid utf-8 once decoded"))
}

/// Drops everything up to the last path separator a decoded segment may
/// contain (`%2F`, `%5C`).
fn base_name(decoded: &str) -> String {
    let trimmed = decoded.trim_end_matches(['/', '\\']);
    match trimmed.rfind(['/', '\\']) {
        Some(idx) => trimmed[idx + 1..].to_string(),
        None => trimmed.to_string(),
    }
}

fn split_extension(file_name: &str) -> (&str, Option<String>) {
    match file_name.rfind('.') {
        Some(idx) if idx > 0 => match parse_extension(&file_name[idx..]) {
            Some(ext) => (&file_name[..idx], Some(ext)),
            None => (file_name, None),
        },
        _ => (file_name, None),
    }
}

/// Accepts `.` followed by one or more ASCII alphanumerics, lower-cased.
pub fn parse_extension(candidate: &str) -> Option<String> {
    let rest = candidate.strip_prefix('.')?;
    if rest.is_empty() || !rest.chars().all(|c| c.is_ascii_alphanumeric()) {
        return None;
    }
    Some(candidate.to_ascii_lowercase())
}

/// Runs of characters outside `[A-Za-z0-9]` collapse into a single hyphen;
/// leading and trailing hyphens are dropped.
pub fn sanitize(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    let mut pending_hyphen = false;
    for c in raw.trim().chars() {
        if c.is_ascii_alphanumeric() {
            if pending_hyphen && !out.is_empty() {
                out.push('-');
            }
            pending_hyphen = false;
            out.push(c);
        } else {
            pending_hyphen = true;
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;

    use super::*;

    fn segments(key: &str) -> Vec<String> {
        map_key_to_path(key).unwrap().segments().to_vec()
    }

    #[test]
    fn test_plain_key() {
        let path = map_key_to_path("documents/reports/q1.txt").unwrap();
        assert_eq!(path.segments(), ["documents", "reports", "q1.txt"]);
        assert_eq!(path.category(), "documents");
        assert_eq!(path.extension(), Some(".txt"));
        assert_eq!(path.file_stem(), "q1");
        assert_eq!(path.to_string(), "documents/reports/q1.txt");
    }

    #[test]
    fn test_traversal_is_neutralized() {
        assert_eq!(
            segments("a/b/../../c.pdf"),
            ["a", "b", "untitled", "untitled", "c.pdf"]
        );
        assert_eq!(segments("../../etc/passwd"), ["untitled", "untitled", "etc", "passwd"]);
        // encoded separators only keep the last component
        assert_eq!(segments("docs/..%2F..%2Fetc/x.txt"), ["docs", "etc", "x.txt"]);
    }

    #[test]
    fn test_percent_decoding_and_sanitizing() {
        assert_eq!(
            segments("tests/sub1/sub%20%20__2/sub%20_-_!%203/file%20asd%20a%20123%20%20%20___%20!@.txt"),
            ["tests", "sub1", "sub-2", "sub-3", "file-asd-a-123.txt"]
        );
        assert_eq!(segments("Reports 2024/Q1 Summary.PDF"), ["Reports-2024", "Q1-Summary.pdf"]);
    }

    #[test]
    fn test_separator_runs_are_ignored() {
        assert_eq!(segments("/documents//x.txt/"), ["documents", "x.txt"]);
    }

    #[test]
    fn test_directory_with_matching_extension_is_stripped() {
        assert_eq!(segments("docs/report.pdf/report.pdf"), ["docs", "report", "report.pdf"]);
        assert_eq!(segments("docs/v1.2/notes.txt"), ["docs", "v1-2", "notes.txt"]);
    }

    #[test]
    fn test_extension_grammar() {
        assert_eq!(segments("a/archive.tar.GZ"), ["a", "archive-tar.gz"]);
        assert_eq!(segments("a/.bashrc"), ["a", "bashrc"]);
        assert_eq!(segments("a/weird.p-df"), ["a", "weird-p-df"]);
        let path = map_key_to_path("a/no_extension").unwrap();
        assert_eq!(path.extension(), None);
        assert_eq!(path.file_name(), "no-extension");
    }

    #[test]
    fn test_invalid_keys() {
        for key in ["", "/", "///", "docs/!!!.pdf", "docs/%%%", "docs/%2E%2E"] {
            assert!(map_key_to_path(key).is_err(), "{key:?} should be rejected");
        }
        assert!(map_key_to_path("docs/%FF.txt").is_err());
    }

    #[test]
    fn test_with_extension() {
        let path = map_key_to_path("documents/reports/q1.txt").unwrap();
        let derived = path.with_extension(".md").unwrap();
        assert_eq!(derived.to_string(), "documents/reports/q1.md");
        assert_eq!(derived.extension(), Some(".md"));
        assert!(path.with_extension("md").is_none());

        let bare = map_key_to_path("documents/readme").unwrap();
        assert_eq!(bare.with_extension(".md").unwrap().to_string(), "documents/readme.md");
    }

    #[test]
    fn test_sanitize() {
        assert_eq!(sanitize("  --hello  world--  "), "hello-world");
        assert_eq!(sanitize("..."), "");
        assert_eq!(sanitize("ünïcödé"), "n-c-d");
    }

    proptest! {
        #[test]
        fn prop_mapping_is_deterministic(key in ".*") {
            prop_assert_eq!(map_key_to_path(&key), map_key_to_path(&key));
        }

        #[test]
        fn prop_segments_are_safe(key in "[a-zA-Z0-9./%\\\\ _!-]{0,64}") {
            if let Ok(path) = map_key_to_path(&key) {
                let last = path.segments().len() - 1;
                for (idx, segment) in path.segments().iter().enumerate() {
                    prop_assert!(!segment.is_empty());
                    prop_assert!(segment != "." && segment != "..");
                    prop_assert!(!segment.starts_with('-') && !segment.starts_with('.'));
                    let body = if idx == last { path.file_stem() } else { segment.as_str() };
                    prop_assert!(body.chars().all(|c| c.is_ascii_alphanumeric() || c == '-'));
                    prop_assert!(!body.ends_with('-'));
                }
            }
        }

        #[test]
        fn prop_mapping_is_a_fixed_point(key in "[a-zA-Z0-9./ _-]{1,64}") {
            if let Ok(path) = map_key_to_path(&key) {
                let again = map_key_to_path(&path.to_string()).unwrap();
                prop_assert_eq!(again.segments(), path.segments());
            }
        }
    }
}
