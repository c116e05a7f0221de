//! Dropbox destination resolution: filename sanitization, OpenBis barcode
//! handling, and rule matching.
//!
//! This module is pure (no filesystem mutation beyond the read-only checks
//! performed by [`DropboxConfig::validate`]); [`crate::staging`] is the only
//! place that actually creates or moves files.

use std::path::{Path, PathBuf};

use regex::Regex;
use serde_json::Value;

use crate::error::{Result, StorageError};

/// `Q[A-X0-9]{4}[0-9]{3}[A-X][A-X0-9]`, with a mod-34 checksum in the final
/// character. See [`is_valid_barcode`].
const BARCODE_PATTERN: &str = "Q[A-X0-9]{4}[0-9]{3}[A-X][A-X0-9]";

const FINISHED_MARKER_PREFIX: &str = ".MARKER_is_finished_";

/// One rule in `storage.dropboxes`.
#[derive(Debug, Clone)]
pub struct DropboxRule {
    /// Regular expression matched against the cleaned file name.
    pub regexp: String,
    /// Absolute destination directory for files matching this rule.
    pub path: PathBuf,
    /// Restrict this rule to uploads from these origins, if present.
    pub origin: Option<Vec<String>>,
    /// Whether this rule applies to file uploads. Default `true`.
    pub match_file: bool,
    /// Whether this rule applies to directory uploads. Default `true`.
    pub match_dir: bool,
    /// Whether the cleaned name must carry exactly one valid barcode.
    /// Default `true`.
    pub requires_barcode: bool,
}

impl DropboxRule {
    fn matches(&self, origin: &str, name: &str, is_dir: bool) -> Result<bool> {
        if let Some(origins) = &self.origin
            && !origins.iter().any(|o| o == origin)
        {
            return Ok(false);
        }
        if is_dir && !self.match_dir {
            return Ok(false);
        }
        if !is_dir && !self.match_file {
            return Ok(false);
        }
        if self.requires_barcode {
            match extract_barcode(name) {
                Ok(barcode) if is_valid_barcode(&barcode) => {}
                _ => return Ok(false),
            }
        }
        let re = Regex::new(&self.regexp)
            .map_err(|e| StorageError::InvalidConfig(format!("bad regexp {:?}: {e}", self.regexp)))?;
        Ok(re.is_match(name))
    }
}

/// The `storage` section of the server configuration.
#[derive(Debug, Clone)]
pub struct DropboxConfig {
    /// Root under which plain (non-passthrough) destinations may fall back.
    /// Retained for parity with the original configuration schema; concrete
    /// destinations always come from `manual` or a matching rule.
    pub path: PathBuf,
    /// Root for `passthrough`-directed uploads.
    pub manual: PathBuf,
    /// Ordered list of dropbox rules; first match wins.
    pub dropboxes: Vec<DropboxRule>,
}

impl DropboxConfig {
    /// Validate the configuration eagerly: every rule's regex must compile,
    /// every rule's path must be an absolute, existing directory. Ported
    /// from `Storage.check_openbis` in the original implementation.
    pub fn validate(&self) -> Result<()> {
        if !self.manual.is_dir() {
            return Err(StorageError::InvalidConfig(format!(
                "storage.manual is not a directory: {}",
                self.manual.display()
            )));
        }
        for rule in &self.dropboxes {
            Regex::new(&rule.regexp).map_err(|e| {
                StorageError::InvalidConfig(format!("invalid regexp {:?}: {e}", rule.regexp))
            })?;
            if !rule.path.is_absolute() {
                return Err(StorageError::InvalidConfig(format!(
                    "dropbox path is not absolute: {}",
                    rule.path.display()
                )));
            }
            if !rule.path.is_dir() {
                return Err(StorageError::InvalidConfig(format!(
                    "dropbox path is not a directory: {}",
                    rule.path.display()
                )));
            }
        }
        Ok(())
    }

    /// Resolve the destination directory (not the full file path) for an
    /// incoming upload, given its cleaned name, client-supplied metadata,
    /// and verified origin.
    pub fn resolve_dest_dir(&self, origin: &str, clean_name: &str, meta: &Value) -> Result<PathBuf> {
        if let Some(passthrough) = meta.get("passthrough") {
            let passthrough = passthrough.as_str().ok_or_else(|| {
                StorageError::InvalidUploadRequest("passthrough must be a string".into())
            })?;
            return dest_from_passthrough(&self.manual, passthrough);
        }

        for rule in &self.dropboxes {
            if rule.matches(origin, clean_name, false)? {
                return Ok(rule.path.clone());
            }
        }

        Err(StorageError::InvalidUploadRequest(
            "file does not match any rule for incoming files".into(),
        ))
    }
}

fn dest_from_passthrough(manual_root: &Path, passthrough: &str) -> Result<PathBuf> {
    if !passthrough.chars().all(|c| c.is_ascii_alphanumeric() || c == '_') || passthrough.is_empty()
    {
        return Err(StorageError::InvalidUploadRequest(
            "only alphanumeric symbols and '_' are allowed as passthrough argument".into(),
        ));
    }
    Ok(manual_root.join(passthrough))
}

/// Generate a sanitized, alphanumeric-plus-`._` filename for `name`, ported
/// from `clean_filename` in the original implementation.
///
/// Rejects `.`, `..`, names starting with `.`, names containing a path
/// separator, names whose cleaned stem is empty, and suffixes containing
/// invalid characters.
pub fn clean_filename(name: &str) -> Result<String> {
    if name.contains('/') || name.contains('\\') {
        return Err(StorageError::InvalidUploadRequest(format!(
            "invalid filename: {name}"
        )));
    }
    if name == "." || name == ".." || name.starts_with('.') {
        return Err(StorageError::InvalidUploadRequest(format!(
            "invalid filename: {name}"
        )));
    }

    let (stem, suffix) = split_stem_suffix(name);

    let allowed = |c: char| c.is_ascii_alphanumeric() || c == '_' || c == '.';
    let cleaned_stem: String = stem.chars().filter(|&c| allowed(c)).collect();
    let cleaned_stem = cleaned_stem.trim_start_matches('.').to_string();
    if cleaned_stem.is_empty() {
        return Err(StorageError::InvalidUploadRequest(format!(
            "invalid file name: {stem}{suffix}"
        )));
    }
    if !suffix.chars().all(allowed) {
        return Err(StorageError::InvalidUploadRequest(format!(
            "bad file suffix: {suffix}"
        )));
    }

    Ok(format!("{cleaned_stem}{suffix}"))
}

fn split_stem_suffix(name: &str) -> (&str, &str) {
    match name.rfind('.') {
        Some(0) | None => (name, ""),
        Some(idx) => (&name[..idx], &name[idx..]),
    }
}

/// Extract the single OpenBis barcode from a (cleaned) file name's stem.
///
/// Returns `Err` if no barcode is present, or if more than one distinct
/// barcode is found.
pub fn extract_barcode(name: &str) -> Result<String> {
    let (stem, _suffix) = split_stem_suffix(name);
    let re = Regex::new(BARCODE_PATTERN).expect("static barcode pattern is valid");

    let found: Vec<&str> = re.find_iter(stem).map(|m| m.as_str()).collect();
    if found.is_empty() {
        return Err(StorageError::InvalidUploadRequest(format!(
            "no barcode found in {name}"
        )));
    }

    let unique: std::collections::HashSet<&str> = found.iter().copied().collect();
    if unique.len() > 1 {
        return Err(StorageError::InvalidUploadRequest(format!(
            "more than one barcode in filename: {name}"
        )));
    }

    Ok(found[0].to_string())
}

/// Check whether `barcode` matches the OpenBis barcode pattern and carries a
/// valid mod-34 checksum in its final character.
#[must_use]
pub fn is_valid_barcode(barcode: &str) -> bool {
    let anchored = format!("^{BARCODE_PATTERN}$");
    let re = Regex::new(&anchored).expect("static anchored barcode pattern is valid");
    if !re.is_match(barcode) {
        return false;
    }

    let bytes = barcode.as_bytes();
    let body = &bytes[..bytes.len() - 1];
    let checksum: u32 = body
        .iter()
        .enumerate()
        .map(|(i, &c)| u32::from(c) * (i as u32 + 1))
        .sum();
    let mut checksum = checksum % 34 + 48;
    if checksum > 57 {
        checksum += 7;
    }
    bytes[bytes.len() - 1] == checksum as u8
}

/// Generate a sane, barcode-prefixed canonical name for `name`, ported from
/// `generate_openbis_name` in the original implementation. Not on the
/// upload hot path; used by downstream tooling that expects a canonical
/// `<barcode>_<rest>` name.
pub fn generate_openbis_name(name: &str) -> Result<String> {
    let cleaned = clean_filename(name)?;
    let barcode = extract_barcode(&cleaned)?;
    let rest = cleaned.replacen(&barcode, "", 1);
    Ok(format!("{barcode}_{rest}"))
}

/// The path of the "finished" marker file for a completed destination, if
/// its basename carries a valid barcode. Returns `None` when no marker
/// should be written (best-effort step, never fatal).
#[must_use]
pub fn finished_marker_path(destination: &Path) -> Option<PathBuf> {
    let basename = destination.file_name()?.to_str()?;
    let barcode = extract_barcode(basename).ok()?;
    if !is_valid_barcode(&barcode) {
        return None;
    }
    let parent = destination.parent()?;
    Some(parent.join(format!("{FINISHED_MARKER_PREFIX}{basename}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn clean_filename_rejects_dots_and_separators() {
        assert!(clean_filename(".").is_err());
        assert!(clean_filename("..").is_err());
        assert!(clean_filename(".hidden").is_err());
        assert!(clean_filename("a/b").is_err());
        assert!(clean_filename("a\\b").is_err());
    }

    #[test]
    fn clean_filename_strips_invalid_chars() {
        assert_eq!(clean_filename("a b(c).raw").unwrap(), "abc.raw");
    }

    #[test]
    fn clean_filename_rejects_empty_stem() {
        assert!(clean_filename("@#$.raw").is_err());
    }

    #[test]
    fn clean_filename_rejects_bad_suffix() {
        assert!(clean_filename("good.r@w").is_err());
    }

    #[test]
    fn barcode_checksum_matches_reference() {
        // QJFDC010EU from the original implementation's doctest.
        assert!(is_valid_barcode("QJFDC010EU"));
        assert!(!is_valid_barcode("QJFDC010EX"));
    }

    #[test]
    fn extract_barcode_finds_single_barcode() {
        assert_eq!(extract_barcode("QJFDC010EU_sample.raw").unwrap(), "QJFDC010EU");
    }

    #[test]
    fn extract_barcode_rejects_none_or_multiple() {
        assert!(extract_barcode("no_barcode_here.raw").is_err());
        assert!(extract_barcode("QJFDC010EU_and_QJFDC010EU2.raw").is_err());
    }

    #[test]
    fn generate_openbis_name_prefixes_barcode() {
        // `clean_filename` keeps `.` in its allowed charset, so the stray
        // dot next to the barcode survives cleaning; `generate_openbis_name`
        // only moves the barcode to the front, it does not re-clean.
        assert_eq!(
            generate_openbis_name("stpidname(QJFDC010EU.).raw").unwrap(),
            "QJFDC010EU_stpidname..raw"
        );
    }

    #[test]
    fn passthrough_rejects_non_word_chars() {
        let root = PathBuf::from("/manual");
        assert!(dest_from_passthrough(&root, "te st").is_err());
        assert!(dest_from_passthrough(&root, "te/st").is_err());
        assert_eq!(
            dest_from_passthrough(&root, "test").unwrap(),
            PathBuf::from("/manual/test")
        );
    }
}
