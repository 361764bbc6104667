// src/validation/mod.rs

//! Checks applied to every externally triggered control request, plus the
//! sanitizers that keep bad settings out of daemon argument lists.

mod rate_limit;

pub use rate_limit::RateLimiter;

use crate::errors::ValidationError;
use crate::settings::INTERNAL_SCHEME;
use directories::{BaseDirs, UserDirs};
use serde_json::Value;
use std::path::{Component, Path, PathBuf};
use url::Url;

pub const DEFAULT_PROXY_PORT: u16 = 8080;
pub const DEFAULT_STORAGE_PORT: u16 = 5555;
pub const DEFAULT_VERBOSITY: u8 = 1;
pub const MIN_PORT: i64 = 1024;
pub const MAX_VERBOSITY: i64 = 5;
pub const BAG_ID_LEN: usize = 64;

const ALLOWED_SCHEMES: &[&str] = &["http", "https"];
const DANGEROUS_SCHEMES: &[&str] = &["javascript", "data", "file", "vbscript"];

/// Validate an address typed into the navigation bar.
///
/// Internal pages pass through untouched. Anything without a scheme is
/// treated as `http://`. Returns the normalized URL.
pub fn validate_navigation_url(input: &str) -> Result<String, ValidationError> {
    let trimmed = input.trim();
    if trimmed.is_empty() {
        return Err(ValidationError::EmptyUrl);
    }

    let internal_prefix = format!("{INTERNAL_SCHEME}://");
    if trimmed
        .get(..internal_prefix.len())
        .is_some_and(|head| head.eq_ignore_ascii_case(&internal_prefix))
    {
        return Ok(trimmed.to_string());
    }

    if let Some(scheme) = leading_scheme(trimmed) {
        if DANGEROUS_SCHEMES.contains(&scheme.as_str()) {
            return Err(ValidationError::DangerousScheme(format!("{scheme}:")));
        }
    }

    let candidate = if trimmed.contains("://") {
        trimmed.to_string()
    } else {
        format!("http://{trimmed}")
    };
    let parsed = Url::parse(&candidate).map_err(|_| ValidationError::MalformedUrl)?;

    let scheme = parsed.scheme();
    if DANGEROUS_SCHEMES.contains(&scheme) {
        return Err(ValidationError::DangerousScheme(format!("{scheme}:")));
    }
    if !ALLOWED_SCHEMES.contains(&scheme) {
        return Err(ValidationError::UnsupportedScheme(format!("{scheme}:")));
    }
    if parsed.host_str().map_or(true, str::is_empty) {
        return Err(ValidationError::MalformedUrl);
    }
    Ok(parsed.to_string())
}

/// Lower-cased scheme if `input` starts with something shaped like one.
fn leading_scheme(input: &str) -> Option<String> {
    let (head, _) = input.split_once(':')?;
    let mut chars = head.chars();
    let first = chars.next()?;
    if !first.is_ascii_alphabetic() {
        return None;
    }
    if !chars.all(|c| c.is_ascii_alphanumeric() || matches!(c, '+' | '-' | '.')) {
        return None;
    }
    Some(head.to_ascii_lowercase())
}

/// A bag id is exactly 64 hex digits, either case.
pub fn is_valid_bag_id(id: &str) -> bool {
    id.len() == BAG_ID_LEN && hex::decode(id).is_ok()
}

/// Same as [`is_valid_bag_id`] for untyped request payloads.
pub fn is_valid_bag_id_value(value: &Value) -> bool {
    value.as_str().is_some_and(is_valid_bag_id)
}

/// Validate a user-chosen download directory.
pub fn validate_download_path(input: &str) -> Result<PathBuf, ValidationError> {
    let trimmed = input.trim();
    if trimmed.is_empty() {
        return Err(ValidationError::EmptyPath);
    }
    let raw = Path::new(trimmed);
    if !raw.is_absolute() {
        return Err(ValidationError::RelativePath(trimmed.to_string()));
    }

    let normalized = normalize(raw);
    let shown = normalized.display().to_string();

    if protected_roots().iter().any(|root| is_under(&normalized, root)) {
        return Err(ValidationError::ProtectedPath(shown));
    }
    if !allowed_roots().iter().any(|root| is_under(&normalized, root)) {
        return Err(ValidationError::OutsideAllowedRoots(shown));
    }
    Ok(normalized)
}

/// Resolve `.` and `..` without touching the filesystem.
pub fn normalize(path: &Path) -> PathBuf {
    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                out.pop();
            }
            other => out.push(other.as_os_str()),
        }
    }
    out
}

#[cfg(windows)]
fn is_under(path: &Path, root: &Path) -> bool {
    let lower = |p: &Path| PathBuf::from(p.to_string_lossy().to_lowercase());
    lower(path).starts_with(lower(root))
}

#[cfg(not(windows))]
fn is_under(path: &Path, root: &Path) -> bool {
    path.starts_with(root)
}

#[cfg(target_os = "windows")]
fn protected_roots() -> Vec<PathBuf> {
    ["C:\\Windows", "C:\\Program Files", "C:\\Program Files (x86)", "C:\\ProgramData"]
        .iter()
        .map(PathBuf::from)
        .collect()
}

#[cfg(target_os = "macos")]
fn protected_roots() -> Vec<PathBuf> {
    ["/System", "/Library", "/bin", "/sbin", "/usr", "/etc", "/private/etc", "/dev"]
        .iter()
        .map(PathBuf::from)
        .collect()
}

#[cfg(not(any(target_os = "windows", target_os = "macos")))]
fn protected_roots() -> Vec<PathBuf> {
    [
        "/bin", "/sbin", "/usr", "/etc", "/boot", "/dev", "/proc", "/sys", "/lib", "/lib32",
        "/lib64", "/var/lib", "/var/log",
    ]
    .iter()
    .map(PathBuf::from)
    .collect()
}

fn allowed_roots() -> Vec<PathBuf> {
    let mut roots = vec![std::env::temp_dir()];
    if let Some(base) = BaseDirs::new() {
        roots.push(base.home_dir().to_path_buf());
        roots.push(base.data_dir().to_path_buf());
    }
    if let Some(download) = UserDirs::new().and_then(|u| u.download_dir().map(Path::to_path_buf)) {
        roots.push(download);
    }
    #[cfg(target_os = "macos")]
    roots.push(PathBuf::from("/Volumes"));
    #[cfg(all(unix, not(target_os = "macos")))]
    roots.extend(["/media", "/mnt", "/run/media"].iter().map(PathBuf::from));
    roots
}

/// Keep a port inside the unprivileged range, else use `default`.
pub fn sanitize_port(raw: i64, default: u16) -> u16 {
    if raw >= MIN_PORT {
        u16::try_from(raw).unwrap_or(default)
    } else {
        default
    }
}

/// Port from an untyped value; anything non-numeric gets `default`.
pub fn sanitize_port_value(raw: &Value, default: u16) -> u16 {
    raw.as_i64().map_or(default, |p| sanitize_port(p, default))
}

/// Clamp daemon verbosity to `0..=5`, else use `default`.
pub fn sanitize_verbosity(raw: i64, default: u8) -> u8 {
    if (0..=MAX_VERBOSITY).contains(&raw) {
        raw as u8
    } else {
        default
    }
}
