use anyhow::Result;
use std::path::{Path, PathBuf};
use url::Url;

/// Download URLs the remote hands out for files it refuses to serve.
pub const ILLEGAL_DOWNLOAD_URL_PREFIX: &str = "https://pdsapi.aliyundrive.com/v2/file/download?";

/// Signed URLs closer than this to their expiry are treated as expired.
pub const URL_EXPIRY_MARGIN_SECS: i64 = 300;

const EXPIRES_PARAM: &str = "x-oss-expires";

pub fn get_filename_from_url(url_str: &str) -> Result<String> {
    let url = Url::parse(url_str)?;

    if let Some(segments) = url.path_segments() {
        if let Some(filename) = segments.last() {
            if !filename.is_empty() {
                return Ok(filename.to_string());
            }
        }
    }

    // Fallback if no filename found in path
    Ok(format!("download_{}", uuid::Uuid::new_v4()))
}

pub fn sanitize_filename(filename: &str) -> String {
    filename.replace(|c: char| !c.is_alphanumeric() && c != '.' && c != '-' && c != '_', "_")
}

pub fn is_url_expired(url: &str) -> bool {
    is_url_expired_at(url, chrono::Utc::now().timestamp())
}

/// A URL without an expiry parameter never expires. One that cannot be
/// parsed, or whose parameter is garbage, is expired.
pub fn is_url_expired_at(url: &str, now_unix: i64) -> bool {
    let Ok(url) = Url::parse(url) else {
        return true;
    };
    match url.query_pairs().find(|(k, _)| k == EXPIRES_PARAM) {
        None => false,
        Some((_, value)) => match value.parse::<i64>() {
            Ok(expires) => expires - now_unix <= URL_EXPIRY_MARGIN_SECS,
            Err(_) => true,
        },
    }
}

pub fn is_illegal_download_url(url: &str) -> bool {
    url.is_empty() || url.starts_with(ILLEGAL_DOWNLOAD_URL_PREFIX)
}

/// Total size from a `Content-Range` header such as `bytes 0-99/1000`.
pub fn parse_content_range_total(value: &str) -> Option<i64> {
    let (_, total) = value.trim().rsplit_once('/')?;
    total.trim().parse().ok()
}

/// Rewrites an https URL to plain http.
pub fn to_http(url: &str) -> String {
    match url.strip_prefix("https://") {
        Some(rest) => format!("http://{}", rest),
        None => url.to_string(),
    }
}

/// `name.ext` -> `name.ext.part`
pub fn part_path(target: &Path) -> PathBuf {
    let mut part = target.to_path_buf();
    if let Some(extension) = target.extension() {
        let mut ext = extension.to_os_string();
        ext.push(".part");
        part.set_extension(ext);
    } else {
        part.set_extension("part");
    }
    part
}

/// `name.ext` -> `name.ext.part.json`
pub fn state_path(target: &Path) -> PathBuf {
    part_path(target).with_extension("part.json")
}
