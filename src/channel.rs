//! URL handling for videos and channels.
//!
//! Everything here is pure string work: no subprocesses, no filesystem.

use url::Url;

use crate::error::{CoreError, CoreResult};

/// Parses and sanity-checks a user supplied URL before anything is launched.
pub fn validate_url(raw: &str) -> CoreResult<Url> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return Err(CoreError::validation("Missing required field: url"));
    }
    let parsed =
        Url::parse(trimmed).map_err(|err| CoreError::validation(format!("Invalid URL: {err}")))?;
    if !matches!(parsed.scheme(), "http" | "https") {
        return Err(CoreError::validation(format!(
            "Invalid URL: unsupported scheme {}",
            parsed.scheme()
        )));
    }
    if parsed.host_str().is_none_or(str::is_empty) {
        return Err(CoreError::validation("Invalid URL: missing host"));
    }
    Ok(parsed)
}

fn path_segments(url: &Url) -> Vec<&str> {
    url.path_segments()
        .map(|segments| segments.filter(|segment| !segment.is_empty()).collect())
        .unwrap_or_default()
}

/// Derives a subscription id from the URL shape alone, if the shape allows it.
///
/// `/channel/<id>` keeps its case because YouTube channel ids are
/// case-sensitive; handles and legacy names are case-insensitive and are
/// lower-cased so two spellings of the same channel collide.
pub fn channel_id_from_url(url: &Url) -> Option<String> {
    if let Some((_, value)) = url.query_pairs().find(|(key, _)| key == "channel_id")
        && !value.trim().is_empty()
    {
        return Some(value.trim().to_string());
    }

    let segments = path_segments(url);
    match segments.as_slice() {
        ["channel", id, ..] => Some((*id).to_string()),
        ["c", name, ..] | ["user", name, ..] => Some(name.to_ascii_lowercase()),
        [handle, ..] if handle.starts_with('@') && handle.len() > 1 => {
            Some(handle.to_ascii_lowercase())
        }
        _ => None,
    }
}

/// Extracts a video id from common single-video URL shapes so the archive can
/// be consulted before the extraction tool is ever invoked.
pub fn video_id_from_url(url: &Url) -> Option<String> {
    let host = url.host_str()?.to_ascii_lowercase();
    let segments = path_segments(url);

    if host == "youtu.be" || host.ends_with(".youtu.be") {
        return segments.first().map(|id| (*id).to_string());
    }

    if !(host == "youtube.com" || host.ends_with(".youtube.com")) {
        return None;
    }

    if segments.first() == Some(&"watch") {
        return url
            .query_pairs()
            .find(|(key, _)| key == "v")
            .map(|(_, value)| value.trim().to_string())
            .filter(|value| !value.is_empty());
    }

    match segments.as_slice() {
        ["shorts", id, ..] | ["live", id, ..] | ["embed", id, ..] => Some((*id).to_string()),
        _ => None,
    }
}

/// Normalizes a channel URL to its uploads tab so listings only cover regular
/// videos and never double-append `/videos`.
pub fn channel_listing_url(channel_url: &str) -> String {
    let trimmed = channel_url.trim();
    let without_fragment = trimmed.split('#').next().unwrap_or(trimmed);
    let base = without_fragment
        .split('?')
        .next()
        .unwrap_or(without_fragment)
        .trim_end_matches('/');

    // channel_id= URLs (RSS style) cannot take a tab suffix.
    if without_fragment.contains("channel_id=") {
        return without_fragment.to_string();
    }

    for tab in ["/videos", "/shorts", "/streams", "/featured", "/playlists"] {
        if let Some(stripped) = base.strip_suffix(tab) {
            return format!("{stripped}/videos");
        }
    }
    format!("{base}/videos")
}

/// Filesystem-safe directory name for a channel: word characters, spaces and
/// `-` survive, spaces become `_`.
pub fn sanitize_channel_dir(name: &str) -> Option<String> {
    let kept: String = name
        .chars()
        .filter(|c| c.is_alphanumeric() || *c == '_' || *c == '-' || c.is_whitespace())
        .collect();
    let cleaned = kept
        .split_whitespace()
        .collect::<Vec<_>>()
        .join("_");
    if cleaned.is_empty() {
        None
    } else {
        Some(cleaned)
    }
}

/// Directory name used when no channel name could be probed.
pub fn fallback_channel_dir(url: &Url) -> String {
    let segments = path_segments(url);
    match segments.as_slice() {
        ["channel", id, ..] => format!("channel_{id}"),
        ["c", name, ..] | ["user", name, ..] => (*name).to_string(),
        [handle, ..] if handle.starts_with('@') && handle.len() > 1 => {
            handle.trim_start_matches('@').to_string()
        }
        _ => "unknown_channel".to_string(),
    }
}
