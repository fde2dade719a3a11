//! Online-meeting URL detection for free-text event fields.
//!
//! Providers only sometimes report a structured join link. When they do not,
//! the location and description are scanned for a known conferencing host.

use std::sync::LazyLock;

use regex::Regex;
use url::Url;

static URL_REGEX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r#"https?://[^\s<>"'\)\]]+"#).expect("Invalid URL regex"));

/// Outlook SafeLinks wrap the real target in a `url` query parameter.
static SAFELINK_REGEX: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"https?://[^/]*safelinks\.protection\.outlook\.com/?\?[^?]*url=([^&]+)")
        .expect("Invalid SafeLink regex")
});

/// Host suffixes recognized as conferencing services.
const MEETING_HOSTS: &[&str] = &[
    "zoom.us",
    "zoomgov.com",
    "meet.google.com",
    "teams.microsoft.com",
    "teams.live.com",
    "meet.jit.si",
    "webex.com",
];

/// Returns the first conferencing URL found in `text`, with SafeLinks unwrapped.
pub fn find_meeting_url(text: &str) -> Option<String> {
    URL_REGEX
        .find_iter(text)
        .map(|m| unwrap_safelink(m.as_str().trim_end_matches(['.', ',', ';'])))
        .find(|candidate| is_meeting_url(candidate))
}

/// Returns true if the URL's host belongs to a known conferencing service.
pub fn is_meeting_url(candidate: &str) -> bool {
    let Ok(parsed) = Url::parse(candidate) else {
        return false;
    };
    let Some(host) = parsed.host_str() else {
        return false;
    };
    let host = host.to_ascii_lowercase();
    MEETING_HOSTS
        .iter()
        .any(|known| host == *known || host.ends_with(&format!(".{known}")))
}

fn unwrap_safelink(url: &str) -> String {
    if let Some(caps) = SAFELINK_REGEX.captures(url)
        && let Some(encoded) = caps.get(1)
        && let Ok(decoded) = urlencoding::decode(encoded.as_str())
    {
        return decoded.into_owned();
    }
    url.to_string()
}
