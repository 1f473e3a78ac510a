use reqwest::header::HeaderValue;

/// A parsed `Content-Range: bytes start-end/total` value. `total` is `None` for `*`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ContentRange {
    pub start: u64,
    pub end: u64,
    pub total: Option<u64>,
}

/// `Range` header value for `[from, end]`, open-ended when `end` is unknown.
pub fn range_header(from: u64, end: Option<u64>) -> String {
    match end {
        Some(end) => format!("bytes={from}-{end}"),
        None => format!("bytes={from}-"),
    }
}

pub fn parse_content_length(value: Option<&HeaderValue>) -> Option<u64> {
    value
        .and_then(|v| v.to_str().ok())
        .and_then(|s| s.trim().parse().ok())
}

pub fn parse_content_range(value: Option<&HeaderValue>) -> Option<ContentRange> {
    let raw = value?.to_str().ok()?.trim();
    let rest = raw.strip_prefix("bytes")?.trim_start();
    let (span, total) = rest.split_once('/')?;
    let (start, end) = span.trim().split_once('-')?;
    let start: u64 = start.trim().parse().ok()?;
    let end: u64 = end.trim().parse().ok()?;
    if end < start {
        return None;
    }
    let total = match total.trim() {
        "*" => None,
        other => Some(other.parse().ok()?),
    };
    Some(ContentRange { start, end, total })
}

/// Only an explicit `Accept-Ranges: none` counts as a refusal; absence says nothing.
pub fn refuses_ranges(value: Option<&HeaderValue>) -> bool {
    value
        .and_then(|v| v.to_str().ok())
        .map(|v| v.trim().eq_ignore_ascii_case("none"))
        .unwrap_or(false)
}
