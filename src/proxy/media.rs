//! Target classification and media types.

use url::Url;

pub const MANIFEST_CONTENT_TYPE: &str = "application/vnd.apple.mpegurl";
pub const TRANSPORT_STREAM_CONTENT_TYPE: &str = "video/MP2T";
pub const FALLBACK_CONTENT_TYPE: &str = "application/octet-stream";

/// Content types origins use for HLS playlists.
const MANIFEST_CONTENT_TYPES: &[&str] = &[
    "application/vnd.apple.mpegurl",
    "application/x-mpegurl",
    "audio/mpegurl",
    "audio/x-mpegurl",
];

/// `true` when the target path names a playlist (`.m3u8` or `.m3u`).
pub fn is_manifest_path(target: &Url) -> bool {
    let path = target.path().to_ascii_lowercase();
    path.ends_with(".m3u8") || path.ends_with(".m3u")
}

/// `true` when an origin-declared content type is an HLS playlist type.
pub fn is_manifest_content_type(content_type: Option<&str>) -> bool {
    content_type.is_some_and(|ct| {
        MANIFEST_CONTENT_TYPES
            .iter()
            .any(|m| ct.eq_ignore_ascii_case(m))
    })
}

/// Media type a segment is served with: transport stream for `.ts` paths
/// whatever the origin says, else the origin's type, else a binary fallback.
pub fn segment_content_type(target: &Url, origin_content_type: Option<&str>) -> String {
    if target.path().to_ascii_lowercase().ends_with(".ts") {
        return TRANSPORT_STREAM_CONTENT_TYPE.to_string();
    }
    origin_content_type
        .filter(|ct| !ct.trim().is_empty())
        .unwrap_or(FALLBACK_CONTENT_TYPE)
        .to_string()
}

/// Last path segment of the target, or `file` when the path ends in `/`.
pub fn basename(target: &Url) -> String {
    target
        .path_segments()
        .and_then(|mut segments| segments.next_back())
        .filter(|s| !s.is_empty())
        .unwrap_or("file")
        .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn url(s: &str) -> Url {
        Url::parse(s).unwrap()
    }

    #[test]
    fn manifest_paths() {
        assert!(is_manifest_path(&url("https://o.example/live/index.m3u8")));
        assert!(is_manifest_path(&url("https://o.example/live/INDEX.M3U8?token=1")));
        assert!(is_manifest_path(&url("https://o.example/radio.m3u")));
        assert!(!is_manifest_path(&url("https://o.example/live/seg0.ts")));
        assert!(!is_manifest_path(&url("https://o.example/get?file=index.m3u8")));
    }

    #[test]
    fn manifest_content_types() {
        assert!(is_manifest_content_type(Some("application/vnd.apple.mpegurl")));
        assert!(is_manifest_content_type(Some("application/x-mpegURL")));
        assert!(!is_manifest_content_type(Some("video/mp2t")));
        assert!(!is_manifest_content_type(None));
    }

    #[test]
    fn ts_paths_always_transport_stream() {
        let target = url("https://o.example/seg0.ts");
        assert_eq!(segment_content_type(&target, Some("text/plain")), "video/MP2T");
        assert_eq!(segment_content_type(&target, None), "video/MP2T");
    }

    #[test]
    fn other_paths_use_origin_type_or_fallback() {
        let target = url("https://o.example/init.mp4");
        assert_eq!(segment_content_type(&target, Some("video/mp4")), "video/mp4");
        assert_eq!(
            segment_content_type(&target, None),
            "application/octet-stream"
        );
    }

    #[test]
    fn basenames() {
        assert_eq!(basename(&url("https://o.example/a/b/seg0.ts?x=1")), "seg0.ts");
        assert_eq!(basename(&url("https://o.example/a/b/")), "file");
        assert_eq!(basename(&url("https://o.example")), "file");
    }
}
