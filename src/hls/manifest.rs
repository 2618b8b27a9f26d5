//! Line-preserving HLS playlist model.
//!
//! Parsing keeps every source line. References (variant URIs, segment URIs
//! and `URI="..."` attributes inside tags) remember where they came from, so
//! serialization re-emits untouched lines verbatim and only substitutes URI
//! text. That keeps durations, attributes and playlist-level tags
//! byte-identical across a rewrite, including tags `m3u8-rs` would drop.

use crate::error::{ProxyError, Result};
use std::ops::Range;

const EXTM3U: &str = "#EXTM3U";
const STREAM_INF: &str = "#EXT-X-STREAM-INF:";
const I_FRAME_STREAM_INF: &str = "#EXT-X-I-FRAME-STREAM-INF:";
const EXTINF: &str = "#EXTINF:";
const TARGET_DURATION: &str = "#EXT-X-TARGETDURATION:";
const MEDIA_SEQUENCE: &str = "#EXT-X-MEDIA-SEQUENCE:";
const ENDLIST: &str = "#EXT-X-ENDLIST";

/// Tags whose attribute list may carry a `URI` attribute.
const URI_TAGS: &[&str] = &[
    "#EXT-X-KEY:",
    "#EXT-X-SESSION-KEY:",
    "#EXT-X-MAP:",
    "#EXT-X-MEDIA:",
    I_FRAME_STREAM_INF,
    "#EXT-X-SESSION-DATA:",
    "#EXT-X-PART:",
    "#EXT-X-PRELOAD-HINT:",
    "#EXT-X-RENDITION-REPORT:",
];

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ManifestKind {
    Master,
    Media,
}

impl ManifestKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ManifestKind::Master => "master",
            ManifestKind::Media => "media",
        }
    }
}

/// One `EXT-X-STREAM-INF` entry of a master playlist.
#[derive(Clone, Debug, PartialEq)]
pub struct VariantReference {
    pub uri: String,
    /// Raw attribute list, e.g. `BANDWIDTH=1280000,RESOLUTION=640x360`
    pub attributes: String,
    line: usize,
}

impl VariantReference {
    /// Value of a single attribute, unquoted.
    pub fn attribute(&self, name: &str) -> Option<&str> {
        let attrs = parse_attributes(&self.attributes).ok()?;
        attrs
            .into_iter()
            .find(|a| a.key == name)
            .map(|a| &self.attributes[a.value])
    }

    pub fn bandwidth(&self) -> Option<u64> {
        self.attribute("BANDWIDTH")?.parse().ok()
    }
}

/// One `EXTINF` entry of a media playlist.
#[derive(Clone, Debug, PartialEq)]
pub struct SegmentReference {
    pub uri: String,
    pub duration: f64,
    pub title: Option<String>,
    /// Media sequence number of this segment
    pub sequence: u64,
    line: usize,
}

/// A `URI="..."` attribute inside a tag such as `EXT-X-KEY` or `EXT-X-MAP`.
#[derive(Clone, Debug, PartialEq)]
pub struct TagUriReference {
    /// Tag name without the leading `#` and trailing `:`, e.g. `EXT-X-KEY`
    pub tag: String,
    pub uri: String,
    line: usize,
    /// Byte range of the unquoted value within the source line
    span: Range<usize>,
}

#[derive(Clone, Debug, PartialEq)]
pub struct MasterManifest {
    pub variants: Vec<VariantReference>,
    pub tag_uris: Vec<TagUriReference>,
    lines: Vec<String>,
}

#[derive(Clone, Debug, PartialEq)]
pub struct MediaManifest {
    pub segments: Vec<SegmentReference>,
    pub tag_uris: Vec<TagUriReference>,
    pub target_duration: Option<f64>,
    pub media_sequence: u64,
    pub end_list: bool,
    lines: Vec<String>,
}

/// A parsed playlist, classified once at parse time.
#[derive(Clone, Debug, PartialEq)]
pub enum Manifest {
    Master(MasterManifest),
    Media(MediaManifest),
}

impl Manifest {
    /// Parse playlist text.
    ///
    /// # Errors
    /// [`ProxyError::ParseError`] when the text is not a playlist: missing
    /// `#EXTM3U` header, an `EXTINF`/`EXT-X-STREAM-INF` without its URI line,
    /// a URI line with no preceding entry tag, a malformed duration or
    /// attribute list, or a playlist mixing variants and segments.
    pub fn parse(text: &str) -> Result<Self> {
        let text = text.strip_prefix('\u{feff}').unwrap_or(text);
        let lines: Vec<String> = text.lines().map(str::to_string).collect();

        match lines.iter().find(|l| !l.trim().is_empty()) {
            Some(first) if first.trim() == EXTM3U => {}
            _ => return Err(parse_error("missing #EXTM3U header")),
        }

        let mut variants = Vec::new();
        let mut segments = Vec::new();
        let mut tag_uris = Vec::new();
        let mut i_frame_streams = 0usize;
        let mut target_duration = None;
        let mut media_sequence = 0u64;
        let mut end_list = false;
        let mut pending: Option<(usize, Pending)> = None;

        for (idx, line) in lines.iter().enumerate() {
            let trimmed = line.trim();
            if trimmed.is_empty() {
                continue;
            }

            if trimmed.starts_with('#') {
                if let Some(attrs) = trimmed.strip_prefix(STREAM_INF) {
                    expect_no_pending(&pending, idx)?;
                    parse_attributes(attrs)
                        .map_err(|e| parse_error(format!("line {}: {e}", idx + 1)))?;
                    pending = Some((
                        idx,
                        Pending::Variant {
                            attributes: attrs.to_string(),
                        },
                    ));
                } else if let Some(info) = trimmed.strip_prefix(EXTINF) {
                    expect_no_pending(&pending, idx)?;
                    let (duration, title) = parse_extinf(info)
                        .ok_or_else(|| parse_error(format!("line {}: bad EXTINF", idx + 1)))?;
                    pending = Some((idx, Pending::Segment { duration, title }));
                } else if let Some(value) = trimmed.strip_prefix(TARGET_DURATION) {
                    target_duration = Some(value.trim().parse::<f64>().map_err(|_| {
                        parse_error(format!("line {}: bad EXT-X-TARGETDURATION", idx + 1))
                    })?);
                } else if let Some(value) = trimmed.strip_prefix(MEDIA_SEQUENCE) {
                    media_sequence = value.trim().parse().map_err(|_| {
                        parse_error(format!("line {}: bad EXT-X-MEDIA-SEQUENCE", idx + 1))
                    })?;
                } else if trimmed == ENDLIST {
                    end_list = true;
                } else {
                    if trimmed.starts_with(I_FRAME_STREAM_INF) {
                        i_frame_streams += 1;
                    }
                    if let Some(tag_ref) = scan_tag_uri(line, idx)? {
                        tag_uris.push(tag_ref);
                    }
                }
                continue;
            }

            let uri = trimmed.to_string();
            match pending.take() {
                Some((_, Pending::Variant { attributes })) => variants.push(VariantReference {
                    uri,
                    attributes,
                    line: idx,
                }),
                Some((_, Pending::Segment { duration, title })) => {
                    let sequence = media_sequence + segments.len() as u64;
                    segments.push(SegmentReference {
                        uri,
                        duration,
                        title,
                        sequence,
                        line: idx,
                    });
                }
                None => {
                    return Err(parse_error(format!(
                        "line {}: URI without EXTINF or EXT-X-STREAM-INF",
                        idx + 1
                    )));
                }
            }
        }

        if let Some((idx, _)) = pending {
            return Err(parse_error(format!(
                "line {}: entry has no URI line (unterminated)",
                idx + 1
            )));
        }

        // Second opinion from m3u8-rs on the newline-normalized text for
        // anything structural the line scan does not check.
        let mut normalized = lines.join("\n");
        normalized.push('\n');
        m3u8_rs::parse_playlist_res(normalized.as_bytes())
            .map_err(|e| parse_error(format!("{e:?}")))?;

        // I-frame stream declarations have no URI line but still make a
        // playlist a master.
        let has_streams = !variants.is_empty() || i_frame_streams > 0;
        match (has_streams, segments.is_empty()) {
            (true, false) => Err(parse_error("playlist mixes variant streams and segments")),
            (true, true) => Ok(Manifest::Master(MasterManifest {
                variants,
                tag_uris,
                lines,
            })),
            (false, _) => Ok(Manifest::Media(MediaManifest {
                segments,
                tag_uris,
                target_duration,
                media_sequence,
                end_list,
                lines,
            })),
        }
    }

    pub fn kind(&self) -> ManifestKind {
        match self {
            Manifest::Master(_) => ManifestKind::Master,
            Manifest::Media(_) => ManifestKind::Media,
        }
    }

    /// Every reference URI: entry URIs first, then tag-embedded ones.
    pub fn uris_mut(&mut self) -> Box<dyn Iterator<Item = &mut String> + '_> {
        match self {
            Manifest::Master(m) => Box::new(
                m.variants
                    .iter_mut()
                    .map(|v| &mut v.uri)
                    .chain(m.tag_uris.iter_mut().map(|t| &mut t.uri)),
            ),
            Manifest::Media(m) => Box::new(
                m.segments
                    .iter_mut()
                    .map(|s| &mut s.uri)
                    .chain(m.tag_uris.iter_mut().map(|t| &mut t.uri)),
            ),
        }
    }

    pub fn reference_count(&self) -> usize {
        match self {
            Manifest::Master(m) => m.variants.len() + m.tag_uris.len(),
            Manifest::Media(m) => m.segments.len() + m.tag_uris.len(),
        }
    }

    /// Serialize back to playlist text. Lines without references are emitted
    /// exactly as parsed; the output always ends with a newline.
    pub fn serialize(&self) -> String {
        let (lines, entry_uris, tag_uris): (&[String], Vec<(usize, &str)>, &[TagUriReference]) =
            match self {
                Manifest::Master(m) => (
                    &m.lines,
                    m.variants.iter().map(|v| (v.line, v.uri.as_str())).collect(),
                    &m.tag_uris,
                ),
                Manifest::Media(m) => (
                    &m.lines,
                    m.segments.iter().map(|s| (s.line, s.uri.as_str())).collect(),
                    &m.tag_uris,
                ),
            };

        let mut out: Vec<String> = lines.to_vec();
        for (line, uri) in entry_uris {
            out[line] = uri.to_string();
        }
        for t in tag_uris {
            let src = &lines[t.line];
            out[t.line] = format!("{}{}{}", &src[..t.span.start], t.uri, &src[t.span.end..]);
        }

        let mut text = out.join("\n");
        text.push('\n');
        text
    }
}

enum Pending {
    Variant { attributes: String },
    Segment { duration: f64, title: Option<String> },
}

fn parse_error(msg: impl Into<String>) -> ProxyError {
    ProxyError::ParseError(msg.into())
}

fn expect_no_pending(pending: &Option<(usize, Pending)>, idx: usize) -> Result<()> {
    match pending {
        Some((start, _)) => Err(parse_error(format!(
            "line {}: entry started on line {} has no URI line",
            idx + 1,
            start + 1
        ))),
        None => Ok(()),
    }
}

/// `<duration>,[<title>]`
fn parse_extinf(info: &str) -> Option<(f64, Option<String>)> {
    let (duration, title) = match info.split_once(',') {
        Some((d, t)) => (d, Some(t.trim()).filter(|t| !t.is_empty())),
        None => (info, None),
    };
    let duration: f64 = duration.trim().parse().ok()?;
    if !duration.is_finite() || duration < 0.0 {
        return None;
    }
    Some((duration, title.map(str::to_string)))
}

/// Find a quoted `URI` attribute in one of the URI-bearing tags.
fn scan_tag_uri(line: &str, idx: usize) -> Result<Option<TagUriReference>> {
    let offset = line.len() - line.trim_start().len();
    let trimmed = &line[offset..];

    let Some(prefix) = URI_TAGS.iter().find(|t| trimmed.starts_with(**t)) else {
        return Ok(None);
    };

    let list_start = offset + prefix.len();
    let attrs = parse_attributes(&line[list_start..])
        .map_err(|e| parse_error(format!("line {}: {e}", idx + 1)))?;

    Ok(attrs
        .into_iter()
        .find(|a| a.key == "URI" && a.quoted)
        .map(|a| {
            let span = (list_start + a.value.start)..(list_start + a.value.end);
            TagUriReference {
                tag: prefix[1..prefix.len() - 1].to_string(),
                uri: line[span.clone()].to_string(),
                line: idx,
                span,
            }
        }))
}

struct Attribute<'a> {
    key: &'a str,
    /// Byte range of the value (inside the quotes when quoted)
    value: Range<usize>,
    quoted: bool,
}

/// Split an HLS attribute list (`KEY=VALUE,KEY="quoted, value"`).
fn parse_attributes(list: &str) -> std::result::Result<Vec<Attribute<'_>>, String> {
    let bytes = list.as_bytes();
    let mut attrs = Vec::new();
    let mut i = 0;

    while i < bytes.len() {
        let key_start = i;
        while i < bytes.len() && bytes[i] != b'=' && bytes[i] != b',' {
            i += 1;
        }
        let key = list[key_start..i].trim();

        if i >= bytes.len() || bytes[i] == b',' {
            if !key.is_empty() {
                return Err(format!("attribute '{key}' has no value"));
            }
            i += 1;
            continue;
        }
        i += 1; // '='

        if i < bytes.len() && bytes[i] == b'"' {
            let start = i + 1;
            let end = list[start..]
                .find('"')
                .map(|p| start + p)
                .ok_or_else(|| format!("unterminated quoted value for '{key}'"))?;
            attrs.push(Attribute {
                key,
                value: start..end,
                quoted: true,
            });
            i = end + 1;
        } else {
            let start = i;
            while i < bytes.len() && bytes[i] != b',' {
                i += 1;
            }
            attrs.push(Attribute {
                key,
                value: start..i,
                quoted: false,
            });
        }

        while i < bytes.len() && bytes[i] != b',' {
            i += 1;
        }
        i += 1;
    }

    Ok(attrs)
}

#[cfg(test)]
mod tests {
    use super::*;

    const MASTER: &str = "#EXTM3U
#EXT-X-VERSION:4
#EXT-X-MEDIA:TYPE=AUDIO,GROUP-ID=\"aud\",NAME=\"English\",URI=\"audio/en.m3u8\"
#EXT-X-STREAM-INF:BANDWIDTH=1280000,RESOLUTION=640x360,CODECS=\"avc1.4d401e,mp4a.40.2\",AUDIO=\"aud\"
low.m3u8
#EXT-X-STREAM-INF:BANDWIDTH=2560000,RESOLUTION=1280x720
high.m3u8
";

    const MEDIA: &str = "#EXTM3U
#EXT-X-VERSION:3
#EXT-X-TARGETDURATION:10
#EXT-X-MEDIA-SEQUENCE:7
#EXT-X-KEY:METHOD=AES-128,URI=\"keys/k1.bin\",IV=0x1234
#EXTINF:9.009,first
seg0.ts
#EXT-X-DISCONTINUITY
#EXTINF:10.0,
seg1.ts
#EXT-X-ENDLIST
";

    #[test]
    fn classifies_master() {
        let m = Manifest::parse(MASTER).unwrap();
        assert_eq!(m.kind(), ManifestKind::Master);
        let Manifest::Master(master) = m else {
            panic!("expected master");
        };
        assert_eq!(master.variants.len(), 2);
        assert_eq!(master.variants[0].uri, "low.m3u8");
        assert_eq!(master.variants[0].bandwidth(), Some(1_280_000));
        assert_eq!(
            master.variants[0].attribute("CODECS"),
            Some("avc1.4d401e,mp4a.40.2")
        );
        assert_eq!(master.variants[1].attribute("RESOLUTION"), Some("1280x720"));
        assert_eq!(master.tag_uris.len(), 1);
        assert_eq!(master.tag_uris[0].tag, "EXT-X-MEDIA");
        assert_eq!(master.tag_uris[0].uri, "audio/en.m3u8");
    }

    #[test]
    fn classifies_media() {
        let m = Manifest::parse(MEDIA).unwrap();
        assert_eq!(m.kind(), ManifestKind::Media);
        let Manifest::Media(media) = m else {
            panic!("expected media");
        };
        assert_eq!(media.segments.len(), 2);
        assert_eq!(media.segments[0].duration, 9.009);
        assert_eq!(media.segments[0].title.as_deref(), Some("first"));
        assert_eq!(media.segments[0].sequence, 7);
        assert_eq!(media.segments[1].sequence, 8);
        assert_eq!(media.segments[1].title, None);
        assert_eq!(media.target_duration, Some(10.0));
        assert_eq!(media.media_sequence, 7);
        assert!(media.end_list);
        assert_eq!(media.tag_uris[0].tag, "EXT-X-KEY");
        assert_eq!(media.tag_uris[0].uri, "keys/k1.bin");
    }

    #[test]
    fn i_frame_only_playlist_is_master() {
        let src = "#EXTM3U\n#EXT-X-I-FRAME-STREAM-INF:BANDWIDTH=86000,URI=\"iframe/index.m3u8\"\n";
        let m = Manifest::parse(src).unwrap();
        assert_eq!(m.kind(), ManifestKind::Master);
        let Manifest::Master(master) = &m else {
            panic!("expected master");
        };
        assert!(master.variants.is_empty());
        assert_eq!(master.tag_uris[0].tag, "EXT-X-I-FRAME-STREAM-INF");
        assert_eq!(m.reference_count(), 1);
    }

    #[test]
    fn rejects_i_frame_stream_mixed_with_segments() {
        let src = "#EXTM3U\n#EXT-X-I-FRAME-STREAM-INF:BANDWIDTH=1,URI=\"i.m3u8\"\n#EXTINF:4,\na.ts\n";
        assert!(Manifest::parse(src).is_err());
    }

    #[test]
    fn empty_playlist_is_media() {
        let m = Manifest::parse("#EXTM3U\n#EXT-X-TARGETDURATION:6\n").unwrap();
        assert_eq!(m.kind(), ManifestKind::Media);
        assert_eq!(m.reference_count(), 0);
    }

    #[test]
    fn serialize_without_changes_is_identity() {
        for src in [MASTER, MEDIA] {
            assert_eq!(Manifest::parse(src).unwrap().serialize(), src);
        }
    }

    #[test]
    fn serialize_substitutes_only_uris() {
        let mut m = Manifest::parse(MEDIA).unwrap();
        for uri in m.uris_mut() {
            *uri = format!("X{uri}");
        }
        let out = m.serialize();
        let expected = MEDIA
            .replace("\nseg0.ts", "\nXseg0.ts")
            .replace("\nseg1.ts", "\nXseg1.ts")
            .replace("URI=\"keys/k1.bin\"", "URI=\"Xkeys/k1.bin\"");
        assert_eq!(out, expected);
    }

    #[test]
    fn preserves_unknown_tags_and_blank_lines() {
        let src = "#EXTM3U\n#EXT-X-SERVER-CONTROL:CAN-BLOCK-RELOAD=YES\n\n#EXT-X-CUSTOM:foo=bar\n#EXTINF:4,\na.ts\n";
        assert_eq!(Manifest::parse(src).unwrap().serialize(), src);
    }

    #[test]
    fn key_without_uri_is_not_a_reference() {
        let src = "#EXTM3U\n#EXT-X-TARGETDURATION:4\n#EXT-X-KEY:METHOD=NONE\n#EXTINF:4,\na.ts\n";
        let m = Manifest::parse(src).unwrap();
        assert_eq!(m.reference_count(), 1);
    }

    #[test]
    fn rejects_missing_header() {
        let err = Manifest::parse("#EXTINF:10,\nseg.ts\n").unwrap_err();
        assert!(matches!(err, ProxyError::ParseError(_)));
        assert!(Manifest::parse("").is_err());
        assert!(Manifest::parse("<html>not found</html>").is_err());
    }

    #[test]
    fn rejects_unterminated_segment_block() {
        let err = Manifest::parse("#EXTM3U\n#EXT-X-TARGETDURATION:10\n#EXTINF:10,\n").unwrap_err();
        assert!(matches!(err, ProxyError::ParseError(_)));
    }

    #[test]
    fn rejects_entry_tag_before_previous_uri() {
        let src = "#EXTM3U\n#EXTINF:10,\n#EXTINF:10,\nseg.ts\n";
        assert!(Manifest::parse(src).is_err());
    }

    #[test]
    fn rejects_bad_duration() {
        assert!(Manifest::parse("#EXTM3U\n#EXTINF:ten,\nseg.ts\n").is_err());
        assert!(Manifest::parse("#EXTM3U\n#EXTINF:-1,\nseg.ts\n").is_err());
    }

    #[test]
    fn rejects_orphan_uri_line() {
        assert!(Manifest::parse("#EXTM3U\nseg.ts\n").is_err());
    }

    #[test]
    fn rejects_unterminated_quoted_attribute() {
        let src = "#EXTM3U\n#EXT-X-STREAM-INF:BANDWIDTH=1,CODECS=\"avc1\nlow.m3u8\n";
        assert!(Manifest::parse(src).is_err());
    }

    #[test]
    fn rejects_mixed_playlist() {
        let src = "#EXTM3U\n#EXT-X-STREAM-INF:BANDWIDTH=1\nlow.m3u8\n#EXTINF:4,\na.ts\n";
        assert!(Manifest::parse(src).is_err());
    }

    #[test]
    fn handles_crlf_and_bom() {
        let src = "\u{feff}#EXTM3U\r\n#EXT-X-TARGETDURATION:4\r\n#EXTINF:4,\r\na.ts\r\n";
        let m = Manifest::parse(src).unwrap();
        let Manifest::Media(media) = &m else {
            panic!("expected media");
        };
        assert_eq!(media.segments[0].uri, "a.ts");
        assert_eq!(
            m.serialize(),
            "#EXTM3U\n#EXT-X-TARGETDURATION:4\n#EXTINF:4,\na.ts\n"
        );
    }

    #[test]
    fn ll_hls_tag_uris_are_references() {
        let src = "#EXTM3U
#EXT-X-TARGETDURATION:4
#EXT-X-PART-INF:PART-TARGET=1.0
#EXT-X-MAP:URI=\"init.mp4\"
#EXT-X-PART:DURATION=1.0,URI=\"part0.mp4\",INDEPENDENT=YES
#EXTINF:4,
seg0.mp4
#EXT-X-PRELOAD-HINT:TYPE=PART,URI=\"part1.mp4\"
#EXT-X-RENDITION-REPORT:URI=\"../alt/index.m3u8\",LAST-MSN=10
";
        let m = Manifest::parse(src).unwrap();
        let Manifest::Media(media) = &m else {
            panic!("expected media");
        };
        let tags: Vec<&str> = media.tag_uris.iter().map(|t| t.tag.as_str()).collect();
        assert_eq!(
            tags,
            vec![
                "EXT-X-MAP",
                "EXT-X-PART",
                "EXT-X-PRELOAD-HINT",
                "EXT-X-RENDITION-REPORT"
            ]
        );
        assert_eq!(m.reference_count(), 5);
    }
}
