//! HLS playlist rewriting.
//!
//! Scans an M3U8 document line by line and re-anchors every URI reference
//! at this edge: relative references resolve against the playlist's own
//! edge URL, absolute references to other hosts are wrapped through the
//! edge's CDN path with the original URI carried in a query parameter.
//! Unknown tags pass through untouched, and rewriting an already
//! rewritten playlist changes nothing.

use thiserror::Error;
use url::Url;

/// MIME types identifying an HLS playlist.
pub const HLS_MIME_TYPES: &[&str] = &["application/vnd.apple.mpegurl", "application/x-mpegurl"];

#[derive(Debug, Error)]
pub enum RewriteError {
    #[error("playlist is not valid UTF-8")]
    InvalidUtf8,
}

/// Whether a response should go through the rewriter, judged by content
/// type or the key's extension.
pub fn is_playlist(content_type: Option<&str>, key: &str) -> bool {
    if let Some(ct) = content_type {
        let ct = ct.to_ascii_lowercase();
        if HLS_MIME_TYPES.iter().any(|mime| ct.contains(mime)) {
            return true;
        }
    }
    key.to_ascii_lowercase().ends_with(".m3u8")
}

struct RewriteContext<'a> {
    playlist_url: &'a Url,
    cdn_base: &'a str,
}

impl RewriteContext<'_> {
    /// Resolve one reference and re-anchor it at the edge.
    fn rewrite_uri(&self, raw: &str) -> String {
        let Ok(resolved) = self.playlist_url.join(raw) else {
            return raw.to_string();
        };
        if resolved.origin() == self.playlist_url.origin() {
            return resolved.to_string();
        }
        let mut wrapped = self.playlist_url.clone();
        wrapped.set_path(&format!("/{}/remote", self.cdn_base));
        wrapped.set_fragment(None);
        wrapped
            .query_pairs_mut()
            .clear()
            .append_pair("url", resolved.as_str());
        wrapped.to_string()
    }

    /// Rewrite every `URI="…"` attribute inside a tag line.
    fn rewrite_tag(&self, line: &str) -> String {
        let mut out = String::with_capacity(line.len());
        let mut rest = line;
        while let Some(idx) = rest.find("URI=\"") {
            let value_start = idx + "URI=\"".len();
            out.push_str(&rest[..value_start]);
            let tail = &rest[value_start..];
            match tail.find('"') {
                Some(end) => {
                    out.push_str(&self.rewrite_uri(&tail[..end]));
                    rest = &tail[end..];
                }
                None => {
                    // Unterminated attribute; leave the remainder alone.
                    out.push_str(tail);
                    return out;
                }
            }
        }
        out.push_str(rest);
        out
    }

    fn rewrite_line(&self, line: &str) -> String {
        let trimmed = line.trim();
        if trimmed.is_empty() {
            return line.to_string();
        }
        if trimmed.starts_with('#') {
            if trimmed.starts_with("#EXT") && trimmed.contains("URI=\"") {
                return self.rewrite_tag(line);
            }
            return line.to_string();
        }
        self.rewrite_uri(trimmed)
    }
}

/// Rewrite a playlist body so every reference resolves through this edge.
///
/// `playlist_url` is the URL the playlist itself was requested under;
/// `cdn_base` is the first path segment of the object surface.
pub fn rewrite_playlist(
    bytes: &[u8],
    playlist_url: &Url,
    cdn_base: &str,
) -> Result<String, RewriteError> {
    let text = std::str::from_utf8(bytes).map_err(|_| RewriteError::InvalidUtf8)?;
    let ctx = RewriteContext {
        playlist_url,
        cdn_base,
    };

    let mut out: Vec<String> = Vec::new();
    for line in text.lines() {
        let (content, cr) = match line.strip_suffix('\r') {
            Some(stripped) => (stripped, "\r"),
            None => (line, ""),
        };
        out.push(format!("{}{cr}", ctx.rewrite_line(content)));
    }
    let mut body = out.join("\n");
    if text.ends_with('\n') {
        body.push('\n');
    }
    Ok(body)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn playlist_url() -> Url {
        Url::parse("http://edge.example/cdn/v/index.m3u8").unwrap()
    }

    #[test]
    fn detects_playlists_by_mime_and_extension() {
        assert!(is_playlist(Some("application/vnd.apple.mpegurl"), "x.bin"));
        assert!(is_playlist(Some("application/x-mpegURL"), "x.bin"));
        assert!(is_playlist(None, "v/master.M3U8"));
        assert!(!is_playlist(Some("video/mp2t"), "seg0.ts"));
    }

    #[test]
    fn rewrites_relative_segments_against_the_playlist_url() {
        let body = "#EXTM3U\n#EXTINF:4.0,\nseg0.ts\n";
        let out = rewrite_playlist(body.as_bytes(), &playlist_url(), "cdn").unwrap();
        assert_eq!(out, "#EXTM3U\n#EXTINF:4.0,\nhttp://edge.example/cdn/v/seg0.ts\n");
    }

    #[test]
    fn rewrites_key_uri_attributes_and_wraps_foreign_hosts() {
        let body = concat!(
            "#EXTM3U\n",
            "#EXT-X-KEY:METHOD=AES-128,URI=\"key.php?id=1\"\n",
            "seg0.ts\n",
            "https://other.example/seg1.ts\n",
        );
        let out = rewrite_playlist(body.as_bytes(), &playlist_url(), "cdn").unwrap();
        let lines: Vec<&str> = out.lines().collect();
        assert_eq!(
            lines[1],
            "#EXT-X-KEY:METHOD=AES-128,URI=\"http://edge.example/cdn/v/key.php?id=1\""
        );
        assert_eq!(lines[2], "http://edge.example/cdn/v/seg0.ts");
        assert_eq!(
            lines[3],
            "http://edge.example/cdn/remote?url=https%3A%2F%2Fother.example%2Fseg1.ts"
        );
    }

    #[test]
    fn rewriting_is_idempotent() {
        let body = concat!(
            "#EXTM3U\n",
            "#EXT-X-KEY:METHOD=AES-128,URI=\"key.php?id=1\"\n",
            "seg0.ts\n",
            "https://other.example/seg1.ts\n",
        );
        let url = playlist_url();
        let once = rewrite_playlist(body.as_bytes(), &url, "cdn").unwrap();
        let twice = rewrite_playlist(once.as_bytes(), &url, "cdn").unwrap();
        assert_eq!(once, twice);
    }

    #[test]
    fn unknown_tags_and_comments_pass_through() {
        let body = "#EXTM3U\n#EXT-X-VERSION:3\n# a comment\n\n#EXT-X-ENDLIST\n";
        let out = rewrite_playlist(body.as_bytes(), &playlist_url(), "cdn").unwrap();
        assert_eq!(out, body);
    }

    #[test]
    fn variant_playlist_references_are_anchored() {
        let body = "#EXTM3U\n#EXT-X-STREAM-INF:BANDWIDTH=800000\nlow/stream.m3u8\n";
        let out = rewrite_playlist(body.as_bytes(), &playlist_url(), "cdn").unwrap();
        assert!(out.contains("http://edge.example/cdn/v/low/stream.m3u8"));
    }

    #[test]
    fn crlf_line_endings_survive() {
        let body = "#EXTM3U\r\nseg0.ts\r\n";
        let out = rewrite_playlist(body.as_bytes(), &playlist_url(), "cdn").unwrap();
        assert_eq!(out, "#EXTM3U\r\nhttp://edge.example/cdn/v/seg0.ts\r\n");
    }

    #[test]
    fn invalid_utf8_is_an_error() {
        let err = rewrite_playlist(&[0xff, 0xfe, 0x00], &playlist_url(), "cdn");
        assert!(err.is_err());
    }
}
