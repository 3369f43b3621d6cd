//! Content-type inference for served objects.
//!
//! The origin's value wins unless it is missing or the generic
//! `application/octet-stream`, in which case the key's extension and an
//! optional magic-byte sniff decide.

pub const OCTET_STREAM: &str = "application/octet-stream";

/// MPEG-TS packets are 188 bytes, each starting with the sync byte.
const TS_PACKET_LEN: usize = 188;
const TS_SYNC_BYTE: u8 = 0x47;

/// Media types the generic `mime_guess` table gets wrong or misses.
fn media_extension(ext: &str) -> Option<&'static str> {
    match ext {
        "m3u8" => Some("application/vnd.apple.mpegurl"),
        "ts" => Some("video/mp2t"),
        "m4s" => Some("video/iso.segment"),
        "mp4" | "m4v" => Some("video/mp4"),
        "vtt" => Some("text/vtt"),
        "srt" => Some("application/x-subrip"),
        _ => None,
    }
}

fn extension(key: &str) -> Option<String> {
    let name = key.rsplit('/').next()?;
    let (_, ext) = name.rsplit_once('.')?;
    Some(ext.to_ascii_lowercase())
}

/// Best guess from the key's extension.
pub fn from_key(key: &str) -> Option<String> {
    if let Some(ext) = extension(key) {
        if let Some(mime) = media_extension(&ext) {
            return Some(mime.to_string());
        }
    }
    mime_guess::from_path(key).first_raw().map(str::to_string)
}

/// Magic-byte sniff over the first bytes of a body.
pub fn sniff(head: &[u8]) -> Option<&'static str> {
    if head.len() >= 2 && head[0] == 0x1f && head[1] == 0x8b {
        return Some("application/gzip");
    }
    if head.len() >= 4 && head[..4] == [0x28, 0xb5, 0x2f, 0xfd] {
        return Some("application/zstd");
    }
    let sync_positions = head
        .iter()
        .step_by(TS_PACKET_LEN)
        .take(3)
        .filter(|&&b| b == TS_SYNC_BYTE)
        .count();
    let packets_available = head.len().div_ceil(TS_PACKET_LEN).min(3);
    if packets_available > 0 && sync_positions == packets_available {
        return Some("video/mp2t");
    }
    None
}

/// Full inference pipeline: origin value, extension table, signature
/// sniff, generic fallback.
pub fn resolve(origin: Option<&str>, key: &str, head: Option<&[u8]>) -> String {
    if let Some(ct) = origin {
        if !ct.is_empty() && ct != OCTET_STREAM {
            return ct.to_string();
        }
    }
    if let Some(inferred) = from_key(key) {
        if inferred != OCTET_STREAM {
            return inferred;
        }
    }
    if let Some(sniffed) = head.and_then(sniff) {
        return sniffed.to_string();
    }
    OCTET_STREAM.to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn origin_value_wins_when_specific() {
        assert_eq!(resolve(Some("video/mp4"), "x.bin", None), "video/mp4");
    }

    #[test]
    fn octet_stream_defers_to_extension() {
        assert_eq!(
            resolve(Some(OCTET_STREAM), "v/index.m3u8", None),
            "application/vnd.apple.mpegurl"
        );
        assert_eq!(resolve(None, "v/seg0.ts", None), "video/mp2t");
        assert_eq!(resolve(None, "movie.mp4", None), "video/mp4");
        assert_eq!(resolve(None, "subs/en.vtt", None), "text/vtt");
        assert_eq!(resolve(None, "poster.jpg", None), "image/jpeg");
    }

    #[test]
    fn ts_sync_pattern_sniffs_as_mpegts() {
        let mut body = vec![0u8; TS_PACKET_LEN * 3];
        body[0] = TS_SYNC_BYTE;
        body[TS_PACKET_LEN] = TS_SYNC_BYTE;
        body[TS_PACKET_LEN * 2] = TS_SYNC_BYTE;
        assert_eq!(sniff(&body), Some("video/mp2t"));

        // A broken sync pattern is not a TS stream.
        body[TS_PACKET_LEN] = 0x00;
        assert_eq!(sniff(&body), None);
    }

    #[test]
    fn compression_magics_sniff() {
        assert_eq!(sniff(&[0x1f, 0x8b, 0x08, 0x00]), Some("application/gzip"));
        assert_eq!(sniff(&[0x28, 0xb5, 0x2f, 0xfd, 0x00]), Some("application/zstd"));
    }

    #[test]
    fn unknown_extension_falls_back_to_octet_stream() {
        assert_eq!(resolve(None, "file.weird", None), OCTET_STREAM);
        assert_eq!(resolve(None, "no-extension", None), OCTET_STREAM);
    }
}
