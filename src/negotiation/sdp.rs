//! SDP codec preference rewriting
//!
//! Restricts one media section to a single codec. Retransmission (`rtx`)
//! payloads survive when their `apt=` points at a kept payload type.

use std::collections::{HashMap, HashSet};

use crate::media::MediaKind;

/// One `m=` section: its header line index and the lines it spans
struct Section {
    start: usize,
    end: usize,
}

fn attribute_payload<'a>(line: &'a str, attribute: &str) -> Option<&'a str> {
    let rest = line.strip_prefix(attribute)?;
    let pt = rest.split_whitespace().next()?;
    Some(pt)
}

fn rtpmap_name(line: &str) -> Option<(&str, &str)> {
    let rest = line.strip_prefix("a=rtpmap:")?;
    let mut parts = rest.splitn(2, ' ');
    let pt = parts.next()?;
    let encoding = parts.next()?.trim();
    let name = encoding.split('/').next()?;
    Some((pt, name))
}

/// `apt` value of an `a=fmtp:` line
fn fmtp_apt(line: &str) -> Option<(&str, &str)> {
    let rest = line.strip_prefix("a=fmtp:")?;
    let mut parts = rest.splitn(2, ' ');
    let pt = parts.next()?;
    let params = parts.next()?;
    params
        .split(';')
        .filter_map(|p| p.trim().strip_prefix("apt="))
        .next()
        .map(|apt| (pt, apt.trim()))
}

fn filter_section(lines: &mut Vec<String>, section: &Section, codec: &str) -> bool {
    let body = &lines[section.start + 1..section.end];

    let mut names: HashMap<&str, &str> = HashMap::new();
    let mut apt: HashMap<&str, &str> = HashMap::new();
    for line in body {
        if let Some((pt, name)) = rtpmap_name(line) {
            names.insert(pt, name);
        } else if let Some((pt, target)) = fmtp_apt(line) {
            apt.insert(pt, target);
        }
    }

    let mut keep: HashSet<String> = names
        .iter()
        .filter(|(_, name)| name.eq_ignore_ascii_case(codec))
        .map(|(pt, _)| pt.to_string())
        .collect();

    if keep.is_empty() {
        return false;
    }

    let rtx: Vec<String> = names
        .iter()
        .filter(|(pt, name)| {
            name.eq_ignore_ascii_case("rtx")
                && apt.get(*pt).is_some_and(|target| keep.contains(*target))
        })
        .map(|(pt, _)| pt.to_string())
        .collect();
    keep.extend(rtx);

    // m=<media> <port> <proto> <fmt> ...
    let header = &lines[section.start];
    let mut tokens = header.split_whitespace();
    let prefix: Vec<&str> = tokens.by_ref().take(3).collect();
    let payloads: Vec<&str> = tokens.filter(|pt| keep.contains(*pt)).collect();
    let new_header = format!("{} {}", prefix.join(" "), payloads.join(" "));

    let removed = |line: &str| -> bool {
        ["a=rtpmap:", "a=fmtp:", "a=rtcp-fb:"]
            .iter()
            .filter_map(|attr| attribute_payload(line, attr))
            .any(|pt| pt != "*" && !keep.contains(pt))
    };

    let new_body: Vec<String> = lines[section.start + 1..section.end]
        .iter()
        .filter(|line| !removed(line))
        .cloned()
        .collect();

    let tail = lines.split_off(section.end);
    lines.truncate(section.start);
    lines.push(new_header);
    lines.extend(new_body);
    lines.extend(tail);
    true
}

/// Keep only `codec` (and its rtx) in every `kind` media section
///
/// Matching is case-insensitive. A section that does not offer the codec is
/// left untouched.
pub fn filter_codec(sdp: &str, kind: MediaKind, codec: &str) -> String {
    let separator = if sdp.contains("\r\n") { "\r\n" } else { "\n" };
    let trailing = sdp.ends_with(separator);

    let mut lines: Vec<String> = sdp
        .split(separator)
        .map(str::to_string)
        .collect();
    if trailing {
        lines.pop();
    }

    let media_prefix = format!("m={} ", kind.as_str());
    let mut index = 0;
    while index < lines.len() {
        if !lines[index].starts_with(&media_prefix) {
            index += 1;
            continue;
        }

        let end = lines[index + 1..]
            .iter()
            .position(|l| l.starts_with("m="))
            .map(|offset| index + 1 + offset)
            .unwrap_or(lines.len());
        let section = Section { start: index, end };
        let before = lines.len();

        if filter_section(&mut lines, &section, codec) {
            log::debug!("Restricted {} section to {}", kind.as_str(), codec);
        } else {
            log::warn!("Codec {} not offered for {}, leaving SDP as is", codec, kind.as_str());
        }

        let removed = before - lines.len();
        index = end - removed;
    }

    let mut out = lines.join(separator);
    if trailing {
        out.push_str(separator);
    }
    out
}

/// Payload types listed on the first `kind` media line
pub fn payload_types(sdp: &str, kind: MediaKind) -> Vec<String> {
    let prefix = format!("m={} ", kind.as_str());
    sdp.lines()
        .find(|l| l.starts_with(&prefix))
        .map(|l| l.split_whitespace().skip(3).map(str::to_string).collect())
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    const OFFER: &str = "v=0\r\n\
o=- 4611731400430051336 2 IN IP4 127.0.0.1\r\n\
s=-\r\n\
t=0 0\r\n\
m=audio 9 UDP/TLS/RTP/SAVPF 111 63 9 0 8\r\n\
c=IN IP4 0.0.0.0\r\n\
a=mid:0\r\n\
a=rtpmap:111 opus/48000/2\r\n\
a=rtcp-fb:111 transport-cc\r\n\
a=fmtp:111 minptime=10;useinbandfec=1\r\n\
a=rtpmap:63 rtx/48000\r\n\
a=fmtp:63 apt=111\r\n\
a=rtpmap:9 G722/8000\r\n\
a=rtpmap:0 PCMU/8000\r\n\
a=rtpmap:8 PCMA/8000\r\n\
m=video 9 UDP/TLS/RTP/SAVPF 96 97 98 99\r\n\
c=IN IP4 0.0.0.0\r\n\
a=mid:1\r\n\
a=rtpmap:96 VP8/90000\r\n\
a=rtcp-fb:96 nack\r\n\
a=rtpmap:97 rtx/90000\r\n\
a=fmtp:97 apt=96\r\n\
a=rtpmap:98 H264/90000\r\n\
a=fmtp:98 level-asymmetry-allowed=1;packetization-mode=1\r\n\
a=rtpmap:99 rtx/90000\r\n\
a=fmtp:99 apt=98\r\n\
a=rtcp-fb:* ccm fir\r\n";

    #[test]
    fn test_opus_keeps_its_rtx() {
        let filtered = filter_codec(OFFER, MediaKind::Audio, "opus");

        assert_eq!(payload_types(&filtered, MediaKind::Audio), vec!["111", "63"]);
        assert!(filtered.contains("a=rtpmap:111 opus/48000/2\r\n"));
        assert!(filtered.contains("a=fmtp:63 apt=111\r\n"));
        assert!(filtered.contains("a=rtcp-fb:111 transport-cc\r\n"));
        assert!(!filtered.contains("G722"));
        assert!(!filtered.contains("PCMU"));
        assert!(!filtered.contains("a=rtpmap:8 "));
        assert!(filtered.ends_with("\r\n"));

        // Video untouched
        assert_eq!(
            payload_types(&filtered, MediaKind::Video),
            vec!["96", "97", "98", "99"]
        );
    }

    #[test]
    fn test_video_codec_case_insensitive() {
        let filtered = filter_codec(OFFER, MediaKind::Video, "h264");

        assert_eq!(payload_types(&filtered, MediaKind::Video), vec!["98", "99"]);
        assert!(!filtered.contains("VP8"));
        assert!(!filtered.contains("a=fmtp:97"));
        assert!(!filtered.contains("a=rtcp-fb:96"));
        assert!(filtered.contains("a=rtcp-fb:* ccm fir"));
        assert_eq!(payload_types(&filtered, MediaKind::Audio).len(), 5);
    }

    #[test]
    fn test_unknown_codec_leaves_sdp_unchanged() {
        assert_eq!(filter_codec(OFFER, MediaKind::Audio, "speex"), OFFER);
    }

    #[test]
    fn test_lf_line_endings() {
        let sdp = "v=0\nm=audio 9 RTP/AVP 0 8\na=rtpmap:0 PCMU/8000\na=rtpmap:8 PCMA/8000\n";
        let filtered = filter_codec(sdp, MediaKind::Audio, "pcma");
        assert_eq!(filtered, "v=0\nm=audio 9 RTP/AVP 8\na=rtpmap:8 PCMA/8000\n");
    }
}
