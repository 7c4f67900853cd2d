//! Unit tests for chunk decoding, line splitting and artifact extraction.

use agent_console::orchestrator::artifacts::{extract_paths, extract_urls, merge_unique};
use agent_console::orchestrator::output::{ChunkDecoder, LineSplitter};

// ── ChunkDecoder ────────────────────────────────────────────────────────────

/// A multi-byte character split across chunks decodes intact.
#[test]
fn split_multibyte_character_is_carried() {
    let bytes = "héllo €".as_bytes();
    let euro_start = bytes.len() - 3;

    let mut decoder = ChunkDecoder::new();
    let mut text = decoder.decode(&bytes[..2]);
    text.push_str(&decoder.decode(&bytes[2..euro_start + 1]));
    text.push_str(&decoder.decode(&bytes[euro_start + 1..]));
    text.push_str(&decoder.finish());

    assert_eq!(text, "héllo €");
    assert!(!text.contains('\u{FFFD}'));
}

/// Invalid bytes become replacement characters without stalling.
#[test]
fn invalid_bytes_are_replaced() {
    let mut decoder = ChunkDecoder::new();
    let text = decoder.decode(b"ok\xffok");
    assert_eq!(text, "ok\u{FFFD}ok");
}

/// A dangling partial sequence is flushed lossily at the end.
#[test]
fn finish_flushes_dangling_bytes() {
    let mut decoder = ChunkDecoder::new();
    assert_eq!(decoder.decode(&[b'a', 0xE2, 0x82]), "a");
    assert_eq!(decoder.finish(), "\u{FFFD}");
    assert_eq!(decoder.finish(), "");
}

// ── LineSplitter ────────────────────────────────────────────────────────────

/// Complete lines come out trimmed; the unterminated tail waits.
#[test]
fn lines_are_split_and_buffered() {
    let mut splitter = LineSplitter::new();
    assert_eq!(splitter.push("{\"a\":1}\n  \n{\"b\""), vec!["{\"a\":1}"]);
    assert_eq!(splitter.push(":2}\r\nrest"), vec!["{\"b\":2}"]);
    assert_eq!(splitter.finish(), Some("rest".to_owned()));
    assert_eq!(splitter.finish(), None);
}

// ── Artifacts ───────────────────────────────────────────────────────────────

/// URLs stop at whitespace, quotes and closing parentheses.
#[test]
fn urls_are_extracted() {
    let urls = extract_urls(r#"see https://example.com/a?b=1 and (http://x.org/y) "https://q.io""#);
    assert_eq!(
        urls,
        vec!["https://example.com/a?b=1", "http://x.org/y", "https://q.io"]
    );
}

/// Absolute paths with an extension are collected.
#[test]
fn paths_are_extracted() {
    let paths = extract_paths("wrote /tmp/out/report.md and /var/log/app.log, not /usr/bin");
    assert_eq!(paths, vec!["/tmp/out/report.md", "/var/log/app.log"]);
}

/// Merging keeps first-seen order without duplicates.
#[test]
fn merge_keeps_first_seen_order() {
    let mut target = vec!["a".to_owned()];
    merge_unique(&mut target, vec!["b".into(), "a".into(), "c".into(), "b".into()]);
    assert_eq!(target, vec!["a", "b", "c"]);
}
