//! Embedded resources in stored HTML.
//!
//! Pages, the syllabus, announcements and similar documents carry HTML
//! that points at images and file attachments on the Canvas host. Those
//! references are fetched into the course's `embedded/` directory and the
//! stored HTML is rewritten to the local copies.

use reqwest::Url;
use serde_json::Value;
use sha2::{Digest, Sha256};

/// JSON fields that hold HTML.
pub const HTML_FIELDS: &[&str] = &["body", "syllabus_body", "message", "description"];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkKind {
    Image,
    /// `<a class="instructure_file_link">` attachment.
    File,
}

/// One reference as written in the HTML.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EmbeddedLink {
    pub raw: String,
    pub kind: LinkKind,
}

impl EmbeddedLink {
    /// Absolute URL to fetch. Relative references resolve against `base`;
    /// attachment links that point at a file page get `/download` appended.
    pub fn fetch_url(&self, base: &Url) -> Option<Url> {
        let mut url = base.join(&self.raw.replace("&amp;", "&")).ok()?;
        if !matches!(url.scheme(), "http" | "https") {
            return None;
        }
        if self.kind == LinkKind::File {
            let is_file_page = url
                .path_segments()
                .is_some_and(|mut segs| segs.any(|s| s == "files"));
            let is_download = url
                .path_segments()
                .and_then(|mut segs| segs.next_back())
                .is_some_and(|last| last == "download");
            let has_verifier = url.query_pairs().any(|(k, _)| k == "verifier");
            if is_file_page && !is_download && !has_verifier {
                if let Ok(mut segs) = url.path_segments_mut() {
                    segs.pop_if_empty().push("download");
                }
            }
        }
        Some(url)
    }
}

struct Tag<'a> {
    name: &'a str,
    attrs: Vec<(&'a str, &'a str)>,
}

impl<'a> Tag<'a> {
    fn attr(&self, name: &str) -> Option<&'a str> {
        self.attrs
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| *v)
    }
}

/// Split the start tags out of an HTML fragment. Lenient: malformed markup
/// yields fewer tags, never an error.
fn parse_tags(html: &str) -> Vec<Tag<'_>> {
    let mut tags = Vec::new();
    let mut rest = html;
    while let Some(start) = rest.find('<') {
        rest = &rest[start + 1..];
        let name_end = rest
            .find(|c: char| c.is_whitespace() || c == '>' || c == '/')
            .unwrap_or(rest.len());
        let name = &rest[..name_end];
        rest = &rest[name_end..];

        let mut attrs = Vec::new();
        loop {
            rest = rest.trim_start_matches(|c: char| c.is_whitespace() || c == '/');
            if rest.is_empty() {
                break;
            }
            if let Some(after) = rest.strip_prefix('>') {
                rest = after;
                break;
            }
            let key_end = rest
                .find(|c: char| c.is_whitespace() || c == '=' || c == '>')
                .unwrap_or(rest.len());
            let key = &rest[..key_end];
            rest = rest[key_end..].trim_start();

            let Some(after_eq) = rest.strip_prefix('=') else {
                attrs.push((key, ""));
                continue;
            };
            let after_eq = after_eq.trim_start();
            let (value, remaining) = match after_eq.chars().next() {
                Some(quote @ ('"' | '\'')) => {
                    let body = &after_eq[1..];
                    match body.find(quote) {
                        Some(end) => (&body[..end], &body[end + 1..]),
                        None => (body, ""),
                    }
                }
                _ => {
                    let end = after_eq
                        .find(|c: char| c.is_whitespace() || c == '>')
                        .unwrap_or(after_eq.len());
                    (&after_eq[..end], &after_eq[end..])
                }
            };
            attrs.push((key, value));
            rest = remaining;
        }

        if !name.is_empty() {
            tags.push(Tag { name, attrs });
        }
    }
    tags
}

/// Images and file attachments referenced by `html`, first occurrence
/// first, without duplicates.
pub fn embedded_links(html: &str) -> Vec<EmbeddedLink> {
    let mut links: Vec<EmbeddedLink> = Vec::new();
    for tag in parse_tags(html) {
        let found = if tag.name.eq_ignore_ascii_case("img") {
            tag.attr("src").map(|src| (src, LinkKind::Image))
        } else if tag.name.eq_ignore_ascii_case("a")
            && tag
                .attr("class")
                .is_some_and(|c| c.split_whitespace().any(|c| c == "instructure_file_link"))
        {
            tag.attr("href").map(|href| (href, LinkKind::File))
        } else {
            None
        };

        let Some((raw, kind)) = found else {
            continue;
        };
        let raw = raw.trim();
        if raw.is_empty() || raw.starts_with("data:") || raw.starts_with('#') {
            continue;
        }
        if !links.iter().any(|l| l.raw == raw) {
            links.push(EmbeddedLink {
                raw: raw.to_string(),
                kind,
            });
        }
    }
    links
}

/// Stable local file name for a fetched URL: a digest prefix plus the
/// extension of the last path segment when it has a plausible one.
pub fn local_name(url: &Url) -> String {
    let digest = Sha256::digest(url.as_str().as_bytes());
    let stem = hex::encode(&digest[..8]);
    let extension = url
        .path_segments()
        .and_then(|segs| segs.filter(|s| !s.is_empty()).next_back())
        .and_then(|last| last.rsplit_once('.').map(|(_, ext)| ext))
        .filter(|ext| (1..=5).contains(&ext.len()))
        .filter(|ext| ext.chars().all(|c| c.is_ascii_alphanumeric()));
    match extension {
        Some(ext) => format!("{stem}.{}", ext.to_ascii_lowercase()),
        None => stem,
    }
}

/// Every HTML string in the document, in [`HTML_FIELDS`] at any depth.
pub fn html_fragments(document: &Value) -> Vec<&str> {
    let mut fragments = Vec::new();
    collect_fragments(document, &mut fragments);
    fragments
}

fn collect_fragments<'a>(value: &'a Value, out: &mut Vec<&'a str>) {
    match value {
        Value::Object(map) => {
            for (key, child) in map {
                match child {
                    Value::String(html) if HTML_FIELDS.contains(&key.as_str()) => {
                        out.push(html)
                    }
                    _ => collect_fragments(child, out),
                }
            }
        }
        Value::Array(items) => items.iter().for_each(|item| collect_fragments(item, out)),
        _ => {}
    }
}

/// Replace each `(raw, local)` reference inside the document's HTML fields.
pub fn rewrite_fragments(document: &mut Value, replacements: &[(String, String)]) {
    if replacements.is_empty() {
        return;
    }
    match document {
        Value::Object(map) => {
            for (key, child) in map.iter_mut() {
                match child {
                    Value::String(html) if HTML_FIELDS.contains(&key.as_str()) => {
                        *html = rewrite(html, replacements);
                    }
                    _ => rewrite_fragments(child, replacements),
                }
            }
        }
        Value::Array(items) => items
            .iter_mut()
            .for_each(|item| rewrite_fragments(item, replacements)),
        _ => {}
    }
}

fn rewrite(html: &str, replacements: &[(String, String)]) -> String {
    let mut out = html.to_string();
    for (raw, local) in replacements {
        for quote in ['"', '\''] {
            out = out.replace(
                &format!("={quote}{raw}{quote}"),
                &format!("={quote}{local}{quote}"),
            );
        }
    }
    out
}
