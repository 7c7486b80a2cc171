//! Public per-program listing (`<program>/index.html`).
//!
//! Each recording is one `<li>` line carrying a `<!-- rec:<ts> -->` marker.
//! Regeneration keeps every existing line, adds lines for groups whose
//! marker is missing and rewrites the document sorted by timestamp.

use super::group::HostMeta;
use crate::error::Result;
use crate::keys::{self, KeyLayout};
use crate::store::ObjectStore;
use std::collections::BTreeMap;
use tracing::info;

const MARKER_OPEN: &str = "<!-- rec:";
const MARKER_CLOSE: &str = " -->";

pub fn marker(ts: &str) -> String {
    format!("{MARKER_OPEN}{ts}{MARKER_CLOSE}")
}

/// Timestamp carried by an entry line, if it is one.
fn entry_ts(line: &str) -> Option<&str> {
    let start = line.find(MARKER_OPEN)? + MARKER_OPEN.len();
    let len = line[start..].find(MARKER_CLOSE)?;
    Some(&line[start..start + len])
}

fn escape(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    for c in text.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            _ => out.push(c),
        }
    }
    out
}

fn render_entry(store: &dyn ObjectStore, layout: &KeyLayout, program: &str, ts: &str) -> Result<String> {
    let meta = store
        .get(&layout.consolidated(program, ts, "json"))?
        .and_then(|body| HostMeta::parse(&body).ok());
    let title = meta
        .as_ref()
        .and_then(|m| m.title())
        .unwrap_or(program)
        .to_string();
    let when = keys::parse_group_ts(ts)
        .map(|t| t.format("%Y-%m-%d %H:%M").to_string())
        .unwrap_or_else(|_| ts.to_string());

    let mut line = format!("<li>{}", marker(ts));
    let mp3 = meta.as_ref().and_then(|m| m.single_mp3_path());
    match mp3 {
        Some(href) => line.push_str(&format!(
            "<a href=\"{}\">{} {}</a>",
            escape(href),
            when,
            escape(&title)
        )),
        None => line.push_str(&format!("{} {}", when, escape(&title))),
    }
    if let Some(href) = meta.as_ref().and_then(|m| m.single_mp4_path()) {
        line.push_str(&format!(" <a href=\"{}\">[mp4]</a>", escape(href)));
    }
    line.push_str("</li>");
    Ok(line)
}

fn render_document(program: &str, entries: &BTreeMap<String, String>) -> String {
    let mut doc = String::new();
    doc.push_str("<!DOCTYPE html>\n<html>\n<head>\n<meta charset=\"utf-8\">\n");
    doc.push_str(&format!("<title>{}</title>\n", escape(program)));
    doc.push_str("</head>\n<body>\n");
    doc.push_str(&format!("<h1>{}</h1>\n<ul>\n", escape(program)));
    for line in entries.values() {
        doc.push_str(line);
        doc.push('\n');
    }
    doc.push_str("</ul>\n</body>\n</html>\n");
    doc
}

/// Add entries for `published` groups not yet listed. Returns how many
/// were added; the index is not rewritten when nothing is new.
pub fn regenerate(
    store: &dyn ObjectStore,
    layout: &KeyLayout,
    program: &str,
    published: &[String],
) -> Result<usize> {
    let key = layout.index(program);
    let existing = store.get_string(&key)?.unwrap_or_default();

    let mut entries: BTreeMap<String, String> = existing
        .lines()
        .filter_map(|line| entry_ts(line).map(|ts| (ts.to_string(), line.to_string())))
        .collect();

    let mut added = 0;
    for ts in published {
        if entries.contains_key(ts) {
            continue;
        }
        entries.insert(ts.clone(), render_entry(store, layout, program, ts)?);
        added += 1;
    }

    if added > 0 {
        store.put(&key, render_document(program, &entries).as_bytes())?;
        info!(program, added, "index updated");
    }
    Ok(added)
}
