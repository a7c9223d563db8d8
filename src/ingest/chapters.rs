use std::path::Path;
use std::sync::OnceLock;

use regex::Regex;
use uuid::Uuid;

use crate::models::{Chunk, FULL_TEXT_TITLE, PREAMBLE_TITLE, UNKNOWN_PATH};

const PREAMBLE_MIN_CHARS: usize = 100;

fn chapter_marker_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"(?m)^(?i:chapter|part|book)[ \t]+(?:[IVXLCDM]+\b|\d+|[A-Z][A-Za-z'\-]*).*$")
            .expect("chapter marker pattern is valid")
    })
}

/// Splits books into chapter-tagged chunks, optionally subdividing long chapters.
#[derive(Clone, Debug, Default)]
pub struct ChapterSegmenter {
    max_chunk_chars: usize,
}

impl ChapterSegmenter {
    pub fn new(max_chunk_chars: usize) -> Self {
        Self { max_chunk_chars }
    }

    pub fn segment(&self, path: Option<&str>, bytes: &[u8]) -> Vec<Chunk> {
        let text = decode_document(bytes);
        let chunks = segment_text(path, &text);
        if self.max_chunk_chars == 0 {
            return chunks;
        }
        split_oversized(chunks, self.max_chunk_chars, text.len())
    }
}

/// UTF-8 decode that drops undecodable bytes instead of replacing them.
pub fn decode_document(bytes: &[u8]) -> String {
    match std::str::from_utf8(bytes) {
        Ok(text) => text.to_string(),
        Err(_) => String::from_utf8_lossy(bytes)
            .chars()
            .filter(|c| *c != char::REPLACEMENT_CHARACTER)
            .collect(),
    }
}

pub fn segment_text(path: Option<&str>, text: &str) -> Vec<Chunk> {
    let path = path
        .map(str::trim)
        .filter(|p| !p.is_empty())
        .unwrap_or(UNKNOWN_PATH)
        .to_string();
    let source_file = source_file_name(&path);
    let total_len = text.len();

    let markers: Vec<(usize, String)> = chapter_marker_re()
        .find_iter(text)
        .map(|m| (m.start(), m.as_str().trim().to_string()))
        .collect();

    let make_chunk = |ordinal: usize, title: &str, start: usize, end: usize, progress: f32| Chunk {
        id: Uuid::new_v4().to_string(),
        path: path.clone(),
        source_file: source_file.clone(),
        ordinal: ordinal as i64,
        chapter_title: title.to_string(),
        progress_pct: progress,
        start,
        end,
        text: text[start..end].to_string(),
    };

    if markers.is_empty() {
        return vec![make_chunk(0, FULL_TEXT_TITLE, 0, total_len, 0.0)];
    }

    let mut chunks = Vec::with_capacity(markers.len() + 1);
    let first_marker = markers[0].0;
    let mut first_start = first_marker;

    if first_marker > 0 {
        let lead = &text[..first_marker];
        if lead.trim().chars().count() > PREAMBLE_MIN_CHARS {
            chunks.push(make_chunk(0, PREAMBLE_TITLE, 0, first_marker, 0.0));
        } else {
            // Too short to stand alone; keep it so the spans still tile the text.
            first_start = 0;
        }
    }

    for (idx, (marker_start, title)) in markers.iter().enumerate() {
        let start = if idx == 0 { first_start } else { *marker_start };
        let end = markers
            .get(idx + 1)
            .map(|(next, _)| *next)
            .unwrap_or(total_len);
        let progress = progress_pct(*marker_start, total_len);
        chunks.push(make_chunk(chunks.len(), title, start, end, progress));
    }

    chunks
}

/// Subdivides chunks longer than `max_chars` bytes at whitespace, keeping spans contiguous.
pub fn split_oversized(chunks: Vec<Chunk>, max_chars: usize, total_len: usize) -> Vec<Chunk> {
    if max_chars == 0 {
        return chunks;
    }

    let mut out = Vec::with_capacity(chunks.len());
    for chunk in chunks {
        if chunk.text.len() <= max_chars {
            out.push(chunk);
            continue;
        }

        let text = chunk.text.as_str();
        let mut piece_start = 0;
        let mut first_piece = true;
        while piece_start < text.len() {
            let piece_end = next_cut(text, piece_start, max_chars);
            let abs_start = chunk.start + piece_start;
            let progress = if first_piece {
                chunk.progress_pct
            } else {
                progress_pct(abs_start, total_len)
            };

            out.push(Chunk {
                id: Uuid::new_v4().to_string(),
                path: chunk.path.clone(),
                source_file: chunk.source_file.clone(),
                ordinal: 0,
                chapter_title: chunk.chapter_title.clone(),
                progress_pct: progress,
                start: abs_start,
                end: chunk.start + piece_end,
                text: text[piece_start..piece_end].to_string(),
            });

            first_piece = false;
            piece_start = piece_end;
        }
    }

    for (ordinal, chunk) in out.iter_mut().enumerate() {
        chunk.ordinal = ordinal as i64;
    }
    out
}

fn next_cut(text: &str, from: usize, max_chars: usize) -> usize {
    if text.len() - from <= max_chars {
        return text.len();
    }

    let mut limit = from + max_chars;
    while !text.is_char_boundary(limit) {
        limit -= 1;
    }
    if limit <= from {
        // A single character wider than the budget.
        return from
            + text[from..]
                .chars()
                .next()
                .map(char::len_utf8)
                .unwrap_or(text.len() - from);
    }

    match text[from..limit].rfind(char::is_whitespace) {
        Some(idx) if idx > 0 => {
            let ws_len = text[from + idx..]
                .chars()
                .next()
                .map(char::len_utf8)
                .unwrap_or(1);
            from + idx + ws_len
        }
        _ => limit,
    }
}

fn progress_pct(offset: usize, total_len: usize) -> f32 {
    if total_len == 0 {
        return 0.0;
    }
    let pct = 100.0 * offset as f64 / total_len as f64;
    ((pct * 10.0).round() / 10.0) as f32
}

pub fn source_file_name(path: &str) -> String {
    Path::new(path)
        .file_name()
        .map(|name| name.to_string_lossy().to_string())
        .unwrap_or_else(|| path.to_string())
}
