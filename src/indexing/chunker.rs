use super::discovery::FileKind;
use csv::ReaderBuilder;
use pulldown_cmark::{Event, Parser, Tag, TagEnd};
use tracing::warn;

/// Maximum characters per chunk
pub const CHUNK_SIZE: usize = 1000;

const TEXT_SEPARATORS: &[&str] = &["\n\n", "\n", " ", ""];
const PYTHON_SEPARATORS: &[&str] = &["\nclass ", "\ndef ", "\n\tdef ", "\n    def ", "\n\n", "\n", " ", ""];
const GO_SEPARATORS: &[&str] = &["\nfunc ", "\ntype ", "\n\n", "\n", " ", ""];

/// A chunk of text with its context
#[derive(Debug, Clone, PartialEq)]
pub struct TextChunk {
    pub text: String,
    pub context: String, // e.g. "Title > Section" for Markdown
    pub chunk_index: usize,
}

/// Split file content into chunks according to its kind
pub fn chunk_text(content: &str, kind: FileKind) -> Vec<TextChunk> {
    let sections: Vec<(String, String)> = match kind {
        FileKind::Markdown => markdown_sections(content),
        FileKind::Csv => csv_rows(content)
            .into_iter()
            .map(|row| (String::new(), row))
            .collect(),
        FileKind::Text
        | FileKind::Python
        | FileKind::Go
        | FileKind::Pdf
        | FileKind::Docx
        | FileKind::Pptx => {
            vec![(String::new(), content.to_string())]
        }
    };

    let separators = match kind {
        FileKind::Python => PYTHON_SEPARATORS,
        FileKind::Go => GO_SEPARATORS,
        _ => TEXT_SEPARATORS,
    };

    let mut chunks = Vec::new();
    for (context, text) in sections {
        let mut pieces = Vec::new();
        split_recursive(&text, separators, CHUNK_SIZE, &mut pieces);
        for piece in pieces {
            chunks.push(TextChunk {
                text: piece,
                context: context.clone(),
                chunk_index: chunks.len(),
            });
        }
    }
    chunks
}

/// Group Markdown text by heading section, returning `(heading trail, body)`
fn markdown_sections(content: &str) -> Vec<(String, String)> {
    let mut sections = Vec::new();
    let mut header_stack: Vec<String> = Vec::new();
    let mut current_text = String::new();
    let mut heading_text = String::new();
    let mut heading_level = 0usize;
    let mut in_heading = false;

    for event in Parser::new(content) {
        match event {
            Event::Start(Tag::Heading { level, .. }) => {
                if !current_text.trim().is_empty() {
                    sections.push((build_context(&header_stack), current_text.trim().to_string()));
                }
                current_text.clear();
                in_heading = true;
                heading_level = level as usize;
                heading_text.clear();
            }
            Event::End(TagEnd::Heading(_)) if in_heading => {
                in_heading = false;
                header_stack.truncate(heading_level.saturating_sub(1));
                header_stack.push(heading_text.trim().to_string());
            }
            Event::Text(text) | Event::Code(text) => {
                if in_heading {
                    heading_text.push_str(&text);
                } else {
                    current_text.push_str(&text);
                }
            }
            Event::SoftBreak => current_text.push(' '),
            Event::HardBreak => current_text.push('\n'),
            Event::End(TagEnd::Paragraph)
            | Event::End(TagEnd::Item)
            | Event::End(TagEnd::CodeBlock) => current_text.push_str("\n\n"),
            _ => {}
        }
    }

    if !current_text.trim().is_empty() {
        sections.push((build_context(&header_stack), current_text.trim().to_string()));
    }
    sections
}

/// One `header: value` block per CSV record
fn csv_rows(content: &str) -> Vec<String> {
    let mut reader = ReaderBuilder::new()
        .flexible(true)
        .from_reader(content.as_bytes());
    let headers = match reader.headers() {
        Ok(headers) => headers.clone(),
        Err(e) => {
            warn!("Unreadable CSV header: {}", e);
            return Vec::new();
        }
    };

    let mut rows = Vec::new();
    for record in reader.records() {
        let record = match record {
            Ok(record) => record,
            Err(e) => {
                warn!("Skipping malformed CSV record: {}", e);
                continue;
            }
        };
        if record.iter().all(|value| value.trim().is_empty()) {
            continue;
        }
        let row = record
            .iter()
            .enumerate()
            .map(|(i, value)| match headers.get(i) {
                Some(header) => format!("{}: {}", header.trim(), value.trim()),
                None => value.trim().to_string(),
            })
            .collect::<Vec<_>>()
            .join("\n");
        rows.push(row);
    }
    rows
}

/// Recursively split `text` on the first separator it contains, merging
/// neighbouring pieces back together up to `limit` characters.
fn split_recursive(text: &str, separators: &[&str], limit: usize, out: &mut Vec<String>) {
    if char_len(text) <= limit {
        push_trimmed(text, out);
        return;
    }

    let pos = separators
        .iter()
        .position(|sep| sep.is_empty() || text.contains(sep))
        .unwrap_or(separators.len().saturating_sub(1));
    let separator = separators.get(pos).copied().unwrap_or("");
    let finer = separators.get(pos + 1..).unwrap_or(&[]);

    if separator.is_empty() {
        let chars: Vec<char> = text.chars().collect();
        for window in chars.chunks(limit) {
            push_trimmed(&window.iter().collect::<String>(), out);
        }
        return;
    }

    let mut current = String::new();
    for piece in split_keep(text, separator) {
        if char_len(piece) > limit {
            push_trimmed(&current, out);
            current.clear();
            split_recursive(piece, finer, limit, out);
            continue;
        }
        if char_len(&current) + char_len(piece) > limit {
            push_trimmed(&current, out);
            current.clear();
        }
        current.push_str(piece);
    }
    push_trimmed(&current, out);
}

/// Split before each occurrence of `separator`, keeping it on the following piece
fn split_keep<'a>(text: &'a str, separator: &str) -> Vec<&'a str> {
    let mut pieces = Vec::new();
    let mut start = 0;
    for (idx, _) in text.match_indices(separator) {
        if idx > start {
            pieces.push(&text[start..idx]);
        }
        start = idx;
    }
    if start < text.len() {
        pieces.push(&text[start..]);
    }
    pieces
}

fn push_trimmed(text: &str, out: &mut Vec<String>) {
    let trimmed = text.trim();
    if !trimmed.is_empty() {
        out.push(trimmed.to_string());
    }
}

fn char_len(text: &str) -> usize {
    text.chars().count()
}

/// Build context string from header hierarchy
fn build_context(headers: &[String]) -> String {
    headers.join(" > ")
}
