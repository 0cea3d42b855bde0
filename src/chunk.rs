//! Structure-aware document chunker.
//!
//! Splits a [`SourceDocument`] whose content exceeds `max_len` bytes into
//! [`DocumentChunk`]s that respect markdown structure: headings and fenced
//! code blocks are never split, list items keep their continuation lines,
//! and oversized paragraphs are broken on sentence, then whitespace, then
//! character boundaries.
//!
//! Consecutive chunks share an overlap: the tail of one chunk is repeated as
//! the prefix of the next. Each chunk id is derived from the parent id and a
//! SHA-256 of the final content, so re-chunking unchanged input yields the
//! same ids in the same order.
//!
//! Chunks are produced lazily by the [`Chunks`] iterator.

use std::ops::Range;

use crate::config::ChunkingConfig;
use crate::delta::hash_content;
use crate::models::{ChunkMetadata, DocumentChunk, MimeClass, SourceDocument};

/// Hex chars of the content hash used in a chunk id.
const CHUNK_ID_HASH_CHARS: usize = 12;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TokenKind {
    Heading(u8),
    CodeFence,
    ListItem,
    Paragraph,
    Blank,
}

impl TokenKind {
    fn is_atomic(self) -> bool {
        matches!(self, TokenKind::Heading(_) | TokenKind::CodeFence)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Token {
    kind: TokenKind,
    start: usize,
    end: usize,
}

impl Token {
    fn len(&self) -> usize {
        self.end - self.start
    }
}

/// True when `content` must be split to fit `config.max_len`.
pub fn needs_chunking(content: &str, config: &ChunkingConfig) -> bool {
    content.len() > config.max_len
}

/// SHA-256 of `content`, lowercase hex.
pub fn content_hash(content: &str) -> String {
    hash_content(content.as_bytes())
}

/// Chunk `doc` according to `config`.
pub fn chunk_document<'a>(doc: &'a SourceDocument, config: &ChunkingConfig) -> Chunks<'a> {
    let single = !needs_chunking(&doc.content, config);
    let tokens = if single {
        Vec::new()
    } else {
        let raw = match doc.mime {
            MimeClass::Markdown => tokenize_markdown(&doc.content),
            MimeClass::Text | MimeClass::Pdf => tokenize_plain(&doc.content),
        };
        presplit(&doc.content, raw, config.max_len)
    };
    let headings = tokens
        .iter()
        .filter_map(|t| match t.kind {
            TokenKind::Heading(level) => {
                Some((t.start, level, heading_title(&doc.content[t.start..t.end])))
            }
            _ => None,
        })
        .collect();

    Chunks {
        doc,
        config: *config,
        single,
        tokens,
        cursor: 0,
        lookahead: None,
        started: false,
        overlap: String::new(),
        headings,
        heading_cursor: 0,
        crumbs: Vec::new(),
        sequence: 0,
    }
}

/// A contiguous run of tokens that becomes one chunk's own text.
#[derive(Debug, Clone)]
struct Segment {
    start: usize,
    end: usize,
    tokens: Range<usize>,
}

/// Lazy iterator over the chunks of one document.
pub struct Chunks<'a> {
    doc: &'a SourceDocument,
    config: ChunkingConfig,
    single: bool,
    tokens: Vec<Token>,
    cursor: usize,
    lookahead: Option<Segment>,
    started: bool,
    /// Prefix for the next chunk, taken from the tail of the previous one.
    overlap: String,
    headings: Vec<(usize, u8, String)>,
    heading_cursor: usize,
    crumbs: Vec<(u8, String)>,
    sequence: usize,
}

impl Iterator for Chunks<'_> {
    type Item = DocumentChunk;

    fn next(&mut self) -> Option<DocumentChunk> {
        if self.single {
            if self.started {
                return None;
            }
            self.started = true;
            let content = self.doc.content.clone();
            return Some(self.make_chunk(String::new(), 0, content.len(), content, false));
        }

        let segment = match self.lookahead.take() {
            Some(segment) => segment,
            None if !self.started => self.next_segment()?,
            None => return None,
        };
        self.started = true;
        self.lookahead = self.next_segment();
        let has_next = self.lookahead.is_some();

        let prefix = std::mem::take(&mut self.overlap);
        if has_next {
            self.overlap = self.overlap_of(&segment);
        }
        self.advance_crumbs(segment.start);

        let own = &self.doc.content[segment.start..segment.end];
        let mut content = String::with_capacity(prefix.len() + own.len());
        content.push_str(&prefix);
        content.push_str(own);
        Some(self.make_chunk(prefix, segment.start, segment.end, content, has_next))
    }
}

impl Chunks<'_> {
    fn make_chunk(
        &mut self,
        prefix: String,
        start: usize,
        end: usize,
        content: String,
        has_next: bool,
    ) -> DocumentChunk {
        let hash = content_hash(&content);
        let chunk = DocumentChunk {
            id: format!("{}:{}", self.doc.id, &hash[..CHUNK_ID_HASH_CHARS]),
            parent_id: self.doc.id.clone(),
            content,
            start,
            end,
            content_hash: hash,
            metadata: ChunkMetadata {
                overlap_with_prev: !prefix.is_empty(),
                overlap_with_next: has_next,
                mime: self.doc.mime,
                heading_breadcrumbs: self.crumbs.iter().map(|(_, t)| t.clone()).collect(),
                sequence_order: self.sequence,
                updated_at: self.doc.updated_at,
            },
        };
        self.sequence += 1;
        chunk
    }

    /// Assemble the next non-blank segment from the token stream.
    fn next_segment(&mut self) -> Option<Segment> {
        let mut first = self.cursor;
        let mut buf_len = 0;

        while self.cursor < self.tokens.len() {
            let tok = self.tokens[self.cursor];
            if self.cursor > first && buf_len + tok.len() > self.config.max_len {
                if let Some(segment) = self.segment(first..self.cursor) {
                    return Some(segment);
                }
                first = self.cursor;
                buf_len = 0;
            }
            buf_len += tok.len();
            self.cursor += 1;
            if buf_len >= self.config.target_len {
                if let Some(segment) = self.segment(first..self.cursor) {
                    return Some(segment);
                }
                first = self.cursor;
                buf_len = 0;
            }
        }

        if first < self.cursor {
            return self.segment(first..self.cursor);
        }
        None
    }

    /// Segment over `range`, or `None` when it holds only whitespace.
    fn segment(&self, range: Range<usize>) -> Option<Segment> {
        let start = self.tokens[range.start].start;
        let end = self.tokens[range.end - 1].end;
        if self.doc.content[start..end].trim().is_empty() {
            return None;
        }
        Some(Segment {
            start,
            end,
            tokens: range,
        })
    }

    /// Tail of `segment` repeated at the start of the following chunk.
    fn overlap_of(&self, segment: &Segment) -> String {
        let budget = self.config.overlap_len;
        if budget == 0 {
            return String::new();
        }
        let content = &self.doc.content;
        let mut begin = segment.end;
        let mut acc = 0;

        for tok in self.tokens[segment.tokens.clone()].iter().rev() {
            if acc >= budget {
                break;
            }
            if acc + tok.len() <= budget {
                begin = tok.start;
                acc += tok.len();
                continue;
            }
            if tok.kind.is_atomic() {
                begin = tok.start;
            } else {
                let mut from = tok.end - (budget - acc);
                while !content.is_char_boundary(from) {
                    from += 1;
                }
                if let Some(pos) = sentence_start(&content[from..tok.end]) {
                    begin = from + pos;
                }
            }
            break;
        }

        let overlap = &content[begin..segment.end];
        if overlap.trim().is_empty() {
            String::new()
        } else {
            overlap.to_string()
        }
    }

    /// Fold headings that start before `offset` into the breadcrumb stack.
    fn advance_crumbs(&mut self, offset: usize) {
        while let Some((start, level, title)) = self.headings.get(self.heading_cursor) {
            if *start >= offset {
                break;
            }
            while self.crumbs.last().is_some_and(|(l, _)| *l >= *level) {
                self.crumbs.pop();
            }
            self.crumbs.push((*level, title.clone()));
            self.heading_cursor += 1;
        }
    }
}

/// Offset just past the first sentence boundary in `text`, skipping the
/// whitespace that follows it. `None` if no boundary leaves any text.
fn sentence_start(text: &str) -> Option<usize> {
    let mut chars = text.char_indices().peekable();
    while let Some((i, c)) = chars.next() {
        if matches!(c, '.' | '!' | '?') {
            if let Some(&(_, next)) = chars.peek() {
                if next.is_whitespace() {
                    let rest = &text[i + 1..];
                    let skipped = rest.len() - rest.trim_start().len();
                    let pos = i + 1 + skipped;
                    return (pos < text.len()).then_some(pos);
                }
            }
        }
    }
    None
}

/// Byte offset of the last sentence boundary cut in `window`: just past the
/// whitespace following `.`, `!` or `?`.
fn last_sentence_cut(window: &str) -> Option<usize> {
    let bytes = window.as_bytes();
    let mut best = None;
    for (i, c) in window.char_indices() {
        if c.is_whitespace() && i > 0 && matches!(bytes[i - 1], b'.' | b'!' | b'?') {
            best = Some(i + c.len_utf8());
        }
    }
    best
}

fn last_whitespace_cut(window: &str) -> Option<usize> {
    window
        .char_indices()
        .rev()
        .find(|(_, c)| c.is_whitespace())
        .map(|(i, c)| i + c.len_utf8())
}

/// Break paragraphs and list items longer than `max_len` into pieces.
fn presplit(content: &str, tokens: Vec<Token>, max_len: usize) -> Vec<Token> {
    let mut out = Vec::with_capacity(tokens.len());
    for tok in tokens {
        if tok.len() <= max_len || !matches!(tok.kind, TokenKind::Paragraph | TokenKind::ListItem) {
            out.push(tok);
            continue;
        }
        let mut pos = tok.start;
        while tok.end - pos > max_len {
            let mut window_end = pos + max_len;
            while !content.is_char_boundary(window_end) {
                window_end -= 1;
            }
            if window_end == pos {
                window_end = pos + 1;
                while !content.is_char_boundary(window_end) {
                    window_end += 1;
                }
            }
            let window = &content[pos..window_end];
            let cut = last_sentence_cut(window)
                .or_else(|| last_whitespace_cut(window))
                .unwrap_or(window.len());
            out.push(Token {
                kind: tok.kind,
                start: pos,
                end: pos + cut,
            });
            pos += cut;
        }
        if pos < tok.end {
            out.push(Token {
                kind: tok.kind,
                start: pos,
                end: tok.end,
            });
        }
    }
    out
}

/// Line spans including their terminators.
fn line_spans(content: &str) -> Vec<Range<usize>> {
    let mut spans = Vec::new();
    let mut offset = 0;
    for line in content.split_inclusive('\n') {
        spans.push(offset..offset + line.len());
        offset += line.len();
    }
    spans
}

fn is_blank(line: &str) -> bool {
    line.trim().is_empty()
}

fn is_indented(line: &str) -> bool {
    line.starts_with(' ') || line.starts_with('\t')
}

fn heading_level(line: &str) -> Option<u8> {
    let hashes = line.bytes().take_while(|b| *b == b'#').count();
    if !(1..=6).contains(&hashes) {
        return None;
    }
    match line.as_bytes().get(hashes) {
        Some(b' ') | Some(b'\t') => Some(hashes as u8),
        _ => None,
    }
}

fn heading_title(raw: &str) -> String {
    raw.trim_start_matches('#').trim().to_string()
}

/// Fence character and run length when `line` opens a code fence.
fn fence_open(line: &str) -> Option<(char, usize)> {
    let trimmed = line.trim_start_matches(' ');
    if line.len() - trimmed.len() > 3 {
        return None;
    }
    let marker = trimmed.chars().next()?;
    if marker != '`' && marker != '~' {
        return None;
    }
    let run = trimmed.chars().take_while(|c| *c == marker).count();
    (run >= 3).then_some((marker, run))
}

fn fence_closes(line: &str, marker: char, run: usize) -> bool {
    let trimmed = line.trim();
    let count = trimmed.chars().take_while(|c| *c == marker).count();
    count >= run && trimmed.chars().all(|c| c == marker)
}

fn is_list_item(line: &str) -> bool {
    let trimmed = line.trim_start_matches(' ');
    if line.len() - trimmed.len() > 3 {
        return false;
    }
    let bytes = trimmed.as_bytes();
    if let [b'-' | b'*' | b'+', b' ' | b'\t', ..] = bytes {
        return true;
    }
    let digits = bytes.iter().take_while(|b| b.is_ascii_digit()).count();
    digits > 0
        && matches!(bytes.get(digits), Some(b'.') | Some(b')'))
        && matches!(bytes.get(digits + 1), Some(b' ') | Some(b'\t'))
}

fn starts_block(line: &str) -> bool {
    heading_level(line).is_some() || fence_open(line).is_some() || is_list_item(line)
}

fn tokenize_markdown(content: &str) -> Vec<Token> {
    let spans = line_spans(content);
    let line = |i: usize| &content[spans[i].clone()];
    let mut tokens = Vec::new();
    let mut i = 0;

    while i < spans.len() {
        let start = spans[i].start;
        let text = line(i);

        if is_blank(text) {
            let mut j = i + 1;
            while j < spans.len() && is_blank(line(j)) {
                j += 1;
            }
            tokens.push(Token {
                kind: TokenKind::Blank,
                start,
                end: spans[j - 1].end,
            });
            i = j;
        } else if let Some(level) = heading_level(text) {
            tokens.push(Token {
                kind: TokenKind::Heading(level),
                start,
                end: spans[i].end,
            });
            i += 1;
        } else if let Some((marker, run)) = fence_open(text) {
            let mut j = i + 1;
            while j < spans.len() && !fence_closes(line(j), marker, run) {
                j += 1;
            }
            let last = j.min(spans.len() - 1);
            tokens.push(Token {
                kind: TokenKind::CodeFence,
                start,
                end: spans[last].end,
            });
            i = last + 1;
        } else if is_list_item(text) {
            let mut j = i + 1;
            while j < spans.len() {
                let next = line(j);
                if is_blank(next) {
                    let mut k = j + 1;
                    while k < spans.len() && is_blank(line(k)) {
                        k += 1;
                    }
                    if k < spans.len() && is_indented(line(k)) {
                        j = k;
                        continue;
                    }
                    break;
                }
                if is_indented(next) && fence_open(next).is_none() {
                    j += 1;
                    continue;
                }
                break;
            }
            tokens.push(Token {
                kind: TokenKind::ListItem,
                start,
                end: spans[j - 1].end,
            });
            i = j;
        } else {
            let mut j = i + 1;
            while j < spans.len() && !is_blank(line(j)) && !starts_block(line(j)) {
                j += 1;
            }
            tokens.push(Token {
                kind: TokenKind::Paragraph,
                start,
                end: spans[j - 1].end,
            });
            i = j;
        }
    }
    tokens
}

fn tokenize_plain(content: &str) -> Vec<Token> {
    let spans = line_spans(content);
    let mut tokens: Vec<Token> = Vec::new();
    for span in spans {
        let kind = if is_blank(&content[span.clone()]) {
            TokenKind::Blank
        } else {
            TokenKind::Paragraph
        };
        match tokens.last_mut() {
            Some(last) if last.kind == kind => last.end = span.end,
            _ => tokens.push(Token {
                kind,
                start: span.start,
                end: span.end,
            }),
        }
    }
    tokens
}
