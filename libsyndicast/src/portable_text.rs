//! Portable text conversion
//!
//! Articles are stored as portable text: an ordered list of typed blocks
//! (styled text made of marked spans, images, code). This module turns that
//! structure into the flat representations other consumers need:
//!
//! - plain text for social captions and search snippets
//! - Markdown for newsletter and Medium copy
//! - speech text for text-to-speech, where code is announced and images
//!   are never read out
//!
//! and turns plain text back into blocks.
//!
//! Every converter is total: block kinds it does not understand are skipped,
//! never rejected.
//!
//! ```
//! use libsyndicast::portable_text::{from_plain_text, to_plain_text};
//!
//! let blocks = from_plain_text("First paragraph.\n\n\n\nSecond one.");
//! assert_eq!(blocks.len(), 2);
//! assert_eq!(to_plain_text(&blocks), "First paragraph.\n\nSecond one.");
//! ```

use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

/// Replacement for code blocks in speech output
pub const CODE_PLACEHOLDER: &str = "Code example omitted.";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "_type")]
pub enum Block {
    #[serde(rename = "block")]
    Text(TextBlock),
    #[serde(rename = "image")]
    Image(ImageBlock),
    #[serde(rename = "code")]
    Code(CodeBlock),
    /// Any block kind not listed above
    #[serde(other)]
    Unknown,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TextBlock {
    #[serde(rename = "_key", default)]
    pub key: String,
    #[serde(default)]
    pub style: BlockStyle,
    #[serde(rename = "children", default)]
    pub spans: Vec<Span>,
}

impl TextBlock {
    /// Span texts concatenated, marks dropped
    pub fn text(&self) -> String {
        self.spans.iter().map(|span| span.text.as_str()).collect()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Span {
    #[serde(rename = "_type", default = "span_type")]
    pub kind: String,
    #[serde(rename = "_key", default)]
    pub key: String,
    #[serde(default)]
    pub text: String,
    #[serde(default)]
    pub marks: Vec<Mark>,
}

fn span_type() -> String {
    "span".to_string()
}

impl Span {
    pub fn new(text: impl Into<String>) -> Self {
        Self {
            kind: span_type(),
            key: new_key(),
            text: text.into(),
            marks: Vec::new(),
        }
    }

    pub fn with_marks(mut self, marks: Vec<Mark>) -> Self {
        self.marks = marks;
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum BlockStyle {
    #[default]
    Normal,
    H1,
    H2,
    H3,
    H4,
    Blockquote,
    Other(String),
}

impl BlockStyle {
    fn markdown_prefix(&self) -> &'static str {
        match self {
            BlockStyle::H1 => "# ",
            BlockStyle::H2 => "## ",
            BlockStyle::H3 => "### ",
            BlockStyle::H4 => "#### ",
            BlockStyle::Blockquote => "> ",
            BlockStyle::Normal | BlockStyle::Other(_) => "",
        }
    }
}

impl From<String> for BlockStyle {
    fn from(value: String) -> Self {
        match value.as_str() {
            "normal" => BlockStyle::Normal,
            "h1" => BlockStyle::H1,
            "h2" => BlockStyle::H2,
            "h3" => BlockStyle::H3,
            "h4" => BlockStyle::H4,
            "blockquote" => BlockStyle::Blockquote,
            _ => BlockStyle::Other(value),
        }
    }
}

impl From<BlockStyle> for String {
    fn from(style: BlockStyle) -> Self {
        match style {
            BlockStyle::Normal => "normal".to_string(),
            BlockStyle::H1 => "h1".to_string(),
            BlockStyle::H2 => "h2".to_string(),
            BlockStyle::H3 => "h3".to_string(),
            BlockStyle::H4 => "h4".to_string(),
            BlockStyle::Blockquote => "blockquote".to_string(),
            BlockStyle::Other(other) => other,
        }
    }
}

/// Span decorator. `b` and `i` are accepted as aliases of `strong` and `em`;
/// annotation keys and anything else land in `Other`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum Mark {
    Strong,
    Em,
    Code,
    Underline,
    StrikeThrough,
    Other(String),
}

impl Mark {
    fn wrap_markdown(&self, text: String) -> String {
        match self {
            Mark::Strong => format!("**{}**", text),
            Mark::Em => format!("*{}*", text),
            Mark::Code => format!("`{}`", text),
            Mark::Underline | Mark::StrikeThrough | Mark::Other(_) => text,
        }
    }
}

impl From<String> for Mark {
    fn from(value: String) -> Self {
        match value.as_str() {
            "strong" | "b" => Mark::Strong,
            "em" | "i" => Mark::Em,
            "code" => Mark::Code,
            "underline" => Mark::Underline,
            "strike-through" => Mark::StrikeThrough,
            _ => Mark::Other(value),
        }
    }
}

impl From<Mark> for String {
    fn from(mark: Mark) -> Self {
        match mark {
            Mark::Strong => "strong".to_string(),
            Mark::Em => "em".to_string(),
            Mark::Code => "code".to_string(),
            Mark::Underline => "underline".to_string(),
            Mark::StrikeThrough => "strike-through".to_string(),
            Mark::Other(other) => other,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ImageBlock {
    #[serde(rename = "_key", default)]
    pub key: String,
    #[serde(default)]
    pub asset: Option<AssetReference>,
    #[serde(default)]
    pub alt: Option<String>,
    #[serde(default)]
    pub caption: Option<String>,
}

impl ImageBlock {
    pub fn asset_ref(&self) -> Option<&str> {
        self.asset.as_ref().map(|asset| asset.reference.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AssetReference {
    #[serde(rename = "_ref")]
    pub reference: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CodeBlock {
    #[serde(rename = "_key", default)]
    pub key: String,
    #[serde(default)]
    pub code: String,
    #[serde(default)]
    pub language: Option<String>,
}

/// Read a document from loose JSON.
///
/// Anything that is not an array is the empty document; elements that do not
/// parse as a known block become [`Block::Unknown`].
pub fn parse_document(value: Option<&Value>) -> Vec<Block> {
    match value {
        Some(Value::Array(items)) => items
            .iter()
            .map(|item| Block::deserialize(item).unwrap_or(Block::Unknown))
            .collect(),
        _ => Vec::new(),
    }
}

pub fn to_plain_text(blocks: &[Block]) -> String {
    let parts = blocks.iter().filter_map(|block| match block {
        Block::Text(text) => Some(text.text().trim().to_string()),
        Block::Image(_) | Block::Code(_) | Block::Unknown => None,
    });
    join_blocks(parts)
}

pub fn to_markdown(blocks: &[Block]) -> String {
    let parts = blocks.iter().filter_map(|block| match block {
        Block::Text(text) => Some(text_block_markdown(text)),
        Block::Image(_) | Block::Code(_) | Block::Unknown => None,
    });
    join_blocks(parts)
}

/// Like [`to_plain_text`], but code is announced with [`CODE_PLACEHOLDER`]
/// so narration keeps its flow. Image alt text and captions are never emitted.
pub fn to_speech_text(blocks: &[Block]) -> String {
    let parts = blocks.iter().filter_map(|block| match block {
        Block::Text(text) => Some(text.text().trim().to_string()),
        Block::Code(_) => Some(CODE_PLACEHOLDER.to_string()),
        Block::Image(_) | Block::Unknown => None,
    });
    join_blocks(parts)
}

/// Split on blank-line runs into `normal` blocks, one unmarked span each
pub fn from_plain_text(text: &str) -> Vec<Block> {
    let normalized = text.replace("\r\n", "\n");
    normalized
        .split("\n\n")
        .map(str::trim)
        .filter(|paragraph| !paragraph.is_empty())
        .map(|paragraph| {
            Block::Text(TextBlock {
                key: new_key(),
                style: BlockStyle::Normal,
                spans: vec![Span::new(paragraph)],
            })
        })
        .collect()
}

fn text_block_markdown(block: &TextBlock) -> String {
    let body: String = block
        .spans
        .iter()
        .map(|span| {
            span.marks
                .iter()
                .fold(span.text.clone(), |text, mark| mark.wrap_markdown(text))
        })
        .collect();
    let body = body.trim();

    if body.is_empty() {
        return String::new();
    }
    format!("{}{}", block.style.markdown_prefix(), body)
}

fn join_blocks(parts: impl Iterator<Item = String>) -> String {
    let joined = parts.collect::<Vec<_>>().join("\n\n");
    collapse_newlines(&joined).trim().to_string()
}

/// Runs of three or more newlines become exactly two
fn collapse_newlines(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    let mut run = 0;
    for ch in text.chars() {
        if ch == '\n' {
            run += 1;
            if run > 2 {
                continue;
            }
        } else {
            run = 0;
        }
        out.push(ch);
    }
    out
}

fn new_key() -> String {
    Uuid::new_v4().simple().to_string()[..12].to_string()
}
