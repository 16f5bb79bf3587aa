//! Parsers for text-based formats: plain text, Markdown, CSV, WebVTT and
//! Java-style properties files.

use std::sync::LazyLock;

use pulldown_cmark::{Event, Options, Parser, Tag, TagEnd};
use regex::Regex;
use serde_json::{json, Value};

use super::{decode_utf8, DocumentParser};
use crate::error::Result;
use crate::models::{Metadata, RawDocument};

static VTT_TAG: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"<[^>]+>").unwrap());

/// Wrap extracted text as a single document, or none when it is blank.
///
/// `extend_params` are copied into the metadata, followed by `file_name`
/// and `file_type`.
pub fn text_document(
    file_name: &str,
    file_type: &str,
    text: String,
    extend_params: &Metadata,
) -> Vec<RawDocument> {
    if text.trim().is_empty() {
        return Vec::new();
    }
    let mut metadata = extend_params.clone();
    metadata.insert("file_name".into(), json!(file_name));
    metadata.insert("file_type".into(), json!(file_type));
    vec![RawDocument {
        source_doc_id: file_name.to_string(),
        text,
        metadata,
    }]
}

pub struct PlainTextParser;

impl DocumentParser for PlainTextParser {
    fn supported_types(&self) -> &[&'static str] {
        &["txt", "text"]
    }

    fn parse(&self, resource: &[u8], file_name: &str, extend_params: &Metadata) -> Result<Vec<RawDocument>> {
        let text = decode_utf8(resource, file_name)?.replace("\r\n", "\n");
        Ok(text_document(file_name, "txt", text, extend_params))
    }
}

/// Markdown to plain paragraphs. Headings are kept in the text and listed in
/// `metadata["headings"]`; the first one becomes `metadata["title"]`.
pub struct MarkdownParser;

impl DocumentParser for MarkdownParser {
    fn supported_types(&self) -> &[&'static str] {
        &["md", "markdown", "mdx"]
    }

    fn parse(&self, resource: &[u8], file_name: &str, extend_params: &Metadata) -> Result<Vec<RawDocument>> {
        let content = decode_utf8(resource, file_name)?;
        let (text, headings) = markdown_to_text(&content);

        let mut docs = text_document(file_name, "markdown", text, extend_params);
        if let Some(doc) = docs.first_mut() {
            if let Some(title) = headings.first() {
                doc.metadata.insert("title".into(), json!(title));
            }
            doc.metadata.insert("headings".into(), json!(headings));
        }
        Ok(docs)
    }
}

fn markdown_to_text(content: &str) -> (String, Vec<String>) {
    let mut blocks: Vec<String> = Vec::new();
    let mut headings: Vec<String> = Vec::new();
    let mut block = String::new();

    fn flush(block: &mut String, blocks: &mut Vec<String>) {
        let t = block.trim();
        // a bare list marker carries no text
        if !t.is_empty() && t != "-" {
            blocks.push(t.to_string());
        }
        block.clear();
    }

    for event in Parser::new_ext(content, Options::ENABLE_TABLES) {
        match event {
            Event::Start(Tag::Heading { .. }) => flush(&mut block, &mut blocks),
            Event::End(TagEnd::Heading(_)) => {
                let heading = block.trim().to_string();
                if !heading.is_empty() {
                    headings.push(heading);
                }
                flush(&mut block, &mut blocks);
            }
            Event::Start(Tag::Item) => {
                flush(&mut block, &mut blocks);
                block.push_str("- ");
            }
            Event::End(
                TagEnd::Paragraph
                | TagEnd::CodeBlock
                | TagEnd::Item
                | TagEnd::TableHead
                | TagEnd::TableRow,
            ) => flush(&mut block, &mut blocks),
            Event::End(TagEnd::TableCell) => block.push_str(" | "),
            Event::Text(t) | Event::Code(t) => block.push_str(&t),
            Event::SoftBreak => block.push(' '),
            Event::HardBreak => block.push('\n'),
            _ => {}
        }
    }
    flush(&mut block, &mut blocks);

    let blocks: Vec<String> = blocks
        .into_iter()
        .map(|b| b.trim_end_matches(" |").to_string())
        .collect();
    (blocks.join("\n\n"), headings)
}

/// CSV with a header row. Each data row becomes one `header: value; ...`
/// line.
pub struct CsvParser;

impl DocumentParser for CsvParser {
    fn supported_types(&self) -> &[&'static str] {
        &["csv"]
    }

    fn parse(&self, resource: &[u8], file_name: &str, extend_params: &Metadata) -> Result<Vec<RawDocument>> {
        let content = decode_utf8(resource, file_name)?;
        let mut records = parse_csv(&content).into_iter();
        let Some(header) = records.next() else {
            return Ok(Vec::new());
        };

        let mut lines = Vec::new();
        for row in records {
            let fields: Vec<String> = row
                .iter()
                .enumerate()
                .filter(|(_, v)| !v.trim().is_empty())
                .map(|(i, v)| match header.get(i) {
                    Some(h) if !h.trim().is_empty() => format!("{}: {}", h.trim(), v.trim()),
                    _ => v.trim().to_string(),
                })
                .collect();
            if !fields.is_empty() {
                lines.push(fields.join("; "));
            }
        }

        let rows = lines.len();
        let mut docs = text_document(file_name, "csv", lines.join("\n"), extend_params);
        if let Some(doc) = docs.first_mut() {
            doc.metadata.insert("rows".into(), json!(rows));
            doc.metadata.insert(
                "columns".into(),
                Value::Array(header.into_iter().map(Value::String).collect()),
            );
        }
        Ok(docs)
    }
}

/// Split CSV content into records. Handles quoted fields, doubled quotes
/// and line breaks inside quotes.
fn parse_csv(content: &str) -> Vec<Vec<String>> {
    let mut records = Vec::new();
    let mut record = Vec::new();
    let mut field = String::new();
    let mut in_quotes = false;
    let mut chars = content.chars().peekable();

    while let Some(c) = chars.next() {
        if in_quotes {
            match c {
                '"' if chars.peek() == Some(&'"') => {
                    field.push('"');
                    chars.next();
                }
                '"' => in_quotes = false,
                _ => field.push(c),
            }
            continue;
        }
        match c {
            '"' => in_quotes = true,
            ',' => record.push(std::mem::take(&mut field)),
            '\r' => {}
            '\n' => {
                record.push(std::mem::take(&mut field));
                if record.iter().any(|f| !f.is_empty()) {
                    records.push(std::mem::take(&mut record));
                } else {
                    record.clear();
                }
            }
            _ => field.push(c),
        }
    }
    if !field.is_empty() || !record.is_empty() {
        record.push(field);
        if record.iter().any(|f| !f.is_empty()) {
            records.push(record);
        }
    }
    records
}

/// WebVTT subtitles. Keeps cue text only; timings, identifiers, notes and
/// voice tags are dropped, and consecutive repeated lines are collapsed.
pub struct VttParser;

impl DocumentParser for VttParser {
    fn supported_types(&self) -> &[&'static str] {
        &["vtt"]
    }

    fn parse(&self, resource: &[u8], file_name: &str, extend_params: &Metadata) -> Result<Vec<RawDocument>> {
        let content = decode_utf8(resource, file_name)?.replace("\r\n", "\n");
        let mut lines: Vec<String> = Vec::new();

        for block in content.split("\n\n") {
            let block = block.trim();
            if block.is_empty()
                || block.starts_with("WEBVTT")
                || block.starts_with("NOTE")
                || block.starts_with("STYLE")
                || block.starts_with("REGION")
            {
                continue;
            }
            let mut in_cue = false;
            for line in block.lines() {
                if line.contains("-->") {
                    in_cue = true;
                    continue;
                }
                if !in_cue {
                    // cue identifier
                    continue;
                }
                let text = VTT_TAG.replace_all(line, "").trim().to_string();
                if !text.is_empty() && lines.last() != Some(&text) {
                    lines.push(text);
                }
            }
        }

        Ok(text_document(file_name, "vtt", lines.join("\n"), extend_params))
    }
}

/// Java-style `.properties`. Emits one `key: value` line per entry.
pub struct PropertiesParser;

impl DocumentParser for PropertiesParser {
    fn supported_types(&self) -> &[&'static str] {
        &["properties"]
    }

    fn parse(&self, resource: &[u8], file_name: &str, extend_params: &Metadata) -> Result<Vec<RawDocument>> {
        let content = decode_utf8(resource, file_name)?;
        let mut out = Vec::new();
        let mut logical = String::new();

        for raw in content.lines() {
            let line = raw.trim_start();
            if logical.is_empty() && (line.is_empty() || line.starts_with('#') || line.starts_with('!')) {
                continue;
            }
            if let Some(head) = line.strip_suffix('\\') {
                logical.push_str(head);
                continue;
            }
            logical.push_str(line);
            if let Some(entry) = property_line(&logical) {
                out.push(entry);
            }
            logical.clear();
        }
        if let Some(entry) = property_line(&logical) {
            out.push(entry);
        }

        Ok(text_document(file_name, "properties", out.join("\n"), extend_params))
    }
}

fn property_line(line: &str) -> Option<String> {
    let line = line.trim();
    if line.is_empty() {
        return None;
    }
    match line.find(['=', ':']) {
        Some(pos) => {
            let key = line[..pos].trim();
            let value = line[pos + 1..].trim();
            Some(format!("{}: {}", key, value))
        }
        None => Some(line.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse_one(parser: &dyn DocumentParser, content: &str, name: &str) -> RawDocument {
        let mut docs = parser.parse(content.as_bytes(), name, &Metadata::new()).unwrap();
        assert_eq!(docs.len(), 1);
        docs.remove(0)
    }

    #[test]
    fn plain_text_normalises_line_endings() {
        let doc = parse_one(&PlainTextParser, "a\r\nb", "a.txt");
        assert_eq!(doc.text, "a\nb");
        assert_eq!(doc.metadata["file_name"], json!("a.txt"));
    }

    #[test]
    fn blank_text_yields_nothing() {
        let docs = PlainTextParser.parse(b"  \n ", "a.txt", &Metadata::new()).unwrap();
        assert!(docs.is_empty());
    }

    #[test]
    fn extend_params_are_kept() {
        let mut params = Metadata::new();
        params.insert("tenant".into(), json!("acme"));
        let docs = PlainTextParser.parse(b"x", "a.txt", &params).unwrap();
        assert_eq!(docs[0].metadata["tenant"], json!("acme"));
    }

    #[test]
    fn markdown_headings_and_paragraphs() {
        let md = "# Refunds\n\nWe refund **within** 7 days.\n\n## Steps\n\n- open a ticket\n- attach `order id`\n";
        let doc = parse_one(&MarkdownParser, md, "faq.md");
        assert_eq!(
            doc.text,
            "Refunds\n\nWe refund within 7 days.\n\nSteps\n\n- open a ticket\n\n- attach order id"
        );
        assert_eq!(doc.metadata["title"], json!("Refunds"));
        assert_eq!(doc.metadata["headings"], json!(["Refunds", "Steps"]));
    }

    #[test]
    fn csv_rows_become_keyed_lines() {
        let csv = "question,answer\n\"How, exactly?\",\"Say \"\"hi\"\"\"\nRefund?,7 days\n";
        let doc = parse_one(&CsvParser, csv, "faq.csv");
        assert_eq!(
            doc.text,
            "question: How, exactly?; answer: Say \"hi\"\nquestion: Refund?; answer: 7 days"
        );
        assert_eq!(doc.metadata["rows"], json!(2));
    }

    #[test]
    fn csv_quoted_newline_stays_in_field() {
        let records = parse_csv("a,b\n\"x\ny\",z");
        assert_eq!(records.len(), 2);
        assert_eq!(records[1], vec!["x\ny".to_string(), "z".to_string()]);
    }

    #[test]
    fn vtt_keeps_cue_text() {
        let vtt = "WEBVTT\n\nNOTE internal\n\n1\n00:00:01.000 --> 00:00:02.000\n<v Ann>Hello there</v>\n\n2\n00:00:02.000 --> 00:00:03.000\nHello there\n\n00:00:03.000 --> 00:00:04.000\nBye\n";
        let doc = parse_one(&VttParser, vtt, "talk.vtt");
        assert_eq!(doc.text, "Hello there\nBye");
    }

    #[test]
    fn properties_entries_and_continuations() {
        let props = "# comment\nsupport.email = help@example.com\nsupport.hours: 9-5 \\\n  weekdays\n\n! other\nflag\n";
        let doc = parse_one(&PropertiesParser, props, "app.properties");
        assert_eq!(
            doc.text,
            "support.email: help@example.com\nsupport.hours: 9-5 weekdays\nflag"
        );
    }
}
