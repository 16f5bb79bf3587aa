//! Parsers for binary and markup formats: PDF, DOCX, XLSX and HTML.
//!
//! Each parser implements [`DocumentParser`] and is registered next to the
//! core text parsers by [`parser_registry`]. Parsers never panic on bad
//! input; they return [`Error::Parse`] and the ingest driver skips the file.

use std::io::Read;

use quick_xml::events::Event;
use ragline_core::models::{Metadata, RawDocument};
use ragline_core::parser::text::text_document;
use ragline_core::parser::{decode_utf8, DocumentParser, ParserRegistry};
use ragline_core::{Error, Result};
use scraper::node::Node;
use scraper::{ElementRef, Html, Selector};
use serde_json::json;
use std::sync::Arc;

/// Maximum sheets to process in an xlsx.
const XLSX_MAX_SHEETS: usize = 100;
/// Maximum cells to process per sheet (avoids unbounded memory).
const XLSX_MAX_CELLS_PER_SHEET: usize = 100_000;
/// Maximum decompressed bytes to read from a single ZIP entry (zip-bomb protection).
const MAX_XML_ENTRY_BYTES: u64 = 50 * 1024 * 1024;

type Archive<'a> = zip::ZipArchive<std::io::Cursor<&'a [u8]>>;

/// Core text parsers plus the parsers in this module.
pub fn parser_registry() -> ParserRegistry {
    let mut registry = ParserRegistry::with_text_parsers();
    registry.register(Arc::new(PdfParser));
    registry.register(Arc::new(DocxParser));
    registry.register(Arc::new(XlsxParser));
    registry.register(Arc::new(HtmlParser));
    registry
}

fn parse_error(file_name: &str, reason: impl std::fmt::Display) -> Error {
    Error::Parse {
        file_name: file_name.to_string(),
        reason: reason.to_string(),
    }
}

// ============ PDF ============

pub struct PdfParser;

impl DocumentParser for PdfParser {
    fn supported_types(&self) -> &[&'static str] {
        &["pdf"]
    }

    fn parse(&self, resource: &[u8], file_name: &str, extend_params: &Metadata) -> Result<Vec<RawDocument>> {
        let text = pdf_extract::extract_text_from_mem(resource)
            .map_err(|e| parse_error(file_name, format!("PDF extraction failed: {}", e)))?;
        Ok(text_document(file_name, "pdf", text, extend_params))
    }
}

// ============ OOXML helpers ============

fn open_archive<'a>(resource: &'a [u8], file_name: &str) -> Result<Archive<'a>> {
    zip::ZipArchive::new(std::io::Cursor::new(resource)).map_err(|e| parse_error(file_name, e))
}

fn read_zip_entry_bounded(archive: &mut Archive<'_>, name: &str, file_name: &str) -> Result<Vec<u8>> {
    let entry = archive.by_name(name).map_err(|e| parse_error(file_name, e))?;
    let mut out = Vec::new();
    entry
        .take(MAX_XML_ENTRY_BYTES)
        .read_to_end(&mut out)
        .map_err(|e| parse_error(file_name, e))?;
    if out.len() as u64 >= MAX_XML_ENTRY_BYTES {
        return Err(parse_error(
            file_name,
            format!("ZIP entry {} exceeds size limit ({} bytes)", name, MAX_XML_ENTRY_BYTES),
        ));
    }
    Ok(out)
}

fn attribute(e: &quick_xml::events::BytesStart<'_>, key: &[u8]) -> Option<String> {
    e.attributes()
        .flatten()
        .find(|a| a.key.local_name().as_ref() == key)
        .and_then(|a| a.unescape_value().ok().map(|v| v.into_owned()))
}

// ============ DOCX ============

/// One line per `w:p` paragraph.
pub struct DocxParser;

impl DocumentParser for DocxParser {
    fn supported_types(&self) -> &[&'static str] {
        &["docx"]
    }

    fn parse(&self, resource: &[u8], file_name: &str, extend_params: &Metadata) -> Result<Vec<RawDocument>> {
        let mut archive = open_archive(resource, file_name)?;
        let xml = read_zip_entry_bounded(&mut archive, "word/document.xml", file_name)?;
        let text = docx_paragraphs(&xml).map_err(|e| parse_error(file_name, e))?;
        Ok(text_document(file_name, "docx", text, extend_params))
    }
}

fn docx_paragraphs(xml: &[u8]) -> std::result::Result<String, quick_xml::Error> {
    let mut paragraphs = Vec::new();
    let mut current = String::new();
    let mut in_text = false;
    let mut reader = quick_xml::Reader::from_reader(xml);
    let mut buf = Vec::new();
    loop {
        match reader.read_event_into(&mut buf)? {
            Event::Start(e) if e.local_name().as_ref() == b"t" => in_text = true,
            Event::End(e) if e.local_name().as_ref() == b"t" => in_text = false,
            Event::Empty(e) if e.local_name().as_ref() == b"tab" => current.push('\t'),
            Event::Empty(e) if e.local_name().as_ref() == b"br" => current.push('\n'),
            Event::Text(te) if in_text => current.push_str(&te.unescape()?),
            Event::End(e) if e.local_name().as_ref() == b"p" => {
                let line = current.trim();
                if !line.is_empty() {
                    paragraphs.push(line.to_string());
                }
                current.clear();
            }
            Event::Eof => break,
            _ => {}
        }
        buf.clear();
    }
    if !current.trim().is_empty() {
        paragraphs.push(current.trim().to_string());
    }
    Ok(paragraphs.join("\n"))
}

// ============ XLSX ============

/// One raw document per worksheet. The first row is the header; each
/// further row becomes a `header: value; ...` line.
pub struct XlsxParser;

impl DocumentParser for XlsxParser {
    fn supported_types(&self) -> &[&'static str] {
        &["xlsx"]
    }

    fn parse(&self, resource: &[u8], file_name: &str, extend_params: &Metadata) -> Result<Vec<RawDocument>> {
        let mut archive = open_archive(resource, file_name)?;
        let has_shared = archive.file_names().any(|n| n == "xl/sharedStrings.xml");
        let shared = if has_shared {
            let xml = read_zip_entry_bounded(&mut archive, "xl/sharedStrings.xml", file_name)?;
            shared_strings(&xml).map_err(|e| parse_error(file_name, e))?
        } else {
            Vec::new()
        };

        let mut docs = Vec::new();
        for (idx, (sheet_name, path)) in worksheets(&mut archive, file_name)
            .into_iter()
            .take(XLSX_MAX_SHEETS)
            .enumerate()
        {
            let xml = read_zip_entry_bounded(&mut archive, &path, file_name)?;
            let rows = sheet_rows(&xml, &shared).map_err(|e| parse_error(file_name, e))?;
            let text = rows_to_lines(&rows).join("\n");
            for mut doc in text_document(file_name, "xlsx", text, extend_params) {
                doc.metadata.insert("sheet".into(), json!(sheet_name));
                doc.metadata.insert("sheet_index".into(), json!(idx));
                docs.push(doc);
            }
        }
        Ok(docs)
    }
}

/// `(sheet name, zip path)` in workbook order. Falls back to the
/// `xl/worksheets/sheetN.xml` entries when the workbook cannot be mapped.
fn worksheets(archive: &mut Archive<'_>, file_name: &str) -> Vec<(String, String)> {
    if let Some(sheets) = mapped_worksheets(archive, file_name).filter(|s| !s.is_empty()) {
        return sheets;
    }

    let mut names: Vec<String> = archive
        .file_names()
        .filter(|n| n.starts_with("xl/worksheets/sheet") && n.ends_with(".xml"))
        .map(|s| s.to_string())
        .collect();
    names.sort_by_key(|name| {
        name.trim_start_matches("xl/worksheets/sheet")
            .trim_end_matches(".xml")
            .parse::<u32>()
            .unwrap_or(u32::MAX)
    });
    names
        .into_iter()
        .enumerate()
        .map(|(i, path)| (format!("Sheet{}", i + 1), path))
        .collect()
}

fn mapped_worksheets(archive: &mut Archive<'_>, file_name: &str) -> Option<Vec<(String, String)>> {
    let workbook = read_zip_entry_bounded(archive, "xl/workbook.xml", file_name).ok()?;
    let rels = read_zip_entry_bounded(archive, "xl/_rels/workbook.xml.rels", file_name).ok()?;
    let targets = relationship_targets(&rels).ok()?;
    workbook_sheets(&workbook)
        .ok()?
        .into_iter()
        .map(|(name, rid)| {
            let target = targets.get(&rid)?.trim_start_matches('/');
            let path = if target.starts_with("xl/") {
                target.to_string()
            } else {
                format!("xl/{}", target)
            };
            Some((name, path))
        })
        .collect()
}

fn relationship_targets(
    xml: &[u8],
) -> std::result::Result<std::collections::HashMap<String, String>, quick_xml::Error> {
    let mut out = std::collections::HashMap::new();
    let mut reader = quick_xml::Reader::from_reader(xml);
    let mut buf = Vec::new();
    loop {
        match reader.read_event_into(&mut buf)? {
            Event::Start(e) | Event::Empty(e) if e.local_name().as_ref() == b"Relationship" => {
                if let (Some(id), Some(target)) = (attribute(&e, b"Id"), attribute(&e, b"Target")) {
                    out.insert(id, target);
                }
            }
            Event::Eof => break,
            _ => {}
        }
        buf.clear();
    }
    Ok(out)
}

fn workbook_sheets(xml: &[u8]) -> std::result::Result<Vec<(String, String)>, quick_xml::Error> {
    let mut out = Vec::new();
    let mut reader = quick_xml::Reader::from_reader(xml);
    let mut buf = Vec::new();
    loop {
        match reader.read_event_into(&mut buf)? {
            Event::Start(e) | Event::Empty(e) if e.local_name().as_ref() == b"sheet" => {
                if let (Some(name), Some(rid)) = (attribute(&e, b"name"), attribute(&e, b"id")) {
                    out.push((name, rid));
                }
            }
            Event::Eof => break,
            _ => {}
        }
        buf.clear();
    }
    Ok(out)
}

fn shared_strings(xml: &[u8]) -> std::result::Result<Vec<String>, quick_xml::Error> {
    let mut strings = Vec::new();
    let mut current = String::new();
    let mut in_si = false;
    let mut in_t = false;
    let mut reader = quick_xml::Reader::from_reader(xml);
    let mut buf = Vec::new();
    loop {
        match reader.read_event_into(&mut buf)? {
            Event::Start(e) if e.local_name().as_ref() == b"si" => {
                in_si = true;
                current.clear();
            }
            Event::Start(e) if in_si && e.local_name().as_ref() == b"t" => in_t = true,
            Event::End(e) if e.local_name().as_ref() == b"t" => in_t = false,
            Event::Text(te) if in_t => current.push_str(&te.unescape()?),
            Event::End(e) if e.local_name().as_ref() == b"si" => {
                in_si = false;
                strings.push(std::mem::take(&mut current));
            }
            Event::Eof => break,
            _ => {}
        }
        buf.clear();
    }
    Ok(strings)
}

/// Zero-based column of a cell reference such as `B2` or `AA10`.
fn column_index(reference: &str) -> Option<usize> {
    let letters: Vec<u8> = reference
        .bytes()
        .take_while(u8::is_ascii_alphabetic)
        .map(|b| b.to_ascii_uppercase())
        .collect();
    if letters.is_empty() || letters.len() > 3 {
        return None;
    }
    let col = letters
        .iter()
        .fold(0usize, |acc, b| acc * 26 + (b - b'A' + 1) as usize);
    Some(col - 1)
}

/// Pad `row` with empty cells up to the column named by the cell's `r`
/// attribute. Excel omits empty cells, so position alone is not enough.
fn pad_to_reference(row: &mut Vec<String>, e: &quick_xml::events::BytesStart<'_>) {
    if let Some(col) = attribute(e, b"r").as_deref().and_then(column_index) {
        if col > row.len() {
            row.resize(col, String::new());
        }
    }
}

/// Cell values per row, placed by their column reference when present.
fn sheet_rows(xml: &[u8], shared: &[String]) -> std::result::Result<Vec<Vec<String>>, quick_xml::Error> {
    let mut rows: Vec<Vec<String>> = Vec::new();
    let mut row: Vec<String> = Vec::new();
    let mut cell_type: Option<String> = None;
    let mut value = String::new();
    let mut in_value = false;
    let mut cells = 0usize;
    let mut reader = quick_xml::Reader::from_reader(xml);
    let mut buf = Vec::new();
    loop {
        if cells >= XLSX_MAX_CELLS_PER_SHEET {
            break;
        }
        match reader.read_event_into(&mut buf)? {
            Event::Start(e) if e.local_name().as_ref() == b"row" => row.clear(),
            Event::End(e) if e.local_name().as_ref() == b"row" => {
                rows.push(std::mem::take(&mut row));
            }
            Event::Start(e) if e.local_name().as_ref() == b"c" => {
                pad_to_reference(&mut row, &e);
                cell_type = attribute(&e, b"t");
                value.clear();
            }
            Event::Empty(e) if e.local_name().as_ref() == b"c" => {
                pad_to_reference(&mut row, &e);
                row.push(String::new());
                cells += 1;
            }
            Event::Start(e) if matches!(e.local_name().as_ref(), b"v" | b"t") => in_value = true,
            Event::End(e) if matches!(e.local_name().as_ref(), b"v" | b"t") => in_value = false,
            Event::Text(te) if in_value => value.push_str(&te.unescape()?),
            Event::End(e) if e.local_name().as_ref() == b"c" => {
                let resolved = match cell_type.as_deref() {
                    Some("s") => value
                        .trim()
                        .parse::<usize>()
                        .ok()
                        .and_then(|i| shared.get(i).cloned())
                        .unwrap_or_default(),
                    Some("b") => (if value.trim() == "1" { "TRUE" } else { "FALSE" }).to_string(),
                    _ => value.trim().to_string(),
                };
                row.push(resolved);
                cells += 1;
            }
            Event::Eof => break,
            _ => {}
        }
        buf.clear();
    }
    if !row.is_empty() {
        rows.push(row);
    }
    Ok(rows)
}

fn rows_to_lines(rows: &[Vec<String>]) -> Vec<String> {
    let Some((header, body)) = rows.split_first() else {
        return Vec::new();
    };
    if body.is_empty() {
        let line = header.iter().filter(|v| !v.is_empty()).cloned().collect::<Vec<_>>();
        return if line.is_empty() { Vec::new() } else { vec![line.join("; ")] };
    }
    body.iter()
        .filter_map(|row| {
            let fields: Vec<String> = row
                .iter()
                .enumerate()
                .filter(|(_, v)| !v.trim().is_empty())
                .map(|(i, v)| match header.get(i).filter(|h| !h.trim().is_empty()) {
                    Some(h) => format!("{}: {}", h.trim(), v.trim()),
                    None => v.trim().to_string(),
                })
                .collect();
            (!fields.is_empty()).then(|| fields.join("; "))
        })
        .collect()
}

// ============ HTML ============

/// Visible text of the body, one line per text block; `<title>` goes to
/// `metadata["title"]`.
pub struct HtmlParser;

const SKIPPED_ELEMENTS: &[&str] = &["script", "style", "noscript", "iframe", "svg", "head", "template"];

impl DocumentParser for HtmlParser {
    fn supported_types(&self) -> &[&'static str] {
        &["html", "htm"]
    }

    fn parse(&self, resource: &[u8], file_name: &str, extend_params: &Metadata) -> Result<Vec<RawDocument>> {
        let content = decode_utf8(resource, file_name)?;
        let document = Html::parse_document(&content);

        let title_selector =
            Selector::parse("title").map_err(|e| parse_error(file_name, format!("{:?}", e)))?;
        let title = document
            .select(&title_selector)
            .next()
            .map(|t| t.text().collect::<String>().trim().to_string())
            .filter(|t| !t.is_empty());

        let mut parts = Vec::new();
        collect_text(document.root_element(), &mut parts);
        let text = parts.join("\n");

        let mut docs = text_document(file_name, "html", text, extend_params);
        if let (Some(doc), Some(title)) = (docs.first_mut(), title) {
            doc.metadata.insert("title".into(), json!(title));
        }
        Ok(docs)
    }
}

fn collect_text(element: ElementRef<'_>, parts: &mut Vec<String>) {
    if SKIPPED_ELEMENTS.contains(&element.value().name()) {
        return;
    }
    for child in element.children() {
        match child.value() {
            Node::Text(text) => {
                let collapsed = text.split_whitespace().collect::<Vec<_>>().join(" ");
                if !collapsed.is_empty() {
                    parts.push(collapsed);
                }
            }
            Node::Element(_) => {
                if let Some(child) = ElementRef::wrap(child) {
                    collect_text(child, parts);
                }
            }
            _ => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn zip_of(entries: &[(&str, &str)]) -> Vec<u8> {
        let mut buf = std::io::Cursor::new(Vec::new());
        {
            let mut zip = zip::ZipWriter::new(&mut buf);
            let options = zip::write::SimpleFileOptions::default();
            for (name, content) in entries {
                zip.start_file(*name, options).unwrap();
                zip.write_all(content.as_bytes()).unwrap();
            }
            zip.finish().unwrap();
        }
        buf.into_inner()
    }

    #[test]
    fn registry_covers_binary_formats() {
        let registry = parser_registry();
        for t in ["pdf", "docx", "xlsx", "html", "htm", "md", "txt", "csv"] {
            assert!(registry.supports(t), "missing {}", t);
        }
    }

    #[test]
    fn invalid_pdf_is_a_parse_error() {
        let err = PdfParser.parse(b"not a pdf", "a.pdf", &Metadata::new()).unwrap_err();
        assert!(matches!(err, Error::Parse { .. }));
    }

    #[test]
    fn invalid_zip_is_a_parse_error() {
        let err = DocxParser.parse(b"not a zip", "a.docx", &Metadata::new()).unwrap_err();
        assert!(matches!(err, Error::Parse { .. }));
    }

    #[test]
    fn docx_paragraphs_become_lines() {
        let xml = r#"<w:document xmlns:w="w"><w:body>
            <w:p><w:r><w:t>First</w:t></w:r><w:r><w:t xml:space="preserve"> paragraph</w:t></w:r></w:p>
            <w:p></w:p>
            <w:p><w:r><w:t>Second &amp; last</w:t></w:r></w:p>
        </w:body></w:document>"#;
        let bytes = zip_of(&[("word/document.xml", xml)]);
        let docs = DocxParser.parse(&bytes, "a.docx", &Metadata::new()).unwrap();
        assert_eq!(docs[0].text, "First paragraph\nSecond & last");
        assert_eq!(docs[0].metadata["file_type"], "docx");
    }

    #[test]
    fn xlsx_yields_one_document_per_sheet() {
        let workbook = r#"<workbook xmlns:r="r"><sheets>
            <sheet name="Prices" sheetId="1" r:id="rId1"/>
            <sheet name="Empty" sheetId="2" r:id="rId2"/>
            <sheet name="Notes" sheetId="3" r:id="rId3"/>
        </sheets></workbook>"#;
        let rels = r#"<Relationships>
            <Relationship Id="rId1" Target="worksheets/sheet1.xml"/>
            <Relationship Id="rId2" Target="worksheets/sheet2.xml"/>
            <Relationship Id="rId3" Target="/xl/worksheets/sheet3.xml"/>
        </Relationships>"#;
        let shared = r#"<sst><si><t>item</t></si><si><t>price</t></si><si><t>apple</t></si></sst>"#;
        let sheet1 = r#"<worksheet><sheetData>
            <row><c t="s"><v>0</v></c><c t="s"><v>1</v></c></row>
            <row><c t="s"><v>2</v></c><c><v>1.5</v></c></row>
        </sheetData></worksheet>"#;
        let sheet2 = r#"<worksheet><sheetData/></worksheet>"#;
        let sheet3 = r#"<worksheet><sheetData>
            <row><c t="inlineStr"><is><t>remember</t></is></c></row>
        </sheetData></worksheet>"#;
        let bytes = zip_of(&[
            ("xl/workbook.xml", workbook),
            ("xl/_rels/workbook.xml.rels", rels),
            ("xl/sharedStrings.xml", shared),
            ("xl/worksheets/sheet1.xml", sheet1),
            ("xl/worksheets/sheet2.xml", sheet2),
            ("xl/worksheets/sheet3.xml", sheet3),
        ]);
        let docs = XlsxParser.parse(&bytes, "book.xlsx", &Metadata::new()).unwrap();
        assert_eq!(docs.len(), 2);
        assert_eq!(docs[0].text, "item: apple; price: 1.5");
        assert_eq!(docs[0].metadata["sheet"], "Prices");
        assert_eq!(docs[1].text, "remember");
        assert_eq!(docs[1].metadata["sheet"], "Notes");
        assert_eq!(docs[1].metadata["sheet_index"], 2);
    }

    #[test]
    fn sparse_rows_keep_their_columns() {
        let sheet = r#"<worksheet><sheetData>
            <row r="1"><c r="A1" t="inlineStr"><is><t>Name</t></is></c><c r="B1" t="inlineStr"><is><t>Price</t></is></c></row>
            <row r="2"><c r="B2"><v>5</v></c></row>
        </sheetData></worksheet>"#;
        let rows = sheet_rows(sheet.as_bytes(), &[]).unwrap();
        assert_eq!(rows[1], vec!["", "5"]);
        assert_eq!(rows_to_lines(&rows), vec!["Price: 5"]);
    }

    #[test]
    fn column_references_decode() {
        assert_eq!(column_index("A1"), Some(0));
        assert_eq!(column_index("b7"), Some(1));
        assert_eq!(column_index("AA10"), Some(26));
        assert_eq!(column_index("12"), None);
    }

    #[test]
    fn html_keeps_visible_text_and_title() {
        let html = r#"<html><head><title> Help Center </title><style>p{}</style></head>
            <body><h1>Refunds</h1><p>Issued within   five days.</p><script>var x = 1;</script></body></html>"#;
        let docs = HtmlParser.parse(html.as_bytes(), "help.html", &Metadata::new()).unwrap();
        assert_eq!(docs[0].text, "Refunds\nIssued within five days.");
        assert_eq!(docs[0].metadata["title"], "Help Center");
    }
}
