//! Ingest of binary document formats through the CLI: Office files, corrupt
//! files that must be skipped, and the per-file size limit.

use serde_json::Value;
use std::fs;
use std::io::Write;
use std::path::Path;
use std::process::Command;
use tempfile::TempDir;

fn ragline_binary() -> std::path::PathBuf {
    std::path::PathBuf::from(env!("CARGO_BIN_EXE_ragline"))
}

fn zip_of(entries: &[(&str, &str)]) -> Vec<u8> {
    let mut buf = Vec::new();
    {
        let mut zip = zip::ZipWriter::new(std::io::Cursor::new(&mut buf));
        for (name, body) in entries {
            zip.start_file(*name, zip::write::SimpleFileOptions::default())
                .unwrap();
            zip.write_all(body.as_bytes()).unwrap();
        }
        zip.finish().unwrap();
    }
    buf
}

fn minimal_docx_with_text(phrase: &str) -> Vec<u8> {
    let xml = format!(
        "<?xml version=\"1.0\"?><w:document xmlns:w=\"http://schemas.openxmlformats.org/wordprocessingml/2006/main\"><w:body><w:p><w:r><w:t>{}</w:t></w:r></w:p></w:body></w:document>",
        phrase
    );
    zip_of(&[("word/document.xml", &xml)])
}

fn minimal_xlsx_two_sheets() -> Vec<u8> {
    let sheet = |rows: &str| {
        format!(
            "<worksheet xmlns=\"http://schemas.openxmlformats.org/spreadsheetml/2006/main\"><sheetData>{}</sheetData></worksheet>",
            rows
        )
    };
    let prices = sheet(
        "<row><c t=\"inlineStr\"><is><t>item</t></is></c><c t=\"inlineStr\"><is><t>price</t></is></c></row>\
         <row><c t=\"inlineStr\"><is><t>widget</t></is></c><c><v>9</v></c></row>",
    );
    let notes = sheet("<row><c t=\"inlineStr\"><is><t>note</t></is></c></row><row><c t=\"inlineStr\"><is><t>ships friday</t></is></c></row>");
    zip_of(&[
        ("xl/worksheets/sheet1.xml", &prices),
        ("xl/worksheets/sheet2.xml", &notes),
    ])
}

fn setup_env(max_file_bytes: u64) -> (TempDir, std::path::PathBuf) {
    let tmp = TempDir::new().unwrap();
    fs::create_dir_all(tmp.path().join("files")).unwrap();
    let config_path = tmp.path().join("ragline.toml");
    fs::write(
        &config_path,
        format!(
            "[ingest]\nmax_file_bytes = {}\n\n[[models]]\nid = 1\nname = \"hashing\"\nkind = \"hashing\"\n",
            max_file_bytes
        ),
    )
    .unwrap();
    (tmp, config_path)
}

fn ingest(config_path: &Path, dir: &Path) -> Value {
    let output = Command::new(ragline_binary())
        .arg("--config")
        .arg(config_path)
        .arg("ingest")
        .arg(dir)
        .env("RUST_LOG", "warn")
        .output()
        .unwrap();
    assert!(
        output.status.success(),
        "ingest failed: {}",
        String::from_utf8_lossy(&output.stderr)
    );
    serde_json::from_slice(&output.stdout).unwrap()
}

fn ingested_ids(summary: &Value) -> Vec<String> {
    summary["ingested"]
        .as_array()
        .unwrap()
        .iter()
        .map(|r| r["source_doc_id"].as_str().unwrap().to_string())
        .collect()
}

#[test]
fn docx_is_ingested() {
    let (tmp, config_path) = setup_env(1_000_000);
    let files = tmp.path().join("files");
    fs::write(files.join("notes.docx"), minimal_docx_with_text("office test phrase")).unwrap();

    let summary = ingest(&config_path, &files);
    assert_eq!(ingested_ids(&summary), vec!["notes.docx"]);
    assert_eq!(summary["chunks"], 1);
}

#[test]
fn xlsx_yields_one_document_per_sheet() {
    let (tmp, config_path) = setup_env(1_000_000);
    let files = tmp.path().join("files");
    fs::write(files.join("book.xlsx"), minimal_xlsx_two_sheets()).unwrap();

    let summary = ingest(&config_path, &files);
    assert_eq!(summary["ingested"][0]["documents"], 2);
}

#[test]
fn corrupt_file_is_skipped() {
    let (tmp, config_path) = setup_env(1_000_000);
    let files = tmp.path().join("files");
    fs::write(files.join("bad.pdf"), b"not a valid pdf").unwrap();
    fs::write(files.join("good.md"), "# Good\n\nThis is good.\n").unwrap();

    let summary = ingest(&config_path, &files);
    assert_eq!(ingested_ids(&summary), vec!["good.md"]);
    let skipped = summary["skipped"].as_array().unwrap();
    assert_eq!(skipped.len(), 1);
    assert_eq!(skipped[0]["path"], "bad.pdf");
    assert!(skipped[0]["reason"].as_str().unwrap().contains("extract"));
}

#[test]
fn oversized_file_is_skipped() {
    let (tmp, config_path) = setup_env(1000);
    let files = tmp.path().join("files");
    fs::write(files.join("big.txt"), "word ".repeat(400)).unwrap();
    fs::write(files.join("small.md"), "# Small\n\nOk.\n").unwrap();

    let summary = ingest(&config_path, &files);
    assert_eq!(ingested_ids(&summary), vec!["small.md"]);
    assert!(summary["skipped"][0]["reason"]
        .as_str()
        .unwrap()
        .contains("byte limit"));
}
