//! Minimal `.docx` writer.
//!
//! A DOCX file is a ZIP archive of Open XML parts. We only need plain
//! paragraphs, so we write the four parts Word requires and nothing else.

use std::{
    fs::File,
    io::{BufWriter, Write as _},
};

use quick_xml::escape::escape;
use zip::{CompressionMethod, ZipWriter, write::SimpleFileOptions};

use crate::prelude::*;

const CONTENT_TYPES: &str = r#"<?xml version="1.0" encoding="UTF-8" standalone="yes"?>
<Types xmlns="http://schemas.openxmlformats.org/package/2006/content-types"><Default Extension="rels" ContentType="application/vnd.openxmlformats-package.relationships+xml"/><Default Extension="xml" ContentType="application/xml"/><Override PartName="/word/document.xml" ContentType="application/vnd.openxmlformats-officedocument.wordprocessingml.document.main+xml"/></Types>"#;

const PACKAGE_RELS: &str = r#"<?xml version="1.0" encoding="UTF-8" standalone="yes"?>
<Relationships xmlns="http://schemas.openxmlformats.org/package/2006/relationships"><Relationship Id="rId1" Type="http://schemas.openxmlformats.org/officeDocument/2006/relationships/officeDocument" Target="word/document.xml"/></Relationships>"#;

const DOCUMENT_RELS: &str = r#"<?xml version="1.0" encoding="UTF-8" standalone="yes"?>
<Relationships xmlns="http://schemas.openxmlformats.org/package/2006/relationships"></Relationships>"#;

const DOCUMENT_START: &str = r#"<?xml version="1.0" encoding="UTF-8" standalone="yes"?>
<w:document xmlns:w="http://schemas.openxmlformats.org/wordprocessingml/2006/main"><w:body>"#;

const DOCUMENT_END: &str = "<w:sectPr/></w:body></w:document>";

/// Write `text` to `path` as a DOCX document. Blocks of text separated by
/// blank lines become paragraphs, and single newlines become line breaks.
pub fn write_docx(text: &str, path: &Path) -> Result<()> {
    let file = File::create(path)
        .with_context(|| format!("could not create {}", path.display()))?;
    let mut zip = ZipWriter::new(BufWriter::new(file));
    let options =
        SimpleFileOptions::default().compression_method(CompressionMethod::Deflated);

    for (name, contents) in [
        ("[Content_Types].xml", CONTENT_TYPES),
        ("_rels/.rels", PACKAGE_RELS),
        ("word/_rels/document.xml.rels", DOCUMENT_RELS),
    ] {
        zip.start_file(name, options)
            .with_context(|| format!("could not add {name} to docx"))?;
        zip.write_all(contents.as_bytes())?;
    }

    zip.start_file("word/document.xml", options)
        .context("could not add word/document.xml to docx")?;
    zip.write_all(document_xml(text).as_bytes())?;

    let mut writer = zip.finish().context("could not finish docx archive")?;
    writer.flush()?;
    Ok(())
}

/// Build `word/document.xml`.
fn document_xml(text: &str) -> String {
    let mut xml = String::from(DOCUMENT_START);
    for paragraph in paragraphs(text) {
        xml.push_str("<w:p><w:r>");
        for (idx, line) in paragraph.split('\n').enumerate() {
            if idx > 0 {
                xml.push_str("<w:br/>");
            }
            let line = line.trim_end_matches('\r');
            xml.push_str(r#"<w:t xml:space="preserve">"#);
            xml.push_str(&escape(&xml_safe(line)));
            xml.push_str("</w:t>");
        }
        xml.push_str("</w:r></w:p>");
    }
    xml.push_str(DOCUMENT_END);
    xml
}

/// Split on blank lines, dropping empty paragraphs.
fn paragraphs(text: &str) -> impl Iterator<Item = &str> {
    text.split("\n\n").map(str::trim).filter(|p| !p.is_empty())
}

/// Drop characters that aren't allowed anywhere in XML 1.0.
fn xml_safe(text: &str) -> String {
    text.chars()
        .filter(|&c| matches!(c, '\t' | '\n' | '\r') || c >= ' ')
        .filter(|&c| !matches!(c, '\u{FFFE}' | '\u{FFFF}'))
        .collect()
}
