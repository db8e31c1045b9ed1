//! Plain-text extraction for binary document formats.

use crate::core::error::{Error, Result};
use quick_xml::events::Event;
use quick_xml::Reader;
use std::io::{Cursor, Read};
use zip::ZipArchive;

/// Largest decompressed XML part read from an Office archive
const MAX_PART_BYTES: u64 = 50 * 1024 * 1024;

type Archive<'a> = ZipArchive<Cursor<&'a [u8]>>;

/// Text of a PDF, all pages in order.
pub fn pdf_text(bytes: &[u8]) -> Result<String> {
    pdf_extract::extract_text_from_mem(bytes).map_err(|e| Error::Extraction(format!("PDF: {}", e)))
}

/// Text of a Word document, one line per paragraph.
pub fn docx_text(bytes: &[u8]) -> Result<String> {
    let mut archive = open_archive(bytes)?;
    let xml = read_part(&mut archive, "word/document.xml")?;
    xml_text(&xml)
}

/// Text of every slide that has any, in slide order.
pub fn pptx_slides(bytes: &[u8]) -> Result<Vec<String>> {
    let mut archive = open_archive(bytes)?;
    let mut names: Vec<(u32, String)> = archive
        .file_names()
        .filter_map(|name| {
            let number = name
                .strip_prefix("ppt/slides/slide")?
                .strip_suffix(".xml")?
                .parse::<u32>()
                .ok()?;
            Some((number, name.to_string()))
        })
        .collect();
    names.sort();

    let mut slides = Vec::new();
    for (_, name) in names {
        let text = xml_text(&read_part(&mut archive, &name)?)?;
        if !text.is_empty() {
            slides.push(text);
        }
    }
    Ok(slides)
}

fn open_archive(bytes: &[u8]) -> Result<Archive<'_>> {
    ZipArchive::new(Cursor::new(bytes)).map_err(|e| Error::Extraction(format!("archive: {}", e)))
}

fn read_part(archive: &mut Archive<'_>, name: &str) -> Result<Vec<u8>> {
    let part = archive
        .by_name(name)
        .map_err(|e| Error::Extraction(format!("{}: {}", name, e)))?;
    let mut out = Vec::new();
    part.take(MAX_PART_BYTES).read_to_end(&mut out)?;
    if out.len() as u64 >= MAX_PART_BYTES {
        return Err(Error::Extraction(format!(
            "{} exceeds {} bytes",
            name, MAX_PART_BYTES
        )));
    }
    Ok(out)
}

/// Collect `<t>` runs, ending each `<p>` paragraph with a newline.
///
/// WordprocessingML and DrawingML share these local names.
fn xml_text(xml: &[u8]) -> Result<String> {
    let mut reader = Reader::from_reader(xml);
    let mut buf = Vec::new();
    let mut out = String::new();
    let mut in_run = false;

    loop {
        match reader.read_event_into(&mut buf) {
            Ok(Event::Start(e)) if e.local_name().as_ref() == b"t" => in_run = true,
            Ok(Event::End(e)) => match e.local_name().as_ref() {
                b"t" => in_run = false,
                b"p" => out.push('\n'),
                _ => {}
            },
            Ok(Event::Empty(e)) => match e.local_name().as_ref() {
                b"tab" => out.push('\t'),
                b"br" => out.push('\n'),
                _ => {}
            },
            Ok(Event::Text(text)) if in_run => {
                let text = text
                    .unescape()
                    .map_err(|e| Error::Extraction(format!("XML: {}", e)))?;
                out.push_str(&text);
            }
            Ok(Event::Eof) => break,
            Err(e) => return Err(Error::Extraction(format!("XML: {}", e))),
            _ => {}
        }
        buf.clear();
    }

    Ok(out.trim().to_string())
}
