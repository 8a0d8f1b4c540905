//! Text extraction for ingested documents (DOCX, PDF, JSON Q&A, plain text).
//!
//! Connectors supply bytes plus a content type; this module returns plain
//! UTF-8 text and, for DOCX, positioned references to embedded images so
//! they can be mirrored to the image bucket and attached to the chunks
//! that cite them.

use std::io::Read;

pub const MIME_PDF: &str = "application/pdf";
pub const MIME_DOCX: &str =
    "application/vnd.openxmlformats-officedocument.wordprocessingml.document";
pub const MIME_JSON: &str = "application/json";
pub const MIME_TEXT: &str = "text/plain";
pub const MIME_MARKDOWN: &str = "text/markdown";

/// Maximum decompressed bytes to read from a single ZIP entry (zip-bomb protection).
const MAX_XML_ENTRY_BYTES: u64 = 50 * 1024 * 1024;

/// Extraction never panics; errors bubble up and the pipeline marks the
/// document failed without stopping the batch.
#[derive(Debug)]
pub enum ExtractError {
    UnsupportedContentType(String),
    Pdf(String),
    Ooxml(String),
    Json(String),
    Encoding(String),
}

impl std::fmt::Display for ExtractError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ExtractError::UnsupportedContentType(ct) => {
                write!(f, "unsupported content-type: {}", ct)
            }
            ExtractError::Pdf(e) => write!(f, "PDF extraction failed: {}", e),
            ExtractError::Ooxml(e) => write!(f, "OOXML extraction failed: {}", e),
            ExtractError::Json(e) => write!(f, "JSON extraction failed: {}", e),
            ExtractError::Encoding(e) => write!(f, "text decoding failed: {}", e),
        }
    }
}

impl std::error::Error for ExtractError {}

/// A reference to an embedded image at a position in the extracted text.
/// `char_offset` is where the containing paragraph places the image, so
/// the chunker can attach it to the chunk that covers that span.
#[derive(Debug, Clone, PartialEq)]
pub struct ImageRef {
    /// File name inside the archive's media part, e.g. `image1.png`.
    pub name: String,
    pub char_offset: usize,
}

/// Result of extracting a document: its text plus any embedded image
/// references.
#[derive(Debug, Default)]
pub struct Extracted {
    pub text: String,
    pub images: Vec<ImageRef>,
}

/// Extract plain text (and embedded image names where the format carries
/// them) from binary content.
pub fn extract(bytes: &[u8], content_type: &str) -> Result<Extracted, ExtractError> {
    match content_type {
        MIME_DOCX => extract_docx(bytes),
        MIME_PDF => Ok(Extracted {
            text: extract_pdf(bytes)?,
            images: Vec::new(),
        }),
        MIME_JSON => Ok(Extracted {
            text: extract_qa_json(bytes)?,
            images: Vec::new(),
        }),
        MIME_TEXT | MIME_MARKDOWN => {
            let text = std::str::from_utf8(bytes)
                .map_err(|e| ExtractError::Encoding(e.to_string()))?;
            Ok(Extracted {
                text: text.to_string(),
                images: Vec::new(),
            })
        }
        _ => Err(ExtractError::UnsupportedContentType(
            content_type.to_string(),
        )),
    }
}

/// Guess the MIME type from a file name. Unknown extensions fall back to
/// plain text so the pipeline still tries to ingest them.
pub fn content_type_for(file_name: &str) -> &'static str {
    let lower = file_name.to_lowercase();
    if lower.ends_with(".docx") {
        MIME_DOCX
    } else if lower.ends_with(".pdf") {
        MIME_PDF
    } else if lower.ends_with(".json") {
        MIME_JSON
    } else if lower.ends_with(".md") {
        MIME_MARKDOWN
    } else {
        MIME_TEXT
    }
}

fn extract_pdf(bytes: &[u8]) -> Result<String, ExtractError> {
    pdf_extract::extract_text_from_mem(bytes).map_err(|e| ExtractError::Pdf(e.to_string()))
}

fn extract_docx(bytes: &[u8]) -> Result<Extracted, ExtractError> {
    let mut archive = zip::ZipArchive::new(std::io::Cursor::new(bytes))
        .map_err(|e| ExtractError::Ooxml(e.to_string()))?;

    let media_files: Vec<String> = archive
        .file_names()
        .filter(|n| n.starts_with("word/media/"))
        .map(|n| n.trim_start_matches("word/media/").to_string())
        .collect();

    let rels = match read_zip_entry(&mut archive, "word/_rels/document.xml.rels") {
        Ok(xml) => parse_image_rels(&xml)?,
        // Older or stripped archives may have no rels part.
        Err(_) => std::collections::HashMap::new(),
    };

    let doc_xml = read_zip_entry(&mut archive, "word/document.xml")
        .map_err(|_| ExtractError::Ooxml("word/document.xml not found".to_string()))?;

    let (text, mut images) = extract_docx_paragraphs(&doc_xml, &rels)?;

    // Media files without a resolvable inline reference still surface,
    // anchored at the start of the document.
    for name in media_files {
        if !images.iter().any(|r| r.name == name) {
            images.push(ImageRef {
                name,
                char_offset: 0,
            });
        }
    }

    Ok(Extracted { text, images })
}

fn read_zip_entry(
    archive: &mut zip::ZipArchive<std::io::Cursor<&[u8]>>,
    name: &str,
) -> Result<Vec<u8>, ExtractError> {
    let entry = archive
        .by_name(name)
        .map_err(|e| ExtractError::Ooxml(e.to_string()))?;
    let mut data = Vec::new();
    entry
        .take(MAX_XML_ENTRY_BYTES)
        .read_to_end(&mut data)
        .map_err(|e| ExtractError::Ooxml(e.to_string()))?;
    if data.len() as u64 >= MAX_XML_ENTRY_BYTES {
        return Err(ExtractError::Ooxml(format!("{} exceeds size limit", name)));
    }
    Ok(data)
}

/// Map relationship IDs to media file names from the document's rels part,
/// e.g. `rId4` to `image1.png`.
fn parse_image_rels(
    xml: &[u8],
) -> Result<std::collections::HashMap<String, String>, ExtractError> {
    let mut rels = std::collections::HashMap::new();
    let mut reader = quick_xml::Reader::from_reader(xml);
    let mut buf = Vec::new();
    loop {
        match reader.read_event_into(&mut buf) {
            Ok(quick_xml::events::Event::Start(e))
            | Ok(quick_xml::events::Event::Empty(e)) => {
                if e.local_name().as_ref() == b"Relationship" {
                    let mut id = None;
                    let mut target = None;
                    for attr in e.attributes().flatten() {
                        match attr.key.as_ref() {
                            b"Id" => id = Some(attr.unescape_value().unwrap_or_default().to_string()),
                            b"Target" => {
                                target = Some(attr.unescape_value().unwrap_or_default().to_string())
                            }
                            _ => {}
                        }
                    }
                    if let (Some(id), Some(target)) = (id, target) {
                        if let Some((_, name)) = target.rsplit_once("media/") {
                            rels.insert(id, name.to_string());
                        }
                    }
                }
            }
            Ok(quick_xml::events::Event::Eof) => break,
            Err(e) => return Err(ExtractError::Ooxml(e.to_string())),
            _ => {}
        }
        buf.clear();
    }
    Ok(rels)
}

/// Read the embedded image files of a DOCX so they can be mirrored to the
/// image bucket. Returns `(name, bytes)` pairs.
pub fn docx_image_files(bytes: &[u8]) -> Result<Vec<(String, Vec<u8>)>, ExtractError> {
    let mut archive = zip::ZipArchive::new(std::io::Cursor::new(bytes))
        .map_err(|e| ExtractError::Ooxml(e.to_string()))?;

    let names: Vec<String> = archive
        .file_names()
        .filter(|n| n.starts_with("word/media/"))
        .map(|n| n.to_string())
        .collect();

    let mut files = Vec::with_capacity(names.len());
    for name in names {
        let entry = archive
            .by_name(&name)
            .map_err(|e| ExtractError::Ooxml(e.to_string()))?;
        let mut data = Vec::new();
        entry
            .take(MAX_XML_ENTRY_BYTES)
            .read_to_end(&mut data)
            .map_err(|e| ExtractError::Ooxml(e.to_string()))?;
        files.push((name.trim_start_matches("word/media/").to_string(), data));
    }
    Ok(files)
}

/// Walk the document XML collecting `w:t` runs. Paragraph ends and explicit
/// breaks become newlines so the chunker can find natural breakpoints.
/// Inline images (`a:blip r:embed` in DrawingML, `v:imagedata r:id` in
/// legacy VML) are resolved through `rels` and recorded at the char offset
/// where they appear.
fn extract_docx_paragraphs(
    xml: &[u8],
    rels: &std::collections::HashMap<String, String>,
) -> Result<(String, Vec<ImageRef>), ExtractError> {
    let mut out = String::new();
    let mut chars = 0usize;
    let mut images = Vec::new();
    let mut reader = quick_xml::Reader::from_reader(xml);
    reader.config_mut().trim_text(false);
    let mut buf = Vec::new();
    let mut in_t = false;
    loop {
        match reader.read_event_into(&mut buf) {
            Ok(quick_xml::events::Event::Start(e)) => {
                if e.local_name().as_ref() == b"t" {
                    in_t = true;
                } else {
                    record_image_ref(&e, rels, chars, &mut images);
                }
            }
            Ok(quick_xml::events::Event::Empty(e)) => match e.local_name().as_ref() {
                b"br" => {
                    out.push('\n');
                    chars += 1;
                }
                b"tab" => {
                    out.push(' ');
                    chars += 1;
                }
                _ => record_image_ref(&e, rels, chars, &mut images),
            },
            Ok(quick_xml::events::Event::Text(te)) if in_t => {
                let text = te.unescape().unwrap_or_default();
                out.push_str(text.as_ref());
                chars += text.chars().count();
            }
            Ok(quick_xml::events::Event::End(e)) => {
                let name = e.local_name();
                if name.as_ref() == b"t" {
                    in_t = false;
                } else if name.as_ref() == b"p" {
                    out.push('\n');
                    chars += 1;
                }
            }
            Ok(quick_xml::events::Event::Eof) => break,
            Err(e) => return Err(ExtractError::Ooxml(e.to_string())),
            _ => {}
        }
        buf.clear();
    }

    let text = out.trim_end().to_string();
    let len = text.chars().count();
    for image in &mut images {
        image.char_offset = image.char_offset.min(len.saturating_sub(1));
    }
    Ok((text, images))
}

/// Record an inline image reference: `a:blip r:embed` in DrawingML,
/// `v:imagedata r:id` in legacy VML.
fn record_image_ref(
    e: &quick_xml::events::BytesStart<'_>,
    rels: &std::collections::HashMap<String, String>,
    chars: usize,
    images: &mut Vec<ImageRef>,
) {
    let rid_attr: &[u8] = match e.local_name().as_ref() {
        b"blip" => b"embed",
        b"imagedata" => b"id",
        _ => return,
    };
    for attr in e.attributes().flatten() {
        if attr.key.local_name().as_ref() == rid_attr {
            let rid = attr.unescape_value().unwrap_or_default().to_string();
            if let Some(media_name) = rels.get(&rid) {
                images.push(ImageRef {
                    name: media_name.clone(),
                    char_offset: chars,
                });
            }
        }
    }
}

/// Flatten a JSON array of question/answer records into prompt-friendly
/// text. Each record becomes its own paragraph.
fn extract_qa_json(bytes: &[u8]) -> Result<String, ExtractError> {
    let value: serde_json::Value =
        serde_json::from_slice(bytes).map_err(|e| ExtractError::Json(e.to_string()))?;
    let items = value
        .as_array()
        .ok_or_else(|| ExtractError::Json("expected a top-level array".to_string()))?;

    let mut out = String::new();
    for item in items {
        let question = item.get("question").and_then(|v| v.as_str());
        let answer = item.get("answer").and_then(|v| v.as_str());
        if let (Some(q), Some(a)) = (question, answer) {
            if !out.is_empty() {
                out.push_str("\n\n");
            }
            out.push_str(&format!("Câu hỏi: {}\nTrả lời: {}", q, a));
        }
    }
    if out.is_empty() {
        return Err(ExtractError::Json(
            "no question/answer records found".to_string(),
        ));
    }
    Ok(out)
}
