use crate::error::{KbServeError, Result};
use pulldown_cmark::{Event, Parser as CmarkParser};
use quick_xml::events::Event as XmlEvent;
use quick_xml::Reader as XmlReader;

/// Extract plain text from an uploaded document.
///
/// Dispatches on the MIME type recorded at upload time, falling back to
/// the file extension when no Content-Type header was sent. Structured
/// formats that fail to parse degrade to lossy plain text so the file
/// can still be ingested; PDFs have no such fallback.
pub fn extract_text(bytes: &[u8], content_type: Option<&str>, file_name: &str) -> Result<String> {
    match detect_format(content_type, file_name) {
        Format::Pdf => extract_pdf(bytes),
        Format::Markdown => Ok(extract_markdown(&to_utf8(bytes))),
        Format::Json => Ok(extract_json(&to_utf8(bytes))),
        Format::Xml => Ok(extract_xml(&to_utf8(bytes))),
        Format::Yaml => Ok(extract_yaml(&to_utf8(bytes))),
        Format::Plain => Ok(to_utf8(bytes)),
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Format {
    Pdf,
    Markdown,
    Json,
    Xml,
    Yaml,
    Plain,
}

fn detect_format(content_type: Option<&str>, file_name: &str) -> Format {
    // MIME parameters like "; charset=utf-8" are irrelevant here
    let mime = content_type
        .map(|ct| ct.split(';').next().unwrap_or(ct).trim().to_lowercase())
        .unwrap_or_default();

    match mime.as_str() {
        "application/pdf" => return Format::Pdf,
        "text/markdown" => return Format::Markdown,
        "application/json" => return Format::Json,
        "application/xml" | "text/xml" => return Format::Xml,
        "application/x-yaml" | "application/yaml" | "text/yaml" => return Format::Yaml,
        "text/plain" => return Format::Plain,
        _ => {}
    }

    let extension = file_name
        .rsplit('.')
        .next()
        .unwrap_or_default()
        .to_lowercase();
    match extension.as_str() {
        "pdf" => Format::Pdf,
        "md" | "markdown" => Format::Markdown,
        "json" => Format::Json,
        "xml" => Format::Xml,
        "yaml" | "yml" => Format::Yaml,
        _ => Format::Plain,
    }
}

fn to_utf8(bytes: &[u8]) -> String {
    String::from_utf8_lossy(bytes).into_owned()
}

/// PDF page-text extraction. Pages with no readable text are skipped;
/// a document with no readable text at all is a parse failure.
fn extract_pdf(bytes: &[u8]) -> Result<String> {
    let document = lopdf::Document::load_mem(bytes)
        .map_err(|e| KbServeError::Parse(format!("PDF load failed: {}", e)))?;

    let mut pages = Vec::new();
    for (page_no, _page_id) in document.get_pages() {
        match document.extract_text(&[page_no]) {
            Ok(text) if !text.trim().is_empty() => pages.push(text),
            Ok(_) => {}
            Err(e) => {
                log::warn!("Skipping unreadable PDF page {}: {}", page_no, e);
            }
        }
    }

    if pages.is_empty() {
        return Err(KbServeError::Parse(
            "PDF had no readable page text".to_string(),
        ));
    }

    Ok(pages.join("\n"))
}

/// Markdown to plain text: keep text, code and soft structure as
/// whitespace; drop all markup.
fn extract_markdown(content: &str) -> String {
    let mut out = String::new();
    for event in CmarkParser::new(content) {
        match event {
            Event::Text(text) => {
                out.push_str(&text);
                out.push(' ');
            }
            Event::Code(code) => {
                out.push_str(&code);
                out.push(' ');
            }
            Event::SoftBreak | Event::HardBreak => out.push('\n'),
            _ => {}
        }
    }
    out.trim().to_string()
}

/// JSON to plain text: flatten every scalar value (and key) into lines.
fn extract_json(content: &str) -> String {
    match serde_json::from_str::<serde_json::Value>(content) {
        Ok(value) => {
            let mut out = String::new();
            flatten_json(&value, &mut out);
            out.trim().to_string()
        }
        Err(e) => {
            log::warn!("JSON parse failed, ingesting as plain text: {}", e);
            content.to_string()
        }
    }
}

fn flatten_json(value: &serde_json::Value, out: &mut String) {
    match value {
        serde_json::Value::String(s) => {
            out.push_str(s);
            out.push('\n');
        }
        serde_json::Value::Number(n) => {
            out.push_str(&n.to_string());
            out.push('\n');
        }
        serde_json::Value::Bool(b) => {
            out.push_str(if *b { "true" } else { "false" });
            out.push('\n');
        }
        serde_json::Value::Array(items) => {
            for item in items {
                flatten_json(item, out);
            }
        }
        serde_json::Value::Object(map) => {
            for (key, item) in map {
                out.push_str(key);
                out.push(' ');
                flatten_json(item, out);
            }
        }
        serde_json::Value::Null => {}
    }
}

/// XML to plain text: concatenate text and CDATA nodes.
fn extract_xml(content: &str) -> String {
    let mut reader = XmlReader::from_str(content);
    let mut buf = Vec::new();
    let mut out = String::new();

    loop {
        match reader.read_event_into(&mut buf) {
            Ok(XmlEvent::Text(e)) => {
                let text = String::from_utf8_lossy(e.as_ref());
                let trimmed = text.trim();
                if !trimmed.is_empty() {
                    out.push_str(trimmed);
                    out.push('\n');
                }
            }
            Ok(XmlEvent::CData(e)) => {
                let text = String::from_utf8_lossy(e.as_ref());
                let trimmed = text.trim();
                if !trimmed.is_empty() {
                    out.push_str(trimmed);
                    out.push('\n');
                }
            }
            Ok(XmlEvent::Eof) => break,
            Ok(_) => {}
            Err(e) => {
                log::warn!("XML parse failed, ingesting as plain text: {}", e);
                return content.to_string();
            }
        }
        buf.clear();
    }

    out.trim().to_string()
}

/// YAML to plain text: flatten scalars through the JSON flattener
/// (the value models are isomorphic for our purposes).
fn extract_yaml(content: &str) -> String {
    match serde_yaml_ng::from_str::<serde_json::Value>(content) {
        Ok(value) => {
            let mut out = String::new();
            flatten_json(&value, &mut out);
            out.trim().to_string()
        }
        Err(e) => {
            log::warn!("YAML parse failed, ingesting as plain text: {}", e);
            content.to_string()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_plain_text_passthrough() {
        let text = extract_text(b"hello world", Some("text/plain"), "a.txt").unwrap();
        assert_eq!(text, "hello world");
    }

    #[test]
    fn test_markdown_strips_markup() {
        let md = b"# Title\n\nSome **bold** text with `code`.";
        let text = extract_text(md, Some("text/markdown"), "a.md").unwrap();
        assert!(text.contains("Title"));
        assert!(text.contains("bold"));
        assert!(text.contains("code"));
        assert!(!text.contains('#'));
        assert!(!text.contains("**"));
    }

    #[test]
    fn test_json_flattens_values() {
        let json = br#"{"title": "On-premise AI", "tags": ["privacy", "cost"], "pages": 42}"#;
        let text = extract_text(json, Some("application/json"), "a.json").unwrap();
        assert!(text.contains("On-premise AI"));
        assert!(text.contains("privacy"));
        assert!(text.contains("42"));
    }

    #[test]
    fn test_xml_collects_text_nodes() {
        let xml = b"<doc><title>Benefits</title><body>Run AI locally</body></doc>";
        let text = extract_text(xml, Some("application/xml"), "a.xml").unwrap();
        assert!(text.contains("Benefits"));
        assert!(text.contains("Run AI locally"));
        assert!(!text.contains("<title>"));
    }

    #[test]
    fn test_yaml_flattens_scalars() {
        let yaml = b"title: Deployment guide\nsteps:\n  - install\n  - configure\n";
        let text = extract_text(yaml, Some("text/yaml"), "a.yaml").unwrap();
        assert!(text.contains("Deployment guide"));
        assert!(text.contains("install"));
    }

    #[test]
    fn test_extension_fallback_without_content_type() {
        let text = extract_text(b"# Heading", None, "notes.md").unwrap();
        assert_eq!(text, "Heading");
    }

    #[test]
    fn test_mime_parameters_ignored() {
        let text =
            extract_text(b"plain", Some("text/plain; charset=utf-8"), "a.bin").unwrap();
        assert_eq!(text, "plain");
    }

    #[test]
    fn test_invalid_json_degrades_to_plain_text() {
        let text = extract_text(b"{not json", Some("application/json"), "a.json").unwrap();
        assert_eq!(text, "{not json");
    }

    #[test]
    fn test_garbage_pdf_is_parse_error() {
        let result = extract_text(b"not a pdf", Some("application/pdf"), "a.pdf");
        assert!(matches!(result, Err(KbServeError::Parse(_))));
    }
}
