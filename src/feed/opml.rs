use std::path::Path;

use quick_xml::events::{BytesDecl, BytesEnd, BytesStart, BytesText, Event};
use quick_xml::{Reader, Writer};
use thiserror::Error;

/// SEC-003: Maximum allowed nesting depth for OPML outline elements.
/// Prevents stack overflow attacks from maliciously crafted deeply nested OPMLs.
pub const MAX_OPML_DEPTH: usize = 50;

/// Separator between a category and its stored form (`news` ⇄ `/news`).
const CATEGORY_SEPARATOR: char = '/';

const OPML_DOCS: &str = "http://opml.org/spec2.opml";

/// Errors that can occur while reading or writing OPML.
#[derive(Debug, Error)]
pub enum OpmlError {
    /// SEC-003: OPML nesting depth exceeds safety limit.
    #[error("OPML nesting depth exceeds maximum of {0} levels")]
    MaxDepthExceeded(usize),

    /// XML parsing failed.
    #[error("XML parse error: {0}")]
    XmlParse(String),

    /// The content is well-formed XML but has no `<opml>` root.
    #[error("Document is not OPML")]
    NotOpml,

    /// Serializing the document failed.
    #[error("Failed to write OPML: {0}")]
    Write(String),

    /// File I/O error.
    #[error("Failed to read OPML file: {0}")]
    Io(#[from] std::io::Error),
}

/// One feed `<outline>` of an OPML body.
///
/// Values are kept exactly as stored; in particular `category` carries the
/// leading separator (`/news`). Use [`category_from_stored`] and
/// [`category_to_stored`] to convert.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Outline {
    pub title: String,
    pub xml_url: String,
    pub html_url: String,
    pub category: String,
    /// `isComment="true"`: the feed is kept in the document but disabled.
    pub disabled: bool,
    pub etag: Option<String>,
    pub last_modified: Option<String>,
    pub last_read: Option<String>,
    pub created: Option<String>,
}

/// An OPML subscription document.
///
/// Feed outlines are kept flat and in document order. Folder outlines found
/// while parsing (outlines without `xmlUrl`) are not kept; their names
/// become the category of the feeds nested inside them.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct OpmlDocument {
    pub title: String,
    pub date_created: String,
    pub date_modified: String,
    pub owner_name: String,
    pub outlines: Vec<Outline>,
}

/// Strips the leading separator from a stored category (`/news` → `news`).
pub fn category_from_stored(stored: &str) -> String {
    stored.trim_start_matches(CATEGORY_SEPARATOR).to_string()
}

/// Adds the leading separator used in the stored form (`news` → `/news`).
pub fn category_to_stored(category: &str) -> String {
    format!(
        "{}{}",
        CATEGORY_SEPARATOR,
        category.trim_start_matches(CATEGORY_SEPARATOR)
    )
}

impl OpmlDocument {
    /// A document with no feeds, stamped with `timestamp` as both created and
    /// modified date.
    pub fn empty(title: &str, timestamp: &str) -> Self {
        Self {
            title: title.to_string(),
            date_created: timestamp.to_string(),
            date_modified: timestamp.to_string(),
            owner_name: String::new(),
            outlines: Vec::new(),
        }
    }

    /// Reads and parses an OPML file.
    pub fn read_file(path: &Path) -> Result<Self, OpmlError> {
        let content = std::fs::read_to_string(path)?;
        Self::parse(&content)
    }

    /// Parses OPML content.
    ///
    /// Handles both nested and flat documents, extracting feeds from any
    /// `<outline>` element with an `xmlUrl` attribute regardless of depth.
    pub fn parse(content: &str) -> Result<Self, OpmlError> {
        // SEC-002: XXE protection: quick-xml (0.37) never parses <!ENTITY> declarations from
        // DOCTYPE. Only the 5 XML builtin entities resolve; custom entities like &xxe; fail
        // with `EscapeError::UnrecognizedEntity` in `decode_and_unescape_value()`.
        let mut reader = Reader::from_str(content);
        reader.config_mut().trim_text(true);

        let mut doc = OpmlDocument::default();
        let mut buf = Vec::new();
        let mut seen_root = false;
        let mut in_head = false;
        let mut head_field: Option<Vec<u8>> = None;
        // One entry per open <outline>: Some(name) for folders, None for feeds
        let mut folders: Vec<Option<String>> = Vec::new();

        loop {
            match reader.read_event_into(&mut buf) {
                Ok(Event::Start(e)) => match e.name().as_ref() {
                    b"opml" => seen_root = true,
                    b"head" => in_head = true,
                    b"outline" => {
                        // SEC-003: Reject excessively nested OPMLs
                        if folders.len() >= MAX_OPML_DEPTH {
                            return Err(OpmlError::MaxDepthExceeded(MAX_OPML_DEPTH));
                        }
                        match read_outline(&e, &reader, &folders)? {
                            ParsedOutline::Feed(outline) => {
                                doc.outlines.push(outline);
                                folders.push(None);
                            }
                            ParsedOutline::Folder(name) => folders.push(Some(name)),
                        }
                    }
                    name if in_head => head_field = Some(name.to_vec()),
                    _ => {}
                },
                Ok(Event::Empty(e)) => match e.name().as_ref() {
                    b"opml" => seen_root = true,
                    b"outline" => {
                        if let ParsedOutline::Feed(outline) = read_outline(&e, &reader, &folders)? {
                            doc.outlines.push(outline);
                        }
                    }
                    _ => {}
                },
                Ok(Event::Text(t)) => {
                    if let Some(field) = head_field.as_deref() {
                        let text = t
                            .unescape()
                            .map_err(|e| OpmlError::XmlParse(e.to_string()))?
                            .into_owned();
                        match field {
                            b"title" => doc.title = text,
                            b"dateCreated" => doc.date_created = text,
                            b"dateModified" => doc.date_modified = text,
                            b"ownerName" => doc.owner_name = text,
                            _ => {}
                        }
                    }
                }
                Ok(Event::End(e)) => match e.name().as_ref() {
                    b"head" => in_head = false,
                    b"outline" => {
                        folders.pop();
                    }
                    _ => head_field = None,
                },
                Ok(Event::Eof) => break,
                Err(e) => return Err(OpmlError::XmlParse(e.to_string())),
                _ => {}
            }
            buf.clear();
        }

        if !seen_root {
            return Err(OpmlError::NotOpml);
        }
        Ok(doc)
    }

    /// Renders the document as OPML 1.0 XML.
    pub fn render(&self) -> Result<String, OpmlError> {
        let mut writer = Writer::new_with_indent(Vec::new(), b' ', 4);

        write(
            &mut writer,
            Event::Decl(BytesDecl::new("1.0", Some("UTF-8"), None)),
        )?;

        let mut opml = BytesStart::new("opml");
        opml.push_attribute(("version", "1.0"));
        write(&mut writer, Event::Start(opml))?;

        write(&mut writer, Event::Start(BytesStart::new("head")))?;
        write_text_element(&mut writer, "title", &self.title)?;
        write_text_element(&mut writer, "dateCreated", &self.date_created)?;
        write_text_element(&mut writer, "dateModified", &self.date_modified)?;
        write_text_element(&mut writer, "ownerName", &self.owner_name)?;
        write_text_element(&mut writer, "docs", OPML_DOCS)?;
        write(&mut writer, Event::End(BytesEnd::new("head")))?;

        write(&mut writer, Event::Start(BytesStart::new("body")))?;
        for outline in &self.outlines {
            let mut element = BytesStart::new("outline");
            element.push_attribute(("text", outline.title.as_str()));
            element.push_attribute(("title", outline.title.as_str()));
            element.push_attribute(("type", "rss"));
            element.push_attribute(("category", outline.category.as_str()));
            element.push_attribute(("xmlUrl", outline.xml_url.as_str()));
            element.push_attribute(("htmlUrl", outline.html_url.as_str()));
            element.push_attribute(("isComment", if outline.disabled { "true" } else { "false" }));
            let optional = [
                ("etag", &outline.etag),
                ("lastModified", &outline.last_modified),
                ("lastRead", &outline.last_read),
                ("created", &outline.created),
            ];
            for (key, value) in optional {
                if let Some(value) = value {
                    element.push_attribute((key, value.as_str()));
                }
            }
            write(&mut writer, Event::Empty(element))?;
        }
        write(&mut writer, Event::End(BytesEnd::new("body")))?;
        write(&mut writer, Event::End(BytesEnd::new("opml")))?;

        String::from_utf8(writer.into_inner())
            .map_err(|_| OpmlError::Write("Generated OPML contains invalid UTF-8".to_string()))
    }
}

enum ParsedOutline {
    Feed(Outline),
    Folder(String),
}

/// Extracts an outline's attributes.
///
/// Outlines with an `xmlUrl` are feeds; everything else is treated as a
/// folder named by its `text` (or `title`) attribute.
fn read_outline(
    e: &BytesStart<'_>,
    reader: &Reader<&[u8]>,
    folders: &[Option<String>],
) -> Result<ParsedOutline, OpmlError> {
    let mut outline = Outline::default();
    let mut xml_url = None;
    let mut title = None;
    let mut text = None;
    let mut category = None;

    for attr_result in e.attributes() {
        let attr = match attr_result {
            Ok(attr) => attr,
            Err(e) => {
                tracing::warn!(error = %e, "Skipping malformed OPML attribute");
                continue;
            }
        };
        let value = attr
            .decode_and_unescape_value(reader.decoder())
            .map_err(|e| OpmlError::XmlParse(e.to_string()))?
            .into_owned();
        match attr.key.as_ref() {
            b"xmlUrl" => xml_url = Some(value),
            b"htmlUrl" => outline.html_url = value,
            b"title" => title = Some(value),
            b"text" => text = Some(value),
            b"category" => category = Some(value),
            b"isComment" => outline.disabled = value.eq_ignore_ascii_case("true"),
            b"etag" => outline.etag = Some(value),
            b"lastModified" => outline.last_modified = Some(value),
            b"lastRead" => outline.last_read = Some(value),
            b"created" => outline.created = Some(value),
            _ => {}
        }
    }

    let Some(url) = xml_url else {
        return Ok(ParsedOutline::Folder(title.or(text).unwrap_or_default()));
    };

    outline.title = title.or(text).unwrap_or_else(|| url.clone());
    outline.xml_url = url;
    outline.category = category.unwrap_or_else(|| {
        let path: Vec<&str> = folders
            .iter()
            .flatten()
            .map(String::as_str)
            .filter(|name| !name.is_empty())
            .collect();
        category_to_stored(&path.join("/"))
    });
    Ok(ParsedOutline::Feed(outline))
}

fn write(writer: &mut Writer<Vec<u8>>, event: Event<'_>) -> Result<(), OpmlError> {
    writer
        .write_event(event)
        .map_err(|e| OpmlError::Write(e.to_string()))
}

fn write_text_element(
    writer: &mut Writer<Vec<u8>>,
    name: &str,
    text: &str,
) -> Result<(), OpmlError> {
    write(writer, Event::Start(BytesStart::new(name)))?;
    if !text.is_empty() {
        write(writer, Event::Text(BytesText::new(text)))?;
    }
    write(writer, Event::End(BytesEnd::new(name)))
}
