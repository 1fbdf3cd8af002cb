use crate::dedup::content_hash;
use crate::error::ParseError;
use crate::types::{DedupKey, NormalizedItem, Published, RawDocument};
use chrono::{DateTime, NaiveDateTime, TimeZone, Utc};
use quick_xml::encoding::Decoder;
use quick_xml::escape::unescape;
use quick_xml::events::{BytesStart, Event};
use quick_xml::reader::Reader;
use tracing::debug;
use uuid::Uuid;

const NAIVE_DATE_FORMATS: [&str; 2] = ["%Y-%m-%dT%H:%M:%S", "%Y-%m-%d %H:%M:%S"];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FeedFormat {
    Rss,
    Atom,
    /// Well-formed markup that is neither; yields no items.
    Unknown,
}

impl FeedFormat {
    fn from_root(local_name: &[u8]) -> Self {
        match local_name {
            b"rss" | b"RDF" => FeedFormat::Rss,
            b"feed" => FeedFormat::Atom,
            _ => FeedFormat::Unknown,
        }
    }
}

pub fn parse_document(feed_id: Uuid, document: &RawDocument) -> Result<Vec<NormalizedItem>, ParseError> {
    parse_feed(feed_id, &document.body)
}

/// Parses RSS `<item>` and Atom `<entry>` elements in document order.
///
/// Missing fields never fail the parse; only input that is not well-formed
/// markup does. Text is decoded with the encoding the document declares.
pub fn parse_feed(feed_id: Uuid, xml: &[u8]) -> Result<Vec<NormalizedItem>, ParseError> {
    let mut reader = Reader::from_reader(xml);

    let mut items = Vec::new();
    let mut buf = Vec::new();

    let mut format = None;
    let mut depth = 0usize;
    let mut entry: Option<EntryBuilder> = None;
    let mut entry_depth = 0usize;
    let mut capture: Option<Capture> = None;

    loop {
        let event = reader.read_event_into(&mut buf).map_err(|e| {
            ParseError::MalformedDocument(format!("XML error at byte {}: {}", reader.buffer_position(), e))
        })?;
        let decoder = reader.decoder();

        match event {
            Event::Start(e) => {
                depth += 1;
                if format.is_none() {
                    format = Some(FeedFormat::from_root(e.local_name().as_ref()));
                }

                if capture.is_some() {
                    // Markup nested inside a field, e.g. xhtml content; only its text is kept.
                } else if let Some(builder) = entry.as_mut() {
                    if depth == entry_depth + 1 {
                        if let Some(field) = builder.field(e.name().as_ref()) {
                            if field == Field::Link {
                                builder.link_from_attributes(&e, decoder);
                            }
                            capture = Some(Capture::new(field, depth));
                        }
                    }
                } else if format != Some(FeedFormat::Unknown) && matches!(e.local_name().as_ref(), b"item" | b"entry") {
                    entry = Some(EntryBuilder::new(e.name().as_ref()));
                    entry_depth = depth;
                }
            }
            Event::Empty(e) => {
                if format.is_none() {
                    format = Some(FeedFormat::from_root(e.local_name().as_ref()));
                }

                if capture.is_none() && depth == entry_depth {
                    if let Some(builder) = entry.as_mut() {
                        if builder.field(e.name().as_ref()) == Some(Field::Link) {
                            builder.link_from_attributes(&e, decoder);
                        }
                    }
                }
            }
            Event::End(_) => {
                if capture.as_ref().is_some_and(|c| c.depth == depth) {
                    if let (Some(captured), Some(builder)) = (capture.take(), entry.as_mut()) {
                        builder.set(captured.field, captured.text);
                    }
                } else if capture.is_none() && entry.is_some() && depth == entry_depth {
                    if let Some(builder) = entry.take() {
                        items.push(builder.build(feed_id));
                    }
                }
                depth = depth.saturating_sub(1);
            }
            Event::Text(e) => {
                if let Some(captured) = capture.as_mut() {
                    captured.push(&unescape_lenient(&decode(decoder, &e)));
                }
            }
            Event::CData(e) => {
                if let Some(captured) = capture.as_mut() {
                    captured.push(&decode(decoder, &e));
                }
            }
            Event::Eof => break,
            _ => {}
        }
        buf.clear();
    }

    let Some(format) = format else {
        return Err(ParseError::MalformedDocument("no root element".to_string()));
    };
    if depth != 0 {
        return Err(ParseError::MalformedDocument(format!(
            "document ended with {} unclosed element(s)",
            depth
        )));
    }

    debug!("Parsed {:?} document with {} items", format, items.len());
    Ok(items)
}

/// Best-effort date normalization. Text no known format accepts is kept as-is.
pub fn parse_published(raw: &str) -> Published {
    let raw = raw.trim();

    if let Ok(at) = DateTime::parse_from_rfc2822(raw) {
        return Published::At(at.with_timezone(&Utc));
    }
    if let Ok(at) = DateTime::parse_from_rfc3339(raw) {
        return Published::At(at.with_timezone(&Utc));
    }
    for format in NAIVE_DATE_FORMATS {
        if let Ok(naive) = NaiveDateTime::parse_from_str(raw, format) {
            return Published::At(Utc.from_utc_datetime(&naive));
        }
    }

    Published::Raw(raw.to_string())
}

fn decode(decoder: Decoder, raw: &[u8]) -> String {
    match decoder.decode(raw) {
        Ok(text) => text.into_owned(),
        Err(_) => String::from_utf8_lossy(raw).into_owned(),
    }
}

/// Resolves each `&...;` reference on its own so an unknown one stays verbatim
/// without blocking the rest.
fn unescape_lenient(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    let mut rest = raw;

    while let Some(start) = rest.find('&') {
        out.push_str(&rest[..start]);
        let tail = &rest[start..];
        match tail.find(';') {
            Some(end) => {
                let reference = &tail[..=end];
                match unescape(reference) {
                    Ok(text) => out.push_str(&text),
                    Err(_) => out.push_str(reference),
                }
                rest = &tail[end + 1..];
            }
            None => {
                out.push_str(tail);
                rest = "";
            }
        }
    }

    out.push_str(rest);
    out
}

fn split_name(name: &[u8]) -> (Option<&[u8]>, &[u8]) {
    match name.iter().position(|b| *b == b':') {
        Some(colon) => (Some(&name[..colon]), &name[colon + 1..]),
        None => (None, name),
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Field {
    Title,
    Link,
    Description,
    Content,
    Published,
    Updated,
    Guid,
}

impl Field {
    /// Fields share the entry's prefix, apart from the `content:` and `dc:`
    /// extensions RSS commonly mixes in.
    fn from_name(name: &[u8], entry_prefix: Option<&[u8]>) -> Option<Self> {
        let (prefix, local) = split_name(name);

        match (prefix, local) {
            (Some(b"content"), b"encoded") => return Some(Field::Content),
            (Some(b"dc"), b"date") => return Some(Field::Published),
            _ => {}
        }
        if prefix != entry_prefix {
            return None;
        }

        match local {
            b"title" => Some(Field::Title),
            b"link" => Some(Field::Link),
            b"description" | b"summary" => Some(Field::Description),
            b"content" => Some(Field::Content),
            b"pubDate" | b"published" => Some(Field::Published),
            b"updated" => Some(Field::Updated),
            b"guid" | b"id" => Some(Field::Guid),
            _ => None,
        }
    }
}

struct Capture {
    field: Field,
    depth: usize,
    text: String,
}

impl Capture {
    fn new(field: Field, depth: usize) -> Self {
        Self {
            field,
            depth,
            text: String::new(),
        }
    }

    fn push(&mut self, piece: &str) {
        self.text.push_str(piece);
    }
}

#[derive(Default)]
struct EntryBuilder {
    prefix: Option<Vec<u8>>,
    title: Option<String>,
    link: Option<String>,
    description: Option<String>,
    content: Option<String>,
    published: Option<String>,
    updated: Option<String>,
    guid: Option<String>,
}

impl EntryBuilder {
    fn new(element_name: &[u8]) -> Self {
        Self {
            prefix: split_name(element_name).0.map(<[u8]>::to_vec),
            ..Self::default()
        }
    }

    fn field(&self, name: &[u8]) -> Option<Field> {
        Field::from_name(name, self.prefix.as_deref())
    }

    /// First non-empty occurrence of a field wins.
    fn set(&mut self, field: Field, text: String) {
        let slot = match field {
            Field::Title => &mut self.title,
            Field::Link => &mut self.link,
            Field::Description => &mut self.description,
            Field::Content => &mut self.content,
            Field::Published => &mut self.published,
            Field::Updated => &mut self.updated,
            Field::Guid => &mut self.guid,
        };
        if slot.is_none() {
            *slot = non_empty(text);
        }
    }

    /// Atom links carry the target in `href`; only `alternate` (or unlabelled) links count.
    fn link_from_attributes(&mut self, element: &BytesStart, decoder: Decoder) {
        if self.link.is_some() {
            return;
        }

        let mut href = None;
        let mut rel = None;
        for attribute in element.attributes().flatten() {
            let value = unescape_lenient(&decode(decoder, &attribute.value));
            match attribute.key.local_name().as_ref() {
                b"href" => href = Some(value),
                b"rel" => rel = Some(value),
                _ => {}
            }
        }

        if matches!(rel.as_deref(), None | Some("alternate")) {
            self.link = href.and_then(non_empty);
        }
    }

    fn build(self, feed_id: Uuid) -> NormalizedItem {
        let published_text = self.published.or(self.updated);

        let dedup_key = match (&self.guid, &self.link) {
            (Some(guid), _) => DedupKey::Guid(guid.clone()),
            (None, Some(link)) => DedupKey::Link(link.clone()),
            (None, None) => DedupKey::ContentHash(content_hash(
                self.title.as_deref(),
                self.description.as_deref(),
                self.content.as_deref(),
                published_text.as_deref(),
            )),
        };

        let content = self.content.or_else(|| self.description.clone());

        NormalizedItem {
            feed_id,
            title: self.title,
            link: self.link,
            description: self.description,
            content,
            published: published_text.as_deref().map(parse_published),
            dedup_key,
        }
    }
}

fn non_empty(text: String) -> Option<String> {
    let trimmed = text.trim();
    if trimmed.is_empty() {
        None
    } else if trimmed.len() == text.len() {
        Some(text)
    } else {
        Some(trimmed.to_string())
    }
}
