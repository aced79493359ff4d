//! Minimal element tree over quick-xml.
//!
//! OAI-PMH responses are small enough per page to hold in memory, and
//! the harvester needs random access (header, metadata, resumption token)
//! rather than a streaming pass. Element and attribute names are stored
//! without their namespace prefix.

use quick_xml::events::{BytesStart, Event};
use quick_xml::Reader;
use std::ops::Range;

use crate::error::HarvestError;

#[derive(Debug, Clone, Default)]
pub struct Element {
    pub name: String,
    pub attrs: Vec<(String, String)>,
    /// Concatenated direct text content.
    pub text: String,
    pub children: Vec<Element>,
    span: Range<usize>,
}

impl Element {
    pub fn attr(&self, name: &str) -> Option<&str> {
        self.attrs
            .iter()
            .find(|(k, _)| k == name)
            .map(|(_, v)| v.as_str())
    }

    pub fn child(&self, name: &str) -> Option<&Element> {
        self.children.iter().find(|c| c.name == name)
    }

    pub fn children_named<'a>(&'a self, name: &'a str) -> impl Iterator<Item = &'a Element> + 'a {
        self.children.iter().filter(move |c| c.name == name)
    }

    pub fn child_text(&self, name: &str) -> Option<&str> {
        self.child(name).map(|c| c.text.as_str())
    }

    /// First element named `name` in document order, including `self`.
    pub fn find(&self, name: &str) -> Option<&Element> {
        if self.name == name {
            return Some(self);
        }
        self.children.iter().find_map(|c| c.find(name))
    }

    /// The element's original markup within `source`.
    pub fn raw<'a>(&self, source: &'a [u8]) -> &'a [u8] {
        let end = self.span.end.min(source.len());
        let start = self.span.start.min(end);
        source[start..end].trim_ascii()
    }
}

/// Parse `bytes` and return the document element.
pub fn parse_document(bytes: &[u8]) -> Result<Element, HarvestError> {
    let mut reader = Reader::from_reader(bytes);
    reader.config_mut().trim_text(true);
    let mut buf = Vec::new();
    let mut stack: Vec<Element> = Vec::new();
    let mut root: Option<Element> = None;

    loop {
        let start = reader.buffer_position() as usize;
        match reader.read_event_into(&mut buf)? {
            Event::Start(e) => stack.push(open_element(&e, start)?),
            Event::Empty(e) => {
                let mut element = open_element(&e, start)?;
                element.span.end = reader.buffer_position() as usize;
                attach(&mut stack, &mut root, element)?;
            }
            Event::Text(t) => {
                if let Some(top) = stack.last_mut() {
                    top.text.push_str(&t.unescape()?);
                }
            }
            Event::CData(c) => {
                if let Some(top) = stack.last_mut() {
                    top.text.push_str(&String::from_utf8_lossy(&c.into_inner()));
                }
            }
            Event::End(_) => {
                let mut element = stack
                    .pop()
                    .ok_or_else(|| HarvestError::Permanent("unbalanced XML end tag".into()))?;
                element.span.end = reader.buffer_position() as usize;
                attach(&mut stack, &mut root, element)?;
            }
            Event::Eof => break,
            _ => {}
        }
        buf.clear();
    }

    if !stack.is_empty() {
        return Err(HarvestError::Permanent("truncated XML document".into()));
    }
    root.ok_or_else(|| HarvestError::Permanent("empty XML document".into()))
}

fn open_element(e: &BytesStart<'_>, start: usize) -> Result<Element, HarvestError> {
    let mut attrs = Vec::new();
    for attr in e.attributes() {
        let attr = attr.map_err(quick_xml::Error::from)?;
        if attr.key.as_ref().starts_with(b"xmlns") {
            continue;
        }
        let key = String::from_utf8_lossy(attr.key.local_name().as_ref()).into_owned();
        let value = attr.unescape_value()?.into_owned();
        attrs.push((key, value));
    }
    Ok(Element {
        name: String::from_utf8_lossy(e.local_name().as_ref()).into_owned(),
        attrs,
        text: String::new(),
        children: Vec::new(),
        span: start..start,
    })
}

fn attach(
    stack: &mut [Element],
    root: &mut Option<Element>,
    element: Element,
) -> Result<(), HarvestError> {
    match stack.last_mut() {
        Some(parent) => parent.children.push(element),
        None if root.is_none() => *root = Some(element),
        None => {
            return Err(HarvestError::Permanent(
                "XML document has more than one root element".into(),
            ))
        }
    }
    Ok(())
}
