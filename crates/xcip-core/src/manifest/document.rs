//! Well-formedness pass: XML text to a raw element tree.
//!
//! Only syntax is checked here. Element names and attribute values are kept
//! as text for the schema pass to interpret.

use quick_xml::events::{BytesStart, Event};
use quick_xml::Reader;

use crate::domain::StructuralError;

/// An element as it appeared in the document.
#[derive(Debug, Clone, PartialEq)]
pub struct RawElement {
    pub name: String,
    pub attributes: Vec<(String, String)>,
    pub children: Vec<RawElement>,
    /// 1-based line of the start tag.
    pub line: usize,
}

impl RawElement {
    pub fn attribute(&self, key: &str) -> Option<&str> {
        self.attributes
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }
}

/// Parse a document into its root element.
///
/// Any syntax error yields a single [`StructuralError::Malformed`].
pub fn parse_document(text: &str) -> Result<RawElement, StructuralError> {
    let mut reader = Reader::from_str(text);
    reader.config_mut().trim_text(true);

    let mut stack: Vec<RawElement> = Vec::new();
    let mut root: Option<RawElement> = None;

    loop {
        let event = reader.read_event().map_err(|e| StructuralError::Malformed {
            line: line_at(text, reader.error_position() as usize),
            message: e.to_string(),
        })?;
        let end = reader.buffer_position() as usize;
        match event {
            Event::Start(e) => {
                // `<` + content + `>`
                let start = end.saturating_sub(e.len() + 2);
                let element = element_from(&e, line_at(text, start))?;
                stack.push(element);
            }
            Event::Empty(e) => {
                // `<` + content + `/>`
                let start = end.saturating_sub(e.len() + 3);
                let element = element_from(&e, line_at(text, start))?;
                attach(&mut stack, &mut root, element, text, start)?;
            }
            Event::End(_) => {
                let start = end;
                // quick-xml checks that end names match their start tags.
                let Some(element) = stack.pop() else {
                    return Err(StructuralError::Malformed {
                        line: line_at(text, start),
                        message: "unexpected closing tag".to_string(),
                    });
                };
                attach(&mut stack, &mut root, element, text, start)?;
            }
            Event::Eof => break,
            _ => {}
        }
    }

    if let Some(open) = stack.last() {
        return Err(StructuralError::Malformed {
            line: open.line,
            message: format!("element <{}> is never closed", open.name),
        });
    }
    root.ok_or_else(|| StructuralError::Malformed {
        line: 1,
        message: "document has no root element".to_string(),
    })
}

fn attach(
    stack: &mut [RawElement],
    root: &mut Option<RawElement>,
    element: RawElement,
    text: &str,
    position: usize,
) -> Result<(), StructuralError> {
    if let Some(parent) = stack.last_mut() {
        parent.children.push(element);
        return Ok(());
    }
    if root.is_some() {
        return Err(StructuralError::Malformed {
            line: line_at(text, position),
            message: format!("second root element <{}>", element.name),
        });
    }
    *root = Some(element);
    Ok(())
}

fn element_from(start: &BytesStart<'_>, line: usize) -> Result<RawElement, StructuralError> {
    let malformed = |message: String| StructuralError::Malformed { line, message };

    let name = String::from_utf8_lossy(start.name().as_ref()).into_owned();
    let mut attributes = Vec::new();
    for attr in start.attributes() {
        let attr = attr.map_err(|e| malformed(e.to_string()))?;
        let key = String::from_utf8_lossy(attr.key.as_ref()).into_owned();
        let value = attr
            .unescape_value()
            .map_err(|e| malformed(e.to_string()))?
            .into_owned();
        attributes.push((key, value));
    }
    Ok(RawElement {
        name,
        attributes,
        children: Vec::new(),
        line,
    })
}

/// 1-based line number of a byte offset.
fn line_at(text: &str, offset: usize) -> usize {
    let end = offset.min(text.len());
    text.as_bytes()[..end].iter().filter(|b| **b == b'\n').count() + 1
}
