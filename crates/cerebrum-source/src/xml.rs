//! A small owned element tree over `quick-xml` events, with path lookups.
//!
//! Namespace prefixes are dropped; only local names are kept. Text from
//! several text nodes inside one element is concatenated.

use std::collections::HashMap;

use quick_xml::events::{BytesStart, Event};

use crate::{Error, Result};

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Element {
  pub name:       String,
  pub attributes: HashMap<String, String>,
  pub text:       String,
  pub children:   Vec<Element>,
}

impl Element {
  /// All elements reached by following `path` (`A/B/C`) through children.
  pub fn find_all<'a>(&'a self, path: &str) -> Vec<&'a Element> {
    let mut current = vec![self];
    for step in path.split('/').filter(|s| !s.is_empty() && *s != ".") {
      current = current
        .into_iter()
        .flat_map(|e| e.children.iter().filter(move |c| c.name == step))
        .collect();
    }
    current
  }

  /// The first element reached by following `path`.
  pub fn find(&self, path: &str) -> Option<&Element> { self.find_all(path).into_iter().next() }

  /// Trimmed text of the first element at `path`; `None` when the element is
  /// missing or its text is empty.
  pub fn find_text(&self, path: &str) -> Option<&str> {
    self.find(path).map(|e| e.text.trim()).filter(|t| !t.is_empty())
  }

  /// Every element named `name` at any depth, this element included, in
  /// document order.
  pub fn descendants<'a>(&'a self, name: &str) -> Vec<&'a Element> {
    let mut out = Vec::new();
    let mut stack = vec![self];
    while let Some(e) = stack.pop() {
      if e.name == name {
        out.push(e);
      }
      stack.extend(e.children.iter().rev());
    }
    out
  }
}

/// Parse a whole document into its root element.
pub fn parse_tree(xml: &str) -> Result<Element> {
  let mut reader = quick_xml::Reader::from_str(xml);
  reader.config_mut().trim_text(true);

  let mut stack: Vec<Element> = Vec::new();
  let mut root: Option<Element> = None;

  loop {
    match reader.read_event()? {
      Event::Start(ref e) => stack.push(element_from(e)?),
      Event::Empty(ref e) => {
        let element = element_from(e)?;
        attach(&mut stack, &mut root, element);
      }
      Event::Text(ref t) => {
        if let Some(top) = stack.last_mut() {
          top.text.push_str(&t.unescape()?);
        }
      }
      Event::CData(ref c) => {
        if let Some(top) = stack.last_mut() {
          top.text.push_str(&String::from_utf8_lossy(c));
        }
      }
      Event::End(_) => {
        if let Some(element) = stack.pop() {
          attach(&mut stack, &mut root, element);
        }
      }
      Event::Eof => break,
      _ => {}
    }
  }

  root.ok_or(Error::EmptyDocument)
}

fn attach(stack: &mut [Element], root: &mut Option<Element>, element: Element) {
  match stack.last_mut() {
    Some(parent) => parent.children.push(element),
    None => {
      if root.is_none() {
        *root = Some(element);
      }
    }
  }
}

fn element_from(e: &BytesStart<'_>) -> Result<Element> {
  Ok(Element {
    name: String::from_utf8_lossy(e.local_name().as_ref()).into_owned(),
    attributes: attributes(e)?,
    ..Element::default()
  })
}

/// Unescaped attributes of a start tag, keyed by local name.
pub fn attributes(e: &BytesStart<'_>) -> Result<HashMap<String, String>> {
  let mut out = HashMap::new();
  for attr in e.attributes() {
    let attr = attr?;
    let key = String::from_utf8_lossy(attr.key.local_name().as_ref()).into_owned();
    out.insert(key, attr.unescape_value()?.into_owned());
  }
  Ok(out)
}

#[cfg(test)]
mod tests {
  use super::*;

  const DOC: &str = r#"<?xml version="1.0"?>
<Export xmlns:x="urn:x">
  <Persons>
    <Person id="1"><Name>Kari &amp; Ola</Name><Phones><Phone><Number>1</Number></Phone><Phone><Number>2</Number></Phone></Phones></Person>
    <Person id="2"><Name/></Person>
  </Persons>
  <x:Units><x:Unit><x:Name><![CDATA[Kantina]]></x:Name></x:Unit></x:Units>
</Export>"#;

  #[test]
  fn paths_and_text() {
    let root = parse_tree(DOC).unwrap();
    assert_eq!(root.name, "Export");

    let persons = root.descendants("Persons")[0].find_all("Person");
    assert_eq!(persons.len(), 2);
    assert_eq!(persons[0].attributes["id"], "1");
    assert_eq!(persons[0].find_text("Name"), Some("Kari & Ola"));
    assert_eq!(persons[1].find_text("Name"), None);

    let numbers: Vec<_> = persons[0]
      .find_all("Phones/Phone")
      .iter()
      .filter_map(|p| p.find_text("Number"))
      .collect();
    assert_eq!(numbers, ["1", "2"]);
  }

  #[test]
  fn prefixes_are_dropped() {
    let root = parse_tree(DOC).unwrap();
    let unit = root.find("Units/Unit").unwrap();
    assert_eq!(unit.find_text("./Name"), Some("Kantina"));
  }

  #[test]
  fn empty_input_is_an_error() {
    assert!(matches!(parse_tree(""), Err(Error::EmptyDocument)));
    assert!(parse_tree("<a><b></a>").is_err());
  }
}
