//! Report rendering.
//!
//! CSV goes through the Cerebrum dialect writer, JSON is an array with one
//! object per row keyed by column name, and HTML is a standalone page with
//! a single table, generated with `quick-xml`'s writer so every cell is
//! escaped.

use std::io::Cursor;

use cerebrum_source::dialect::CerebrumWriter;
use quick_xml::{
  Writer,
  events::{BytesEnd, BytesStart, BytesText, Event},
};
use serde_json::{Map, Value};
use strum::{Display, EnumString};

use crate::{Error, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Display, EnumString)]
#[strum(serialize_all = "lowercase")]
pub enum Format {
  #[default]
  Csv,
  Json,
  Html,
}

/// A table of plain strings, independent of output format.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Report {
  pub title:   String,
  pub columns: Vec<String>,
  pub rows:    Vec<Vec<String>>,
}

impl Report {
  pub fn new(title: impl Into<String>, columns: &[&str]) -> Self {
    Self {
      title:   title.into(),
      columns: columns.iter().map(|c| (*c).to_owned()).collect(),
      rows:    Vec::new(),
    }
  }

  pub fn push(&mut self, row: Vec<String>) { self.rows.push(row); }

  pub fn render(&self, format: Format) -> Result<String> {
    match format {
      Format::Csv => self.render_csv(),
      Format::Json => self.render_json(),
      Format::Html => self.render_html(),
    }
  }

  /// Header line, then one line per row.
  pub fn render_csv(&self) -> Result<String> {
    let mut writer = CerebrumWriter::new(Vec::new());
    writer.write_record(&self.columns)?;
    for row in &self.rows {
      writer.write_record(row)?;
    }
    Ok(String::from_utf8(writer.into_inner()?)?)
  }

  pub fn render_json(&self) -> Result<String> {
    let rows: Vec<Value> = self
      .rows
      .iter()
      .map(|row| {
        let object: Map<String, Value> = self
          .columns
          .iter()
          .zip(row)
          .map(|(column, cell)| (column.clone(), Value::String(cell.clone())))
          .collect();
        Value::Object(object)
      })
      .collect();
    Ok(serde_json::to_string_pretty(&Value::Array(rows))?)
  }

  pub fn render_html(&self) -> Result<String> {
    let mut w = Writer::new_with_indent(Cursor::new(Vec::new()), b' ', 2);
    w.write_event(Event::DocType(BytesText::from_escaped("html"))).map_err(html)?;
    write_start(&mut w, "html")?;
    write_start(&mut w, "head")?;
    write_text_elem(&mut w, "title", &self.title)?;
    write_end(&mut w, "head")?;
    write_start(&mut w, "body")?;
    write_text_elem(&mut w, "h1", &self.title)?;
    write_start(&mut w, "table")?;

    write_start(&mut w, "thead")?;
    write_row(&mut w, "th", &self.columns)?;
    write_end(&mut w, "thead")?;
    write_start(&mut w, "tbody")?;
    for row in &self.rows {
      write_row(&mut w, "td", row)?;
    }
    write_end(&mut w, "tbody")?;

    write_end(&mut w, "table")?;
    write_end(&mut w, "body")?;
    write_end(&mut w, "html")?;
    Ok(String::from_utf8(w.into_inner().into_inner())?)
  }
}

// ─── HTML writer helpers ─────────────────────────────────────────────────────

type HtmlWriter = Writer<Cursor<Vec<u8>>>;

fn html(e: impl std::fmt::Display) -> Error { Error::Html(e.to_string()) }

fn write_start(w: &mut HtmlWriter, tag: &str) -> Result<()> {
  w.write_event(Event::Start(BytesStart::new(tag))).map_err(html)
}

fn write_end(w: &mut HtmlWriter, tag: &str) -> Result<()> {
  w.write_event(Event::End(BytesEnd::new(tag))).map_err(html)
}

fn write_text_elem(w: &mut HtmlWriter, tag: &str, text: &str) -> Result<()> {
  write_start(w, tag)?;
  w.write_event(Event::Text(BytesText::new(text))).map_err(html)?;
  write_end(w, tag)
}

fn write_row(w: &mut HtmlWriter, cell: &str, values: &[String]) -> Result<()> {
  write_start(w, "tr")?;
  for value in values {
    write_text_elem(w, cell, value)?;
  }
  write_end(w, "tr")
}
