//! The Cerebrum CSV dialect.
//!
//! Fields are separated by `;`, records end with `\n`, and nothing is ever
//! quoted. Instead every delimiter, quote, backslash and line break inside a
//! field is preceded by a `\`.
//!
//! A record made of one empty field would be indistinguishable from a blank
//! line, so it is written as the marker `\e` alone.
//!
//! Writing goes through the `csv` crate with quoting switched off; the fields
//! are escaped beforehand. Reading is done by hand because the `csv` reader
//! only understands escapes inside quoted fields.

use std::{borrow::Cow, io};

use csv::{QuoteStyle, Terminator, WriterBuilder};

use crate::{Error, Result};

pub const DELIMITER: char = ';';
pub const ESCAPE: char = '\\';
/// Follows `ESCAPE` to mark a record holding one empty field.
pub const EMPTY_RECORD: char = 'e';

fn needs_escape(c: char) -> bool { matches!(c, DELIMITER | ESCAPE | '"' | '\n' | '\r') }

/// Escape one field for output.
pub fn escape_field(field: &str) -> Cow<'_, str> {
  if !field.contains(needs_escape) {
    return Cow::Borrowed(field);
  }
  let mut out = String::with_capacity(field.len() + 4);
  for c in field.chars() {
    if needs_escape(c) {
      out.push(ESCAPE);
    }
    out.push(c);
  }
  Cow::Owned(out)
}

// ─── Writer ──────────────────────────────────────────────────────────────────

/// Writes records in the Cerebrum dialect.
pub struct CerebrumWriter<W: io::Write> {
  inner: csv::Writer<W>,
}

impl<W: io::Write> CerebrumWriter<W> {
  pub fn new(writer: W) -> Self {
    let inner = WriterBuilder::new()
      .delimiter(DELIMITER as u8)
      .quote_style(QuoteStyle::Never)
      .terminator(Terminator::Any(b'\n'))
      .flexible(true)
      .from_writer(writer);
    Self { inner }
  }

  pub fn write_record<I, T>(&mut self, record: I) -> Result<()>
  where
    I: IntoIterator<Item = T>,
    T: AsRef<str>,
  {
    let fields: Vec<String> = record
      .into_iter()
      .map(|f| escape_field(f.as_ref()).into_owned())
      .collect();
    if let [only] = fields.as_slice()
      && only.is_empty()
    {
      let marker = format!("{ESCAPE}{EMPTY_RECORD}");
      self.inner.write_record([marker.as_bytes()])?;
      return Ok(());
    }
    self.inner.write_record(fields.iter().map(String::as_bytes))?;
    Ok(())
  }

  pub fn flush(&mut self) -> Result<()> { Ok(self.inner.flush()?) }

  pub fn into_inner(self) -> Result<W> {
    self.inner.into_inner().map_err(|e| Error::Io(e.into_error()))
  }
}

// ─── Reader ──────────────────────────────────────────────────────────────────

/// One parsed record and the line it started on (1-based).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Record {
  pub line:   usize,
  pub fields: Vec<String>,
}

/// Split `input` into records. Blank lines are skipped; an unescaped `\r` is
/// dropped so CRLF files read the same as LF files. A line holding only
/// `\e` reads as one empty field.
pub fn read_records(input: &str) -> Result<Vec<Record>> {
  let mut records = Vec::new();
  let mut fields: Vec<String> = Vec::new();
  let mut field = String::new();
  let mut line = 1;
  let mut record_line = 1;
  let mut empty_record = false;
  let mut chars = input.chars();

  let mut finish =
    |fields: &mut Vec<String>, field: &mut String, record_line: usize, keep_empty: bool| {
      fields.push(std::mem::take(field));
      let done = std::mem::take(fields);
      if keep_empty || !(done.len() == 1 && done[0].is_empty()) {
        records.push(Record { line: record_line, fields: done });
      }
    };

  while let Some(c) = chars.next() {
    match c {
      ESCAPE => {
        let escaped = chars.next().ok_or(Error::DanglingEscape { line })?;
        if escaped == EMPTY_RECORD
          && fields.is_empty()
          && field.is_empty()
          && matches!(chars.clone().next(), None | Some('\n' | '\r'))
        {
          empty_record = true;
          continue;
        }
        if escaped == '\n' {
          line += 1;
        }
        field.push(escaped);
      }
      DELIMITER => fields.push(std::mem::take(&mut field)),
      '\r' => {}
      '\n' => {
        finish(&mut fields, &mut field, record_line, std::mem::take(&mut empty_record));
        line += 1;
        record_line = line;
      }
      c => field.push(c),
    }
  }
  if !field.is_empty() || !fields.is_empty() || empty_record {
    finish(&mut fields, &mut field, record_line, empty_record);
  }

  Ok(records)
}

#[cfg(test)]
mod tests {
  use super::*;

  fn write(rows: &[Vec<&str>]) -> String {
    let mut w = CerebrumWriter::new(Vec::new());
    for row in rows {
      w.write_record(row).unwrap();
    }
    String::from_utf8(w.into_inner().unwrap()).unwrap()
  }

  #[test]
  fn plain_fields_are_written_verbatim() {
    assert_eq!(write(&[vec!["a", "b c", ""]]), "a;b c;\n");
  }

  #[test]
  fn special_characters_are_escaped() {
    let out = write(&[vec!["x;y", "back\\slash", "say \"hi\"", "two\nlines"]]);
    assert_eq!(out, "x\\;y;back\\\\slash;say \\\"hi\\\";two\\\nlines\n");
  }

  #[test]
  fn written_rows_read_back_unchanged() {
    let rows = vec![
      vec!["olan", "Ola Nordmann", "010101", "ANSATT/tekadm"],
      vec!["with;delimiter", "trailing\\", "", "new\nline\r\n"],
      vec!["single"],
      vec![""],
      vec!["e"],
      vec!["\\e"],
    ];
    let out = write(&rows);
    let read: Vec<Vec<String>> = read_records(&out)
      .unwrap()
      .into_iter()
      .map(|r| r.fields)
      .collect();
    assert_eq!(read, rows);
  }

  #[test]
  fn reader_tracks_lines_and_skips_blanks() {
    let records = read_records("a;b\r\n\nc\\\nd;e\nf").unwrap();
    assert_eq!(records.len(), 3);
    assert_eq!(records[0].line, 1);
    assert_eq!(records[1].fields, ["c\nd", "e"]);
    assert_eq!(records[1].line, 3);
    assert_eq!(records[2].line, 5);
    assert_eq!(records[2].fields, ["f"]);
  }

  #[test]
  fn one_empty_field_is_not_a_blank_line() {
    assert_eq!(write(&[vec![""], vec!["a"]]), "\\e\na\n");
    let records = read_records("\\e\r\n\na\n\\e").unwrap();
    let fields: Vec<Vec<String>> = records.into_iter().map(|r| r.fields).collect();
    assert_eq!(fields, [vec![""], vec!["a"], vec![""]]);
    assert_eq!(read_records("\\e;x\n").unwrap()[0].fields, ["e", "x"]);
  }

  #[test]
  fn dangling_escape_is_an_error() {
    assert!(matches!(
      read_records("a;b\\"),
      Err(Error::DanglingEscape { line: 1 })
    ));
  }
}
