//! Textual dump of captured batches
//!
//! The format is a nested literal that a Python `ast.literal_eval` also
//! accepts:
//!
//! ```text
//! [
//!   [
//!     (1, (
//!       None,  # UNSPEC
//!       b'\x08\x00\x03\x00',  # PACKET_HDR (4 bytes)
//!       ...
//!     )),
//!   ],
//! ]
//! ```
//!
//! Tuple position `i` holds attribute type `i`. Positions above `NFULA_MAX`
//! carry attribute types this crate does not know. Whitespace, trailing
//! commas and `#` comments are ignored when parsing, so
//! `parse_dump(&write_dump(b)) == b`.

use crate::error::{NflogError, Result};
use crate::types::{AttrType, AttributeSet, Batch, PacketRecord, NFULA_MAX};
use nom::branch::alt;
use nom::bytes::complete::{tag, take_while_m_n};
use nom::character::complete::{char, digit1, multispace1, not_line_ending, satisfy};
use nom::combinator::{all_consuming, cut, map, map_res, opt, value};
use nom::multi::{fold_many0, many0_count, separated_list0};
use nom::sequence::{pair, preceded, separated_pair, terminated};
use nom::IResult;
use std::io::{self, Write};
use std::path::Path;

/// Render batches as a dump
pub fn write_dump(batches: &[Batch]) -> String {
    let mut out = String::from("[\n");
    for batch in batches {
        push_batch(&mut out, batch);
    }
    out.push_str("]\n");
    out
}

/// Streaming dump writer, one batch at a time
#[derive(Debug)]
pub struct DumpWriter<W: Write> {
    out: W,
    batches: usize,
}

impl<W: Write> DumpWriter<W> {
    pub fn new(mut out: W) -> io::Result<Self> {
        out.write_all(b"[\n")?;
        Ok(Self { out, batches: 0 })
    }

    pub fn write_batch(&mut self, batch: &Batch) -> io::Result<()> {
        let mut text = String::new();
        push_batch(&mut text, batch);
        self.out.write_all(text.as_bytes())?;
        self.out.flush()?;
        self.batches += 1;
        Ok(())
    }

    pub fn batches(&self) -> usize {
        self.batches
    }

    /// Close the outer list and hand back the writer
    pub fn finish(mut self) -> io::Result<W> {
        self.out.write_all(b"]\n")?;
        self.out.flush()?;
        Ok(self.out)
    }
}

fn push_batch(out: &mut String, batch: &Batch) {
    out.push_str("  [\n");
    for record in batch {
        push_record(out, record);
    }
    out.push_str("  ],\n");
}

fn push_record(out: &mut String, record: &PacketRecord) {
    let attrs = record.attributes();
    let last = attrs
        .unknown()
        .last()
        .map_or(NFULA_MAX, |(t, _)| (*t).max(NFULA_MAX));

    out.push_str(&format!("    ({}, (\n", record.verdict()));
    for index in 0..=last {
        let name = match AttrType::from_u16(index) {
            Some(attr) => attr.name().to_string(),
            None => format!("type {index}"),
        };
        match attrs.get(index) {
            Some(payload) => {
                out.push_str("      ");
                push_bytes_literal(out, payload);
                out.push_str(&format!(",  # {name} ({} bytes)\n", payload.len()));
            }
            None => out.push_str(&format!("      None,  # {name}\n")),
        }
    }
    out.push_str("    )),\n");
}

fn push_bytes_literal(out: &mut String, bytes: &[u8]) {
    out.push_str("b'");
    for &b in bytes {
        match b {
            b'\\' => out.push_str("\\\\"),
            b'\'' => out.push_str("\\'"),
            b'\n' => out.push_str("\\n"),
            b'\r' => out.push_str("\\r"),
            b'\t' => out.push_str("\\t"),
            0x20..=0x7e => out.push(char::from(b)),
            _ => out.push_str(&format!("\\x{b:02x}")),
        }
    }
    out.push('\'');
}

/// Parse a dump back into batches
pub fn parse_dump(text: &str) -> Result<Vec<Batch>> {
    match all_consuming(terminated(dump, ws))(text) {
        Ok((_, batches)) => Ok(batches),
        Err(nom::Err::Error(e)) | Err(nom::Err::Failure(e)) => {
            let offset = text.len() - e.input.len();
            Err(NflogError::DumpParse {
                line: text[..offset].matches('\n').count() + 1,
                message: format!("unexpected input near {:?}", preview(e.input)),
            })
        }
        Err(nom::Err::Incomplete(_)) => Err(NflogError::DumpParse {
            line: text.matches('\n').count() + 1,
            message: "unexpected end of input".to_string(),
        }),
    }
}

/// Read and parse a dump file
pub fn read_dump(path: impl AsRef<Path>) -> Result<Vec<Batch>> {
    let text = std::fs::read_to_string(path)?;
    parse_dump(&text)
}

fn preview(input: &str) -> String {
    input.chars().take(24).collect()
}

/// Whitespace and `#` comments
fn ws(input: &str) -> IResult<&str, ()> {
    value(
        (),
        many0_count(alt((
            value((), multispace1),
            value((), pair(char('#'), not_line_ending)),
        ))),
    )(input)
}

/// `open item, item, ... [,] close`
///
/// Once `open` matches the list is committed, so errors point at the
/// offending item rather than the outermost bracket.
fn list<'a, O>(
    open: char,
    close: char,
    item: impl FnMut(&'a str) -> IResult<&'a str, O>,
) -> impl FnMut(&'a str) -> IResult<&'a str, Vec<O>> {
    preceded(
        preceded(ws, char(open)),
        cut(terminated(
            separated_list0(preceded(ws, char(',')), item),
            pair(opt(preceded(ws, char(','))), preceded(ws, char(close))),
        )),
    )
}

fn dump(input: &str) -> IResult<&str, Vec<Batch>> {
    list('[', ']', batch)(input)
}

fn batch(input: &str) -> IResult<&str, Batch> {
    list('[', ']', record)(input)
}

fn record(input: &str) -> IResult<&str, PacketRecord> {
    map(
        preceded(
            preceded(ws, char('(')),
            cut(terminated(
                separated_pair(verdict, preceded(ws, char(',')), attribute_tuple),
                pair(opt(preceded(ws, char(','))), preceded(ws, char(')'))),
            )),
        ),
        |(verdict, attrs)| PacketRecord::new(verdict, attrs),
    )(input)
}

fn verdict(input: &str) -> IResult<&str, u8> {
    preceded(ws, map_res(digit1, str::parse::<u8>))(input)
}

fn attribute_tuple(input: &str) -> IResult<&str, AttributeSet> {
    map_res(list('(', ')', attribute), |slots| {
        let mut attrs = AttributeSet::new();
        for (index, slot) in slots.into_iter().enumerate() {
            if let Some(payload) = slot {
                let index = u16::try_from(index).map_err(|_| "too many attribute slots")?;
                attrs.set(index, payload);
            }
        }
        Ok::<_, &str>(attrs)
    })(input)
}

fn attribute(input: &str) -> IResult<&str, Option<Vec<u8>>> {
    preceded(
        ws,
        alt((value(None, tag("None")), map(bytes_literal, Some))),
    )(input)
}

fn bytes_literal(input: &str) -> IResult<&str, Vec<u8>> {
    preceded(char('b'), alt((quoted('\''), quoted('"'))))(input)
}

fn quoted<'a>(quote: char) -> impl FnMut(&'a str) -> IResult<&'a str, Vec<u8>> {
    let plain = move |c: char| (' '..='~').contains(&c) && c != quote && c != '\\';
    let byte = alt((preceded(char('\\'), escape), map(satisfy(plain), |c| c as u8)));
    preceded(
        char(quote),
        cut(terminated(
            fold_many0(byte, Vec::new, |mut acc, b| {
                acc.push(b);
                acc
            }),
            char(quote),
        )),
    )
}

fn escape(input: &str) -> IResult<&str, u8> {
    alt((
        preceded(
            char('x'),
            map_res(
                take_while_m_n(2, 2, |c: char| c.is_ascii_hexdigit()),
                |hex| u8::from_str_radix(hex, 16),
            ),
        ),
        value(b'\\', char('\\')),
        value(b'\'', char('\'')),
        value(b'"', char('"')),
        value(b'\n', char('n')),
        value(b'\r', char('r')),
        value(b'\t', char('t')),
        value(0u8, char('0')),
    ))(input)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::packet::RecordBuilder;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_bytes_literal_escapes() {
        let mut out = String::new();
        push_bytes_literal(&mut out, b"a'\\\n\r\t\x00\xff~ ");
        assert_eq!(out, r"b'a\'\\\n\r\t\x00\xff~ '");
        assert_eq!(
            bytes_literal(&out).unwrap(),
            ("", b"a'\\\n\r\t\x00\xff~ ".to_vec())
        );
    }

    #[test]
    fn test_double_quoted_literal() {
        assert_eq!(
            bytes_literal(r#"b"it's\x01""#).unwrap(),
            ("", b"it's\x01".to_vec())
        );
    }

    #[test]
    fn test_unterminated_literal_is_failure() {
        assert!(matches!(bytes_literal("b'abc"), Err(nom::Err::Failure(_))));
        assert!(matches!(bytes_literal("b'\\q'"), Err(nom::Err::Failure(_))));
    }

    #[test]
    fn test_write_annotates_slots() {
        let record = RecordBuilder::new(1).payload(b"0123456789".to_vec()).build();
        let text = write_dump(&[vec![record]]);
        assert!(text.starts_with("[\n  [\n    (1, (\n      None,  # UNSPEC\n"));
        assert!(text.contains("      b'0123456789',  # PAYLOAD (10 bytes)\n"));
        assert!(text.contains("      None,  # L2HDR\n"));
        assert!(text.ends_with("    )),\n  ],\n]\n"));
    }

    #[test]
    fn test_parse_python_style_literal() {
        let text = "
            # captured on eth0
            [
              [ (0, (None, b'\\x08\\x00', None)), ],
              [],
            ]
        ";
        let batches = parse_dump(text).unwrap();
        assert_eq!(batches.len(), 2);
        assert_eq!(batches[0].len(), 1);
        assert_eq!(batches[0][0].verdict(), 0);
        assert_eq!(batches[0][0].attributes().get(1), Some(&[8u8, 0][..]));
        assert!(batches[1].is_empty());
    }

    #[test]
    fn test_parse_single_element_tuple() {
        let batches = parse_dump("[[(2, (b'',),)]]").unwrap();
        assert_eq!(batches[0][0].attributes().get(0), Some(&[][..]));
    }

    #[test]
    fn test_unknown_positions_roundtrip() {
        let record = RecordBuilder::new(3).raw(30, vec![1, 2]).build();
        let text = write_dump(&[vec![record.clone()]]);
        assert!(text.contains("# type 30 (2 bytes)"));
        assert!(text.contains("None,  # type 29"));
        assert_eq!(parse_dump(&text).unwrap(), vec![vec![record]]);
    }

    #[test]
    fn test_parse_error_reports_line() {
        let text = "[\n  [\n    (1, (None, b'\\xzz')),\n  ],\n]\n";
        match parse_dump(text) {
            Err(NflogError::DumpParse { line, .. }) => assert_eq!(line, 3),
            other => panic!("expected DumpParse, got {other:?}"),
        }
    }

    #[test]
    fn test_parse_rejects_verdict_overflow() {
        assert!(parse_dump("[[(256, (None,))]]").is_err());
    }

    #[test]
    fn test_dump_writer_streams() {
        let record = RecordBuilder::new(0).mark(7).build();
        let mut writer = DumpWriter::new(Vec::new()).unwrap();
        writer.write_batch(&vec![record.clone()]).unwrap();
        writer.write_batch(&Vec::new()).unwrap();
        assert_eq!(writer.batches(), 2);
        let bytes = writer.finish().unwrap();

        let text = String::from_utf8(bytes).unwrap();
        assert_eq!(text, write_dump(&[vec![record], vec![]]));
    }
}
