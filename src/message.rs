//! A deliberately small HL7v2 message model.
//!
//! The bridge only needs read access to segments and fields by position, so this is not
//! a grammar-aware parser. Anything implementing [`Parser`] can stand in for it.

use std::fmt;

use crate::error::ParseError;

/// Field separator used for every message we build.
pub const FIELD_SEPARATOR: char = '|';
/// MSH-2 for every message we build: component, repetition, escape and sub-component.
pub const ENCODING_CHARACTERS: &str = "^~\\&";
pub const COMPONENT_SEPARATOR: char = '^';
pub const SEGMENT_SEPARATOR: char = '\r';

/// Turns inbound text into a [`Message`], or reports why it can't.
pub trait Parser {
    fn parse(&self, text: &str) -> Result<Message, ParseError>;
}

/// The built in parser, see [`Message::parse`].
#[derive(Clone, Copy, Debug, Default)]
pub struct Hl7Parser;

impl Parser for Hl7Parser {
    fn parse(&self, text: &str) -> Result<Message, ParseError> {
        Message::parse(text)
    }
}

/// One segment, held as its raw fields. `fields[0]` is the segment code.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Segment {
    fields: Vec<String>,
}

impl Segment {
    /// Builds a segment from its code and the following fields, in order.
    ///
    /// For `MSH` the first field after the code is MSH-2, the field separator itself is
    /// implied, matching how the segment looks on the wire.
    pub fn new<I, S>(code: &str, fields: I) -> Segment
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut all = vec![code.to_string()];
        all.extend(fields.into_iter().map(Into::into));
        Segment { fields: all }
    }

    pub fn code(&self) -> &str {
        &self.fields[0]
    }

    /// Field by its HL7 ordinal (`PID-3` is `field(3)`). Missing fields read as empty.
    ///
    /// `MSH-1` is the field separator, so MSH ordinals are shifted by one against the
    /// split text.
    pub fn field(&self, ordinal: usize) -> &str {
        if self.code() == "MSH" {
            return match ordinal {
                0 => self.code(),
                1 => "|",
                n => self.fields.get(n - 1).map_or("", String::as_str),
            };
        }
        self.fields.get(ordinal).map_or("", String::as_str)
    }

    /// Component of a field, 1-based like the HL7 `MSH-9.2` notation.
    pub fn component(&self, ordinal: usize, component: usize) -> &str {
        if component == 0 {
            return "";
        }
        self.field(ordinal)
            .split(COMPONENT_SEPARATOR)
            .nth(component - 1)
            .unwrap_or("")
    }
}

impl fmt::Display for Segment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, field) in self.fields.iter().enumerate() {
            if i > 0 {
                write!(f, "{}", FIELD_SEPARATOR)?;
            }
            f.write_str(field)?;
        }
        Ok(())
    }
}

/// An ordered list of segments.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Message {
    segments: Vec<Segment>,
}

impl Message {
    pub fn new(segments: Vec<Segment>) -> Message {
        Message { segments }
    }

    /// Parses pipe delimited HL7 text.
    ///
    /// Segments are split on CR, tolerating LF and CRLF endings that creep in when
    /// messages are pasted around. The first segment has to be an `MSH` declaring its
    /// separators. Only the `|` field separator is understood.
    pub fn parse(text: &str) -> Result<Message, ParseError> {
        let mut lines = text
            .split(|c| c == '\r' || c == '\n')
            .filter(|line| !line.trim().is_empty());

        let header = lines.next().ok_or(ParseError::Empty)?;
        if !header.starts_with("MSH") {
            return Err(ParseError::MissingHeader(
                header.chars().take(3).collect(),
            ));
        }
        if header.len() < 8 || !header[3..].starts_with(FIELD_SEPARATOR) {
            return Err(ParseError::MissingSeparators);
        }

        let mut segments = Vec::new();
        for line in std::iter::once(header).chain(lines) {
            let fields: Vec<String> = line.split(FIELD_SEPARATOR).map(str::to_string).collect();
            let code = &fields[0];
            if code.len() != 3 || !code.chars().all(|c| c.is_ascii_alphanumeric()) {
                return Err(ParseError::InvalidSegment(code.clone()));
            }
            segments.push(Segment { fields });
        }

        Ok(Message { segments })
    }

    pub fn segments(&self) -> &[Segment] {
        &self.segments
    }

    /// First segment with the given code.
    pub fn segment(&self, code: &str) -> Option<&Segment> {
        self.segments.iter().find(|s| s.code() == code)
    }

    /// Field of the first matching segment, empty when either is missing.
    pub fn field(&self, code: &str, ordinal: usize) -> &str {
        self.segment(code).map_or("", |s| s.field(ordinal))
    }

    pub fn component(&self, code: &str, ordinal: usize, component: usize) -> &str {
        self.segment(code)
            .map_or("", |s| s.component(ordinal, component))
    }

    pub fn push(&mut self, segment: Segment) {
        self.segments.push(segment);
    }
}

impl fmt::Display for Message {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for segment in &self.segments {
            write!(f, "{}{}", segment, SEGMENT_SEPARATOR)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MFN: &str = "MSH|^~\\&|SENDAPP|SENDFAC|HL|FAC1|20240101120000||MFN^M05|HEALTHLINKID|P|2.4\rMFI|||UPD|||AL\rSTF|||Gill^Gill^^^Kevin^MD^B||||A|||||19660429\r";

    #[test]
    fn reads_header_fields_by_ordinal() {
        let msg = Message::parse(MFN).unwrap();

        assert_eq!(msg.field("MSH", 1), "|");
        assert_eq!(msg.field("MSH", 2), "^~\\&");
        assert_eq!(msg.field("MSH", 3), "SENDAPP");
        assert_eq!(msg.field("MSH", 6), "FAC1");
        assert_eq!(msg.field("MSH", 9), "MFN^M05");
        assert_eq!(msg.component("MSH", 9, 2), "M05");
        assert_eq!(msg.field("MSH", 10), "HEALTHLINKID");
        assert_eq!(msg.field("MSH", 12), "2.4");
        assert_eq!(msg.field("MSH", 40), "");
    }

    #[test]
    fn reads_body_fields_by_ordinal() {
        let msg = Message::parse(MFN).unwrap();

        assert_eq!(msg.field("MFI", 3), "UPD");
        assert_eq!(msg.component("STF", 3, 5), "Kevin");
        assert_eq!(msg.field("PID", 3), "");
        assert_eq!(msg.segments().len(), 3);
    }

    #[test]
    fn renders_back_to_wire_text() {
        let msg = Message::parse(MFN).unwrap();
        assert_eq!(msg.to_string(), MFN);
    }

    #[test]
    fn tolerates_newline_segment_endings() {
        let msg = Message::parse("MSH|^~\\&|A|B\r\nPID|1\n").unwrap();
        assert_eq!(msg.field("PID", 1), "1");
    }

    #[test]
    fn rejects_non_hl7_text() {
        assert!(matches!(Message::parse(""), Err(ParseError::Empty)));
        assert!(matches!(
            Message::parse("hello world"),
            Err(ParseError::MissingHeader(_))
        ));
        assert!(matches!(
            Message::parse("MSH"),
            Err(ParseError::MissingSeparators)
        ));
        assert!(matches!(
            Message::parse("MSH|^~\\&|A\rTOOLONG|1"),
            Err(ParseError::InvalidSegment(_))
        ));
    }

    #[test]
    fn built_msh_segments_number_like_parsed_ones() {
        let seg = Segment::new("MSH", ["^~\\&", "APP", "FAC"]);
        assert_eq!(seg.field(3), "APP");
        assert_eq!(seg.to_string(), "MSH|^~\\&|APP|FAC");
    }
}
