//! Builds the messages we send back: application ACKs, NAKs and bare response headers.
//!
//! Separators are fixed to `|^~\&` rather than mirrored from the request. Every request we
//! have seen uses the defaults, but a sender with custom encoding characters will get ours back.

use chrono::{Local, NaiveDateTime, Timelike, Utc};
use log::warn;

use crate::message::{Message, Segment, COMPONENT_SEPARATOR, ENCODING_CHARACTERS};

/// HL7 version stamped on messages that have no request to copy one from.
pub const DEFAULT_VERSION: &str = "2.4";
const PROCESSING_ID: &str = "P";
const SERIALS_PER_SECOND: u64 = 100;

/// An MSH-9 value, given either whole (`"MFK^M02"`) or as components (`["MFK", "M02"]`).
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MessageType(String);

impl MessageType {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for MessageType {
    fn from(value: &str) -> Self {
        MessageType(value.to_string())
    }
}

impl From<String> for MessageType {
    fn from(value: String) -> Self {
        MessageType(value)
    }
}

impl From<&[&str]> for MessageType {
    fn from(components: &[&str]) -> Self {
        MessageType(components.join(&COMPONENT_SEPARATOR.to_string()))
    }
}

impl<const N: usize> From<[&str; N]> for MessageType {
    fn from(components: [&str; N]) -> Self {
        MessageType::from(&components[..])
    }
}

/// Control id generator: `unix seconds * 100 + (calls mod 100)`.
///
/// Only unique for up to 100 ids in one wall-clock second, and it starts over on restart.
#[derive(Debug, Default)]
pub struct SerialCounter {
    rolling: u64,
    last_second: u64,
    issued_this_second: u64,
}

impl SerialCounter {
    pub fn new() -> Self {
        SerialCounter::default()
    }

    /// Issues the next serial for the given wall-clock second.
    pub fn next_at(&mut self, unix_seconds: u64) -> u64 {
        self.rolling = self.rolling.wrapping_add(1);

        if unix_seconds == self.last_second {
            self.issued_this_second += 1;
            if self.issued_this_second == SERIALS_PER_SECOND + 1 {
                warn!(
                    "More than {} control ids issued in second {}, ids are being reused",
                    SERIALS_PER_SECOND, unix_seconds
                );
            }
        } else {
            self.last_second = unix_seconds;
            self.issued_this_second = 1;
        }

        unix_seconds * SERIALS_PER_SECOND + self.rolling % SERIALS_PER_SECOND
    }
}

/// Formats a local time as `YYYYMMDDHHMMSS`.
///
/// A leap second is held at :59 instead of rendering as :60.
pub fn format_timestamp(time: NaiveDateTime) -> String {
    let clamped = time.with_nanosecond(0).unwrap_or(time);
    clamped.format("%Y%m%d%H%M%S").to_string()
}

/// Makes response messages, owning the serial counter they are numbered from.
#[derive(Debug, Default)]
pub struct ResponseBuilder {
    serials: SerialCounter,
}

impl ResponseBuilder {
    pub fn new() -> Self {
        ResponseBuilder::default()
    }

    /// Current local time as an HL7 `TS`.
    pub fn timestamp(&self) -> String {
        format_timestamp(Local::now().naive_local())
    }

    pub fn next_serial(&mut self) -> u64 {
        let now = u64::try_from(Utc::now().timestamp()).unwrap_or_default();
        self.serials.next_at(now)
    }

    /// Builds an application acknowledgement for `request`.
    ///
    /// The header is addressed back to whoever sent the request. Without a `message_type`
    /// the type is `ACK^<trigger event of the request>`, e.g. `ACK^M05`; pass something like
    /// `["MFK", "M01"]` for a master file acknowledgement instead.
    pub fn ack(
        &mut self,
        request: &Message,
        code: &str,
        description: &str,
        message_type: Option<MessageType>,
        extra_segments: Vec<Segment>,
    ) -> Message {
        let message_type = message_type
            .unwrap_or_else(|| MessageType::from(["ACK", request.component("MSH", 9, 2)]));
        let version = request.field("MSH", 12).to_string();

        let mut segments = vec![
            self.header_for(request, &message_type, &version),
            Segment::new(
                "MSA",
                [
                    code.to_uppercase().as_str(),
                    request.field("MSH", 10),
                    description,
                ],
            ),
        ];
        segments.extend(extra_segments);
        Message::new(segments)
    }

    /// Builds a negative acknowledgement with no request to answer, for example when the
    /// inbound text could not be parsed. Addressing fields are left empty.
    pub fn nak(&mut self, code: &str, description: &str, version: &str) -> Message {
        let serial = self.next_serial().to_string();
        let header = Segment::new(
            "MSH",
            [
                ENCODING_CHARACTERS,
                "",
                "",
                "",
                "",
                self.timestamp().as_str(),
                "",
                "ACK",
                serial.as_str(),
                PROCESSING_ID,
                version,
                "",
            ],
        );
        let msa = Segment::new("MSA", [code, "", description, ""]);
        Message::new(vec![header, msa])
    }

    /// A bare header addressed back to the sender of `request`, followed by `extra_segments`.
    /// Used to build business responses such as `MFK^M02`.
    pub fn response(
        &mut self,
        request: &Message,
        message_type: impl Into<MessageType>,
        version: &str,
        extra_segments: Vec<Segment>,
    ) -> Message {
        let mut response = Message::new(vec![self.header_for(request, &message_type.into(), version)]);
        extra_segments.into_iter().for_each(|segment| response.push(segment));
        response
    }

    // MSH with sender and receiver swapped relative to the request.
    fn header_for(&mut self, request: &Message, message_type: &MessageType, version: &str) -> Segment {
        let serial = self.next_serial().to_string();
        Segment::new(
            "MSH",
            [
                ENCODING_CHARACTERS,
                request.field("MSH", 5),
                request.field("MSH", 6),
                request.field("MSH", 3),
                request.field("MSH", 4),
                self.timestamp().as_str(),
                "",
                message_type.as_str(),
                serial.as_str(),
                PROCESSING_ID,
                version,
                "",
            ],
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;

    fn request() -> Message {
        Message::parse("MSH|^~\\&|A|FA|B|FB|20240101120000||MFN^M05|CTRL42|P|2.3\rMFI|||UPD\r")
            .unwrap()
    }

    #[test]
    fn ack_swaps_addressing() {
        let mut builder = ResponseBuilder::new();
        let ack = builder.ack(&request(), "AA", "TEST ACK", None, Vec::new());

        assert_eq!(ack.field("MSH", 3), "B");
        assert_eq!(ack.field("MSH", 4), "FB");
        assert_eq!(ack.field("MSH", 5), "A");
        assert_eq!(ack.field("MSH", 6), "FA");
    }

    #[test]
    fn ack_carries_request_details() {
        let mut builder = ResponseBuilder::new();
        let ack = builder.ack(&request(), "aa", "TEST ACK", None, Vec::new());

        assert_eq!(ack.field("MSH", 2), ENCODING_CHARACTERS);
        assert_eq!(ack.field("MSH", 9), "ACK^M05");
        assert_eq!(ack.field("MSH", 11), "P");
        assert_eq!(ack.field("MSH", 12), "2.3");
        assert_eq!(ack.field("MSH", 7).len(), 14);
        assert!(ack.field("MSH", 10).parse::<u64>().is_ok());
        assert_eq!(ack.field("MSA", 1), "AA");
        assert_eq!(ack.field("MSA", 2), "CTRL42");
        assert_eq!(ack.field("MSA", 3), "TEST ACK");
    }

    #[test]
    fn ack_accepts_message_type_override_and_extra_segments() {
        let mut builder = ResponseBuilder::new();
        let ack = builder.ack(
            &request(),
            "AA",
            "",
            Some(["MFK", "M01"].into()),
            vec![Segment::new("MFI", ["", "", "UPD"])],
        );

        assert_eq!(ack.field("MSH", 9), "MFK^M01");
        let codes: Vec<&str> = ack.segments().iter().map(Segment::code).collect();
        assert_eq!(codes, ["MSH", "MSA", "MFI"]);
    }

    #[test]
    fn nak_has_empty_addressing() {
        let mut builder = ResponseBuilder::new();
        let nak = builder.nak("AE", "BAD REQUEST", DEFAULT_VERSION);

        for ordinal in 3..=6 {
            assert_eq!(nak.field("MSH", ordinal), "");
        }
        assert_eq!(nak.field("MSH", 9), "ACK");
        assert_eq!(nak.field("MSH", 12), "2.4");
        assert_eq!(nak.field("MSA", 1), "AE");
        assert_eq!(nak.field("MSA", 2), "");
        assert_eq!(nak.field("MSA", 3), "BAD REQUEST");
        assert!(nak.to_string().starts_with("MSH|^~\\&|||||"));
    }

    #[test]
    fn response_is_a_bare_header() {
        let mut builder = ResponseBuilder::new();
        let resp = builder.response(
            &request(),
            "MFK^M02",
            DEFAULT_VERSION,
            vec![Segment::new("MFA", ["MAD", "", "", "AA"])],
        );

        assert!(resp.segment("MSA").is_none());
        assert_eq!(resp.field("MSH", 3), "B");
        assert_eq!(resp.field("MSH", 5), "A");
        assert_eq!(resp.field("MSH", 9), "MFK^M02");
        assert_eq!(resp.field("MSH", 12), "2.4");
        assert_eq!(resp.field("MFA", 4), "AA");
    }

    #[test]
    fn serials_are_distinct_for_one_hundred_per_second() {
        let mut serials = SerialCounter::new();
        let second = 1_700_000_000;

        let issued: Vec<u64> = (0..100).map(|_| serials.next_at(second)).collect();
        let mut unique = issued.clone();
        unique.sort_unstable();
        unique.dedup();
        assert_eq!(unique.len(), 100);
        assert!(issued.iter().all(|s| s / 100 == second));

        let wrapped = serials.next_at(second);
        assert_eq!(wrapped, issued[0]);
    }

    #[test]
    fn serial_tracks_the_clock() {
        let mut serials = SerialCounter::new();
        assert_eq!(serials.next_at(10), 1001);
        assert_eq!(serials.next_at(11), 1102);
    }

    #[test]
    fn timestamp_has_fourteen_digits() {
        let builder = ResponseBuilder::new();
        let ts = builder.timestamp();
        assert_eq!(ts.len(), 14);
        assert!(ts.chars().all(|c| c.is_ascii_digit()));
    }

    #[test]
    fn leap_second_is_clamped() {
        let leap = NaiveDate::from_ymd_opt(2016, 12, 31)
            .unwrap()
            .and_hms_milli_opt(23, 59, 59, 1_500)
            .unwrap();
        assert_eq!(format_timestamp(leap), "20161231235959");
    }

    #[test]
    fn message_type_from_components() {
        assert_eq!(MessageType::from(["MFK", "M02"]).as_str(), "MFK^M02");
        assert_eq!(MessageType::from("ACK").as_str(), "ACK");
    }
}
