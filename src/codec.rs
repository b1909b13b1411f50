//! The MLLP frame codec.
//!
//! Frames look like `<VT> content <FS><CR>`. Content is restricted to bytes at or above
//! 0x20 plus the carriage return, which keeps the block markers unambiguous.

use std::time::Instant;

use bytes::buf::{Buf, BufMut};
use bytes::BytesMut;
use log::{debug, trace, warn};
use tokio_util::codec::*;

use crate::error::MllpError;

const BLOCK_HEADER: u8 = 0x0B; //Vertical-Tab char, the marker for the start of a message
const BLOCK_FOOTER: [u8; 2] = [0x1C, 0x0D]; //File-Separator char + CR, the marker for the end of a message
const CARRIAGE_RETURN: u8 = 0x0D;
const MIN_CONTENT: u8 = 0x20; // everything below this (bar CR) is framing or control

/// Protocol level acknowledgement bytes, sent as the sole content of a frame.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Control {
    Ack,
    Nak,
}

impl Control {
    pub const fn byte(self) -> u8 {
        match self {
            Control::Ack => 0x06,
            Control::Nak => 0x15,
        }
    }

    fn from_content(content: &[u8]) -> Option<Control> {
        match content {
            [0x06] => Some(Control::Ack),
            [0x15] => Some(Control::Nak),
            _ => None,
        }
    }
}

/// A unit produced by the decoder.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum MllpFrame {
    /// The content found between the block markers.
    Content(BytesMut),
    /// A bare ACK/NAK control frame.
    Control(Control),
    /// A chunk that arrived without any start marker, passed through untouched.
    Unframed(BytesMut),
}

/// The state of our state machine
#[derive(Clone, Copy, Debug, PartialEq)]
enum ParseState {
    /// We are waiting for a StartBlock byte to indicate a new message
    WaitingForStartBlock,
    /// All data is considered message data, we're waiting to see an End Block byte
    ReadingData { started: Instant },
}

/// Codec for MLLP framed streams, used with a tokio [`Framed`].
#[derive(Debug)]
pub struct MllpCodec {
    state: ParseState,
    // how far into the pending data we have already searched for the footer
    scanned: usize,
    // the footer CR can arrive in a later read than the FS byte
    expecting_cr: bool,
}

impl Default for MllpCodec {
    fn default() -> Self {
        MllpCodec::new()
    }
}

impl MllpCodec {
    /// Creates a new Codec instance, generally for use within a
    /// [Tokio Framed](https://docs.rs/tokio-util/latest/tokio_util/codec/struct.Framed.html),
    /// but can be instantiated standalone for testing purposes etc.
    /// ```
    /// use hl7_mllp_bridge::MllpCodec;
    /// let mllp = MllpCodec::new();
    /// assert!(!mllp.is_mid_frame());
    /// ```
    pub fn new() -> Self {
        MllpCodec {
            state: ParseState::WaitingForStartBlock,
            scanned: 0,
            expecting_cr: false,
        }
    }

    /// Whether a start block has been seen without its matching end block yet.
    pub fn is_mid_frame(&self) -> bool {
        matches!(self.state, ParseState::ReadingData { .. })
    }

    /// When the partial frame currently being assembled started, if any.
    pub fn frame_started(&self) -> Option<Instant> {
        match self.state {
            ParseState::ReadingData { started } => Some(started),
            ParseState::WaitingForStartBlock => None,
        }
    }

    /// Checks content against the MLLP byte rules, reporting the first offender.
    pub fn validate(content: &[u8]) -> Result<(), MllpError> {
        match content
            .iter()
            .position(|b| *b < MIN_CONTENT && *b != CARRIAGE_RETURN)
        {
            Some(offset) => Err(MllpError::InvalidContent {
                offset,
                byte: content[offset],
            }),
            None => Ok(()),
        }
    }

    fn take_frame(&mut self, src: &mut BytesMut, end_offset: usize) -> Result<MllpFrame, MllpError> {
        let content = src.split_to(end_offset);
        src.advance(1); // the FS byte
        self.state = ParseState::WaitingForStartBlock;
        self.scanned = 0;

        if src.first() == Some(&BLOCK_FOOTER[1]) {
            src.advance(1);
        } else {
            self.expecting_cr = true;
        }

        if let Some(control) = Control::from_content(&content) {
            trace!("MLLP: Found control frame {:?}", control);
            return Ok(MllpFrame::Control(control));
        }

        MllpCodec::validate(&content)?;
        Ok(MllpFrame::Content(content))
    }
}

// Support encoding data as an MLLP Frame.
// This is used for both the HL7 messages we send back, and any outbound duplex traffic.
impl Encoder<BytesMut> for MllpCodec {
    type Error = MllpError;

    fn encode(&mut self, event: BytesMut, dst: &mut BytesMut) -> Result<(), Self::Error> {
        MllpCodec::validate(&event)?;

        let needs_cr = event.last() != Some(&CARRIAGE_RETURN);
        dst.reserve(event.len() + 4); //header, optional CR and the footer
        dst.put_u8(BLOCK_HEADER); //header

        dst.put_slice(&event); //data
        if needs_cr {
            dst.put_u8(CARRIAGE_RETURN);
        }

        dst.put_slice(&BLOCK_FOOTER); //footer

        debug!("MLLP: Encoded value for send: '{:?}'", dst);
        Ok(())
    }
}

// Control frames skip the content rules.
impl Encoder<Control> for MllpCodec {
    type Error = MllpError;

    fn encode(&mut self, control: Control, dst: &mut BytesMut) -> Result<(), Self::Error> {
        dst.reserve(4);
        dst.put_u8(BLOCK_HEADER);
        dst.put_u8(control.byte());
        dst.put_slice(&BLOCK_FOOTER);

        trace!("MLLP: Encoded control frame {:?}", control);
        Ok(())
    }
}

// Support decoding data from an MLLP Frame.
// This is used for receiving HL7 messages, and also decoding any ACK/NAK responses on the send side.
impl Decoder for MllpCodec {
    type Item = MllpFrame;
    type Error = MllpError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        if self.expecting_cr && !src.is_empty() {
            if src[0] == BLOCK_FOOTER[1] {
                src.advance(1);
            }
            self.expecting_cr = false;
        }

        if self.state == ParseState::WaitingForStartBlock {
            if src.is_empty() {
                return Ok(None);
            }

            match src.iter().position(|b| *b == BLOCK_HEADER) {
                Some(start_offset) => {
                    trace!("MLLP: Found message header at index {}", start_offset);
                    src.advance(start_offset + 1); // skip anything before the header, and the header itself
                    self.state = ParseState::ReadingData {
                        started: Instant::now(),
                    };
                    self.scanned = 0;
                }
                None => {
                    warn!(
                        "MLLP: No start block found in {} byte chunk, passing it through as is",
                        src.len()
                    );
                    return Ok(Some(MllpFrame::Unframed(src.split())));
                }
            }
        }

        match src[self.scanned..]
            .iter()
            .position(|b| *b == BLOCK_FOOTER[0])
        {
            Some(relative) => {
                let end_offset = self.scanned + relative;
                trace!("MLLP: Found footer at index {}", end_offset);
                self.take_frame(src, end_offset).map(Some)
            }
            None => {
                trace!("MLLP: Unable to find footer...");
                self.scanned = src.len();
                Ok(None)
            }
        }
    }

    fn decode_eof(&mut self, buf: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        match self.decode(buf)? {
            Some(frame) => Ok(Some(frame)),
            None => {
                if self.is_mid_frame() {
                    warn!(
                        "MLLP: Connection closed part way through a frame, dropping {} bytes",
                        buf.len()
                    );
                }
                buf.clear();
                self.state = ParseState::WaitingForStartBlock;
                self.scanned = 0;
                Ok(None)
            }
        }
    }
}

//////////////////////////////////////////////////////////////////////////////////////////////////////////////////////////////////////
#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;

    fn wrap_for_mllp(s: &str) -> Bytes {
        Bytes::from(format!("\x0B{}\x1C\x0D", s))
    }

    fn wrap_for_mllp_mut(s: &str) -> BytesMut {
        BytesMut::from(format!("\x0B{}\x1C\x0D", s).as_str())
    }

    fn content(frame: Result<Option<MllpFrame>, MllpError>) -> BytesMut {
        match frame {
            Ok(Some(MllpFrame::Content(message))) => message,
            other => panic!("Expected a content frame, got {:?}", other),
        }
    }

    #[test]
    fn implements_default() {
        let m = MllpCodec::default();
        assert!(!m.is_mid_frame());
    }

    #[test]
    fn wraps_simple_data() {
        let data = BytesMut::from("abcd\r");
        let mut m = MllpCodec::new();

        let mut output_buf = BytesMut::with_capacity(64);

        match m.encode(data, &mut output_buf) {
            Ok(()) => {}
            _ => panic!("Non OK value returned from encode"),
        }
        let encoded_msg = output_buf.freeze();
        assert_eq!(encoded_msg, wrap_for_mllp("abcd\r"));
    }

    #[test]
    fn encode_terminates_content_with_cr() {
        let mut m = MllpCodec::new();
        let mut output_buf = BytesMut::new();

        m.encode(BytesMut::from("abcd"), &mut output_buf).unwrap();
        assert_eq!(&output_buf[..], b"\x0Babcd\r\x1C\x0D");
    }

    #[test]
    fn encode_rejects_low_bytes() {
        let mut m = MllpCodec::new();
        let mut output_buf = BytesMut::new();

        match m.encode(BytesMut::from("ab\ncd"), &mut output_buf) {
            Err(MllpError::InvalidContent { offset, byte }) => {
                assert_eq!(offset, 2);
                assert_eq!(byte, b'\n');
            }
            other => panic!("Expected invalid content, got {:?}", other),
        }
        assert!(output_buf.is_empty(), "Nothing may be written for invalid content");
    }

    #[test]
    fn encodes_control_frames() {
        let mut m = MllpCodec::new();
        let mut output_buf = BytesMut::new();

        m.encode(Control::Ack, &mut output_buf).unwrap();
        m.encode(Control::Nak, &mut output_buf).unwrap();
        assert_eq!(&output_buf[..], b"\x0B\x06\x1C\x0D\x0B\x15\x1C\x0D");
    }

    #[test]
    fn ensure_decoder_finds_simple_message() {
        let mut data = wrap_for_mllp_mut("abcd");
        let mut m = MllpCodec::new();

        assert_eq!(&content(m.decode(&mut data))[..], b"abcd");
    }

    #[test]
    fn decodes_control_frames() {
        let mut m = MllpCodec::new();
        let mut data = BytesMut::from("\x0B\x06\x1C\x0D\x0B\x15\x1C\x0D");

        assert_eq!(
            m.decode(&mut data).unwrap(),
            Some(MllpFrame::Control(Control::Ack))
        );
        assert_eq!(
            m.decode(&mut data).unwrap(),
            Some(MllpFrame::Control(Control::Nak))
        );
        assert!(data.is_empty());
    }

    #[test]
    fn passes_through_chunk_without_header() {
        let mut m = MllpCodec::new();
        let mut data = BytesMut::from("MSH|^~\\&|no framing at all\r");

        match m.decode(&mut data) {
            Ok(Some(MllpFrame::Unframed(raw))) => {
                assert_eq!(&raw[..], b"MSH|^~\\&|no framing at all\r")
            }
            other => panic!("Expected an unframed pass through, got {:?}", other),
        }
        assert!(data.is_empty());
    }

    #[test]
    fn discards_bytes_before_header() {
        let mut m = MllpCodec::new();
        let mut data = BytesMut::from("junk\x0BTest Data\x1C\x0D");

        assert_eq!(&content(m.decode(&mut data))[..], b"Test Data");
    }

    #[test]
    fn decode_rejects_low_bytes() {
        let mut m = MllpCodec::new();
        let mut data = BytesMut::from("\x0BTest\x07Data\x1C\x0D");

        match m.decode(&mut data) {
            Err(MllpError::InvalidContent { offset: 4, byte: 0x07 }) => {}
            other => panic!("Expected invalid content, got {:?}", other),
        }
    }

    #[test]
    fn ensure_no_data_is_left_on_the_stream() {
        let mut data = BytesMut::from("\x0BTest Data\x1C\x0D");
        let mut m = MllpCodec::new();

        let _result = m.decode(&mut data);

        assert_eq!(
            data.len(),
            0,
            "Decoder left data sitting in the buffer after read!"
        );
    }

    #[test]
    fn decodes_back_to_back_messages() {
        let mut mllp = MllpCodec::new();
        let mut data = wrap_for_mllp_mut("Test Data");
        data.extend_from_slice(&wrap_for_mllp("This is different"));

        assert_eq!(&content(mllp.decode(&mut data))[..], b"Test Data");
        assert_eq!(&content(mllp.decode(&mut data))[..], b"This is different");
        assert_eq!(mllp.decode(&mut data).unwrap(), None);
    }

    #[test]
    fn test_real_message() {
        let mut mllp = MllpCodec::new();
        let mut data = wrap_for_mllp_mut("MSH|^~\\&|ZIS|1^AHospital|||200405141144||¶ADT^A01|20041104082400|P|2.3|||AL|NE|||8859/15|¶EVN|A01|20041104082400.0000+0100|20041104082400¶PID||\"\"|10||Vries^Danny^D.^^de||19951202|M|||Rembrandlaan^7^Leiden^^7301TH^\"\"^^P||\"\"|\"\"||\"\"|||||||\"\"|\"\"¶PV1||I|3w^301^\"\"^01|S|||100^van den Berg^^A.S.^^\"\"^dr|\"\"||9||||H||||20041104082400.0000+0100");

        assert_eq!(content(mllp.decode(&mut data)).len(), 338);
    }

    #[test]
    fn test_message_split_over_multiple_calls() {
        // the framed read buffer keeps growing between calls until the footer turns up
        let mut mllp = MllpCodec::new();
        let mut data = BytesMut::new();

        for chunk in ["\x0BTest", " Data", " Here\x1C"] {
            match mllp.decode(&mut data) {
                Ok(None) => {}
                other => panic!("Data returned from call to decode() without footer! {:?}", other),
            }
            data.extend_from_slice(chunk.as_bytes());
        }

        assert_eq!(&content(mllp.decode(&mut data))[..], b"Test Data Here");

        // the trailing CR arrives on its own and must not show up as an unframed chunk
        data.extend_from_slice(b"\x0D");
        assert_eq!(mllp.decode(&mut data).unwrap(), None);
        assert!(data.is_empty());
    }

    #[test]
    fn split_frames_decode_identically_at_every_boundary() {
        let whole = wrap_for_mllp_mut("MSH|^~\\&|A|FA|B|FB|||MFN^M05|1|P|2.4\rMFI|||UPD\r");

        for split in 1..whole.len() {
            let mut mllp = MllpCodec::new();
            let mut data = BytesMut::from(&whole[..split]);
            let first = mllp.decode(&mut data).unwrap();
            assert!(
                first.is_none() || split == whole.len() - 1,
                "Split at {} produced {:?}",
                split,
                first
            );
            let frame = match first {
                Some(frame) => frame,
                None => {
                    data.extend_from_slice(&whole[split..]);
                    mllp.decode(&mut data).unwrap().expect("frame after second chunk")
                }
            };
            assert_eq!(
                frame,
                MllpFrame::Content(BytesMut::from("MSH|^~\\&|A|FA|B|FB|||MFN^M05|1|P|2.4\rMFI|||UPD\r"))
            );
        }
    }

    #[test]
    fn round_trips_valid_content() {
        let samples = ["x", "MSH|^~\\&|A\rPID|1\r", "ends without cr", "\r"];

        for sample in samples {
            let mut mllp = MllpCodec::new();
            let mut wire = BytesMut::new();
            mllp.encode(BytesMut::from(sample), &mut wire).unwrap();

            let decoded = content(mllp.decode(&mut wire));
            let expected = if sample.ends_with('\r') {
                sample.to_string()
            } else {
                format!("{}\r", sample)
            };
            assert_eq!(&decoded[..], expected.as_bytes());
        }
    }

    #[test]
    fn tracks_partial_frames() {
        let mut mllp = MllpCodec::new();
        let mut data = BytesMut::from("\x0Bpartial");

        assert_eq!(mllp.decode(&mut data).unwrap(), None);
        assert!(mllp.is_mid_frame());
        assert!(mllp.frame_started().is_some());

        data.extend_from_slice(b" done\x1C\x0D");
        content(mllp.decode(&mut data));
        assert!(!mllp.is_mid_frame());
    }

    #[test]
    fn eof_drops_partial_frame() {
        let mut mllp = MllpCodec::new();
        let mut data = BytesMut::from("\x0Bnever finished");

        assert_eq!(mllp.decode_eof(&mut data).unwrap(), None);
        assert!(data.is_empty());
        assert!(!mllp.is_mid_frame());
    }
}
