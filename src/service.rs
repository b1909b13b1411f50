//! The per-frame callback the server hands every inbound message to.

use std::sync::Arc;

use bytes::Bytes;
use log::{debug, error};

use crate::codec::MllpCodec;
use crate::dispatch::Dispatcher;
use crate::message::{Hl7Parser, Parser};
use crate::response::{ResponseBuilder, DEFAULT_VERSION};

pub const PARSE_FAILURE_TEXT: &str = "UNABLE TO PARSE REQUEST";
pub const INTERNAL_ERROR_TEXT: &str = "INTERNAL ERROR PROCESSING REQUEST";

/// Receives the content of each completed frame and returns the payload to send back, if any.
pub trait ReceiveHandler {
    fn on_frame(&mut self, frame: &[u8]) -> Option<Bytes>;
}

impl<F> ReceiveHandler for F
where
    F: FnMut(&[u8]) -> Option<Bytes>,
{
    fn on_frame(&mut self, frame: &[u8]) -> Option<Bytes> {
        self(frame)
    }
}

/// Parses, dispatches and always answers: every failure turns into an `AE` NAK.
#[derive(Debug)]
pub struct Hl7Service<P = Hl7Parser> {
    parser: P,
    dispatcher: Arc<Dispatcher>,
    responses: ResponseBuilder,
}

impl Hl7Service<Hl7Parser> {
    pub fn new(dispatcher: Arc<Dispatcher>) -> Self {
        Hl7Service::with_parser(Hl7Parser, dispatcher)
    }
}

impl<P: Parser> Hl7Service<P> {
    pub fn with_parser(parser: P, dispatcher: Arc<Dispatcher>) -> Self {
        Hl7Service {
            parser,
            dispatcher,
            responses: ResponseBuilder::new(),
        }
    }

    /// Produces the reply text for one inbound message.
    pub fn handle(&mut self, frame: &[u8]) -> String {
        let text = String::from_utf8_lossy(frame);
        debug!("RECV: {}", printable(&text));

        let request = match self.parser.parse(&text) {
            Ok(request) => request,
            Err(err) => {
                error!("Error parsing message: {}", err);
                return logged(self.nak(PARSE_FAILURE_TEXT));
            }
        };

        let response = match self.dispatcher.dispatch(&request, &mut self.responses) {
            Ok(response) => response.to_string(),
            Err(err) => {
                error!("Error dispatching message: {}", err);
                return logged(self.nak(INTERNAL_ERROR_TEXT));
            }
        };

        if let Err(err) = MllpCodec::validate(response.as_bytes()) {
            error!("Handler response can't be sent over MLLP: {}", err);
            return logged(self.nak(INTERNAL_ERROR_TEXT));
        }
        logged(response)
    }

    fn nak(&mut self, text: &str) -> String {
        self.responses.nak("AE", text, DEFAULT_VERSION).to_string()
    }
}

impl<P: Parser> ReceiveHandler for Hl7Service<P> {
    fn on_frame(&mut self, frame: &[u8]) -> Option<Bytes> {
        Some(Bytes::from(self.handle(frame)))
    }
}

fn logged(response: String) -> String {
    debug!("SEND: {}", printable(&response));
    response
}

// segments one per line in the logs
fn printable(text: &str) -> String {
    text.replace('\r', "\n")
}
