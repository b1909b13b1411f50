/*!
# An HL7v2 bridge speaking the MLLP network protocol.

 HL7's MLLP is a simple, single-byte-text based protocol for framing HL7 messages over a TCP (or similar) transport.
 The full specification is available at [the HL7 site](https://www.hl7.org/documentcenter/private/standards/v3/V3_TRMLLP_R2_R2019.zip) (Note that they place the standards behind a free membership/login form).

 This crate terminates MLLP connections, routes every inbound message to an application handler picked
 from an ordered table of regular expressions, and builds the HL7 ACK/NAK/response messages that go back.

 The pieces, from the wire up:
 - [`MllpCodec`]: a [tokio codec](https://docs.rs/tokio-util/latest/tokio_util/codec/index.html) for MLLP frames.
 - [`Message`]: a minimal segment/field view of an HL7 message.
 - [`ResponseBuilder`]: ACKs, NAKs and bare response headers, with control ids and timestamps.
 - [`Dispatcher`]: the ordered routing table.
 - [`Hl7Service`]: parse, dispatch and always answer, turning every failure into an `AE` NAK.
 - [`Multiplexer`]: the single-task server loop over all listeners and connections.

 ## Example
 ```no_run
use std::sync::Arc;

use hl7_mllp_bridge::{
    Dispatcher, HandlerRegistry, HandlerResult, Hl7Service, ListenerConfig, Message,
    Multiplexer, ResponseBuilder, RouteArgs, Rule,
};

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let mut registry = HandlerRegistry::new();
    registry.register("staff", |req: &Message, _args: &RouteArgs, responses: &mut ResponseBuilder| -> HandlerResult {
        Ok(Some(responses.ack(req, "AA", "", Some(["MFK", "M05"].into()), Vec::new())))
    });

    let dispatcher = Dispatcher::new(vec![Rule::named(r"MFN\^M05/.*", "staff")?], registry);
    dispatcher.resolve_all()?;

    let mut server = Multiplexer::bind(
        vec![ListenerConfig::receive_only("127.0.0.1:2575").auto_ack(true)],
        Hl7Service::new(Arc::new(dispatcher)),
    )
    .await?;
    server.run().await;
    Ok(())
}
```
 */

pub mod codec;
pub mod config;
pub mod dispatch;
pub mod error;
pub mod message;
pub mod outbound;
pub mod poller;
pub mod response;
pub mod server;
pub mod service;

pub use codec::{Control, MllpCodec, MllpFrame};
pub use config::{BridgeConfig, ListenerConfig, Mode, RuleConfig};
pub use dispatch::{
    routing_key, Dispatcher, Handler, HandlerRef, HandlerRegistry, HandlerResult, RouteArgs, Rule,
};
pub use error::{ConfigError, DispatchError, HandlerError, MllpError, OutboundError, ParseError};
pub use message::{Hl7Parser, Message, Parser, Segment};
pub use outbound::OutboundHandle;
pub use response::{MessageType, ResponseBuilder, SerialCounter, DEFAULT_VERSION};
pub use server::Multiplexer;
pub use service::{Hl7Service, ReceiveHandler};
