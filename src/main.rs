//! `hl7-bridge`: runs the MLLP bridge from a TOML configuration file.
//!
//! The rule table may only name the built in handlers registered below. Real deployments
//! embed the library and register their own.

use std::error::Error;
use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use log::{debug, info};

use hl7_mllp_bridge::{
    BridgeConfig, HandlerRegistry, HandlerResult, Hl7Service, Message, MessageType,
    Multiplexer, ResponseBuilder, RouteArgs,
};

#[derive(Debug, Parser)]
#[command(name = "hl7-bridge", about = "Route HL7v2 messages received over MLLP")]
struct Args {
    /// Path to the TOML configuration file.
    #[arg(short, long, default_value = "hl7-bridge.toml")]
    config: PathBuf,

    /// Log filter used when RUST_LOG is not set.
    #[arg(long, default_value = "info")]
    log_level: String,
}

/// `AA` acknowledgement. Rule args: `message_type` overrides `ACK^<event>`, `text` fills MSA-3.
fn accept(request: &Message, args: &RouteArgs, responses: &mut ResponseBuilder) -> HandlerResult {
    let message_type = args.keyword.get("message_type").map(|t| MessageType::from(t.as_str()));
    let text = args.keyword.get("text").map_or("", String::as_str);
    Ok(Some(responses.ack(request, "AA", text, message_type, Vec::new())))
}

/// Application level rejection. Rule args: `code` (default `AR`) and `text`.
fn reject(request: &Message, args: &RouteArgs, responses: &mut ResponseBuilder) -> HandlerResult {
    let code = args.keyword.get("code").map_or("AR", String::as_str);
    let text = args.keyword.get("text").map_or("", String::as_str);
    Ok(Some(responses.ack(request, code, text, None, Vec::new())))
}

fn builtin_handlers() -> HandlerRegistry {
    let mut registry = HandlerRegistry::new();
    registry.register("accept", accept).register("reject", reject);
    registry
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<(), Box<dyn Error>> {
    let args = Args::parse();
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(&args.log_level)).init();

    let config = BridgeConfig::load(&args.config)?;
    let handlers = builtin_handlers();
    debug!("Built in handlers: {}", handlers.names().collect::<Vec<_>>().join(", "));
    let dispatcher = config.dispatcher(handlers)?;
    info!(
        "Loaded {} listener(s) and {} rule(s) from {}",
        config.listeners.len(),
        dispatcher.rules().len(),
        args.config.display()
    );

    let mut server = Multiplexer::bind(config.listeners, Hl7Service::new(Arc::new(dispatcher))).await?;

    tokio::select! {
        _ = server.run() => {}
        result = tokio::signal::ctrl_c() => {
            result?;
            info!("Shutting down, closing all connections");
        }
    }
    Ok(())
}
