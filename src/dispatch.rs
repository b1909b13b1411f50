//! Routes a parsed message to the handler registered for it.
//!
//! The routing key is `MSH-9/MSH-5/MSH-6`, e.g. `MFN^M05/HL/FAC1`. Rules are tried in the
//! order they were declared and the first pattern found anywhere in the key wins. Patterns
//! are regular expressions, so the `^` inside a message type has to be escaped: `MFN\^M05/.*`.

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, OnceLock};

use log::{debug, trace};
use regex::Regex;

use crate::error::{ConfigError, DispatchError, HandlerError};
use crate::message::Message;
use crate::response::{ResponseBuilder, DEFAULT_VERSION};

/// What a handler gives back. `Ok(None)` is treated as a failure to respond.
pub type HandlerResult = Result<Option<Message>, HandlerError>;

/// Values pulled out of the routing key by the matching pattern, plus the rule's static
/// arguments.
///
/// Named groups fill `keyword` and leave `positional` empty; a pattern without named
/// groups fills `positional` instead. Static arguments always land in `keyword` and win
/// over a captured value of the same name.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct RouteArgs {
    pub positional: Vec<String>,
    pub keyword: BTreeMap<String, String>,
}

/// Application code behind a rule.
pub trait Handler: Send + Sync {
    fn call(&self, request: &Message, args: &RouteArgs, responses: &mut ResponseBuilder) -> HandlerResult;
}

impl<F> Handler for F
where
    F: Fn(&Message, &RouteArgs, &mut ResponseBuilder) -> HandlerResult + Send + Sync,
{
    fn call(&self, request: &Message, args: &RouteArgs, responses: &mut ResponseBuilder) -> HandlerResult {
        self(request, args, responses)
    }
}

/// Named handlers that rules can refer to.
#[derive(Clone, Default)]
pub struct HandlerRegistry {
    handlers: HashMap<String, Arc<dyn Handler>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        HandlerRegistry::default()
    }

    pub fn register(&mut self, name: impl Into<String>, handler: impl Handler + 'static) -> &mut Self {
        self.handlers.insert(name.into(), Arc::new(handler));
        self
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn Handler>> {
        self.handlers.get(name).cloned()
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.handlers.keys().map(String::as_str)
    }
}

impl fmt::Debug for HandlerRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HandlerRegistry")
            .field("handlers", &self.handlers.keys().collect::<Vec<_>>())
            .finish()
    }
}

/// How a rule refers to its handler.
#[derive(Clone)]
pub enum HandlerRef {
    /// Looked up in the [`HandlerRegistry`] the first time the rule matches.
    Named(String),
    Resolved(Arc<dyn Handler>),
}

impl fmt::Debug for HandlerRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HandlerRef::Named(name) => write!(f, "Named({})", name),
            HandlerRef::Resolved(_) => f.write_str("Resolved(<handler>)"),
        }
    }
}

/// One entry of the routing table.
pub struct Rule {
    pattern: Regex,
    handler: HandlerRef,
    static_args: BTreeMap<String, String>,
    resolved: OnceLock<Arc<dyn Handler>>,
}

impl Rule {
    pub fn new(
        pattern: &str,
        handler: HandlerRef,
        static_args: BTreeMap<String, String>,
    ) -> Result<Rule, ConfigError> {
        let compiled = Regex::new(pattern).map_err(|source| ConfigError::InvalidPattern {
            pattern: pattern.to_string(),
            source,
        })?;

        let resolved = OnceLock::new();
        if let HandlerRef::Resolved(handler) = &handler {
            let _ = resolved.set(Arc::clone(handler));
        }

        Ok(Rule {
            pattern: compiled,
            handler,
            static_args,
            resolved,
        })
    }

    /// Rule pointing at a handler by its registry name.
    pub fn named(pattern: &str, handler: &str) -> Result<Rule, ConfigError> {
        Rule::new(pattern, HandlerRef::Named(handler.to_string()), BTreeMap::new())
    }

    /// Rule holding the handler directly.
    pub fn with_handler(pattern: &str, handler: impl Handler + 'static) -> Result<Rule, ConfigError> {
        Rule::new(pattern, HandlerRef::Resolved(Arc::new(handler)), BTreeMap::new())
    }

    pub fn arg(mut self, key: impl Into<String>, value: impl Into<String>) -> Rule {
        self.static_args.insert(key.into(), value.into());
        self
    }

    pub fn pattern(&self) -> &str {
        self.pattern.as_str()
    }

    /// Matches the routing key, returning the arguments for the handler on success.
    pub fn matches(&self, key: &str) -> Option<RouteArgs> {
        let captures = self.pattern.captures(key)?;

        let has_named = self.pattern.capture_names().flatten().next().is_some();
        let mut args = RouteArgs::default();
        if has_named {
            for name in self.pattern.capture_names().flatten() {
                if let Some(value) = captures.name(name) {
                    args.keyword.insert(name.to_string(), value.as_str().to_string());
                }
            }
        } else {
            args.positional = captures
                .iter()
                .skip(1)
                .map(|group| group.map_or_else(String::new, |m| m.as_str().to_string()))
                .collect();
        }

        args.keyword.extend(
            self.static_args
                .iter()
                .map(|(k, v)| (k.clone(), v.clone())),
        );
        Some(args)
    }

    fn handler(&self, registry: &HandlerRegistry) -> Result<&Arc<dyn Handler>, DispatchError> {
        if let Some(handler) = self.resolved.get() {
            return Ok(handler);
        }
        match &self.handler {
            HandlerRef::Named(name) => {
                let handler = registry
                    .get(name)
                    .ok_or_else(|| DispatchError::UnknownHandler(name.clone()))?;
                debug!("Resolved handler '{}' for rule '{}'", name, self.pattern);
                Ok(self.resolved.get_or_init(|| handler))
            }
            HandlerRef::Resolved(handler) => Ok(self.resolved.get_or_init(|| Arc::clone(handler))),
        }
    }
}

impl fmt::Debug for Rule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Rule")
            .field("pattern", &self.pattern.as_str())
            .field("handler", &self.handler)
            .field("static_args", &self.static_args)
            .finish()
    }
}

/// Builds the `MSH-9/MSH-5/MSH-6` key a message is routed on.
pub fn routing_key(message: &Message) -> String {
    format!(
        "{}/{}/{}",
        message.field("MSH", 9),
        message.field("MSH", 5),
        message.field("MSH", 6)
    )
}

/// The ordered rule table and the registry its named handlers come from.
#[derive(Debug)]
pub struct Dispatcher {
    rules: Vec<Rule>,
    registry: HandlerRegistry,
}

impl Dispatcher {
    pub fn new(rules: Vec<Rule>, registry: HandlerRegistry) -> Self {
        Dispatcher { rules, registry }
    }

    pub fn rules(&self) -> &[Rule] {
        &self.rules
    }

    /// Resolves every named handler now.
    pub fn resolve_all(&self) -> Result<(), DispatchError> {
        for rule in &self.rules {
            rule.handler(&self.registry)?;
        }
        Ok(())
    }

    /// Routes `request` and returns the handler's response.
    ///
    /// No matching rule gives an `AE` NAK naming the routing key. Failures inside the
    /// handler (an error, no response, a panic) come back as a [`DispatchError`] for the
    /// caller to turn into its own NAK.
    pub fn dispatch(&self, request: &Message, responses: &mut ResponseBuilder) -> Result<Message, DispatchError> {
        let key = routing_key(request);
        trace!("Dispatching on key '{}'", key);

        for rule in &self.rules {
            let Some(args) = rule.matches(&key) else {
                continue;
            };
            debug!("Key '{}' matched rule '{}'", key, rule.pattern());

            let handler = rule.handler(&self.registry)?;
            let outcome = catch_unwind(AssertUnwindSafe(|| handler.call(request, &args, responses)));
            return match outcome {
                Ok(Ok(Some(response))) => Ok(response),
                Ok(Ok(None)) => Err(DispatchError::NoResponse {
                    rule: rule.pattern().to_string(),
                }),
                Ok(Err(source)) => Err(DispatchError::Handler {
                    rule: rule.pattern().to_string(),
                    source,
                }),
                Err(panic) => Err(DispatchError::Panicked {
                    rule: rule.pattern().to_string(),
                    message: panic_message(panic.as_ref()),
                }),
            };
        }

        debug!("No rule matched key '{}'", key);
        Ok(responses.nak(
            "AE",
            &format!(
                "No handler configured to handle request {}, app {}, facility {}",
                request.field("MSH", 9),
                request.field("MSH", 5),
                request.field("MSH", 6)
            ),
            DEFAULT_VERSION,
        ))
    }
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else if let Some(s) = payload.downcast_ref::<&'static str>() {
        (*s).to_string()
    } else {
        "<non-string panic payload>".to_string()
    }
}
