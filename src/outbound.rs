//! Outbound queues for duplex listener groups.
//!
//! Producers push through a cloneable [`OutboundHandle`]; the server drains the channel
//! into a stack and sends the newest message first.

use std::task::{Context, Poll};

use bytes::Bytes;
use log::trace;
use tokio::sync::mpsc;

use crate::codec::MllpCodec;
use crate::error::OutboundError;

/// Queues messages for delivery to the send-side peers of one duplex listener group.
#[derive(Clone, Debug)]
pub struct OutboundHandle {
    group: usize,
    tx: mpsc::UnboundedSender<Bytes>,
}

impl OutboundHandle {
    /// Index of the listener group this handle feeds.
    pub fn group(&self) -> usize {
        self.group
    }

    /// Queues a message after checking it against the MLLP content rules.
    ///
    /// # Errors
    ///
    /// [`OutboundError::Invalid`] for content MLLP can't carry, [`OutboundError::Closed`]
    /// once the server is gone.
    pub fn enqueue(&self, payload: impl Into<Bytes>) -> Result<(), OutboundError> {
        let payload = payload.into();
        MllpCodec::validate(&payload)?;
        self.tx.send(payload).map_err(|_| OutboundError::Closed)
    }
}

/// The receiving half, owned by the server loop.
#[derive(Debug)]
pub(crate) struct OutboundQueue {
    rx: mpsc::UnboundedReceiver<Bytes>,
    // the sender is kept so the queue never closes while the server can still hand out handles
    tx: mpsc::UnboundedSender<Bytes>,
    group: usize,
    stack: Vec<Bytes>,
}

impl OutboundQueue {
    pub(crate) fn new(group: usize) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        OutboundQueue {
            rx,
            tx,
            group,
            stack: Vec::new(),
        }
    }

    pub(crate) fn handle(&self) -> OutboundHandle {
        OutboundHandle {
            group: self.group,
            tx: self.tx.clone(),
        }
    }

    /// Moves everything producers have sent so far onto the stack.
    pub(crate) fn drain(&mut self) {
        while let Ok(payload) = self.rx.try_recv() {
            self.stack.push(payload);
        }
    }

    /// Ready once a producer has sent something.
    pub(crate) fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<()> {
        match self.rx.poll_recv(cx) {
            Poll::Ready(Some(payload)) => {
                trace!("Outbound message queued for group {}", self.group);
                self.stack.push(payload);
                self.drain();
                Poll::Ready(())
            }
            // can't happen while we hold a sender
            Poll::Ready(None) | Poll::Pending => Poll::Pending,
        }
    }

    /// Newest message first.
    pub(crate) fn pop(&mut self) -> Option<Bytes> {
        self.stack.pop()
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.stack.is_empty()
    }

    pub(crate) fn len(&self) -> usize {
        self.stack.len()
    }
}
