//! The MLLP server: one readiness loop over every listener group and connection.
//!
//! Each listener group is either receive-only, or duplex. A duplex group binds a second
//! address where peers connect to collect messages queued through its [`OutboundHandle`].
//! Queued messages go out newest first, one per trip around the loop.
//!
//! Every write is bounded by its group's write timeout. A peer that stops reading is
//! dropped once the timeout passes, and the loop moves on to everyone else.

use std::future::Future;
use std::net::SocketAddr;
use std::time::{Duration, Instant};

use bytes::{Bytes, BytesMut};
use futures::SinkExt;
use log::{debug, error, info, warn};
use tokio::net::TcpListener;
use tokio::time::timeout;

use crate::codec::{Control, MllpCodec, MllpFrame};
use crate::config::{parse_address, ListenerConfig, Mode};
use crate::error::{ConfigError, MllpError};
use crate::outbound::{OutboundHandle, OutboundQueue};
use crate::poller::{Connection, ConnectionId, Event, Poller, Role};
use crate::service::ReceiveHandler;

/// How long to wait for readiness while outbound messages are waiting for a peer.
pub const BUSY_POLL: Duration = Duration::from_millis(50);
/// How long to wait for readiness otherwise.
pub const IDLE_POLL: Duration = Duration::from_secs(5);

#[derive(Debug)]
struct Group {
    config: ListenerConfig,
    receive_addr: SocketAddr,
    send_addr: Option<SocketAddr>,
}

/// Owns the listening sockets, the accepted connections and the receive handler.
#[derive(Debug)]
pub struct Multiplexer<H> {
    groups: Vec<Group>,
    poller: Poller,
    handler: H,
}

impl<H: ReceiveHandler> Multiplexer<H> {
    /// Binds every listener group. Groups are numbered in the order given.
    ///
    /// # Errors
    ///
    /// Returns a [`ConfigError`] if an address is invalid or can't be bound. This is the
    /// only place the server fails outright.
    pub async fn bind(configs: Vec<ListenerConfig>, handler: H) -> Result<Self, ConfigError> {
        let mut poller = Poller::new();
        let mut groups = Vec::with_capacity(configs.len());

        for (index, config) in configs.into_iter().enumerate() {
            config.validate()?;

            let receive_addr = listen(&mut poller, index, Role::Receive, &config.address).await?;
            info!(
                "Listening for RECV on {} (group {}, {:?}, auto-ack {})",
                receive_addr, index, config.mode, config.auto_ack
            );

            let send_addr = match (config.mode, &config.send_address) {
                (Mode::Duplex, Some(address)) => {
                    let addr = listen(&mut poller, index, Role::Send, address).await?;
                    info!("Listening for SEND on {} (group {})", addr, index);
                    poller.register_queue(index, OutboundQueue::new(index));
                    Some(addr)
                }
                _ => None,
            };

            groups.push(Group {
                config,
                receive_addr,
                send_addr,
            });
        }

        Ok(Multiplexer {
            groups,
            poller,
            handler,
        })
    }

    /// The bound receive address of a group, useful when binding to port 0.
    pub fn local_addr(&self, group: usize) -> Option<SocketAddr> {
        self.groups.get(group).map(|g| g.receive_addr)
    }

    /// The bound send-side address of a duplex group.
    pub fn send_addr(&self, group: usize) -> Option<SocketAddr> {
        self.groups.get(group).and_then(|g| g.send_addr)
    }

    /// A producer handle for a duplex group's outbound queue.
    pub fn outbound(&self, group: usize) -> Option<OutboundHandle> {
        self.poller.queue(group).map(OutboundQueue::handle)
    }

    pub fn connection_count(&self) -> usize {
        self.poller.connections().count()
    }

    /// Runs the loop until the future is dropped. Dropping the server closes every socket.
    pub async fn run(&mut self) {
        loop {
            self.turn().await;
        }
    }

    /// One trip around the loop: wait for readiness, handle what turned up, expire stalled
    /// frames and send at most one outbound message per duplex group.
    pub async fn turn(&mut self) {
        self.poller.drain_queues();
        let timeout = if self.poller.has_pending_outbound() {
            BUSY_POLL
        } else {
            IDLE_POLL
        };

        if let Some(event) = self.poller.wait(timeout).await {
            self.handle_event(event).await;
        }

        self.expire_stalled_frames(Instant::now());
        self.flush_outbound().await;
    }

    async fn handle_event(&mut self, event: Event) {
        match event {
            Event::Accepted {
                group,
                role,
                stream,
                peer,
            } => {
                let id = self.poller.register(group, role, stream, peer);
                info!(
                    "Accepted {:?} connection {} from {} on group {}",
                    role, id, peer, group
                );
            }
            Event::AcceptFailed { group, role, error } => {
                warn!("Failed to accept {:?} connection on group {}: {}", role, group, error);
            }
            Event::Frame {
                id,
                frame: MllpFrame::Control(control),
            } => {
                debug!("{:?} received on connection {}", control, id);
            }
            Event::Frame {
                id,
                frame: MllpFrame::Content(content) | MllpFrame::Unframed(content),
            } => {
                self.deliver(id, content).await;
            }
            Event::Failed { id, error } => {
                warn!("Dropping connection {}: {}", id, error);
                self.close(id);
            }
            Event::Closed { id } => {
                debug!("Connection {} closed by peer", id);
                self.close(id);
            }
            Event::Outbound { group } => {
                debug!("Outbound message waiting for group {}", group);
            }
        }
    }

    async fn deliver(&mut self, id: ConnectionId, content: BytesMut) {
        let Some(conn) = self.poller.connection(id) else {
            return;
        };
        let config = &self.groups[conn.group].config;
        let auto_ack = conn.role == Role::Receive && config.auto_ack;
        let limit = config.write_timeout();

        let reply = self.handler.on_frame(&content);

        // nothing goes out, not even the ACK, unless the whole answer can be framed
        if let Some(Err(err)) = reply.as_deref().map(MllpCodec::validate) {
            error!("Reply for connection {} can't be framed, closing it: {}", id, err);
            self.close(id);
            return;
        }

        let result = match self.poller.connection_mut(id) {
            Some(conn) => bounded(limit, write_replies(conn, auto_ack, reply)).await,
            None => return,
        };
        if let Err(err) = result {
            error!("Unable to answer connection {}: {}", id, err);
            self.close(id);
        }
    }

    fn expire_stalled_frames(&mut self, now: Instant) {
        let stalled: Vec<ConnectionId> = self
            .poller
            .connections()
            .filter(|conn| {
                let timeout = self.groups[conn.group].config.frame_timeout();
                match (conn.framed.codec().frame_started(), timeout) {
                    (Some(started), Some(timeout)) => now.saturating_duration_since(started) > timeout,
                    _ => false,
                }
            })
            .map(|conn| conn.id)
            .collect();

        for id in stalled {
            warn!("Connection {} never finished its frame, closing it", id);
            self.close(id);
        }
    }

    async fn flush_outbound(&mut self) {
        for group in 0..self.groups.len() {
            if self.groups[group].config.mode != Mode::Duplex {
                continue;
            }

            let target = self
                .poller
                .connections()
                .find(|conn| conn.group == group && conn.role == Role::Send)
                .map(|conn| conn.id);
            let Some(id) = target else {
                continue;
            };
            let Some(payload) = self.poller.queue_mut(group).and_then(OutboundQueue::pop) else {
                continue;
            };
            let limit = self.groups[group].config.write_timeout();

            let result = match self.poller.connection_mut(id) {
                Some(conn) => bounded(limit, send_payload(conn, payload)).await,
                None => continue,
            };
            match result {
                Ok(()) => debug!("Outbound message sent on connection {}", id),
                Err(err) => {
                    error!("Outbound send on connection {} failed, message dropped: {}", id, err);
                    self.close(id);
                }
            }
        }
    }

    fn close(&mut self, id: ConnectionId) {
        if let Some(conn) = self.poller.deregister(id) {
            debug!("Closing connection {} to {}", id, conn.peer);
        }
    }
}

async fn listen(poller: &mut Poller, group: usize, role: Role, address: &str) -> Result<SocketAddr, ConfigError> {
    let addr = parse_address(address)?;
    let listener = TcpListener::bind(addr)
        .await
        .map_err(|source| ConfigError::Bind { address: addr, source })?;
    let bound = listener
        .local_addr()
        .map_err(|source| ConfigError::Bind { address: addr, source })?;
    poller.register_listener(group, role, listener);
    Ok(bound)
}

async fn bounded(limit: Duration, write: impl Future<Output = Result<(), MllpError>>) -> Result<(), MllpError> {
    timeout(limit, write)
        .await
        .unwrap_or(Err(MllpError::WriteTimeout(limit)))
}

// The protocol ACK goes first, then whatever the application had to say.
async fn write_replies(conn: &mut Connection, auto_ack: bool, reply: Option<Bytes>) -> Result<(), MllpError> {
    if auto_ack {
        conn.framed.send(Control::Ack).await?;
    }
    if let Some(reply) = reply {
        send_payload(conn, reply).await?;
    }
    Ok(())
}

async fn send_payload(conn: &mut Connection, payload: Bytes) -> Result<(), MllpError> {
    conn.framed.send(BytesMut::from(&payload[..])).await
}
