//! Readiness multiplexing for the server loop.
//!
//! [`Poller`] plays the part of `epoll`/`select`: listeners, connections and outbound
//! queues are registered with it, and [`Poller::wait`] returns the next thing that is ready
//! or `None` when the timeout passes first. All of it runs on the one task that owns it.

use std::collections::BTreeMap;
use std::future::poll_fn;
use std::io;
use std::net::SocketAddr;
use std::task::{Context, Poll};
use std::time::Duration;

use futures::StreamExt;
use log::trace;
use tokio::net::{TcpListener, TcpStream};
use tokio_util::codec::Framed;

use crate::codec::{MllpCodec, MllpFrame};
use crate::error::MllpError;
use crate::outbound::OutboundQueue;

pub type ConnectionId = u64;

/// Which side of a listener group a socket belongs to.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Role {
    /// Peers delivering messages to us.
    Receive,
    /// Duplex peers collecting our outbound messages.
    Send,
}

/// One accepted socket.
#[derive(Debug)]
pub struct Connection {
    pub id: ConnectionId,
    pub group: usize,
    pub role: Role,
    pub peer: SocketAddr,
    pub framed: Framed<TcpStream, MllpCodec>,
}

#[derive(Debug)]
struct Listener {
    group: usize,
    role: Role,
    inner: TcpListener,
}

/// Something the server loop has to act on.
#[derive(Debug)]
pub enum Event {
    Accepted {
        group: usize,
        role: Role,
        stream: TcpStream,
        peer: SocketAddr,
    },
    AcceptFailed {
        group: usize,
        role: Role,
        error: io::Error,
    },
    Frame {
        id: ConnectionId,
        frame: MllpFrame,
    },
    /// The codec rejected the stream, the connection can't be trusted any more.
    Failed {
        id: ConnectionId,
        error: MllpError,
    },
    /// EOF or hang-up.
    Closed {
        id: ConnectionId,
    },
    Outbound {
        group: usize,
    },
}

#[derive(Debug, Default)]
pub struct Poller {
    listeners: Vec<Listener>,
    connections: BTreeMap<ConnectionId, Connection>,
    queues: BTreeMap<usize, OutboundQueue>,
    next_id: ConnectionId,
    // where the next scan of connections starts, so one busy peer can't starve the rest
    cursor: ConnectionId,
}

impl Poller {
    pub fn new() -> Self {
        Poller::default()
    }

    pub fn register_listener(&mut self, group: usize, role: Role, listener: TcpListener) {
        self.listeners.push(Listener {
            group,
            role,
            inner: listener,
        });
    }

    pub(crate) fn register_queue(&mut self, group: usize, queue: OutboundQueue) {
        self.queues.insert(group, queue);
    }

    /// Starts watching an accepted socket for frames.
    pub fn register(&mut self, group: usize, role: Role, stream: TcpStream, peer: SocketAddr) -> ConnectionId {
        let id = self.next_id;
        self.next_id += 1;
        self.connections.insert(
            id,
            Connection {
                id,
                group,
                role,
                peer,
                framed: Framed::new(stream, MllpCodec::new()),
            },
        );
        id
    }

    /// Stops watching a connection and hands it back; dropping it closes the socket.
    pub fn deregister(&mut self, id: ConnectionId) -> Option<Connection> {
        self.connections.remove(&id)
    }

    pub fn connection(&self, id: ConnectionId) -> Option<&Connection> {
        self.connections.get(&id)
    }

    pub fn connection_mut(&mut self, id: ConnectionId) -> Option<&mut Connection> {
        self.connections.get_mut(&id)
    }

    pub fn connections(&self) -> impl Iterator<Item = &Connection> {
        self.connections.values()
    }

    pub(crate) fn queue_mut(&mut self, group: usize) -> Option<&mut OutboundQueue> {
        self.queues.get_mut(&group)
    }

    pub(crate) fn queue(&self, group: usize) -> Option<&OutboundQueue> {
        self.queues.get(&group)
    }

    /// Pulls anything producers have sent into the queues.
    pub fn drain_queues(&mut self) {
        self.queues.values_mut().for_each(OutboundQueue::drain);
    }

    pub fn has_pending_outbound(&self) -> bool {
        self.queues.values().any(|q| !q.is_empty())
    }

    /// Waits up to `timeout` for the next ready event.
    pub async fn wait(&mut self, timeout: Duration) -> Option<Event> {
        tokio::time::timeout(timeout, poll_fn(|cx| self.poll_ready(cx)))
            .await
            .ok()
    }

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Event> {
        for listener in &self.listeners {
            match listener.inner.poll_accept(cx) {
                Poll::Ready(Ok((stream, peer))) => {
                    return Poll::Ready(Event::Accepted {
                        group: listener.group,
                        role: listener.role,
                        stream,
                        peer,
                    })
                }
                Poll::Ready(Err(error)) => {
                    return Poll::Ready(Event::AcceptFailed {
                        group: listener.group,
                        role: listener.role,
                        error,
                    })
                }
                Poll::Pending => {}
            }
        }

        for (group, queue) in self.queues.iter_mut() {
            if queue.poll_ready(cx).is_ready() {
                return Poll::Ready(Event::Outbound { group: *group });
            }
        }

        let ids: Vec<ConnectionId> = self
            .connections
            .range(self.cursor..)
            .chain(self.connections.range(..self.cursor))
            .map(|(id, _)| *id)
            .collect();

        for id in ids {
            let Some(conn) = self.connections.get_mut(&id) else {
                continue;
            };
            if let Poll::Ready(next) = conn.framed.poll_next_unpin(cx) {
                self.cursor = id + 1;
                trace!("Connection {} is ready", id);
                return Poll::Ready(match next {
                    Some(Ok(frame)) => Event::Frame { id, frame },
                    Some(Err(error)) => Event::Failed { id, error },
                    None => Event::Closed { id },
                });
            }
        }

        Poll::Pending
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncWriteExt;

    async fn listener() -> (TcpListener, SocketAddr) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        (listener, addr)
    }

    #[tokio::test]
    async fn times_out_with_nothing_ready() {
        let mut poller = Poller::new();
        assert!(poller.wait(Duration::from_millis(10)).await.is_none());
    }

    #[tokio::test]
    async fn reports_accept_frames_and_close() {
        let (tcp, addr) = listener().await;
        let mut poller = Poller::new();
        poller.register_listener(4, Role::Receive, tcp);

        let mut client = TcpStream::connect(addr).await.unwrap();
        let (stream, peer) = match poller.wait(Duration::from_secs(5)).await {
            Some(Event::Accepted { group: 4, role: Role::Receive, stream, peer }) => (stream, peer),
            other => panic!("Expected an accept, got {:?}", other),
        };
        let id = poller.register(4, Role::Receive, stream, peer);

        client.write_all(b"\x0Bhello\x1C\x0D").await.unwrap();
        match poller.wait(Duration::from_secs(5)).await {
            Some(Event::Frame { id: got, frame: MllpFrame::Content(content) }) => {
                assert_eq!(got, id);
                assert_eq!(&content[..], b"hello");
            }
            other => panic!("Expected a frame, got {:?}", other),
        }

        drop(client);
        match poller.wait(Duration::from_secs(5)).await {
            Some(Event::Closed { id: got }) => assert_eq!(got, id),
            other => panic!("Expected a close, got {:?}", other),
        }
        assert!(poller.deregister(id).is_some());
        assert_eq!(poller.connections().count(), 0);
    }

    #[tokio::test]
    async fn wakes_for_outbound_messages() {
        let mut poller = Poller::new();
        let queue = OutboundQueue::new(1);
        let handle = queue.handle();
        poller.register_queue(1, queue);

        handle.enqueue("X").unwrap();
        assert!(matches!(
            poller.wait(Duration::from_secs(5)).await,
            Some(Event::Outbound { group: 1 })
        ));
        assert!(poller.has_pending_outbound());
    }
}
