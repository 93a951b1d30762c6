//! Per-topic transport channel.
//!
//! Each channel is an actor running in its own tokio task. The task owns the
//! socket, the lifecycle state and the table of pending reliable sends; the
//! rest of the application talks to it only through a [`ChannelHandle`].
//! Decoded inbound envelopes are pushed, in arrival order, into the event
//! sender supplied at spawn time.

use std::collections::HashMap;
use std::net::{SocketAddr, SocketAddrV4};

use tokio::net::UdpSocket;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error, info, trace, warn};

use skynet_shared::constants::MAX_DATAGRAM_SIZE;
use skynet_shared::{Envelope, MessageId, Topic};

use crate::error::ChannelError;
use crate::multicast::{bind_topic_socket, MulticastConfig};
use crate::reliable::{ReliableDelivery, RetryPolicy, SequenceCounter};

/// Lifecycle of a channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelState {
    Idle,
    Listening,
    Stopped,
}

/// Notifications sent *from* a channel task.
#[derive(Debug)]
pub enum ChannelEvent {
    /// A well-formed envelope arrived on the topic.
    Envelope(Envelope),
    /// The socket failed; the channel is now `Stopped` and must be restarted.
    Fault { topic: Topic, error: String },
}

/// Commands sent *into* a channel task.
#[derive(Debug)]
enum ChannelCommand {
    Start(oneshot::Sender<Result<(), ChannelError>>),
    Stop(oneshot::Sender<()>),
    Send {
        envelope: Envelope,
        reply: oneshot::Sender<Result<(), ChannelError>>,
    },
    /// Sequence a reliable envelope and park its ack waiter.
    Register {
        envelope: Envelope,
        ack_tx: oneshot::Sender<()>,
        reply: oneshot::Sender<Result<Envelope, ChannelError>>,
    },
    Forget(MessageId),
    Acknowledge {
        message_id: MessageId,
        reply: oneshot::Sender<bool>,
    },
    State(oneshot::Sender<ChannelState>),
    Shutdown,
    /// Make the next datagram write fail with this error kind.
    #[cfg(test)]
    FailNextSend(std::io::ErrorKind),
}

/// Cloneable handle to a running channel task.
#[derive(Debug, Clone)]
pub struct ChannelHandle {
    topic: Topic,
    retry: RetryPolicy,
    cmd_tx: mpsc::Sender<ChannelCommand>,
}

/// Spawn the actor for `topic` in `Idle` state.
///
/// Nothing is bound until [`ChannelHandle::start`] is called.
pub fn spawn_channel(
    topic: Topic,
    config: MulticastConfig,
    retry: RetryPolicy,
    events: mpsc::Sender<ChannelEvent>,
) -> ChannelHandle {
    let (cmd_tx, cmd_rx) = mpsc::channel(256);

    let actor = ChannelActor {
        topic,
        config,
        events,
        state: ChannelState::Idle,
        socket: None,
        dest: None,
        sequences: SequenceCounter::new(),
        pending: HashMap::new(),
        #[cfg(test)]
        fail_next_send: None,
    };
    tokio::spawn(actor.run(cmd_rx));

    ChannelHandle {
        topic,
        retry,
        cmd_tx,
    }
}

impl ChannelHandle {
    pub fn topic(&self) -> Topic {
        self.topic
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        self.retry
    }

    /// Bind and start listening. Calling it while already listening is a no-op.
    pub async fn start(&self) -> Result<(), ChannelError> {
        let (tx, rx) = oneshot::channel();
        self.command(ChannelCommand::Start(tx)).await?;
        rx.await.map_err(|_| ChannelError::ChannelClosed)?
    }

    /// Close the socket and cancel pending reliable sends.
    pub async fn stop(&self) {
        let (tx, rx) = oneshot::channel();
        if self.command(ChannelCommand::Stop(tx)).await.is_ok() {
            let _ = rx.await;
        }
    }

    pub async fn state(&self) -> ChannelState {
        let (tx, rx) = oneshot::channel();
        if self.command(ChannelCommand::State(tx)).await.is_err() {
            return ChannelState::Stopped;
        }
        rx.await.unwrap_or(ChannelState::Stopped)
    }

    /// Fire-and-forget publish. Completes once the datagram is handed to the OS.
    pub async fn send(&self, envelope: Envelope) -> Result<(), ChannelError> {
        let (tx, rx) = oneshot::channel();
        self.command(ChannelCommand::Send {
            envelope,
            reply: tx,
        })
        .await?;
        rx.await.map_err(|_| ChannelError::ChannelClosed)?
    }

    /// Publish with acknowledgement, retransmitting on the retry schedule.
    ///
    /// The wait runs in the caller's task, so the channel keeps serving
    /// other traffic between retransmissions.
    pub async fn send_reliable(&self, envelope: Envelope) -> Result<ReliableDelivery, ChannelError> {
        if !self.topic.policy().is_reliable() {
            return Err(ChannelError::NotReliable(self.topic));
        }

        let (ack_tx, mut ack_rx) = oneshot::channel();
        let (reply_tx, reply_rx) = oneshot::channel();
        self.command(ChannelCommand::Register {
            envelope,
            ack_tx,
            reply: reply_tx,
        })
        .await?;
        let envelope = reply_rx.await.map_err(|_| ChannelError::ChannelClosed)??;

        let message_id = envelope.message_id;
        let sequence = envelope.sequence.unwrap_or_default();
        let mut attempts = 0;

        for delay in self.retry.delays() {
            attempts += 1;
            if let Err(e) = self.send(envelope.clone()).await {
                self.cancel(message_id).await;
                return Err(e);
            }

            match tokio::time::timeout(delay, &mut ack_rx).await {
                Ok(Ok(())) => {
                    debug!(
                        topic = %self.topic,
                        message = %message_id,
                        sequence,
                        attempts,
                        "Reliable send acknowledged"
                    );
                    return Ok(ReliableDelivery { sequence, attempts });
                }
                // Waiter dropped by the actor: channel stopped.
                Ok(Err(_)) => return Err(ChannelError::ChannelClosed),
                Err(_) => {
                    debug!(
                        topic = %self.topic,
                        message = %message_id,
                        attempt = attempts,
                        waited_ms = delay.as_millis() as u64,
                        "No ack yet"
                    );
                }
            }
        }

        self.cancel(message_id).await;
        warn!(
            topic = %self.topic,
            message = %message_id,
            attempts,
            "Reliable send timed out"
        );
        Err(ChannelError::DeliveryTimeout {
            message_id,
            attempts,
        })
    }

    /// Release the reliable send waiting on `message_id`.
    ///
    /// Returns `false` when nothing was waiting (unmatched ack).
    pub async fn acknowledge(&self, message_id: MessageId) -> bool {
        let (tx, rx) = oneshot::channel();
        if self
            .command(ChannelCommand::Acknowledge {
                message_id,
                reply: tx,
            })
            .await
            .is_err()
        {
            return false;
        }
        rx.await.unwrap_or(false)
    }

    /// Terminate the actor task.
    pub async fn shutdown(&self) {
        let _ = self.command(ChannelCommand::Shutdown).await;
    }

    /// Drop the ack waiter of a reliable send whose caller went away.
    pub async fn cancel(&self, message_id: MessageId) {
        let _ = self.command(ChannelCommand::Forget(message_id)).await;
    }

    #[cfg(test)]
    async fn fail_next_send(&self, kind: std::io::ErrorKind) {
        let _ = self.command(ChannelCommand::FailNextSend(kind)).await;
    }

    async fn command(&self, cmd: ChannelCommand) -> Result<(), ChannelError> {
        self.cmd_tx
            .send(cmd)
            .await
            .map_err(|_| ChannelError::ChannelClosed)
    }
}

struct ChannelActor {
    topic: Topic,
    config: MulticastConfig,
    events: mpsc::Sender<ChannelEvent>,
    state: ChannelState,
    socket: Option<UdpSocket>,
    dest: Option<SocketAddrV4>,
    sequences: SequenceCounter,
    pending: HashMap<MessageId, oneshot::Sender<()>>,
    #[cfg(test)]
    fail_next_send: Option<std::io::ErrorKind>,
}

impl ChannelActor {
    async fn run(mut self, mut cmd_rx: mpsc::Receiver<ChannelCommand>) {
        let mut buf = vec![0u8; MAX_DATAGRAM_SIZE];

        loop {
            tokio::select! {
                cmd = cmd_rx.recv() => {
                    match cmd {
                        Some(ChannelCommand::Shutdown) | None => break,
                        Some(cmd) => self.handle_command(cmd).await,
                    }
                }

                received = recv_datagram(self.socket.as_ref(), &mut buf) => {
                    match received {
                        Ok((len, from)) => self.on_datagram(&buf[..len], from).await,
                        Err(e) => self.fail(e).await,
                    }
                }
            }
        }

        self.close();
        debug!(topic = %self.topic, "Channel task terminated");
    }

    async fn handle_command(&mut self, cmd: ChannelCommand) {
        match cmd {
            ChannelCommand::Start(reply) => {
                let _ = reply.send(self.start());
            }
            ChannelCommand::Stop(reply) => {
                if self.state == ChannelState::Listening {
                    info!(topic = %self.topic, "Channel stopped");
                }
                self.close();
                let _ = reply.send(());
            }
            ChannelCommand::Send { envelope, reply } => {
                let result = self.transmit(&envelope).await;
                let _ = reply.send(result);
            }
            ChannelCommand::Register {
                envelope,
                ack_tx,
                reply,
            } => {
                let _ = reply.send(self.register(envelope, ack_tx));
            }
            ChannelCommand::Forget(message_id) => {
                self.pending.remove(&message_id);
            }
            ChannelCommand::Acknowledge { message_id, reply } => {
                let matched = match self.pending.remove(&message_id) {
                    Some(waiter) => waiter.send(()).is_ok(),
                    None => {
                        debug!(topic = %self.topic, message = %message_id, "Dropping unmatched ack");
                        false
                    }
                };
                let _ = reply.send(matched);
            }
            ChannelCommand::State(reply) => {
                let _ = reply.send(self.state);
            }
            ChannelCommand::Shutdown => {}
            #[cfg(test)]
            ChannelCommand::FailNextSend(kind) => {
                self.fail_next_send = Some(kind);
            }
        }
    }

    fn start(&mut self) -> Result<(), ChannelError> {
        if self.state == ChannelState::Listening {
            return Ok(());
        }

        let (socket, dest) = bind_topic_socket(self.topic, &self.config).map_err(|e| {
            error!(topic = %self.topic, error = %e, "Failed to bind topic socket");
            ChannelError::Socket(e)
        })?;

        info!(topic = %self.topic, addr = %dest, "Channel listening");
        self.socket = Some(socket);
        self.dest = Some(dest);
        self.state = ChannelState::Listening;
        Ok(())
    }

    fn register(
        &mut self,
        mut envelope: Envelope,
        ack_tx: oneshot::Sender<()>,
    ) -> Result<Envelope, ChannelError> {
        if self.state != ChannelState::Listening {
            return Err(ChannelError::ChannelClosed);
        }

        let seq = self
            .sequences
            .next(&envelope.sender, &envelope.conversation_id);
        envelope.sequence = Some(seq);
        // Reject oversize payloads before anything is parked.
        envelope.to_datagram()?;

        self.pending.insert(envelope.message_id, ack_tx);
        Ok(envelope)
    }

    async fn transmit(&mut self, envelope: &Envelope) -> Result<(), ChannelError> {
        let dest = match (&self.socket, self.dest) {
            (Some(_), Some(dest)) if self.state == ChannelState::Listening => dest,
            _ => return Err(ChannelError::ChannelClosed),
        };

        let bytes = envelope.to_datagram()?;

        match self.send_datagram(&bytes, dest).await {
            Ok(_) => {
                trace!(
                    topic = %self.topic,
                    message = %envelope.message_id,
                    kind = ?envelope.kind,
                    len = bytes.len(),
                    "Datagram sent"
                );
                Ok(())
            }
            Err(e) => {
                let reported = std::io::Error::new(e.kind(), e.to_string());
                self.fail(e).await;
                Err(ChannelError::Socket(reported))
            }
        }
    }

    async fn send_datagram(&mut self, bytes: &[u8], dest: SocketAddrV4) -> std::io::Result<usize> {
        #[cfg(test)]
        if let Some(kind) = self.fail_next_send.take() {
            return Err(std::io::Error::new(kind, "injected send failure"));
        }
        match &self.socket {
            Some(socket) => socket.send_to(bytes, dest).await,
            None => Err(std::io::ErrorKind::NotConnected.into()),
        }
    }

    async fn on_datagram(&mut self, data: &[u8], from: SocketAddr) {
        let envelope = match Envelope::from_datagram(data) {
            Ok(env) => env,
            Err(e) => {
                debug!(topic = %self.topic, from = %from, len = data.len(), error = %e, "Dropping malformed datagram");
                return;
            }
        };

        if envelope.topic != self.topic.channel_id() {
            debug!(
                topic = %self.topic,
                from = %from,
                claimed = envelope.topic,
                "Dropping envelope for another topic"
            );
            return;
        }

        trace!(
            topic = %self.topic,
            from = %from,
            sender = %envelope.sender,
            kind = ?envelope.kind,
            "Envelope received"
        );

        if self.events.send(ChannelEvent::Envelope(envelope)).await.is_err() {
            warn!(topic = %self.topic, "Event receiver gone, dropping envelope");
        }
    }

    /// Socket failure: stop the channel and report upward. No retry here.
    async fn fail(&mut self, e: std::io::Error) {
        error!(topic = %self.topic, error = %e, "Socket error, stopping channel");
        self.close();
        let _ = self
            .events
            .send(ChannelEvent::Fault {
                topic: self.topic,
                error: e.to_string(),
            })
            .await;
    }

    fn close(&mut self) {
        self.socket = None;
        self.dest = None;
        self.state = ChannelState::Stopped;
        // Dropping the waiters wakes every pending reliable send.
        self.pending.clear();
    }
}

async fn recv_datagram(
    socket: Option<&UdpSocket>,
    buf: &mut [u8],
) -> std::io::Result<(usize, SocketAddr)> {
    match socket {
        Some(socket) => socket.recv_from(buf).await,
        None => std::future::pending().await,
    }
}
