//! Message router: the coordinator actor.
//!
//! One tokio task owns the conversation store, the presence table and the
//! per-topic channel handles. Channels push decoded envelopes into its event
//! queue; callers talk to it through a [`RouterHandle`]. The task never
//! awaits network I/O itself: every channel call runs in a spawned task so a
//! slow socket cannot stall ingestion or snapshot publication.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures::future::join_all;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::AbortHandle;
use tracing::{debug, info, trace, warn};

use skynet_net::{spawn_channel, ChannelError, ChannelEvent, ChannelHandle, PresenceTracker};
use skynet_shared::{
    Announcement, ControlBody, ConversationId, DeliveryPolicy, Envelope, EnvelopeKind,
    LocalIdentity, MessageId, Participant, ParticipantId, TextBody, Topic,
};
use skynet_store::{
    Attachment, Conversation, ConversationStore, DeliveryStatus, MergeOutcome, Message, Reaction,
};

use crate::config::ClientConfig;
use crate::error::RouterError;
use crate::snapshot::Snapshot;

/// Capacity of the channel -> router event queue.
const EVENT_BUFFER: usize = 1024;

/// Capacity of the caller -> router command queue.
const COMMAND_BUFFER: usize = 256;

type Reply<T> = oneshot::Sender<Result<T, RouterError>>;

/// What the router needs to know about a conversation it may not have seen.
#[derive(Debug)]
struct Recipient {
    id: ConversationId,
    participants: Vec<Participant>,
    is_group_chat: bool,
    title: Option<String>,
}

impl From<&Conversation> for Recipient {
    fn from(conversation: &Conversation) -> Self {
        Self {
            id: conversation.id.clone(),
            participants: conversation.participants.clone(),
            is_group_chat: conversation.is_group_chat,
            title: conversation.title.clone(),
        }
    }
}

/// Commands sent *into* the router task.
#[derive(Debug)]
enum RouterCommand {
    Start(Reply<()>),
    Stop(oneshot::Sender<()>),
    Ingest(Envelope, oneshot::Sender<()>),
    Send {
        recipient: Recipient,
        text: String,
        reply: Reply<MessageId>,
    },
    OpenDirect {
        peer: ParticipantId,
        reply: oneshot::Sender<ConversationId>,
    },
    OpenGroup {
        topic: Option<Topic>,
        title: Option<String>,
        members: Vec<ParticipantId>,
        reply: Reply<ConversationId>,
    },
    MarkRead(ConversationId, Reply<()>),
    SetPinned(ConversationId, bool, Reply<()>),
    AddReaction {
        conversation_id: ConversationId,
        message_id: MessageId,
        emoji: String,
        reply: Reply<bool>,
    },
    AddAttachment {
        conversation_id: ConversationId,
        message_id: MessageId,
        attachment: Attachment,
        reply: Reply<()>,
    },
    Remove(ConversationId, Reply<()>),
    /// Outcome of a delivery task.
    Delivered {
        conversation_id: ConversationId,
        message_id: MessageId,
        status: DeliveryStatus,
    },
    Sweep,
    Announce,
    Shutdown,
}

/// Cloneable handle to the router task.
#[derive(Debug, Clone)]
pub struct RouterHandle {
    local: ParticipantId,
    cmd_tx: mpsc::Sender<RouterCommand>,
    snapshot_rx: watch::Receiver<Arc<Snapshot>>,
}

/// Spawn the router and one idle channel per subscribed topic.
///
/// Nothing touches the network until [`RouterHandle::start`].
pub fn spawn_router(config: ClientConfig) -> RouterHandle {
    let identity = config.identity();
    let local = identity.participant_id().clone();

    let (cmd_tx, cmd_rx) = mpsc::channel(COMMAND_BUFFER);
    let (events_tx, events_rx) = mpsc::channel(EVENT_BUFFER);

    let channels: BTreeMap<Topic, ChannelHandle> = config
        .subscribed_topics()
        .into_iter()
        .map(|topic| {
            let handle = spawn_channel(topic, config.multicast.clone(), config.retry, events_tx.clone());
            (topic, handle)
        })
        .collect();

    let mut local_participant = Participant::new(local.clone())
        .with_display_name(identity.display_name.clone());
    local_participant.avatar = identity.avatar.clone();
    local_participant.topics = channels.keys().copied().collect();

    let (snapshot_tx, snapshot_rx) = watch::channel(Arc::new(Snapshot::default()));

    let mut actor = RouterActor {
        presence: PresenceTracker::new(local.clone(), config.presence),
        store: ConversationStore::new(local.clone()),
        identity,
        local: local_participant,
        group_topic: config.group_topic,
        channels,
        topics: HashMap::new(),
        deliveries: HashMap::new(),
        snapshot_tx,
        self_tx: cmd_tx.downgrade(),
    };
    actor.publish();

    spawn_ticker(
        cmd_tx.downgrade(),
        config.presence.sweep_interval,
        config.announce_interval,
    );
    tokio::spawn(actor.run(cmd_rx, events_rx));

    info!(participant = %local, "Router spawned");

    RouterHandle {
        local,
        cmd_tx,
        snapshot_rx,
    }
}

impl RouterHandle {
    pub fn local(&self) -> &ParticipantId {
        &self.local
    }

    /// Latest published state.
    pub fn snapshot(&self) -> Arc<Snapshot> {
        self.snapshot_rx.borrow().clone()
    }

    /// Receiver woken on every published snapshot.
    pub fn subscribe(&self) -> watch::Receiver<Arc<Snapshot>> {
        self.snapshot_rx.clone()
    }

    /// Start every channel and announce ourselves on the control topic.
    ///
    /// All channels are attempted; the first failure is returned.
    pub async fn start(&self) -> Result<(), RouterError> {
        let (tx, rx) = oneshot::channel();
        self.command(RouterCommand::Start(tx)).await?;
        rx.await.map_err(|_| RouterError::Closed)?
    }

    /// Broadcast our departure and stop every channel.
    pub async fn stop(&self) -> Result<(), RouterError> {
        let (tx, rx) = oneshot::channel();
        self.command(RouterCommand::Stop(tx)).await?;
        rx.await.map_err(|_| RouterError::Closed)
    }

    /// Process an envelope as if a channel had received it.
    pub async fn ingest(&self, envelope: Envelope) -> Result<(), RouterError> {
        let (tx, rx) = oneshot::channel();
        self.command(RouterCommand::Ingest(envelope, tx)).await?;
        rx.await.map_err(|_| RouterError::Closed)
    }

    /// Send `text` to a conversation.
    ///
    /// A conversation the router does not know yet is created from
    /// `conversation`'s id, participants, group flag and title.
    ///
    /// Returns once the message is visible (status `Pending`) in the
    /// published snapshot; delivery completes in the background and is
    /// reported through the message's delivery status.
    pub async fn send(
        &self,
        conversation: &Conversation,
        text: impl Into<String>,
    ) -> Result<MessageId, RouterError> {
        let (tx, rx) = oneshot::channel();
        self.command(RouterCommand::Send {
            recipient: Recipient::from(conversation),
            text: text.into(),
            reply: tx,
        })
        .await?;
        rx.await.map_err(|_| RouterError::Closed)?
    }

    /// Find or create the one-to-one conversation with `peer`.
    pub async fn open_direct(&self, peer: ParticipantId) -> Result<ConversationId, RouterError> {
        let (tx, rx) = oneshot::channel();
        self.command(RouterCommand::OpenDirect { peer, reply: tx }).await?;
        rx.await.map_err(|_| RouterError::Closed)
    }

    /// Create a group conversation on `topic` (the configured group topic
    /// when `None`).
    pub async fn open_group(
        &self,
        topic: Option<Topic>,
        title: Option<String>,
        members: Vec<ParticipantId>,
    ) -> Result<ConversationId, RouterError> {
        let (tx, rx) = oneshot::channel();
        self.command(RouterCommand::OpenGroup {
            topic,
            title,
            members,
            reply: tx,
        })
        .await?;
        rx.await.map_err(|_| RouterError::Closed)?
    }

    pub async fn mark_read(&self, conversation_id: &ConversationId) -> Result<(), RouterError> {
        let (tx, rx) = oneshot::channel();
        self.command(RouterCommand::MarkRead(conversation_id.clone(), tx))
            .await?;
        rx.await.map_err(|_| RouterError::Closed)?
    }

    pub async fn set_pinned(
        &self,
        conversation_id: &ConversationId,
        pinned: bool,
    ) -> Result<(), RouterError> {
        let (tx, rx) = oneshot::channel();
        self.command(RouterCommand::SetPinned(conversation_id.clone(), pinned, tx))
            .await?;
        rx.await.map_err(|_| RouterError::Closed)?
    }

    /// React to a message as the local user. Returns `false` if the same
    /// reaction was already there.
    pub async fn add_reaction(
        &self,
        conversation_id: &ConversationId,
        message_id: MessageId,
        emoji: impl Into<String>,
    ) -> Result<bool, RouterError> {
        let (tx, rx) = oneshot::channel();
        self.command(RouterCommand::AddReaction {
            conversation_id: conversation_id.clone(),
            message_id,
            emoji: emoji.into(),
            reply: tx,
        })
        .await?;
        rx.await.map_err(|_| RouterError::Closed)?
    }

    pub async fn add_attachment(
        &self,
        conversation_id: &ConversationId,
        message_id: MessageId,
        attachment: Attachment,
    ) -> Result<(), RouterError> {
        let (tx, rx) = oneshot::channel();
        self.command(RouterCommand::AddAttachment {
            conversation_id: conversation_id.clone(),
            message_id,
            attachment,
            reply: tx,
        })
        .await?;
        rx.await.map_err(|_| RouterError::Closed)?
    }

    /// Delete a conversation and abort its in-flight deliveries.
    pub async fn remove_conversation(
        &self,
        conversation_id: &ConversationId,
    ) -> Result<(), RouterError> {
        let (tx, rx) = oneshot::channel();
        self.command(RouterCommand::Remove(conversation_id.clone(), tx))
            .await?;
        rx.await.map_err(|_| RouterError::Closed)?
    }

    /// Terminate the router and every channel task.
    pub async fn shutdown(&self) {
        let _ = self.command(RouterCommand::Shutdown).await;
    }

    async fn command(&self, cmd: RouterCommand) -> Result<(), RouterError> {
        self.cmd_tx
            .send(cmd)
            .await
            .map_err(|_| RouterError::Closed)
    }
}

/// Periodic sweep and announce ticks. Exits once the router is gone.
fn spawn_ticker(router: mpsc::WeakSender<RouterCommand>, sweep: Duration, announce: Duration) {
    let floor = Duration::from_millis(1);
    tokio::spawn(async move {
        let mut sweep_tick = tokio::time::interval(sweep.max(floor));
        let mut announce_tick = tokio::time::interval(announce.max(floor));
        // Both fire immediately; start() already announces.
        sweep_tick.tick().await;
        announce_tick.tick().await;

        loop {
            let cmd = tokio::select! {
                _ = sweep_tick.tick() => RouterCommand::Sweep,
                _ = announce_tick.tick() => RouterCommand::Announce,
            };
            let Some(tx) = router.upgrade() else { break };
            if tx.send(cmd).await.is_err() {
                break;
            }
        }
        trace!("Router ticker stopped");
    });
}

struct RouterActor {
    identity: LocalIdentity,
    local: Participant,
    group_topic: Topic,
    store: ConversationStore,
    presence: PresenceTracker,
    channels: BTreeMap<Topic, ChannelHandle>,
    /// Topic each conversation travels on.
    topics: HashMap<ConversationId, Topic>,
    /// In-flight delivery tasks per conversation.
    deliveries: HashMap<ConversationId, HashMap<MessageId, AbortHandle>>,
    snapshot_tx: watch::Sender<Arc<Snapshot>>,
    /// Weak so that dropping every handle still ends the task.
    self_tx: mpsc::WeakSender<RouterCommand>,
}

impl RouterActor {
    async fn run(
        mut self,
        mut cmd_rx: mpsc::Receiver<RouterCommand>,
        mut events_rx: mpsc::Receiver<ChannelEvent>,
    ) {
        info!(participant = %self.local.id, topics = self.channels.len(), "Router task started");

        loop {
            tokio::select! {
                cmd = cmd_rx.recv() => {
                    match cmd {
                        Some(RouterCommand::Shutdown) | None => break,
                        Some(cmd) => self.handle_command(cmd),
                    }
                }

                Some(event) = events_rx.recv() => {
                    self.on_channel_event(event);
                }
            }
        }

        self.teardown();
        info!("Router task terminated");
    }

    fn handle_command(&mut self, cmd: RouterCommand) {
        match cmd {
            RouterCommand::Start(reply) => self.start(reply),
            RouterCommand::Stop(reply) => self.stop(reply),
            RouterCommand::Ingest(envelope, reply) => {
                self.ingest(envelope);
                let _ = reply.send(());
            }
            RouterCommand::Send {
                recipient,
                text,
                reply,
            } => {
                let _ = reply.send(self.send(recipient, &text));
            }
            RouterCommand::OpenDirect { peer, reply } => {
                let _ = reply.send(self.open_direct(peer));
            }
            RouterCommand::OpenGroup {
                topic,
                title,
                members,
                reply,
            } => {
                let _ = reply.send(self.open_group(topic, title, members));
            }
            RouterCommand::MarkRead(id, reply) => {
                let result = self.store.mark_read(&id).map_err(RouterError::from);
                self.reply_and_publish(reply, result);
            }
            RouterCommand::SetPinned(id, pinned, reply) => {
                let result = self.store.set_pinned(&id, pinned).map_err(RouterError::from);
                self.reply_and_publish(reply, result);
            }
            RouterCommand::AddReaction {
                conversation_id,
                message_id,
                emoji,
                reply,
            } => {
                let reaction = Reaction::new(self.local.id.clone(), emoji);
                let result = self
                    .store
                    .add_reaction(&conversation_id, message_id, reaction)
                    .map_err(RouterError::from);
                self.reply_and_publish(reply, result);
            }
            RouterCommand::AddAttachment {
                conversation_id,
                message_id,
                attachment,
                reply,
            } => {
                let result = self
                    .store
                    .add_attachment(&conversation_id, message_id, attachment)
                    .map_err(RouterError::from);
                self.reply_and_publish(reply, result);
            }
            RouterCommand::Remove(id, reply) => {
                let result = self.remove(&id);
                self.reply_and_publish(reply, result);
            }
            RouterCommand::Delivered {
                conversation_id,
                message_id,
                status,
            } => self.on_delivered(&conversation_id, message_id, status),
            RouterCommand::Sweep => self.sweep(),
            RouterCommand::Announce => self.announce(),
            RouterCommand::Shutdown => {}
        }
    }

    fn reply_and_publish<T>(&mut self, reply: Reply<T>, result: Result<T, RouterError>) {
        if result.is_ok() {
            self.publish();
        }
        let _ = reply.send(result);
    }

    // -----------------------------------------------------------------------
    // Lifecycle
    // -----------------------------------------------------------------------

    fn start(&mut self, reply: Reply<()>) {
        let channels: Vec<ChannelHandle> = self.channels.values().cloned().collect();
        let control = self.channels.get(&Topic::Control).cloned();
        let announcement = self.announcement_envelope();

        tokio::spawn(async move {
            let results = join_all(channels.iter().map(|ch| async move { (ch.topic(), ch.start().await) })).await;

            let mut first_err = None;
            for (topic, result) in results {
                if let Err(e) = result {
                    warn!(topic = %topic, error = %e, "Channel failed to start");
                    first_err.get_or_insert(e);
                }
            }

            if let (Some(control), Some(envelope)) = (control, announcement) {
                if let Err(e) = control.send(envelope).await {
                    debug!(error = %e, "Initial announcement not sent");
                }
            }

            let _ = reply.send(match first_err {
                Some(e) => Err(RouterError::Channel(e)),
                None => Ok(()),
            });
        });
    }

    fn stop(&mut self, reply: oneshot::Sender<()>) {
        let channels: Vec<ChannelHandle> = self.channels.values().cloned().collect();
        let control = self.channels.get(&Topic::Control).cloned();
        let leave = match Envelope::control(self.local.id.clone(), &ControlBody::Leave) {
            Ok(env) => Some(env),
            Err(e) => {
                warn!(error = %e, "Failed to encode leave");
                None
            }
        };

        tokio::spawn(async move {
            if let (Some(control), Some(envelope)) = (control, leave) {
                if let Err(e) = control.send(envelope).await {
                    debug!(error = %e, "Leave not sent");
                }
            }
            join_all(channels.iter().map(|ch| ch.stop())).await;
            info!("All channels stopped");
            let _ = reply.send(());
        });
    }

    fn teardown(&mut self) {
        for (_, tasks) in self.deliveries.drain() {
            for (_, task) in tasks {
                task.abort();
            }
        }
        let channels: Vec<ChannelHandle> = self.channels.values().cloned().collect();
        tokio::spawn(async move {
            join_all(channels.iter().map(|ch| ch.shutdown())).await;
        });
    }

    fn on_channel_event(&mut self, event: ChannelEvent) {
        match event {
            ChannelEvent::Envelope(envelope) => self.ingest(envelope),
            ChannelEvent::Fault { topic, error } => {
                warn!(topic = %topic, error = %error, "Channel faulted, restart required");
            }
        }
    }

    // -----------------------------------------------------------------------
    // Inbound
    // -----------------------------------------------------------------------

    fn ingest(&mut self, envelope: Envelope) {
        let topic = match envelope.topic() {
            Ok(topic) => topic,
            Err(e) => {
                debug!(sender = %envelope.sender, error = %e, "Dropping envelope");
                return;
            }
        };

        match envelope.kind {
            EnvelopeKind::Presence => self.on_presence(&envelope),
            EnvelopeKind::Control => self.on_control(&envelope),
            EnvelopeKind::Text => self.on_text(topic, envelope),
            EnvelopeKind::Ack => self.on_ack(topic, &envelope),
        }
    }

    fn on_presence(&mut self, envelope: &Envelope) {
        let announcement = match envelope.announcement() {
            Ok(a) => a,
            Err(e) => {
                debug!(sender = %envelope.sender, error = %e, "Dropping malformed announcement");
                return;
            }
        };

        let Some(transition) = self
            .presence
            .on_announcement(&envelope.sender, &announcement, Utc::now())
        else {
            return;
        };
        trace!(peer = %envelope.sender, ?transition, "Presence updated");

        if let Some(peer) = self.presence.get(&envelope.sender).cloned() {
            self.store.refresh_participant(&peer);
        }
        self.publish();
    }

    fn on_control(&mut self, envelope: &Envelope) {
        match envelope.control_body() {
            Ok(ControlBody::Leave) => {
                if self.presence.on_leave(&envelope.sender).is_some() {
                    self.publish();
                }
            }
            Err(e) => {
                debug!(sender = %envelope.sender, error = %e, "Dropping malformed control body");
            }
        }
    }

    fn on_text(&mut self, topic: Topic, envelope: Envelope) {
        let policy = topic.policy();
        if policy == DeliveryPolicy::Control {
            debug!(topic = %topic, sender = %envelope.sender, "Ignoring text on control topic");
            return;
        }

        let body = match envelope.text_body() {
            Ok(body) => body,
            Err(e) => {
                debug!(topic = %topic, sender = %envelope.sender, error = %e, "Dropping malformed text");
                return;
            }
        };

        let is_local = envelope.sender == self.local.id;
        if policy.is_addressed() && !is_local && !body.participants.contains(&self.local.id) {
            trace!(topic = %topic, sender = %envelope.sender, "Direct message for someone else");
            return;
        }

        let author = self.participant(&envelope.sender, body.display_name.clone());
        let mut participants = vec![self.local.clone()];
        participants.extend(
            body.participants
                .iter()
                .map(|id| self.participant(id, None)),
        );
        participants.push(author.clone());

        let delivery = if is_local {
            DeliveryStatus::Sent
        } else {
            DeliveryStatus::Received
        };
        let message = Message::new(
            envelope.message_id,
            body.text,
            envelope.created_at(),
            author,
            delivery,
        );

        let is_group = policy == DeliveryPolicy::Group;
        let outcome = self
            .store
            .merge(&envelope.conversation_id, participants, is_group, message);
        self.topics
            .entry(envelope.conversation_id.clone())
            .or_insert(topic);

        match outcome {
            MergeOutcome::Inserted { created } => {
                debug!(
                    topic = %topic,
                    conversation = %envelope.conversation_id,
                    sender = %envelope.sender,
                    message = %envelope.message_id,
                    created,
                    "Message merged"
                );
                self.publish();
            }
            MergeOutcome::Duplicate => {}
        }

        // Duplicates are acked again: the first ack may have been lost.
        if is_group && !is_local && envelope.sequence.is_some() {
            self.send_ack(topic, &envelope);
        }
    }

    fn on_ack(&mut self, topic: Topic, envelope: &Envelope) {
        if envelope.sender == self.local.id {
            return;
        }
        let ack = match envelope.ack_body() {
            Ok(ack) => ack,
            Err(e) => {
                debug!(topic = %topic, sender = %envelope.sender, error = %e, "Dropping malformed ack");
                return;
            }
        };
        let Some(channel) = self.channels.get(&topic).cloned() else {
            return;
        };

        let from = envelope.sender.clone();
        tokio::spawn(async move {
            if !channel.acknowledge(ack.message_id).await {
                trace!(topic = %topic, from = %from, message = %ack.message_id, "Ack matched nothing");
            }
        });
    }

    fn send_ack(&self, topic: Topic, original: &Envelope) {
        let Some(channel) = self.channels.get(&topic).cloned() else {
            return;
        };
        let ack = match Envelope::ack(self.local.id.clone(), original) {
            Ok(ack) => ack,
            Err(e) => {
                warn!(topic = %topic, error = %e, "Failed to build ack");
                return;
            }
        };
        tokio::spawn(async move {
            if let Err(e) = channel.send(ack).await {
                debug!(topic = %topic, error = %e, "Ack not sent");
            }
        });
    }

    // -----------------------------------------------------------------------
    // Outbound
    // -----------------------------------------------------------------------

    fn send(&mut self, recipient: Recipient, text: &str) -> Result<MessageId, RouterError> {
        let text = text.trim();
        if text.is_empty() {
            return Err(RouterError::EmptyMessage);
        }

        let conversation_id = &recipient.id;
        let known = self.store.get(conversation_id);
        let is_group = known.map_or(recipient.is_group_chat, |c| c.is_group_chat);
        let topic = self.topic_for(conversation_id, is_group);

        let mut participants: Vec<ParticipantId> = vec![self.local.id.clone()];
        let members = known.map_or(&recipient.participants, |c| &c.participants);
        for p in members {
            if !participants.contains(&p.id) {
                participants.push(p.id.clone());
            }
        }

        let body = TextBody {
            text: text.to_string(),
            display_name: self.identity.display_name.clone(),
            participants,
            group: is_group,
        };
        let envelope = Envelope::text(topic, self.local.id.clone(), conversation_id.clone(), &body)?;
        // Oversize is rejected before any mutation.
        envelope.to_datagram()?;

        if known.is_none() {
            self.create_for_send(&recipient, topic, envelope.created_at())?;
        }

        let message = Message::new(
            envelope.message_id,
            text,
            envelope.created_at(),
            self.local.clone(),
            DeliveryStatus::Pending,
        );
        self.store
            .merge(conversation_id, Vec::new(), is_group, message);
        self.publish();

        let message_id = envelope.message_id;
        debug!(
            topic = %topic,
            conversation = %conversation_id,
            message = %message_id,
            "Message queued"
        );
        self.dispatch(topic, envelope);
        Ok(message_id)
    }

    /// Create the conversation a first outbound message goes to.
    fn create_for_send(
        &mut self,
        recipient: &Recipient,
        topic: Topic,
        now: DateTime<Utc>,
    ) -> Result<(), RouterError> {
        let mut participants = vec![self.local.clone()];
        participants.extend(
            recipient
                .participants
                .iter()
                .map(|p| self.participant(&p.id, p.display_name.clone())),
        );

        self.store
            .ensure(&recipient.id, participants, recipient.is_group_chat, now);
        if recipient.title.is_some() {
            self.store.set_title(&recipient.id, recipient.title.clone())?;
        }
        self.topics.insert(recipient.id.clone(), topic);
        info!(
            conversation = %recipient.id,
            topic = %topic,
            group = recipient.is_group_chat,
            "Conversation created by send"
        );
        Ok(())
    }

    /// Hand the envelope to its channel in a delivery task that reports back.
    fn dispatch(&mut self, topic: Topic, envelope: Envelope) {
        let conversation_id = envelope.conversation_id.clone();
        let message_id = envelope.message_id;

        let Some(channel) = self.channels.get(&topic).cloned() else {
            warn!(topic = %topic, message = %message_id, "Not subscribed to topic, message not delivered");
            self.on_delivered(&conversation_id, message_id, DeliveryStatus::NotDelivered);
            return;
        };

        let router = self.self_tx.clone();
        let task_conversation = conversation_id.clone();
        let task = tokio::spawn(async move {
            let result = if topic.policy().is_reliable() {
                channel
                    .send_reliable(envelope)
                    .await
                    .map(|_| DeliveryStatus::Delivered)
            } else {
                channel.send(envelope).await.map(|_| DeliveryStatus::Sent)
            };

            let status = result.unwrap_or_else(|e: ChannelError| {
                warn!(topic = %topic, message = %message_id, error = %e, "Delivery failed");
                DeliveryStatus::NotDelivered
            });

            if let Some(router) = router.upgrade() {
                let _ = router
                    .send(RouterCommand::Delivered {
                        conversation_id: task_conversation,
                        message_id,
                        status,
                    })
                    .await;
            }
        });

        self.deliveries
            .entry(conversation_id)
            .or_default()
            .insert(message_id, task.abort_handle());
    }

    fn on_delivered(
        &mut self,
        conversation_id: &ConversationId,
        message_id: MessageId,
        status: DeliveryStatus,
    ) {
        if let Some(tasks) = self.deliveries.get_mut(conversation_id) {
            tasks.remove(&message_id);
            if tasks.is_empty() {
                self.deliveries.remove(conversation_id);
            }
        }

        match self.store.set_delivery(conversation_id, message_id, status) {
            Ok(()) => {
                debug!(conversation = %conversation_id, message = %message_id, ?status, "Delivery status updated");
                self.publish();
            }
            // Conversation removed while the delivery was in flight.
            Err(e) => trace!(error = %e, "Delivery result for unknown message"),
        }
    }

    fn topic_for(&self, conversation_id: &ConversationId, is_group: bool) -> Topic {
        match self.topics.get(conversation_id) {
            Some(topic) => *topic,
            None if is_group => self.group_topic,
            None => Topic::Chat,
        }
    }

    // -----------------------------------------------------------------------
    // Conversation management
    // -----------------------------------------------------------------------

    fn open_direct(&mut self, peer: ParticipantId) -> ConversationId {
        let id = ConversationId::direct(&self.local.id, &peer);
        let participants = vec![self.local.clone(), self.participant(&peer, None)];
        if self.store.ensure(&id, participants, false, Utc::now()) {
            self.topics.insert(id.clone(), Topic::Chat);
            self.publish();
        }
        id
    }

    fn open_group(
        &mut self,
        topic: Option<Topic>,
        title: Option<String>,
        members: Vec<ParticipantId>,
    ) -> Result<ConversationId, RouterError> {
        let topic = topic.unwrap_or(self.group_topic);
        if topic.policy() != DeliveryPolicy::Group {
            return Err(RouterError::NotGroupTopic(topic));
        }

        let id = ConversationId::new();
        let mut participants = vec![self.local.clone()];
        participants.extend(members.iter().map(|m| self.participant(m, None)));

        self.store.ensure(&id, participants, true, Utc::now());
        self.store.set_title(&id, title)?;
        self.topics.insert(id.clone(), topic);
        self.publish();
        info!(conversation = %id, topic = %topic, members = members.len(), "Group conversation opened");
        Ok(id)
    }

    fn remove(&mut self, conversation_id: &ConversationId) -> Result<(), RouterError> {
        self.store
            .remove(conversation_id)
            .ok_or_else(|| RouterError::ConversationNotFound(conversation_id.clone()))?;

        let topic = self.topics.remove(conversation_id);
        let Some(tasks) = self.deliveries.remove(conversation_id) else {
            return Ok(());
        };

        let pending: Vec<MessageId> = tasks.keys().copied().collect();
        for task in tasks.values() {
            task.abort();
        }
        info!(conversation = %conversation_id, aborted = pending.len(), "Conversation removed");

        // Release the channel's ack waiters of the aborted sends.
        if let Some(channel) = topic.and_then(|t| self.channels.get(&t)).cloned() {
            tokio::spawn(async move {
                for message_id in pending {
                    channel.cancel(message_id).await;
                }
            });
        }
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Presence
    // -----------------------------------------------------------------------

    fn sweep(&mut self) {
        let changes = self.presence.sweep(Utc::now());
        if !changes.is_empty() {
            debug!(changes = changes.len(), peers = self.presence.peer_count(), "Presence sweep");
            self.publish();
        }
    }

    fn announce(&self) {
        let (Some(control), Some(envelope)) = (
            self.channels.get(&Topic::Control).cloned(),
            self.announcement_envelope(),
        ) else {
            return;
        };
        tokio::spawn(async move {
            if let Err(e) = control.send(envelope).await {
                trace!(error = %e, "Announcement not sent");
            }
        });
    }

    fn announcement_envelope(&self) -> Option<Envelope> {
        let announcement = Announcement {
            display_name: self.identity.display_name.clone(),
            avatar: self.identity.avatar.clone(),
            topics: self.channels.keys().map(|t| t.channel_id()).collect(),
        };
        match Envelope::presence(self.local.id.clone(), &announcement) {
            Ok(env) => Some(env),
            Err(e) => {
                warn!(error = %e, "Failed to encode announcement");
                None
            }
        }
    }

    // -----------------------------------------------------------------------
    // Helpers
    // -----------------------------------------------------------------------

    /// Best known profile for `id`: ourselves, the presence table, or a bare
    /// participant carrying the name from the message.
    fn participant(&self, id: &ParticipantId, display_name: Option<String>) -> Participant {
        if id == &self.local.id {
            return self.local.clone();
        }
        match self.presence.get(id) {
            Some(peer) => {
                let mut peer = peer.clone();
                if peer.display_name.is_none() {
                    peer.display_name = display_name;
                }
                peer
            }
            None => Participant::new(id.clone()).with_display_name(display_name),
        }
    }

    fn publish(&mut self) {
        let snapshot = Snapshot {
            conversations: self.store.conversations().to_vec(),
            peers: self.presence.peers(),
            local: Some(self.local.clone()),
            taken_at: Utc::now(),
            online_threshold_secs: self.presence.config().online_threshold.as_secs(),
        };
        self.snapshot_tx.send_replace(Arc::new(snapshot));
    }
}
