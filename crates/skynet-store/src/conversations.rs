use std::collections::{HashMap, HashSet};

use chrono::{DateTime, Utc};
use tracing::debug;

use skynet_shared::{ConversationId, MessageId, Participant, ParticipantId};

use crate::error::{Result, StoreError};
use crate::models::{Attachment, Conversation, DeliveryStatus, Message, Reaction};

/// What a merge did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MergeOutcome {
    Inserted {
        /// The conversation did not exist before this message.
        created: bool,
    },
    /// Same `(author, id)` already present; nothing changed.
    Duplicate,
}

/// All conversations known to the client, in recency order.
#[derive(Debug, Clone)]
pub struct ConversationStore {
    local: ParticipantId,
    conversations: Vec<Conversation>,
    seen: HashMap<ConversationId, HashSet<(ParticipantId, MessageId)>>,
}

impl ConversationStore {
    pub fn new(local: ParticipantId) -> Self {
        Self {
            local,
            conversations: Vec::new(),
            seen: HashMap::new(),
        }
    }

    pub fn local(&self) -> &ParticipantId {
        &self.local
    }

    /// Conversations, most recently updated first.
    pub fn conversations(&self) -> &[Conversation] {
        &self.conversations
    }

    pub fn get(&self, id: &ConversationId) -> Option<&Conversation> {
        self.conversations.iter().find(|c| &c.id == id)
    }

    pub fn contains(&self, id: &ConversationId) -> bool {
        self.get(id).is_some()
    }

    pub fn len(&self) -> usize {
        self.conversations.len()
    }

    pub fn is_empty(&self) -> bool {
        self.conversations.is_empty()
    }

    fn get_mut(&mut self, id: &ConversationId) -> Result<&mut Conversation> {
        self.conversations
            .iter_mut()
            .find(|c| &c.id == id)
            .ok_or_else(|| StoreError::ConversationNotFound(id.clone()))
    }

    /// Return the conversation, creating an empty one if it is unknown.
    ///
    /// Returns `true` when it was created.
    pub fn ensure(
        &mut self,
        id: &ConversationId,
        participants: Vec<Participant>,
        is_group_chat: bool,
        now: DateTime<Utc>,
    ) -> bool {
        let (_, created) = self.entry(id, participants, is_group_chat, now);
        if created {
            self.sort();
        }
        created
    }

    /// Find or append the conversation. Callers re-sort afterwards.
    fn entry(
        &mut self,
        id: &ConversationId,
        participants: Vec<Participant>,
        is_group_chat: bool,
        now: DateTime<Utc>,
    ) -> (&mut Conversation, bool) {
        if let Some(pos) = self.conversations.iter().position(|c| &c.id == id) {
            return (&mut self.conversations[pos], false);
        }

        let mut unique: Vec<Participant> = Vec::with_capacity(participants.len());
        for p in participants {
            if !unique.iter().any(|u| u.id == p.id) {
                unique.push(p);
            }
        }

        debug!(
            conversation = %id,
            participants = unique.len(),
            group = is_group_chat,
            "Creating conversation"
        );
        self.seen.insert(id.clone(), HashSet::new());
        self.conversations
            .push(Conversation::new(id.clone(), unique, is_group_chat, now));
        let last = self.conversations.len() - 1;
        (&mut self.conversations[last], true)
    }

    /// Merge a message into `conversation_id`, creating the conversation on
    /// demand from `participants` and `is_group_chat`.
    ///
    /// Idempotent: a second merge of the same `(author, id)` is a no-op.
    /// A message from someone else marks the conversation unread; our own
    /// messages leave the flag as it is.
    pub fn merge(
        &mut self,
        conversation_id: &ConversationId,
        participants: Vec<Participant>,
        is_group_chat: bool,
        message: Message,
    ) -> MergeOutcome {
        let key = message.dedup_key();
        if self
            .seen
            .get(conversation_id)
            .is_some_and(|seen| seen.contains(&key))
        {
            debug!(
                conversation = %conversation_id,
                author = %key.0,
                message = %key.1,
                "Duplicate message dropped"
            );
            return MergeOutcome::Duplicate;
        }

        let is_local = message.author.id == self.local;
        let (conversation, created) = self.entry(
            conversation_id,
            participants,
            is_group_chat,
            message.created_at,
        );
        conversation.add_participant(message.author.clone());
        conversation.insert_ordered(message);
        // Only `mark_read` clears the flag.
        if !is_local {
            conversation.is_read = false;
        }

        self.seen
            .entry(conversation_id.clone())
            .or_default()
            .insert(key);
        self.sort();
        MergeOutcome::Inserted { created }
    }

    pub fn contains_message(
        &self,
        conversation_id: &ConversationId,
        author: &ParticipantId,
        message_id: MessageId,
    ) -> bool {
        self.seen
            .get(conversation_id)
            .is_some_and(|seen| seen.contains(&(author.clone(), message_id)))
    }

    pub fn set_delivery(
        &mut self,
        conversation_id: &ConversationId,
        message_id: MessageId,
        status: DeliveryStatus,
    ) -> Result<()> {
        let message = self
            .get_mut(conversation_id)?
            .message_mut(message_id)
            .ok_or(StoreError::MessageNotFound(message_id))?;
        message.delivery = status;
        Ok(())
    }

    pub fn mark_read(&mut self, conversation_id: &ConversationId) -> Result<()> {
        self.get_mut(conversation_id)?.is_read = true;
        Ok(())
    }

    pub fn set_pinned(&mut self, conversation_id: &ConversationId, pinned: bool) -> Result<()> {
        self.get_mut(conversation_id)?.is_pinned = pinned;
        Ok(())
    }

    pub fn set_title(&mut self, conversation_id: &ConversationId, title: Option<String>) -> Result<()> {
        self.get_mut(conversation_id)?.title = title;
        Ok(())
    }

    /// Add a reaction; the same author reacting with the same emoji twice is
    /// ignored. Returns whether it was added.
    pub fn add_reaction(
        &mut self,
        conversation_id: &ConversationId,
        message_id: MessageId,
        reaction: Reaction,
    ) -> Result<bool> {
        let message = self
            .get_mut(conversation_id)?
            .message_mut(message_id)
            .ok_or(StoreError::MessageNotFound(message_id))?;

        if message
            .reactions
            .iter()
            .any(|r| r.author == reaction.author && r.emoji == reaction.emoji)
        {
            return Ok(false);
        }
        message.updated_at = reaction.created_at;
        message.reactions.push(reaction);
        Ok(true)
    }

    pub fn add_attachment(
        &mut self,
        conversation_id: &ConversationId,
        message_id: MessageId,
        attachment: Attachment,
    ) -> Result<()> {
        let message = self
            .get_mut(conversation_id)?
            .message_mut(message_id)
            .ok_or(StoreError::MessageNotFound(message_id))?;

        if !message.attachments.iter().any(|a| a.id == attachment.id) {
            message.updated_at = Utc::now();
            message.attachments.push(attachment);
        }
        Ok(())
    }

    /// Refresh a participant's profile wherever it appears (member lists
    /// and message authors). Liveness history stays in the conversations
    /// even after the peer leaves the live table.
    pub fn refresh_participant(&mut self, participant: &Participant) {
        for conversation in &mut self.conversations {
            for p in conversation
                .participants
                .iter_mut()
                .filter(|p| p.id == participant.id)
            {
                *p = participant.clone();
            }
            for m in conversation
                .messages
                .iter_mut()
                .filter(|m| m.author.id == participant.id)
            {
                m.author = participant.clone();
            }
        }
    }

    /// Remove a conversation. The core never calls this on its own.
    pub fn remove(&mut self, conversation_id: &ConversationId) -> Option<Conversation> {
        let pos = self
            .conversations
            .iter()
            .position(|c| &c.id == conversation_id)?;
        self.seen.remove(conversation_id);
        Some(self.conversations.remove(pos))
    }

    fn sort(&mut self) {
        self.conversations.sort_by(|a, b| {
            b.updated_at
                .cmp(&a.updated_at)
                .then_with(|| a.id.cmp(&b.id))
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn participant(id: &str) -> Participant {
        Participant::new(ParticipantId::new(id)).with_display_name(Some(id.to_uppercase()))
    }

    fn message(author: &str, text: &str, at: DateTime<Utc>) -> Message {
        Message::new(MessageId::new(), text, at, participant(author), DeliveryStatus::Received)
    }

    fn store() -> ConversationStore {
        ConversationStore::new(ParticipantId::new("jane"))
    }

    #[test]
    fn test_merge_creates_conversation() {
        let mut s = store();
        let conv = ConversationId::new();
        let msg = message("john", "PING?", Utc::now());

        let outcome = s.merge(&conv, vec![participant("jane")], false, msg.clone());
        assert_eq!(outcome, MergeOutcome::Inserted { created: true });

        let c = s.get(&conv).unwrap();
        assert_eq!(c.messages, vec![msg.clone()]);
        assert_eq!(c.updated_at, msg.created_at);
        assert!(!c.is_read);
        assert!(!c.is_group_chat);
        assert!(c.has_participant(&ParticipantId::new("john")));
        assert!(c.has_participant(&ParticipantId::new("jane")));
    }

    #[test]
    fn test_merge_is_idempotent() {
        let mut s = store();
        let conv = ConversationId::new();
        let msg = message("john", "PING?", Utc::now());

        s.merge(&conv, vec![], false, msg.clone());
        assert_eq!(s.merge(&conv, vec![], false, msg.clone()), MergeOutcome::Duplicate);
        assert_eq!(s.get(&conv).unwrap().messages.len(), 1);
        assert!(s.contains_message(&conv, &msg.author.id, msg.id));
    }

    #[test]
    fn test_same_id_from_different_authors_is_not_duplicate() {
        let mut s = store();
        let conv = ConversationId::new();
        let now = Utc::now();
        let a = message("john", "one", now);
        let mut b = message("alex", "two", now);
        b.id = a.id;

        s.merge(&conv, vec![], true, a);
        assert_eq!(
            s.merge(&conv, vec![], true, b),
            MergeOutcome::Inserted { created: false }
        );
        assert_eq!(s.get(&conv).unwrap().messages.len(), 2);
    }

    #[test]
    fn test_out_of_order_arrivals_are_sorted() {
        let mut s = store();
        let conv = ConversationId::new();
        let t0 = Utc::now();

        let late = message("john", "third", t0 + Duration::seconds(2));
        let early = message("alex", "first", t0);
        let middle = message("john", "second", t0 + Duration::seconds(1));

        s.merge(&conv, vec![], true, late.clone());
        s.merge(&conv, vec![], true, early);
        s.merge(&conv, vec![], true, middle);

        let c = s.get(&conv).unwrap();
        let texts: Vec<&str> = c.messages.iter().map(|m| m.text.as_str()).collect();
        assert_eq!(texts, vec!["first", "second", "third"]);
        assert_eq!(c.updated_at, late.created_at);
        assert!(c.invariants_hold());
    }

    #[test]
    fn test_equal_timestamps_tie_break_on_id() {
        let mut s = store();
        let conv = ConversationId::new();
        let now = Utc::now();

        let mut msgs: Vec<Message> = (0..5).map(|i| message("john", &i.to_string(), now)).collect();
        for m in msgs.iter().rev() {
            s.merge(&conv, vec![], false, m.clone());
        }

        msgs.sort_by_key(|m| m.id);
        let stored: Vec<MessageId> = s.get(&conv).unwrap().messages.iter().map(|m| m.id).collect();
        let expected: Vec<MessageId> = msgs.iter().map(|m| m.id).collect();
        assert_eq!(stored, expected);
    }

    #[test]
    fn test_local_author_starts_conversation_read() {
        let mut s = store();
        let conv = ConversationId::new();
        s.merge(&conv, vec![], false, message("jane", "hello", Utc::now()));
        assert!(s.get(&conv).unwrap().is_read);

        s.merge(&conv, vec![], false, message("john", "hi", Utc::now()));
        assert!(!s.get(&conv).unwrap().is_read);
    }

    #[test]
    fn test_own_message_does_not_clear_unread() {
        let mut s = store();
        let conv = ConversationId::new();
        let t0 = Utc::now();

        s.merge(&conv, vec![], false, message("john", "new from john", t0 + Duration::seconds(60)));
        // Older copy of our own message arriving late.
        s.merge(&conv, vec![], false, message("jane", "earlier", t0));

        let c = s.get(&conv).unwrap();
        assert!(!c.is_read);
        assert_eq!(c.last_message().unwrap().text, "new from john");

        s.mark_read(&conv).unwrap();
        s.merge(&conv, vec![], false, message("jane", "reply", t0 + Duration::seconds(120)));
        assert!(s.get(&conv).unwrap().is_read);
    }

    #[test]
    fn test_ensure_then_merge_reports_existing() {
        let mut s = store();
        let conv = ConversationId::new();
        assert!(s.ensure(&conv, vec![participant("jane"), participant("john")], false, Utc::now()));
        assert!(!s.ensure(&conv, vec![], true, Utc::now()));

        assert_eq!(
            s.merge(&conv, vec![], false, message("john", "hi", Utc::now())),
            MergeOutcome::Inserted { created: false }
        );
        let c = s.get(&conv).unwrap();
        assert_eq!(c.participants.len(), 2);
        assert_eq!(c.messages.len(), 1);
    }

    #[test]
    fn test_recency_order() {
        let mut s = store();
        let t0 = Utc::now();
        let a = ConversationId("a".into());
        let b = ConversationId("b".into());

        s.merge(&a, vec![], false, message("john", "old", t0));
        s.merge(&b, vec![], true, message("alex", "new", t0 + Duration::seconds(5)));
        assert_eq!(s.conversations()[0].id, b);

        s.merge(&a, vec![], false, message("john", "newest", t0 + Duration::seconds(10)));
        assert_eq!(s.conversations()[0].id, a);
    }

    #[test]
    fn test_delivery_status_update() {
        let mut s = store();
        let conv = ConversationId::new();
        let mut msg = message("jane", "hi", Utc::now());
        msg.delivery = DeliveryStatus::Pending;
        s.merge(&conv, vec![], false, msg.clone());

        s.set_delivery(&conv, msg.id, DeliveryStatus::NotDelivered).unwrap();
        assert_eq!(
            s.get(&conv).unwrap().message(msg.id).unwrap().delivery,
            DeliveryStatus::NotDelivered
        );

        let unknown = MessageId::new();
        assert_eq!(
            s.set_delivery(&conv, unknown, DeliveryStatus::Sent),
            Err(StoreError::MessageNotFound(unknown))
        );
    }

    #[test]
    fn test_unknown_conversation_errors() {
        let mut s = store();
        let missing = ConversationId("missing".into());
        assert_eq!(
            s.mark_read(&missing),
            Err(StoreError::ConversationNotFound(missing.clone()))
        );
        assert!(s.set_pinned(&missing, true).is_err());
    }

    #[test]
    fn test_reactions_are_deduplicated() {
        let mut s = store();
        let conv = ConversationId::new();
        let msg = message("john", "lunch?", Utc::now());
        s.merge(&conv, vec![], false, msg.clone());

        let jane = ParticipantId::new("jane");
        assert!(s.add_reaction(&conv, msg.id, Reaction::new(jane.clone(), "👍")).unwrap());
        assert!(!s.add_reaction(&conv, msg.id, Reaction::new(jane.clone(), "👍")).unwrap());
        assert!(s.add_reaction(&conv, msg.id, Reaction::new(jane, "🎉")).unwrap());
        assert_eq!(s.get(&conv).unwrap().messages[0].reactions.len(), 2);
    }

    #[test]
    fn test_attachment_added_once() {
        let mut s = store();
        let conv = ConversationId::new();
        let msg = message("john", "photo", Utc::now());
        s.merge(&conv, vec![], false, msg.clone());

        let attachment = Attachment {
            id: "img-1".into(),
            width: 640,
            height: 480,
            url: "blob:img-1".into(),
            file_name: "map.png".into(),
            size: 12_345,
            kind: "image/png".into(),
            thumbnails: vec![],
        };
        s.add_attachment(&conv, msg.id, attachment.clone()).unwrap();
        s.add_attachment(&conv, msg.id, attachment).unwrap();
        assert_eq!(s.get(&conv).unwrap().messages[0].attachments.len(), 1);
    }

    #[test]
    fn test_refresh_participant_updates_authors() {
        let mut s = store();
        let conv = ConversationId::new();
        s.merge(&conv, vec![], true, message("john", "hi", Utc::now()));

        let renamed = Participant::new(ParticipantId::new("john"))
            .with_display_name(Some("Ihor".into()));
        s.refresh_participant(&renamed);

        let c = s.get(&conv).unwrap();
        assert_eq!(c.messages[0].author.label(), "Ihor");
        assert_eq!(
            c.participants
                .iter()
                .find(|p| p.id == renamed.id)
                .unwrap()
                .label(),
            "Ihor"
        );
    }

    #[test]
    fn test_remove_forgets_dedup_history() {
        let mut s = store();
        let conv = ConversationId::new();
        let msg = message("john", "hi", Utc::now());
        s.merge(&conv, vec![], false, msg.clone());

        assert!(s.remove(&conv).is_some());
        assert!(s.is_empty());
        assert_eq!(
            s.merge(&conv, vec![], false, msg),
            MergeOutcome::Inserted { created: true }
        );
    }

    #[test]
    fn test_snapshot_serializes_for_ui() {
        let mut s = store();
        let conv = ConversationId::new();
        s.merge(&conv, vec![], false, message("john", "hi", Utc::now()));

        let json = serde_json::to_value(s.conversations()).unwrap();
        assert_eq!(json[0]["messages"][0]["text"], "hi");
        assert_eq!(json[0]["messages"][0]["delivery"], "Received");
    }
}
