use tokio::task::JoinHandle;
use tracing::{debug, warn};
use uuid::Uuid;

use vision_db::messages::{InsertOutcome, NewMessage};
use vision_types::ChatError;
use vision_types::events::{SendMessage, ServerEvent, TypingPayload};
use vision_types::models::{ChatMessage, UserId};

use crate::dispatcher::{Dispatcher, Exclude};
use crate::lanes::LaneGuard;
use crate::registry::SessionId;

/// Result of a successful ingest.
#[derive(Debug, Clone, PartialEq)]
pub struct Ingested {
    pub message: ChatMessage,
    /// The client id was already stored; nothing new was written.
    pub duplicate: bool,
    /// The message went out to the chat's connected members. A duplicate is
    /// published again, since the earlier write may have committed after
    /// its caller gave up on it.
    pub published: bool,
}

impl Dispatcher {
    /// Validate, persist and publish a message. The write runs on its own
    /// task, so dropping this future never cancels it.
    pub async fn ingest(&self, sender_id: UserId, payload: SendMessage) -> Result<Ingested, ChatError> {
        let task = self.start_ingest(None, sender_id, payload).await?;
        task.await
            .map_err(|e| ChatError::StorageUnavailable(format!("ingest task: {}", e)))?
    }

    /// Socket entry point: failures are reported to the sending connection.
    pub(crate) async fn submit_message(&self, session_id: SessionId, sender_id: UserId, payload: SendMessage) {
        let client_id = payload.client_id.clone();
        if let Err(err) = self.start_ingest(Some(session_id), sender_id, payload).await {
            debug!("Message from user {} rejected: {}", sender_id, err);
            self.send_error(session_id, "message", &err, client_id).await;
        }
    }

    /// Checks the payload and takes the chat's lane in arrival order, then
    /// hands persist + publish to a detached task.
    async fn start_ingest(
        &self,
        origin: Option<SessionId>,
        sender_id: UserId,
        payload: SendMessage,
    ) -> Result<JoinHandle<Result<Ingested, ChatError>>, ChatError> {
        payload.validate(self.inner.config.max_content_len)?;

        let client_id = payload.client_id.clone();
        let message = NewMessage {
            chat_id: payload.chat_id,
            sender_id,
            content: payload.content,
            kind: payload.kind.as_str().to_string(),
            reply_to_id: payload.reply_to_id,
            file_url: payload.file_url,
            file_name: payload.file_name,
            file_size: payload.file_size,
            client_id: payload
                .client_id
                .unwrap_or_else(|| Uuid::new_v4().to_string()),
        };

        let lane = self.lane(message.chat_id).await;
        let this = self.clone();
        Ok(tokio::spawn(async move {
            let result = this.persist_and_publish(lane, message).await;
            if let Some(session_id) = origin {
                match &result {
                    Ok(ingested) if !ingested.published => {
                        this.inner
                            .registry
                            .send(session_id, ServerEvent::Message(ingested.message.clone()))
                            .await;
                    }
                    Ok(_) => {}
                    Err(err) => {
                        this.send_error(session_id, "message", err, client_id).await;
                    }
                }
            }
            result
        }))
    }

    async fn persist_and_publish(
        &self,
        lane: LaneGuard,
        message: NewMessage,
    ) -> Result<Ingested, ChatError> {
        let chat_id = message.chat_id;
        let sender_id = message.sender_id;

        let outcome = self
            .inner
            .store
            .run("insert_message", move |db| db.insert_message(&message))
            .await?;
        let (row, duplicate) = match outcome {
            InsertOutcome::Inserted(row) => (row, false),
            InsertOutcome::Duplicate(row) => (row, true),
            InsertOutcome::NotMember => return Err(ChatError::Unauthorized),
            InsertOutcome::Blocked => return Err(ChatError::Blocked),
            InsertOutcome::InvalidReply => {
                return Err(ChatError::InvalidPayload(
                    "replyToId does not name a message in this chat".into(),
                ));
            }
        };
        let message = row.into_model();

        if duplicate {
            // A client id reused elsewhere, or a message since deleted, goes
            // back to the caller only.
            if message.chat_id != chat_id || message.deleted {
                debug!(
                    "Duplicate client id from user {} matches message {} in chat {}, not republishing",
                    sender_id, message.id, message.chat_id
                );
                return Ok(Ingested {
                    message,
                    duplicate,
                    published: false,
                });
            }
            debug!(
                "Duplicate client id from user {} in chat {}, republishing message {}",
                sender_id, chat_id, message.id
            );
        }

        let delivered = self
            .broadcast(ServerEvent::Message(message.clone()), chat_id, Exclude::Nobody)
            .await;
        drop(lane);
        debug!(
            "Message {} in chat {} delivered to {} connections",
            message.id, chat_id, delivered
        );

        if self.inner.typing.stop(chat_id, sender_id).await {
            self.broadcast(
                ServerEvent::TypingStop(TypingPayload {
                    chat_id,
                    user_id: sender_id,
                }),
                chat_id,
                Exclude::User(sender_id),
            )
            .await;
        }

        // Notifications are unique per (user, message), so a republish
        // only fills in what an abandoned attempt never queued.
        self.notify_offline_members(&message).await;
        Ok(Ingested {
            message,
            duplicate,
            published: true,
        })
    }

    /// Queue notifications for members with no live connection.
    async fn notify_offline_members(&self, message: &ChatMessage) {
        let chat_id = message.chat_id;
        let members = match self
            .inner
            .store
            .run("chat_member_ids", move |db| db.chat_member_ids(chat_id))
            .await
        {
            Ok(members) => members,
            Err(err) => {
                warn!("Skipping notifications for message {}: {}", message.id, err);
                return;
            }
        };

        let mut offline = Vec::new();
        for user_id in members {
            if user_id != message.sender_id && !self.inner.registry.has_connections(user_id).await {
                offline.push(user_id);
            }
        }
        if offline.is_empty() {
            return;
        }

        let message_id = message.id;
        let text = notification_text(message);
        match self
            .inner
            .store
            .run("enqueue_notifications", move |db| {
                db.enqueue_message_notifications(chat_id, message_id, &offline, &text)
            })
            .await
        {
            Ok(queued) => debug!("Queued {} notifications for message {}", queued, message_id),
            Err(err) => warn!("Could not queue notifications for message {}: {}", message_id, err),
        }
    }
}

fn notification_text(message: &ChatMessage) -> String {
    if !message.content.trim().is_empty() {
        return message.content.clone();
    }
    match &message.file_name {
        Some(name) => format!("[{}] {}", message.kind.as_str(), name),
        None => format!("[{}]", message.kind.as_str()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use crate::dispatcher::tests::{Outbox, drain, harness, harness_with, login, test_config, text};
    use vision_types::ErrorCode;
    use vision_types::events::ClientEvent;
    use vision_types::models::{MessageCursor, MessageType};

    fn message_ids(rx: &mut Outbox) -> Vec<i64> {
        drain(rx)
            .into_iter()
            .filter_map(|e| match e {
                ServerEvent::Message(m) => Some(m.id),
                _ => None,
            })
            .collect()
    }

    /// Hold the writer connection for `hold` on the blocking pool. Resolves
    /// once the lock is taken.
    async fn stall_writer(d: &Dispatcher, hold: Duration) -> JoinHandle<()> {
        let db = d.db().clone();
        let (locked_tx, locked_rx) = tokio::sync::oneshot::channel();
        let holder = tokio::task::spawn_blocking(move || {
            db.with_conn_mut(|_conn| {
                let _ = locked_tx.send(());
                std::thread::sleep(hold);
                Ok(())
            })
            .unwrap();
        });
        locked_rx.await.unwrap();
        holder
    }

    #[tokio::test]
    async fn retried_client_id_is_stored_once_and_republished() {
        let h = harness();
        let d = &h.dispatcher;
        let (_, mut bob) = login(d, h.bob).await;

        let first = d.ingest(h.alice, text(h.chat, "hi", Some("tmp-1"))).await.unwrap();
        let again = d.ingest(h.alice, text(h.chat, "hi", Some("tmp-1"))).await.unwrap();
        assert!(!first.duplicate);
        assert!(again.duplicate && again.published);
        assert_eq!(first.message.id, again.message.id);
        assert_eq!(again.message.client_id.as_deref(), Some("tmp-1"));

        assert_eq!(message_ids(&mut bob), vec![first.message.id, first.message.id]);
        let stored = d.db().messages_after(h.chat, MessageCursor::START, 10).unwrap();
        assert_eq!(stored.len(), 1);
        assert!(d.lanes().is_empty());
    }

    #[tokio::test]
    async fn duplicate_over_the_socket_reaches_the_room_with_the_stored_id() {
        let h = harness();
        let d = &h.dispatcher;
        let (alice_sid, mut alice) = login(d, h.alice).await;
        let (_, mut bob) = login(d, h.bob).await;
        drain(&mut alice);

        let original = d.ingest(h.alice, text(h.chat, "hi", Some("tmp-9"))).await.unwrap();
        drain(&mut alice);
        drain(&mut bob);

        d.handle(alice_sid, ClientEvent::Message(text(h.chat, "hi", Some("tmp-9"))))
            .await;
        let echoed = tokio::time::timeout(Duration::from_secs(2), alice.recv())
            .await
            .unwrap();
        assert!(matches!(echoed, Some(ServerEvent::Message(m)) if m.id == original.message.id));
        assert_eq!(message_ids(&mut bob), vec![original.message.id]);
    }

    #[tokio::test]
    async fn client_id_reused_in_another_chat_goes_back_to_the_sender_only() {
        let h = harness();
        let d = &h.dispatcher;
        let dm = d
            .db()
            .create_chat("individual", "", None, h.alice, &[h.carol])
            .unwrap()
            .unwrap();
        let (alice_sid, mut alice) = login(d, h.alice).await;
        let (_, mut bob) = login(d, h.bob).await;
        let (_, mut carol) = login(d, h.carol).await;

        let original = d.ingest(h.alice, text(h.chat, "team", Some("same"))).await.unwrap();
        drain(&mut alice);
        drain(&mut bob);

        d.handle(alice_sid, ClientEvent::Message(text(dm.id, "dm", Some("same"))))
            .await;
        match tokio::time::timeout(Duration::from_secs(2), alice.recv())
            .await
            .unwrap()
        {
            Some(ServerEvent::Message(m)) => {
                assert_eq!(m.id, original.message.id);
                assert_eq!(m.chat_id, h.chat);
            }
            other => panic!("unexpected {:?}", other),
        }
        assert!(message_ids(&mut bob).is_empty());
        assert!(message_ids(&mut carol).is_empty());
    }

    #[tokio::test]
    async fn write_that_outlives_its_timeout_still_reaches_the_room() {
        let mut config = test_config();
        config.persist_timeout = Duration::from_millis(100);
        let h = harness_with(config);
        let d = &h.dispatcher;
        let (_, mut bob) = login(d, h.bob).await;

        // The first attempt times out while the writer is held; its insert
        // commits later, so the retry may well see a duplicate.
        let holder = stall_writer(d, Duration::from_millis(130)).await;
        let ingested = d.ingest(h.alice, text(h.chat, "hello", Some("slow-1"))).await.unwrap();
        holder.await.unwrap();

        assert!(ingested.published);
        assert_eq!(message_ids(&mut bob), vec![ingested.message.id]);
    }

    #[tokio::test]
    async fn resend_after_storage_unavailable_publishes_the_stored_row() {
        let mut config = test_config();
        config.persist_timeout = Duration::from_millis(100);
        let h = harness_with(config);
        let d = &h.dispatcher;
        let (_, mut bob) = login(d, h.bob).await;

        let holder = stall_writer(d, Duration::from_millis(300)).await;
        let err = d
            .ingest(h.alice, text(h.chat, "hello", Some("slow-2")))
            .await
            .unwrap_err();
        assert!(err.is_transient());
        holder.await.unwrap();
        // Let the abandoned attempts finish against the released writer.
        tokio::time::sleep(Duration::from_millis(50)).await;

        let stored = d.db().messages_after(h.chat, MessageCursor::START, 10).unwrap();
        assert_eq!(stored.len(), 1);
        assert!(message_ids(&mut bob).is_empty());

        let resent = d.ingest(h.alice, text(h.chat, "hello", Some("slow-2"))).await.unwrap();
        assert!(resent.duplicate && resent.published);
        assert_eq!(resent.message.id, stored[0].id);
        assert_eq!(message_ids(&mut bob), vec![stored[0].id]);
    }

    #[tokio::test]
    async fn invalid_payloads_never_reach_storage() {
        let h = harness();
        let d = &h.dispatcher;

        let err = d.ingest(h.alice, text(h.chat, "   ", None)).await.unwrap_err();
        assert!(matches!(err, ChatError::InvalidPayload(_)));

        let mut image = text(h.chat, "", None);
        image.kind = MessageType::Image;
        assert!(matches!(
            d.ingest(h.alice, image).await.unwrap_err(),
            ChatError::InvalidPayload(_)
        ));

        let too_long = "x".repeat(d.config().max_content_len + 1);
        assert!(d.ingest(h.alice, text(h.chat, &too_long, None)).await.is_err());

        let chat_id = h.chat;
        let stored = d
            .db()
            .messages_after(chat_id, MessageCursor::START, 10)
            .unwrap();
        assert!(stored.is_empty());
    }

    #[tokio::test]
    async fn non_members_are_unauthorized() {
        let h = harness();
        let d = &h.dispatcher;
        let (carol_sid, mut carol) = login(d, h.carol).await;

        assert_eq!(
            d.ingest(h.carol, text(h.chat, "let me in", None)).await.unwrap_err(),
            ChatError::Unauthorized
        );

        d.handle(carol_sid, ClientEvent::Message(text(h.chat, "again", Some("c-1"))))
            .await;
        match tokio::time::timeout(Duration::from_secs(2), carol.recv())
            .await
            .unwrap()
        {
            Some(ServerEvent::Error(e)) => {
                assert_eq!(e.code, ErrorCode::Unauthorized);
                assert_eq!(e.event, "message");
                assert_eq!(e.client_id.as_deref(), Some("c-1"));
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[tokio::test]
    async fn reply_must_target_the_same_chat() {
        let h = harness();
        let d = &h.dispatcher;
        let other = d
            .db()
            .create_chat("individual", "", None, h.alice, &[h.carol])
            .unwrap()
            .unwrap();
        let foreign = d.ingest(h.alice, text(other.id, "elsewhere", None)).await.unwrap();

        let mut reply = text(h.chat, "re", None);
        reply.reply_to_id = Some(foreign.message.id);
        assert!(matches!(
            d.ingest(h.alice, reply).await.unwrap_err(),
            ChatError::InvalidPayload(_)
        ));
    }

    #[tokio::test]
    async fn offline_members_are_notified() {
        let h = harness();
        let d = &h.dispatcher;
        let (_, _alice) = login(d, h.alice).await;

        d.ingest(h.alice, text(h.chat, "ping @bob", None)).await.unwrap();

        let queued = d.db().list_notifications(h.bob, true, 10).unwrap();
        assert_eq!(queued.len(), 1);
        assert_eq!(queued[0].content, "ping @bob");
        assert!(d.db().list_notifications(h.alice, true, 10).unwrap().is_empty());
    }

    #[test]
    fn attachment_notifications_describe_the_file() {
        let message = ChatMessage {
            id: 1,
            chat_id: 1,
            sender_id: 1,
            content: String::new(),
            kind: MessageType::File,
            timestamp: chrono::Utc::now(),
            reply_to_id: None,
            file_url: Some("https://files/x.pdf".into()),
            file_name: Some("x.pdf".into()),
            file_size: Some(10),
            edited: false,
            deleted: false,
            client_id: None,
        };
        assert_eq!(notification_text(&message), "[file] x.pdf");
    }
}
