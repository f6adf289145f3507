use std::sync::Arc;

use shared::models::{
    ChatStreamEvent, MessageView, PresenceStatus, PresenceUpdate, ReactionUpdate, ReactionView,
    Timestamp, TypingUpdate,
};
use tracing::debug;
use uuid::Uuid;

use super::registry::{ConnectionRegistry, Scope};

/// Fans domain events out through the connection registry. Per-chat
/// streams and per-user session channels collapse into this one facade
/// with two scope kinds. Fire and forget: delivery failures are
/// handled by the registry per connection and never surface to the
/// caller.
#[derive(Debug, Clone)]
pub struct Broadcaster {
    registry: Arc<ConnectionRegistry>,
}

impl Broadcaster {
    #[must_use]
    pub fn new(registry: Arc<ConnectionRegistry>) -> Self {
        Self { registry }
    }

    /// A chat message was persisted; push it to the room, skipping the
    /// sender who already holds it from the optimistic local write.
    pub fn message_created(&self, message: &MessageView, exclude_sender: bool) {
        let exclude = if exclude_sender { message.sender_id } else { None };
        let event = ChatStreamEvent::Message {
            payload: message.clone(),
        };
        debug!(chat_id = %message.chat_id, message_id = %message.id, "broadcasting message");
        self.registry
            .broadcast(Scope::Chat(message.chat_id), &event, exclude);
    }

    /// A membership event happened; narrate it to the room.
    pub fn system_message(&self, message: &MessageView) {
        let event = ChatStreamEvent::System {
            payload: message.clone(),
        };
        self.registry
            .broadcast(Scope::Chat(message.chat_id), &event, None);
    }

    /// A reaction toggled; push the whole updated list so clients
    /// replace rather than merge.
    pub fn reaction_updated(&self, chat_id: Uuid, message_id: Uuid, reactions: Vec<ReactionView>) {
        let event = ChatStreamEvent::Reaction {
            payload: ReactionUpdate {
                chat_id,
                message_id,
                reactions,
            },
        };
        self.registry.broadcast(Scope::Chat(chat_id), &event, None);
    }

    /// Ephemeral typing signal; never persisted.
    pub fn typing(&self, chat_id: Uuid, user_id: Uuid) {
        let event = ChatStreamEvent::Typing {
            payload: TypingUpdate { chat_id, user_id },
        };
        self.registry
            .broadcast(Scope::Chat(chat_id), &event, Some(user_id));
    }

    /// Online/offline badge update, pushed to each chat the user is
    /// active in and to the user's own sessions so open tabs stay in
    /// sync.
    pub fn user_status(
        &self,
        user_id: Uuid,
        status: PresenceStatus,
        last_seen_at: Timestamp,
        chat_ids: &[Uuid],
    ) {
        let event = ChatStreamEvent::UserStatus {
            payload: PresenceUpdate {
                user_id,
                status,
                last_seen_at,
            },
        };
        for chat_id in chat_ids {
            self.registry
                .broadcast(Scope::Chat(*chat_id), &event, Some(user_id));
        }
        self.registry.broadcast_to_user(user_id, &event);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::realtime::registry::Scope;
    use chrono::Utc;
    use shared::config::server::Config;
    use shared::models::MessageType;

    fn message(chat_id: Uuid, sender: Uuid) -> MessageView {
        MessageView {
            id: Uuid::new_v4(),
            chat_id,
            sender_id: Some(sender),
            content: "hello".into(),
            message_type: MessageType::Text,
            attachments: vec![],
            reply_to_id: None,
            reactions: vec![],
            is_edited: false,
            edited_at: None,
            created_at: Timestamp(Utc::now()),
        }
    }

    #[tokio::test]
    async fn message_broadcast_skips_the_sender() {
        let registry = ConnectionRegistry::new(&Config::with_defaults().realtime);
        let broadcaster = Broadcaster::new(Arc::clone(&registry));
        let chat = Uuid::new_v4();
        let sender = Uuid::new_v4();
        let peer = Uuid::new_v4();

        let mut sender_handle = registry.register(sender, Scope::Chat(chat));
        let mut peer_handle = registry.register(peer, Scope::Chat(chat));
        let _ = sender_handle.receiver.recv().await;
        let _ = peer_handle.receiver.recv().await;

        let view = message(chat, sender);
        broadcaster.message_created(&view, true);

        match peer_handle.receiver.recv().await {
            Some(ChatStreamEvent::Message { payload }) => assert_eq!(payload.id, view.id),
            other => panic!("expected message event, got {other:?}"),
        }
        assert!(sender_handle.receiver.try_recv().is_err());
    }

    #[tokio::test]
    async fn system_messages_reach_everyone() {
        let registry = ConnectionRegistry::new(&Config::with_defaults().realtime);
        let broadcaster = Broadcaster::new(Arc::clone(&registry));
        let chat = Uuid::new_v4();
        let user = Uuid::new_v4();

        let mut handle = registry.register(user, Scope::Chat(chat));
        let _ = handle.receiver.recv().await;

        let mut view = message(chat, user);
        view.sender_id = None;
        view.message_type = MessageType::System;
        broadcaster.system_message(&view);

        assert!(matches!(
            handle.receiver.recv().await,
            Some(ChatStreamEvent::System { .. })
        ));
    }

    #[tokio::test]
    async fn user_status_fans_out_to_listed_chats_only() {
        let registry = ConnectionRegistry::new(&Config::with_defaults().realtime);
        let broadcaster = Broadcaster::new(Arc::clone(&registry));
        let chat_in = Uuid::new_v4();
        let chat_out = Uuid::new_v4();
        let watcher = Uuid::new_v4();
        let subject = Uuid::new_v4();

        let mut in_handle = registry.register(watcher, Scope::Chat(chat_in));
        let mut out_handle = registry.register(watcher, Scope::Chat(chat_out));
        let _ = in_handle.receiver.recv().await;
        let _ = out_handle.receiver.recv().await;

        broadcaster.user_status(
            subject,
            PresenceStatus::Online,
            Timestamp(Utc::now()),
            &[chat_in],
        );

        assert!(matches!(
            in_handle.receiver.recv().await,
            Some(ChatStreamEvent::UserStatus { .. })
        ));
        assert!(out_handle.receiver.try_recv().is_err());
    }

    #[tokio::test]
    async fn user_status_reaches_the_subjects_own_sessions() {
        let registry = ConnectionRegistry::new(&Config::with_defaults().realtime);
        let broadcaster = Broadcaster::new(Arc::clone(&registry));
        let subject = Uuid::new_v4();

        let mut own = registry.register(subject, Scope::User(subject));
        let _ = own.receiver.recv().await;

        broadcaster.user_status(subject, PresenceStatus::Offline, Timestamp(Utc::now()), &[]);

        assert!(matches!(
            own.receiver.recv().await,
            Some(ChatStreamEvent::UserStatus { .. })
        ));
    }
}
