use std::collections::HashMap;

use tsb_core::domain::{ConversationId, RawMessage};

/// Upper bound on retained messages; the oldest go first.
const MAX_BACKLOG: usize = 2_000;

/// Messages delivered before the live stream started, indexed for backfill.
///
/// The Bot API has no history endpoint, so this is the only view of "recent"
/// messages a bot session gets.
#[derive(Debug, Default)]
pub struct Backlog {
    messages: Vec<RawMessage>,
}

impl Backlog {
    pub fn push(&mut self, msg: RawMessage) {
        self.messages.push(msg);
        if self.messages.len() > MAX_BACKLOG {
            let excess = self.messages.len() - MAX_BACKLOG;
            self.messages.drain(..excess);
        }
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    /// Conversations ordered by their latest message, most recent first.
    pub fn recent_conversations(&self, limit: usize) -> Vec<ConversationId> {
        let mut latest: HashMap<ConversationId, &RawMessage> = HashMap::new();
        for msg in &self.messages {
            latest
                .entry(msg.conversation)
                .and_modify(|cur| {
                    if (msg.date, msg.message_id) > (cur.date, cur.message_id) {
                        *cur = msg;
                    }
                })
                .or_insert(msg);
        }

        let mut ranked: Vec<_> = latest.into_values().collect();
        ranked.sort_by(|a, b| (b.date, b.message_id).cmp(&(a.date, a.message_id)));
        ranked
            .into_iter()
            .map(|m| m.conversation)
            .take(limit)
            .collect()
    }

    /// Newest messages of one conversation, newest first.
    pub fn recent_messages(&self, conversation: ConversationId, limit: usize) -> Vec<RawMessage> {
        let mut msgs: Vec<&RawMessage> = self
            .messages
            .iter()
            .filter(|m| m.conversation == conversation)
            .collect();
        msgs.sort_by(|a, b| (b.date, b.message_id).cmp(&(a.date, a.message_id)));
        msgs.into_iter().take(limit).cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use chrono::{TimeZone, Utc};
    use tsb_core::domain::MessageId;

    use super::*;

    fn msg(conversation: i64, id: i32, minute: u32) -> RawMessage {
        RawMessage {
            conversation: ConversationId(conversation),
            message_id: MessageId(id),
            text: Some(format!("m{id}")),
            date: Utc.with_ymd_and_hms(2026, 1, 1, 10, minute, 0).unwrap(),
        }
    }

    fn backlog(msgs: Vec<RawMessage>) -> Backlog {
        let mut b = Backlog::default();
        for m in msgs {
            b.push(m);
        }
        b
    }

    #[test]
    fn conversations_rank_by_latest_activity() {
        let b = backlog(vec![msg(1, 1, 0), msg(2, 1, 1), msg(3, 1, 2), msg(1, 2, 3)]);
        assert_eq!(
            b.recent_conversations(10),
            vec![ConversationId(1), ConversationId(3), ConversationId(2)]
        );
        assert_eq!(b.recent_conversations(1), vec![ConversationId(1)]);
    }

    #[test]
    fn messages_are_newest_first_and_limited() {
        let b = backlog(vec![msg(1, 1, 0), msg(1, 2, 1), msg(2, 9, 2), msg(1, 3, 2)]);
        let ids: Vec<i32> = b
            .recent_messages(ConversationId(1), 2)
            .iter()
            .map(|m| m.message_id.0)
            .collect();
        assert_eq!(ids, vec![3, 2]);
        assert!(b.recent_messages(ConversationId(5), 5).is_empty());
    }

    #[test]
    fn oldest_entries_are_dropped_past_the_cap() {
        let mut b = Backlog::default();
        for id in 0..(MAX_BACKLOG as i32 + 5) {
            b.push(msg(1, id, 0));
        }
        assert_eq!(b.len(), MAX_BACKLOG);
        let newest = b.recent_messages(ConversationId(1), 1);
        assert_eq!(newest[0].message_id.0, MAX_BACKLOG as i32 + 4);
    }
}
