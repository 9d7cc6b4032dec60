use std::{
    collections::VecDeque,
    fmt,
    sync::{Mutex, MutexGuard},
};

use crate::error::MailboxError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Recipient {
    Main,
    Uplink,
}

/// One `subject;content` line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MailboxMessage {
    pub subject: String,
    pub content: String,
}

impl MailboxMessage {
    pub fn new(subject: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            subject: subject.into(),
            content: content.into(),
        }
    }

    pub fn parse(line: &str) -> Result<Self, MailboxError> {
        let fields: Vec<&str> = line.split(';').collect();
        match fields.as_slice() {
            [subject, content] => Ok(Self::new(*subject, *content)),
            _ => Err(MailboxError::FieldCount(fields.len())),
        }
    }
}

impl fmt::Display for MailboxMessage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{};{}", self.subject, self.content)
    }
}

/// Two FIFO inboxes, one per task, each behind its own lock.
#[derive(Debug, Default)]
pub struct Mailbox {
    main: Mutex<VecDeque<String>>,
    uplink: Mutex<VecDeque<String>>,
}

impl Mailbox {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn post(&self, recipient: Recipient, subject: &str, content: &str) {
        let line = format!("{subject};{content}");
        log::trace!("mail to {recipient:?}: {line:?}");
        self.queue(recipient).push_back(line);
    }

    pub fn post_message(&self, recipient: Recipient, message: &MailboxMessage) {
        self.post(recipient, &message.subject, &message.content);
    }

    /// Oldest line for `recipient`, or `None` when the inbox is empty.
    pub fn get(&self, recipient: Recipient) -> Option<String> {
        self.queue(recipient).pop_front()
    }

    pub fn count(&self, recipient: Recipient) -> usize {
        self.queue(recipient).len()
    }

    fn queue(&self, recipient: Recipient) -> MutexGuard<'_, VecDeque<String>> {
        let lock = match recipient {
            Recipient::Main => &self.main,
            Recipient::Uplink => &self.uplink,
        };
        // A panicked poster cannot leave a half-pushed line behind.
        lock.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[cfg(test)]
mod tests {
    use std::{sync::Arc, thread};

    use super::*;

    #[test]
    fn queues_are_fifo_and_independent() {
        let mailbox = Mailbox::new();
        mailbox.post(Recipient::Uplink, "Post", "a");
        mailbox.post(Recipient::Main, "Debug", "x");
        mailbox.post(Recipient::Uplink, "Get", "b");

        assert_eq!(mailbox.count(Recipient::Uplink), 2);
        assert_eq!(mailbox.get(Recipient::Uplink).as_deref(), Some("Post;a"));
        assert_eq!(mailbox.get(Recipient::Uplink).as_deref(), Some("Get;b"));
        assert_eq!(mailbox.get(Recipient::Uplink), None);
        assert_eq!(mailbox.get(Recipient::Main).as_deref(), Some("Debug;x"));
    }

    #[test]
    fn concurrent_posters_lose_nothing() {
        let mailbox = Arc::new(Mailbox::new());
        let workers: Vec<_> = (0..4)
            .map(|n| {
                let mailbox = Arc::clone(&mailbox);
                thread::spawn(move || {
                    for i in 0..50 {
                        mailbox.post(Recipient::Main, "Debug", &format!("{n}-{i}"));
                    }
                })
            })
            .collect();
        for worker in workers {
            worker.join().unwrap();
        }
        assert_eq!(mailbox.count(Recipient::Main), 200);
    }

    #[test]
    fn message_needs_exactly_two_fields() {
        assert_eq!(
            MailboxMessage::parse("Control;Associate"),
            Ok(MailboxMessage::new("Control", "Associate"))
        );
        assert_eq!(
            MailboxMessage::parse("Control"),
            Err(MailboxError::FieldCount(1))
        );
        assert_eq!(
            MailboxMessage::parse("a;b;c"),
            Err(MailboxError::FieldCount(3))
        );
        assert_eq!(MailboxMessage::new("Post", "x/1").to_string(), "Post;x/1");
    }
}
