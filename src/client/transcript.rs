use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    pub role: Role,
    pub content: String,
}

impl Message {
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: content.into(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: Role::Assistant,
            content: content.into(),
        }
    }
}

/// Running content of the assistant message being streamed.
#[derive(Debug, Default)]
pub struct MessageAccumulator {
    content: String,
    fragments: usize,
}

impl MessageAccumulator {
    /// Returns the full content so far, not the delta.
    pub fn append(&mut self, fragment: &str) -> &str {
        self.content.push_str(fragment);
        self.fragments += 1;
        &self.content
    }

    pub fn content(&self) -> &str {
        &self.content
    }

    pub fn fragment_count(&self) -> usize {
        self.fragments
    }

    pub fn into_content(self) -> String {
        self.content
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum TranscriptError {
    #[error("an assistant message is still streaming")]
    AssistantOpen,
}

/// Ordered conversation history. Everything but the trailing assistant
/// message is immutable once committed.
#[derive(Debug, Default)]
pub struct Transcript {
    committed: Vec<Message>,
    trailing: Option<MessageAccumulator>,
}

impl Transcript {
    pub fn from_messages(messages: Vec<Message>) -> Self {
        Self {
            committed: messages,
            trailing: None,
        }
    }

    pub fn push_user(&mut self, content: impl Into<String>) -> Result<(), TranscriptError> {
        if self.trailing.is_some() {
            return Err(TranscriptError::AssistantOpen);
        }
        self.committed.push(Message::user(content));
        Ok(())
    }

    /// Opens the trailing assistant message on the first call.
    pub fn append_fragment(&mut self, fragment: &str) -> &str {
        self.trailing
            .get_or_insert_with(MessageAccumulator::default)
            .append(fragment)
    }

    pub fn has_open_message(&self) -> bool {
        self.trailing.is_some()
    }

    /// Fragments appended to the open trailing message, zero when none is open.
    pub fn trailing_fragments(&self) -> usize {
        self.trailing
            .as_ref()
            .map_or(0, MessageAccumulator::fragment_count)
    }

    /// Closes the trailing message and returns its final content.
    pub fn commit(&mut self) -> Option<&Message> {
        let accumulator = self.trailing.take()?;
        self.committed
            .push(Message::assistant(accumulator.into_content()));
        self.committed.last()
    }

    pub fn len(&self) -> usize {
        self.committed.len() + usize::from(self.trailing.is_some())
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn messages(&self) -> Vec<Message> {
        let mut messages = self.committed.clone();
        if let Some(trailing) = &self.trailing {
            messages.push(Message::assistant(trailing.content()));
        }
        messages
    }

    /// Every message's content joined by single spaces.
    pub fn prompt(&self) -> String {
        let mut parts: Vec<&str> = self
            .committed
            .iter()
            .map(|message| message.content.as_str())
            .collect();
        if let Some(trailing) = &self.trailing {
            parts.push(trailing.content());
        }
        parts.join(" ")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn trailing_message_holds_cumulative_content() {
        let mut transcript = Transcript::default();
        transcript.push_user("hi").expect("no open message");

        assert_eq!(transcript.append_fragment("Hel"), "Hel");
        assert_eq!(transcript.append_fragment("lo"), "Hello");
        assert_eq!(transcript.len(), 2);
        assert_eq!(transcript.trailing_fragments(), 2);
        assert_eq!(
            transcript.messages(),
            vec![Message::user("hi"), Message::assistant("Hello")]
        );
    }

    #[test]
    fn user_turn_is_refused_while_assistant_is_open() {
        let mut transcript = Transcript::default();
        transcript.push_user("one").expect("no open message");
        transcript.append_fragment("partial");

        assert_eq!(
            transcript.push_user("two"),
            Err(TranscriptError::AssistantOpen)
        );

        let committed = transcript.commit().cloned();
        assert_eq!(committed, Some(Message::assistant("partial")));
        assert!(transcript.push_user("two").is_ok());
    }

    #[test]
    fn commit_without_open_message_is_a_no_op() {
        let mut transcript = Transcript::from_messages(vec![Message::user("hi")]);
        assert!(transcript.commit().is_none());
        assert_eq!(transcript.len(), 1);
    }

    #[test]
    fn prompt_joins_all_contents() {
        let transcript = Transcript::from_messages(vec![
            Message::user("hi"),
            Message::assistant("hello"),
            Message::user("how are you"),
        ]);
        assert_eq!(transcript.prompt(), "hi hello how are you");
    }

    #[test]
    fn accumulator_counts_fragments() {
        let mut accumulator = MessageAccumulator::default();
        accumulator.append("a");
        accumulator.append("b");
        assert_eq!(accumulator.fragment_count(), 2);
        assert_eq!(accumulator.into_content(), "ab");
    }
}
