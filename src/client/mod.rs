pub mod consumer;
pub mod store;
pub mod transcript;

pub use consumer::{ChatConsumer, Conversation, ExchangeOutcome, ExchangePhase, ModelError};
pub use store::{store_from_config, MessageStore};
pub use transcript::{Message, Role, Transcript};
