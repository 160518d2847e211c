pub mod conversation;
pub mod keys;
pub mod message;
pub mod presence;

pub use conversation::{Conversation, ConversationSummary, LastMessagePreview, MessagePreview};
pub use keys::{
    ExchangeStatus, KeyEntry, KeyExchangeRecord, LegacyKey, RingKey, StoredKeyRecord,
    StoredParticipantKeys,
};
pub use message::{
    EditRecord, MediaRef, Message, MessageKind, MessageStatus, MessageView, Reaction,
    ReplyPreview,
};
pub use presence::{OnlineUser, PresenceEntry, UserDisplay};
