pub mod events;
pub mod fanout;
pub mod handlers;
pub mod message_types;
pub mod registry;
pub mod session;

pub use fanout::{Broker, FanoutBus, MemoryBroker, RedisBroker};
pub use registry::{LocalRoomTable, RoomKey, SessionId};
