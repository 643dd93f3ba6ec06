pub mod errors;
pub mod event;
pub mod ids;
pub mod path;
pub mod protocol;
pub mod tree;

pub use errors::TurboError;
pub use event::EventClass;
pub use ids::{SessionId, SessionIdAllocator};
pub use protocol::{Ack, ChangeEvent, Command, CommandKind};
pub use tree::{Node, NodeId, PathTree};
