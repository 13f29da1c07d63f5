pub mod command;
pub mod config;
pub mod node;
pub mod pending;
pub mod protocol;

pub use command::{CommandDispatcher, CommandOutcome};
pub use config::Config;
pub use node::Node;
pub use pending::{PendingRequest, PendingRequests, RequestKind};
pub use protocol::{Message, Payload, Status};
