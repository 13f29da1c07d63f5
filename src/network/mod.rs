pub mod connection;
pub mod dht;
pub mod messaging;
pub mod transport;

pub use connection::{Connection, ConnectionManager};
pub use messaging::{CommandProcessor, LoggingCommandProcessor, MessageHandler};
pub use transport::Transport;
