pub mod connection;
pub mod errors;
pub mod events;
pub mod ids;

pub use connection::{
    CloseReason, Connection, ConnectionEvent, ConnectionFactory, ConnectionHandle, ConnectionState,
    ConnectionUpdate,
};
pub use errors::ConnectionError;
pub use events::SessionEvent;
pub use ids::{IdError, SessionId};
