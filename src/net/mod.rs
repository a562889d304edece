mod dispatcher;
mod group;

pub use dispatcher::Dispatcher;
pub use group::{execute_local_mock, Connection, Group, TransportError};
