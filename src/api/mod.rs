mod emitter;
mod iterator;
mod manager;

pub use emitter::{EmitError, Emitter};
pub use iterator::{BlockIterator, ReadError};
pub use manager::{DiaId, Manager, ManagerConfig};
