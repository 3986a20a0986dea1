pub mod event;
pub mod reading;

pub use event::{Event, EventKind, NewEvent};
pub use reading::StoredReading;
