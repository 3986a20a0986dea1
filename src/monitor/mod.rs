pub mod alarms;
pub mod commands;
pub mod controller;
mod journal;
mod reports;
pub mod sensors;
pub mod snapshot;
pub mod state;

pub use alarms::{AlarmKind, AlarmPriority, AlarmState};
pub use commands::{CommandContext, Request, Response};
pub use controller::{Monitor, MonitorContext, SubjectCoordinator};
pub use sensors::{SensorKind, SensorValue};
pub use snapshot::SubjectSnapshot;
pub use state::{GlucoseStatus, LinkState};
