//! Client half of live ambulance tracking: one session per device, joined
//! to a single booking room, streaming its own position and keeping the
//! latest position heard from the other side.

pub mod driver;
pub mod error;
pub mod source;
pub mod state;

pub use driver::{spawn, ReconnectPolicy, SessionCommand, SessionConfig, SessionHandle};
pub use error::SessionError;
pub use source::{LocationSource, SensorFeed, SimulatedRoute};
pub use state::{DispatchStatus, Phase, SessionSnapshot, TrackingSession};
