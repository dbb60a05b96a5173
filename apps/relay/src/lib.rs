pub mod config;
pub mod relay;
pub mod server;

pub use config::RelayConfig;
pub use relay::{PeerId, RoomRelay};
pub use server::state::AppState;
