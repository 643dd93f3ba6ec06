//! Real-time path subscription server: registry, locks, session hub,
//! command router and the WebSocket/HTTP surface.

pub mod bus;
pub mod config;
pub mod connection;
pub mod health;
pub mod hub;
pub mod locker;
pub mod router;
pub mod server;
pub mod session;

pub use bus::MessageBus;
pub use config::{load_settings, load_settings_from_path, Settings, SettingsError, StorageBackend};
pub use hub::{Hub, Teardown};
pub use locker::PathLocker;
pub use server::{build_router, start, AppState, ServerHandle};
pub use session::{DeliveryError, Session};
