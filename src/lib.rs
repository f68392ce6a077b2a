//! Tabrelay: a controller-facing relay that multiplexes automation sessions
//! over managed browser tabs through one persistent DevTools connection.

pub mod config;
pub mod dispatch;
pub mod server;
pub mod tab_host;

pub use config::RelayConfig;
