//! Browser control over the Chrome DevTools Protocol.
//!
//! One persistent websocket connection to the browser carries all traffic.
//! The transport owns reconnect/keepalive, the target index names tabs, the
//! session manager handles per-tab attach lifecycles, and `CdpBridge`
//! exposes the tab operations the relay server dispatches to.

pub mod bridge;
pub mod capture;
pub mod config;
mod pending;
pub mod session;
pub mod targets;
pub mod transport;

pub use bridge::{CaptureResult, CdpBridge, TabEvent};
pub use capture::{CaptureMode, CapturePlan, ImageFormat, Rect};
pub use config::{BridgeConfig, TransportConfig};
pub use session::{CdpSessionManager, TabAttacher};
pub use transport::{
    Backoff, CdpTransport, ChromiumTransport, CommandTarget, LinkState, TransportEvent,
};
