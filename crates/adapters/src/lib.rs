//! Backend adapters: per-backend launch profiles, wire pumps, and the
//! translator seam between native protocols and [`bc_protocol::UnifiedMessage`].
//!
//! Three connection shapes are covered:
//! - stdio: line-delimited JSON over a supervised child's pipes
//! - app-server: the broker dials out to a WebSocket the child listens on
//! - sdk-url: the child dials into the broker's WebSocket server

pub mod inverted;
pub mod profiles;
pub mod remote;
pub mod rpc;
pub mod stdio;
pub mod translate;

pub use inverted::SdkUrlAdapter;
pub use profiles::{ClaudeProfile, CodexProfile, GeminiProfile};
pub use remote::{AppServerAdapter, ReconnectBackoff};
pub use rpc::RpcTracker;
pub use stdio::StdioAdapter;
pub use translate::{CarrierTranslator, Translator};
