//! STC BSL protocol implementation and programming session logic.

pub mod error;
pub mod flashing;
pub mod format;
pub mod frame;
pub mod models;
pub mod options;
pub mod protocol;
pub mod transport;

pub use self::error::{Error, Result};
pub use self::flashing::{Flashing, PowerCycle, Progress, SessionConfig};
pub use self::models::McuModel;
pub use self::protocol::{Engine, ProtocolKind};
pub use self::transport::Transport;
