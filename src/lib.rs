pub mod config;
pub mod fanout;
pub mod net;
pub mod pool;
pub mod supplier;


// Re-export the pieces a binary needs to wire a relay together.

pub use config::RelayConfig;
pub use fanout::Fanout;
pub use net::{AddrError, ListenAddr, RelayListener, RelayStream};
pub use pool::{Frame, FramePool, PoolStat};
pub use supplier::Supplier;

/// Error returned by most functions.
///
/// The relay's hot path never constructs errors: frames travel as handles and
/// failures are per-connection `io::Error`s handled where they occur. For the
/// remaining surfaces (binding listeners, wiring the service together) a boxed
/// `std::error::Error` is sufficient; the structured cases that callers match
/// on (`AddrError`, `ConfigError`) are defined as `thiserror` enums in their
/// modules.
pub type Error = Box<dyn std::error::Error + Send + Sync>;

/// A specialized `Result` type for relay operations.
///
/// This is defined as a convenience.
pub type Result<T> = std::result::Result<T, Error>;
