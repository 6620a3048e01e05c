//! pinwheel-core — types shared by every pinwheel component.
//!
//! - [`cpumap`]: compiles range specifications (`"0-3,^2"`) into host CPU bitmaps
//! - [`config`]: `pinwheel.toml` parsing
//! - [`context`]: the request context carried through every RPC
//! - [`sync`]: per-key async locks used to serialize work per instance

pub mod config;
pub mod context;
pub mod cpumap;
pub mod sync;

pub use config::PinwheelConfig;
pub use context::RequestContext;
pub use cpumap::{CpuMap, CpuSpecError, SpecErrorReason, compile, validate};
pub use sync::KeyedLocks;

/// Current epoch time in seconds.
pub fn epoch_secs() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}
