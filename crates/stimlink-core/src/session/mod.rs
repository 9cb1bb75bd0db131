//! Per-device protocol sessions: profiles, configuration, debounce, and the
//! trial-running state machine.

pub mod config;
pub mod debounce;
pub mod profile;
mod session;

pub use config::DeviceConfig;
pub use debounce::{Closure, DebouncedSwitch};
pub use profile::DeviceProfile;
pub use session::{
    utc_clock_string, DeviceSession, Outbound, SessionCommand, SessionHandle,
};
