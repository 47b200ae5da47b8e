//! Platform-specific introspection backends. Darwin is the only supported
//! target; the data structures and the file builder above this module stay
//! platform-independent so their logic is testable anywhere.

#[cfg(target_os = "macos")]
pub mod macos;
