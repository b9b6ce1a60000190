//! Kernel-facing side of the interface.
//!
//! `sys` holds the per-target ABI table, `linux` issues the control
//! requests against it.

#[cfg(target_os = "linux")]
pub mod linux;

#[cfg(target_os = "linux")]
pub mod sys;

#[cfg(target_os = "linux")]
pub use linux::SocketControl;

/// MTU access by interface name.
///
/// The event watcher applies MTU updates through this trait, so tests can
/// swap the socket-backed implementation for an in-memory one.
pub trait MtuControl: Send + Sync {
    /// Get the current MTU of `name`.
    fn mtu(&self, name: &str) -> std::io::Result<u32>;

    /// Set the MTU of `name`.
    fn set_mtu(&self, name: &str, mtu: u32) -> std::io::Result<()>;
}
