//! TUN/TAP virtual network interfaces.
//!
//! ```no_run
//! use vnic::{Config, Interface};
//!
//! let iface = Interface::new(Config::tun().with_mtu(1400))?;
//! let mut buf = vec![0u8; 1500];
//! let n = iface.read(&mut buf, 0)?;
//! println!("{}: {} byte packet", iface.name(), n);
//! iface.close()?;
//! # Ok::<(), vnic::Error>(())
//! ```

pub mod adapter;
pub mod config;
pub mod error;
pub mod events;
#[cfg(target_os = "linux")]
pub mod interface;

// Re-export main types
pub use adapter::MtuControl;
pub use config::{Config, DeviceType, Permissions, ResolvedConfig, DEFAULT_MTU};
pub use error::{Error, Result};
pub use events::{Event, EventSender};
#[cfg(target_os = "linux")]
pub use interface::Interface;
