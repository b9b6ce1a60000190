//! Interface configuration and default resolution.

use std::fmt;
use std::fs;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Default MTU applied when the config leaves it unset.
pub const DEFAULT_MTU: u32 = 1500;

/// Smallest MTU the kernel accepts for an IPv4-capable link.
pub const MIN_MTU: u32 = 68;

/// Largest MTU the tun driver accepts.
pub const MAX_MTU: u32 = 65535;

/// Longest interface name the kernel stores (IFNAMSIZ minus the NUL).
pub const MAX_NAME_LEN: usize = 15;

/// Kind of virtual device to create.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeviceType {
    /// Layer 3: raw IP packets.
    #[default]
    Tun,
    /// Layer 2: raw Ethernet frames.
    Tap,
}

impl DeviceType {
    /// Pick a device type from flag-style input, rejecting both at once.
    ///
    /// Neither flag set selects TUN.
    pub fn from_flags(tun: bool, tap: bool) -> Result<Self> {
        match (tun, tap) {
            (true, true) => Err(Error::config("only one of TUN or TAP may be requested")),
            (_, true) => Ok(Self::Tap),
            _ => Ok(Self::Tun),
        }
    }
}

impl fmt::Display for DeviceType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DeviceType::Tun => write!(f, "tun"),
            DeviceType::Tap => write!(f, "tap"),
        }
    }
}

/// Owner and group granted access to the device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Permissions {
    pub owner: u32,
    pub group: u32,
}

/// User-supplied interface options.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    /// TUN or TAP (default: TUN)
    #[serde(default)]
    pub device_type: DeviceType,

    /// Requested name; may be a template such as "tun%d". None lets the kernel pick.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,

    /// MTU (default: 1500)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mtu: Option<u32>,

    /// Keep the interface after the creating process exits
    #[serde(default)]
    pub persist: bool,

    /// Hand the device to another user and group
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub permissions: Option<Permissions>,

    /// Allow several descriptors to attach to the same interface
    #[serde(default)]
    pub multi_queue: bool,
}

/// Config with defaults applied and validated.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedConfig {
    pub device_type: DeviceType,
    /// Empty means kernel-assigned.
    pub name: String,
    pub mtu: u32,
    pub persist: bool,
    pub permissions: Option<Permissions>,
    pub multi_queue: bool,
}

impl Config {
    /// Config for a TUN device with all defaults.
    pub fn tun() -> Self {
        Self {
            device_type: DeviceType::Tun,
            ..Self::default()
        }
    }

    /// Config for a TAP device with all defaults.
    pub fn tap() -> Self {
        Self {
            device_type: DeviceType::Tap,
            ..Self::default()
        }
    }

    /// Request a name or template.
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    /// Set the MTU.
    pub fn with_mtu(mut self, mtu: u32) -> Self {
        self.mtu = Some(mtu);
        self
    }

    /// Keep the interface after exit.
    pub fn with_persist(mut self, persist: bool) -> Self {
        self.persist = persist;
        self
    }

    /// Hand the device to `owner` and `group`.
    pub fn with_permissions(mut self, owner: u32, group: u32) -> Self {
        self.permissions = Some(Permissions { owner, group });
        self
    }

    /// Enable multi-queue mode.
    pub fn with_multi_queue(mut self, multi_queue: bool) -> Self {
        self.multi_queue = multi_queue;
        self
    }

    /// Load configuration from a JSON file.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = fs::read_to_string(path.as_ref())?;
        Ok(serde_json::from_str(&content)?)
    }

    /// Save configuration to a JSON file.
    pub fn to_file<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let content = serde_json::to_string_pretty(self)?;
        fs::write(path.as_ref(), content)?;
        Ok(())
    }

    /// Apply defaults and validate.
    pub fn resolve(self) -> Result<ResolvedConfig> {
        let name = self.name.unwrap_or_default();
        if name.len() > MAX_NAME_LEN {
            return Err(Error::config(format!(
                "interface name '{}' exceeds {} bytes",
                name, MAX_NAME_LEN
            )));
        }
        if name.contains(['\0', '/']) {
            return Err(Error::config(format!(
                "interface name '{}' contains an invalid character",
                name.escape_default()
            )));
        }

        let mtu = self.mtu.unwrap_or(DEFAULT_MTU);
        if !(MIN_MTU..=MAX_MTU).contains(&mtu) {
            return Err(Error::config(format!(
                "MTU {} outside {}..={}",
                mtu, MIN_MTU, MAX_MTU
            )));
        }

        Ok(ResolvedConfig {
            device_type: self.device_type,
            name,
            mtu,
            persist: self.persist,
            permissions: self.permissions,
            multi_queue: self.multi_queue,
        })
    }
}
