//! Linux TUN/TAP device setup.

use std::io;
use std::os::fd::{AsFd, AsRawFd, BorrowedFd, FromRawFd, OwnedFd};
use std::sync::Arc;

use libc::{
    c_int, c_short, c_ulong, c_void, ioctl, open, socket, AF_INET, O_CLOEXEC, O_NONBLOCK, O_RDWR,
    SOCK_CLOEXEC, SOCK_DGRAM,
};
use tracing::{debug, info, warn};

use super::sys::{
    IfReq, IfReqMtu, CLONE_DEVICE, IFF_MULTI_QUEUE, IFF_NO_PI, IFF_TAP, IFF_TUN, SIOCGIFMTU,
    SIOCSIFMTU, TUNSETGROUP, TUNSETIFF, TUNSETOWNER, TUNSETPERSIST,
};
use super::MtuControl;
use crate::config::{DeviceType, ResolvedConfig};
use crate::error::{Error, Result};
use crate::interface::Interface;

/// Open the clone device in non-blocking mode.
pub fn open_clone_device() -> Result<OwnedFd> {
    let fd = unsafe { open(CLONE_DEVICE.as_ptr(), O_RDWR | O_NONBLOCK | O_CLOEXEC) };
    if fd < 0 {
        return Err(Error::Open {
            path: "/dev/net/tun",
            source: io::Error::last_os_error(),
        });
    }
    Ok(unsafe { OwnedFd::from_raw_fd(fd) })
}

/// TUNSETIFF flags for a device type: exactly one of TUN/TAP, never packet info.
pub fn device_flags(device_type: DeviceType, multi_queue: bool) -> c_short {
    let mut flags = match device_type {
        DeviceType::Tun => IFF_TUN,
        DeviceType::Tap => IFF_TAP,
    } | IFF_NO_PI;
    if multi_queue {
        flags |= IFF_MULTI_QUEUE;
    }
    flags
}

/// Attach `fd` to an interface and return the name the kernel assigned.
pub fn set_interface_flags(fd: BorrowedFd<'_>, name: &str, flags: c_short) -> Result<String> {
    let mut ifr = IfReq::new(name, flags);
    if unsafe { ioctl(fd.as_raw_fd(), TUNSETIFF as _, &mut ifr as *mut _ as *mut c_void) } < 0 {
        return Err(Error::control("TUNSETIFF"));
    }
    let assigned = ifr.name();
    debug!("TUNSETIFF {:#06x} '{}' -> '{}'", flags, name, assigned);
    Ok(assigned)
}

fn set_value(fd: BorrowedFd<'_>, request: c_ulong, name: &'static str, value: c_ulong) -> Result<()> {
    if unsafe { ioctl(fd.as_raw_fd(), request as _, value) } < 0 {
        return Err(Error::control(name));
    }
    debug!("{} = {}", name, value);
    Ok(())
}

/// TUNSETOWNER - let `owner` use the device without CAP_NET_ADMIN.
pub fn set_owner(fd: BorrowedFd<'_>, owner: u32) -> Result<()> {
    set_value(fd, TUNSETOWNER, "TUNSETOWNER", owner as c_ulong)
}

/// TUNSETGROUP - let members of `group` use the device.
pub fn set_group(fd: BorrowedFd<'_>, group: u32) -> Result<()> {
    set_value(fd, TUNSETGROUP, "TUNSETGROUP", group as c_ulong)
}

/// TUNSETPERSIST - keep the interface after the last descriptor closes.
pub fn set_persist(fd: BorrowedFd<'_>, persist: bool) -> Result<()> {
    set_value(fd, TUNSETPERSIST, "TUNSETPERSIST", persist as c_ulong)
}

/// Create a control socket for ioctl operations.
fn control_socket() -> io::Result<OwnedFd> {
    let fd = unsafe { socket(AF_INET, SOCK_DGRAM | SOCK_CLOEXEC, 0) };
    if fd < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(unsafe { OwnedFd::from_raw_fd(fd) })
}

/// Get the MTU of `name` through a control socket.
pub fn get_mtu(name: &str) -> io::Result<u32> {
    let sock = control_socket()?;
    let mut ifr = IfReqMtu::new(name, 0);
    if unsafe { ioctl(sock.as_raw_fd(), SIOCGIFMTU as _, &mut ifr as *mut _ as *mut c_void) } < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(ifr.ifr_mtu as u32)
}

/// Set the MTU of `name` through a control socket.
pub fn set_mtu(name: &str, mtu: u32) -> io::Result<()> {
    let mtu = c_int::try_from(mtu)
        .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "MTU out of range"))?;
    let sock = control_socket()?;
    let mut ifr = IfReqMtu::new(name, mtu);
    if unsafe { ioctl(sock.as_raw_fd(), SIOCSIFMTU as _, &mut ifr as *mut _ as *mut c_void) } < 0 {
        return Err(io::Error::last_os_error());
    }
    debug!("Set MTU to {} on {}", mtu, name);
    Ok(())
}

/// MTU control over an `AF_INET` datagram socket.
#[derive(Debug, Default, Clone, Copy)]
pub struct SocketControl;

impl MtuControl for SocketControl {
    fn mtu(&self, name: &str) -> io::Result<u32> {
        get_mtu(name)
    }

    fn set_mtu(&self, name: &str, mtu: u32) -> io::Result<()> {
        set_mtu(name, mtu)
    }
}

/// Open the clone device and run the setup sequence.
///
/// The descriptor is owned from the moment it is opened, so every early
/// return below closes it.
pub fn create(config: &ResolvedConfig) -> Result<Interface> {
    let fd = open_clone_device()?;

    let flags = device_flags(config.device_type, config.multi_queue);
    let name = set_interface_flags(fd.as_fd(), &config.name, flags)?;

    if let Some(perm) = config.permissions {
        set_owner(fd.as_fd(), perm.owner)?;
        set_group(fd.as_fd(), perm.group)?;
    }
    set_persist(fd.as_fd(), config.persist)?;

    let control = Arc::new(SocketControl);
    if let Err(source) = control.set_mtu(&name, config.mtu) {
        if config.persist {
            // Don't leave a half-configured persistent interface behind.
            if let Err(e) = set_persist(fd.as_fd(), false) {
                warn!("Failed to clear persist flag on {}: {}", name, e);
            }
        }
        return Err(Error::Mtu { name, source });
    }

    info!(
        "Created {} device: {} (mtu {}{}{})",
        config.device_type,
        name,
        config.mtu,
        if config.persist { ", persistent" } else { "" },
        if config.multi_queue { ", multi-queue" } else { "" },
    );

    Interface::from_parts(fd, name, config.device_type, control)
}
