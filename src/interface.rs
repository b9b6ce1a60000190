//! The virtual interface handle.
//!
//! An [`Interface`] is `Open` from creation until the first [`Interface::close`],
//! then `Closed` for good. Packet I/O holds a shared guard on the descriptor
//! for the duration of the syscall; `close` wakes every blocked caller through
//! an eventfd before taking the exclusive guard, so the descriptor is only
//! released once nobody is using it.

use std::io;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use libc::{
    c_int, c_short, c_void, eventfd, poll, pollfd, EFD_CLOEXEC, EFD_NONBLOCK, POLLIN, POLLOUT,
};
use parking_lot::{Mutex, RwLock};
use tracing::{debug, info, trace, warn};

use crate::adapter::MtuControl;
use crate::config::{Config, DeviceType};
use crate::error::{Error, Result};
use crate::events::{self, EventSender, EventWatcher};

/// Poll tick while blocked in `read`. The wake handle normally ends the wait first.
const READ_POLL_MS: c_int = 100;

/// How many times `write` waits for room before giving up.
const WRITE_RETRIES: usize = 3;

/// Wait per write retry.
const WRITE_RETRY_MS: c_int = 10;

/// A TUN or TAP interface backed by an open device descriptor.
pub struct Interface {
    device_type: DeviceType,
    name: String,
    fd: RwLock<Option<OwnedFd>>,
    /// eventfd signalled once by `close`; stays readable afterwards.
    wake: OwnedFd,
    closed: Arc<AtomicBool>,
    events: EventSender,
    watcher: Mutex<Option<EventWatcher>>,
    control: Arc<dyn MtuControl>,
}

enum Ready {
    Device,
    Woken,
    Timeout,
}

impl Interface {
    /// Create a new interface from `config`.
    pub fn new(config: Config) -> Result<Self> {
        let resolved = config.resolve()?;
        crate::adapter::linux::create(&resolved)
    }

    /// Wrap an already configured descriptor and start its event watcher.
    pub(crate) fn from_parts(
        fd: OwnedFd,
        name: String,
        device_type: DeviceType,
        control: Arc<dyn MtuControl>,
    ) -> Result<Self> {
        let wake = unsafe { eventfd(0, EFD_CLOEXEC | EFD_NONBLOCK) };
        if wake < 0 {
            return Err(Error::Io(io::Error::last_os_error()));
        }
        let wake = unsafe { OwnedFd::from_raw_fd(wake) };

        let closed = Arc::new(AtomicBool::new(false));
        let (events, rx) = events::queue(closed.clone());
        let watcher = EventWatcher::spawn(name.clone(), rx, control.clone())?;

        Ok(Self {
            device_type,
            name,
            fd: RwLock::new(Some(fd)),
            wake,
            closed,
            events,
            watcher: Mutex::new(Some(watcher)),
            control,
        })
    }

    /// Name assigned by the kernel.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Whether this is a TUN or a TAP device.
    pub fn device_type(&self) -> DeviceType {
        self.device_type
    }

    /// True for a layer 3 (IP) device.
    pub fn is_tun(&self) -> bool {
        self.device_type == DeviceType::Tun
    }

    /// True for a layer 2 (Ethernet) device.
    pub fn is_tap(&self) -> bool {
        self.device_type == DeviceType::Tap
    }

    /// True once `close` has been called.
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Handle for queueing reconfiguration events.
    pub fn events(&self) -> EventSender {
        self.events.clone()
    }

    /// Current MTU as reported by the kernel.
    pub fn mtu(&self) -> Result<u32> {
        self.control.mtu(&self.name).map_err(|source| Error::Mtu {
            name: self.name.clone(),
            source,
        })
    }

    /// Read one frame into `buf[offset..]`, blocking until it arrives.
    ///
    /// Returns [`Error::Closed`] if the interface is closed before or during
    /// the call. The target `buf[offset..]` must not be empty, since a
    /// zero-length read returns at once without consuming a frame.
    pub fn read(&self, buf: &mut [u8], offset: usize) -> Result<usize> {
        let len = buf.len();
        let buf = match buf.get_mut(offset..) {
            Some(target) if !target.is_empty() => target,
            _ => return Err(Error::InvalidOffset { offset, len }),
        };

        let guard = self.fd.read();
        let fd = match guard.as_ref() {
            Some(fd) if !self.is_closed() => fd.as_raw_fd(),
            _ => return Err(Error::Closed),
        };

        loop {
            if self.is_closed() {
                return Err(Error::Closed);
            }

            let n = unsafe { libc::read(fd, buf.as_mut_ptr() as *mut c_void, buf.len()) };
            if n >= 0 {
                trace!("{}: read {} bytes", self.name, n);
                return Ok(n as usize);
            }

            let err = io::Error::last_os_error();
            match err.kind() {
                io::ErrorKind::WouldBlock => {}
                io::ErrorKind::Interrupted => continue,
                _ => return Err(err.into()),
            }

            if let Ready::Woken = self.wait(fd, POLLIN, READ_POLL_MS)? {
                debug!("{}: pending read interrupted by close", self.name);
                return Err(Error::Closed);
            }
        }
    }

    /// Write `buf[offset..]` as a single frame.
    ///
    /// Either the whole frame is accepted or an error is returned; a device
    /// that stays full through the retries yields [`Error::WouldBlock`].
    pub fn write(&self, buf: &[u8], offset: usize) -> Result<usize> {
        let frame = buf.get(offset..).ok_or(Error::InvalidOffset {
            offset,
            len: buf.len(),
        })?;

        let guard = self.fd.read();
        let fd = match guard.as_ref() {
            Some(fd) if !self.is_closed() => fd.as_raw_fd(),
            _ => return Err(Error::Closed),
        };

        let mut retries = 0;
        loop {
            if self.is_closed() {
                return Err(Error::Closed);
            }

            let n = unsafe { libc::write(fd, frame.as_ptr() as *const c_void, frame.len()) };
            if n >= 0 {
                let n = n as usize;
                if n != frame.len() {
                    return Err(Error::ShortWrite {
                        written: n,
                        expected: frame.len(),
                    });
                }
                trace!("{}: wrote {} bytes", self.name, n);
                return Ok(n);
            }

            let err = io::Error::last_os_error();
            match err.kind() {
                io::ErrorKind::WouldBlock if retries < WRITE_RETRIES => retries += 1,
                io::ErrorKind::WouldBlock => return Err(Error::WouldBlock),
                io::ErrorKind::Interrupted => continue,
                _ => return Err(err.into()),
            }

            if let Ready::Woken = self.wait(fd, POLLOUT, WRITE_RETRY_MS)? {
                return Err(Error::Closed);
            }
        }
    }

    /// Close the interface.
    ///
    /// Wakes blocked readers and writers, releases the descriptor once they
    /// have let go of it and stops the event watcher. Calling it again is a
    /// no-op that still returns only after the descriptor is gone.
    pub fn close(&self) -> Result<()> {
        let first = !self.closed.swap(true, Ordering::AcqRel);
        if first {
            self.signal_wake();
        }

        // Waits for in-flight read/write calls to drop their shared guards.
        let fd = self.fd.write().take();

        let watcher = self.watcher.lock().take();
        if let Some(watcher) = watcher {
            watcher.stop();
        }

        if let Some(fd) = fd {
            drop(fd);
            info!("Closed {} device: {}", self.device_type, self.name);
        }
        Ok(())
    }

    fn signal_wake(&self) {
        let one: u64 = 1;
        let n = unsafe {
            libc::write(
                self.wake.as_raw_fd(),
                &one as *const u64 as *const c_void,
                std::mem::size_of::<u64>(),
            )
        };
        if n < 0 {
            // Blocked callers still notice the closed flag on the next poll tick.
            warn!(
                "{}: failed to signal close: {}",
                self.name,
                io::Error::last_os_error()
            );
        }
    }

    /// Wait until `fd` is ready for `events`, the wake handle fires, or the timeout expires.
    fn wait(&self, fd: RawFd, events: c_short, timeout_ms: c_int) -> Result<Ready> {
        let mut fds = [
            pollfd {
                fd,
                events,
                revents: 0,
            },
            pollfd {
                fd: self.wake.as_raw_fd(),
                events: POLLIN,
                revents: 0,
            },
        ];

        let rc = unsafe { poll(fds.as_mut_ptr(), fds.len() as libc::nfds_t, timeout_ms) };
        if rc < 0 {
            let err = io::Error::last_os_error();
            if err.kind() == io::ErrorKind::Interrupted {
                return Ok(Ready::Timeout);
            }
            return Err(err.into());
        }

        if fds[1].revents != 0 {
            Ok(Ready::Woken)
        } else if rc == 0 {
            Ok(Ready::Timeout)
        } else {
            Ok(Ready::Device)
        }
    }
}

impl Drop for Interface {
    fn drop(&mut self) {
        if let Err(e) = self.close() {
            warn!("Error closing {}: {}", self.name, e);
        }
    }
}

impl std::fmt::Debug for Interface {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Interface")
            .field("device_type", &self.device_type)
            .field("name", &self.name)
            .field("closed", &self.is_closed())
            .finish()
    }
}

impl io::Read for &Interface {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        Interface::read(*self, buf, 0).map_err(Into::into)
    }
}

impl io::Write for &Interface {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        Interface::write(*self, buf, 0).map_err(Into::into)
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::tests::{wait_for, MemoryControl};
    use crate::events::Event;
    use std::thread;
    use std::time::{Duration, Instant};

    /// An interface over one end of a seqpacket socketpair; the other end plays the kernel.
    fn socket_interface(device_type: DeviceType) -> (Arc<Interface>, OwnedFd, Arc<MemoryControl>) {
        let mut fds = [0 as c_int; 2];
        let rc = unsafe {
            libc::socketpair(
                libc::AF_UNIX,
                libc::SOCK_SEQPACKET | libc::SOCK_NONBLOCK | libc::SOCK_CLOEXEC,
                0,
                fds.as_mut_ptr(),
            )
        };
        assert_eq!(rc, 0, "socketpair: {}", io::Error::last_os_error());
        let (ours, peer) = unsafe { (OwnedFd::from_raw_fd(fds[0]), OwnedFd::from_raw_fd(fds[1])) };

        let control = Arc::new(MemoryControl::default());
        control.mtus.lock().insert("vtest0".into(), 1500);
        let iface = Interface::from_parts(ours, "vtest0".into(), device_type, control.clone())
            .expect("interface");
        (Arc::new(iface), peer, control)
    }

    fn peer_send(peer: &OwnedFd, data: &[u8]) {
        let n = unsafe { libc::write(peer.as_raw_fd(), data.as_ptr() as *const c_void, data.len()) };
        assert_eq!(n, data.len() as isize);
    }

    fn peer_recv(peer: &OwnedFd) -> Vec<u8> {
        let mut buf = vec![0u8; 2048];
        let n = unsafe { libc::read(peer.as_raw_fd(), buf.as_mut_ptr() as *mut c_void, buf.len()) };
        assert!(n >= 0, "peer read: {}", io::Error::last_os_error());
        buf.truncate(n as usize);
        buf
    }

    #[test]
    fn test_accessors() {
        let (iface, _peer, _) = socket_interface(DeviceType::Tap);
        assert_eq!(iface.name(), "vtest0");
        assert!(iface.is_tap());
        assert!(!iface.is_tun());
        assert!(!iface.is_closed());
        assert_eq!(iface.mtu().unwrap(), 1500);
    }

    #[test]
    fn test_read_at_offset() {
        let (iface, peer, _) = socket_interface(DeviceType::Tun);
        peer_send(&peer, &[0x45, 0, 0, 20]);

        let mut buf = [0xffu8; 16];
        let n = iface.read(&mut buf, 4).unwrap();
        assert_eq!(n, 4);
        assert_eq!(&buf[..4], &[0xff; 4]);
        assert_eq!(&buf[4..8], &[0x45, 0, 0, 20]);
    }

    #[test]
    fn test_read_blocks_until_frame_arrives() {
        let (iface, peer, _) = socket_interface(DeviceType::Tun);
        let reader = {
            let iface = iface.clone();
            thread::spawn(move || {
                let mut buf = [0u8; 64];
                let n = iface.read(&mut buf, 0)?;
                Ok::<_, Error>(buf[..n].to_vec())
            })
        };

        thread::sleep(Duration::from_millis(150));
        peer_send(&peer, b"frame");
        assert_eq!(reader.join().unwrap().unwrap(), b"frame");
    }

    #[test]
    fn test_write_whole_frame_at_offset() {
        let (iface, peer, _) = socket_interface(DeviceType::Tap);
        let n = iface.write(b"xxpayload", 2).unwrap();
        assert_eq!(n, 7);
        assert_eq!(peer_recv(&peer), b"payload");
    }

    #[test]
    fn test_invalid_offset() {
        let (iface, _peer, _) = socket_interface(DeviceType::Tun);
        let mut buf = [0u8; 4];
        assert!(matches!(
            iface.read(&mut buf, 5),
            Err(Error::InvalidOffset { offset: 5, len: 4 })
        ));
        assert!(matches!(
            iface.write(&buf, 9),
            Err(Error::InvalidOffset { offset: 9, len: 4 })
        ));
    }

    #[test]
    fn test_read_into_empty_target_rejected() {
        let (iface, peer, _) = socket_interface(DeviceType::Tun);
        peer_send(&peer, b"frame");

        let mut buf = [0u8; 8];
        assert!(matches!(
            iface.read(&mut buf, 8),
            Err(Error::InvalidOffset { offset: 8, len: 8 })
        ));
        assert!(matches!(
            iface.read(&mut [], 0),
            Err(Error::InvalidOffset { offset: 0, len: 0 })
        ));

        // The queued frame is still there for a real read.
        assert_eq!(iface.read(&mut buf, 0).unwrap(), 5);
        assert_eq!(&buf[..5], b"frame");
    }

    #[test]
    fn test_write_to_full_device_errors_instead_of_dropping() {
        let (iface, _peer, _) = socket_interface(DeviceType::Tun);
        let frame = [0u8; 1024];

        let mut result = Ok(0);
        for _ in 0..100_000 {
            result = iface.write(&frame, 0);
            match result {
                Ok(n) => assert_eq!(n, frame.len()),
                Err(_) => break,
            }
        }
        assert!(matches!(result, Err(Error::WouldBlock)));
    }

    #[test]
    fn test_close_unblocks_pending_read() {
        let (iface, _peer, _) = socket_interface(DeviceType::Tun);
        let (done_tx, done_rx) = crossbeam::channel::bounded(1);
        {
            let iface = iface.clone();
            thread::spawn(move || {
                let mut buf = vec![0u8; 1 << 16];
                let _ = done_tx.send(iface.read(&mut buf, 0));
            });
        }

        thread::sleep(Duration::from_millis(300));
        iface.close().unwrap();

        let result = done_rx
            .recv_timeout(Duration::from_secs(1))
            .expect("pending read still blocked after close");
        assert!(result.unwrap_err().is_closed());
    }

    #[test]
    fn test_close_wakes_every_reader() {
        let (iface, _peer, _) = socket_interface(DeviceType::Tun);
        let readers: Vec<_> = (0..4)
            .map(|_| {
                let iface = iface.clone();
                thread::spawn(move || iface.read(&mut [0u8; 128], 0))
            })
            .collect();

        thread::sleep(Duration::from_millis(100));
        iface.close().unwrap();
        for reader in readers {
            assert!(reader.join().unwrap().unwrap_err().is_closed());
        }
    }

    #[test]
    fn test_double_and_concurrent_close() {
        let (iface, _peer, _) = socket_interface(DeviceType::Tun);
        let closers: Vec<_> = (0..4)
            .map(|_| {
                let iface = iface.clone();
                thread::spawn(move || iface.close())
            })
            .collect();
        for closer in closers {
            closer.join().unwrap().unwrap();
        }
        iface.close().unwrap();
        assert!(iface.is_closed());
    }

    #[test]
    fn test_io_after_close_fails_immediately() {
        let (iface, peer, _) = socket_interface(DeviceType::Tun);
        peer_send(&peer, b"queued");
        iface.close().unwrap();

        let started = Instant::now();
        assert!(iface.read(&mut [0u8; 64], 0).unwrap_err().is_closed());
        assert!(iface.write(b"late", 0).unwrap_err().is_closed());
        assert!(started.elapsed() < Duration::from_millis(50));

        assert!(iface.events().send(Event::None).unwrap_err().is_closed());
    }

    #[test]
    fn test_close_releases_descriptor() {
        let (iface, peer, _) = socket_interface(DeviceType::Tun);
        iface.close().unwrap();
        // Peer sees EOF once our end is gone.
        assert!(peer_recv(&peer).is_empty());
    }

    #[test]
    fn test_mtu_event_applied() {
        let (iface, _peer, control) = socket_interface(DeviceType::Tun);
        iface.events().send(Event::MtuUpdate(9000)).unwrap();
        assert!(wait_for(|| control.mtu("vtest0").ok() == Some(9000)));
        assert_eq!(iface.mtu().unwrap(), 9000);
    }

    #[test]
    fn test_std_io_traits() {
        use std::io::{Read, Write};

        let (iface, peer, _) = socket_interface(DeviceType::Tap);
        let mut handle = &*iface;
        Write::write_all(&mut handle, b"abc").unwrap();
        assert_eq!(peer_recv(&peer), b"abc");

        peer_send(&peer, b"xyz");
        let mut buf = [0u8; 8];
        let n = Read::read(&mut handle, &mut buf).unwrap();
        assert_eq!(&buf[..n], b"xyz");

        iface.close().unwrap();
        let err = Read::read(&mut handle, &mut buf).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::NotConnected);
    }
}
