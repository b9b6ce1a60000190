//! Kernel ABI for the Linux tun driver.
//!
//! Request codes and structure layouts mirror `<linux/if_tun.h>` and
//! `<linux/if.h>`. Nothing outside this file hard-codes a kernel constant.

use std::ffi::CStr;
use std::mem::size_of;

use libc::{c_char, c_int, c_short, c_ulong};

/// Clone device every tun/tap interface is created through.
pub const CLONE_DEVICE: &CStr = c"/dev/net/tun";

/// IFNAMSIZ
pub const IFNAMSIZ: usize = 16;

/// sizeof(struct ifreq) on 64-bit targets; larger than the 32-bit layout, so safe there too.
pub const IFREQ_SIZE: usize = 40;

/// IFF_TUN - point-to-point device carrying IP packets.
pub const IFF_TUN: c_short = 0x0001;

/// IFF_TAP - Ethernet device.
pub const IFF_TAP: c_short = 0x0002;

/// IFF_MULTI_QUEUE - allow several queues on one interface.
pub const IFF_MULTI_QUEUE: c_short = 0x0100;

/// IFF_NO_PI - no packet information header.
pub const IFF_NO_PI: c_short = 0x1000;

#[cfg(any(
    target_arch = "mips",
    target_arch = "mips32r6",
    target_arch = "mips64",
    target_arch = "mips64r6",
    target_arch = "powerpc",
    target_arch = "powerpc64",
    target_arch = "sparc",
    target_arch = "sparc64"
))]
mod ioc {
    pub const WRITE: u32 = 4;
    pub const DIR_SHIFT: u32 = 29;
}

#[cfg(not(any(
    target_arch = "mips",
    target_arch = "mips32r6",
    target_arch = "mips64",
    target_arch = "mips64r6",
    target_arch = "powerpc",
    target_arch = "powerpc64",
    target_arch = "sparc",
    target_arch = "sparc64"
)))]
mod ioc {
    pub const WRITE: u32 = 1;
    pub const DIR_SHIFT: u32 = 30;
}

/// `_IOW(ty, nr, size)`
const fn iow(ty: u8, nr: u8, size: usize) -> c_ulong {
    ((ioc::WRITE << ioc::DIR_SHIFT) | ((size as u32) << 16) | ((ty as u32) << 8) | nr as u32)
        as c_ulong
}

/// TUNSETIFF - attach the descriptor to a new or existing interface.
pub const TUNSETIFF: c_ulong = iow(b'T', 202, size_of::<c_int>());

/// TUNSETPERSIST - set or clear the persist flag.
pub const TUNSETPERSIST: c_ulong = iow(b'T', 203, size_of::<c_int>());

/// TUNSETOWNER - set the owning uid.
pub const TUNSETOWNER: c_ulong = iow(b'T', 204, size_of::<c_int>());

/// TUNSETGROUP - set the owning gid.
pub const TUNSETGROUP: c_ulong = iow(b'T', 206, size_of::<c_int>());

/// SIOCGIFMTU - Get interface MTU.
pub const SIOCGIFMTU: c_ulong = 0x8921;

/// SIOCSIFMTU - Set interface MTU.
pub const SIOCSIFMTU: c_ulong = 0x8922;

/// Interface request structure for TUNSETIFF.
#[repr(C)]
pub struct IfReq {
    pub ifr_name: [c_char; IFNAMSIZ],
    pub ifr_flags: c_short,
    _pad: [u8; IFREQ_SIZE - IFNAMSIZ - size_of::<c_short>()],
}

impl IfReq {
    pub fn new(name: &str, flags: c_short) -> Self {
        Self {
            ifr_name: encode_name(name),
            ifr_flags: flags,
            _pad: [0; IFREQ_SIZE - IFNAMSIZ - size_of::<c_short>()],
        }
    }

    /// Name as written back by the kernel.
    pub fn name(&self) -> String {
        decode_name(&self.ifr_name)
    }
}

/// Interface request with MTU.
#[repr(C)]
pub struct IfReqMtu {
    pub ifr_name: [c_char; IFNAMSIZ],
    pub ifr_mtu: c_int,
    _pad: [u8; IFREQ_SIZE - IFNAMSIZ - size_of::<c_int>()],
}

impl IfReqMtu {
    pub fn new(name: &str, mtu: c_int) -> Self {
        Self {
            ifr_name: encode_name(name),
            ifr_mtu: mtu,
            _pad: [0; IFREQ_SIZE - IFNAMSIZ - size_of::<c_int>()],
        }
    }
}

/// Zero-padded, truncated to leave room for the terminating NUL.
pub fn encode_name(name: &str) -> [c_char; IFNAMSIZ] {
    let mut buf = [0 as c_char; IFNAMSIZ];
    for (slot, byte) in buf.iter_mut().zip(name.bytes().take(IFNAMSIZ - 1)) {
        *slot = byte as c_char;
    }
    buf
}

pub fn decode_name(buf: &[c_char; IFNAMSIZ]) -> String {
    let bytes: Vec<u8> = buf
        .iter()
        .take_while(|&&c| c != 0)
        .map(|&c| c as u8)
        .collect();
    String::from_utf8_lossy(&bytes).into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::mem::{align_of, offset_of};

    #[test]
    fn test_ifreq_layout() {
        assert_eq!(size_of::<IfReq>(), IFREQ_SIZE);
        assert_eq!(offset_of!(IfReq, ifr_flags), IFNAMSIZ);
        assert_eq!(size_of::<IfReqMtu>(), IFREQ_SIZE);
        assert_eq!(offset_of!(IfReqMtu, ifr_mtu), IFNAMSIZ);
        assert_eq!(align_of::<IfReqMtu>(), align_of::<c_int>());
    }

    #[cfg(any(target_arch = "x86_64", target_arch = "aarch64", target_arch = "x86"))]
    #[test]
    fn test_request_codes_match_kernel_headers() {
        assert_eq!(TUNSETIFF, 0x400454ca);
        assert_eq!(TUNSETPERSIST, 0x400454cb);
        assert_eq!(TUNSETOWNER, 0x400454cc);
        assert_eq!(TUNSETGROUP, 0x400454ce);
    }

    #[cfg(any(
        target_arch = "mips",
        target_arch = "mips32r6",
        target_arch = "mips64",
        target_arch = "mips64r6",
        target_arch = "powerpc",
        target_arch = "powerpc64",
        target_arch = "sparc",
        target_arch = "sparc64"
    ))]
    #[test]
    fn test_request_codes_match_kernel_headers() {
        assert_eq!(TUNSETIFF, 0x800454ca);
        assert_eq!(TUNSETPERSIST, 0x800454cb);
        assert_eq!(TUNSETOWNER, 0x800454cc);
        assert_eq!(TUNSETGROUP, 0x800454ce);
    }

    #[test]
    fn test_request_codes_encode_type_number_and_size() {
        let codes = [
            (TUNSETIFF, 202),
            (TUNSETPERSIST, 203),
            (TUNSETOWNER, 204),
            (TUNSETGROUP, 206),
        ];
        for (code, nr) in codes {
            let code = code as u64;
            assert_eq!(code & 0xff, nr);
            assert_eq!((code >> 8) & 0xff, b'T' as u64);
            assert_eq!((code >> 16) & 0x1fff, size_of::<c_int>() as u64);
        }
    }

    #[test]
    fn test_name_truncated_and_padded() {
        let buf = encode_name("averyveryverylongname");
        assert_eq!(buf[IFNAMSIZ - 1], 0);
        assert_eq!(decode_name(&buf), "averyveryverylo");

        let buf = encode_name("tun0");
        assert!(buf[4..].iter().all(|&c| c == 0));
        assert_eq!(decode_name(&buf), "tun0");
    }

    #[test]
    fn test_ifreq_round_trips_name() {
        let req = IfReq::new("tap%d", IFF_TAP | IFF_NO_PI);
        assert_eq!(req.name(), "tap%d");
        assert_eq!(req.ifr_flags, 0x1002);
    }
}
