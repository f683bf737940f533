//! The seam between the bring-up protocol and the kernel.
//!
//! `TunKernel` covers every kernel interaction the provisioner performs, so
//! the protocol can run against a mock in tests. The real backend,
//! [`DevKernel`], exists only on illumos/Solaris where the STREAMS tun
//! driver lives.

use std::io;

use bitflags::bitflags;

/// A kernel channel id. For [`DevKernel`] this is a real file descriptor;
/// a test kernel is free to issue whatever numbers it likes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RawChan(pub i32);

bitflags! {
    /// `lifr_flags` bits passed with the interface-name bind.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct IfFlags: u64 {
        /// `IFF_IPV6` from `<net/if.h>`.
        const IPV6 = 0x8000;
    }
}

/// Kernel operations used during interface bring-up, in the order the
/// protocol issues them.
///
/// Every fallible operation reports failure as an `io::Error` carrying the
/// OS error code, captured at the call site. `close` is infallible by
/// decree: it runs during unwind, after the real error has already been
/// captured, and has nothing useful to report.
pub trait TunKernel {
    /// Open a channel to the tun driver device node.
    fn open_tun(&mut self) -> io::Result<RawChan>;

    /// Open a channel to the IP-stack device node.
    fn open_ip(&mut self) -> io::Result<RawChan>;

    /// Bind `chan` to the requested instance number; returns the canonical
    /// number echoed by the kernel.
    fn bind_ppa(&mut self, chan: RawChan, ppa: u32) -> io::Result<u32>;

    /// Ask the kernel for a freshly allocated instance number.
    fn alloc_ppa(&mut self, chan: RawChan) -> io::Result<u32>;

    /// Put `chan` into message-discard read mode so partial reads drop the
    /// remainder of a message instead of leaving stale fragments.
    fn set_discard_mode(&mut self, chan: RawChan) -> io::Result<()>;

    /// Push the `ip` protocol module onto `chan`'s stream.
    fn push_ip_module(&mut self, chan: RawChan) -> io::Result<()>;

    /// Bind `chan` to the numbered interface name with the given flags.
    fn bind_if_name(&mut self, chan: RawChan, name: &str, ppa: u32, flags: IfFlags)
        -> io::Result<()>;

    /// Set the interface netmask (16 bytes, network order).
    fn set_netmask(&mut self, chan: RawChan, name: &str, mask: &[u8; 16]) -> io::Result<()>;

    /// Set the interface IPv6 address (16 bytes, network order).
    fn set_address(&mut self, chan: RawChan, name: &str, addr: &[u8; 16]) -> io::Result<()>;

    /// Link `chan` under the IP-stack channel's multiplexer; returns the
    /// mux id (unused by the provisioner).
    fn link_under_ip(&mut self, ip: RawChan, chan: RawChan) -> io::Result<u32>;

    /// Close a channel opened by this kernel.
    fn close(&mut self, chan: RawChan);
}

#[cfg(any(target_os = "illumos", target_os = "solaris"))]
pub use dev::DevKernel;

#[cfg(any(target_os = "illumos", target_os = "solaris"))]
mod dev {
    use super::{IfFlags, RawChan, TunKernel};

    use std::fs::File;
    use std::io;
    use std::mem;
    use std::os::fd::IntoRawFd;

    use libc::{c_char, c_int};

    const TUN_DEV: &str = "/dev/tun";
    const IP6_DEV: &str = "/dev/ip6";

    // <net/if_tun.h>
    const TUNNEWPPA: c_int = (('T' as c_int) << 16) | 0x0001;
    const TUNSETPPA: c_int = (('T' as c_int) << 16) | 0x0002;

    // <sys/stropts.h>
    const STR: c_int = ('S' as c_int) << 8;
    const I_PUSH: c_int = STR | 0o2;
    const I_SRDOPT: c_int = STR | 0o5;
    const I_LINK: c_int = STR | 0o14;
    const RMSGD: c_int = 0x0001;

    const LIFNAMSIZ: usize = 32;

    /// `struct lifreq` from `<net/if.h>`, reduced to the members the
    /// bring-up ioctls touch. The trailing union is represented by a
    /// `sockaddr_storage`, which fixes its size and alignment.
    #[repr(C)]
    struct Lifreq {
        name: [u8; LIFNAMSIZ],
        // lifr_lifru1: holds the PPA for SIOCSLIFNAME
        ppa: u32,
        movetoindex: u32,
        lifru: Lifru,
    }

    #[repr(C)]
    union Lifru {
        addr: libc::sockaddr_storage,
        flags: u64,
    }

    // <sys/sockio.h>: _IOW('i', n, struct lifreq)
    const fn iow_lifreq(n: c_int) -> c_int {
        (0x8000_0000u32
            | ((mem::size_of::<Lifreq>() as u32 & 0xff) << 16)
            | (('i' as u32) << 8)
            | n as u32) as c_int
    }

    const SIOCSLIFADDR: c_int = iow_lifreq(110);
    const SIOCSLIFNETMASK: c_int = iow_lifreq(127);
    const SIOCSLIFNAME: c_int = iow_lifreq(129);

    nix::ioctl_write_int_bad!(tun_new_ppa, TUNNEWPPA);
    nix::ioctl_write_int_bad!(tun_set_ppa, TUNSETPPA);
    nix::ioctl_write_int_bad!(strm_set_rdopt, I_SRDOPT);
    nix::ioctl_write_int_bad!(strm_link, I_LINK);
    nix::ioctl_write_ptr_bad!(strm_push, I_PUSH, c_char);
    nix::ioctl_write_ptr_bad!(lif_set_name, SIOCSLIFNAME, Lifreq);
    nix::ioctl_write_ptr_bad!(lif_set_netmask, SIOCSLIFNETMASK, Lifreq);
    nix::ioctl_write_ptr_bad!(lif_set_addr, SIOCSLIFADDR, Lifreq);

    fn errno_to_io(errno: nix::errno::Errno) -> io::Error {
        io::Error::from_raw_os_error(errno as i32)
    }

    fn open_node(path: &str) -> io::Result<RawChan> {
        let node = File::options().read(true).write(true).open(path)?;
        Ok(RawChan(node.into_raw_fd()))
    }

    fn named_lifreq(name: &str) -> Lifreq {
        let mut ifr: Lifreq = unsafe { mem::zeroed() };
        let bytes = name.as_bytes();
        // names are always "tun<N>", far below LIFNAMSIZ - 1
        ifr.name[..bytes.len()].copy_from_slice(bytes);
        ifr
    }

    fn addr_lifreq(name: &str, bytes: &[u8; 16]) -> Lifreq {
        let mut ifr = named_lifreq(name);
        unsafe {
            let sin6 = &mut ifr.lifru.addr as *mut libc::sockaddr_storage
                as *mut libc::sockaddr_in6;
            (*sin6).sin6_family = libc::AF_INET6 as libc::sa_family_t;
            (*sin6).sin6_addr.s6_addr = *bytes;
        }
        ifr
    }

    /// The real STREAMS tun backend. Channels are file descriptors on
    /// `/dev/tun` and `/dev/ip6`.
    #[derive(Debug, Default)]
    pub struct DevKernel;

    impl TunKernel for DevKernel {
        fn open_tun(&mut self) -> io::Result<RawChan> {
            open_node(TUN_DEV)
        }

        fn open_ip(&mut self) -> io::Result<RawChan> {
            open_node(IP6_DEV)
        }

        fn bind_ppa(&mut self, chan: RawChan, ppa: u32) -> io::Result<u32> {
            let echoed = unsafe { tun_set_ppa(chan.0, ppa as c_int) }.map_err(errno_to_io)?;
            Ok(echoed as u32)
        }

        fn alloc_ppa(&mut self, chan: RawChan) -> io::Result<u32> {
            let fresh = unsafe { tun_new_ppa(chan.0, -1) }.map_err(errno_to_io)?;
            Ok(fresh as u32)
        }

        fn set_discard_mode(&mut self, chan: RawChan) -> io::Result<()> {
            unsafe { strm_set_rdopt(chan.0, RMSGD) }.map_err(errno_to_io)?;
            Ok(())
        }

        fn push_ip_module(&mut self, chan: RawChan) -> io::Result<()> {
            unsafe { strm_push(chan.0, b"ip\0".as_ptr() as *const c_char) }
                .map_err(errno_to_io)?;
            Ok(())
        }

        fn bind_if_name(
            &mut self,
            chan: RawChan,
            name: &str,
            ppa: u32,
            flags: IfFlags,
        ) -> io::Result<()> {
            let mut ifr = named_lifreq(name);
            ifr.ppa = ppa;
            ifr.lifru.flags = flags.bits();
            unsafe { lif_set_name(chan.0, &ifr) }.map_err(errno_to_io)?;
            Ok(())
        }

        fn set_netmask(&mut self, chan: RawChan, name: &str, mask: &[u8; 16]) -> io::Result<()> {
            let ifr = addr_lifreq(name, mask);
            unsafe { lif_set_netmask(chan.0, &ifr) }.map_err(errno_to_io)?;
            Ok(())
        }

        fn set_address(&mut self, chan: RawChan, name: &str, addr: &[u8; 16]) -> io::Result<()> {
            let ifr = addr_lifreq(name, addr);
            unsafe { lif_set_addr(chan.0, &ifr) }.map_err(errno_to_io)?;
            Ok(())
        }

        fn link_under_ip(&mut self, ip: RawChan, chan: RawChan) -> io::Result<u32> {
            let muxid = unsafe { strm_link(ip.0, chan.0) }.map_err(errno_to_io)?;
            Ok(muxid as u32)
        }

        fn close(&mut self, chan: RawChan) {
            // unwind path; the interesting error was captured before this
            unsafe { libc::close(chan.0) };
        }
    }
}
