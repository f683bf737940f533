//! The bring-up protocol: a strict sequence of kernel calls where any
//! failure must close every channel opened so far and report exactly one
//! error.

use std::net::Ipv6Addr;

use log::debug;

use crate::error::{Result, Step, TunError};
use crate::kernel::{IfFlags, RawChan, TunKernel};
use crate::name::NameParse;
use crate::netmask::mask_for_prefix;

/// What to bring up. The caller has already decided address and prefix
/// policy; the hint is only mined for an instance number.
#[derive(Debug, Clone, Default)]
pub struct TunRequest {
    /// Optional name like `"tun0"`; only its digits matter (see
    /// [`NameParse`]). No hint means the kernel picks the instance number.
    pub name_hint: Option<String>,
    /// Optional address to assign. Absent means the address/netmask steps
    /// are skipped entirely.
    pub address: Option<Ipv6Addr>,
    /// Prefix length, 0..=128. Ignored when `address` is `None` but still
    /// validated.
    pub prefix_len: u8,
    /// Hint-parsing behavior; defaults to the historical quirk.
    pub name_parse: NameParse,
}

/// An interface that made it all the way up. Owns the data channel; the
/// control and IP-stack channels stay open behind the scenes, since the
/// kernel needs them alive for the link to hold.
#[derive(Debug)]
pub struct TunHandle {
    chan: RawChan,
    ppa: u32,
}

impl TunHandle {
    /// The live data channel, for packet I/O.
    pub fn chan(&self) -> RawChan {
        self.chan
    }

    /// The kernel-assigned instance number.
    pub fn ppa(&self) -> u32 {
        self.ppa
    }

    /// The canonical interface name. Always `tun<N>` from the assigned
    /// instance number, never the caller's hint.
    pub fn name(&self) -> String {
        format!("tun{}", self.ppa)
    }

    /// Give up ownership of the raw channel id.
    pub fn into_raw(self) -> i32 {
        self.chan.0
    }
}

/// Configure a tun interface end to end.
///
/// On success the returned handle owns the data channel and the interface
/// is linked into the kernel's IPv6 routing path. On failure every channel
/// opened during the attempt has been closed and the error names the step
/// that failed, with the OS error embedded. Nothing is retried here; that
/// is the caller's call.
pub fn configure<K: TunKernel>(kernel: &mut K, req: &TunRequest) -> Result<TunHandle> {
    if req.prefix_len > 128 {
        return Err(TunError::PrefixLen(req.prefix_len));
    }

    // Channels opened so far, torn down in one place on any failure.
    let mut open: Vec<RawChan> = Vec::with_capacity(3);
    match bring_up(kernel, req, &mut open) {
        Ok(handle) => Ok(handle),
        Err(err) => {
            // The OS error is already captured inside `err`; these closes
            // can no longer disturb it.
            for chan in open {
                debug!("closing {chan:?} after failed bring-up: {err}");
                kernel.close(chan);
            }
            Err(err)
        }
    }
}

fn bring_up<K: TunKernel>(
    kernel: &mut K,
    req: &TunRequest,
    open: &mut Vec<RawChan>,
) -> Result<TunHandle> {
    let requested = req.name_parse.ppa_from_hint(req.name_hint.as_deref());

    let control = kernel
        .open_tun()
        .map_err(|e| TunError::kernel(Step::OpenControl, e))?;
    open.push(control);

    // Bind the hinted instance number, or have the kernel pick one. Either
    // way the echoed number is canonical from here on.
    let ppa = match requested {
        Some(n) => kernel
            .bind_ppa(control, n)
            .map_err(|e| TunError::kernel(Step::BindPpa, e))?,
        None => kernel
            .alloc_ppa(control)
            .map_err(|e| TunError::kernel(Step::AllocPpa, e))?,
    };

    let ip = kernel
        .open_ip()
        .map_err(|e| TunError::kernel(Step::OpenIp, e))?;
    open.push(ip);

    let data = kernel
        .open_tun()
        .map_err(|e| TunError::kernel(Step::OpenData, e))?;
    open.push(data);

    kernel
        .set_discard_mode(data)
        .map_err(|e| TunError::kernel(Step::DiscardMode, e))?;

    // Instances are numbered, not named, so pretty names are off the
    // table; everything is tun<N>.
    let name = format!("tun{ppa}");

    kernel
        .push_ip_module(data)
        .map_err(|e| TunError::kernel(Step::PushIp, e))?;
    kernel
        .bind_if_name(data, &name, ppa, IfFlags::IPV6)
        .map_err(|e| TunError::kernel(Step::BindName, e))?;

    if let Some(address) = req.address {
        // Netmask first: the interface must never be observable as
        // addressed but unmasked.
        let mask = mask_for_prefix(req.prefix_len);
        kernel
            .set_netmask(data, &name, &mask)
            .map_err(|e| TunError::kernel(Step::Netmask, e))?;
        kernel
            .set_address(data, &name, &address.octets())
            .map_err(|e| TunError::kernel(Step::Address, e))?;
    }

    kernel
        .link_under_ip(ip, data)
        .map_err(|e| TunError::kernel(Step::Link, e))?;

    // Committed: all three channels stay open. Control and ip are owned by
    // the kernel side of the link from here on; data goes to the caller.
    open.clear();
    Ok(TunHandle { chan: data, ppa })
}

#[cfg(test)]
mod tests {
    use super::{configure, TunRequest};
    use crate::error::{Step, TunError};
    use crate::kernel::{IfFlags, RawChan, TunKernel};
    use crate::name::NameParse;
    use crate::netmask::mask_for_prefix;

    use std::io;
    use std::net::Ipv6Addr;

    use test_case::test_case;

    /// One entry per kernel call the protocol can make. `OpenTun` carries
    /// which open it was (1 = control, 2 = data).
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    enum Op {
        OpenTun(u32),
        OpenIp,
        BindPpa,
        AllocPpa,
        Srdopt,
        Push,
        SetName,
        SetMask,
        SetAddr,
        Link,
    }

    /// Handle-accounting kernel double. Injects a failure at one chosen
    /// op; panics on double close or close of a never-issued channel.
    struct MockKernel {
        fail: Option<Op>,
        next_fd: i32,
        tun_opens: u32,
        fresh_ppa: u32,
        issued: Vec<RawChan>,
        live: Vec<RawChan>,
        closed: Vec<RawChan>,
        calls: Vec<Op>,
        bound: Option<u32>,
        alloc_calls: u32,
        name_binds: Vec<(String, u32, IfFlags)>,
        masks: Vec<[u8; 16]>,
        addrs: Vec<[u8; 16]>,
    }

    impl Default for MockKernel {
        fn default() -> Self {
            MockKernel {
                fail: None,
                next_fd: 3,
                tun_opens: 0,
                fresh_ppa: 4,
                issued: Vec::new(),
                live: Vec::new(),
                closed: Vec::new(),
                calls: Vec::new(),
                bound: None,
                alloc_calls: 0,
                name_binds: Vec::new(),
                masks: Vec::new(),
                addrs: Vec::new(),
            }
        }
    }

    impl MockKernel {
        fn failing_at(op: Op) -> Self {
            MockKernel {
                fail: Some(op),
                ..MockKernel::default()
            }
        }

        fn call(&mut self, op: Op) -> io::Result<()> {
            self.calls.push(op);
            if self.fail == Some(op) {
                Err(io::Error::from_raw_os_error(libc::ENXIO))
            } else {
                Ok(())
            }
        }

        fn issue(&mut self) -> RawChan {
            let chan = RawChan(self.next_fd);
            self.next_fd += 1;
            self.issued.push(chan);
            self.live.push(chan);
            chan
        }

        fn assert_live(&self, chan: RawChan) {
            assert!(self.live.contains(&chan), "op on dead channel {chan:?}");
        }
    }

    impl TunKernel for MockKernel {
        fn open_tun(&mut self) -> io::Result<RawChan> {
            self.tun_opens += 1;
            self.call(Op::OpenTun(self.tun_opens))?;
            Ok(self.issue())
        }

        fn open_ip(&mut self) -> io::Result<RawChan> {
            self.call(Op::OpenIp)?;
            Ok(self.issue())
        }

        fn bind_ppa(&mut self, chan: RawChan, ppa: u32) -> io::Result<u32> {
            self.assert_live(chan);
            self.call(Op::BindPpa)?;
            self.bound = Some(ppa);
            Ok(ppa)
        }

        fn alloc_ppa(&mut self, chan: RawChan) -> io::Result<u32> {
            self.assert_live(chan);
            self.call(Op::AllocPpa)?;
            self.alloc_calls += 1;
            Ok(self.fresh_ppa)
        }

        fn set_discard_mode(&mut self, chan: RawChan) -> io::Result<()> {
            self.assert_live(chan);
            self.call(Op::Srdopt)
        }

        fn push_ip_module(&mut self, chan: RawChan) -> io::Result<()> {
            self.assert_live(chan);
            self.call(Op::Push)
        }

        fn bind_if_name(
            &mut self,
            chan: RawChan,
            name: &str,
            ppa: u32,
            flags: IfFlags,
        ) -> io::Result<()> {
            self.assert_live(chan);
            self.call(Op::SetName)?;
            self.name_binds.push((name.to_owned(), ppa, flags));
            Ok(())
        }

        fn set_netmask(&mut self, chan: RawChan, _name: &str, mask: &[u8; 16]) -> io::Result<()> {
            self.assert_live(chan);
            self.call(Op::SetMask)?;
            self.masks.push(*mask);
            Ok(())
        }

        fn set_address(&mut self, chan: RawChan, _name: &str, addr: &[u8; 16]) -> io::Result<()> {
            self.assert_live(chan);
            self.call(Op::SetAddr)?;
            self.addrs.push(*addr);
            Ok(())
        }

        fn link_under_ip(&mut self, ip: RawChan, chan: RawChan) -> io::Result<u32> {
            self.assert_live(ip);
            self.assert_live(chan);
            self.call(Op::Link)?;
            Ok(1)
        }

        fn close(&mut self, chan: RawChan) {
            let at = self
                .live
                .iter()
                .position(|c| *c == chan)
                .unwrap_or_else(|| panic!("double or stray close of {chan:?}"));
            self.live.remove(at);
            self.closed.push(chan);
        }
    }

    fn request(hint: Option<&str>, address: Option<Ipv6Addr>, prefix_len: u8) -> TunRequest {
        TunRequest {
            name_hint: hint.map(str::to_owned),
            address,
            prefix_len,
            name_parse: NameParse::Compat,
        }
    }

    #[test]
    fn success_end_to_end() {
        let mut kernel = MockKernel::default();
        let req = request(Some("tun0"), Some(Ipv6Addr::LOCALHOST), 64);

        let handle = configure(&mut kernel, &req).unwrap();

        // control = 3, ip = 4, data = 5; the data channel comes back
        assert_eq!(handle.chan(), RawChan(5));
        assert_eq!(handle.ppa(), 0);
        assert_eq!(handle.name(), "tun0");

        // nothing closed on success, all three channels still live
        assert!(kernel.closed.is_empty());
        assert_eq!(kernel.live, vec![RawChan(3), RawChan(4), RawChan(5)]);

        assert_eq!(kernel.bound, Some(0));
        assert_eq!(kernel.alloc_calls, 0);
        assert_eq!(
            kernel.name_binds,
            vec![("tun0".to_owned(), 0, IfFlags::IPV6)]
        );
        assert_eq!(kernel.masks, vec![mask_for_prefix(64)]);
        assert_eq!(kernel.addrs, vec![Ipv6Addr::LOCALHOST.octets()]);

        // netmask is applied before the address, never the other way
        let mask_at = kernel.calls.iter().position(|op| *op == Op::SetMask);
        let addr_at = kernel.calls.iter().position(|op| *op == Op::SetAddr);
        assert!(mask_at.unwrap() < addr_at.unwrap());
    }

    #[test]
    fn no_address_skips_mask_and_addr_ioctls() {
        let mut kernel = MockKernel::default();
        let handle = configure(&mut kernel, &request(None, None, 0)).unwrap();

        assert!(kernel.masks.is_empty());
        assert!(kernel.addrs.is_empty());
        assert!(!kernel.calls.contains(&Op::SetMask));
        assert!(!kernel.calls.contains(&Op::SetAddr));

        // kernel allocated the instance number, and it names the interface
        assert_eq!(kernel.alloc_calls, 1);
        assert_eq!(handle.name(), "tun4");
    }

    #[test_case(Op::OpenTun(1), Step::OpenControl, 0)]
    #[test_case(Op::BindPpa, Step::BindPpa, 1)]
    #[test_case(Op::AllocPpa, Step::AllocPpa, 1)]
    #[test_case(Op::OpenIp, Step::OpenIp, 1)]
    #[test_case(Op::OpenTun(2), Step::OpenData, 2)]
    #[test_case(Op::Srdopt, Step::DiscardMode, 3)]
    #[test_case(Op::Push, Step::PushIp, 3)]
    #[test_case(Op::SetName, Step::BindName, 3)]
    #[test_case(Op::SetMask, Step::Netmask, 3)]
    #[test_case(Op::SetAddr, Step::Address, 3)]
    #[test_case(Op::Link, Step::Link, 3)]
    fn failure_closes_every_opened_channel(fail: Op, step: Step, opened: usize) {
        let mut kernel = MockKernel::failing_at(fail);
        // the alloc path needs a hint-free request; everything else binds
        let hint = if fail == Op::AllocPpa { None } else { Some("tun0") };
        let req = request(hint, Some(Ipv6Addr::LOCALHOST), 64);

        let err = configure(&mut kernel, &req).unwrap_err();

        assert_eq!(err.step(), Some(step));
        assert_eq!(kernel.issued.len(), opened);
        // every issued channel closed exactly once, none live, none leaked
        assert_eq!(kernel.closed, kernel.issued);
        assert!(kernel.live.is_empty());
    }

    #[test]
    fn failure_reports_the_os_error_verbatim() {
        let mut kernel = MockKernel::failing_at(Op::Link);
        let err = configure(&mut kernel, &request(None, None, 0)).unwrap_err();
        let msg = err.to_string();
        assert!(msg.starts_with("ioctl(I_LINK) ["), "{msg}");
        assert!(msg.contains("os error"), "{msg}");
    }

    #[test]
    fn hint_without_digits_allocates_fresh() {
        let mut kernel = MockKernel::default();
        let handle = configure(&mut kernel, &request(Some("tun"), None, 0)).unwrap();
        assert_eq!(kernel.bound, None);
        assert_eq!(kernel.alloc_calls, 1);
        assert_eq!(handle.ppa(), 4);
    }

    #[test]
    fn compat_parse_binds_zero_for_digit_bearing_hint() {
        // historical atoi quirk: "tun12" requests instance 0, not 12
        let mut kernel = MockKernel::default();
        configure(&mut kernel, &request(Some("tun12"), None, 0)).unwrap();
        assert_eq!(kernel.bound, Some(0));
        assert_eq!(kernel.alloc_calls, 0);
    }

    #[test]
    fn suffix_parse_binds_the_trailing_number() {
        let mut kernel = MockKernel::default();
        let mut req = request(Some("tun12"), None, 0);
        req.name_parse = NameParse::Suffix;
        let handle = configure(&mut kernel, &req).unwrap();
        assert_eq!(kernel.bound, Some(12));
        assert_eq!(handle.name(), "tun12");
    }

    #[test]
    fn oversized_prefix_fails_before_any_kernel_call() {
        let mut kernel = MockKernel::default();
        let err = configure(&mut kernel, &request(None, Some(Ipv6Addr::LOCALHOST), 129))
            .unwrap_err();
        assert!(matches!(err, TunError::PrefixLen(129)));
        assert!(kernel.calls.is_empty());
        assert!(kernel.issued.is_empty());
    }

    #[test]
    fn prefix_is_validated_even_without_an_address() {
        let mut kernel = MockKernel::default();
        let err = configure(&mut kernel, &request(None, None, 200)).unwrap_err();
        assert!(matches!(err, TunError::PrefixLen(200)));
        assert!(kernel.calls.is_empty());
    }
}
