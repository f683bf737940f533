//! Error surface for interface bring-up.

use std::fmt;
use std::io;

pub type Result<T> = std::result::Result<T, TunError>;

/// The kernel interaction that failed. Exactly one of these is reported
/// per failed bring-up, matching the first step that failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Step {
    OpenControl,
    BindPpa,
    AllocPpa,
    OpenIp,
    OpenData,
    DiscardMode,
    PushIp,
    BindName,
    Netmask,
    Address,
    Link,
}

impl fmt::Display for Step {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Step::OpenControl => r#"open("/dev/tun")"#,
            Step::BindPpa => "ioctl(TUNSETPPA)",
            Step::AllocPpa => "ioctl(TUNNEWPPA)",
            Step::OpenIp => r#"open("/dev/ip6")"#,
            Step::OpenData => r#"open("/dev/tun") (second time)"#,
            Step::DiscardMode => "putting tun into message-discard mode",
            Step::PushIp => "ioctl(I_PUSH)",
            Step::BindName => "ioctl(SIOCSLIFNAME)",
            Step::Netmask => "ioctl(SIOCSLIFNETMASK) (setting netmask)",
            Step::Address => "ioctl(SIOCSLIFADDR) (setting ipv6 address)",
            Step::Link => "ioctl(I_LINK)",
        })
    }
}

/// Why an interface could not be brought up.
#[derive(Debug, thiserror::Error)]
pub enum TunError {
    /// Rejected before any kernel resource was touched.
    #[error("prefix length {0} out of range, max 128")]
    PrefixLen(u8),

    /// A kernel call failed. The OS error is captured into `source` at the
    /// failing call site, before any cleanup close can overwrite errno.
    #[error("{step} [{source}]")]
    Kernel { step: Step, source: io::Error },
}

impl TunError {
    pub(crate) fn kernel(step: Step, source: io::Error) -> Self {
        TunError::Kernel { step, source }
    }

    /// The failing kernel step, if this was a kernel failure.
    pub fn step(&self) -> Option<Step> {
        match self {
            TunError::Kernel { step, .. } => Some(*step),
            TunError::PrefixLen(_) => None,
        }
    }
}
