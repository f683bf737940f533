//! Bring-up for STREAMS-style tun interfaces (illumos/Solaris).
//!
//! One entry point: [`configure`] opens the driver's control channel,
//! binds or allocates an instance number, opens the IP-stack and data
//! channels, sets the stream discipline, pushes the `ip` module, binds the
//! numbered interface name, optionally assigns an IPv6 address and
//! prefix-derived netmask, and links the device under the kernel's IPv6
//! router. Any failure closes everything opened so far and reports the one
//! step that failed; success hands the data channel to the caller.
//!
//! All kernel interaction goes through the [`TunKernel`] trait, so the
//! whole protocol is testable without a tun driver. The real backend,
//! `DevKernel`, only exists on illumos and Solaris.
//!
//! ```no_run
//! # #[cfg(any(target_os = "illumos", target_os = "solaris"))]
//! # fn bring_up() -> streams_tun::Result<()> {
//! use streams_tun::{configure, DevKernel, TunRequest};
//!
//! let req = TunRequest {
//!     name_hint: Some("tun0".into()),
//!     address: Some("fc00::1".parse().unwrap()),
//!     prefix_len: 8,
//!     ..TunRequest::default()
//! };
//! let handle = configure(&mut DevKernel, &req)?;
//! println!("{} is up", handle.name());
//! # Ok(())
//! # }
//! ```

pub mod error;
pub mod kernel;
pub mod name;
pub mod netmask;
pub mod provision;

pub use error::{Result, Step, TunError};
#[cfg(any(target_os = "illumos", target_os = "solaris"))]
pub use kernel::DevKernel;
pub use kernel::{IfFlags, RawChan, TunKernel};
pub use name::NameParse;
pub use netmask::mask_for_prefix;
pub use provision::{configure, TunHandle, TunRequest};
