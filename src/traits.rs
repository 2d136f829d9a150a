//! Shared collaborator trait for the optional NTP coexistence helper (C16/ambient): kept
//! mockable the same way the teacher's `traits.rs` always has, via `#[cfg_attr(test,
//! mockall::automock)]`. The old `PtpNetwork` trait this file used to carry is superseded by the
//! concrete `net::Transport` (C6) now that the crate owns its own wire codec and dual-channel
//! socket plumbing instead of mocking a single generic "packet source".

use anyhow::Result;
use std::time::Duration;

#[cfg_attr(test, mockall::automock)]
pub trait NtpSource {
    fn get_offset(&self) -> Result<(Duration, i8)>;
}
