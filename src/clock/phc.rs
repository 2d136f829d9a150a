//! Per-NIC PTP hardware clock (PHC) backend, grounded on `clockdriver_linuxphc.c`'s use of
//! `clock_adjtime(2)`/`clock_settime(2)` against a `/dev/ptpN` dynamic clock id, the same way
//! `rtc.rs` wraps a single ioctl pair for `/dev/rtc0`.

use std::fs::OpenOptions;
use std::os::unix::io::AsRawFd;
use std::time::Duration;

use anyhow::{anyhow, Result};
use libc::{clockid_t, timespec, timex, ADJ_FREQUENCY};

use super::SystemClock;

/// `CLOCKFD` encoding from `clockdriver_linuxphc.c`: a PHC's dynamic clock id is derived from its
/// open file descriptor as `(~fd << 3) | CLOCKFD`.
const CLOCKFD: i32 = 3;

fn fd_to_clockid(fd: i32) -> clockid_t {
    ((!fd) << 3) | CLOCKFD
}

extern "C" {
    fn clock_adjtime(clk_id: clockid_t, tx: *mut timex) -> i32;
    fn clock_settime(clk_id: clockid_t, tp: *const timespec) -> i32;
    fn clock_gettime(clk_id: clockid_t, tp: *mut timespec) -> i32;
}

pub struct PhcClock {
    #[allow(dead_code)]
    device: std::fs::File,
    clock_id: clockid_t,
}

impl PhcClock {
    /// `device_path` is typically `/dev/ptp0`, `/dev/ptp1`, etc, one per NIC with PHC support.
    pub fn open(device_path: &str) -> Result<Self> {
        let device = OpenOptions::new().read(true).write(true).open(device_path)?;
        let clock_id = fd_to_clockid(device.as_raw_fd());
        Ok(PhcClock { device, clock_id })
    }
}

impl SystemClock for PhcClock {
    fn adjust_frequency(&mut self, factor: f64) -> Result<()> {
        let ppb = (factor - 1.0) * 1_000_000_000.0;
        let mut tx: timex = unsafe { std::mem::zeroed() };
        tx.modes = ADJ_FREQUENCY;
        // the kernel's PHC frequency field is scaled parts-per-billion, left-shifted by 16
        tx.freq = ((ppb / 1000.0) * 65536.0) as i64;
        let ret = unsafe { clock_adjtime(self.clock_id, &mut tx) };
        if ret < 0 {
            return Err(anyhow!("clock_adjtime failed: errno={}", std::io::Error::last_os_error()));
        }
        Ok(())
    }

    fn step_clock(&mut self, offset: Duration, sign: i8) -> Result<()> {
        let mut now: timespec = unsafe { std::mem::zeroed() };
        if unsafe { clock_gettime(self.clock_id, &mut now) } < 0 {
            return Err(anyhow!("clock_gettime failed on PHC: errno={}", std::io::Error::last_os_error()));
        }
        let offset_sec = offset.as_secs() as i64;
        let offset_nsec = offset.subsec_nanos() as i64;
        if sign > 0 {
            now.tv_sec += offset_sec;
            now.tv_nsec += offset_nsec;
        } else {
            now.tv_sec -= offset_sec;
            now.tv_nsec -= offset_nsec;
        }
        while now.tv_nsec >= 1_000_000_000 {
            now.tv_sec += 1;
            now.tv_nsec -= 1_000_000_000;
        }
        while now.tv_nsec < 0 {
            now.tv_sec -= 1;
            now.tv_nsec += 1_000_000_000;
        }
        let ret = unsafe { clock_settime(self.clock_id, &now) };
        if ret < 0 {
            return Err(anyhow!("clock_settime failed on PHC: errno={}", std::io::Error::last_os_error()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn clockfd_encoding_matches_linuxphc_macro() {
        // FD_TO_CLOCKID(fd) == ((~(fd) << 3) | CLOCKFD) from clockdriver_linuxphc.c
        assert_eq!(fd_to_clockid(3), ((!3i32) << 3) | 3);
        assert_eq!(fd_to_clockid(0), ((!0i32) << 3) | 3);
    }

    #[test]
    fn nsec_normalization_handles_overflow_and_underflow() {
        fn normalize(mut sec: i64, mut nsec: i64) -> (i64, i64) {
            while nsec >= 1_000_000_000 {
                sec += 1;
                nsec -= 1_000_000_000;
            }
            while nsec < 0 {
                sec -= 1;
                nsec += 1_000_000_000;
            }
            (sec, nsec)
        }
        assert_eq!(normalize(10, 1_500_000_000), (11, 500_000_000));
        assert_eq!(normalize(10, -500_000_000), (9, 500_000_000));
    }
}
