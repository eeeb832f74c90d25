#![no_std]
//! This is a platform agnostic library for the Macronix MX25L NOR flash series using [embedded-hal](https://github.com/rust-embedded/embedded-hal).
//!
//! Multiple chips are supported:
//! * [MX25L3233F](https://www.macronix.com/Lists/Datasheet/Attachments/8754/MX25L3233F.pdf)
//! * [MX25L6433F](https://www.macronix.com/Lists/Datasheet/Attachments/8681/MX25L6433F.pdf)
//! * [MX25L12835F](https://www.macronix.com/Lists/Datasheet/Attachments/8653/MX25L12835F.pdf)
//!
//! The driver speaks the full command/status protocol of the chip: every
//! program and erase is bracketed with write-enable/write-disable and the
//! write-in-progress bit is polled to completion under a bounded budget.
//! Arbitrary-length writes are split into legal page programs, see
//! [`address::page_chunks`].

pub mod address;
pub mod asynchronous;
pub mod blocking;
mod command;
pub mod device_info;
pub mod error;
pub mod register;

use crate::error::Error;

pub use crate::address::{BLOCK_SIZE, PAGE_SIZE, SECTOR_SIZE};

/// Settle time after power-up before the chip accepts commands, in ms.
pub const POWER_UP_DELAY_MS: u32 = 6;

/// Recovery time after a software reset, in ms.
pub const RESET_RECOVERY_DELAY_MS: u32 = 1;

/// Cadence and budget of the completion poll loop after a program or erase.
///
/// The defaults cover the slowest datasheet operation, a full chip erase,
/// with headroom. Exhausting the budget surfaces [`error::Error::Timeout`].
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[derive(Debug, Clone, Copy)]
pub struct WaitPolicy {
    /// Delay between two status reads, in us. Zero polls back to back.
    pub interval_us: u32,
    /// Number of status reads before giving up.
    pub max_polls: u32,
}

impl Default for WaitPolicy {
    fn default() -> Self {
        WaitPolicy {
            interval_us: 100,
            max_polls: 1_000_000,
        }
    }
}

pub(crate) fn check_write<E>(capacity: usize, offset: u32, length: usize) -> Result<(), Error<E>> {
    let capacity = capacity as u32;
    let length = length as u32;
    if length > capacity || offset > capacity - length {
        return Err(Error::OutOfBounds);
    }
    Ok(())
}
