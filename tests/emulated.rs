//! Drives the full driver against an in-memory emulation of the chip.
//!
//! The emulator models the parts of the device the driver relies on: the
//! write-enable latch, the write-in-progress bit, intra-page wrap of page
//! programs and the erased state of NOR cells (program only clears bits). A
//! driver that crosses a page boundary or skips the write-enable sequence
//! fails these tests.

use embedded_hal::spi::{self, ErrorType, Operation, SpiDevice};
use mx25l::address::{Address, Sector};
use mx25l::blocking::MX25L6433F;
use mx25l::error::Error;
use mx25l::WaitPolicy;

const CAPACITY: usize = 8 * 1024 * 1024;
const PAGE_SIZE: usize = 256;
const SECTOR_SIZE: usize = 4096;
const BLOCK_SIZE: usize = 64 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum EmuError {
    UnexpectedCommand(u8),
    WriteNotEnabled,
    ResetNotEnabled,
    OutOfBounds,
}

impl spi::Error for EmuError {
    fn kind(&self) -> spi::ErrorKind {
        spi::ErrorKind::Other
    }
}

struct EmulatedMx25l {
    data: Vec<u8>,
    jedec: [u8; 3],
    write_enabled: bool,
    reset_enabled: bool,
    /// Status polls left before the write-in-progress bit clears.
    busy_polls_left: u32,
    /// How many polls each program/erase stays busy for.
    busy_cost: u32,
    /// Opcodes executed, in order.
    log: Vec<u8>,
}

impl EmulatedMx25l {
    fn new() -> Self {
        Self::with_jedec([0xC2, 0x20, 0x17])
    }

    fn with_jedec(jedec: [u8; 3]) -> Self {
        Self {
            data: vec![0xFF; CAPACITY],
            jedec,
            write_enabled: false,
            reset_enabled: false,
            busy_polls_left: 0,
            busy_cost: 2,
            log: Vec::new(),
        }
    }

    fn status_byte(&mut self) -> u8 {
        let mut status = 0u8;
        if self.busy_polls_left > 0 {
            self.busy_polls_left -= 1;
            status |= 0x01;
        }
        if self.write_enabled {
            status |= 0x02;
        }
        status
    }

    fn addr(cmd: &[u8]) -> usize {
        (cmd[1] as usize) << 16 | (cmd[2] as usize) << 8 | cmd[3] as usize
    }

    fn serve_read(&mut self, cmd: &[u8], buf: &mut [u8]) -> Result<(), EmuError> {
        self.log.push(cmd[0]);
        match cmd[0] {
            0x03 => {
                let addr = Self::addr(cmd);
                if addr + buf.len() > self.data.len() {
                    return Err(EmuError::OutOfBounds);
                }
                buf.copy_from_slice(&self.data[addr..addr + buf.len()]);
                Ok(())
            }
            0x9F => {
                buf.copy_from_slice(&self.jedec[..buf.len()]);
                Ok(())
            }
            other => Err(EmuError::UnexpectedCommand(other)),
        }
    }

    fn take_write_enable(&mut self) -> Result<(), EmuError> {
        if !self.write_enabled {
            return Err(EmuError::WriteNotEnabled);
        }
        self.write_enabled = false;
        self.busy_polls_left = self.busy_cost;
        Ok(())
    }

    fn execute(&mut self, cmd: &[u8]) -> Result<(), EmuError> {
        self.log.push(cmd[0]);
        match cmd[0] {
            0x06 => {
                self.write_enabled = true;
                Ok(())
            }
            0x04 => {
                self.write_enabled = false;
                Ok(())
            }
            0x66 => {
                self.reset_enabled = true;
                Ok(())
            }
            0x99 => {
                if !self.reset_enabled {
                    return Err(EmuError::ResetNotEnabled);
                }
                self.reset_enabled = false;
                self.write_enabled = false;
                Ok(())
            }
            // Page program wraps within the page, exactly like the chip.
            0x02 => {
                self.take_write_enable()?;
                let addr = Self::addr(cmd);
                if addr >= self.data.len() {
                    return Err(EmuError::OutOfBounds);
                }
                let page = addr & !(PAGE_SIZE - 1);
                for (i, byte) in cmd[4..].iter().enumerate() {
                    let offset = (addr % PAGE_SIZE + i) % PAGE_SIZE;
                    self.data[page + offset] &= byte;
                }
                Ok(())
            }
            0x20 => {
                self.take_write_enable()?;
                let base = Self::addr(cmd) & !(SECTOR_SIZE - 1);
                self.data[base..base + SECTOR_SIZE].fill(0xFF);
                Ok(())
            }
            0xD8 => {
                self.take_write_enable()?;
                let base = Self::addr(cmd) & !(BLOCK_SIZE - 1);
                self.data[base..base + BLOCK_SIZE].fill(0xFF);
                Ok(())
            }
            0x60 => {
                self.take_write_enable()?;
                self.data.fill(0xFF);
                Ok(())
            }
            other => Err(EmuError::UnexpectedCommand(other)),
        }
    }

    fn transact(&mut self, operations: &mut [Operation<'_, u8>]) -> Result<(), EmuError> {
        let mut written: Vec<u8> = Vec::new();
        let mut served = false;
        for op in operations.iter_mut() {
            match op {
                Operation::Write(bytes) => written.extend_from_slice(bytes),
                Operation::Read(buf) => {
                    let cmd = core::mem::take(&mut written);
                    self.serve_read(&cmd, buf)?;
                    served = true;
                }
                Operation::TransferInPlace(buf) => {
                    if buf[0] != 0x05 {
                        return Err(EmuError::UnexpectedCommand(buf[0]));
                    }
                    self.log.push(0x05);
                    let status = self.status_byte();
                    for byte in buf[1..].iter_mut() {
                        *byte = status;
                    }
                    served = true;
                }
                Operation::Transfer(_, _) => return Err(EmuError::UnexpectedCommand(0)),
                Operation::DelayNs(_) => {}
            }
        }
        if !served {
            self.execute(&written)?;
        }
        Ok(())
    }
}

impl ErrorType for EmulatedMx25l {
    type Error = EmuError;
}

impl SpiDevice for EmulatedMx25l {
    fn transaction(&mut self, operations: &mut [Operation<'_, u8>]) -> Result<(), EmuError> {
        self.transact(operations)
    }
}

impl embedded_hal_async::spi::SpiDevice for EmulatedMx25l {
    async fn transaction(&mut self, operations: &mut [Operation<'_, u8>]) -> Result<(), EmuError> {
        self.transact(operations)
    }
}

struct NoopDelay;

impl embedded_hal::delay::DelayNs for NoopDelay {
    fn delay_ns(&mut self, _ns: u32) {}
}

impl embedded_hal_async::delay::DelayNs for NoopDelay {
    async fn delay_ns(&mut self, _ns: u32) {}
}

fn flash() -> MX25L6433F<EmulatedMx25l, NoopDelay> {
    MX25L6433F::new(EmulatedMx25l::new(), NoopDelay)
}

#[test]
fn init_accepts_the_expected_id() {
    let mut flash = flash();
    assert_eq!(flash.init(), Ok(()));
    assert_eq!(flash.read_identification().unwrap().0, 0xC22017);
}

#[test]
fn init_rejects_a_foreign_chip() {
    let mut flash = MX25L6433F::new(EmulatedMx25l::with_jedec([0xEF, 0x40, 0x17]), NoopDelay);
    assert_eq!(
        flash.init(),
        Err(Error::IdMismatch {
            expected: 0xC22017,
            found: 0xEF4017,
        })
    );

    // Nothing destructive was attempted after the mismatch.
    let (emu, _) = flash.release();
    assert!(!emu.log.iter().any(|&op| matches!(op, 0x02 | 0x20 | 0xD8 | 0x60)));
}

#[test]
fn erased_never_written_region_reads_0xff() {
    let mut flash = flash();
    let mut buf = [0u8; 32];
    flash.read(Address(0x1234), &mut buf).unwrap();
    assert_eq!(buf, [0xFF; 32]);
}

#[test]
fn misaligned_write_straddles_two_pages() {
    let mut flash = flash();
    flash.write(Address(0x00FF), &[0xAA, 0x55]).unwrap();

    let mut buf = [0u8; 2];
    flash.read(Address(0x00FF), &mut buf).unwrap();
    assert_eq!(buf, [0xAA, 0x55]);

    // The bytes land linearly, not wrapped into page zero.
    let (emu, _) = flash.release();
    assert_eq!(emu.data[0x00FF], 0xAA);
    assert_eq!(emu.data[0x0100], 0x55);
    assert_eq!(emu.data[0x0000], 0xFF);
}

#[test]
fn aligned_multi_page_write_round_trips() {
    let mut flash = flash();
    let data: Vec<u8> = (0..300).map(|i| (i % 251) as u8).collect();
    flash.write(Address(0x0000), &data).unwrap();

    let mut buf = vec![0u8; data.len()];
    flash.read(Address(0x0000), &mut buf).unwrap();
    assert_eq!(buf, data);
}

#[test]
fn misaligned_long_write_round_trips() {
    let mut flash = flash();
    let data: Vec<u8> = (0..600).map(|i| (i % 249) as u8).collect();
    flash.write(Address(0x01F0), &data).unwrap();

    let mut buf = vec![0u8; data.len()];
    flash.read(Address(0x01F0), &mut buf).unwrap();
    assert_eq!(buf, data);
}

#[test]
fn empty_write_is_a_no_op() {
    let mut flash = flash();
    flash.write(Address(0x0100), &[]).unwrap();

    let (emu, _) = flash.release();
    assert!(!emu.log.contains(&0x02));
}

#[test]
fn page_program_rejects_a_page_crossing_payload() {
    let mut flash = flash();
    assert_eq!(
        flash.page_program(Address(0x00FF), &[0, 0]),
        Err(Error::NotAligned)
    );
}

#[test]
fn write_past_the_end_is_out_of_bounds() {
    let mut flash = flash();
    assert_eq!(
        flash.write(Address(CAPACITY as u32 - 1), &[0, 0]),
        Err(Error::OutOfBounds)
    );
}

#[test]
fn sector_erase_is_idempotent() {
    let mut flash = flash();
    flash.write(Address(0x1000), &[0x00, 0x11, 0x22]).unwrap();

    flash.erase_sector(Sector(1)).unwrap();
    flash.erase_sector(Sector(1)).unwrap();

    let mut buf = [0u8; 3];
    flash.read(Address(0x1000), &mut buf).unwrap();
    assert_eq!(buf, [0xFF; 3]);
}

#[test]
fn chip_erase_clears_everything() {
    let mut flash = flash();
    flash.write(Address(0x0000), &[0x00; 16]).unwrap();
    flash.write(Address(0x7F_0000), &[0x00; 16]).unwrap();
    flash.erase_chip().unwrap();

    let mut buf = [0u8; 16];
    flash.read(Address(0x7F_0000), &mut buf).unwrap();
    assert_eq!(buf, [0xFF; 16]);
}

#[test]
fn busy_poll_budget_exhaustion_times_out() {
    let mut emu = EmulatedMx25l::new();
    emu.busy_cost = 1000;
    let mut flash =
        MX25L6433F::new(emu, NoopDelay).with_wait_policy(WaitPolicy {
            interval_us: 0,
            max_polls: 3,
        });
    assert_eq!(flash.write(Address(0), &[0xAB]), Err(Error::Timeout));
}

mod storage_traits {
    use super::*;
    use embedded_storage::nor_flash::{NorFlash, ReadNorFlash};

    #[test]
    fn write_and_read_back_through_the_traits() {
        let mut flash = flash();
        let data = [0xDE, 0xAD, 0xBE, 0xEF];
        NorFlash::write(&mut flash, 0x00FE, &data).unwrap();

        let mut buf = [0u8; 4];
        ReadNorFlash::read(&mut flash, 0x00FE, &mut buf).unwrap();
        assert_eq!(buf, data);
    }

    #[test]
    fn erase_walks_blocks_and_sectors() {
        let mut flash = flash();
        flash.write(Address(0x0000), &[0x00; 8]).unwrap();
        flash.write(Address(0x1_0000), &[0x00; 8]).unwrap();

        // 64kB + one 4kB sector, exercises both erase sizes.
        NorFlash::erase(&mut flash, 0x0000, 0x1_1000).unwrap();

        let mut buf = [0u8; 8];
        ReadNorFlash::read(&mut flash, 0x1_0000, &mut buf).unwrap();
        assert_eq!(buf, [0xFF; 8]);

        let (emu, _) = flash.release();
        assert_eq!(emu.log.iter().filter(|&&op| op == 0xD8).count(), 1);
        assert_eq!(emu.log.iter().filter(|&&op| op == 0x20).count(), 1);
    }

    #[test]
    fn unaligned_erase_is_rejected() {
        let mut flash = flash();
        assert_eq!(
            NorFlash::erase(&mut flash, 0x0001, 0x1001),
            Err(Error::NotAligned)
        );
    }
}

mod asynchronous {
    use super::*;
    use embassy_futures::block_on;
    use mx25l::asynchronous::AsyncMX25L6433F;

    fn flash() -> AsyncMX25L6433F<EmulatedMx25l, NoopDelay> {
        AsyncMX25L6433F::new(EmulatedMx25l::new(), NoopDelay)
    }

    #[test]
    fn init_and_identification() {
        block_on(async {
            let mut flash = flash();
            assert_eq!(flash.init().await, Ok(()));
            assert_eq!(flash.read_identification().await.unwrap().0, 0xC22017);
        });
    }

    #[test]
    fn misaligned_write_round_trips() {
        block_on(async {
            let mut flash = flash();
            let data: Vec<u8> = (0..300).map(|i| (i % 247) as u8).collect();
            flash.write(Address(0x00FF), &data).await.unwrap();

            let mut buf = vec![0u8; data.len()];
            flash.read(Address(0x00FF), &mut buf).await.unwrap();
            assert_eq!(buf, data);
        });
    }

    #[test]
    fn erase_sector_restores_the_erased_state() {
        block_on(async {
            let mut flash = flash();
            flash.write(Address(0x2000), &[0x12, 0x34]).await.unwrap();
            flash.erase_sector(Sector(2)).await.unwrap();

            let mut buf = [0u8; 2];
            flash.read(Address(0x2000), &mut buf).await.unwrap();
            assert_eq!(buf, [0xFF, 0xFF]);
        });
    }
}
