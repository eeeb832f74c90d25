use crate::{
    address::{page_chunks, Address, Block64, Sector, BLOCK_SIZE, PAGE_SIZE, SECTOR_SIZE},
    command::Command,
    error::Error,
    register::{JedecId, StatusRegister},
    WaitPolicy, POWER_UP_DELAY_MS, RESET_RECOVERY_DELAY_MS,
};
use embedded_hal::delay::DelayNs;
use embedded_hal::spi::{Operation, SpiDevice};

/// Type alias for the MX25L3233F
pub type MX25L3233F<SPI, D> = MX25L<0x3FFFFF, SPI, D>;

/// Type alias for the MX25L6433F
pub type MX25L6433F<SPI, D> = MX25L<0x7FFFFF, SPI, D>;

/// Type alias for the MX25L12835F
pub type MX25L12835F<SPI, D> = MX25L<0xFFFFFF, SPI, D>;

/// The generic low level MX25L driver
///
/// Frames every command on the bus: one chip select window per transaction,
/// opcode first, then the 3 byte big endian address where the command takes
/// one, then the payload. It performs no write-enable gating and no
/// completion polling, see [`MX25L`] for the gated driver.
pub struct MX25LLowLevel<const SIZE: u32, SPI> {
    spi: SPI,
}

impl<const SIZE: u32, SPI, E> MX25LLowLevel<SIZE, SPI>
where
    SPI: SpiDevice<Error = E>,
{
    pub fn new(spi: SPI) -> Self {
        Self { spi }
    }

    pub const fn capacity() -> usize {
        SIZE as usize + 1
    }

    pub fn verify_addr(addr: Address) -> Result<u32, Error<E>> {
        let val: u32 = addr.into();
        if val > SIZE {
            return Err(Error::OutOfBounds);
        }
        Ok(val)
    }

    fn command_write(&mut self, bytes: &[u8]) -> Result<(), Error<E>> {
        self.spi.write(bytes).map_err(Error::Spi)
    }

    fn command_transfer(&mut self, bytes: &mut [u8]) -> Result<(), Error<E>> {
        self.spi.transfer_in_place(bytes).map_err(Error::Spi)
    }

    fn addr_command(&mut self, addr: Address, cmd: Command) -> Result<(), Error<E>> {
        let addr_val: u32 = Self::verify_addr(addr)?;
        let cmd: [u8; 4] = [
            cmd as u8,
            (addr_val >> 16) as u8,
            (addr_val >> 8) as u8,
            addr_val as u8,
        ];
        self.spi.write(&cmd).map_err(Error::Spi)
    }

    fn write_read_base(&mut self, write: &[u8], read: &mut [u8]) -> Result<(), Error<E>> {
        self.spi
            .transaction(&mut [Operation::Write(write), Operation::Read(read)])
            .map_err(Error::Spi)
    }

    /// Read n bytes from an address
    pub fn read(&mut self, addr: Address, buff: &mut [u8]) -> Result<(), Error<E>> {
        let addr_val: u32 = Self::verify_addr(addr)?;
        let cmd: [u8; 4] = [
            Command::Read as u8,
            (addr_val >> 16) as u8,
            (addr_val >> 8) as u8,
            addr_val as u8,
        ];
        self.write_read_base(&cmd, buff)
    }

    /// Program up to a page worth of bytes. The payload must stay inside the
    /// 256 byte page window of `addr`, bytes past the page end wrap to the
    /// start of the same page. Write must be enabled, see `write_enable`
    pub fn page_program(&mut self, addr: Address, buff: &[u8]) -> Result<(), Error<E>> {
        let addr_val: u32 = Self::verify_addr(addr)?;
        let cmd: [u8; 4] = [
            Command::ProgramPage as u8,
            (addr_val >> 16) as u8,
            (addr_val >> 8) as u8,
            addr_val as u8,
        ];
        self.spi
            .transaction(&mut [Operation::Write(&cmd), Operation::Write(buff)])
            .map_err(Error::Spi)
    }

    /// Erase a 4kB sector. Write must be enabled, see `write_enable`
    pub fn sector_erase(&mut self, sector: Sector) -> Result<(), Error<E>> {
        let addr = Address::from_sector(sector);
        self.addr_command(addr, Command::SectorErase)
    }

    /// Erase a 64kB block. Write must be enabled, see `write_enable`
    pub fn block_erase(&mut self, block: Block64) -> Result<(), Error<E>> {
        let addr = Address::from_block64(block);
        self.addr_command(addr, Command::BlockErase)
    }

    /// Erase the whole chip. Write must be enabled, see `write_enable`
    pub fn chip_erase(&mut self) -> Result<(), Error<E>> {
        self.command_write(&[Command::ChipErase as u8])
    }

    /// Enable write operation
    pub fn write_enable(&mut self) -> Result<(), Error<E>> {
        self.command_write(&[Command::WriteEnable as u8])
    }

    /// Disable write
    pub fn write_disable(&mut self) -> Result<(), Error<E>> {
        self.command_write(&[Command::WriteDisable as u8])
    }

    /// Read the status register
    pub fn read_status(&mut self) -> Result<StatusRegister, Error<E>> {
        let mut command: [u8; 2] = [Command::ReadStatus as u8, 0];
        self.command_transfer(&mut command)?;
        Ok(command[1].into())
    }

    /// Read the JEDEC identification of the device
    pub fn read_identification(&mut self) -> Result<JedecId, Error<E>> {
        let cmd = [Command::ReadIdentification as u8];
        let mut id = [0u8; 3];
        self.write_read_base(&cmd, &mut id)?;
        Ok(id.into())
    }

    /// Enable reset
    pub fn reset_enable(&mut self) -> Result<(), Error<E>> {
        self.command_write(&[Command::ResetEnable as u8])
    }

    /// Reset the chip, the chip must have reset enabled. See `reset_enable`
    pub fn reset_memory(&mut self) -> Result<(), Error<E>> {
        self.command_write(&[Command::ResetMemory as u8])
    }

    /// Release the underlying SPI device
    pub fn release(self) -> SPI {
        self.spi
    }
}

/// The higher level MX25L driver
///
/// Wraps every program and erase with write-enable before and write-disable
/// after, and blocks until the write-in-progress bit clears. Arbitrary writes
/// are split into page programs. The polling loop is bounded by the
/// [`WaitPolicy`] and returns [`Error::Timeout`] on a dead or wedged chip
/// instead of spinning forever.
pub struct MX25L<const SIZE: u32, SPI, D> {
    ll: MX25LLowLevel<SIZE, SPI>,
    delay: D,
    wait: WaitPolicy,
}

impl<const SIZE: u32, SPI, E, D> MX25L<SIZE, SPI, D>
where
    SPI: SpiDevice<Error = E>,
    D: DelayNs,
{
    /// Create a new instance
    pub fn new(spi: SPI, delay: D) -> Self {
        Self {
            ll: MX25LLowLevel::new(spi),
            delay,
            wait: WaitPolicy::default(),
        }
    }

    /// Replace the completion poll budget
    pub fn with_wait_policy(mut self, wait: WaitPolicy) -> Self {
        self.wait = wait;
        self
    }

    pub const fn capacity() -> usize {
        SIZE as usize + 1
    }

    /// Access the ungated command layer
    pub fn low_level(&mut self) -> &mut MX25LLowLevel<SIZE, SPI> {
        &mut self.ll
    }

    /// Release the underlying SPI device and delay
    pub fn release(self) -> (SPI, D) {
        (self.ll.release(), self.delay)
    }

    /// Bring the chip to a known state and verify its identity.
    ///
    /// Waits out the power-up settle time, resets the chip and compares the
    /// JEDEC id against the one expected for this capacity. On a mismatch no
    /// further command is issued and the device must not be used.
    pub fn init(&mut self) -> Result<(), Error<E>> {
        self.delay.delay_ms(POWER_UP_DELAY_MS);
        self.reset()?;
        let expected = JedecId::mx25l(Self::capacity() as u32);
        let found = self.ll.read_identification()?;
        if found != expected {
            return Err(Error::IdMismatch {
                expected: expected.0,
                found: found.0,
            });
        }
        Ok(())
    }

    /// Software reset, reset-enable and reset back to back followed by the
    /// mandatory recovery delay.
    pub fn reset(&mut self) -> Result<(), Error<E>> {
        self.ll.reset_enable()?;
        self.ll.reset_memory()?;
        self.delay.delay_ms(RESET_RECOVERY_DELAY_MS);
        Ok(())
    }

    /// Read n bytes from an address
    pub fn read(&mut self, addr: Address, buff: &mut [u8]) -> Result<(), Error<E>> {
        self.ll.read(addr, buff)
    }

    /// Read the JEDEC identification of the device
    pub fn read_identification(&mut self) -> Result<JedecId, Error<E>> {
        self.ll.read_identification()
    }

    /// Read the status register
    pub fn read_status(&mut self) -> Result<StatusRegister, Error<E>> {
        self.ll.read_status()
    }

    /// Check once whether the chip has work in progress
    pub fn poll_wip(&mut self) -> Result<(), Error<E>> {
        if self.ll.read_status()?.wip_bit {
            return Err(Error::Busy);
        }
        Ok(())
    }

    /// Poll the status register until the write-in-progress bit clears.
    ///
    /// Bounded by the configured [`WaitPolicy`], returns [`Error::Timeout`]
    /// when the budget is exhausted.
    pub fn wait_while_busy(&mut self) -> Result<(), Error<E>> {
        for _ in 0..self.wait.max_polls {
            if !self.ll.read_status()?.wip_bit {
                return Ok(());
            }
            self.delay.delay_us(self.wait.interval_us);
        }
        Err(Error::Timeout)
    }

    fn with_write_enabled<F>(&mut self, op: F) -> Result<(), Error<E>>
    where
        F: FnOnce(&mut MX25LLowLevel<SIZE, SPI>) -> Result<(), Error<E>>,
    {
        self.ll.write_enable()?;
        op(&mut self.ll)?;
        self.wait_while_busy()?;
        self.ll.write_disable()
    }

    /// Program up to a page worth of bytes at `addr`.
    ///
    /// The payload must fit the remaining space of the page, a payload that
    /// would run past the page end is rejected with [`Error::NotAligned`]
    /// rather than wrapped by the chip. An empty payload is a no-op.
    pub fn page_program(&mut self, addr: Address, buff: &[u8]) -> Result<(), Error<E>> {
        if buff.is_empty() {
            return Ok(());
        }
        let addr_val = MX25LLowLevel::<SIZE, SPI>::verify_addr(addr)?;
        let room = PAGE_SIZE - addr_val % PAGE_SIZE;
        if buff.len() as u32 > room {
            return Err(Error::NotAligned);
        }
        self.with_write_enabled(|ll| ll.page_program(addr, buff))
    }

    /// Write n bytes to an address, split into as many page programs as the
    /// page geometry requires. Chunks are programmed in order and the first
    /// failure aborts the remainder, the caller decides how much of the
    /// request landed by reading it back.
    pub fn write(&mut self, addr: Address, buff: &[u8]) -> Result<(), Error<E>> {
        crate::check_write(Self::capacity(), addr.0, buff.len())?;
        if buff.is_empty() {
            return Ok(());
        }
        let mut consumed = 0usize;
        for (chunk_addr, chunk_len) in page_chunks(addr.0, buff.len() as u32) {
            let next = consumed + chunk_len as usize;
            self.page_program(Address(chunk_addr), &buff[consumed..next])?;
            consumed = next;
        }
        Ok(())
    }

    /// Erase a 4kB sector
    pub fn erase_sector(&mut self, sector: Sector) -> Result<(), Error<E>> {
        self.with_write_enabled(|ll| ll.sector_erase(sector))
    }

    /// Erase a 64kB block
    pub fn erase_block(&mut self, block: Block64) -> Result<(), Error<E>> {
        self.with_write_enabled(|ll| ll.block_erase(block))
    }

    /// Erase the whole chip
    pub fn erase_chip(&mut self) -> Result<(), Error<E>> {
        self.with_write_enabled(|ll| ll.chip_erase())
    }
}

/// Implementation of the `NorFlash` traits of the `embedded_storage` crate.
mod es {
    use super::*;
    use core::fmt::Debug;
    use embedded_storage::nor_flash::{
        check_erase, check_read, check_write, ErrorType, MultiwriteNorFlash, NorFlash,
        NorFlashError, NorFlashErrorKind, ReadNorFlash,
    };

    impl<E> From<NorFlashErrorKind> for Error<E> {
        fn from(e: NorFlashErrorKind) -> Self {
            match e {
                NorFlashErrorKind::NotAligned => Error::NotAligned,
                NorFlashErrorKind::OutOfBounds => Error::OutOfBounds,
                _ => Error::Value,
            }
        }
    }

    impl<SpiError> NorFlashError for Error<SpiError>
    where
        SpiError: Debug,
    {
        fn kind(&self) -> NorFlashErrorKind {
            match self {
                Error::OutOfBounds => NorFlashErrorKind::OutOfBounds,
                Error::NotAligned => NorFlashErrorKind::NotAligned,
                _ => NorFlashErrorKind::Other,
            }
        }
    }

    impl<const SIZE: u32, SPI, E, D> ErrorType for MX25L<SIZE, SPI, D>
    where
        SPI: SpiDevice<Error = E>,
        D: DelayNs,
        E: Debug,
    {
        type Error = Error<E>;
    }

    impl<const SIZE: u32, SPI, E, D> ReadNorFlash for MX25L<SIZE, SPI, D>
    where
        SPI: SpiDevice<Error = E>,
        D: DelayNs,
        E: Debug,
    {
        const READ_SIZE: usize = 1;

        fn read(&mut self, offset: u32, bytes: &mut [u8]) -> Result<(), Self::Error> {
            check_read(self, offset, bytes.len())?;
            self.read(Address(offset), bytes)
        }

        fn capacity(&self) -> usize {
            Self::capacity()
        }
    }

    impl<const SIZE: u32, SPI, E, D> NorFlash for MX25L<SIZE, SPI, D>
    where
        SPI: SpiDevice<Error = E>,
        D: DelayNs,
        E: Debug,
    {
        const WRITE_SIZE: usize = 1;
        const ERASE_SIZE: usize = SECTOR_SIZE as usize;

        fn erase(&mut self, from: u32, to: u32) -> Result<(), Self::Error> {
            check_erase(self, from, to)?;
            let mut from = from;
            while from < to {
                if from % BLOCK_SIZE == 0 && to - from >= BLOCK_SIZE {
                    self.erase_block(Block64((from / BLOCK_SIZE) as u16))?;
                    from += BLOCK_SIZE;
                } else {
                    self.erase_sector(Sector((from / SECTOR_SIZE) as u16))?;
                    from += SECTOR_SIZE;
                }
            }
            Ok(())
        }

        fn write(&mut self, offset: u32, bytes: &[u8]) -> Result<(), Self::Error> {
            check_write(self, offset, bytes.len())?;
            self.write(Address(offset), bytes)
        }
    }

    impl<const SIZE: u32, SPI, E, D> MultiwriteNorFlash for MX25L<SIZE, SPI, D>
    where
        SPI: SpiDevice<Error = E>,
        D: DelayNs,
        E: Debug,
    {
    }
}
