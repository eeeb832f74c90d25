use crate::{
    address::{page_chunks, Address, Block64, Sector, BLOCK_SIZE, PAGE_SIZE, SECTOR_SIZE},
    command::Command,
    error::Error,
    register::{JedecId, StatusRegister},
    WaitPolicy, POWER_UP_DELAY_MS, RESET_RECOVERY_DELAY_MS,
};
use embassy_futures::yield_now;
use embedded_hal::spi::Operation;
use embedded_hal_async::delay::DelayNs;
use embedded_hal_async::spi::SpiDevice;

/// Type alias for the AsyncMX25L3233F
pub type AsyncMX25L3233F<SPI, D> = AsyncMX25L<0x3FFFFF, SPI, D>;

/// Type alias for the AsyncMX25L6433F
pub type AsyncMX25L6433F<SPI, D> = AsyncMX25L<0x7FFFFF, SPI, D>;

/// Type alias for the AsyncMX25L12835F
pub type AsyncMX25L12835F<SPI, D> = AsyncMX25L<0xFFFFFF, SPI, D>;

/// The async MX25L driver, see the `blocking` twin for the protocol details.
///
/// Programs and erases are write-enable gated and polled to completion under
/// the bounded [`WaitPolicy`], yielding to the executor between polls when no
/// poll interval is configured.
pub struct AsyncMX25L<const SIZE: u32, SPI, D> {
    spi: SPI,
    delay: D,
    wait: WaitPolicy,
}

impl<const SIZE: u32, SPI, E, D> AsyncMX25L<SIZE, SPI, D>
where
    SPI: SpiDevice<Error = E>,
    D: DelayNs,
{
    /// Create a new instance
    pub fn new(spi: SPI, delay: D) -> Self {
        Self {
            spi,
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

    /// Release the underlying SPI device and delay
    pub fn release(self) -> (SPI, D) {
        (self.spi, self.delay)
    }

    pub fn verify_addr(addr: Address) -> Result<u32, Error<E>> {
        let val: u32 = addr.into();
        if val > SIZE {
            return Err(Error::OutOfBounds);
        }
        Ok(val)
    }

    async fn command_write(&mut self, bytes: &[u8]) -> Result<(), Error<E>> {
        self.spi.write(bytes).await.map_err(Error::Spi)
    }

    async fn command_transfer(&mut self, bytes: &mut [u8]) -> Result<(), Error<E>> {
        self.spi.transfer_in_place(bytes).await.map_err(Error::Spi)
    }

    async fn addr_command(&mut self, addr: Address, cmd: Command) -> Result<(), Error<E>> {
        let addr_val: u32 = Self::verify_addr(addr)?;
        let cmd: [u8; 4] = [
            cmd as u8,
            (addr_val >> 16) as u8,
            (addr_val >> 8) as u8,
            addr_val as u8,
        ];
        self.spi.write(&cmd).await.map_err(Error::Spi)
    }

    async fn write_read_base(&mut self, write: &[u8], read: &mut [u8]) -> Result<(), Error<E>> {
        self.spi
            .transaction(&mut [Operation::Write(write), Operation::Read(read)])
            .await
            .map_err(Error::Spi)
    }

    /// Read n bytes from an address
    pub async fn read(&mut self, addr: Address, buff: &mut [u8]) -> Result<(), Error<E>> {
        let addr_val: u32 = Self::verify_addr(addr)?;
        let cmd: [u8; 4] = [
            Command::Read as u8,
            (addr_val >> 16) as u8,
            (addr_val >> 8) as u8,
            addr_val as u8,
        ];
        let res = self.write_read_base(&cmd, buff).await;
        #[cfg(feature = "defmt")]
        if res.is_err() {
            defmt::error!("read of {=usize} bytes at {=u32:#x} failed", buff.len(), addr_val);
        }
        res
    }

    /// Read the status register
    pub async fn read_status(&mut self) -> Result<StatusRegister, Error<E>> {
        let mut command: [u8; 2] = [Command::ReadStatus as u8, 0];
        self.command_transfer(&mut command).await?;
        Ok(command[1].into())
    }

    /// Read the wip bit, just less noisy than `read_status().unwrap().wip_bit`
    pub async fn poll_wip(&mut self) -> Result<(), Error<E>> {
        if self.read_status().await?.wip_bit {
            return Err(Error::Busy);
        }
        Ok(())
    }

    /// Poll the status register until the write-in-progress bit clears.
    ///
    /// Bounded by the configured [`WaitPolicy`], returns [`Error::Timeout`]
    /// when the budget is exhausted.
    pub async fn wait_while_busy(&mut self) -> Result<(), Error<E>> {
        for _ in 0..self.wait.max_polls {
            if !self.read_status().await?.wip_bit {
                return Ok(());
            }
            if self.wait.interval_us == 0 {
                yield_now().await;
            } else {
                self.delay.delay_us(self.wait.interval_us).await;
            }
        }
        Err(Error::Timeout)
    }

    /// Read the JEDEC identification of the device
    pub async fn read_identification(&mut self) -> Result<JedecId, Error<E>> {
        let cmd = [Command::ReadIdentification as u8];
        let mut id = [0u8; 3];
        self.write_read_base(&cmd, &mut id).await?;
        Ok(id.into())
    }

    /// Software reset, reset-enable and reset back to back followed by the
    /// mandatory recovery delay.
    pub async fn reset(&mut self) -> Result<(), Error<E>> {
        self.command_write(&[Command::ResetEnable as u8]).await?;
        self.command_write(&[Command::ResetMemory as u8]).await?;
        self.delay.delay_ms(RESET_RECOVERY_DELAY_MS).await;
        Ok(())
    }

    /// Bring the chip to a known state and verify its identity.
    ///
    /// Waits out the power-up settle time, resets the chip and compares the
    /// JEDEC id against the one expected for this capacity. On a mismatch no
    /// further command is issued and the device must not be used.
    pub async fn init(&mut self) -> Result<(), Error<E>> {
        self.delay.delay_ms(POWER_UP_DELAY_MS).await;
        self.reset().await?;
        let expected = JedecId::mx25l(Self::capacity() as u32);
        let found = self.read_identification().await?;
        if found != expected {
            #[cfg(feature = "defmt")]
            defmt::error!("expected id {=u32:#x}, chip answered {=u32:#x}", expected.0, found.0);
            return Err(Error::IdMismatch {
                expected: expected.0,
                found: found.0,
            });
        }
        Ok(())
    }

    /// Enable write operation
    async fn write_enable(&mut self) -> Result<(), Error<E>> {
        self.command_write(&[Command::WriteEnable as u8]).await
    }

    /// Disable write
    async fn write_disable(&mut self) -> Result<(), Error<E>> {
        self.command_write(&[Command::WriteDisable as u8]).await
    }

    async fn settle_gated_op(&mut self) -> Result<(), Error<E>> {
        self.wait_while_busy().await?;
        self.write_disable().await
    }

    /// Program up to a page worth of bytes at `addr`.
    ///
    /// The payload must fit the remaining space of the page, a payload that
    /// would run past the page end is rejected with [`Error::NotAligned`]
    /// rather than wrapped by the chip. An empty payload is a no-op.
    pub async fn page_program(&mut self, addr: Address, buff: &[u8]) -> Result<(), Error<E>> {
        if buff.is_empty() {
            return Ok(());
        }
        let addr_val = Self::verify_addr(addr)?;
        let room = PAGE_SIZE - addr_val % PAGE_SIZE;
        if buff.len() as u32 > room {
            return Err(Error::NotAligned);
        }
        let cmd: [u8; 4] = [
            Command::ProgramPage as u8,
            (addr_val >> 16) as u8,
            (addr_val >> 8) as u8,
            addr_val as u8,
        ];
        self.write_enable().await?;
        self.spi
            .transaction(&mut [Operation::Write(&cmd), Operation::Write(buff)])
            .await
            .map_err(Error::Spi)?;
        self.settle_gated_op().await
    }

    /// Write n bytes to an address, split into as many page programs as the
    /// page geometry requires. Chunks are programmed in order and the first
    /// failure aborts the remainder, the caller decides how much of the
    /// request landed by reading it back.
    pub async fn write(&mut self, addr: Address, buff: &[u8]) -> Result<(), Error<E>> {
        crate::check_write(Self::capacity(), addr.0, buff.len())?;
        if buff.is_empty() {
            return Ok(());
        }
        let mut consumed = 0usize;
        for (chunk_addr, chunk_len) in page_chunks(addr.0, buff.len() as u32) {
            let next = consumed + chunk_len as usize;
            self.page_program(Address(chunk_addr), &buff[consumed..next])
                .await?;
            consumed = next;
        }
        Ok(())
    }

    /// Erase a 4kB sector
    pub async fn erase_sector(&mut self, sector: Sector) -> Result<(), Error<E>> {
        self.write_enable().await?;
        self.addr_command(Address::from_sector(sector), Command::SectorErase)
            .await?;
        self.settle_gated_op().await
    }

    /// Erase a 64kB block
    pub async fn erase_block(&mut self, block: Block64) -> Result<(), Error<E>> {
        self.write_enable().await?;
        self.addr_command(Address::from_block64(block), Command::BlockErase)
            .await?;
        self.settle_gated_op().await
    }

    /// Erase the whole chip
    pub async fn erase_chip(&mut self) -> Result<(), Error<E>> {
        self.write_enable().await?;
        self.command_write(&[Command::ChipErase as u8]).await?;
        self.settle_gated_op().await
    }
}

mod es {
    use super::*;
    use core::fmt::Debug;
    use embedded_storage_async::nor_flash::{MultiwriteNorFlash, NorFlash, ReadNorFlash};

    impl<const SIZE: u32, SPI, E, D> embedded_storage_async::nor_flash::ErrorType
        for AsyncMX25L<SIZE, SPI, D>
    where
        SPI: SpiDevice<Error = E>,
        D: DelayNs,
        E: Debug,
    {
        type Error = Error<E>;
    }

    impl<const SIZE: u32, SPI, E, D> ReadNorFlash for AsyncMX25L<SIZE, SPI, D>
    where
        SPI: SpiDevice<Error = E>,
        D: DelayNs,
        E: Debug,
    {
        const READ_SIZE: usize = 1;

        async fn read(&mut self, offset: u32, bytes: &mut [u8]) -> Result<(), Self::Error> {
            self.read(Address(offset), bytes).await
        }

        fn capacity(&self) -> usize {
            Self::capacity()
        }
    }

    impl<const SIZE: u32, SPI, E, D> NorFlash for AsyncMX25L<SIZE, SPI, D>
    where
        SPI: SpiDevice<Error = E>,
        D: DelayNs,
        E: Debug,
    {
        const WRITE_SIZE: usize = 1;
        const ERASE_SIZE: usize = SECTOR_SIZE as usize;

        async fn erase(&mut self, from: u32, to: u32) -> Result<(), Self::Error> {
            if from > to || to > Self::capacity() as u32 {
                return Err(Error::OutOfBounds);
            }
            if from % SECTOR_SIZE != 0 || to % SECTOR_SIZE != 0 {
                return Err(Error::NotAligned);
            }

            let mut from = from;
            while from < to {
                if from % BLOCK_SIZE == 0 && to - from >= BLOCK_SIZE {
                    self.erase_block(Block64((from / BLOCK_SIZE) as u16)).await?;
                    from += BLOCK_SIZE;
                } else {
                    self.erase_sector(Sector((from / SECTOR_SIZE) as u16)).await?;
                    from += SECTOR_SIZE;
                }
            }
            Ok(())
        }

        async fn write(&mut self, offset: u32, bytes: &[u8]) -> Result<(), Self::Error> {
            self.write(Address(offset), bytes).await
        }
    }

    impl<const SIZE: u32, SPI, E, D> MultiwriteNorFlash for AsyncMX25L<SIZE, SPI, D>
    where
        SPI: SpiDevice<Error = E>,
        D: DelayNs,
        E: Debug,
    {
    }
}
