/// All possible errors emitted by the driver
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Error<SpiError> {
    /// Internal Spi error
    Spi(SpiError),

    /// Invalid value passed
    Value,

    /// Address out of bound
    OutOfBounds,

    /// Address not aligned
    NotAligned,

    /// A program or erase is still in progress
    Busy,

    /// The write-in-progress bit did not clear within the poll budget
    Timeout,

    /// The chip did not identify as the expected part
    IdMismatch {
        /// JEDEC id the driver was built for
        expected: u32,
        /// JEDEC id the chip returned
        found: u32,
    },
}
