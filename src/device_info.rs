//! Static description of the flash array for host programming tools.
//!
//! A memory-mapped programmer (debugger flash loader, external-loader style
//! utility) consumes this record to plan its erase and program operations.
//! It is pure configuration, nothing here touches the bus.

use crate::address::{PAGE_SIZE, SECTOR_SIZE};

/// Device class advertised to the host tool.
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceClass {
    McuFlash,
    NandFlash,
    NorFlash,
    Sram,
    SerialFlash,
}

/// Geometry and programming parameters of one device.
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[derive(Debug, Clone, Copy)]
pub struct StorageInfo {
    pub device_name: &'static str,
    pub device_class: DeviceClass,
    /// Address the array is mapped at in the host address space.
    pub base_address: u32,
    pub total_size: u32,
    /// Programming granularity, one page.
    pub page_size: u32,
    /// Content of erased, never written memory.
    pub erased_value: u8,
    /// Uniform sector layout of the whole array.
    pub sector_count: u32,
    pub sector_size: u32,
}

const MX25L6433F_SIZE: u32 = 8 * 1024 * 1024;

/// The MX25L6433F as mapped by the host programmer.
pub const MX25L6433F_INFO: StorageInfo = StorageInfo {
    device_name: "MX25L6433F",
    device_class: DeviceClass::SerialFlash,
    base_address: 0x9000_0000,
    total_size: MX25L6433F_SIZE,
    page_size: PAGE_SIZE,
    erased_value: 0xFF,
    sector_count: MX25L6433F_SIZE / SECTOR_SIZE,
    sector_size: SECTOR_SIZE,
};

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sector_layout_covers_the_array() {
        let info = MX25L6433F_INFO;
        assert_eq!(info.sector_count * info.sector_size, info.total_size);
        assert_eq!(info.sector_count, 2048);
        assert_eq!(info.page_size, 256);
    }
}
