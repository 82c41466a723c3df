/// What to do with a data block whose CRC-16 doesn't match.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum DataCrcPolicy {
    /// Fail the transfer and keep the previous buffer.
    Reject,
    /// Commit the block and flag the mismatch.
    AcceptAndFlag,
}

/// Represents config for [`SdSpiBus`](crate::SdSpiBus).
pub trait SdSpiConfig {
    /// Max attempts per initialization step, and max bytes to wait for an idle bus.
    const CMD_MAX_ATTEMPTS: usize;
    /// Max bytes to read looking for an R1.
    const READ_R1_ATTEMPTS: usize;
    /// Max attempts to enter SPI mode.
    const ENTER_SPI_MODE_ATTEMPTS: usize;
    /// Max CMD55/ACMD41 polls until the card leaves idle state.
    const OP_COND_POLL_ATTEMPTS: usize;
    /// Max bytes to wait for the data start token.
    const START_TOKEN_ATTEMPTS: usize;
    /// Blocks mapped into the bus word address space.
    const ADDRESSABLE_BLOCKS: u32;
    /// Data block CRC policy.
    const DATA_CRC_POLICY: DataCrcPolicy;
}

/// Default implementation of [`SdSpiConfig`](crate::SdSpiConfig).
pub struct DefaultSdSpiConfig;

impl SdSpiConfig for DefaultSdSpiConfig {
    const CMD_MAX_ATTEMPTS: usize = 256;
    const READ_R1_ATTEMPTS: usize = 128;
    const ENTER_SPI_MODE_ATTEMPTS: usize = 10;
    const OP_COND_POLL_ATTEMPTS: usize = 1024;
    const START_TOKEN_ATTEMPTS: usize = 1024;
    const ADDRESSABLE_BLOCKS: u32 = 1;
    const DATA_CRC_POLICY: DataCrcPolicy = DataCrcPolicy::Reject;
}
