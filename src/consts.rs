/// Size of a data block in bytes.
pub const BLOCK_SIZE: usize = 512;
/// Size of a data block in bus words.
pub const BLOCK_WORDS: usize = BLOCK_SIZE / 4;
/// Width of the host bus word address.
pub const BUS_ADDRESS_BITS: u32 = 12;

pub mod commands {
    /// Command byte prefix: start bit clear, transmit bit set.
    pub const CMD_BASE: u8 = 0x40;
    /// Command index mask.
    pub const INDEX_MASK: u8 = 0x3F;
    /// GO_IDLE_STATE - init card in spi mode if CS low.
    pub const CMD0: u8 = 0;
    /// SEND_IF_COND - verify SD Memory Card interface operating condition.
    pub const CMD8: u8 = 8;
    /// SET_BLOCKLEN - set the block length for block commands.
    pub const CMD16: u8 = 16;
    /// READ_SINGLE_BLOCK - read a single data block from the card.
    pub const CMD17: u8 = 17;
    /// WRITE_BLOCK - write a single data block to the card.
    pub const CMD24: u8 = 24;
    /// APP_CMD - escape for application specific command.
    pub const CMD55: u8 = 55;
    /// READ_OCR - read the OCR register of a card.
    pub const CMD58: u8 = 58;
    /// SD_SEND_OP_COMD - Sends host capacity support information and activates
    /// the card's initialization process.
    pub const ACMD41: u8 = 41;
}

/// Bring-up command tokens as they go on the wire, MSB first.
pub mod wire {
    /// CMD0, argument 0.
    pub const CMD0: u64 = 0x40_00_00_00_00_95;
    /// CMD8, 2.7-3.6V and check pattern 0xAA.
    pub const CMD8: u64 = 0x48_00_00_01_AA_87;
    /// CMD55, argument 0.
    pub const CMD55: u64 = 0x77_00_00_00_00_01;
    /// ACMD41, HCS set.
    pub const ACMD41: u64 = 0x69_40_FF_80_00_01;
    /// CMD58, argument 0.
    pub const CMD58: u64 = 0x7A_00_00_00_00_FF;
    /// CMD16, block length 512.
    pub const CMD16: u64 = 0x50_00_00_02_00_01;
}

pub mod tokens {
    /// Idle bus / fill byte.
    pub const AVAILABLE: u8 = 0xFF;
    /// Start data token for read or write single block.
    pub const DATA_START_BLOCK: u8 = 0xFE;
    /// Interface condition argument: 2.7-3.6V and check pattern.
    pub const CMD8_PATTERN: u32 = 0x0000_01AA;
    /// Bits of the R7 payload echoing the interface condition.
    pub const CMD8_ECHO_MASK: u32 = 0x0000_0FFF;
}
