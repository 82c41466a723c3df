use crate::{
    consts::{commands, wire},
    crc::crc7,
};

/// Command token, 48 bits on the wire.
///
/// Layout, MSB first: start bit (0), transmit bit (1), 6-bit index,
/// 32-bit argument, 7-bit CRC, stop bit (1).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct CommandToken {
    index: u8,
    argument: u32,
    checksum: u8,
}

/// Encode a command into its 48-bit wire token.
pub fn encode(index: u8, argument: u32) -> u64 {
    CommandToken::new(index, argument).to_wire()
}

/// READ_SINGLE_BLOCK token for the byte address `address`.
pub fn read_single_block(address: u32) -> CommandToken {
    CommandToken::new(commands::CMD17, address)
}

impl CommandToken {
    /// GO_IDLE_STATE.
    pub const GO_IDLE_STATE: CommandToken = CommandToken::from_wire(wire::CMD0);
    /// SEND_IF_COND.
    pub const SEND_IF_COND: CommandToken = CommandToken::from_wire(wire::CMD8);
    /// APP_CMD.
    pub const APP_CMD: CommandToken = CommandToken::from_wire(wire::CMD55);
    /// SD_SEND_OP_COND.
    pub const SD_SEND_OP_COND: CommandToken = CommandToken::from_wire(wire::ACMD41);
    /// READ_OCR.
    pub const READ_OCR: CommandToken = CommandToken::from_wire(wire::CMD58);
    /// SET_BLOCKLEN.
    pub const SET_BLOCKLEN: CommandToken = CommandToken::from_wire(wire::CMD16);

    /// Creates a token with a computed checksum.
    pub fn new(index: u8, argument: u32) -> Self {
        let index = index & commands::INDEX_MASK;
        let head = Self::head(index, argument);

        CommandToken {
            index,
            argument,
            checksum: crc7(&head),
        }
    }

    /// Creates a token from a 48-bit wire literal, checksum taken as is.
    pub const fn from_wire(token: u64) -> Self {
        CommandToken {
            index: ((token >> 40) as u8) & commands::INDEX_MASK,
            argument: (token >> 8) as u32,
            checksum: ((token >> 1) as u8) & 0x7F,
        }
    }

    /// Parses six wire bytes, checking the framing bits.
    pub fn from_bytes(bytes: [u8; 6]) -> Option<Self> {
        if bytes[0] & 0xC0 != commands::CMD_BASE || bytes[5] & 0x01 != 0x01 {
            return None;
        }

        Some(CommandToken {
            index: bytes[0] & commands::INDEX_MASK,
            argument: u32::from_be_bytes([bytes[1], bytes[2], bytes[3], bytes[4]]),
            checksum: bytes[5] >> 1,
        })
    }

    /// Command index.
    pub fn index(&self) -> u8 {
        self.index
    }

    /// Command argument.
    pub fn argument(&self) -> u32 {
        self.argument
    }

    /// 7-bit checksum carried by the token.
    pub fn checksum(&self) -> u8 {
        self.checksum
    }

    /// Whether the carried checksum is the CRC-7 of the first 40 bits.
    pub fn is_checksum_valid(&self) -> bool {
        crc7(&Self::head(self.index, self.argument)) == self.checksum
    }

    /// Wire bytes, MSB first.
    pub fn to_bytes(&self) -> [u8; 6] {
        let head = Self::head(self.index, self.argument);

        [
            head[0],
            head[1],
            head[2],
            head[3],
            head[4],
            (self.checksum << 1) | 0x01,
        ]
    }

    /// Wire token in the low 48 bits.
    pub fn to_wire(&self) -> u64 {
        self.to_bytes()
            .iter()
            .fold(0u64, |acc, &byte| (acc << 8) | u64::from(byte))
    }

    fn head(index: u8, argument: u32) -> [u8; 5] {
        let arg = argument.to_be_bytes();
        [commands::CMD_BASE | index, arg[0], arg[1], arg[2], arg[3]]
    }
}
