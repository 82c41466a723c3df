//! Single block reads: CMD17, start token wait, 512 data bytes and CRC-16.

use crate::{
    command::read_single_block,
    config::{DataCrcPolicy, SdSpiConfig},
    consts::{tokens, BLOCK_SIZE, BLOCK_WORDS},
    crc::crc16,
    error::{Error, ProtocolError},
    link::{ErrorFor, Link},
    response::ResponseShape,
};

use core::marker::PhantomData;
use embedded_hal::blocking::spi::Transfer;
use switch_hal::OutputSwitch;

/// Last block read from the card.
pub struct BlockBuffer {
    data: [u8; BLOCK_SIZE],
    valid: bool,
    address: u32,
    crc_mismatch: bool,
}

impl BlockBuffer {
    const fn empty() -> Self {
        BlockBuffer {
            data: [0; BLOCK_SIZE],
            valid: false,
            address: 0,
            crc_mismatch: false,
        }
    }

    /// Block bytes.
    pub fn data(&self) -> &[u8; BLOCK_SIZE] {
        &self.data
    }

    /// Holds a completed read.
    pub fn is_valid(&self) -> bool {
        self.valid
    }

    /// Byte address the block was read from.
    pub fn address(&self) -> u32 {
        self.address
    }

    /// Committed despite a CRC-16 mismatch.
    pub fn crc_mismatch(&self) -> bool {
        self.crc_mismatch
    }

    /// Little-endian word `index`, `None` past the end of the block.
    pub fn word(&self, index: usize) -> Option<u32> {
        if index >= BLOCK_WORDS {
            return None;
        }

        let offset = index * 4;
        let mut word = [0u8; 4];
        word.copy_from_slice(&self.data[offset..offset + 4]);
        Some(u32::from_le_bytes(word))
    }

    /// Holds a valid copy of the block at `address`.
    pub fn holds(&self, address: u32) -> bool {
        self.valid && self.address == address
    }

    fn invalidate(&mut self) {
        self.valid = false;
    }
}

#[derive(Clone, Copy)]
enum Phase {
    Idle,
    AwaitToken { address: u32, polls: usize },
}

/// Block transfer engine.
pub struct BlockTransfer<Config: SdSpiConfig> {
    buffer: BlockBuffer,
    phase: Phase,
    config: PhantomData<Config>,
}

impl<Config: SdSpiConfig> Default for BlockTransfer<Config> {
    fn default() -> Self {
        Self::new()
    }
}

impl<Config: SdSpiConfig> BlockTransfer<Config> {
    /// Creates an idle [`BlockTransfer<Config>`] with an empty buffer.
    pub fn new() -> Self {
        BlockTransfer {
            buffer: BlockBuffer::empty(),
            phase: Phase::Idle,
            config: PhantomData::<Config>,
        }
    }

    /// Read-only view of the buffer.
    pub fn buffer(&self) -> &BlockBuffer {
        &self.buffer
    }

    /// A transfer is in flight.
    pub fn in_flight(&self) -> bool {
        matches!(self.phase, Phase::AwaitToken { .. })
    }

    /// Byte address of the transfer in flight.
    pub fn pending_address(&self) -> Option<u32> {
        match self.phase {
            Phase::Idle => None,
            Phase::AwaitToken { address, .. } => Some(address),
        }
    }

    /// Drop the buffer and forget any transfer in flight.
    ///
    /// Chip select is left to the caller.
    pub fn discard(&mut self) {
        self.phase = Phase::Idle;
        self.buffer.invalidate();
    }

    /// Issue CMD17 for the block at byte `address`.
    ///
    /// Chip select stays asserted until the transfer ends.
    pub fn start<Spi, Cs>(
        &mut self,
        link: &mut Link<Spi, Cs, Config>,
        address: u32,
    ) -> Result<(), ErrorFor<Spi, Cs>>
    where
        Spi: Transfer<u8>,
        Cs: OutputSwitch,
    {
        if self.in_flight() {
            return Err(Error::Busy);
        }

        debug!("SD read block, address: 0x{:08X}", address);

        link.select()?;
        let result = link
            .send_command(read_single_block(address), ResponseShape::R1)
            .and_then(|r| r.r1().check().map_err(Error::from));

        match result {
            Ok(()) => {
                self.phase = Phase::AwaitToken { address, polls: 0 };
                Ok(())
            }
            Err(err) => {
                link.unselect()?;
                Err(err)
            }
        }
    }

    /// Read one byte towards the start token, or the whole block once it shows.
    ///
    /// Returns `true` once the block is committed.
    pub fn step<Spi, Cs>(&mut self, link: &mut Link<Spi, Cs, Config>) -> Result<bool, ErrorFor<Spi, Cs>>
    where
        Spi: Transfer<u8>,
        Cs: OutputSwitch,
    {
        let (address, polls) = match self.phase {
            Phase::Idle => return Ok(false),
            Phase::AwaitToken { address, polls } => (address, polls),
        };

        let result = match link.receive() {
            Ok(tokens::AVAILABLE) if polls + 1 < Config::START_TOKEN_ATTEMPTS => {
                self.phase = Phase::AwaitToken {
                    address,
                    polls: polls + 1,
                };
                return Ok(false);
            }
            Ok(tokens::AVAILABLE) => Err(ProtocolError::Timeout.into()),
            Ok(tokens::DATA_START_BLOCK) => self.read_data(link, address),
            Ok(token) => Err(ProtocolError::DataToken(token).into()),
            Err(err) => Err(err),
        };

        self.phase = Phase::Idle;
        link.unselect()?;

        match result {
            Ok(()) => Ok(true),
            Err(err) => {
                error!("SD read of block 0x{:08X} failed: {:?}", address, protocol_cause(&err));
                Err(err)
            }
        }
    }

    /// Stream the block and its CRC, then commit.
    fn read_data<Spi, Cs>(
        &mut self,
        link: &mut Link<Spi, Cs, Config>,
        address: u32,
    ) -> Result<(), ErrorFor<Spi, Cs>>
    where
        Spi: Transfer<u8>,
        Cs: OutputSwitch,
    {
        let mut data = [0u8; BLOCK_SIZE];
        link.receive_slice(&mut data)?;

        let card_crc = (u16::from(link.receive()?) << 8) | u16::from(link.receive()?);
        let host_crc = crc16(&data);
        let crc_mismatch = card_crc != host_crc;

        if crc_mismatch {
            match Config::DATA_CRC_POLICY {
                DataCrcPolicy::Reject => {
                    return Err(ProtocolError::DataCrcMismatch(card_crc, host_crc).into())
                }
                DataCrcPolicy::AcceptAndFlag => warn!(
                    "SD block 0x{:08X} CRC mismatch, card: 0x{:04X}, host: 0x{:04X}",
                    address, card_crc, host_crc
                ),
            }
        }

        self.buffer = BlockBuffer {
            data,
            valid: true,
            address,
            crc_mismatch,
        };

        Ok(())
    }
}

/// Protocol part of an error, for logging.
fn protocol_cause<T, S>(err: &Error<T, S>) -> Option<ProtocolError> {
    match err {
        Error::Protocol(err) => Some(*err),
        _ => None,
    }
}
