//! Word-addressable host bus over the block buffer.

use crate::{
    config::SdSpiConfig,
    consts::{BLOCK_SIZE, BUS_ADDRESS_BITS},
    error::{BusFault, Error},
    init::{CardState, Sequencer},
    link::{ErrorFor, Link},
    transfer::{BlockBuffer, BlockTransfer},
};

use bitfield::bitfield;
use embedded_hal::blocking::spi::Transfer;
use switch_hal::OutputSwitch;

bitfield! {
    /// Debug status bitset.
    #[derive(Clone, Copy, PartialEq, Eq, Default)]
    pub struct DebugStatus(u8);
    impl Debug;
    pub inited, set_inited: 0;
    pub idle, set_idle: 1;
    pub error, set_error: 2;
    pub busy, set_busy: 3;
    pub crc_flagged, set_crc_flagged: 4;
}

/// Bus request kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum BusRequestKind {
    Read,
    Write,
}

/// One bus transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct BusRequest {
    pub kind: BusRequestKind,
    /// 12-bit word address.
    pub address: u16,
    /// 3-bit lane mask: byte 0, byte 1, upper half-word.
    pub byte_enable: u8,
    pub write_data: u32,
}

/// Signals returned with every bus transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct BusResponse {
    pub data: u32,
    pub valid: bool,
    pub load_access_fault: bool,
    pub store_amo_access_fault: bool,
    /// Another block is being fetched; retry later.
    pub busy: bool,
}

impl BusResponse {
    fn fault(fault: BusFault) -> Self {
        BusResponse {
            load_access_fault: fault == BusFault::LoadAccessFault,
            store_amo_access_fault: fault == BusFault::StoreAmoAccessFault,
            ..Default::default()
        }
    }

    /// Either fault signal is raised.
    pub fn is_fault(&self) -> bool {
        self.load_access_fault || self.store_amo_access_fault
    }
}

/// Byte lanes selected by a byte enable mask.
fn lane_mask(byte_enable: u8) -> u32 {
    let mut mask = 0;
    if byte_enable & 0b001 != 0 {
        mask |= 0x0000_00FF;
    }
    if byte_enable & 0b010 != 0 {
        mask |= 0x0000_FF00;
    }
    if byte_enable & 0b100 != 0 {
        mask |= 0xFFFF_0000;
    }
    mask
}

/// SD card SPI driver behind a word-addressable bus.
///
/// `Spi` - SPI.
/// `Cs` - Chip select output switch.
/// `Config` - Config implementation of driver config trait.
pub struct SdSpiBus<Spi: Transfer<u8>, Cs: OutputSwitch, Config: SdSpiConfig> {
    link: Link<Spi, Cs, Config>,
    init: Sequencer<Config>,
    transfer: BlockTransfer<Config>,
    queued: Option<u32>,
    valid: bool,
    interrupt: bool,
    /// Block address of the last failed fetch, not yet reported.
    failed: Option<u32>,
    load_access_fault: bool,
    store_amo_access_fault: bool,
}

impl<Spi: Transfer<u8>, Cs: OutputSwitch, Config: SdSpiConfig> SdSpiBus<Spi, Cs, Config> {
    const WORDS_SHIFT: u32 = 7;
    const WORD_MASK: u16 = (1 << Self::WORDS_SHIFT) - 1;
    const LANES: u8 = 0b111;

    /// Creates a new [`SdSpiBus<Spi, Cs, Config>`].
    ///
    /// `spi` - SPI instance.
    /// `cs` - chip select output switch.
    pub fn new(spi: Spi, cs: Cs) -> Self {
        SdSpiBus {
            link: Link::new(spi, cs),
            init: Sequencer::new(),
            transfer: BlockTransfer::new(),
            queued: None,
            valid: false,
            interrupt: false,
            failed: None,
            load_access_fault: false,
            store_amo_access_fault: false,
        }
    }

    /// Releases the SPI and chip select.
    pub fn free(self) -> (Spi, Cs) {
        self.link.free()
    }

    /// External reset: back to `Reset`, buffer and queued reads dropped.
    pub fn reset(&mut self) -> Result<(), ErrorFor<Spi, Cs>> {
        info!("SD reset invoked");

        self.init.reset();
        self.transfer.discard();
        self.queued = None;
        self.valid = false;
        self.interrupt = false;
        self.failed = None;
        self.load_access_fault = false;
        self.store_amo_access_fault = false;

        if self.link.is_selected() {
            self.link.unselect()?;
        }

        Ok(())
    }

    /// Advance the engine by one step.
    ///
    /// Errors are also latched into the host signals.
    pub fn tick(&mut self) -> Result<(), ErrorFor<Spi, Cs>> {
        self.valid = false;

        match self.init.state() {
            CardState::Faulted => Err(Error::FatalInit),
            CardState::Ready => self.tick_transfer(),
            _ => match self.init.step(&mut self.link) {
                Err(Error::FatalInit) => {
                    self.queued = None;
                    self.interrupt = true;
                    Err(Error::FatalInit)
                }
                result => result.map(|_| ()),
            },
        }
    }

    fn tick_transfer(&mut self) -> Result<(), ErrorFor<Spi, Cs>> {
        let address = self.transfer.pending_address().or(self.queued);
        let result = if self.transfer.in_flight() {
            self.transfer.step(&mut self.link)
        } else if let Some(address) = self.queued {
            self.transfer.start(&mut self.link, address).map(|_| false)
        } else {
            return Ok(());
        };

        match result {
            Ok(true) => {
                self.queued = None;
                if self.failed == address {
                    self.failed = None;
                }
                self.valid = true;
                self.interrupt = true;
                Ok(())
            }
            Ok(false) => Ok(()),
            Err(err) => {
                self.queued = None;
                self.failed = address;
                self.interrupt = true;
                Err(err)
            }
        }
    }

    /// Dispatch a bus request.
    pub fn request(&mut self, request: BusRequest) -> BusResponse {
        match request.kind {
            BusRequestKind::Read => self.read(request.address, request.byte_enable),
            BusRequestKind::Write => {
                self.write(request.address, request.byte_enable, request.write_data)
            }
        }
    }

    /// Read the word at `address`.
    ///
    /// A word outside the buffered block queues a fetch; poll [`Self::valid`].
    pub fn read(&mut self, address: u16, byte_enable: u8) -> BusResponse {
        self.interrupt = false;

        let response = self.read_impl(address, byte_enable);
        self.latch(&response);

        response
    }

    fn read_impl(&mut self, address: u16, byte_enable: u8) -> BusResponse {
        let lanes = lane_mask(byte_enable);
        let block = u32::from(address >> Self::WORDS_SHIFT);

        if u32::from(address) >> BUS_ADDRESS_BITS != 0
            || byte_enable & !Self::LANES != 0
            || lanes == 0
            || block >= Config::ADDRESSABLE_BLOCKS
        {
            warn!(
                "SD bus read outside window, address: 0x{:03X}, byteen: 0b{:03b}",
                address, byte_enable
            );
            return BusResponse::fault(BusFault::LoadAccessFault);
        }

        if self.init.state() == CardState::Faulted {
            return BusResponse::fault(BusFault::LoadAccessFault);
        }

        let block_address = block * BLOCK_SIZE as u32;
        let buffer = self.transfer.buffer();

        if self.init.state() == CardState::Ready && buffer.holds(block_address) {
            let word = usize::from(address & Self::WORD_MASK);
            return match buffer.word(word) {
                Some(data) => BusResponse {
                    data: data & lanes,
                    valid: true,
                    ..Default::default()
                },
                None => BusResponse::fault(BusFault::LoadAccessFault),
            };
        }

        if self.failed == Some(block_address) {
            self.failed = None;
            return BusResponse::fault(BusFault::LoadAccessFault);
        }

        match self.transfer.pending_address().or(self.queued) {
            Some(pending) if pending != block_address => BusResponse {
                busy: true,
                ..Default::default()
            },
            Some(_) => BusResponse::default(),
            None => {
                self.queued = Some(block_address);
                BusResponse::default()
            }
        }
    }

    /// Writes always fault, the block buffer is left as is.
    pub fn write(&mut self, address: u16, byte_enable: u8, data: u32) -> BusResponse {
        warn!(
            "SD bus write rejected, address: 0x{:03X}, byteen: 0b{:03b}, data: 0x{:08X}",
            address, byte_enable, data
        );

        let response = BusResponse::fault(BusFault::StoreAmoAccessFault);
        self.interrupt = true;
        self.latch(&response);

        response
    }

    fn latch(&mut self, response: &BusResponse) {
        self.load_access_fault = response.load_access_fault;
        self.store_amo_access_fault = response.store_amo_access_fault;
        if response.is_fault() {
            self.interrupt = true;
        }
    }

    /// Queue a fetch of the block at byte `address`, regardless of the bus window.
    ///
    /// `address` must be aligned to [`BLOCK_SIZE`].
    pub fn queue_block(&mut self, address: u32) -> Result<(), ErrorFor<Spi, Cs>> {
        if address % BLOCK_SIZE as u32 != 0 {
            warn!("SD misaligned block address: 0x{:08X}", address);
            return Err(Error::Bus(BusFault::LoadAccessFault));
        }

        match self.transfer.pending_address().or(self.queued) {
            Some(pending) if pending != address => Err(Error::Busy),
            _ => {
                self.queued = Some(address);
                if self.failed == Some(address) {
                    self.failed = None;
                }
                Ok(())
            }
        }
    }

    /// One-shot completion pulse, cleared by reading it or by the next tick.
    pub fn valid(&mut self) -> bool {
        core::mem::replace(&mut self.valid, false)
    }

    /// Load access fault of the last request.
    pub fn load_access_fault(&self) -> bool {
        self.load_access_fault
    }

    /// Store/AMO access fault of the last request.
    pub fn store_amo_access_fault(&self) -> bool {
        self.store_amo_access_fault
    }

    /// Interrupt line, held until the next request.
    pub fn interrupt_req(&self) -> bool {
        self.interrupt
    }

    /// Debug status flags.
    pub fn debug_status(&self) -> DebugStatus {
        let mut status = DebugStatus(0);
        let state = self.init.state();
        let r1 = self.init.last_r1();

        status.set_inited(state == CardState::Ready);
        status.set_idle(r1.is_valid() && r1.in_idle_state());
        status.set_error(state == CardState::Faulted || self.failed.is_some());
        status.set_busy(self.transfer.in_flight() || self.queued.is_some());
        status.set_crc_flagged(self.transfer.buffer().crc_mismatch());
        status
    }

    /// Card is initialized.
    pub fn debug_inited(&self) -> bool {
        self.init.state() == CardState::Ready
    }

    /// Last R1 in the high byte, state code in the low byte.
    pub fn debug_sign(&self) -> u16 {
        let mut code = self.init.state().code();
        if self.transfer.in_flight() {
            code |= 0x10;
        }
        (u16::from(self.init.last_r1().0) << 8) | u16::from(code)
    }

    /// Card bring-up state.
    pub fn card_state(&self) -> CardState {
        self.init.state()
    }

    /// OCR read during bring-up.
    pub fn ocr(&self) -> Option<u32> {
        self.init.ocr()
    }

    /// Read-only view of the block buffer.
    pub fn buffer(&self) -> &BlockBuffer {
        self.transfer.buffer()
    }
}
