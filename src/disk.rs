//! Whole-block access through [`DiskioDevice`], driving the bus engine to completion.

use crate::{
    bus::SdSpiBus,
    config::SdSpiConfig,
    consts::BLOCK_SIZE,
    error::{BusFault, Error},
    init::CardState,
};

use core::cell::RefCell;
use diskio::{DiskioDevice, Error as DiskioError, IoctlCmd, Lba, Status, StatusFlag};
use embedded_hal::blocking::spi::Transfer;
use switch_hal::OutputSwitch;

/// Error type alias.
type ErrorFor<T> = <T as DiskioDevice>::HardwareError;

/// SD card as a block device.
pub struct SdSpiDisk<Spi: Transfer<u8>, Cs: OutputSwitch, Config: SdSpiConfig> {
    bus: RefCell<SdSpiBus<Spi, Cs, Config>>,
}

impl<Spi: Transfer<u8>, Cs: OutputSwitch, Config: SdSpiConfig> SdSpiDisk<Spi, Cs, Config>
where
    Spi::Error: core::fmt::Debug,
    Cs::Error: core::fmt::Debug,
{
    /// Creates a new [`SdSpiDisk<Spi, Cs, Config>`].
    pub fn new(spi: Spi, cs: Cs) -> Self {
        SdSpiDisk {
            bus: RefCell::new(SdSpiBus::new(spi, cs)),
        }
    }

    /// Releases the underlying bus engine.
    pub fn into_inner(self) -> SdSpiBus<Spi, Cs, Config> {
        self.bus.into_inner()
    }

    /// Validate buffer for read/write.
    fn validate_buffer_len(buf_len: usize) -> Result<(), DiskioError<ErrorFor<Self>>> {
        if buf_len == 0 || buf_len % BLOCK_SIZE != 0 {
            error!(
                "SD invalid buffer, length: {}, block size: {}",
                buf_len, BLOCK_SIZE
            );
            Err(DiskioError::InvalidArgument)
        } else {
            Ok(())
        }
    }

    /// Validate initialzed.
    fn validate_initialized(&self) -> Result<(), DiskioError<ErrorFor<Self>>> {
        if self.status().contains(StatusFlag::NotInitialized) {
            Err(DiskioError::NotInitialized)
        } else {
            Ok(())
        }
    }

    /// Byte address of `lba`, standard capacity addressing.
    fn block_address(lba: u64) -> Result<u32, DiskioError<ErrorFor<Self>>> {
        lba.checked_mul(BLOCK_SIZE as u64)
            .and_then(|address| u32::try_from(address).ok())
            .ok_or(DiskioError::InvalidArgument)
    }

    /// Fetch one block into `chunk`.
    fn read_block(&self, chunk: &mut [u8], address: u32) -> Result<(), ErrorFor<Self>> {
        let mut bus = self.bus.borrow_mut();

        if !bus.buffer().holds(address) {
            bus.queue_block(address)?;

            while !bus.buffer().holds(address) {
                bus.tick()?;
            }
        }

        chunk.copy_from_slice(bus.buffer().data());
        Ok(())
    }
}

impl<Spi: Transfer<u8>, Cs: OutputSwitch, Config: SdSpiConfig> DiskioDevice
    for SdSpiDisk<Spi, Cs, Config>
where
    Spi::Error: core::fmt::Debug,
    Cs::Error: core::fmt::Debug,
{
    type HardwareError = Error<Spi::Error, Cs::Error>;

    fn status(&self) -> Status {
        match self.bus.borrow().card_state() {
            CardState::Ready => Status::default(),
            CardState::Faulted => StatusFlag::ErrorOccured | StatusFlag::NotInitialized,
            _ => StatusFlag::NotInitialized.into(),
        }
    }

    fn reset(&mut self) {
        if self.bus.get_mut().reset().is_err() {
            warn!("SD reset failed to release select");
        }
    }

    fn initialize(&mut self) -> Result<(), DiskioError<Self::HardwareError>> {
        let bus = self.bus.get_mut();

        match bus.card_state() {
            CardState::Ready => {
                warn!("SD already is initialized");
                return Err(DiskioError::AlreadyInitialized);
            }
            CardState::Faulted => bus.reset().map_err(DiskioError::Hardware)?,
            _ => {}
        }

        while bus.card_state() != CardState::Ready {
            bus.tick().map_err(DiskioError::Hardware)?;
        }

        Ok(())
    }

    fn read(&self, buf: &mut [u8], lba: Lba) -> Result<(), DiskioError<Self::HardwareError>> {
        Self::validate_buffer_len(buf.len())?;
        self.validate_initialized()?;

        for (i, chunk) in buf.chunks_mut(BLOCK_SIZE).enumerate() {
            let address = Self::block_address(lba as u64 + i as u64)?;
            self.read_block(chunk, address)
                .map_err(DiskioError::Hardware)?;
        }

        Ok(())
    }

    fn write(&self, buf: &[u8], _lba: Lba) -> Result<(), DiskioError<Self::HardwareError>> {
        Self::validate_buffer_len(buf.len())?;
        self.validate_initialized()?;

        Err(DiskioError::Hardware(Error::Bus(BusFault::StoreAmoAccessFault)))
    }

    fn ioctl(&self, cmd: IoctlCmd) -> Result<(), DiskioError<Self::HardwareError>> {
        match cmd {
            IoctlCmd::CtrlSync => Ok(()),
            IoctlCmd::GetBlockSize(block_size) => {
                *block_size = BLOCK_SIZE;
                Ok(())
            }
            _ => Err(DiskioError::NotSupported),
        }
    }
}
