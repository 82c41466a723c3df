//! Byte-level access to the bit channel: a full-duplex SPI byte exchange and
//! the chip select line.

use crate::{
    command::CommandToken,
    config::SdSpiConfig,
    consts::tokens,
    error::{Error, ProtocolError},
    response::{decode, Response, ResponseShape},
};

use core::marker::PhantomData;
use embedded_hal::blocking::spi::Transfer;
use switch_hal::OutputSwitch;

/// Error type alias.
pub type ErrorFor<Spi, Cs> =
    Error<<Spi as Transfer<u8>>::Error, <Cs as OutputSwitch>::Error>;

/// Bit channel wrapper.
///
/// `Spi` - SPI.
/// `Cs` - Chip select output switch.
/// `Config` - Config implementation of driver config trait.
pub struct Link<Spi: Transfer<u8>, Cs: OutputSwitch, Config: SdSpiConfig> {
    spi: Spi,
    cs: Cs,
    selected: bool,
    config: PhantomData<Config>,
}

impl<Spi: Transfer<u8>, Cs: OutputSwitch, Config: SdSpiConfig> Link<Spi, Cs, Config> {
    /// Power up sequence value.
    const INIT_SET_VALUE: u8 = 0xFF;
    /// Power up sequence size, at least 74 clocks.
    const INIT_SET_SIZE: usize = 10;
    /// Receive transfer token.
    const RECEIVE_TRANSFER_TOKEN: u8 = 0xFF;

    /// Creates a new [`Link<Spi, Cs, Config>`], chip select not driven yet.
    pub fn new(spi: Spi, cs: Cs) -> Self {
        Link {
            spi,
            cs,
            selected: false,
            config: PhantomData::<Config>,
        }
    }

    /// Releases the SPI and chip select.
    pub fn free(self) -> (Spi, Cs) {
        (self.spi, self.cs)
    }

    /// Whether chip select is asserted.
    pub fn is_selected(&self) -> bool {
        self.selected
    }

    /// Activate chip select.
    pub fn select(&mut self) -> Result<(), ErrorFor<Spi, Cs>> {
        self.cs.on().map_err(Error::SelectError)?;
        self.selected = true;
        Ok(())
    }

    /// Deactivate chip select.
    pub fn unselect(&mut self) -> Result<(), ErrorFor<Spi, Cs>> {
        self.cs.off().map_err(Error::SelectError)?;
        self.selected = false;
        Ok(())
    }

    /// CS scope.
    pub fn cs_scope<F, R>(&mut self, f: F) -> Result<R, ErrorFor<Spi, Cs>>
    where
        F: FnOnce(&mut Self) -> Result<R, ErrorFor<Spi, Cs>>,
    {
        self.select()?;
        let result = f(self);
        self.unselect()?;

        result
    }

    /// Send one byte and receive one byte.
    pub fn transfer(&mut self, data: u8) -> Result<u8, ErrorFor<Spi, Cs>> {
        self.spi
            .transfer(&mut [data])
            .map(|b| b[0])
            .map_err(Error::Transport)
    }

    /// Receive a byte from the SD card by clocking in an 0xFF byte.
    pub fn receive(&mut self) -> Result<u8, ErrorFor<Spi, Cs>> {
        self.transfer(Self::RECEIVE_TRANSFER_TOKEN)
    }

    /// Send a byte to the SD card.
    pub fn send(&mut self, data: u8) -> Result<(), ErrorFor<Spi, Cs>> {
        self.transfer(data).map(|_| ())
    }

    /// Receive a slice from the SD card.
    pub fn receive_slice(&mut self, data: &mut [u8]) -> Result<(), ErrorFor<Spi, Cs>> {
        for byte in data.iter_mut() {
            *byte = self.receive()?;
        }

        Ok(())
    }

    /// Send a slice to the SD card.
    pub fn send_slice(&mut self, data: &[u8]) -> Result<(), ErrorFor<Spi, Cs>> {
        for byte in data.iter() {
            self.send(*byte)?;
        }

        Ok(())
    }

    /// Clock the power up sequence with chip select released.
    pub fn power_up(&mut self) -> Result<(), ErrorFor<Spi, Cs>> {
        self.unselect()?;

        for _ in 0..Self::INIT_SET_SIZE {
            self.send(Self::INIT_SET_VALUE)?;
        }

        Ok(())
    }

    /// Wait available state of card.
    pub fn wait_available_state(&mut self) -> Result<(), ErrorFor<Spi, Cs>> {
        for _ in 0..Config::CMD_MAX_ATTEMPTS {
            if self.receive()? == tokens::AVAILABLE {
                return Ok(());
            }
        }

        Err(ProtocolError::Timeout.into())
    }

    /// Send a command and decode its response, chip select already asserted.
    pub fn send_command(
        &mut self,
        token: CommandToken,
        shape: ResponseShape,
    ) -> Result<Response, ErrorFor<Spi, Cs>> {
        self.wait_available_state()?;
        self.send_slice(&token.to_bytes())?;

        decode(shape, Config::READ_R1_ATTEMPTS, || self.receive())
    }

    /// Send a command in its own chip select scope.
    pub fn command(
        &mut self,
        token: CommandToken,
        shape: ResponseShape,
    ) -> Result<Response, ErrorFor<Spi, Cs>> {
        self.cs_scope(|s| s.send_command(token, shape))
    }
}
