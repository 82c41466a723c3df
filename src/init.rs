//! Power-up handshake: CMD0, CMD8, CMD55/ACMD41 polling, CMD58, CMD16.

use crate::{
    command::CommandToken,
    config::SdSpiConfig,
    consts::tokens,
    error::{Error, ProtocolError},
    link::{ErrorFor, Link},
    response::{R1Response, Response, ResponseShape},
};

use core::marker::PhantomData;
use embedded_hal::blocking::spi::Transfer;
use switch_hal::OutputSwitch;

/// Card bring-up state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum CardState {
    Reset,
    SendIfCond,
    VoltageNegotiation,
    ReadOcr,
    SetBlockLen,
    Ready,
    Faulted,
}

impl CardState {
    /// Ordinal, as reported in the debug signature.
    pub fn code(&self) -> u8 {
        *self as u8
    }
}

/// Outcome of one exchange, before retry accounting.
enum Outcome {
    Advance(CardState),
    Retry(ProtocolError),
    Fail(ProtocolError),
}

/// Initialization sequencer.
pub struct Sequencer<Config: SdSpiConfig> {
    state: CardState,
    powered: bool,
    attempts: usize,
    polls: usize,
    ocr: Option<u32>,
    last_r1: R1Response,
    config: PhantomData<Config>,
}

impl<Config: SdSpiConfig> Default for Sequencer<Config> {
    fn default() -> Self {
        Self::new()
    }
}

impl<Config: SdSpiConfig> Sequencer<Config> {
    /// Creates a new [`Sequencer<Config>`] in `Reset`.
    pub fn new() -> Self {
        Sequencer {
            state: CardState::Reset,
            powered: false,
            attempts: 0,
            polls: 0,
            ocr: None,
            last_r1: R1Response(0xFF),
            config: PhantomData::<Config>,
        }
    }

    /// Current state.
    pub fn state(&self) -> CardState {
        self.state
    }

    /// OCR read during bring-up.
    pub fn ocr(&self) -> Option<u32> {
        self.ocr
    }

    /// Last R1 seen, 0xFF before any.
    pub fn last_r1(&self) -> R1Response {
        self.last_r1
    }

    /// Back to `Reset`, power up sequence included.
    pub fn reset(&mut self) {
        *self = Self::new();
    }

    /// Advance by one exchange.
    ///
    /// Retries stay within the step budget and return `Ok`, exhausting it
    /// moves to `Faulted` and returns [`Error::FatalInit`].
    pub fn step<Spi, Cs>(
        &mut self,
        link: &mut Link<Spi, Cs, Config>,
    ) -> Result<CardState, ErrorFor<Spi, Cs>>
    where
        Spi: Transfer<u8>,
        Cs: OutputSwitch,
    {
        if !self.powered {
            info!("SD initialize started");
            link.power_up()?;
            self.powered = true;
        }

        let outcome = match self.state {
            CardState::Ready => return Ok(CardState::Ready),
            CardState::Faulted => return Err(Error::FatalInit),
            CardState::Reset => self.go_idle(link),
            CardState::SendIfCond => self.send_if_cond(link),
            CardState::VoltageNegotiation => self.send_op_cond(link),
            CardState::ReadOcr => self.read_ocr(link),
            CardState::SetBlockLen => self.set_block_len(link),
        }?;

        match outcome {
            Outcome::Advance(next) => {
                self.attempts = 0;
                self.state = next;
                if next == CardState::Ready {
                    info!("SD successfully initialized, OCR: 0x{:08X}", self.ocr.unwrap_or(0));
                }
                Ok(next)
            }
            Outcome::Retry(err) => {
                self.attempts += 1;
                if self.attempts >= self.retry_budget() {
                    self.fault(err)
                } else {
                    warn!(
                        "SD step {:?} failed with {:?}, attempt: {}",
                        self.state, err, self.attempts
                    );
                    Ok(self.state)
                }
            }
            Outcome::Fail(err) => self.fault(err),
        }
    }

    fn retry_budget(&self) -> usize {
        match self.state {
            CardState::Reset => Config::ENTER_SPI_MODE_ATTEMPTS,
            _ => Config::CMD_MAX_ATTEMPTS,
        }
    }

    fn fault<T, S>(&mut self, err: ProtocolError) -> Result<CardState, Error<T, S>> {
        error!("Failed to initialize SD in {:?}: {:?}", self.state, err);
        self.state = CardState::Faulted;
        Err(Error::FatalInit)
    }

    /// Run one exchange, folding protocol errors into a retry.
    fn exchange<Spi, Cs>(
        &mut self,
        link: &mut Link<Spi, Cs, Config>,
        token: CommandToken,
        shape: ResponseShape,
    ) -> Result<Result<Response, ProtocolError>, ErrorFor<Spi, Cs>>
    where
        Spi: Transfer<u8>,
        Cs: OutputSwitch,
    {
        match link.command(token, shape) {
            Ok(response) => {
                self.last_r1 = response.r1();
                Ok(Ok(response))
            }
            Err(Error::Protocol(err)) => Ok(Err(err)),
            Err(err) => Err(err),
        }
    }

    fn go_idle<Spi, Cs>(
        &mut self,
        link: &mut Link<Spi, Cs, Config>,
    ) -> Result<Outcome, ErrorFor<Spi, Cs>>
    where
        Spi: Transfer<u8>,
        Cs: OutputSwitch,
    {
        info!("Enter to SPI mode for SD, attempt: {}", self.attempts + 1);

        Ok(
            match self.exchange(link, CommandToken::GO_IDLE_STATE, ResponseShape::R1)? {
                Ok(Response::R1(R1Response::IN_IDLE_STATE)) => Outcome::Advance(CardState::SendIfCond),
                Ok(r) => Outcome::Retry(match r.r1().check() {
                    Err(err) => err,
                    Ok(()) => ProtocolError::Rejected(r.r1().0),
                }),
                Err(err) => Outcome::Retry(err),
            },
        )
    }

    fn send_if_cond<Spi, Cs>(
        &mut self,
        link: &mut Link<Spi, Cs, Config>,
    ) -> Result<Outcome, ErrorFor<Spi, Cs>>
    where
        Spi: Transfer<u8>,
        Cs: OutputSwitch,
    {
        info!("Verifing SD Memory Card interface operating condition");

        Ok(
            match self.exchange(link, CommandToken::SEND_IF_COND, ResponseShape::R7)? {
                Ok(Response::R7(r1, _)) if r1.is_retryable() => Outcome::Retry(retry_cause(r1)),
                Ok(Response::R7(_, echo))
                    if echo & tokens::CMD8_ECHO_MASK == tokens::CMD8_PATTERN =>
                {
                    Outcome::Advance(CardState::VoltageNegotiation)
                }
                Ok(r) => Outcome::Fail(ProtocolError::EchoMismatch(r.payload().unwrap_or(0))),
                Err(err) => Outcome::Retry(err),
            },
        )
    }

    fn send_op_cond<Spi, Cs>(
        &mut self,
        link: &mut Link<Spi, Cs, Config>,
    ) -> Result<Outcome, ErrorFor<Spi, Cs>>
    where
        Spi: Transfer<u8>,
        Cs: OutputSwitch,
    {
        let r1 = match self.exchange(link, CommandToken::APP_CMD, ResponseShape::R1)? {
            Ok(r) => r.r1(),
            Err(err) => return Ok(Outcome::Retry(err)),
        };
        if r1.is_retryable() {
            return Ok(Outcome::Retry(retry_cause(r1)));
        }

        let r1 = match self.exchange(link, CommandToken::SD_SEND_OP_COND, ResponseShape::R1)? {
            Ok(r) => r.r1(),
            Err(err) => return Ok(Outcome::Retry(err)),
        };
        if r1.is_retryable() {
            return Ok(Outcome::Retry(retry_cause(r1)));
        }

        self.polls += 1;

        if r1 == R1Response::READY_STATE {
            info!("SD left idle state after {} polls", self.polls);
            Ok(Outcome::Advance(CardState::ReadOcr))
        } else if r1 != R1Response::IN_IDLE_STATE {
            Ok(Outcome::Fail(ProtocolError::Rejected(r1.0)))
        } else if self.polls >= Config::OP_COND_POLL_ATTEMPTS {
            Ok(Outcome::Fail(ProtocolError::UnexpectedIdle))
        } else {
            Ok(Outcome::Advance(CardState::VoltageNegotiation))
        }
    }

    fn read_ocr<Spi, Cs>(
        &mut self,
        link: &mut Link<Spi, Cs, Config>,
    ) -> Result<Outcome, ErrorFor<Spi, Cs>>
    where
        Spi: Transfer<u8>,
        Cs: OutputSwitch,
    {
        Ok(
            match self.exchange(link, CommandToken::READ_OCR, ResponseShape::R3)? {
                Ok(r) => match r.r1().check() {
                    Ok(()) => {
                        self.ocr = r.payload();
                        Outcome::Advance(CardState::SetBlockLen)
                    }
                    Err(err) => Outcome::Retry(err),
                },
                Err(err) => Outcome::Retry(err),
            },
        )
    }

    fn set_block_len<Spi, Cs>(
        &mut self,
        link: &mut Link<Spi, Cs, Config>,
    ) -> Result<Outcome, ErrorFor<Spi, Cs>>
    where
        Spi: Transfer<u8>,
        Cs: OutputSwitch,
    {
        Ok(
            match self.exchange(link, CommandToken::SET_BLOCKLEN, ResponseShape::R1)? {
                Ok(r) => match r.r1().check() {
                    Ok(()) => Outcome::Advance(CardState::Ready),
                    Err(err) => Outcome::Retry(err),
                },
                Err(err) => Outcome::Retry(err),
            },
        )
    }
}

fn retry_cause(r1: R1Response) -> ProtocolError {
    if r1.command_crc_error() {
        ProtocolError::CrcError
    } else {
        ProtocolError::IllegalCommand
    }
}
