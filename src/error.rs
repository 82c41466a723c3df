/// Protocol level failure, reported by the card or by the framing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum ProtocolError {
    /// Card flagged the command as illegal.
    IllegalCommand,
    /// Card flagged a command CRC error.
    CrcError,
    /// No start token or idle bus within the wait window.
    Timeout,
    /// Card reported idle state where it must be ready.
    UnexpectedIdle,
    /// No response byte within the decode window.
    NoResponse,
    /// Card flagged another error bit (raw R1 byte).
    Rejected(u8),
    /// Wrong CMD8 echo.
    EchoMismatch(u32),
    /// Data error token instead of the start token.
    DataToken(u8),
    /// Data block CRC mismatch (card, host).
    DataCrcMismatch(u16, u16),
}

/// Fault reported synchronously with a bus request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum BusFault {
    /// Read outside the mapped window, or the card is unusable.
    LoadAccessFault,
    /// Any write; writing to the card is not supported.
    StoreAmoAccessFault,
}

/// [`SdSpiBus`](crate::SdSpiBus) result error.
///
/// `T` - transport error type.
/// `S` - select switch type.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Error<T, S> {
    /// Error from the SPI peripheral.
    Transport(T),
    /// Couldn't set a select.
    SelectError(S),
    /// Protocol error.
    Protocol(ProtocolError),
    /// Bus access fault.
    Bus(BusFault),
    /// Initialization retry budget exhausted.
    FatalInit,
    /// A block transfer is already in flight.
    Busy,
}

impl<T, S> From<ProtocolError> for Error<T, S> {
    fn from(err: ProtocolError) -> Self {
        Error::Protocol(err)
    }
}

impl<T, S> From<BusFault> for Error<T, S> {
    fn from(fault: BusFault) -> Self {
        Error::Bus(fault)
    }
}
