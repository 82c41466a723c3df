use crate::error::ProtocolError;

use bitfield::bitfield;

bitfield! {
    /// R1 response bitset.
    #[derive(Clone, Copy, PartialEq, Eq)]
    pub struct R1Response(u8);
    impl Debug;
    pub in_idle_state, _: 0;
    pub erase_reset, _: 1;
    pub illegal_command, _: 2;
    pub command_crc_error, _: 3;
    pub erase_sequence_error, _: 4;
    pub address_error, _: 5;
    pub parameter_error, _: 6;
    pub start_bit, _: 7;
}

impl R1Response {
    /// Card is ready, no error.
    pub const READY_STATE: R1Response = R1Response(0x00);
    /// Card is idle, no error.
    pub const IN_IDLE_STATE: R1Response = R1Response(0x01);

    const ERROR_MASK: u8 = 0x7E;

    /// Start bit is clear.
    pub fn is_valid(&self) -> bool {
        !self.start_bit()
    }

    /// Any error bit set.
    pub fn has_error(&self) -> bool {
        self.0 & Self::ERROR_MASK != 0
    }

    /// Error worth retrying the command for.
    pub fn is_retryable(&self) -> bool {
        self.illegal_command() || self.command_crc_error()
    }

    /// Require a ready, error-free status.
    pub fn check(&self) -> Result<(), ProtocolError> {
        if self.command_crc_error() {
            Err(ProtocolError::CrcError)
        } else if self.illegal_command() {
            Err(ProtocolError::IllegalCommand)
        } else if self.has_error() {
            Err(ProtocolError::Rejected(self.0))
        } else if self.in_idle_state() {
            Err(ProtocolError::UnexpectedIdle)
        } else {
            Ok(())
        }
    }
}

/// Expected response shape.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum ResponseShape {
    R1,
    R3,
    R7,
}

impl ResponseShape {
    /// Payload bytes trailing the R1 prefix.
    pub fn payload_len(&self) -> usize {
        match self {
            ResponseShape::R1 => 0,
            ResponseShape::R3 | ResponseShape::R7 => 4,
        }
    }
}

/// Decoded command response.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Response {
    /// Status only.
    R1(R1Response),
    /// Status and operating condition register.
    R3(R1Response, u32),
    /// Status and echoed interface condition.
    R7(R1Response, u32),
}

impl Response {
    /// R1 prefix.
    pub fn r1(&self) -> R1Response {
        match *self {
            Response::R1(r1) | Response::R3(r1, _) | Response::R7(r1, _) => r1,
        }
    }

    /// 32-bit payload of R3 and R7.
    pub fn payload(&self) -> Option<u32> {
        match *self {
            Response::R1(_) => None,
            Response::R3(_, payload) | Response::R7(_, payload) => Some(payload),
        }
    }
}

/// Decode a response of `shape` from `source`.
///
/// At most `window` bytes are read looking for the R1 prefix; bytes with the
/// MSB set are fill. The payload of R3 and R7 follows big-endian.
pub fn decode<E, F>(shape: ResponseShape, window: usize, mut source: F) -> Result<Response, E>
where
    E: From<ProtocolError>,
    F: FnMut() -> Result<u8, E>,
{
    let mut prefix = None;

    for _ in 0..window {
        let r1 = R1Response(source()?);

        if r1.is_valid() {
            prefix = Some(r1);
            break;
        }
    }

    let r1 = prefix.ok_or(ProtocolError::NoResponse)?;

    if shape.payload_len() == 0 {
        return Ok(Response::R1(r1));
    }

    let mut payload = [0u8; 4];
    for byte in payload.iter_mut() {
        *byte = source()?;
    }
    let payload = u32::from_be_bytes(payload);

    Ok(match shape {
        ResponseShape::R1 => Response::R1(r1),
        ResponseShape::R3 => Response::R3(r1, payload),
        ResponseShape::R7 => Response::R7(r1, payload),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use core::iter;

    const WINDOW: usize = 16;

    fn stream(fill: usize, tail: &[u8]) -> impl FnMut() -> Result<u8, ProtocolError> + '_ {
        let mut bytes = iter::repeat(0xFF).take(fill).chain(tail.iter().cloned());
        move || Ok(bytes.next().unwrap_or(0xFF))
    }

    fn counting(fill: usize, tail: u8, read: &mut usize) -> Result<Response, ProtocolError> {
        let mut bytes = iter::repeat(0xFF).take(fill).chain(iter::once(tail));
        decode(ResponseShape::R1, WINDOW, || {
            *read += 1;
            Ok(bytes.next().unwrap_or(0xFF))
        })
    }

    #[test]
    fn skips_fill_up_to_window() {
        for fill in [0, 1, 8, WINDOW - 1] {
            let mut read = 0;
            let response = counting(fill, 0x01, &mut read);

            assert_eq!(response, Ok(Response::R1(R1Response::IN_IDLE_STATE)));
            assert_eq!(read, fill + 1);
        }
    }

    #[test]
    fn fill_at_window_is_no_response() {
        let mut read = 0;

        assert_eq!(counting(WINDOW, 0x01, &mut read), Err(ProtocolError::NoResponse));
        assert_eq!(read, WINDOW);
    }

    #[test]
    fn r1_flags() {
        let response = decode(ResponseShape::R1, WINDOW, stream(2, &[0x05])).unwrap();
        let r1 = response.r1();

        assert!(r1.in_idle_state());
        assert!(r1.illegal_command());
        assert!(!r1.command_crc_error());
        assert!(!r1.erase_reset());
        assert!(!r1.parameter_error());
        assert_eq!(response.payload(), None);
    }

    #[test]
    fn r7_payload() {
        let response = decode(ResponseShape::R7, WINDOW, stream(1, &[0x01, 0x00, 0x00, 0x01, 0xAA]));

        assert_eq!(
            response,
            Ok(Response::R7(R1Response::IN_IDLE_STATE, 0x0000_01AA))
        );
    }

    #[test]
    fn r3_payload_may_have_msb_set() {
        let response = decode(ResponseShape::R3, WINDOW, stream(0, &[0x00, 0xC0, 0xFF, 0x80, 0x00]));

        assert_eq!(response, Ok(Response::R3(R1Response::READY_STATE, 0xC0FF_8000)));
    }

    #[test]
    fn source_error_propagates() {
        let response: Result<Response, ProtocolError> =
            decode(ResponseShape::R1, WINDOW, || Err(ProtocolError::Timeout));

        assert_eq!(response, Err(ProtocolError::Timeout));
    }

    #[test]
    fn check_orders_errors() {
        assert_eq!(R1Response(0x00).check(), Ok(()));
        assert_eq!(R1Response(0x01).check(), Err(ProtocolError::UnexpectedIdle));
        assert_eq!(R1Response(0x0D).check(), Err(ProtocolError::CrcError));
        assert_eq!(R1Response(0x05).check(), Err(ProtocolError::IllegalCommand));
        assert_eq!(R1Response(0x20).check(), Err(ProtocolError::Rejected(0x20)));
        assert!(R1Response(0x04).is_retryable());
        assert!(!R1Response(0x40).is_retryable());
    }
}
