use core::fmt;

/// Errors returned by the BLE stack.
#[derive(Debug, PartialEq, Eq)]
#[non_exhaustive]
pub enum Error {
    /// Packet specified an invalid length value or was too short.
    ///
    /// This indicates a protocol violation, so the connection should
    /// considered lost (if one is currently established).
    InvalidLength,

    /// Invalid value supplied for field.
    InvalidValue,

    /// Unexpectedly reached EOF while reading or writing data.
    ///
    /// This is returned when the application tries to fit too much data into a
    /// PDU or other fixed-size buffer, and also when reaching EOF prematurely
    /// while reading data from a buffer.
    Eof,

    /// Parsing didn't consume the entire buffer.
    IncompleteParse,

    /// A caller-supplied parameter was out of range or otherwise invalid.
    InvalidParams,

    /// The requested operation can't be started because another one of the same
    /// kind is already in flight (eg. a second ATT request before the first was
    /// answered).
    Busy,

    /// The operation requires an established connection, but none exists.
    NotConnected,

    /// A pending request or procedure did not complete within its deadline.
    Timeout,

    /// The peer sent a PDU that violates the protocol (unexpected opcode, error
    /// response, malformed control PDU).
    ProtocolError,

    /// Ran out of buffer space or queue slots to complete the operation.
    NoMemory,

    /// The scanned/connected peer does not match a known GATT profile.
    UnknownDevice,
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Error::InvalidLength => "invalid length value specified",
            Error::InvalidValue => "invalid value for field",
            Error::Eof => "end of buffer",
            Error::IncompleteParse => "excess data in buffer",
            Error::InvalidParams => "invalid parameters",
            Error::Busy => "operation already in progress",
            Error::NotConnected => "not connected",
            Error::Timeout => "operation timed out",
            Error::ProtocolError => "peer violated the protocol",
            Error::NoMemory => "out of buffer space",
            Error::UnknownDevice => "peer does not match a known device profile",
        })
    }
}
