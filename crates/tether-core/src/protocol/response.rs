//! OTA response codes.
//!
//! Every reply the device sends is a single byte. Values below 0x80 signal
//! progress, values from 0x80 up abort the session.

use std::fmt;

/// One-byte response code sent by the device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum OtaResponse {
    Ok = 0x00,
    RequestAuth = 0x01,
    HeaderOk = 0x40,
    AuthOk = 0x41,
    UpdatePrepareOk = 0x42,
    BinMd5Ok = 0x43,
    ReceiveOk = 0x44,
    UpdateEndOk = 0x45,
    ErrorMagic = 0x80,
    ErrorUpdatePrepare = 0x81,
    ErrorAuthInvalid = 0x82,
    ErrorWritingFlash = 0x83,
    ErrorUpdateEnd = 0x84,
    ErrorInvalidBootstrapping = 0x85,
    ErrorUnknown = 0xFF,
}

impl OtaResponse {
    /// Parse a response byte. Unassigned values map to `None`.
    pub fn from_byte(b: u8) -> Option<Self> {
        let code = match b {
            0x00 => OtaResponse::Ok,
            0x01 => OtaResponse::RequestAuth,
            0x40 => OtaResponse::HeaderOk,
            0x41 => OtaResponse::AuthOk,
            0x42 => OtaResponse::UpdatePrepareOk,
            0x43 => OtaResponse::BinMd5Ok,
            0x44 => OtaResponse::ReceiveOk,
            0x45 => OtaResponse::UpdateEndOk,
            0x80 => OtaResponse::ErrorMagic,
            0x81 => OtaResponse::ErrorUpdatePrepare,
            0x82 => OtaResponse::ErrorAuthInvalid,
            0x83 => OtaResponse::ErrorWritingFlash,
            0x84 => OtaResponse::ErrorUpdateEnd,
            0x85 => OtaResponse::ErrorInvalidBootstrapping,
            0xFF => OtaResponse::ErrorUnknown,
            _ => return None,
        };
        Some(code)
    }

    /// Raw wire value.
    pub fn as_byte(self) -> u8 {
        self as u8
    }

    /// Check if this code aborts the session.
    pub fn is_error(self) -> bool {
        self.as_byte() >= 0x80
    }

    /// Protocol name of the code.
    pub fn name(self) -> &'static str {
        match self {
            OtaResponse::Ok => "OK",
            OtaResponse::RequestAuth => "REQUEST_AUTH",
            OtaResponse::HeaderOk => "HEADER_OK",
            OtaResponse::AuthOk => "AUTH_OK",
            OtaResponse::UpdatePrepareOk => "UPDATE_PREPARE_OK",
            OtaResponse::BinMd5Ok => "BIN_MD5_OK",
            OtaResponse::ReceiveOk => "RECEIVE_OK",
            OtaResponse::UpdateEndOk => "UPDATE_END_OK",
            OtaResponse::ErrorMagic => "ERROR_MAGIC",
            OtaResponse::ErrorUpdatePrepare => "ERROR_UPDATE_PREPARE",
            OtaResponse::ErrorAuthInvalid => "ERROR_AUTH_INVALID",
            OtaResponse::ErrorWritingFlash => "ERROR_WRITING_FLASH",
            OtaResponse::ErrorUpdateEnd => "ERROR_UPDATE_END",
            OtaResponse::ErrorInvalidBootstrapping => "ERROR_INVALID_BOOTSTRAPPING",
            OtaResponse::ErrorUnknown => "ERROR_UNKNOWN",
        }
    }
}

impl fmt::Display for OtaResponse {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} (0x{:02X})", self.name(), self.as_byte())
    }
}
