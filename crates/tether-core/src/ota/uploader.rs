//! Peer side of the OTA protocol, used to push an image to a device.

use std::time::Duration;

use byteorder::{BigEndian, WriteBytesExt};
use thiserror::Error;
use tracing::{debug, info, instrument};

use super::nonce::NonceSource;
use crate::protocol::{
    HEX_DIGEST_LEN, HexDigest, OTA_CHUNK_SIZE, OTA_DATA_TIMEOUT, OTA_MAGIC, OTA_VERSION_1_0,
    OtaResponse, challenge_response, md5_hex,
};
use crate::transport::{OtaTransport, TransportError};

#[derive(Error, Debug)]
pub enum UploadError {
    #[error("{step}: {source}")]
    Transport {
        step: &'static str,
        #[source]
        source: TransportError,
    },

    #[error("Device rejected the update at {step}: {response}")]
    Rejected {
        step: &'static str,
        response: OtaResponse,
    },

    #[error("Unexpected byte 0x{byte:02X} at {step}")]
    Unexpected { step: &'static str, byte: u8 },

    #[error("Unsupported protocol version {0}")]
    UnsupportedVersion(u8),

    #[error("Device requires a password")]
    PasswordRequired,

    #[error("No randomness available for the client nonce")]
    NonceUnavailable,

    #[error("Image of {0} bytes does not fit the 32-bit size field")]
    ImageTooLarge(usize),
}

impl UploadError {
    fn transport(step: &'static str) -> impl FnOnce(TransportError) -> UploadError {
        move |source| UploadError::Transport { step, source }
    }
}

/// Pushes firmware images to a device's OTA port.
pub struct OtaUploader {
    password: Option<String>,
    nonce: Box<dyn NonceSource>,
    timeout: Duration,
}

impl OtaUploader {
    pub fn new(password: Option<String>, nonce: Box<dyn NonceSource>) -> Self {
        Self {
            password: password.filter(|p| !p.is_empty()),
            nonce,
            timeout: OTA_DATA_TIMEOUT,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Run the full exchange. `progress` is called with (sent, total) after
    /// every chunk.
    #[instrument(skip_all, fields(peer = %stream.peer(), size = image.len()))]
    pub fn upload<S: OtaTransport>(
        &mut self,
        stream: &mut S,
        image: &[u8],
        mut progress: impl FnMut(usize, usize),
    ) -> Result<(), UploadError> {
        let size = u32::try_from(image.len()).map_err(|_| UploadError::ImageTooLarge(image.len()))?;

        stream
            .write_all(&OTA_MAGIC)
            .map_err(UploadError::transport("Sending magic"))?;
        self.expect(stream, "handshake", OtaResponse::Ok)?;
        let version = self.read_byte(stream, "version")?;
        if version != OTA_VERSION_1_0 {
            return Err(UploadError::UnsupportedVersion(version));
        }

        // No optional features are requested.
        stream
            .write_byte(0x00)
            .map_err(UploadError::transport("Sending features"))?;
        self.expect(stream, "header", OtaResponse::HeaderOk)?;

        match self.read_response(stream, "auth")? {
            OtaResponse::AuthOk => {}
            OtaResponse::RequestAuth => {
                self.answer_challenge(stream)?;
                self.expect(stream, "auth result", OtaResponse::AuthOk)?;
            }
            other => {
                return Err(UploadError::Unexpected {
                    step: "auth",
                    byte: other.as_byte(),
                });
            }
        }

        let mut header = Vec::with_capacity(4);
        header
            .write_u32::<BigEndian>(size)
            .map_err(|e| UploadError::Transport {
                step: "Encoding size",
                source: e.into(),
            })?;
        stream
            .write_all(&header)
            .map_err(UploadError::transport("Sending size"))?;
        self.expect(stream, "prepare", OtaResponse::UpdatePrepareOk)?;

        stream
            .write_all(md5_hex(image).as_bytes())
            .map_err(UploadError::transport("Sending checksum"))?;
        self.expect(stream, "checksum", OtaResponse::BinMd5Ok)?;

        let mut sent = 0;
        for chunk in image.chunks(OTA_CHUNK_SIZE) {
            if let Err(e) = stream.write_all(chunk) {
                // The device may have sent an error code before hanging up.
                return Err(match self.read_response(stream, "transfer") {
                    Err(rejected @ UploadError::Rejected { .. }) => rejected,
                    _ => UploadError::Transport {
                        step: "Sending image",
                        source: e,
                    },
                });
            }
            sent += chunk.len();
            progress(sent, image.len());
        }
        debug!(sent = sent, "Image sent");

        self.expect(stream, "receive", OtaResponse::ReceiveOk)?;
        self.expect(stream, "update end", OtaResponse::UpdateEndOk)?;
        // Best effort: the device does not require the closing ack.
        let _ = stream.write_byte(OtaResponse::Ok.as_byte());
        stream.close();
        info!("Upload complete");
        Ok(())
    }

    fn answer_challenge<S: OtaTransport>(&mut self, stream: &mut S) -> Result<(), UploadError> {
        let password = self
            .password
            .as_deref()
            .ok_or(UploadError::PasswordRequired)?;

        let mut nonce = [0u8; HEX_DIGEST_LEN];
        stream
            .read_exact(&mut nonce, self.timeout)
            .map_err(UploadError::transport("Reading nonce"))?;
        let nonce = HexDigest::from_wire(nonce);

        let cnonce = self.nonce.next_nonce().ok_or(UploadError::NonceUnavailable)?;
        let answer = challenge_response(password, &nonce, &cnonce);

        stream
            .write_all(cnonce.as_bytes())
            .map_err(UploadError::transport("Sending cnonce"))?;
        stream
            .write_all(answer.as_bytes())
            .map_err(UploadError::transport("Sending auth response"))?;
        Ok(())
    }

    fn read_byte<S: OtaTransport>(
        &self,
        stream: &mut S,
        step: &'static str,
    ) -> Result<u8, UploadError> {
        let mut b = [0u8; 1];
        stream
            .read_exact(&mut b, self.timeout)
            .map_err(|source| UploadError::Transport { step, source })?;
        Ok(b[0])
    }

    fn read_response<S: OtaTransport>(
        &self,
        stream: &mut S,
        step: &'static str,
    ) -> Result<OtaResponse, UploadError> {
        let byte = self.read_byte(stream, step)?;
        match OtaResponse::from_byte(byte) {
            Some(r) if r.is_error() => Err(UploadError::Rejected { step, response: r }),
            Some(r) => Ok(r),
            None => Err(UploadError::Unexpected { step, byte }),
        }
    }

    fn expect<S: OtaTransport>(
        &self,
        stream: &mut S,
        step: &'static str,
        want: OtaResponse,
    ) -> Result<(), UploadError> {
        let got = self.read_response(stream, step)?;
        if got != want {
            return Err(UploadError::Unexpected {
                step,
                byte: got.as_byte(),
            });
        }
        Ok(())
    }
}
