//! OTA session handler.
//!
//! Runs one peer through the binary update protocol as a chain of fallible
//! steps. Whatever step fails, [`OtaHandler::handle`] funnels the error
//! through a single cleanup path: discard the staged write, send the error
//! code if the peer is still there, close, and raise a momentary error.

use std::sync::Arc;
use std::time::{Duration, Instant};

use byteorder::{BigEndian, ByteOrder};
use thiserror::Error;
use tracing::{debug, info, instrument, trace, warn};

use super::nonce::NonceSource;
use super::state::OtaSessionState;
use crate::events::{DeviceEvent, OtaPhase, StatusObserver};
use crate::protocol::{
    HEX_DIGEST_LEN, HexDigest, OTA_CHUNK_SIZE, OTA_DATA_TIMEOUT, OTA_ERROR_STATUS_DURATION,
    OTA_FINAL_ACK_TIMEOUT, OTA_MAGIC, OTA_PROGRESS_INTERVAL, OTA_SIZE_LEN, OTA_VERSION_1_0,
    OtaResponse, challenge_response,
};
use crate::staging::{StagingError, UpdateTarget};
use crate::transport::{OtaTransport, TransportError};

const STATUS_SOURCE: &str = "ota";

#[derive(Error, Debug)]
pub enum OtaError {
    #[error("{step} failed: {source}")]
    Transport {
        step: &'static str,
        #[source]
        source: TransportError,
    },

    #[error("Magic bytes do not match: {0:02X?}")]
    BadMagic([u8; 5]),

    #[error("No randomness available for the auth nonce")]
    NonceUnavailable,

    #[error("Auth failed, passwords do not match")]
    AuthInvalid,

    #[error("Preparing staged write failed: {0}")]
    Prepare(#[source] StagingError),

    #[error("Invalid binary checksum: {0}")]
    Checksum(#[source] StagingError),

    #[error("Writing binary data failed: {0}")]
    WriteFailed(#[source] StagingError),

    #[error("Short write to staging target: {written} != {expected}")]
    ShortWrite { expected: usize, written: usize },

    #[error("Finalizing update failed: {0}")]
    UpdateEnd(#[source] StagingError),
}

impl OtaError {
    /// The error code sent to the peer for this failure.
    pub fn response(&self) -> OtaResponse {
        match self {
            OtaError::BadMagic(_) => OtaResponse::ErrorMagic,
            OtaError::AuthInvalid => OtaResponse::ErrorAuthInvalid,
            OtaError::Prepare(_) => OtaResponse::ErrorUpdatePrepare,
            OtaError::WriteFailed(_) | OtaError::ShortWrite { .. } => {
                OtaResponse::ErrorWritingFlash
            }
            OtaError::Checksum(_) | OtaError::UpdateEnd(_) => OtaResponse::ErrorUpdateEnd,
            OtaError::Transport { .. } | OtaError::NonceUnavailable => OtaResponse::ErrorUnknown,
        }
    }

    fn transport(step: &'static str) -> impl FnOnce(TransportError) -> OtaError {
        move |source| OtaError::Transport { step, source }
    }
}

/// Result of a completed session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OtaOutcome {
    pub size: u32,
    pub features: u8,
    pub elapsed: Duration,
}

/// Services OTA sessions, one peer at a time.
pub struct OtaHandler {
    password: Option<String>,
    nonce: Box<dyn NonceSource>,
    observer: Arc<dyn StatusObserver>,
    data_timeout: Duration,
}

impl OtaHandler {
    pub fn new(
        password: Option<String>,
        nonce: Box<dyn NonceSource>,
        observer: Arc<dyn StatusObserver>,
    ) -> Self {
        Self {
            password: password.filter(|p| !p.is_empty()),
            nonce,
            observer,
            data_timeout: OTA_DATA_TIMEOUT,
        }
    }

    /// Override the per-step receive timeout.
    pub fn with_data_timeout(mut self, timeout: Duration) -> Self {
        self.data_timeout = timeout;
        self
    }

    pub fn has_password(&self) -> bool {
        self.password.is_some()
    }

    /// Run one session to completion or failure. The stream is closed on
    /// return either way.
    #[instrument(skip_all, fields(peer = %stream.peer()))]
    pub fn handle<S: OtaTransport, T: UpdateTarget>(
        &mut self,
        stream: &mut S,
        target: &mut T,
    ) -> Result<OtaOutcome, OtaError> {
        let mut state = OtaSessionState::new(Instant::now());
        info!("Starting OTA update");
        self.observer.on_event(&DeviceEvent::WarningSet {
            source: STATUS_SOURCE,
        });

        match self.run_steps(stream, target, &mut state) {
            Ok(()) => {
                self.read_final_ack(stream);
                stream.close();
                state.goto_phase(OtaPhase::Complete, self.observer.as_ref());
                self.observer.on_event(&DeviceEvent::WarningCleared {
                    source: STATUS_SOURCE,
                });
                info!(size = state.size, "OTA update finished");
                Ok(OtaOutcome {
                    size: state.size,
                    features: state.features,
                    elapsed: state.started_at.elapsed(),
                })
            }
            Err(e) => {
                self.cleanup(stream, target, &mut state, &e);
                Err(e)
            }
        }
    }

    fn cleanup<S: OtaTransport, T: UpdateTarget>(
        &self,
        stream: &mut S,
        target: &mut T,
        state: &mut OtaSessionState,
        error: &OtaError,
    ) {
        warn!(phase = %state.phase, error = %error, "OTA session aborted");
        if state.update_started {
            target.abort();
            debug!(written = state.written, "Staged write discarded");
        }
        if stream.is_connected() {
            let _ = stream.write_byte(error.response().as_byte());
        }
        stream.close();
        state.goto_phase(OtaPhase::Error, self.observer.as_ref());
        self.observer.on_event(&DeviceEvent::WarningCleared {
            source: STATUS_SOURCE,
        });
        self.observer.on_event(&DeviceEvent::MomentaryError {
            source: STATUS_SOURCE,
            duration: OTA_ERROR_STATUS_DURATION,
        });
    }

    fn run_steps<S: OtaTransport, T: UpdateTarget>(
        &mut self,
        stream: &mut S,
        target: &mut T,
        state: &mut OtaSessionState,
    ) -> Result<(), OtaError> {
        self.handshake(stream, state)?;
        self.authenticate(stream, state)?;
        self.prepare(stream, target, state)?;
        self.receive_checksum(stream, target, state)?;
        self.transfer(stream, target, state)?;
        self.finalize(stream, target, state)
    }

    fn send(stream: &mut impl OtaTransport, response: OtaResponse) -> Result<(), OtaError> {
        trace!(response = %response, "Sending");
        stream
            .write_byte(response.as_byte())
            .map_err(OtaError::transport("Sending response"))
    }

    fn handshake<S: OtaTransport>(
        &self,
        stream: &mut S,
        state: &mut OtaSessionState,
    ) -> Result<(), OtaError> {
        state.goto_phase(OtaPhase::Handshake, self.observer.as_ref());

        let mut magic = [0u8; 5];
        stream
            .read_exact(&mut magic, self.data_timeout)
            .map_err(OtaError::transport("Reading magic bytes"))?;
        if magic != OTA_MAGIC {
            return Err(OtaError::BadMagic(magic));
        }

        stream
            .write_all(&[OtaResponse::Ok.as_byte(), OTA_VERSION_1_0])
            .map_err(OtaError::transport("Sending version"))?;

        let mut features = [0u8; 1];
        stream
            .read_exact(&mut features, self.data_timeout)
            .map_err(OtaError::transport("Reading features"))?;
        state.features = features[0];
        trace!(features = format_args!("0x{:02X}", state.features), "Peer features");

        Self::send(stream, OtaResponse::HeaderOk)
    }

    fn authenticate<S: OtaTransport>(
        &mut self,
        stream: &mut S,
        state: &mut OtaSessionState,
    ) -> Result<(), OtaError> {
        if let Some(password) = &self.password {
            state.goto_phase(OtaPhase::Authenticate, self.observer.as_ref());
            Self::send(stream, OtaResponse::RequestAuth)?;

            let nonce = self.nonce.next_nonce().ok_or(OtaError::NonceUnavailable)?;
            trace!(nonce = %nonce, "Auth nonce");
            stream
                .write_all(nonce.as_bytes())
                .map_err(OtaError::transport("Writing nonce"))?;

            let mut cnonce = [0u8; HEX_DIGEST_LEN];
            stream
                .read_exact(&mut cnonce, self.data_timeout)
                .map_err(OtaError::transport("Reading cnonce"))?;
            let cnonce = HexDigest::from_wire(cnonce);

            let expected = challenge_response(password, &nonce, &cnonce);

            let mut response = [0u8; HEX_DIGEST_LEN];
            stream
                .read_exact(&mut response, self.data_timeout)
                .map_err(OtaError::transport("Reading auth response"))?;

            if HexDigest::from_wire(response) != expected {
                return Err(OtaError::AuthInvalid);
            }
            debug!("Peer authenticated");
        }

        Self::send(stream, OtaResponse::AuthOk)
    }

    fn prepare<S: OtaTransport, T: UpdateTarget>(
        &self,
        stream: &mut S,
        target: &mut T,
        state: &mut OtaSessionState,
    ) -> Result<(), OtaError> {
        state.goto_phase(OtaPhase::Prepare, self.observer.as_ref());

        let mut size = [0u8; OTA_SIZE_LEN];
        stream
            .read_exact(&mut size, self.data_timeout)
            .map_err(OtaError::transport("Reading size"))?;
        state.size = BigEndian::read_u32(&size);
        debug!(size = state.size, "OTA size");

        target.begin(state.size).map_err(OtaError::Prepare)?;
        state.update_started = true;

        Self::send(stream, OtaResponse::UpdatePrepareOk)
    }

    fn receive_checksum<S: OtaTransport, T: UpdateTarget>(
        &self,
        stream: &mut S,
        target: &mut T,
        state: &mut OtaSessionState,
    ) -> Result<(), OtaError> {
        let mut md5 = [0u8; HEX_DIGEST_LEN];
        stream
            .read_exact(&mut md5, self.data_timeout)
            .map_err(OtaError::transport("Reading binary MD5"))?;
        let md5 = HexDigest::from_wire(md5);
        debug!(md5 = %md5, "Binary MD5");

        target.set_expected_md5(&md5).map_err(OtaError::Checksum)?;
        state.expected_md5 = Some(md5);

        Self::send(stream, OtaResponse::BinMd5Ok)
    }

    fn transfer<S: OtaTransport, T: UpdateTarget>(
        &self,
        stream: &mut S,
        target: &mut T,
        state: &mut OtaSessionState,
    ) -> Result<(), OtaError> {
        state.goto_phase(OtaPhase::Transfer, self.observer.as_ref());
        let mut buf = [0u8; OTA_CHUNK_SIZE];

        while !target.is_finished() {
            // Never read past the declared size; the final ack may follow.
            let remaining = u64::from(state.size).saturating_sub(target.written());
            let want = remaining.min(OTA_CHUNK_SIZE as u64) as usize;
            if want == 0 {
                break;
            }
            let available = stream
                .read_some(&mut buf[..want], self.data_timeout)
                .map_err(OtaError::transport("Receiving binary data"))?;

            let written = target
                .write(&buf[..available])
                .map_err(OtaError::WriteFailed)?;
            state.written = target.written();
            if written != available {
                return Err(OtaError::ShortWrite {
                    expected: available,
                    written,
                });
            }

            let now = Instant::now();
            if now.duration_since(state.last_progress) > OTA_PROGRESS_INTERVAL {
                state.last_progress = now;
                debug!(progress = %format!("{:.1}%", state.percent()), "OTA in progress");
                self.observer.on_event(&DeviceEvent::OtaProgress {
                    written: state.written,
                    total: u64::from(state.size),
                });
            }
        }

        self.observer.on_event(&DeviceEvent::OtaProgress {
            written: state.written,
            total: u64::from(state.size),
        });
        Self::send(stream, OtaResponse::ReceiveOk)
    }

    fn finalize<S: OtaTransport, T: UpdateTarget>(
        &self,
        stream: &mut S,
        target: &mut T,
        state: &mut OtaSessionState,
    ) -> Result<(), OtaError> {
        state.goto_phase(OtaPhase::Finalize, self.observer.as_ref());
        target.end().map_err(OtaError::UpdateEnd)?;
        state.update_started = false;
        Self::send(stream, OtaResponse::UpdateEndOk)
    }

    /// The peer's closing acknowledgment is optional.
    fn read_final_ack<S: OtaTransport>(&self, stream: &mut S) {
        let mut ack = [0u8; 1];
        match stream.read_exact(&mut ack, OTA_FINAL_ACK_TIMEOUT) {
            Ok(()) if ack[0] == OtaResponse::Ok.as_byte() => {}
            Ok(()) => warn!(byte = ack[0], "Unexpected final acknowledgement"),
            Err(e) => warn!(error = %e, "Reading back acknowledgement failed"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::RecordingObserver;
    use crate::ota::nonce::FixedNonce;
    use crate::protocol::{md5_hex, nonce_from_seed};
    use crate::staging::MemoryTarget;
    use crate::transport::MockStream;

    const SEED: u32 = 0xC0FFEE;
    const T: Duration = Duration::from_millis(20);

    fn handler(password: Option<&str>) -> (OtaHandler, Arc<RecordingObserver>) {
        let obs = Arc::new(RecordingObserver::new());
        let handler = OtaHandler::new(
            password.map(str::to_string),
            Box::new(FixedNonce(SEED)),
            obs.clone(),
        )
        .with_data_timeout(T);
        (handler, obs)
    }

    /// Everything a well-behaved peer sends, in order.
    fn peer_script(password: Option<&str>, image: &[u8]) -> Vec<u8> {
        let mut out = OTA_MAGIC.to_vec();
        out.push(0x00); // features
        if let Some(pw) = password {
            let cnonce = md5_hex(b"client");
            out.extend_from_slice(cnonce.as_bytes());
            let answer = challenge_response(pw, &nonce_from_seed(SEED), &cnonce);
            out.extend_from_slice(answer.as_bytes());
        }
        out.extend_from_slice(&(image.len() as u32).to_be_bytes());
        out.extend_from_slice(md5_hex(image).as_bytes());
        out.extend_from_slice(image);
        out
    }

    fn run(
        password: Option<&str>,
        script: &[u8],
        target: &mut MemoryTarget,
    ) -> (Result<OtaOutcome, OtaError>, MockStream, Arc<RecordingObserver>) {
        let (mut handler, obs) = handler(password);
        let peer = MockStream::new();
        peer.push_inbound(script);
        let mut stream = peer.clone();
        let result = handler.handle(&mut stream, target);
        (result, peer, obs)
    }

    #[test]
    fn test_session_without_password() {
        let image = vec![0xAB; 3000];
        let mut script = peer_script(None, &image);
        script.push(OtaResponse::Ok.as_byte());
        let mut target = MemoryTarget::new(1 << 20);

        let (result, peer, obs) = run(None, &script, &mut target);

        let outcome = result.unwrap();
        assert_eq!(outcome.size, 3000);
        assert_eq!(target.committed(), Some(&image[..]));
        assert_eq!(
            peer.written(),
            vec![0x00, OTA_VERSION_1_0, 0x40, 0x41, 0x42, 0x43, 0x44, 0x45]
        );
        assert!(peer.is_closed());
        assert!(obs.any(|e| matches!(e, DeviceEvent::WarningCleared { .. })));
        assert!(!obs.any(|e| matches!(e, DeviceEvent::MomentaryError { .. })));
    }

    #[test]
    fn test_session_with_password() {
        let image = b"firmware".to_vec();
        let script = peer_script(Some("hunter2"), &image);
        let mut target = MemoryTarget::new(1024);

        let (result, peer, _) = run(Some("hunter2"), &script, &mut target);

        // Missing final ack is not fatal.
        assert!(result.is_ok());
        let written = peer.written();
        assert_eq!(&written[..4], &[0x00, OTA_VERSION_1_0, 0x40, 0x01]);
        assert_eq!(&written[4..36], nonce_from_seed(SEED).as_bytes());
        assert_eq!(&written[36..], &[0x41, 0x42, 0x43, 0x44, 0x45]);
        assert_eq!(target.committed(), Some(&image[..]));
    }

    #[test]
    fn test_bad_magic() {
        let mut script = peer_script(None, b"x");
        script[0] ^= 0xFF;
        let mut target = MemoryTarget::new(1024);

        let (result, peer, obs) = run(None, &script, &mut target);

        let err = result.unwrap_err();
        assert!(matches!(err, OtaError::BadMagic(_)));
        assert_eq!(peer.written(), vec![0x80]);
        assert!(peer.is_closed());
        assert_eq!(target.aborts(), 0);
        assert!(obs.any(|e| matches!(
            e,
            DeviceEvent::MomentaryError { duration, .. } if *duration == Duration::from_secs(5)
        )));
    }

    #[test]
    fn test_wrong_auth_response() {
        let mut script = peer_script(Some("hunter2"), b"image");
        // Flip one character of the peer's answer.
        script[6 + 32] ^= 0x01;
        let mut target = MemoryTarget::new(1024);

        let (result, peer, _) = run(Some("hunter2"), &script, &mut target);

        assert!(matches!(result, Err(OtaError::AuthInvalid)));
        assert_eq!(peer.written().last(), Some(&0x82));
        assert!(target.committed().is_none());
    }

    #[test]
    fn test_prepare_failure_too_large() {
        let script = peer_script(None, &[1u8; 64]);
        let mut target = MemoryTarget::new(32);

        let (result, peer, _) = run(None, &script, &mut target);

        assert_eq!(result.unwrap_err().response(), OtaResponse::ErrorUpdatePrepare);
        assert_eq!(peer.written().last(), Some(&0x81));
        assert_eq!(target.aborts(), 0);
    }

    #[test]
    fn test_checksum_mismatch_is_update_end_error() {
        let image = vec![7u8; 100];
        let mut script = peer_script(None, &image);
        // Corrupt one payload byte.
        let last = script.len() - 1;
        script[last] ^= 0xFF;
        let mut target = MemoryTarget::new(1024);

        let (result, peer, _) = run(None, &script, &mut target);

        assert!(matches!(result, Err(OtaError::UpdateEnd(_))));
        assert_eq!(peer.written().last(), Some(&0x84));
        assert!(target.committed().is_none());
    }

    #[test]
    fn test_final_ack_in_same_read_as_last_chunk() {
        let image = vec![5u8; 10];
        let mut script = peer_script(None, &image);
        script.push(OtaResponse::Ok.as_byte());
        let mut target = MemoryTarget::new(1024);

        let (result, peer, _) = run(None, &script, &mut target);

        assert_eq!(result.unwrap().size, 10);
        assert_eq!(target.committed(), Some(&image[..]));
        assert_eq!(
            peer.written(),
            vec![0x00, OTA_VERSION_1_0, 0x40, 0x41, 0x42, 0x43, 0x44, 0x45]
        );
        // The ack was left for the closing read, not swallowed as image data.
        assert_eq!(peer.pending_inbound(), 0);
    }

    /// Offset of the 32 checksum characters in an unauthenticated script.
    const MD5_OFFSET: usize = 5 + 1 + OTA_SIZE_LEN;

    #[test]
    fn test_corrupted_checksum_is_update_end_error() {
        let image = vec![1u8; 200];
        let mut script = peer_script(None, &image);
        script[MD5_OFFSET] = if script[MD5_OFFSET] == b'0' { b'1' } else { b'0' };
        let mut target = MemoryTarget::new(1024);

        let (result, peer, _) = run(None, &script, &mut target);

        assert!(matches!(result, Err(OtaError::UpdateEnd(_))));
        assert_eq!(peer.written().last(), Some(&0x84));
        assert!(target.committed().is_none());
        assert!(!target.in_progress());
    }

    #[test]
    fn test_non_hex_checksum_is_update_end_error() {
        let mut script = peer_script(None, b"image");
        script[MD5_OFFSET] = b'g';
        let mut target = MemoryTarget::new(1024);

        let (result, peer, _) = run(None, &script, &mut target);

        let err = result.unwrap_err();
        assert!(matches!(err, OtaError::Checksum(_)));
        assert_eq!(err.response(), OtaResponse::ErrorUpdateEnd);
        assert_eq!(peer.written(), vec![0x00, OTA_VERSION_1_0, 0x40, 0x41, 0x42, 0x84]);
        assert!(target.committed().is_none());
        assert_eq!(target.aborts(), 1);
    }

    #[test]
    fn test_flash_write_failure_aborts_staged_write() {
        let image = vec![3u8; 2048];
        let script = peer_script(None, &image);
        let mut target = MemoryTarget::new(1 << 20).fail_writes_after(1500);

        let (result, peer, _) = run(None, &script, &mut target);

        assert!(matches!(result, Err(OtaError::ShortWrite { .. })));
        assert_eq!(peer.written().last(), Some(&0x83));
        assert_eq!(target.aborts(), 1);
        assert!(target.committed().is_none());
    }

    #[test]
    fn test_truncated_transfer_times_out() {
        let image = vec![9u8; 500];
        let mut script = peer_script(None, &image);
        script.truncate(script.len() - 100);
        let mut target = MemoryTarget::new(1024);

        let (result, peer, _) = run(None, &script, &mut target);

        let err = result.unwrap_err();
        assert!(matches!(err, OtaError::Transport { .. }));
        assert_eq!(err.response(), OtaResponse::ErrorUnknown);
        assert_eq!(peer.written().last(), Some(&0xFF));
        assert_eq!(target.aborts(), 1);
    }

    #[test]
    fn test_disconnect_skips_error_byte() {
        let peer = MockStream::new();
        peer.push_inbound(&OTA_MAGIC[..3]);
        peer.hang_up_when_drained();
        let (mut handler, _) = handler(None);
        let mut stream = peer.clone();
        let mut target = MemoryTarget::new(1024);

        assert!(handler.handle(&mut stream, &mut target).is_err());
        assert!(peer.written().is_empty());
        assert!(peer.is_closed());
    }

    #[test]
    fn test_phases_in_order() {
        let image = b"abc".to_vec();
        let script = peer_script(Some("pw"), &image);
        let mut target = MemoryTarget::new(1024);

        let (_, _, obs) = run(Some("pw"), &script, &mut target);

        let phases: Vec<OtaPhase> = obs
            .events()
            .into_iter()
            .filter_map(|e| match e {
                DeviceEvent::OtaPhaseChanged { to, .. } => Some(to),
                _ => None,
            })
            .collect();
        assert_eq!(
            phases,
            vec![
                OtaPhase::Handshake,
                OtaPhase::Authenticate,
                OtaPhase::Prepare,
                OtaPhase::Transfer,
                OtaPhase::Finalize,
                OtaPhase::Complete,
            ]
        );
    }
}
