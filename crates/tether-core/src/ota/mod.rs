//! Over-the-air firmware updates.

pub mod nonce;
pub mod server;
pub mod session;
pub mod state;
pub mod uploader;

pub use nonce::{FixedNonce, NonceSource, RandomNonce};
pub use server::{OtaPoll, OtaServer};
pub use session::{OtaError, OtaHandler, OtaOutcome};
pub use state::OtaSessionState;
pub use uploader::{OtaUploader, UploadError};
