//! Protocol module - OTA wire protocol definitions.

pub mod constants;
pub mod digest;
pub mod response;

pub use constants::*;
pub use digest::{HexDigest, RunningMd5, challenge_response, md5_hex, nonce_from_seed};
pub use response::OtaResponse;
