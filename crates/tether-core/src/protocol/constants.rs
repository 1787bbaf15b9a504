//! OTA protocol constants.
//!
//! All multi-byte integers on the wire are big-endian. Hashes always travel
//! as 32 ASCII hex characters.

use std::time::Duration;

// ============================================================================
// Handshake
// ============================================================================

/// Magic bytes a peer must send first.
pub const OTA_MAGIC: [u8; 5] = [0x6C, 0x26, 0xF7, 0x5C, 0x45];

/// Protocol version sent after the magic is accepted.
pub const OTA_VERSION_1_0: u8 = 1;

// ============================================================================
// Sizes
// ============================================================================

/// Length of every hex-encoded MD5 on the wire.
pub const HEX_DIGEST_LEN: usize = 32;

/// Largest chunk consumed from the socket per write to the staging target.
pub const OTA_CHUNK_SIZE: usize = 1024;

/// Length of the declared payload size field.
pub const OTA_SIZE_LEN: usize = 4;

// ============================================================================
// Timing
// ============================================================================

/// How long a step may wait for its bytes before the session is aborted.
pub const OTA_DATA_TIMEOUT: Duration = Duration::from_secs(10);

/// How long the final peer acknowledgment is awaited.
pub const OTA_FINAL_ACK_TIMEOUT: Duration = Duration::from_secs(1);

/// Minimum interval between progress log lines.
pub const OTA_PROGRESS_INTERVAL: Duration = Duration::from_secs(1);

/// Duration of the momentary error raised when a session aborts.
pub const OTA_ERROR_STATUS_DURATION: Duration = Duration::from_secs(5);

// ============================================================================
// Ports
// ============================================================================

/// Default OTA port on the host platform.
pub const DEFAULT_OTA_PORT: u16 = 3232;
