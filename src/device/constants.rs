use uuid::Uuid;

use crate::error::DriverError;

/**
 * How often (milliseconds) to check whether a live connection is still up.
 */
pub const CONNECTION_POLL_DELAY: u64 = 1000;

/**
 * How long (milliseconds) checking if the peripheral is still connected may take
 */
pub const IS_CONNECTED_DEADLINE: u64 = 2000;

/**
 * How long (milliseconds) to scan for the configured peripheral before giving up.
 */
pub const SCAN_TIMEOUT: u64 = 10000;

/**
 * How often (milliseconds) to look at the scan results while scanning.
 */
pub const SCAN_POLL_DELAY: u64 = 250;

/**
 * The Bluetooth base UUID that 16 and 32 bit short identifiers are expanded into.
 */
pub const BLUETOOTH_BASE_UUID: Uuid = Uuid::from_u128(0x0000_0000_0000_1000_8000_0080_5f9b_34fb);

/**
 * Namespace used to derive a stable identity UUID from a platform peripheral id.
 */
pub const PERIPHERAL_ID_NAMESPACE: Uuid = Uuid::NAMESPACE_OID;

/**
 * Parse a service or characteristic identifier. Accepts full 128 bit UUIDs as well as the
 * 16 bit ("180D") and 32 bit ("0000180D") short forms.
 */
pub fn parse_identifier(identifier: &str) -> Result<Uuid, DriverError> {
    let trimmed = identifier.trim();
    let invalid = |source| DriverError::InvalidIdentifier { identifier: identifier.to_string(), source };

    let short_form = (trimmed.len() == 4 || trimmed.len() == 8) && trimmed.bytes().all(|b| b.is_ascii_hexdigit());
    if short_form {
        if let Ok(short) = u32::from_str_radix(trimmed, 16) {
            return Ok(expand_short_uuid(short));
        }
    }

    Uuid::parse_str(trimmed).map_err(invalid)
}

pub fn expand_short_uuid(short: u32) -> Uuid {
    Uuid::from_u128(BLUETOOTH_BASE_UUID.as_u128() | ((short as u128) << 96))
}
