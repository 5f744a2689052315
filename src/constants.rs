// Shared constants for clock synchronization

/// Speed of light in air (m/s)
pub const CAIR: f64 = 299792458.0 / 1.00032;

/// Drop a pairing that has not been updated for this long (s)
pub const PAIR_EXPIRY: f64 = 45.0;

/// Drop an invalid pairing that has not been updated for this long (s)
pub const PAIR_EXPIRY_INVALID: f64 = 30.0;
