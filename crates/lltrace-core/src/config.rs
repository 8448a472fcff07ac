//! Engine configuration

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

/// Largest L2CAP basic frame: 16-bit length plus the 4-byte header
pub const MAX_L2CAP_LEN: usize = 65_539;

/// Largest advertising data set carried by an extended advertising chain
pub const MAX_ADV_DATA_LEN: usize = 1_650;

/// Legacy advertising data limit, the smallest useful chain limit
const MIN_ADV_DATA_LEN: usize = 31;

/// L2CAP header size, the smallest useful L2CAP limit
const MIN_L2CAP_LEN: usize = 4;

/// Engine configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Validate the trailing CRC of every frame
    #[serde(default = "default_true")]
    pub validate_checksums: bool,

    /// Derive retransmission and acknowledgement flags
    #[serde(default = "default_true")]
    pub track_sequence: bool,

    /// Reassemble fragmented L2CAP frames
    #[serde(default = "default_true")]
    pub reassemble_l2cap: bool,

    /// Reassemble chained extended advertising data
    #[serde(default = "default_true")]
    pub reassemble_advertising: bool,

    /// Track LL control procedures
    #[serde(default = "default_true")]
    pub analyze_control_procedures: bool,

    /// Largest L2CAP message kept in memory
    #[serde(default = "default_max_l2cap_len")]
    pub max_l2cap_len: usize,

    /// Largest advertising data set kept in memory
    #[serde(default = "default_max_adv_data_len")]
    pub max_adv_data_len: usize,
}

fn default_true() -> bool {
    true
}

fn default_max_l2cap_len() -> usize {
    MAX_L2CAP_LEN
}

fn default_max_adv_data_len() -> usize {
    MAX_ADV_DATA_LEN
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            validate_checksums: true,
            track_sequence: true,
            reassemble_l2cap: true,
            reassemble_advertising: true,
            analyze_control_procedures: true,
            max_l2cap_len: MAX_L2CAP_LEN,
            max_adv_data_len: MAX_ADV_DATA_LEN,
        }
    }
}

impl EngineConfig {
    /// Check that size limits are within protocol bounds
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::LimitOutOfRange` naming the first offending limit.
    pub fn validate(&self) -> Result<(), ConfigError> {
        check_limit("max_l2cap_len", self.max_l2cap_len, MIN_L2CAP_LEN, MAX_L2CAP_LEN)?;
        check_limit(
            "max_adv_data_len",
            self.max_adv_data_len,
            MIN_ADV_DATA_LEN,
            MAX_ADV_DATA_LEN,
        )?;
        Ok(())
    }
}

fn check_limit(name: &'static str, value: usize, min: usize, max: usize) -> Result<(), ConfigError> {
    if (min..=max).contains(&value) {
        Ok(())
    } else {
        Err(ConfigError::LimitOutOfRange {
            name,
            value,
            min,
            max,
        })
    }
}
