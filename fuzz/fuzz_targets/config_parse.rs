//! Fuzz test for engine configuration parsing
//!
//! Tests that arbitrary TOML input doesn't cause panics when parsed and
//! validated as an engine configuration.

#![no_main]

use libfuzzer_sys::fuzz_target;
use lltrace_core::{Engine, EngineConfig};

fuzz_target!(|data: &[u8]| {
    if let Ok(s) = std::str::from_utf8(data) {
        if let Ok(config) = toml::from_str::<EngineConfig>(s) {
            // Validation and construction must agree
            assert_eq!(config.validate().is_ok(), Engine::new(config).is_ok());
        }
    }
});
