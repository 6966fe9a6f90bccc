//! Exchange profile loader for YAML files
//!
//! This module handles loading and validating exchange profiles from YAML files.

use std::fs::File;
use std::io::BufReader;
use std::path::Path;

use crate::error::AppError;

use super::types::ExchangeProfile;

/// Load an exchange profile from a YAML file
///
/// This function:
/// 1. Checks if the file exists
/// 2. Parses the YAML content
/// 3. Validates the profile rules
///
/// # Example
/// ```ignore
/// use std::path::Path;
/// use exchange_core::config::load_config;
///
/// let profile = load_config(Path::new("profiles/binance.yaml"))?;
/// ```
pub fn load_config(path: &Path) -> Result<ExchangeProfile, AppError> {
    if !path.exists() {
        return Err(AppError::Config(format!(
            "Configuration file not found: {}",
            path.display()
        )));
    }

    let file = File::open(path)?;
    let reader = BufReader::new(file);

    let profile: ExchangeProfile = serde_yaml::from_reader(reader).map_err(|e| {
        AppError::Config(format!(
            "YAML parse error in '{}': {}",
            path.display(),
            e
        ))
    })?;

    profile.validate()?;

    tracing::debug!(
        phase = "init",
        exchange = %profile.id,
        path = %path.display(),
        "Exchange profile loaded"
    );

    Ok(profile)
}

/// Load an exchange profile from a YAML string (useful for testing)
pub fn load_config_from_str(yaml_content: &str) -> Result<ExchangeProfile, AppError> {
    let profile: ExchangeProfile = serde_yaml::from_str(yaml_content)
        .map_err(|e| AppError::Config(format!("YAML parse error: {}", e)))?;

    profile.validate()?;

    Ok(profile)
}

// ============================================================================
// Tests
// ============================================================================
