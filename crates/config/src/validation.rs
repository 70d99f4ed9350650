use crate::ConfigResult;

/// Trait for configuration validation
pub trait ConfigValidator {
    fn validate(&self) -> ConfigResult<()>;
}

/// General validation utilities
pub struct ValidationUtils;

impl ValidationUtils {
    /// Validate that a string is not empty
    pub fn validate_not_empty(value: &str, field_name: &str) -> ConfigResult<()> {
        if value.trim().is_empty() {
            return Err(crate::ConfigError::Validation(format!(
                "{field_name} cannot be empty"
            )));
        }
        Ok(())
    }

    /// Validate that a timeout is reasonable
    pub fn validate_timeout_seconds(timeout_seconds: u64, field_name: &str) -> ConfigResult<()> {
        if timeout_seconds == 0 {
            return Err(crate::ConfigError::Validation(format!(
                "{field_name} must be greater than 0"
            )));
        }
        if timeout_seconds > 3600 {
            return Err(crate::ConfigError::Validation(format!(
                "{field_name} must be less than or equal to 3600"
            )));
        }
        Ok(())
    }

    /// Validate that a count is reasonable
    pub fn validate_count(count: usize, field_name: &str) -> ConfigResult<()> {
        if count == 0 {
            return Err(crate::ConfigError::Validation(format!(
                "{field_name} must be greater than 0"
            )));
        }
        if count > 10000 {
            return Err(crate::ConfigError::Validation(format!(
                "{field_name} must be less than or equal to 10000"
            )));
        }
        Ok(())
    }

    /// Validate that a millisecond interval lies within `[min, max]`
    pub fn validate_interval_ms(value: u64, min: u64, max: u64, field_name: &str) -> ConfigResult<()> {
        if value < min || value > max {
            return Err(crate::ConfigError::Validation(format!(
                "{field_name} must be between {min} and {max} ms"
            )));
        }
        Ok(())
    }

    /// Validate that a URL has one of the accepted schemes
    pub fn validate_url_scheme(url: &str, schemes: &[&str], field_name: &str) -> ConfigResult<()> {
        Self::validate_not_empty(url, field_name)?;
        if !schemes.iter().any(|scheme| url.starts_with(scheme)) {
            return Err(crate::ConfigError::Validation(format!(
                "{field_name} must start with one of: {}",
                schemes.join(", ")
            )));
        }
        Ok(())
    }
}
