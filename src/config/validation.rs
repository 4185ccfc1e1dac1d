//! Configuration validation.
//!
//! Collects every problem at once rather than failing on the first, so an
//! operator fixes one round of errors, not one error per restart.

use super::types::Config;

/// Validate a loaded configuration. Returns all errors found.
pub fn validate(config: &Config) -> Result<(), Vec<String>> {
    let mut errors = Vec::new();

    if config.messagedirector.flush_timeout <= 0.0 {
        errors.push("messagedirector.flush-timeout must be positive".to_string());
    }

    if config.messagedirector.queue_limit == 0 {
        errors.push("messagedirector.queue-limit must be non-zero".to_string());
    }

    if config.clientagent.min_channels >= config.clientagent.max_channels {
        errors.push(format!(
            "clientagent channel pool is empty: min-channels {} >= max-channels {}",
            config.clientagent.min_channels, config.clientagent.max_channels
        ));
    }

    if config.clientagent.interest_timeout <= 0.0 {
        errors.push("clientagent.interest-timeout must be positive".to_string());
    }

    if config.database.min_channels >= config.database.max_channels {
        errors.push(format!(
            "database id pool is empty: min-channels {} >= max-channels {}",
            config.database.min_channels, config.database.max_channels
        ));
    }

    if config.stateserver.channel == 0
        || config.database.channel == 0
        || config.clientagent.channel == 0
    {
        errors.push("service channels must be non-zero".to_string());
    }

    if errors.is_empty() { Ok(()) } else { Err(errors) }
}
