use crate::{Error, Result};
use serde::de::DeserializeOwned;

/// Typed connector config/settings with an explicit validation boundary.
///
/// Adapters call `validate` once, when a run is built, and work with the typed
/// value from then on.
pub trait ConnectorSettings: DeserializeOwned {
    /// Semantic checks beyond the shape enforced by deserialization.
    fn check(&self) -> Result<()> {
        Ok(())
    }

    fn validate(raw: &serde_json::Value) -> Result<Self> {
        let parsed: Self = serde_json::from_value(raw.clone()).map_err(|e| {
            Error::Validation(format!(
                "invalid {}: {e}",
                std::any::type_name::<Self>()
                    .rsplit("::")
                    .next()
                    .unwrap_or("settings")
            ))
        })?;
        parsed.check()?;
        Ok(parsed)
    }
}

/// Reject blank required strings.
pub fn require_non_empty(field: &str, value: &str) -> Result<()> {
    if value.trim().is_empty() {
        return Err(Error::Validation(format!("{field} must not be empty")));
    }
    Ok(())
}
