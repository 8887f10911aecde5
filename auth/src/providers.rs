//! Known identity providers offered on the login page

use crate::error::ConfigError;
use serde::{Deserialize, Serialize};

/// An identity provider node listed in the login drop-down.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KnownProvider {
    pub name: String,
    pub url: String,
}

/// Source of the known providers list.
pub trait KnownProviders: Send + Sync {
    fn list(&self) -> Vec<KnownProvider>;
}

/// Known providers loaded from a JSON array of `{"name", "url"}` objects.
#[derive(Debug, Default, Clone)]
pub struct JsonKnownProviders {
    providers: Vec<KnownProvider>,
}

impl JsonKnownProviders {
    pub fn new(providers: Vec<KnownProvider>) -> Self {
        Self { providers }
    }

    pub fn parse(json: &str) -> Result<Self, serde_json::Error> {
        Ok(Self::new(serde_json::from_str(json)?))
    }

    pub fn from_file(path: &str) -> Result<Self, ConfigError> {
        let json = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_string(),
            source,
        })?;
        Self::parse(&json).map_err(|source| ConfigError::Parse {
            path: path.to_string(),
            source,
        })
    }

    /// Loads the list, falling back to an empty list when the file cannot be
    /// used. The login page still works without the drop-down.
    pub fn from_file_or_empty(path: &str) -> Self {
        match Self::from_file(path) {
            Ok(providers) => providers,
            Err(e) => {
                tracing::error!("known providers unavailable: {e}");
                Self::default()
            }
        }
    }
}

impl KnownProviders for JsonKnownProviders {
    fn list(&self) -> Vec<KnownProvider> {
        self.providers.clone()
    }
}
