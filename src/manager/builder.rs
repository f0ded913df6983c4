//! Builder pattern for bridge configuration.
//!
//! Provides a fluent API for assembling a [`ConnectionManager`].
//!
//! # Example
//!
//! ```no_run
//! use automation_bridge::{BridgeConfig, ConnectionManager};
//!
//! # fn example() -> automation_bridge::Result<()> {
//! let manager = ConnectionManager::builder()
//!     .config(BridgeConfig::new().with_capability_token("secret", true))
//!     .on_request(|request, _handle| {
//!         println!("{} -> {}", request.request_id, request.action);
//!     })
//!     .build()?;
//! # Ok(())
//! # }
//! ```

// ============================================================================
// Imports
// ============================================================================

use std::fmt;
use std::path::PathBuf;

use crate::error::{Error, Result};

use super::config::BridgeConfig;
use super::core::{ConnectionManager, IncomingRequest, RequestHandler};
use super::handle::BridgeHandle;

// ============================================================================
// BridgeBuilder
// ============================================================================

/// Builder for configuring a [`ConnectionManager`].
///
/// Use [`ConnectionManager::builder()`] to create a new builder.
#[derive(Default)]
pub struct BridgeBuilder {
    /// Explicit configuration.
    config: Option<BridgeConfig>,
    /// JSON configuration file.
    config_file: Option<PathBuf>,
    /// Request callback.
    handler: Option<RequestHandler>,
}

impl fmt::Debug for BridgeBuilder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BridgeBuilder")
            .field("config", &self.config)
            .field("config_file", &self.config_file)
            .field("handler", &self.handler.is_some())
            .finish()
    }
}

// ============================================================================
// BridgeBuilder Implementation
// ============================================================================

impl BridgeBuilder {
    /// Creates a builder with no configuration.
    #[inline]
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the configuration.
    #[inline]
    #[must_use]
    pub fn config(mut self, config: BridgeConfig) -> Self {
        self.config = Some(config);
        self
    }

    /// Loads the configuration from a JSON file at build time.
    ///
    /// # Arguments
    ///
    /// * `path` - File in the format read by [`BridgeConfig::from_json_file`]
    #[inline]
    #[must_use]
    pub fn config_file(mut self, path: impl Into<PathBuf>) -> Self {
        self.config_file = Some(path.into());
        self
    }

    /// Registers the request handler.
    ///
    /// Invoked on the owner task for every accepted `automation_request`.
    #[must_use]
    pub fn on_request<F>(mut self, handler: F) -> Self
    where
        F: Fn(IncomingRequest, BridgeHandle) + Send + Sync + 'static,
    {
        self.handler = Some(Box::new(handler));
        self
    }

    /// Builds the manager with validation.
    ///
    /// Without a configuration, defaults are used.
    ///
    /// # Errors
    ///
    /// - [`Error::Config`] if both `config` and `config_file` are set
    /// - [`Error::Io`] or [`Error::Json`] if the config file cannot be read
    /// - [`Error::Config`] if the configuration is invalid
    pub fn build(self) -> Result<ConnectionManager> {
        let config = match (self.config, self.config_file) {
            (Some(_), Some(path)) => {
                return Err(Error::config(format!(
                    "both an explicit config and a config file ({}) were given. Use one.",
                    path.display()
                )));
            }
            (Some(config), None) => config,
            (None, Some(path)) => BridgeConfig::from_json_file(&path)?,
            (None, None) => BridgeConfig::new(),
        };

        ConnectionManager::new(config, self.handler)
    }
}

// ============================================================================
// Tests
// ============================================================================
