// Switcheroo - JSON-RPC traffic switch
// Copyright (C) 2024 Zhuo Zhang and Wuqi Zhang
//
// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU Affero General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE. See the
// GNU Affero General Public License for more details.
//
// You should have received a copy of the GNU Affero General Public License
// along with this program. If not, see <https://www.gnu.org/licenses/>.

//! Switch configuration.
//!
//! The config is loaded once at startup, validated, and shared read-only
//! behind an `Arc` for the lifetime of the process.
//!
//! ```yaml
//! targets:
//!   mainnet:
//!     endpoint: ws://127.0.0.1:8546
//!     keepAlive: true
//!     effects:
//!       - direction: target-response
//!         delay: { time: 150ms, maxJitter: 50ms }
//! sources:
//!   wallet:
//!     target: mainnet
//!     effects:
//!       - filter: ^eth_sendRawTransaction$
//!         error: { chance: 0.1, code: -32000, message: nonce too low }
//! ```

use crate::{
    effect::EffectConfig,
    error::{ConfigError, LookupKind, RouteError},
};
use axum::http::Uri;
use serde::{Deserialize, Serialize};
use std::{collections::BTreeMap, fs, path::Path};
use tracing::{debug, info};

/// Top-level configuration: named targets and named sources.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    /// Outgoing connections towards external RPCs
    #[serde(default)]
    pub targets: BTreeMap<String, TargetConfig>,
    /// Expected incoming connections
    #[serde(default)]
    pub sources: BTreeMap<String, SourceConfig>,
}

/// An upstream RPC endpoint.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields, rename_all = "camelCase")]
pub struct TargetConfig {
    /// WebSocket endpoint to dial
    pub endpoint: String,
    /// Keep the connection open even while it is not being used
    #[serde(default)]
    pub keep_alive: bool,
    /// Effects applied to all traffic to and from this target
    #[serde(default)]
    pub effects: Vec<EffectConfig>,
}

/// A named entry point clients dial into.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SourceConfig {
    /// Target this source is switched to; may be omitted when only one target exists
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target: Option<String>,
    /// Effects applied to all traffic from and to this source
    #[serde(default)]
    pub effects: Vec<EffectConfig>,
}

impl Config {
    /// Load and validate a config file. `.toml` files are read as TOML, anything else as YAML.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let text = fs::read_to_string(path)
            .map_err(|source| ConfigError::Io { path: path.to_path_buf(), source })?;

        let config = match path.extension().and_then(|ext| ext.to_str()) {
            Some(ext) if ext.eq_ignore_ascii_case("toml") => Self::from_toml_str(&text)?,
            _ => Self::from_yaml_str(&text)?,
        };
        info!(
            path = %path.display(),
            targets = config.targets.len(),
            sources = config.sources.len(),
            "loaded config"
        );
        Ok(config)
    }

    /// Parse and validate YAML text
    pub fn from_yaml_str(text: &str) -> Result<Self, ConfigError> {
        let config: Self = serde_yaml::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    /// Parse and validate TOML text
    pub fn from_toml_str(text: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    /// Check every reference and every effect, failing on the first problem.
    pub fn validate(&self) -> Result<(), ConfigError> {
        for (name, target) in &self.targets {
            validate_endpoint(&target.endpoint)
                .map_err(|reason| ConfigError::InvalidTarget { name: name.clone(), reason })?;
            validate_chain(&format!("target {name}"), &target.effects)?;
        }
        for (name, source) in &self.sources {
            self.target_for(name)?;
            validate_chain(&format!("source {name}"), &source.effects)?;
        }
        debug!("config validated");
        Ok(())
    }

    /// Name of the target `source` is switched to.
    pub fn target_for(&self, source: &str) -> Result<&str, ConfigError> {
        let configured = self.sources.get(source).and_then(|s| s.target.as_deref());
        match configured {
            Some(target) if self.targets.contains_key(target) => Ok(target),
            Some(target) => Err(ConfigError::UnknownTarget {
                source_name: source.to_string(),
                target: target.to_string(),
            }),
            None if self.targets.len() == 1 => {
                Ok(self.targets.keys().next().map(String::as_str).unwrap_or_default())
            }
            None => Err(ConfigError::AmbiguousTarget(source.to_string(), self.targets.len())),
        }
    }

    /// Look up a source by name
    pub fn source(&self, name: &str) -> Result<&SourceConfig, RouteError> {
        self.sources
            .get(name)
            .ok_or_else(|| RouteError::ConfigLookup {
                kind: LookupKind::Source,
                name: name.to_string(),
            })
    }

    /// Look up a target by name
    pub fn target(&self, name: &str) -> Result<&TargetConfig, RouteError> {
        self.targets
            .get(name)
            .ok_or_else(|| RouteError::ConfigLookup {
                kind: LookupKind::Target,
                name: name.to_string(),
            })
    }
}

fn validate_chain(owner: &str, effects: &[EffectConfig]) -> Result<(), ConfigError> {
    for (index, effect) in effects.iter().enumerate() {
        effect.validate().map_err(|reason| ConfigError::InvalidEffect {
            owner: owner.to_string(),
            index,
            reason,
        })?;
    }
    Ok(())
}

fn validate_endpoint(endpoint: &str) -> Result<(), String> {
    let uri: Uri = endpoint.parse().map_err(|e| format!("invalid endpoint {endpoint:?}: {e}"))?;
    match uri.scheme_str() {
        Some("ws") => {}
        Some(scheme) => return Err(format!("unsupported endpoint scheme {scheme:?}, expected ws")),
        None => return Err(format!("endpoint {endpoint:?} has no scheme")),
    }
    if uri.host().is_none_or(str::is_empty) {
        return Err(format!("endpoint {endpoint:?} has no host"));
    }
    Ok(())
}
