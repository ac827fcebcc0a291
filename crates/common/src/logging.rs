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

//! Logging configuration for switcheroo components
//!
//! Provides centralized logging setup with:
//! - Colored console output with structured fields
//! - Optional daily-rotated log files in the temp directory
//! - Environment variable support (RUST_LOG), INFO by default
//! - A once-only initializer for test suites

use eyre::Result;
use std::{env, fs, path::PathBuf, sync::Once};
use tracing::Level;
use tracing_appender::{non_blocking, rolling};
use tracing_subscriber::{
    fmt::{self, format::FmtSpan, time::LocalTime},
    layer::SubscriberExt,
    util::SubscriberInitExt,
    EnvFilter, Layer,
};

/// Directory under the system temp folder that holds per-component log folders
const LOG_ROOT: &str = "switcheroo-logs";

/// Crates whose INFO output drowns the switch's own connection logs
const NOISY_TARGETS: &[&str] = &["tower_http=warn", "hyper=warn", "tungstenite=warn"];

/// Initialize logging for a switcheroo component
///
/// Sets up a pretty console layer and, when `enable_file_logging` is set, a
/// second plain-text layer writing to `<tmp>/switcheroo-logs/<component>/`
/// with daily rotation. Both respect `RUST_LOG` and default to INFO.
///
/// # Arguments
/// * `component_name` - Name of the component (e.g. "switcheroo")
/// * `enable_file_logging` - Whether to also write a rotating log file
///
/// # Examples
/// ```rust
/// use switcheroo_common::logging;
///
/// fn main() -> eyre::Result<()> {
///     logging::init_logging("switcheroo", false)?;
///     tracing::info!("switch started");
///     Ok(())
/// }
/// ```
pub fn init_logging(component_name: &str, enable_file_logging: bool) -> Result<()> {
    let console_layer = fmt::layer()
        .with_target(true)
        .with_thread_names(true)
        .with_file(true)
        .with_line_number(true)
        .with_span_events(FmtSpan::CLOSE)
        .with_timer(LocalTime::rfc_3339())
        .with_ansi(true)
        .pretty()
        .with_filter(console_filter()?);

    let file_layer = if enable_file_logging {
        let log_dir = create_log_directory(component_name)?;
        let appender = rolling::daily(&log_dir, format!("{component_name}.log"));
        let (writer, guard) = non_blocking(appender);

        // The guard flushes on drop; the subscriber lives for the whole process.
        std::mem::forget(guard);

        let layer = fmt::layer()
            .with_target(true)
            .with_thread_names(true)
            .with_file(true)
            .with_line_number(true)
            .with_timer(LocalTime::rfc_3339())
            .with_ansi(false)
            .with_writer(writer)
            .with_filter(default_filter(Level::INFO)?);
        Some((layer, log_dir))
    } else {
        None
    };

    let log_dir = file_layer.as_ref().map(|(_, dir)| dir.clone());

    tracing_subscriber::registry()
        .with(console_layer)
        .with(file_layer.map(|(layer, _)| layer))
        .try_init()
        .map_err(|e| eyre::eyre!("Failed to initialize tracing subscriber: {}", e))?;

    match log_dir {
        Some(dir) => tracing::info!(
            component = component_name,
            log_dir = %dir.display(),
            "Logging initialized with console and file output"
        ),
        None => {
            tracing::info!(component = component_name, "Logging initialized with console output")
        }
    }

    let rust_log = env::var("RUST_LOG").unwrap_or_else(|_| "info".to_string());
    tracing::debug!(component = component_name, rust_log = %rust_log, "Log filter in effect");

    Ok(())
}

/// Create (if needed) the log directory of a component
fn create_log_directory(component_name: &str) -> Result<PathBuf> {
    let log_dir = env::temp_dir().join(LOG_ROOT).join(component_name);
    fs::create_dir_all(&log_dir)?;
    Ok(log_dir)
}

/// RUST_LOG filter, falling back to `level` when unset or unparsable
fn default_filter(level: Level) -> Result<EnvFilter> {
    EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(level.as_str()))
        .map_err(|e| eyre::eyre!("Failed to create environment filter: {}", e))
}

/// Console filter: the default filter with HTTP plumbing quieted down
fn console_filter() -> Result<EnvFilter> {
    let mut filter = default_filter(Level::INFO)?;
    for directive in NOISY_TARGETS {
        filter = filter.add_directive(directive.parse()?);
    }
    Ok(filter)
}

/// Initialize compact console-only logging
///
/// Useful for tests and short-lived tools that do not need file output.
///
/// # Arguments
/// * `level` - Default level when RUST_LOG is not set
pub fn init_simple_logging(level: Level) -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(default_filter(level)?)
        .with_target(false)
        .compact()
        .try_init()
        .map_err(|e| eyre::eyre!("Failed to initialize simple logging: {}", e))
}

static TEST_LOGGING_INIT: Once = Once::new();

/// Idempotent logging initialization for tests
///
/// Every test may call this first; only the first call installs a subscriber,
/// later calls are no-ops. Defaults to INFO unless `default_level` or RUST_LOG
/// says otherwise.
///
/// ```rust
/// use switcheroo_common::logging;
///
/// logging::ensure_test_logging(None);
/// tracing::info!("safe to call from any test");
/// ```
pub fn ensure_test_logging(default_level: Option<Level>) {
    TEST_LOGGING_INIT.call_once(|| {
        // A subscriber installed elsewhere is fine for tests.
        let _ = init_simple_logging(default_level.unwrap_or(Level::INFO));
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use tracing::{debug, info, warn};

    #[test]
    fn test_logging_is_idempotent() {
        ensure_test_logging(None);
        ensure_test_logging(Some(Level::DEBUG));

        info!("info after double init");
        warn!("warn after double init");
        debug!("debug after double init");
    }

    #[test]
    fn test_log_directory_creation() {
        let log_dir = create_log_directory("switcheroo-test").unwrap();
        assert!(log_dir.exists());
        assert!(log_dir.to_string_lossy().contains(LOG_ROOT));
        assert!(log_dir.ends_with("switcheroo-test"));
    }

    #[test]
    fn test_console_filter_quiets_http_noise() {
        let filter = console_filter().unwrap().to_string();
        assert!(filter.contains("tower_http=warn"));
        assert!(filter.contains("tungstenite=warn"));
    }

    #[test]
    fn test_second_subscriber_is_an_error_not_a_panic() {
        ensure_test_logging(None);
        assert!(init_logging("switcheroo-second", false).is_err());
        info!("logging still works after a failed init");
    }
}
