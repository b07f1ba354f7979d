// Copyright (C) 2025 Ryan Daum <ryan.daum@gmail.com> This program is free
// software: you can redistribute it and/or modify it under the terms of the GNU
// General Public License as published by the Free Software Foundation, version
// 3.
//
// This program is distributed in the hope that it will be useful, but WITHOUT
// ANY WARRANTY; without even the implied warranty of MERCHANTABILITY or FITNESS
// FOR A PARTICULAR PURPOSE. See the GNU General Public License for more details.
//
// You should have received a copy of the GNU General Public License along with
// this program. If not, see <https://www.gnu.org/licenses/>.
//

//! Shared tracing initialization for clipsync binaries

use tracing_subscriber::{filter::EnvFilter, fmt, prelude::*};

/// Noisy transport crates that only get interesting at `trace`.
const QUIET_TARGETS: &[&str] = &["tungstenite=info", "tokio_tungstenite=info", "hyper=info"];

/// Initialize tracing with environment-based configuration and fallback support
///
/// - Uses `RUST_LOG` environment variable when available
/// - Falls back to the debug flag when `RUST_LOG` is not set
///
/// # Arguments
/// * `debug_fallback` - If true and `RUST_LOG` is not set, uses DEBUG level; otherwise INFO
pub fn init_tracing(debug_fallback: bool) -> Result<(), eyre::Report> {
    tracing_subscriber::registry()
        .with(
            fmt::layer()
                .compact()
                .with_ansi(true)
                .with_file(true)
                .with_target(false)
                .with_line_number(true)
                .with_thread_names(true)
                .with_span_events(fmt::format::FmtSpan::NONE),
        )
        .with(build_filter(debug_fallback)?)
        .try_init()?;

    Ok(())
}

fn build_filter(debug_fallback: bool) -> Result<EnvFilter, eyre::Report> {
    if let Ok(env_filter) = EnvFilter::try_from_default_env() {
        // User has set RUST_LOG, respect it as-is.
        return Ok(env_filter);
    }
    let level = if debug_fallback { "debug" } else { "info" };
    let mut filter = EnvFilter::new(level);
    for directive in QUIET_TARGETS {
        filter = filter.add_directive(directive.parse()?);
    }
    Ok(filter)
}
