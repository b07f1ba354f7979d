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

//! Command line and file configuration for the relay.
//!
//! Precedence, lowest first: CLI arguments (and their defaults), the YAML file named by
//! `--config-file`, then `CLIPSYNC_*` environment variables. Nested keys use `__` in the
//! environment, e.g. `CLIPSYNC_LIMITS__RATE_LIMIT_PER_MINUTE=60`.

use crate::host::{CredentialSource, GuardConfig, HashingParams, RelayConfig};
use clap::Parser;
use clap::builder::ValueHint;
use clap_derive::Parser;
use eyre::{WrapErr, bail};
use figment::{
    Figment,
    providers::{Env, Format, Serialized, Yaml},
};
use serde_derive::{Deserialize, Serialize};
use std::{net::SocketAddr, path::PathBuf, time::Duration};

pub const ENV_PREFIX: &str = "CLIPSYNC_";

#[derive(Parser, Debug, Clone, Serialize, Deserialize)]
#[command(name = "clipsync-relay", about = "Clipboard sync relay server")]
pub struct Args {
    #[arg(
        long,
        value_name = "listen-address",
        help = "WebSocket listen address",
        default_value = "0.0.0.0:8765"
    )]
    pub listen_address: String,

    #[arg(long, help = "Enable debug logging", default_value = "false")]
    pub debug: bool,

    #[arg(
        long,
        value_name = "config",
        help = "Yaml config file to use, overrides values in CLI args",
        value_hint = ValueHint::FilePath
    )]
    pub config_file: Option<PathBuf>,

    #[arg(
        long,
        value_name = "credentials-file",
        help = "dotenv-style file declaring USER<N>_NAME / USER<N>_PASS pairs and/or CLIPSYNC_USERS",
        default_value = ".env",
        value_hint = ValueHint::FilePath
    )]
    pub credentials_file: PathBuf,

    #[arg(
        long,
        help = "Do not seed the built-in development accounts",
        default_value = "false"
    )]
    pub no_default_users: bool,

    #[command(flatten)]
    pub limits: LimitArgs,

    #[command(flatten)]
    pub hashing: HashingArgs,
}

#[derive(Parser, Debug, Clone, Serialize, Deserialize)]
pub struct LimitArgs {
    #[arg(
        long,
        help = "Largest accepted frame, in bytes",
        default_value = "10485760"
    )]
    pub max_message_bytes: usize,

    #[arg(long, help = "Messages a connection may send per minute", default_value = "30")]
    pub rate_limit_per_minute: u32,

    #[arg(
        long,
        help = "Rate limit violations before a connection is closed",
        default_value = "3"
    )]
    pub rate_limit_strikes: u32,

    #[arg(
        long,
        help = "Connection attempts accepted per address per minute",
        default_value = "30"
    )]
    pub connection_attempts_per_minute: u32,

    #[arg(
        long,
        help = "Failed logins from one address before it is blocked",
        default_value = "5"
    )]
    pub auth_failure_threshold: u32,

    #[arg(
        long,
        help = "Window over which failed logins are counted, in seconds",
        default_value = "600"
    )]
    pub auth_failure_window_secs: u64,

    #[arg(long, help = "How long a blocked address stays blocked, in seconds", default_value = "900")]
    pub block_duration_secs: u64,

    #[arg(
        long,
        help = "Seconds a new connection has to authenticate",
        default_value = "30"
    )]
    pub auth_timeout_secs: u64,

    #[arg(
        long,
        help = "Authentication attempts allowed per connection",
        default_value = "3"
    )]
    pub max_auth_attempts: u32,

    #[arg(
        long,
        help = "Seconds without any inbound frame before a connection is dropped",
        default_value = "300"
    )]
    pub idle_timeout_secs: u64,

    #[arg(
        long,
        help = "Seconds a single outbound write may take",
        default_value = "10"
    )]
    pub write_timeout_secs: u64,

    #[arg(
        long,
        help = "Frames buffered per connection before it counts as too slow",
        default_value = "64"
    )]
    pub outbound_queue_depth: usize,

    #[arg(
        long,
        help = "Malformed or oversized frames tolerated before a connection is closed",
        default_value = "3"
    )]
    pub max_malformed_frames: u32,
}

#[derive(Parser, Debug, Clone, Serialize, Deserialize)]
pub struct HashingArgs {
    #[arg(long, help = "Argon2id memory cost in KiB", default_value = "19456")]
    pub argon2_memory_kib: u32,

    #[arg(long, help = "Argon2id iteration count", default_value = "2")]
    pub argon2_iterations: u32,
}

impl Args {
    /// Parse the command line and layer the config file and environment on top.
    pub fn load() -> eyre::Result<Self> {
        Self::resolve(Args::parse(), Env::prefixed(ENV_PREFIX).split("__"))
    }

    /// Merge `cli_args` with the config file it names and the given environment provider.
    pub fn resolve(cli_args: Args, env: Env) -> eyre::Result<Self> {
        let config_file = cli_args.config_file.clone();
        let mut args_figment = Figment::new().merge(Serialized::defaults(cli_args));
        if let Some(config_file) = config_file {
            args_figment = args_figment.merge(Yaml::file(config_file));
        }
        args_figment
            .merge(env)
            .extract::<Args>()
            .wrap_err("Invalid configuration")
    }

    pub fn relay_config(&self) -> eyre::Result<RelayConfig> {
        let listen_address: SocketAddr = self
            .listen_address
            .parse()
            .wrap_err_with(|| format!("Unable to parse listen address {}", self.listen_address))?;

        let limits = &self.limits;
        if limits.max_message_bytes == 0 {
            bail!("max_message_bytes must be positive");
        }
        if limits.rate_limit_per_minute == 0 || limits.rate_limit_strikes == 0 {
            bail!("rate_limit_per_minute and rate_limit_strikes must be positive");
        }
        if limits.auth_failure_threshold == 0 || limits.max_auth_attempts == 0 {
            bail!("auth_failure_threshold and max_auth_attempts must be positive");
        }
        if limits.outbound_queue_depth == 0 {
            bail!("outbound_queue_depth must be positive");
        }
        if limits.max_malformed_frames == 0 {
            bail!("max_malformed_frames must be positive");
        }

        Ok(RelayConfig {
            listen_address,
            max_message_bytes: limits.max_message_bytes,
            auth_timeout: Duration::from_secs(limits.auth_timeout_secs),
            max_auth_attempts: limits.max_auth_attempts,
            idle_timeout: Duration::from_secs(limits.idle_timeout_secs),
            write_timeout: Duration::from_secs(limits.write_timeout_secs),
            outbound_queue_depth: limits.outbound_queue_depth,
            max_malformed_frames: limits.max_malformed_frames,
            guard: GuardConfig {
                rate_limit_per_minute: limits.rate_limit_per_minute,
                rate_limit_strikes: limits.rate_limit_strikes,
                connection_attempts_per_minute: limits.connection_attempts_per_minute,
                auth_failure_threshold: limits.auth_failure_threshold,
                auth_failure_window: Duration::from_secs(limits.auth_failure_window_secs),
                block_duration: Duration::from_secs(limits.block_duration_secs),
            },
        })
    }

    /// Credential sources in the order they are applied.
    pub fn credential_sources(&self) -> Vec<CredentialSource> {
        let mut sources = Vec::with_capacity(3);
        if !self.no_default_users {
            sources.push(CredentialSource::BuiltinDefaults);
        }
        sources.push(CredentialSource::File(self.credentials_file.clone()));
        sources.push(CredentialSource::Environment);
        sources
    }

    pub fn hashing_params(&self) -> HashingParams {
        HashingParams::new(self.hashing.argon2_memory_kib, self.hashing.argon2_iterations)
    }
}
