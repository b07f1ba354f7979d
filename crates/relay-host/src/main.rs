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

use clipsync_relay::{
    args::Args,
    host::{CredentialStore, Listener, SyncBroker},
};
use eyre::WrapErr;
use std::{sync::Arc, time::Duration};
use tokio::{
    net::TcpListener,
    select,
    signal::unix::{SignalKind, signal},
};
use tracing::{error, info, warn};

const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

#[tokio::main(flavor = "multi_thread")]
async fn main() -> Result<(), eyre::Error> {
    color_eyre::install()?;
    let args = Args::load()?;

    clipsync_common::tracing::init_tracing(args.debug).unwrap_or_else(|e| {
        eprintln!("Unable to configure logging: {e}");
        std::process::exit(1);
    });

    let config = args.relay_config()?;

    let credentials = CredentialStore::load(&args.credential_sources(), args.hashing_params())
        .wrap_err("Unable to load user credentials")?;
    info!(users = ?credentials.usernames(), "Loaded users");
    if !args.no_default_users {
        warn!("Built-in development accounts are enabled; pass --no-default-users in production");
    }

    let mut hup_signal = match signal(SignalKind::hangup()) {
        Ok(signal) => signal,
        Err(e) => {
            error!("Unable to register HUP signal handler: {}", e);
            std::process::exit(1);
        }
    };
    let mut stop_signal = match signal(SignalKind::interrupt()) {
        Ok(signal) => signal,
        Err(e) => {
            error!("Unable to register STOP signal handler: {}", e);
            std::process::exit(1);
        }
    };
    let mut term_signal = match signal(SignalKind::terminate()) {
        Ok(signal) => signal,
        Err(e) => {
            error!("Unable to register TERM signal handler: {}", e);
            std::process::exit(1);
        }
    };

    let listener = TcpListener::bind(config.listen_address)
        .await
        .wrap_err_with(|| format!("Unable to bind {}", config.listen_address))?;
    info!("Serving out of CWD {:?}", std::env::current_dir()?);

    let broker = SyncBroker::new(config, Arc::new(credentials));
    let mut serve_loop = tokio::spawn(Listener::serve(listener, broker.clone()));

    select! {
        result = &mut serve_loop => {
            match result {
                Ok(Ok(())) => info!("Listener exited."),
                Ok(Err(e)) => error!("Listener failed: {e}"),
                Err(e) => error!("Listener task panicked: {e}"),
            }
        }
        _ = hup_signal.recv() => {
            info!("HUP received, stopping...");
        }
        _ = stop_signal.recv() => {
            info!("STOP received, stopping...");
        }
        _ = term_signal.recv() => {
            info!("TERM received, stopping...");
        }
    }

    broker.shutdown();
    if !serve_loop.is_finished() {
        match tokio::time::timeout(SHUTDOWN_GRACE, &mut serve_loop).await {
            Ok(Ok(Err(e))) => error!("Listener failed during shutdown: {e}"),
            Ok(_) => {}
            Err(_) => warn!("Listener did not stop within {SHUTDOWN_GRACE:?}"),
        }
    }
    if !broker.drain(SHUTDOWN_GRACE).await {
        warn!("Some connections were still open after {SHUTDOWN_GRACE:?}");
    }
    info!("Done.");

    Ok(())
}
