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

use crate::host::broker::{SyncBroker, mk_routes};
use std::net::SocketAddr;
use tokio::net::TcpListener;
use tracing::info;

pub struct Listener;

impl Listener {
    /// Serve the relay on `listener` until the broker is shut down.
    pub async fn serve(listener: TcpListener, broker: SyncBroker) -> eyre::Result<()> {
        let addr = listener.local_addr()?;
        info!("Listening on {:?}", addr);

        let janitor = tokio::spawn(broker.clone().run_janitor());
        let shutdown = broker.shutdown_token();
        let main_router = mk_routes(broker.clone());
        let served = axum::serve(
            listener,
            main_router.into_make_service_with_connect_info::<SocketAddr>(),
        )
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await;

        // However serving ended, take the live connections down with it.
        broker.shutdown();
        janitor.await?;
        served?;
        info!("Done listening on {:?}", addr);
        Ok(())
    }
}
