use std::net::{SocketAddr, TcpListener};

use anyhow::{anyhow, Error, Result};
use axum::{Router, Server};
use log::{info, warn};
use tokio::task::JoinSet;

/// Sockets bound ahead of serving, so callers learn the real addresses
/// (including ephemeral ports) before anything is announced.
pub struct Listeners {
    listeners: Vec<TcpListener>,
    addrs: Vec<SocketAddr>,
}

pub fn bind(listen: &[SocketAddr]) -> Result<Listeners> {
    let mut listeners = vec![];
    let mut addrs = vec![];

    for addr in listen {
        let listener = TcpListener::bind(addr)
            .map_err(|e| anyhow!("could not listen on {addr}: {e}"))?;
        listener.set_nonblocking(true)?;

        addrs.push(listener.local_addr()?);
        listeners.push(listener);
    }

    Ok(Listeners { listeners, addrs })
}

impl Listeners {
    pub fn local_addrs(&self) -> &[SocketAddr] {
        &self.addrs
    }

    pub async fn serve(self, app: Router) -> Result<()> {
        let mut futures = JoinSet::new();

        for (listener, addr) in self.listeners.into_iter().zip(self.addrs) {
            let serve = app.clone().into_make_service_with_connect_info::<SocketAddr>();

            info!("Listening on {addr}. ");
            futures.spawn(async move {
                Server::from_tcp(listener)?
                    .serve(serve)
                    .await?;
                Ok::<(), Error>(())
            });
        }

        if let Some(result) = futures.join_next().await {
            let result = result?;
            if let Err(e) = result {
                warn!("Server failed: {e}. ");
                return Err(e);
            }
        }

        Ok(())
    }
}
