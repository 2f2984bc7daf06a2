use std::{future::Future, net::SocketAddr};

use anyhow::Result;
use tokio::{
    net::{TcpListener, TcpStream},
    select,
};
use tracing::{info, warn};

use crate::{
    hub::{Hub, HubConfig, HubHandle},
    session,
};

/// Owns the listener and the hub handle; every accepted connection gets
/// its own session task.
pub struct Server {
    listener: TcpListener,
    hub: HubHandle,
}

impl Server {
    pub fn new(listener: TcpListener, config: HubConfig) -> Self {
        Self {
            listener,
            hub: Hub::spawn(config),
        }
    }

    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Accepts connections until `shutdown` resolves. An accept failure
    /// is fatal: the loop returns the error instead of retrying.
    pub async fn run_until<F>(self, shutdown: F) -> Result<()>
    where
        F: Future<Output = ()> + Send,
    {
        let Server { listener, hub } = self;
        tokio::pin!(shutdown);

        loop {
            select! {
                _ = &mut shutdown => {
                    info!("server shutting down");
                    break;
                }
                accepted = listener.accept() => {
                    let (stream, peer) = accepted?;
                    spawn_session(stream, peer, hub.clone());
                }
            }
        }

        Ok(())
    }

    pub async fn run_until_ctrl_c(self) -> Result<()> {
        self.run_until(async {
            if let Err(err) = tokio::signal::ctrl_c().await {
                warn!(error = ?err, "failed to install ctrl-c handler");
            }
        })
        .await
    }
}

fn spawn_session(stream: TcpStream, peer: SocketAddr, hub: HubHandle) {
    tokio::spawn(async move {
        if let Err(err) = session::run(stream, hub).await {
            warn!(peer = %peer, error = ?err, "session closed with error");
        }
    });
}
