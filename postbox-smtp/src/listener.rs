use std::{io, net::SocketAddr, sync::Arc, time::Duration};

use futures_util::future::join_all;
use postbox_common::{Signal, error::ListenerError, internal, status::Status, tracing};
use tokio::{
    io::AsyncWriteExt,
    net::{TcpListener, TcpStream},
    sync::Semaphore,
};

use crate::{
    session::{Session, SessionConfig},
    transaction_handler::TransactionHandlerFactory,
};

/// Accepts connections and runs one [`Session`] per client, up to
/// `max_connections` at a time.
pub struct Listener {
    listener: TcpListener,
    config: SessionConfig,
    factory: Arc<dyn TransactionHandlerFactory>,
    permits: Arc<Semaphore>,
}

impl Listener {
    /// Bind to `socket`. Port 0 picks an ephemeral port, see [`Self::local_addr`].
    pub async fn bind(
        socket: SocketAddr,
        max_connections: usize,
        config: SessionConfig,
        factory: Arc<dyn TransactionHandlerFactory>,
    ) -> Result<Self, ListenerError> {
        let listener = TcpListener::bind(socket)
            .await
            .map_err(|source| ListenerError::BindFailed {
                address: socket.to_string(),
                source,
            })?;

        Ok(Self {
            listener,
            config,
            factory,
            permits: Arc::new(Semaphore::new(max_connections.max(1))),
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr, ListenerError> {
        Ok(self.listener.local_addr()?)
    }

    /// Serve until a [`Signal::Shutdown`] arrives, then wait for the open
    /// sessions to finish.
    pub async fn serve(
        self,
        mut shutdown: tokio::sync::broadcast::Receiver<Signal>,
    ) -> anyhow::Result<()> {
        let address = self.local_addr()?;
        internal!(level = INFO, "SMTP listening on {address}");

        let mut sessions = Vec::default();

        loop {
            tokio::select! {
                sig = shutdown.recv() => {
                    if matches!(sig, Ok(Signal::Shutdown) | Err(_)) {
                        internal!(level = INFO, "SMTP Listener {address} received shutdown signal, finishing sessions ...");
                        join_all(sessions).await;
                        break;
                    }
                }

                connection = self.listener.accept() => {
                    let (stream, peer) = match connection {
                        Ok(accepted) => accepted,
                        Err(err) => {
                            let backoff = accept_backoff(&err);
                            internal!(level = ERROR, "{}", ListenerError::AcceptFailed(err));
                            if !backoff.is_zero() {
                                tokio::time::sleep(backoff).await;
                            }
                            continue;
                        }
                    };
                    tracing::debug!("Connection received on {address} from {peer}");

                    sessions.retain(|handle: &tokio::task::JoinHandle<()>| !handle.is_finished());

                    let Ok(permit) = Arc::clone(&self.permits).try_acquire_owned() else {
                        internal!(level = WARN, "Connection limit reached, refusing {peer}");
                        tokio::spawn(refuse(stream));
                        continue;
                    };

                    let session = Session::create(
                        stream,
                        peer,
                        self.factory.create(peer),
                        self.config.clone(),
                    );
                    let signal = shutdown.resubscribe();

                    sessions.push(tokio::spawn(async move {
                        if let Err(err) = session.run(signal).await {
                            internal!(level = ERROR, "Error: {err}");
                        }
                        drop(permit);
                    }));
                }
            }
        }

        Ok(())
    }
}

/// How long to pause after a failed accept. Errors that belong to a single
/// aborted connection retry at once. Anything else, such as running out of
/// file descriptors, would fail again immediately.
fn accept_backoff(err: &io::Error) -> Duration {
    match err.kind() {
        io::ErrorKind::ConnectionAborted
        | io::ErrorKind::ConnectionReset
        | io::ErrorKind::ConnectionRefused
        | io::ErrorKind::Interrupted => Duration::ZERO,
        _ => Duration::from_millis(100),
    }
}

async fn refuse(mut stream: TcpStream) {
    let reply = format!(
        "{} 4.7.0 Too many connections, try again later\r\n",
        Status::Unavailable
    );
    if let Err(err) = stream.write_all(reply.as_bytes()).await {
        tracing::debug!("Failed to refuse connection: {err}");
    }
    let _ = stream.shutdown().await;
}
