//! The daemon: listeners, connection lifecycle and request serving.
//!
//! One task per accepted connection reads frames off the transport and
//! dispatches them; `SEND_ACK` frames get their reply written back on the
//! same stream, `CREATE_NOTIFY` dials the client's reverse socket and
//! installs the notify writer. A connection slot is reusable only when
//! both directions are down. No handler error ever stops the daemon.

mod conn;
mod dispatch;

pub(crate) use conn::{Connection, ConnTable};
pub(crate) use dispatch::Modules;

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use parking_lot::Mutex;
use tokio_util::codec::Framed;
use tokio_util::sync::CancellationToken;

use crate::config::{Config, DEFAULT_FOCUS_MATRIX};
use crate::defs::{PARCEL_CREATE_NOTIFY, PARCEL_SEND, PARCEL_SEND_ACK};
use crate::error::{MediaError, MediaResult};
use crate::focus::{FocusArbiter, InteractionMatrix};
use crate::graph::MediaGraph;
use crate::parcel::{Parcel, ParcelCodec};
use crate::policy::{JsonFileStore, PersistScheduler, PolicyEngine};
use crate::session::SessionMediator;
use crate::transport::{bind_local, bind_tcp, dial_back, RpcListener, RpcStream, TransportConfig};

struct DaemonState {
    transport: Arc<TransportConfig>,
    modules: Modules,
    conns: ConnTable,
    next_conn_id: AtomicU64,
    persist: Option<Arc<PersistScheduler>>,
}

/// Running daemon handle. Dropping it (or calling [`shutdown`]) stops the
/// listeners and every connection task.
///
/// [`shutdown`]: Daemon::shutdown
pub struct Daemon {
    state: Arc<DaemonState>,
    cancel: CancellationToken,
}

impl Daemon {
    /// Composition root: wires the modules, binds the listeners and starts
    /// accepting. Must run inside a tokio runtime.
    pub async fn start(cfg: Config) -> MediaResult<Self> {
        cfg.validate().map_err(MediaError::InvalidArgument)?;

        let matrix = match &cfg.focus_conf {
            Some(path) => InteractionMatrix::from_file(path)?,
            None => InteractionMatrix::parse(DEFAULT_FOCUS_MATRIX).expect("builtin matrix"),
        };

        let transport = Arc::new(cfg.transport.clone());
        let persist = cfg.persist_path.as_ref().map(|path| {
            Arc::new(PersistScheduler::new(
                Arc::new(JsonFileStore::open(path.clone())),
                Duration::from_millis(cfg.persist_delay_ms),
            ))
        });

        let modules = Modules {
            focus: Mutex::new(FocusArbiter::new(matrix, cfg.focus_stack_depth)),
            session: Mutex::new(SessionMediator::new()),
            graph: MediaGraph::from_specs(&cfg.nodes, transport.clone()),
            policy: Mutex::new(PolicyEngine::new(&cfg.criteria, persist.clone())),
        };

        let state = Arc::new(DaemonState {
            transport: transport.clone(),
            modules,
            conns: ConnTable::new(cfg.max_connections),
            next_conn_id: AtomicU64::new(1),
            persist,
        });
        let cancel = CancellationToken::new();

        let local = bind_local(&transport)?;
        tokio::spawn(accept_loop(state.clone(), local, cancel.clone(), "local"));

        if transport.rpc_port >= 0 {
            let listener = bind_tcp(transport.rpc_port as u16)?;
            tokio::spawn(accept_loop(state.clone(), listener, cancel.clone(), "rpc"));
        }
        if transport.inet_port >= 0 {
            let listener = bind_tcp(transport.inet_port as u16)?;
            tokio::spawn(accept_loop(state.clone(), listener, cancel.clone(), "inet"));
        }

        log::info!(
            "[Server] listening as md:{} in {}",
            transport.local_cpu,
            transport.socket_dir.display()
        );
        Ok(Self { state, cancel })
    }

    /// Stops listeners and connection tasks, flushing pending persistence.
    pub fn shutdown(&self) {
        self.cancel.cancel();
        if let Some(persist) = &self.state.persist {
            persist.flush();
        }
        log::info!("[Server] shut down");
    }

    /// Number of live connections, for diagnostics.
    pub fn active_connections(&self) -> usize {
        self.state.conns.active_count()
    }
}

impl Drop for Daemon {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

async fn accept_loop(
    state: Arc<DaemonState>,
    listener: RpcListener,
    cancel: CancellationToken,
    label: &'static str,
) {
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            accepted = listener.accept() => match accepted {
                Ok(stream) => {
                    let conn_id = state.next_conn_id.fetch_add(1, Ordering::Relaxed);
                    match state.conns.claim(conn_id) {
                        Some(conn) => {
                            log::debug!("[Server] {label} conn {conn_id} on slot {}", conn.slot);
                            tokio::spawn(serve_conn(state.clone(), conn, stream, cancel.clone()));
                        }
                        None => {
                            // Table full: refuse by dropping the stream.
                            log::warn!("[Server] connection table full, refusing {label} client");
                        }
                    }
                }
                Err(err) => {
                    log::warn!("[Server] {label} accept failed: {err}");
                    tokio::time::sleep(Duration::from_millis(100)).await;
                }
            }
        }
    }
}

async fn serve_conn(
    state: Arc<DaemonState>,
    conn: Arc<Connection>,
    stream: RpcStream,
    cancel: CancellationToken,
) {
    let mut framed = Framed::new(stream, ParcelCodec);
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            frame = framed.next() => match frame {
                Some(Ok(mut parcel)) => match parcel.code() {
                    PARCEL_SEND | PARCEL_SEND_ACK => {
                        let want_reply = parcel.code() == PARCEL_SEND_ACK;
                        match dispatch::dispatch(&state.modules, &conn, &mut parcel, want_reply).await {
                            Ok(Some(reply)) => {
                                if framed.send(reply).await.is_err() {
                                    break;
                                }
                            }
                            Ok(None) => {}
                            Err(err) => {
                                log::warn!("[Server] conn {} bad parcel: {err}", conn.conn_id);
                                break;
                            }
                        }
                    }
                    PARCEL_CREATE_NOTIFY => {
                        if let Err(err) = create_notify(&state, &conn, &mut parcel).await {
                            log::warn!("[Server] conn {} create_notify failed: {err}", conn.conn_id);
                        }
                    }
                    code => {
                        log::warn!("[Server] conn {} unexpected code {code}", conn.conn_id);
                        break;
                    }
                },
                Some(Err(err)) => {
                    log::debug!("[Server] conn {} read error: {err}", conn.conn_id);
                    break;
                }
                None => break,
            }
        }
    }
    dispatch::harvest(&state.modules, &conn);
    state.conns.release(&conn);
    log::debug!("[Server] conn {} closed", conn.conn_id);
}

/// Handles the reverse-notify handshake: dial the client's listener named
/// by `{key, cpu}` and install the notify writer.
async fn create_notify(
    state: &Arc<DaemonState>,
    conn: &Arc<Connection>,
    parcel: &mut Parcel,
) -> MediaResult<()> {
    let key = parcel.read_string()?;
    let cpu = parcel.read_string()?;
    let stream = dial_back(&state.transport, &cpu, &key).await?;
    conn.install_notify(stream);
    log::debug!("[Server] conn {} notify channel to {cpu}:{key}", conn.conn_id);
    Ok(())
}
