//! Per-connection state and the connection table.
//!
//! A connection couples the accepted transport stream with an optional
//! outbound-only notify channel the daemon dialed back to the client. The
//! notify channel is an ordered writer task fed through a channel, so
//! module code can push events from synchronous handlers without blocking
//! and without reordering.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use futures::SinkExt;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio_util::codec::FramedWrite;

use crate::defs::PARCEL_NOTIFY;
use crate::events::Notifier;
use crate::parcel::{Parcel, ParcelCodec};
use crate::transport::RpcStream;

/// Module-specific state attached to a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ConnData {
    None,
    /// Focus stack client id.
    Focus(usize),
    SessionController(u64),
    SessionControllee(u64),
    Player(u64),
    Recorder(u64),
    /// Connection holds policy subscriptions (keyed by conn id).
    PolicySubscriber,
}

/// Server-side connection state shared between the read task, the notify
/// writer and the service modules.
pub(crate) struct Connection {
    pub slot: usize,
    pub conn_id: u64,
    alive: AtomicBool,
    notify_tx: Mutex<Option<mpsc::UnboundedSender<Parcel>>>,
    data: Mutex<ConnData>,
}

impl Connection {
    pub fn new(slot: usize, conn_id: u64) -> Self {
        Self {
            slot,
            conn_id,
            alive: AtomicBool::new(true),
            notify_tx: Mutex::new(None),
            data: Mutex::new(ConnData::None),
        }
    }

    pub fn is_alive(&self) -> bool {
        self.alive.load(Ordering::SeqCst)
    }

    pub fn set_dead(&self) {
        self.alive.store(false, Ordering::SeqCst);
    }

    pub fn data(&self) -> ConnData {
        *self.data.lock()
    }

    pub fn set_data(&self, data: ConnData) {
        *self.data.lock() = data;
    }

    /// Whether the notify side is still up (gates slot reuse).
    pub fn notify_open(&self) -> bool {
        self.notify_tx.lock().is_some()
    }

    /// Installs the dialed-back notify stream, spawning its writer task.
    ///
    /// Queued parcels are written in order; a write error drops the channel
    /// and every later notification (no retry).
    pub fn install_notify(self: &Arc<Self>, stream: RpcStream) {
        let (tx, mut rx) = mpsc::unbounded_channel::<Parcel>();
        *self.notify_tx.lock() = Some(tx);
        let conn_id = self.conn_id;
        tokio::spawn(async move {
            let mut framed = FramedWrite::new(stream, ParcelCodec);
            while let Some(parcel) = rx.recv().await {
                if let Err(err) = framed.send(parcel).await {
                    log::debug!("[Server] conn {conn_id} notify write failed: {err}");
                    break;
                }
            }
        });
    }
}

impl Notifier for Connection {
    fn alive(&self) -> bool {
        self.is_alive()
    }

    fn notify(&self, event: i32, result: i32, extra: &str) {
        let mut parcel = Parcel::with_code(PARCEL_NOTIFY);
        parcel.append_i32(event);
        parcel.append_i32(result);
        parcel.append_str(extra);
        let guard = self.notify_tx.lock();
        match guard.as_ref() {
            Some(tx) => {
                if tx.send(parcel).is_err() {
                    log::debug!("[Server] conn {} notify channel gone", self.conn_id);
                }
            }
            None => log::debug!("[Server] conn {} has no notify channel", self.conn_id),
        }
    }

    /// Drops the sender; the writer drains what is queued, then closes the
    /// socket.
    fn finalize(&self) {
        self.notify_tx.lock().take();
    }
}

/// Fixed-size connection table.
///
/// A slot is reusable only when its previous occupant's transport *and*
/// notify side are both down; a "closing" connection (transport gone,
/// notify still draining) keeps its slot.
pub(crate) struct ConnTable {
    slots: Vec<Mutex<Option<Arc<Connection>>>>,
}

impl ConnTable {
    pub fn new(capacity: usize) -> Self {
        Self {
            slots: (0..capacity).map(|_| Mutex::new(None)).collect(),
        }
    }

    /// Claims a free slot for a fresh connection.
    pub fn claim(&self, conn_id: u64) -> Option<Arc<Connection>> {
        for (index, slot) in self.slots.iter().enumerate() {
            let mut slot = slot.lock();
            let free = match slot.as_ref() {
                None => true,
                Some(old) => !old.is_alive() && !old.notify_open(),
            };
            if free {
                let conn = Arc::new(Connection::new(index, conn_id));
                *slot = Some(conn.clone());
                return Some(conn);
            }
        }
        None
    }

    /// Releases a slot after harvest. The slot only frees up for reuse
    /// once the notify side is gone too (checked at claim time).
    pub fn release(&self, conn: &Arc<Connection>) {
        let mut slot = self.slots[conn.slot].lock();
        if let Some(current) = slot.as_ref() {
            if Arc::ptr_eq(current, conn) && !conn.notify_open() {
                *slot = None;
            }
        }
    }

    pub fn active_count(&self) -> usize {
        self.slots
            .iter()
            .filter(|slot| slot.lock().as_ref().map(|c| c.is_alive()).unwrap_or(false))
            .count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn table_hands_out_distinct_slots_until_full() {
        let table = ConnTable::new(2);
        let a = table.claim(1).unwrap();
        let b = table.claim(2).unwrap();
        assert_ne!(a.slot, b.slot);
        assert!(table.claim(3).is_none());
        assert_eq!(table.active_count(), 2);
    }

    #[test]
    fn dead_connection_frees_its_slot() {
        let table = ConnTable::new(1);
        let a = table.claim(1).unwrap();
        a.set_dead();
        let b = table.claim(2).unwrap();
        assert_eq!(b.slot, a.slot);
    }

    #[tokio::test]
    async fn closing_connection_keeps_its_slot_until_notify_drains() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = crate::transport::TransportConfig {
            local_cpu: "ap".into(),
            socket_dir: dir.path().to_path_buf(),
            ..Default::default()
        };
        let (listener, key) = crate::transport::bind_reverse(&cfg, "ap").unwrap();

        let table = ConnTable::new(1);
        let a = table.claim(1).unwrap();
        let (dialed, _accepted) =
            tokio::join!(crate::transport::dial_back(&cfg, "ap", &key), listener.accept());
        a.install_notify(dialed.unwrap());

        // Transport down, notify still open: slot is not reusable.
        a.set_dead();
        assert!(table.claim(2).is_none());

        // Finalize drops the notify side; slot frees up.
        a.finalize();
        assert!(table.claim(3).is_some());
    }

    #[test]
    fn data_cookie_round_trips() {
        let conn = Connection::new(0, 9);
        assert_eq!(conn.data(), ConnData::None);
        conn.set_data(ConnData::Focus(3));
        assert_eq!(conn.data(), ConnData::Focus(3));
    }
}
