//! Blocking client with mutex-serialized round trips.
//!
//! The old-style API: thread-agnostic, no event loop. Concurrent callers
//! serialize at the wire on a per-connection mutex, so replies always match
//! the request that is holding the lock. Events arrive on a dedicated
//! listener thread once [`SyncClient::set_event_cb`] installed one.

use std::sync::Arc;

use parking_lot::Mutex;

use crate::client::{control_request, focus_request, parse_event, parse_reply, policy_request};
use crate::defs::{
    ModuleId, PARCEL_CREATE_NOTIFY, PARCEL_NOTIFY, PARCEL_REPLY, PARCEL_SEND, PARCEL_SEND_ACK,
};
use crate::error::{MediaError, MediaResult};
use crate::parcel::Parcel;
use crate::transport::{bind_reverse_blocking, dial_control_blocking, SyncStream, TransportConfig};

/// Callback receiving `(event, result, extra)` notifications.
pub type EventCallback = Box<dyn Fn(i32, i32, &str) + Send + Sync>;

struct SyncInner {
    transport: Arc<TransportConfig>,
    cpu: String,
    wire: Mutex<SyncStream>,
    listener: Mutex<Option<std::thread::JoinHandle<()>>>,
}

/// Blocking connection to the daemon on one CPU.
#[derive(Clone)]
pub struct SyncClient {
    inner: Arc<SyncInner>,
}

impl SyncClient {
    /// Dials the first reachable CPU of the candidate list.
    pub fn connect(transport: Arc<TransportConfig>, cpus: &str) -> MediaResult<Self> {
        let mut last_err = MediaError::NotFound("empty cpu list".into());
        for cpu in cpus.split([',', ';', ' ', '\t', '\n']).filter(|s| !s.is_empty()) {
            match dial_control_blocking(&transport, cpu) {
                Ok(stream) => {
                    return Ok(Self {
                        inner: Arc::new(SyncInner {
                            transport,
                            cpu: cpu.to_string(),
                            wire: Mutex::new(stream),
                            listener: Mutex::new(None),
                        }),
                    });
                }
                Err(err) => last_err = err,
            }
        }
        Err(last_err)
    }

    /// CPU this client ended up connected to.
    pub fn cpu(&self) -> &str {
        &self.inner.cpu
    }

    /// One-way send without acknowledgement.
    pub fn send(&self, parcel: &mut Parcel) -> MediaResult<()> {
        let mut wire = self.inner.wire.lock();
        parcel.write_to(&mut *wire, PARCEL_SEND)
    }

    /// Send and block for the matching reply.
    pub fn send_with_ack(&self, parcel: &mut Parcel) -> MediaResult<Parcel> {
        let mut wire = self.inner.wire.lock();
        parcel.write_to(&mut *wire, PARCEL_SEND_ACK)?;
        let reply = Parcel::read_from(&mut *wire)?;
        if reply.code() != PARCEL_REPLY {
            return Err(MediaError::InvalidArgument(format!(
                "unexpected reply code {}",
                reply.code()
            )));
        }
        Ok(reply)
    }

    /// Formats, sends and parses one module command.
    pub fn once(
        &self,
        module: ModuleId,
        target: &str,
        cmd: &str,
        arg: &str,
        apply: bool,
    ) -> MediaResult<(i32, String)> {
        let mut parcel = match module {
            ModuleId::Focus => focus_request(target, cmd),
            ModuleId::Policy => policy_request(target, cmd, arg, apply),
            _ => control_request(module, target, cmd, arg),
        };
        let reply = self.send_with_ack(&mut parcel)?;
        parse_reply(reply)
    }

    /// Binds the reverse listener, asks the daemon to dial back and starts
    /// the listener thread delivering notifications to `callback`.
    pub fn set_event_cb(&self, callback: EventCallback) -> MediaResult<()> {
        let mut listener_slot = self.inner.listener.lock();
        if listener_slot.is_some() {
            return Err(MediaError::Busy);
        }

        let (listener, key) = bind_reverse_blocking(&self.inner.transport, &self.inner.cpu)?;
        {
            let mut wire = self.inner.wire.lock();
            let mut handshake = Parcel::new();
            handshake.append_str(&key);
            handshake.append_str(&self.inner.transport.local_cpu);
            handshake.write_to(&mut *wire, PARCEL_CREATE_NOTIFY)?;
        }

        let thread = std::thread::Builder::new()
            .name("md_listen".into())
            .spawn(move || {
                let mut stream = match listener.accept() {
                    Ok(stream) => stream,
                    Err(err) => {
                        log::debug!("[SyncClient] notify accept failed: {err}");
                        return;
                    }
                };
                loop {
                    let mut parcel = match Parcel::read_from(&mut stream) {
                        Ok(parcel) => parcel,
                        Err(_) => break,
                    };
                    if parcel.code() != PARCEL_NOTIFY {
                        break;
                    }
                    match parse_event(&mut parcel) {
                        Ok((event, result, extra)) => callback(event, result, &extra),
                        Err(_) => break,
                    }
                }
            })
            .map_err(MediaError::Io)?;
        *listener_slot = Some(thread);
        Ok(())
    }

    /// Half-closes the command socket so the daemon drops the connection;
    /// the listener thread ends when the daemon closes the notify side.
    pub fn disconnect(&self) -> MediaResult<()> {
        self.inner.wire.lock().shutdown_write()?;
        Ok(())
    }
}
