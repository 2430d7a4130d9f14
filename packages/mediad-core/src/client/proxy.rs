//! Event-loop-driven RPC proxy.
//!
//! The proxy hides three things from callers: multi-CPU server discovery
//! (a candidate list tried in order), connection setup latency (writes
//! queue until the first command's reply proves the server real) and the
//! reverse-notify handshake. Outgoing command order is causal: replies are
//! matched FIFO against the sent queue, and nothing overtakes a queued
//! write.
//!
//! All state lives in an owner task; [`RpcProxy`] is a cheap handle.
//! Reply hooks run *inside* the task, so a hook can flip the reconnect /
//! listen / disconnect state before the proxy acts on the reply it just
//! delivered; that window is what makes deferred-write semantics exact.

use std::collections::VecDeque;
use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use futures::{SinkExt, StreamExt};
use tokio::io::AsyncWriteExt;
use tokio::sync::{mpsc, oneshot};
use tokio_util::codec::Framed;

use crate::defs::{PARCEL_CREATE_NOTIFY, PARCEL_SEND_ACK};
use crate::error::{MediaError, MediaResult};
use crate::parcel::{Parcel, ParcelCodec};
use crate::transport::{bind_reverse, dial_control, RpcListener, RpcStream, TransportConfig};

const CONNECTING: u8 = 1;
const LISTENING: u8 = 2;
const RECONNECT: u8 = 4;
const DISCONNECT: u8 = 8;

/// Callback invoked in the proxy task with the reply (or `None` when the
/// write was cancelled by disconnect). The control handle lets the hook
/// queue follow-up work before the proxy processes post-reply flags.
pub type ReplyHook = Box<dyn FnOnce(&mut dyn ProxyControl, Option<Parcel>) + Send>;

/// Operations available from inside a reply hook.
pub trait ProxyControl {
    /// Queues a command write (always `SEND_ACK`).
    fn send(&mut self, parcel: Parcel, hook: Option<ReplyHook>);
    /// Requests the reverse-listener handshake.
    fn listen(&mut self, events: mpsc::UnboundedSender<Parcel>) -> MediaResult<()>;
    /// Advances to the next candidate CPU. Refused once a listener exists.
    fn reconnect(&mut self) -> MediaResult<()>;
    /// Starts the shutdown-then-drain teardown.
    fn disconnect(&mut self);
}

/// Stream of connection outcomes: one entry per dial attempt (initial
/// connect and every reconnect).
pub type ConnectEvents = mpsc::UnboundedReceiver<MediaResult<()>>;

enum ProxyCmd {
    Send { parcel: Parcel, hook: Option<ReplyHook> },
    Listen {
        events: mpsc::UnboundedSender<Parcel>,
        result: oneshot::Sender<MediaResult<()>>,
    },
    Reconnect { result: oneshot::Sender<MediaResult<()>> },
    Disconnect { done: oneshot::Sender<()> },
}

/// Handle to the proxy task.
#[derive(Debug)]
pub struct RpcProxy {
    cmd_tx: mpsc::UnboundedSender<ProxyCmd>,
    disconnected: Arc<AtomicBool>,
}

impl RpcProxy {
    /// Spawns the proxy and dials the head of the comma/semicolon-delimited
    /// `cpus` candidate list. The first entry of the returned
    /// [`ConnectEvents`] carries the outcome of that dial.
    pub fn connect(
        transport: Arc<TransportConfig>,
        cpus: &str,
    ) -> MediaResult<(Self, ConnectEvents)> {
        let candidates: VecDeque<String> = cpus
            .split([',', ';', ' ', '\t', '\n'])
            .filter(|s| !s.is_empty())
            .map(str::to_owned)
            .collect();
        if candidates.is_empty() {
            return Err(MediaError::InvalidArgument("empty cpu list".into()));
        }

        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        let (connect_tx, connect_rx) = mpsc::unbounded_channel();
        let disconnected = Arc::new(AtomicBool::new(false));

        let task = ProxyTask {
            transport,
            candidates,
            current_cpu: None,
            cmd_rx,
            cmd_closed: false,
            cpipe: None,
            epipe: None,
            pending_listener: None,
            connect_tx,
            event_tx: None,
            listen_result: None,
            pending: VecDeque::new(),
            sent: VecDeque::new(),
            outbox: VecDeque::new(),
            flags: 0,
            deferred_listen: false,
            deferred_reconnect: false,
            deferred_shutdown: false,
            release: Vec::new(),
            disconnected: disconnected.clone(),
        };
        tokio::spawn(task.run());

        Ok((Self { cmd_tx, disconnected }, connect_rx))
    }

    /// Queues a command; the hook fires with the reply or with `None` on
    /// cancellation.
    pub fn send_with(&self, mut parcel: Parcel, hook: Option<ReplyHook>) -> MediaResult<()> {
        if self.disconnected.load(Ordering::SeqCst) {
            return Err(MediaError::PermissionDenied);
        }
        parcel.set_code(PARCEL_SEND_ACK);
        self.cmd_tx
            .send(ProxyCmd::Send { parcel, hook })
            .map_err(|_| MediaError::Closed)
    }

    /// Queues a command and returns a future for its reply.
    ///
    /// The future resolves to `None` when the write was cancelled.
    pub fn send(&self, parcel: Parcel) -> MediaResult<oneshot::Receiver<Option<Parcel>>> {
        let (tx, rx) = oneshot::channel();
        let hook: ReplyHook = Box::new(move |_ctl, reply| {
            let _ = tx.send(reply);
        });
        self.send_with(parcel, Some(hook))?;
        Ok(rx)
    }

    /// Round trip: send and await the reply parcel.
    pub async fn call(&self, parcel: Parcel) -> MediaResult<Parcel> {
        let rx = self.send(parcel)?;
        match rx.await {
            Ok(Some(reply)) => Ok(reply),
            _ => Err(MediaError::Cancelled),
        }
    }

    /// Performs the reverse-listener handshake and returns the event
    /// stream. Resolves once the daemon has dialed back.
    pub async fn listen(&self) -> MediaResult<mpsc::UnboundedReceiver<Parcel>> {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (result_tx, result_rx) = oneshot::channel();
        self.cmd_tx
            .send(ProxyCmd::Listen { events: events_tx, result: result_tx })
            .map_err(|_| MediaError::Closed)?;
        result_rx.await.map_err(|_| MediaError::Cancelled)??;
        Ok(events_rx)
    }

    /// Requests fail-over to the next candidate CPU. The dial outcome
    /// arrives on the [`ConnectEvents`] stream.
    pub async fn reconnect(&self) -> MediaResult<()> {
        let (result_tx, result_rx) = oneshot::channel();
        self.cmd_tx
            .send(ProxyCmd::Reconnect { result: result_tx })
            .map_err(|_| MediaError::Closed)?;
        result_rx.await.map_err(|_| MediaError::Cancelled)?
    }

    /// Half-closes the command pipe and resolves once both pipes reported
    /// EOF and every outstanding write was cancelled.
    pub async fn disconnect(self) -> MediaResult<()> {
        let (done_tx, done_rx) = oneshot::channel();
        self.cmd_tx
            .send(ProxyCmd::Disconnect { done: done_tx })
            .map_err(|_| MediaError::Closed)?;
        let _ = done_rx.await;
        Ok(())
    }
}

struct Write {
    parcel: Parcel,
    hook: Option<ReplyHook>,
}

struct ProxyTask {
    transport: Arc<TransportConfig>,
    candidates: VecDeque<String>,
    current_cpu: Option<String>,
    cmd_rx: mpsc::UnboundedReceiver<ProxyCmd>,
    cmd_closed: bool,
    cpipe: Option<Framed<RpcStream, ParcelCodec>>,
    epipe: Option<Framed<RpcStream, ParcelCodec>>,
    pending_listener: Option<RpcListener>,
    connect_tx: mpsc::UnboundedSender<MediaResult<()>>,
    event_tx: Option<mpsc::UnboundedSender<Parcel>>,
    listen_result: Option<oneshot::Sender<MediaResult<()>>>,
    /// Writes waiting for the proxy to become ready.
    pending: VecDeque<Write>,
    /// Hooks of writes on the wire, FIFO-matched against replies.
    sent: VecDeque<Option<ReplyHook>>,
    /// Writes queued by hooks, drained right after the hook returns.
    outbox: VecDeque<Write>,
    flags: u8,
    deferred_listen: bool,
    deferred_reconnect: bool,
    deferred_shutdown: bool,
    release: Vec<oneshot::Sender<()>>,
    disconnected: Arc<AtomicBool>,
}

async fn next_or_never(
    framed: &mut Option<Framed<RpcStream, ParcelCodec>>,
) -> Option<Result<Parcel, io::Error>> {
    match framed {
        Some(framed) => framed.next().await,
        None => std::future::pending().await,
    }
}

async fn accept_or_never(listener: &Option<RpcListener>) -> io::Result<RpcStream> {
    match listener {
        Some(listener) => listener.accept().await,
        None => std::future::pending().await,
    }
}

async fn recv_or_never(
    rx: &mut mpsc::UnboundedReceiver<ProxyCmd>,
    closed: bool,
) -> Option<ProxyCmd> {
    if closed {
        std::future::pending().await
    } else {
        rx.recv().await
    }
}

/// One wake-up of the proxy task.
enum Step {
    Cmd(Option<ProxyCmd>),
    CommandFrame(Option<Result<Parcel, io::Error>>),
    EventFrame(Option<Result<Parcel, io::Error>>),
    Accepted(io::Result<RpcStream>),
}

impl ProxyTask {
    async fn run(mut self) {
        self.dial_next().await;
        loop {
            if self.finished() {
                break;
            }
            let step = tokio::select! {
                cmd = recv_or_never(&mut self.cmd_rx, self.cmd_closed) => Step::Cmd(cmd),
                frame = next_or_never(&mut self.cpipe) => Step::CommandFrame(frame),
                frame = next_or_never(&mut self.epipe) => Step::EventFrame(frame),
                accepted = accept_or_never(&self.pending_listener) => Step::Accepted(accepted),
            };
            match step {
                Step::Cmd(Some(cmd)) => {
                    self.handle_cmd(cmd);
                    self.drain_actions().await;
                }
                Step::Cmd(None) => {
                    // Every handle dropped without disconnect.
                    self.cmd_closed = true;
                    ProxyControl::disconnect(&mut self);
                    self.drain_actions().await;
                }
                Step::CommandFrame(frame) => {
                    match frame {
                        Some(Ok(parcel)) => self.on_reply(parcel).await,
                        _ => self.on_cpipe_closed(),
                    }
                    self.drain_actions().await;
                }
                Step::EventFrame(frame) => match frame {
                    Some(Ok(parcel)) => {
                        if let Some(tx) = &self.event_tx {
                            let _ = tx.send(parcel);
                        }
                    }
                    _ => {
                        self.epipe = None;
                        self.event_tx = None;
                    }
                },
                Step::Accepted(accepted) => {
                    self.on_accept(accepted).await;
                    self.drain_actions().await;
                }
            }
        }
        self.teardown();
    }

    fn finished(&self) -> bool {
        self.flags & DISCONNECT != 0
            && self.cpipe.is_none()
            && self.epipe.is_none()
            && self.pending_listener.is_none()
    }

    fn handle_cmd(&mut self, cmd: ProxyCmd) {
        match cmd {
            ProxyCmd::Send { parcel, hook } => ProxyControl::send(self, parcel, hook),
            ProxyCmd::Listen { events, result } => {
                match ProxyControl::listen(self, events) {
                    Ok(()) => self.listen_result = Some(result),
                    Err(err) => {
                        let _ = result.send(Err(err));
                    }
                }
            }
            ProxyCmd::Reconnect { result } => {
                let _ = result.send(ProxyControl::reconnect(self));
            }
            ProxyCmd::Disconnect { done } => {
                ProxyControl::disconnect(self);
                self.release.push(done);
            }
        }
    }

    /// A reply on the command pipe: deliver it, then process the flag
    /// transitions the first reply unlocks.
    async fn on_reply(&mut self, parcel: Parcel) {
        let was_connecting = self.flags & CONNECTING != 0;

        match self.sent.pop_front() {
            Some(Some(hook)) => hook(self, Some(parcel)),
            Some(None) => {}
            None => {
                log::warn!("[Proxy] reply without outstanding write");
            }
        }

        if was_connecting {
            self.flags &= !CONNECTING;
            if self.flags == LISTENING {
                self.start_listen().await;
            }
            if self.flags & LISTENING == 0 && self.flags & RECONNECT == 0 {
                self.flush_pending().await;
            }
            if self.flags & DISCONNECT != 0 {
                self.cpipe = None;
            } else if self.flags & RECONNECT != 0 {
                self.flags &= !RECONNECT;
                self.reconnect_next().await;
            }
        }
    }

    fn on_cpipe_closed(&mut self) {
        self.cpipe = None;
    }

    async fn on_accept(&mut self, accepted: io::Result<RpcStream>) {
        self.pending_listener = None;
        self.flags &= !LISTENING;
        match accepted {
            Ok(stream) if self.flags & DISCONNECT == 0 => {
                self.epipe = Some(Framed::new(stream, ParcelCodec));
                if let Some(result) = self.listen_result.take() {
                    let _ = result.send(Ok(()));
                }
                self.flush_pending().await;
            }
            Ok(_) => self.fail_listen(MediaError::Cancelled),
            Err(err) => self.fail_listen(MediaError::Io(err)),
        }
    }

    fn fail_listen(&mut self, err: MediaError) {
        self.event_tx = None;
        if let Some(result) = self.listen_result.take() {
            let _ = result.send(Err(err));
        }
    }

    async fn drain_actions(&mut self) {
        while let Some(write) = self.outbox.pop_front() {
            self.queue_write(write).await;
        }
        if std::mem::take(&mut self.deferred_listen) {
            self.start_listen().await;
        }
        if std::mem::take(&mut self.deferred_reconnect) {
            self.reconnect_next().await;
        }
        if std::mem::take(&mut self.deferred_shutdown) {
            self.shutdown_cpipe().await;
        }
    }

    /// Direct write when the proxy is settled, or during connect for the
    /// probe command; everything else waits in the pending queue.
    async fn queue_write(&mut self, write: Write) {
        let direct = self.flags == 0 || (self.flags == CONNECTING && self.sent.is_empty());
        if direct {
            self.send_now(write).await;
        } else {
            self.pending.push_back(write);
        }
    }

    async fn send_now(&mut self, write: Write) {
        let Write { parcel, hook } = write;
        let sent = match self.cpipe.as_mut() {
            Some(framed) => framed.send(parcel).await.is_ok(),
            None => false,
        };
        if sent {
            self.sent.push_back(hook);
        } else if let Some(hook) = hook {
            // No response will come; cancel right away.
            hook(self, None);
        }
    }

    async fn flush_pending(&mut self) {
        while let Some(write) = self.pending.pop_front() {
            self.send_now(write).await;
        }
    }

    async fn dial_next(&mut self) {
        match self.candidates.pop_front() {
            Some(cpu) => {
                self.flags |= CONNECTING;
                match dial_control(&self.transport, &cpu).await {
                    Ok(stream) => {
                        self.cpipe = Some(Framed::new(stream, ParcelCodec));
                        self.current_cpu = Some(cpu);
                        let _ = self.connect_tx.send(Ok(()));
                    }
                    Err(err) => {
                        self.flags &= !CONNECTING;
                        let _ = self.connect_tx.send(Err(err));
                    }
                }
            }
            None => {
                let _ = self
                    .connect_tx
                    .send(Err(MediaError::NotFound("cpu list exhausted".into())));
            }
        }
    }

    async fn reconnect_next(&mut self) {
        self.cpipe = None;
        self.dial_next().await;
    }

    /// Binds the reverse listener and asks the server to dial back.
    async fn start_listen(&mut self) {
        let server_cpu = self.current_cpu.clone().unwrap_or_default();
        let bound = bind_reverse(&self.transport, &server_cpu);
        let (listener, key) = match bound {
            Ok(pair) => pair,
            Err(err) => return self.fail_listen(err),
        };

        let mut handshake = Parcel::with_code(PARCEL_CREATE_NOTIFY);
        handshake.append_str(&key);
        handshake.append_str(&self.transport.local_cpu);

        let sent = match self.cpipe.as_mut() {
            Some(framed) => framed.send(handshake).await.is_ok(),
            None => false,
        };
        if !sent {
            return self.fail_listen(MediaError::Closed);
        }
        self.pending_listener = Some(listener);
        self.flags |= LISTENING;
    }

    async fn shutdown_cpipe(&mut self) {
        if let Some(framed) = self.cpipe.as_mut() {
            let _ = framed.get_mut().shutdown().await;
        }
    }

    /// Cancels every unanswered write in send order and releases waiters.
    fn teardown(mut self) {
        let sent: Vec<Option<ReplyHook>> = self.sent.drain(..).collect();
        let pending: Vec<Write> = self.pending.drain(..).collect();
        for hook in sent.into_iter().flatten() {
            hook(&mut self, None);
        }
        for write in pending {
            if let Some(hook) = write.hook {
                hook(&mut self, None);
            }
        }
        for done in self.release.drain(..) {
            let _ = done.send(());
        }
        log::debug!("[Proxy] released");
    }
}

impl ProxyControl for ProxyTask {
    fn send(&mut self, mut parcel: Parcel, hook: Option<ReplyHook>) {
        if self.flags & DISCONNECT != 0 {
            // Never reaches the wire; cancelled at teardown.
            if let Some(hook) = hook {
                self.pending.push_back(Write { parcel, hook: Some(hook) });
            }
            return;
        }
        parcel.set_code(PARCEL_SEND_ACK);
        self.outbox.push_back(Write { parcel, hook });
    }

    fn listen(&mut self, events: mpsc::UnboundedSender<Parcel>) -> MediaResult<()> {
        if self.epipe.is_some()
            || self.pending_listener.is_some()
            || self.flags & LISTENING != 0
        {
            return Err(MediaError::Busy);
        }
        self.event_tx = Some(events);
        if self.flags == 0 {
            self.deferred_listen = true;
        } else {
            self.flags |= LISTENING;
        }
        Ok(())
    }

    fn reconnect(&mut self) -> MediaResult<()> {
        if self.epipe.is_some() || self.pending_listener.is_some() || self.event_tx.is_some() {
            return Err(MediaError::Busy);
        }
        if self.flags == 0 {
            self.deferred_reconnect = true;
        } else {
            self.flags |= RECONNECT;
        }
        Ok(())
    }

    fn disconnect(&mut self) {
        if self.flags & DISCONNECT != 0 {
            return;
        }
        let was_settled = self.flags == 0;
        self.flags |= DISCONNECT;
        self.disconnected.store(true, Ordering::SeqCst);
        if was_settled {
            self.deferred_shutdown = true;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::{focus_request, parse_reply};
    use crate::defs::{PARCEL_NOTIFY, PARCEL_REPLY};
    use crate::transport::bind_local;
    use parking_lot::Mutex;
    use std::time::Duration;

    type Wire = Framed<RpcStream, ParcelCodec>;

    fn test_transport(dir: &std::path::Path) -> Arc<TransportConfig> {
        Arc::new(TransportConfig {
            local_cpu: "ap".into(),
            socket_dir: dir.to_path_buf(),
            rpc_port: -1,
            inet_port: -1,
            peers: Default::default(),
        })
    }

    fn request(tag: &str) -> Parcel {
        focus_request(tag, "request")
    }

    fn reply(ret: i32) -> Parcel {
        let mut p = Parcel::with_code(PARCEL_REPLY);
        p.append_i32(ret);
        p.append_str("");
        p
    }

    /// Reads the request's target string back out for identification.
    fn request_tag(parcel: &mut Parcel) -> String {
        let _module = parcel.read_i32().unwrap();
        parcel.read_string().unwrap()
    }

    async fn expect_frame(wire: &mut Wire) -> Parcel {
        tokio::time::timeout(Duration::from_secs(2), wire.next())
            .await
            .expect("frame timeout")
            .expect("stream open")
            .expect("clean frame")
    }

    async fn expect_quiet(wire: &mut Wire) {
        let outcome = tokio::time::timeout(Duration::from_millis(100), wire.next()).await;
        assert!(outcome.is_err(), "unexpected frame on the wire");
    }

    struct Rig {
        _dir: tempfile::TempDir,
        transport: Arc<TransportConfig>,
        proxy: RpcProxy,
        events: ConnectEvents,
        server: Wire,
    }

    async fn rig_with_cpus(cpus: &str) -> Rig {
        let dir = tempfile::tempdir().unwrap();
        let transport = test_transport(dir.path());
        let listener = bind_local(&transport).unwrap();
        let (proxy, mut events) = RpcProxy::connect(transport.clone(), cpus).unwrap();
        let (accepted, connected) = tokio::join!(listener.accept(), events.recv());
        connected.unwrap().unwrap();
        Rig {
            _dir: dir,
            transport,
            proxy,
            events,
            server: Framed::new(accepted.unwrap(), ParcelCodec),
        }
    }

    async fn rig() -> Rig {
        rig_with_cpus("ap").await
    }

    #[tokio::test]
    async fn pending_writes_wait_for_the_first_reply() {
        let mut r = rig().await;

        // First command goes straight to the wire.
        let r1 = r.proxy.send(request("one")).unwrap();
        let mut f1 = expect_frame(&mut r.server).await;
        assert_eq!(request_tag(&mut f1), "one");

        // Later commands stay pending while the probe is outstanding.
        let r2 = r.proxy.send(request("two")).unwrap();
        let r3 = r.proxy.send(request("three")).unwrap();
        expect_quiet(&mut r.server).await;

        // The reply releases them in order.
        r.server.send(reply(0)).await.unwrap();
        let reply1 = r1.await.unwrap().unwrap();
        parse_reply(reply1).unwrap();

        let mut f2 = expect_frame(&mut r.server).await;
        assert_eq!(request_tag(&mut f2), "two");
        let mut f3 = expect_frame(&mut r.server).await;
        assert_eq!(request_tag(&mut f3), "three");

        r.server.send(reply(0)).await.unwrap();
        r.server.send(reply(0)).await.unwrap();
        assert!(r2.await.unwrap().is_some());
        assert!(r3.await.unwrap().is_some());
    }

    #[tokio::test]
    async fn replies_match_sends_in_fifo_order() {
        let mut r = rig().await;

        let r1 = r.proxy.send(request("a")).unwrap();
        expect_frame(&mut r.server).await;
        r.server.send(reply(0)).await.unwrap();
        r1.await.unwrap().unwrap();

        // Settled proxy: everything goes direct, replies match in order.
        let rx: Vec<_> = (0..3)
            .map(|i| r.proxy.send(request(&format!("n{i}"))).unwrap())
            .collect();
        for i in 0..3 {
            let mut frame = expect_frame(&mut r.server).await;
            assert_eq!(request_tag(&mut frame), format!("n{i}"));
            r.server.send(reply(100 + i)).await.unwrap();
        }
        for (i, rx) in rx.into_iter().enumerate() {
            let mut parcel = rx.await.unwrap().unwrap();
            assert_eq!(parcel.read_i32().unwrap(), 100 + i as i32);
        }
    }

    #[tokio::test]
    async fn reconnect_inside_hook_defers_queued_writes_to_the_next_cpu() {
        // Two candidates: "ap" over unix, "bp" over loopback tcp.
        let dir = tempfile::tempdir().unwrap();
        let std_listener = std::net::TcpListener::bind(("127.0.0.1", 0)).unwrap();
        std_listener.set_nonblocking(true).unwrap();
        let port = std_listener.local_addr().unwrap().port();
        let tcp_listener = tokio::net::TcpListener::from_std(std_listener).unwrap();

        let transport = Arc::new(TransportConfig {
            local_cpu: "ap".into(),
            socket_dir: dir.path().to_path_buf(),
            rpc_port: port as i32,
            inet_port: -1,
            peers: [("bp".to_string(), "127.0.0.1".to_string())].into(),
        });
        let unix_listener = bind_local(&transport).unwrap();

        let (proxy, mut events) = RpcProxy::connect(transport.clone(), "ap,bp").unwrap();
        let (accepted, connected) = tokio::join!(unix_listener.accept(), events.recv());
        connected.unwrap().unwrap();
        let mut server_a: Wire = Framed::new(accepted.unwrap(), ParcelCodec);

        // Probe command whose hook fails over on a NotFound reply.
        let (probe_tx, probe_rx) = oneshot::channel();
        let hook: ReplyHook = Box::new(move |ctl, parcel| {
            let failed = parcel
                .as_ref()
                .map(|p| {
                    let mut p = p.clone();
                    p.read_i32().unwrap_or(0) < 0
                })
                .unwrap_or(true);
            if failed {
                ctl.reconnect().unwrap();
            }
            let _ = probe_tx.send(failed);
        });
        proxy.send_with(request("probe"), Some(hook)).unwrap();

        // Two more writes queue behind the probe.
        let r2 = proxy.send(request("two")).unwrap();
        let r3 = proxy.send(request("three")).unwrap();

        expect_frame(&mut server_a).await;
        server_a.send(reply(-libc::ENOENT)).await.unwrap();
        assert!(probe_rx.await.unwrap());

        // The proxy abandons A and dials B; the queued writes stay put.
        let (accepted, connected) =
            tokio::join!(tcp_listener.accept(), events.recv());
        connected.unwrap().unwrap();
        let (tcp_stream, _) = accepted.unwrap();
        let mut server_b: Wire = Framed::new(RpcStream::Tcp(tcp_stream), ParcelCodec);
        expect_quiet(&mut server_b).await;

        // A fresh probe on B unlocks the deferred writes.
        let r4 = proxy.send(request("four")).unwrap();
        let mut f4 = expect_frame(&mut server_b).await;
        assert_eq!(request_tag(&mut f4), "four");
        server_b.send(reply(0)).await.unwrap();
        r4.await.unwrap().unwrap();

        let mut f2 = expect_frame(&mut server_b).await;
        assert_eq!(request_tag(&mut f2), "two");
        let mut f3 = expect_frame(&mut server_b).await;
        assert_eq!(request_tag(&mut f3), "three");
        server_b.send(reply(0)).await.unwrap();
        server_b.send(reply(0)).await.unwrap();
        assert!(r2.await.unwrap().is_some());
        assert!(r3.await.unwrap().is_some());
    }

    #[tokio::test]
    async fn reconnect_exhausting_the_list_reports_not_found() {
        let mut r = rig().await;

        let r1 = r.proxy.send(request("x")).unwrap();
        expect_frame(&mut r.server).await;
        r.server.send(reply(0)).await.unwrap();
        r1.await.unwrap().unwrap();

        r.proxy.reconnect().await.unwrap();
        let outcome = r.events.recv().await.unwrap();
        assert!(matches!(outcome, Err(MediaError::NotFound(_))));
    }

    #[tokio::test]
    async fn listen_accepts_the_dial_back_and_delivers_events() {
        let mut r = rig().await;

        // Settle the connection first.
        let r1 = r.proxy.send(request("x")).unwrap();
        expect_frame(&mut r.server).await;
        r.server.send(reply(0)).await.unwrap();
        r1.await.unwrap().unwrap();

        // listen(): the server receives CREATE_NOTIFY and dials back.
        let transport = r.transport.clone();
        let listen = r.proxy.listen();
        tokio::pin!(listen);

        let mut handshake = loop {
            tokio::select! {
                frame = r.server.next() => break frame.unwrap().unwrap(),
                _ = &mut listen => panic!("listen resolved before dial-back"),
            }
        };
        assert_eq!(handshake.code(), PARCEL_CREATE_NOTIFY);
        let key = handshake.read_string().unwrap();
        let cpu = handshake.read_string().unwrap();
        assert_eq!(cpu, "ap");

        let (dialed, listened) = tokio::join!(
            crate::transport::dial_back(&transport, &cpu, &key),
            listen
        );
        let mut notify_wire: Wire = Framed::new(dialed.unwrap(), ParcelCodec);
        let mut events = listened.unwrap();

        let mut note = Parcel::with_code(PARCEL_NOTIFY);
        note.append_i32(4);
        note.append_i32(0);
        note.append_str("duck");
        notify_wire.send(note).await.unwrap();

        let mut delivered = events.recv().await.unwrap();
        assert_eq!(delivered.code(), PARCEL_NOTIFY);
        assert_eq!(delivered.read_i32().unwrap(), 4);

        // A second listener and reconnect are both refused now.
        assert!(matches!(r.proxy.listen().await, Err(MediaError::Busy)));
        assert!(matches!(r.proxy.reconnect().await, Err(MediaError::Busy)));
    }

    #[tokio::test]
    async fn disconnect_cancels_unanswered_writes_in_send_order() {
        let mut r = rig().await;

        let order = Arc::new(Mutex::new(Vec::new()));
        let mk_hook = |tag: &'static str| -> ReplyHook {
            let order = order.clone();
            Box::new(move |_ctl, parcel| {
                order.lock().push((tag, parcel.is_none()));
            })
        };

        r.proxy.send_with(request("a"), Some(mk_hook("a"))).unwrap();
        r.proxy.send_with(request("b"), Some(mk_hook("b"))).unwrap();
        r.proxy.send_with(request("c"), Some(mk_hook("c"))).unwrap();

        // Only "a" reached the wire; the server never answers.
        expect_frame(&mut r.server).await;

        // The proxy is still in its connecting phase, so disconnect waits
        // for the pipes to close; the server dropping its side finishes it.
        let proxy = r.proxy;
        let disconnect = tokio::spawn(async move { proxy.disconnect().await });
        tokio::time::sleep(Duration::from_millis(50)).await;
        drop(r.server);
        disconnect.await.unwrap().unwrap();

        let seen = order.lock().clone();
        assert_eq!(
            seen,
            vec![("a", true), ("b", true), ("c", true)],
            "cancellations keep send order"
        );
    }

    #[tokio::test]
    async fn send_after_disconnect_is_refused() {
        let r = rig().await;
        let proxy = r.proxy;
        let disconnected = proxy.disconnected.clone();
        let handle = RpcProxy { cmd_tx: proxy.cmd_tx.clone(), disconnected };

        let disconnect = proxy.disconnect();
        tokio::pin!(disconnect);
        // The disconnect resolves once the server side hangs up.
        let mut server = r.server;
        tokio::select! {
            _ = &mut disconnect => {}
            frame = server.next() => {
                assert!(frame.is_none());
                drop(server);
                disconnect.await.unwrap();
            }
        }

        assert!(matches!(
            handle.send(request("late")),
            Err(MediaError::PermissionDenied)
        ));
    }
}
