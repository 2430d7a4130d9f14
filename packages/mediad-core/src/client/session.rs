//! Typed session clients: controller and controllee sides.

use std::sync::Arc;

use tokio::sync::mpsc;

use crate::client::proxy::RpcProxy;
use crate::client::{control_request, parse_event, parse_reply};
use crate::defs::ModuleId;
use crate::error::{MediaError, MediaResult};
use crate::session::Metadata;
use crate::transport::TransportConfig;

/// `(event, result, extra)` notification delivered to a session peer.
pub type SessionEvent = (i32, i32, String);

async fn connect(transport: Arc<TransportConfig>, cpus: &str) -> MediaResult<RpcProxy> {
    let (proxy, mut connects) = RpcProxy::connect(transport, cpus)?;
    connects.recv().await.ok_or(MediaError::Cancelled)??;
    Ok(proxy)
}

async fn session_call(proxy: &RpcProxy, target: &str, cmd: &str, arg: &str) -> MediaResult<String> {
    let reply = proxy
        .call(control_request(ModuleId::Session, target, cmd, arg))
        .await?;
    let (_, response) = parse_reply(reply)?;
    Ok(response)
}

fn spawn_event_pump(
    mut parcels: mpsc::UnboundedReceiver<crate::parcel::Parcel>,
) -> mpsc::UnboundedReceiver<SessionEvent> {
    let (tx, rx) = mpsc::unbounded_channel();
    tokio::spawn(async move {
        while let Some(mut parcel) = parcels.recv().await {
            match parse_event(&mut parcel) {
                Ok(event) => {
                    if tx.send(event).is_err() {
                        break;
                    }
                }
                Err(_) => break,
            }
        }
    });
    rx
}

/// Remote-control surface: sends transport commands, watches state.
pub struct SessionClient {
    proxy: RpcProxy,
}

impl SessionClient {
    /// Opens a controller on the first reachable CPU.
    pub async fn open(transport: Arc<TransportConfig>, cpus: &str) -> MediaResult<Self> {
        let proxy = connect(transport, cpus).await?;
        session_call(&proxy, "", "open", "").await?;
        Ok(Self { proxy })
    }

    /// Subscribes to backward events from the most active controllee.
    pub async fn subscribe(&self) -> MediaResult<mpsc::UnboundedReceiver<SessionEvent>> {
        let parcels = self.proxy.listen().await?;
        session_call(&self.proxy, "", "set_event", "").await?;
        Ok(spawn_event_pump(parcels))
    }

    /// Sends a transport command (`start`, `pause`, `next`, ...).
    pub async fn transact(&self, cmd: &str, arg: &str) -> MediaResult<()> {
        session_call(&self.proxy, "", cmd, arg).await?;
        Ok(())
    }

    /// Fetches the most active controllee's metadata.
    pub async fn query(&self) -> MediaResult<Metadata> {
        let response = session_call(&self.proxy, "", "query", "").await?;
        Metadata::deserialize(&response)
    }

    pub async fn close(self) -> MediaResult<()> {
        session_call(&self.proxy, "", "close", "").await?;
        self.proxy.disconnect().await
    }
}

/// Media producer publishing its playback state for remote control.
pub struct ControlleeClient {
    proxy: RpcProxy,
}

impl ControlleeClient {
    /// Registers a controllee on the first reachable CPU.
    pub async fn register(transport: Arc<TransportConfig>, cpus: &str) -> MediaResult<Self> {
        let proxy = connect(transport, cpus).await?;
        session_call(&proxy, "", "register", "").await?;
        Ok(Self { proxy })
    }

    /// Opens the reverse channel carrying forwarded control commands.
    pub async fn control_events(&self) -> MediaResult<mpsc::UnboundedReceiver<SessionEvent>> {
        let parcels = self.proxy.listen().await?;
        Ok(spawn_event_pump(parcels))
    }

    /// Publishes a metadata diff; masked fields overwrite the old record.
    pub async fn update(&self, diff: &Metadata) -> MediaResult<()> {
        session_call(&self.proxy, "", "update", &diff.serialize()).await?;
        Ok(())
    }

    /// Reports a status notification (forwarded only while most active).
    pub async fn event(&self, event: i32, result: i32, extra: &str) -> MediaResult<()> {
        session_call(&self.proxy, extra, "event", &format!("{event}:{result}")).await?;
        Ok(())
    }

    pub async fn unregister(self) -> MediaResult<()> {
        session_call(&self.proxy, "", "unregister", "").await?;
        self.proxy.disconnect().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::test_config;
    use crate::defs::{EVENT_CHANGED, EVENT_NEXT_SONG, EVENT_STARTED, METAFLAG_STATE};
    use crate::server::Daemon;
    use std::time::Duration;

    async fn start() -> (Daemon, Arc<TransportConfig>, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let cfg = test_config(dir.path());
        let transport = Arc::new(cfg.transport.clone());
        let daemon = Daemon::start(cfg).await.unwrap();
        (daemon, transport, dir)
    }

    async fn recv_event(
        rx: &mut mpsc::UnboundedReceiver<SessionEvent>,
    ) -> SessionEvent {
        tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .expect("event timeout")
            .expect("event stream open")
    }

    #[tokio::test]
    async fn most_active_switch_reaches_the_controller() {
        let (_daemon, transport, _dir) = start().await;

        let c1 = ControlleeClient::register(transport.clone(), "ap").await.unwrap();
        let c2 = ControlleeClient::register(transport.clone(), "ap").await.unwrap();

        let controller = SessionClient::open(transport.clone(), "ap").await.unwrap();
        let mut events = controller.subscribe().await.unwrap();

        // C2 starts playing and becomes most active.
        c2.update(&Metadata::new().with_state(1)).await.unwrap();
        let (event, result, _) = recv_event(&mut events).await;
        assert_eq!(event, EVENT_CHANGED);
        assert_eq!(result, METAFLAG_STATE as i32);

        // Status events from the new head are forwarded; C1 is mute.
        c2.event(EVENT_STARTED, 0, "").await.unwrap();
        let (event, _, _) = recv_event(&mut events).await;
        assert_eq!(event, EVENT_STARTED);
        c1.event(EVENT_STARTED, 0, "").await.unwrap();
        assert!(
            tokio::time::timeout(Duration::from_millis(100), events.recv())
                .await
                .is_err()
        );

        c1.unregister().await.unwrap();
        c2.unregister().await.unwrap();
        controller.close().await.unwrap();
    }

    #[tokio::test]
    async fn next_command_lands_on_the_head_controllee() {
        let (_daemon, transport, _dir) = start().await;

        let controllee = ControlleeClient::register(transport.clone(), "ap").await.unwrap();
        let mut control = controllee.control_events().await.unwrap();
        controllee
            .update(&Metadata::new().with_state(1).with_title("Tune"))
            .await
            .unwrap();

        let controller = SessionClient::open(transport.clone(), "ap").await.unwrap();
        controller.transact("next", "").await.unwrap();

        let (event, result, extra) = recv_event(&mut control).await;
        assert_eq!(event, EVENT_NEXT_SONG);
        assert_eq!(result, 0);
        assert_eq!(extra, "");

        // Query mirrors the published metadata.
        let meta = controller.query().await.unwrap();
        assert_eq!(meta.title.as_deref(), Some("Tune"));
        assert_eq!(meta.state, 1);

        let err = controller.transact("warp", "").await.unwrap_err();
        assert!(matches!(err, MediaError::Unsupported(_)));
    }

    #[tokio::test]
    async fn transact_without_controllee_is_not_found() {
        let (_daemon, transport, _dir) = start().await;
        let controller = SessionClient::open(transport, "ap").await.unwrap();
        let err = controller.transact("next", "").await.unwrap_err();
        assert!(matches!(err, MediaError::NotFound(_)));
    }
}
