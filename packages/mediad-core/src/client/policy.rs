//! Typed policy client.

use std::sync::Arc;

use tokio::sync::mpsc;

use crate::client::proxy::RpcProxy;
use crate::client::{parse_event, parse_reply, policy_request};
use crate::error::{MediaError, MediaResult};
use crate::transport::TransportConfig;

/// `(value, literal)` criterion change notification.
pub type CriterionChange = (i32, String);

/// Asynchronous access to the routing-policy criterion store.
pub struct PolicyClient {
    proxy: RpcProxy,
}

impl PolicyClient {
    /// Connects to the first reachable CPU.
    pub async fn open(transport: Arc<TransportConfig>, cpus: &str) -> MediaResult<Self> {
        let (proxy, mut connects) = RpcProxy::connect(transport, cpus)?;
        connects.recv().await.ok_or(MediaError::Cancelled)??;
        // Probe so later writes are known to reach a live daemon.
        let reply = proxy.call(policy_request("", "ping", "", false)).await?;
        parse_reply(reply)?;
        Ok(Self { proxy })
    }

    async fn once(
        &self,
        name: &str,
        cmd: &str,
        value: &str,
        apply: bool,
    ) -> MediaResult<String> {
        let reply = self.proxy.call(policy_request(name, cmd, value, apply)).await?;
        let (_, response) = parse_reply(reply)?;
        Ok(response)
    }

    pub async fn set_int(&self, name: &str, value: i32, apply: bool) -> MediaResult<()> {
        self.once(name, "set_int", &value.to_string(), apply).await.map(drop)
    }

    pub async fn get_int(&self, name: &str) -> MediaResult<i32> {
        let response = self.once(name, "get_int", "", false).await?;
        response
            .parse()
            .map_err(|_| MediaError::InvalidArgument(format!("int '{response}'")))
    }

    pub async fn set_string(&self, name: &str, value: &str, apply: bool) -> MediaResult<()> {
        self.once(name, "set_string", value, apply).await.map(drop)
    }

    pub async fn get_string(&self, name: &str) -> MediaResult<String> {
        self.once(name, "get_string", "", false).await
    }

    pub async fn include(&self, name: &str, member: &str, apply: bool) -> MediaResult<()> {
        self.once(name, "include", member, apply).await.map(drop)
    }

    pub async fn exclude(&self, name: &str, member: &str, apply: bool) -> MediaResult<()> {
        self.once(name, "exclude", member, apply).await.map(drop)
    }

    pub async fn contain(&self, name: &str, member: &str) -> MediaResult<bool> {
        Ok(self.once(name, "contain", member, false).await? == "1")
    }

    pub async fn increase(&self, name: &str, apply: bool) -> MediaResult<()> {
        self.once(name, "increase", "", apply).await.map(drop)
    }

    pub async fn decrease(&self, name: &str, apply: bool) -> MediaResult<()> {
        self.once(name, "decrease", "", apply).await.map(drop)
    }

    /// Subscribes to changes of `name`, applied-value notifications only.
    pub async fn subscribe(
        &self,
        name: &str,
    ) -> MediaResult<mpsc::UnboundedReceiver<CriterionChange>> {
        let mut parcels = self.proxy.listen().await?;
        self.once(name, "subscribe", "", false).await?;
        let (tx, rx) = mpsc::unbounded_channel();
        tokio::spawn(async move {
            while let Some(mut parcel) = parcels.recv().await {
                match parse_event(&mut parcel) {
                    Ok((_, value, literal)) => {
                        if tx.send((value, literal)).is_err() {
                            break;
                        }
                    }
                    Err(_) => break,
                }
            }
        });
        Ok(rx)
    }

    pub async fn close(self) -> MediaResult<()> {
        self.proxy.disconnect().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::test_config;
    use crate::server::Daemon;
    use std::time::Duration;

    async fn start() -> (Daemon, Arc<TransportConfig>, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let cfg = test_config(dir.path());
        let transport = Arc::new(cfg.transport.clone());
        let daemon = Daemon::start(cfg).await.unwrap();
        (daemon, transport, dir)
    }

    #[tokio::test]
    async fn criterion_ops_round_trip() {
        let (_daemon, transport, _dir) = start().await;
        let policy = PolicyClient::open(transport, "ap").await.unwrap();

        assert_eq!(policy.get_string("AudioMode").await.unwrap(), "normal");
        policy.set_string("AudioMode", "ringtone", true).await.unwrap();
        assert_eq!(policy.get_int("AudioMode").await.unwrap(), 2);

        policy.include("UsingDevices", "speaker", true).await.unwrap();
        assert!(policy.contain("UsingDevices", "speaker").await.unwrap());
        policy.exclude("UsingDevices", "speaker", true).await.unwrap();
        assert!(!policy.contain("UsingDevices", "speaker").await.unwrap());

        policy.set_int("persist.media.Volume", 2, false).await.unwrap();
        policy.increase("persist.media.Volume", true).await.unwrap();
        assert_eq!(policy.get_int("persist.media.Volume").await.unwrap(), 3);

        policy.close().await.unwrap();
    }

    #[tokio::test]
    async fn subscription_sees_applied_changes() {
        let (_daemon, transport, _dir) = start().await;
        let watcher = PolicyClient::open(transport.clone(), "ap").await.unwrap();
        let mut changes = watcher.subscribe("AudioMode").await.unwrap();

        let writer = PolicyClient::open(transport, "ap").await.unwrap();
        writer.set_string("AudioMode", "phone", true).await.unwrap();

        let (value, literal) =
            tokio::time::timeout(Duration::from_secs(2), changes.recv())
                .await
                .unwrap()
                .unwrap();
        assert_eq!(value, 1);
        assert_eq!(literal, "phone");
    }
}
