//! Typed focus client over the async proxy.
//!
//! One client owns one focus grant: `request` connects, asks for focus,
//! and for requests that entered the stack opens the reverse channel so
//! later suggestions stream in as the stack changes around it.

use std::sync::Arc;

use tokio::sync::mpsc;

use crate::client::{focus_request, parse_reply};
use crate::client::proxy::RpcProxy;
use crate::defs::FocusSuggestion;
use crate::error::{MediaError, MediaResult};
use crate::transport::TransportConfig;

/// An outstanding focus request.
#[derive(Debug)]
pub struct FocusClient {
    proxy: RpcProxy,
}

impl FocusClient {
    /// Requests focus for `stream_type` on the first reachable CPU.
    ///
    /// Returns the client, the immediate suggestion, and a stream of
    /// follow-up suggestions (empty and closed for refused requests, which
    /// never enter the stack).
    pub async fn request(
        transport: Arc<TransportConfig>,
        cpus: &str,
        stream_type: &str,
    ) -> MediaResult<(Self, FocusSuggestion, mpsc::UnboundedReceiver<FocusSuggestion>)> {
        let (proxy, mut connects) = RpcProxy::connect(transport, cpus)?;
        connects.recv().await.ok_or(MediaError::Cancelled)??;

        let reply = proxy.call(focus_request(stream_type, "request")).await?;
        let (ret, _) = parse_reply(reply)?;
        let suggestion = FocusSuggestion::from_wire(ret)
            .ok_or_else(|| MediaError::InvalidArgument(format!("suggestion {ret}")))?;

        let (tx, rx) = mpsc::unbounded_channel();
        if suggestion != FocusSuggestion::Stop {
            let mut events = proxy.listen().await?;
            tokio::spawn(async move {
                while let Some(mut parcel) = events.recv().await {
                    let Ok(value) = parcel.read_i32() else { break };
                    match FocusSuggestion::from_wire(value) {
                        Some(suggestion) => {
                            if tx.send(suggestion).is_err() {
                                break;
                            }
                        }
                        None => break,
                    }
                }
            });
        }

        Ok((Self { proxy }, suggestion, rx))
    }

    /// Current top-of-stack stream type.
    pub async fn peek(&self) -> MediaResult<String> {
        let reply = self.proxy.call(focus_request("", "peek")).await?;
        let (_, name) = parse_reply(reply)?;
        Ok(name)
    }

    /// Releases the grant and tears the connection down.
    pub async fn abandon(self) -> MediaResult<()> {
        let reply = self.proxy.call(focus_request("", "abandon")).await?;
        parse_reply(reply)?;
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
    async fn duck_and_promote_through_the_typed_client() {
        let (_daemon, transport, _dir) = start().await;

        let (a, sug_a, mut a_suggestions) =
            FocusClient::request(transport.clone(), "ap", "Music").await.unwrap();
        assert_eq!(sug_a, FocusSuggestion::Play);
        assert_eq!(a.peek().await.unwrap(), "Music");

        let (b, sug_b, mut b_suggestions) =
            FocusClient::request(transport.clone(), "ap", "Music").await.unwrap();
        assert_eq!(sug_b, FocusSuggestion::PlayWithDuck);

        // A is told to duck under B's grant.
        let passive = tokio::time::timeout(Duration::from_secs(2), a_suggestions.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(passive, FocusSuggestion::PlayWithDuck);

        // Abandoning A promotes B to the top with a play suggestion.
        a.abandon().await.unwrap();
        let promoted = tokio::time::timeout(Duration::from_secs(2), b_suggestions.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(promoted, FocusSuggestion::Play);

        b.abandon().await.unwrap();
    }

    #[tokio::test]
    async fn refused_requests_get_no_event_stream() {
        let (_daemon, transport, _dir) = start().await;

        let (_sco, sug, _events) =
            FocusClient::request(transport.clone(), "ap", "SCO").await.unwrap();
        assert_eq!(sug, FocusSuggestion::Play);

        // Music against a call is refused outright.
        let (music, sug, mut events) =
            FocusClient::request(transport.clone(), "ap", "Music").await.unwrap();
        assert_eq!(sug, FocusSuggestion::Stop);
        assert!(events.recv().await.is_none());
        drop(music);
    }

    #[tokio::test]
    async fn unknown_stream_type_is_rejected() {
        let (_daemon, transport, _dir) = start().await;
        let err = FocusClient::request(transport, "ap", "Kazoo").await.unwrap_err();
        assert!(matches!(err, MediaError::InvalidArgument(_)));
    }
}
