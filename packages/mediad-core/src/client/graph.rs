//! Typed player and recorder clients.
//!
//! Each handle owns its own connection to the daemon that claimed the DSP
//! node. Buffer mode (`prepare` without a url) binds a data socket next to
//! the control connection: the daemon dials it during prepare and raw
//! samples move outside the RPC channel from then on.

use std::sync::Arc;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::sync::mpsc;

use crate::client::proxy::RpcProxy;
use crate::client::{control_request, parse_event, parse_reply};
use crate::defs::ModuleId;
use crate::error::{MediaError, MediaResult};
use crate::transport::{bind_reverse, RpcStream, TransportConfig};

/// `(event, result, extra)` stream-state notification.
pub type StreamEvent = (i32, i32, String);

/// Shared implementation behind [`PlayerClient`] and [`RecorderClient`].
#[derive(Debug)]
struct StreamClient {
    proxy: RpcProxy,
    transport: Arc<TransportConfig>,
    /// CPU whose daemon claimed the node; buffer-mode sockets bind for it.
    cpu: String,
    module: ModuleId,
    data: Option<RpcStream>,
}

impl StreamClient {
    async fn open(
        transport: Arc<TransportConfig>,
        cpus: &str,
        module: ModuleId,
        stream_type: &str,
    ) -> MediaResult<Self> {
        let mut last_err = MediaError::NotFound("empty cpu list".into());
        for cpu in cpus.split([',', ';', ' ', '\t', '\n']).filter(|s| !s.is_empty()) {
            match Self::open_on(transport.clone(), cpu, module, stream_type).await {
                Ok(client) => return Ok(client),
                Err(err) => last_err = err,
            }
        }
        Err(last_err)
    }

    /// Dials one CPU and claims a node there; failure moves on to the next.
    async fn open_on(
        transport: Arc<TransportConfig>,
        cpu: &str,
        module: ModuleId,
        stream_type: &str,
    ) -> MediaResult<Self> {
        let (proxy, mut connects) = RpcProxy::connect(transport.clone(), cpu)?;
        connects.recv().await.ok_or(MediaError::Cancelled)??;
        let reply = proxy
            .call(control_request(module, "", "open", stream_type))
            .await?;
        parse_reply(reply)?;
        Ok(Self {
            proxy,
            transport,
            cpu: cpu.to_string(),
            module,
            data: None,
        })
    }

    async fn once(&self, target: &str, cmd: &str, arg: &str) -> MediaResult<String> {
        let reply = self
            .proxy
            .call(control_request(self.module, target, cmd, arg))
            .await?;
        let (_, response) = parse_reply(reply)?;
        Ok(response)
    }

    /// Stream-state events on the reverse channel.
    async fn events(&self) -> MediaResult<mpsc::UnboundedReceiver<StreamEvent>> {
        let mut parcels = self.proxy.listen().await?;
        self.once("", "set_event", "").await?;
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
        Ok(rx)
    }

    /// Prepare with an optional source/sink url.
    ///
    /// Without a url this is buffer mode: bind a data listener, tell the
    /// daemon where to dial, then take the accepted stream as the sample
    /// channel.
    async fn prepare(&mut self, url: Option<&str>, options: &str) -> MediaResult<()> {
        if self.data.is_some() {
            return Err(MediaError::Busy);
        }
        for option in options.split(';').filter(|s| !s.is_empty()) {
            self.once("", "set_property", option).await?;
        }
        match url {
            Some(url) => {
                self.once("", "prepare", url).await?;
            }
            None => {
                let (listener, key) = bind_reverse(&self.transport, &self.cpu)?;
                self.once(&self.transport.local_cpu, "prepare", &key).await?;
                // The daemon connected during prepare; the socket waits in
                // the listener backlog.
                let stream = listener.accept().await.map_err(MediaError::Io)?;
                self.data = Some(stream);
            }
        }
        Ok(())
    }

    async fn write_data(&mut self, buf: &[u8]) -> MediaResult<usize> {
        match self.data.as_mut() {
            Some(stream) => Ok(stream.write(buf).await?),
            None => Err(MediaError::InvalidArgument("no data socket".into())),
        }
    }

    async fn read_data(&mut self, buf: &mut [u8]) -> MediaResult<usize> {
        match self.data.as_mut() {
            Some(stream) => Ok(stream.read(buf).await?),
            None => Err(MediaError::InvalidArgument("no data socket".into())),
        }
    }

    async fn close_socket(&mut self) -> MediaResult<()> {
        self.data = None;
        self.once("", "close_socket", "").await?;
        Ok(())
    }

    async fn close(mut self, pending_stop: bool) -> MediaResult<()> {
        self.data = None;
        self.once("", "close", if pending_stop { "1" } else { "0" }).await?;
        self.proxy.disconnect().await
    }
}

macro_rules! forward_stream_api {
    () => {
        /// Subscribes to asynchronous stream-state events.
        pub async fn events(&self) -> MediaResult<mpsc::UnboundedReceiver<StreamEvent>> {
            self.inner.events().await
        }

        /// Prepares the stream; `url: None` selects buffer mode.
        pub async fn prepare(&mut self, url: Option<&str>, options: &str) -> MediaResult<()> {
            self.inner.prepare(url, options).await
        }

        pub async fn start(&self) -> MediaResult<()> {
            self.inner.once("", "start", "").await.map(drop)
        }

        pub async fn stop(&self) -> MediaResult<()> {
            self.inner.once("", "stop", "").await.map(drop)
        }

        pub async fn pause(&self) -> MediaResult<()> {
            self.inner.once("", "pause", "").await.map(drop)
        }

        pub async fn reset(&self) -> MediaResult<()> {
            self.inner.once("", "reset", "").await.map(drop)
        }

        pub async fn set_property(&self, key: &str, value: &str) -> MediaResult<()> {
            self.inner
                .once("", "set_property", &format!("{key}={value}"))
                .await
                .map(drop)
        }

        pub async fn get_property(&self, key: &str) -> MediaResult<String> {
            self.inner.once("", "get_property", key).await
        }

        /// Explicitly closes the buffer-mode data socket.
        pub async fn close_socket(&mut self) -> MediaResult<()> {
            self.inner.close_socket().await
        }

        /// Releases the node. `pending_stop` lets playback drain first.
        pub async fn close(self, pending_stop: bool) -> MediaResult<()> {
            self.inner.close(pending_stop).await
        }
    };
}

/// Playback stream handle.
#[derive(Debug)]
pub struct PlayerClient {
    inner: StreamClient,
}

impl PlayerClient {
    /// Claims a player node for `stream_type` on the first CPU that has one.
    pub async fn open(
        transport: Arc<TransportConfig>,
        cpus: &str,
        stream_type: &str,
    ) -> MediaResult<Self> {
        let inner = StreamClient::open(transport, cpus, ModuleId::Player, stream_type).await?;
        Ok(Self { inner })
    }

    forward_stream_api!();

    pub async fn seek(&self, msec: u32) -> MediaResult<()> {
        self.inner.once("", "seek", &msec.to_string()).await.map(drop)
    }

    pub async fn set_looping(&self, looping: bool) -> MediaResult<()> {
        self.inner
            .once("", "set_loop", if looping { "1" } else { "0" })
            .await
            .map(drop)
    }

    pub async fn set_volume(&self, volume: f32) -> MediaResult<()> {
        self.inner.once("", "set_volume", &volume.to_string()).await.map(drop)
    }

    pub async fn get_volume(&self) -> MediaResult<f32> {
        let response = self.inner.once("", "get_volume", "").await?;
        response
            .parse()
            .map_err(|_| MediaError::InvalidArgument(format!("volume '{response}'")))
    }

    pub async fn get_position(&self) -> MediaResult<u32> {
        parse_msec(self.inner.once("", "get_position", "").await?)
    }

    pub async fn get_duration(&self) -> MediaResult<u32> {
        parse_msec(self.inner.once("", "get_duration", "").await?)
    }

    pub async fn is_playing(&self) -> MediaResult<bool> {
        Ok(self.inner.once("", "get_playing", "").await? == "1")
    }

    /// Pushes raw samples in buffer mode.
    pub async fn write_data(&mut self, buf: &[u8]) -> MediaResult<usize> {
        self.inner.write_data(buf).await
    }
}

/// Capture stream handle.
pub struct RecorderClient {
    inner: StreamClient,
}

impl RecorderClient {
    /// Claims a recorder node on the first CPU that has one.
    pub async fn open(
        transport: Arc<TransportConfig>,
        cpus: &str,
        source: &str,
    ) -> MediaResult<Self> {
        let inner = StreamClient::open(transport, cpus, ModuleId::Recorder, source).await?;
        Ok(Self { inner })
    }

    forward_stream_api!();

    /// Single-shot capture to `url`; completion arrives as an event.
    pub async fn take_picture(&self, url: &str) -> MediaResult<()> {
        self.inner.once("", "take_picture", url).await.map(drop)
    }

    /// Pulls captured samples in buffer mode.
    pub async fn read_data(&mut self, buf: &mut [u8]) -> MediaResult<usize> {
        self.inner.read_data(buf).await
    }
}

fn parse_msec(response: String) -> MediaResult<u32> {
    response
        .parse()
        .map_err(|_| MediaError::InvalidArgument(format!("msec '{response}'")))
}
