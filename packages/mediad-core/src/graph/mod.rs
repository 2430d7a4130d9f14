//! Player and recorder stream registry.
//!
//! Each `open` claims the first free DSP node matching the requested kind
//! (and name, when one is given) and wraps it in a [`StreamHandle`]. The
//! handle owns the node claim, the event sink, the node-independent volume
//! and the optional buffer-mode side channel. Commands are synchronous;
//! state transitions are delivered on the notify channel only.

mod node;

pub use node::{AudioNode, NodeKind, NodeReply, NodeSpec, SoftNode};

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use parking_lot::Mutex;
use tokio::io::AsyncReadExt;

use crate::defs::EVENT_COMPLETED;
use crate::error::{MediaError, MediaResult};
use crate::events::{Notifier, NotifierRef};
use crate::transport::{dial_back, RpcStream, TransportConfig};

struct NodeSlot {
    node: Box<dyn AudioNode>,
    claimed_by: Option<u64>,
}

/// Per-stream state owned by one connection.
struct StreamHandle {
    node_index: usize,
    kind: NodeKind,
    stream_type: String,
    volume: Mutex<f32>,
    events: Mutex<Option<NotifierRef>>,
    /// Drain/hold task keeping the buffer-mode side channel open.
    side_channel: Mutex<Option<tokio::task::JoinHandle<()>>>,
}

/// Registry of stream handles over the claimable DSP nodes.
pub struct MediaGraph {
    nodes: Vec<Mutex<NodeSlot>>,
    handles: DashMap<u64, Arc<StreamHandle>>,
    next_id: AtomicU64,
    transport: Arc<TransportConfig>,
}

impl MediaGraph {
    pub fn new(nodes: Vec<Box<dyn AudioNode>>, transport: Arc<TransportConfig>) -> Self {
        Self {
            nodes: nodes
                .into_iter()
                .map(|node| Mutex::new(NodeSlot { node, claimed_by: None }))
                .collect(),
            handles: DashMap::new(),
            next_id: AtomicU64::new(1),
            transport,
        }
    }

    pub fn from_specs(specs: &[NodeSpec], transport: Arc<TransportConfig>) -> Self {
        let nodes = specs
            .iter()
            .map(|spec| Box::new(SoftNode::from_spec(spec)) as Box<dyn AudioNode>)
            .collect();
        Self::new(nodes, transport)
    }

    /// Claims the first free node of `kind`; a non-empty `name` restricts
    /// the match to that node.
    pub fn open(&self, kind: NodeKind, name: &str) -> MediaResult<u64> {
        for (index, slot) in self.nodes.iter().enumerate() {
            let mut slot = slot.lock();
            if slot.claimed_by.is_some() || slot.node.kind() != kind {
                continue;
            }
            if !name.is_empty() && slot.node.name() != name {
                continue;
            }
            slot.node.command("open", "")?;
            let id = self.next_id.fetch_add(1, Ordering::Relaxed);
            slot.claimed_by = Some(id);
            let stream_type = if name.is_empty() {
                slot.node.name().to_string()
            } else {
                name.to_string()
            };
            drop(slot);
            self.handles.insert(
                id,
                Arc::new(StreamHandle {
                    node_index: index,
                    kind,
                    stream_type,
                    volume: Mutex::new(1.0),
                    events: Mutex::new(None),
                    side_channel: Mutex::new(None),
                }),
            );
            log::info!("[Graph] opened {kind:?} handle {id} on node {index}");
            return Ok(id);
        }
        Err(MediaError::NotFound(format!("no free {kind:?} node '{name}'")))
    }

    fn handle(&self, id: u64) -> MediaResult<Arc<StreamHandle>> {
        self.handles
            .get(&id)
            .map(|h| h.value().clone())
            .ok_or_else(|| MediaError::NotFound(format!("stream handle {id}")))
    }

    pub fn kind_of(&self, id: u64) -> MediaResult<NodeKind> {
        Ok(self.handle(id)?.kind)
    }

    /// Stream type the handle was opened with, for policy bookkeeping.
    pub fn stream_type(&self, id: u64) -> MediaResult<String> {
        Ok(self.handle(id)?.stream_type.clone())
    }

    /// Releases the handle, its node claim and its side channel.
    pub fn close(&self, id: u64) -> MediaResult<()> {
        let (_, handle) = self
            .handles
            .remove(&id)
            .ok_or_else(|| MediaError::NotFound(format!("stream handle {id}")))?;
        self.close_side_channel_of(&handle);
        let mut slot = self.nodes[handle.node_index].lock();
        let _ = slot.node.command("close", "");
        slot.claimed_by = None;
        log::info!("[Graph] closed handle {id}");
        Ok(())
    }

    /// Installs the notify sink receiving the handle's state events.
    pub fn set_event_sink(&self, id: u64, sink: NotifierRef) -> MediaResult<()> {
        *self.handle(id)?.events.lock() = Some(sink);
        Ok(())
    }

    /// Runs a node command for the handle and fans out emitted events.
    pub fn command(&self, id: u64, cmd: &str, arg: &str) -> MediaResult<String> {
        let handle = self.handle(id)?;
        let reply = {
            let mut slot = self.nodes[handle.node_index].lock();
            slot.node.command(cmd, arg)?
        };
        self.emit(&handle, &reply.events);
        Ok(reply.response)
    }

    /// Buffer-mode prepare: dials the client's data socket named by
    /// `{cpu, key}` before handing the url to the node.
    pub async fn prepare_buffered(&self, id: u64, cpu: &str, key: &str) -> MediaResult<()> {
        let handle = self.handle(id)?;
        if handle.side_channel.lock().is_some() {
            return Err(MediaError::Busy);
        }
        let stream = dial_back(&self.transport, cpu, key).await?;
        let task = match handle.kind {
            // The player consumes client samples; drain so writers never
            // stall. The recorder's producer is the DSP, which is out of
            // scope: hold the socket open until close.
            NodeKind::Player => tokio::spawn(drain_side_channel(stream)),
            NodeKind::Recorder => tokio::spawn(hold_side_channel(stream)),
        };
        *handle.side_channel.lock() = Some(task);

        let reply = {
            let mut slot = self.nodes[handle.node_index].lock();
            slot.node.command("prepare", key)?
        };
        self.emit(&handle, &reply.events);
        Ok(())
    }

    /// Explicitly closes the buffer-mode side channel.
    pub fn close_side_channel(&self, id: u64) -> MediaResult<()> {
        let handle = self.handle(id)?;
        self.close_side_channel_of(&handle);
        Ok(())
    }

    fn close_side_channel_of(&self, handle: &StreamHandle) {
        if let Some(task) = handle.side_channel.lock().take() {
            task.abort();
        }
    }

    /// Handle-local volume, independent of the node's own gain stage.
    pub fn set_volume(&self, id: u64, volume: f32) -> MediaResult<()> {
        if !(0.0..=1.0).contains(&volume) {
            return Err(MediaError::InvalidArgument(format!("volume {volume}")));
        }
        *self.handle(id)?.volume.lock() = volume;
        Ok(())
    }

    pub fn get_volume(&self, id: u64) -> MediaResult<f32> {
        Ok(*self.handle(id)?.volume.lock())
    }

    /// Single-shot capture: prepare to `url`, start, report completion.
    pub fn take_picture(&self, id: u64, url: &str) -> MediaResult<()> {
        let handle = self.handle(id)?;
        if handle.kind != NodeKind::Recorder {
            return Err(MediaError::InvalidArgument("take_picture on a player".into()));
        }
        let mut events = Vec::new();
        {
            let mut slot = self.nodes[handle.node_index].lock();
            events.extend(slot.node.command("prepare", url)?.events);
            events.extend(slot.node.command("start", "")?.events);
            events.extend(slot.node.command("stop", "")?.events);
        }
        events.push((EVENT_COMPLETED, 0));
        self.emit(&handle, &events);
        Ok(())
    }

    /// Graph-wide command routed to a node by name, bypassing handles.
    /// This is the surface policy observers drive.
    pub fn graph_command(&self, target: &str, cmd: &str, arg: &str) -> MediaResult<String> {
        let slot = self
            .nodes
            .iter()
            .find(|slot| slot.lock().node.name() == target)
            .ok_or_else(|| MediaError::NotFound(format!("node '{target}'")))?;
        let reply = slot.lock().node.command(cmd, arg)?;
        Ok(reply.response)
    }

    /// Logs the registry contents.
    pub fn dump(&self) {
        log::info!(
            "[Graph] {} nodes, {} open handles",
            self.nodes.len(),
            self.handles.len()
        );
        for (index, slot) in self.nodes.iter().enumerate() {
            let slot = slot.lock();
            log::info!(
                "[Graph]   node {index} '{}' {:?} claimed_by={:?}",
                slot.node.name(),
                slot.node.kind(),
                slot.claimed_by,
            );
        }
    }

    fn emit(&self, handle: &StreamHandle, events: &[(i32, i32)]) {
        if events.is_empty() {
            return;
        }
        let sink = handle.events.lock().clone();
        if let Some(sink) = sink {
            for &(event, result) in events {
                sink.notify(event, result, "");
            }
        }
    }
}

async fn drain_side_channel(mut stream: RpcStream) {
    let mut buf = [0u8; 4096];
    loop {
        match stream.read(&mut buf).await {
            Ok(0) | Err(_) => break,
            Ok(_) => {}
        }
    }
}

async fn hold_side_channel(stream: RpcStream) {
    let _stream = stream;
    std::future::pending::<()>().await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::defs::{EVENT_PREPARED, EVENT_STARTED};
    use crate::events::testing::RecordingNotifier;

    fn graph() -> MediaGraph {
        let specs = vec![
            NodeSpec { name: "Music".into(), kind: NodeKind::Player },
            NodeSpec { name: "Notify".into(), kind: NodeKind::Player },
            NodeSpec { name: "Capture".into(), kind: NodeKind::Recorder },
        ];
        MediaGraph::from_specs(&specs, Arc::new(TransportConfig::default()))
    }

    #[test]
    fn open_claims_first_matching_node() {
        let g = graph();
        let first = g.open(NodeKind::Player, "").unwrap();
        let second = g.open(NodeKind::Player, "").unwrap();
        assert_ne!(first, second);
        // Both player nodes claimed now.
        assert!(matches!(g.open(NodeKind::Player, ""), Err(MediaError::NotFound(_))));
        // The recorder node is still free.
        g.open(NodeKind::Recorder, "Capture").unwrap();
    }

    #[test]
    fn open_by_name_skips_other_nodes() {
        let g = graph();
        let id = g.open(NodeKind::Player, "Notify").unwrap();
        assert_eq!(g.stream_type(id).unwrap(), "Notify");
        assert!(g.open(NodeKind::Player, "Notify").is_err());
    }

    #[test]
    fn close_releases_the_claim() {
        let g = graph();
        let id = g.open(NodeKind::Player, "Music").unwrap();
        g.close(id).unwrap();
        g.open(NodeKind::Player, "Music").unwrap();
        assert!(matches!(g.command(id, "start", ""), Err(MediaError::NotFound(_))));
    }

    #[test]
    fn commands_emit_state_events_to_the_sink() {
        let g = graph();
        let id = g.open(NodeKind::Player, "Music").unwrap();
        let sink = RecordingNotifier::new();
        g.set_event_sink(id, sink.clone()).unwrap();

        g.command(id, "prepare", "/a.mp3").unwrap();
        g.command(id, "start", "").unwrap();
        assert_eq!(
            sink.take(),
            vec![(EVENT_PREPARED, 0, String::new()), (EVENT_STARTED, 0, String::new())]
        );
        assert_eq!(g.command(id, "get_playing", "").unwrap(), "1");
    }

    #[test]
    fn volume_is_validated_and_handle_local() {
        let g = graph();
        let id = g.open(NodeKind::Player, "Music").unwrap();
        assert_eq!(g.get_volume(id).unwrap(), 1.0);
        g.set_volume(id, 0.25).unwrap();
        assert_eq!(g.get_volume(id).unwrap(), 0.25);
        assert!(g.set_volume(id, 1.5).is_err());
        assert!(g.set_volume(id, -0.1).is_err());
    }

    #[test]
    fn take_picture_runs_the_capture_cycle() {
        let g = graph();
        let id = g.open(NodeKind::Recorder, "").unwrap();
        let sink = RecordingNotifier::new();
        g.set_event_sink(id, sink.clone()).unwrap();

        g.take_picture(id, "/tmp/shot.pcm").unwrap();
        let events: Vec<i32> = sink.take().into_iter().map(|(e, _, _)| e).collect();
        assert!(events.contains(&EVENT_COMPLETED));

        let player = g.open(NodeKind::Player, "Music").unwrap();
        assert!(g.take_picture(player, "/x").is_err());
    }

    #[test]
    fn graph_command_routes_by_node_name() {
        let g = graph();
        g.graph_command("Music", "set_property", "duration=100").unwrap();
        assert_eq!(g.graph_command("Music", "get_duration", "").unwrap(), "100");
        assert!(g.graph_command("Ghost", "start", "").is_err());
    }
}
