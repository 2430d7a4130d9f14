//! The narrow seam to the audio DSP graph.
//!
//! The control plane never processes samples; it claims nodes and drives
//! them with short string commands, exactly the surface the underlying
//! filter graph exposes. [`SoftNode`] is a software state machine behind
//! that seam so the daemon (and its tests) run without a real DSP.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::defs::{EVENT_PAUSED, EVENT_PREPARED, EVENT_SEEKED, EVENT_STARTED, EVENT_STOPPED};
use crate::error::{MediaError, MediaResult};

/// What a node produces or consumes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NodeKind {
    Player,
    Recorder,
}

/// Declarative node description from daemon configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeSpec {
    /// Node name, matched against the stream type at `open`.
    pub name: String,
    pub kind: NodeKind,
}

/// Outcome of a node command: an optional response string plus the
/// asynchronous state events the command triggered. Events travel on the
/// notify channel, never in the ack.
#[derive(Debug, Default, PartialEq)]
pub struct NodeReply {
    pub response: String,
    pub events: Vec<(i32, i32)>,
}

impl NodeReply {
    pub fn ok() -> Self {
        Self::default()
    }

    pub fn with_response(response: impl Into<String>) -> Self {
        Self { response: response.into(), events: Vec::new() }
    }

    pub fn with_event(event: i32) -> Self {
        Self { response: String::new(), events: vec![(event, 0)] }
    }
}

/// One claimable node of the DSP graph.
pub trait AudioNode: Send {
    fn name(&self) -> &str;
    fn kind(&self) -> NodeKind;
    /// Executes a command. DSP errors surface as negative acks upstream.
    fn command(&mut self, cmd: &str, arg: &str) -> MediaResult<NodeReply>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SoftState {
    Stopped,
    Prepared,
    Started,
    Paused,
}

/// Software stand-in for a DSP filter node.
///
/// Tracks the stream state machine, source url, loop flag, position and
/// properties, and reports the transitions a real node would deliver
/// asynchronously.
pub struct SoftNode {
    name: String,
    kind: NodeKind,
    state: SoftState,
    url: Option<String>,
    looping: bool,
    position_ms: u32,
    properties: HashMap<String, String>,
}

impl SoftNode {
    pub fn new(name: impl Into<String>, kind: NodeKind) -> Self {
        Self {
            name: name.into(),
            kind,
            state: SoftState::Stopped,
            url: None,
            looping: false,
            position_ms: 0,
            properties: HashMap::new(),
        }
    }

    pub fn from_spec(spec: &NodeSpec) -> Self {
        Self::new(spec.name.clone(), spec.kind)
    }

    fn duration_ms(&self) -> u32 {
        self.properties
            .get("duration")
            .and_then(|v| v.parse().ok())
            .unwrap_or(0)
    }

    fn wrong_state(&self, cmd: &str) -> MediaError {
        MediaError::InvalidArgument(format!("'{cmd}' in state {:?}", self.state))
    }
}

impl AudioNode for SoftNode {
    fn name(&self) -> &str {
        &self.name
    }

    fn kind(&self) -> NodeKind {
        self.kind
    }

    fn command(&mut self, cmd: &str, arg: &str) -> MediaResult<NodeReply> {
        match cmd {
            "open" => {
                self.state = SoftState::Stopped;
                self.url = None;
                self.position_ms = 0;
                Ok(NodeReply::ok())
            }
            "close" | "reset" => {
                self.state = SoftState::Stopped;
                self.url = None;
                self.looping = false;
                self.position_ms = 0;
                Ok(NodeReply::ok())
            }
            "prepare" => {
                if self.state != SoftState::Stopped {
                    return Err(self.wrong_state(cmd));
                }
                self.url = Some(arg.to_string());
                self.state = SoftState::Prepared;
                Ok(NodeReply::with_event(EVENT_PREPARED))
            }
            "start" => match self.state {
                SoftState::Prepared | SoftState::Paused => {
                    self.state = SoftState::Started;
                    Ok(NodeReply::with_event(EVENT_STARTED))
                }
                SoftState::Started => Ok(NodeReply::ok()),
                SoftState::Stopped => Err(self.wrong_state(cmd)),
            },
            "stop" => {
                self.state = SoftState::Stopped;
                self.position_ms = 0;
                Ok(NodeReply::with_event(EVENT_STOPPED))
            }
            "pause" => {
                if self.state != SoftState::Started {
                    return Err(self.wrong_state(cmd));
                }
                self.state = SoftState::Paused;
                Ok(NodeReply::with_event(EVENT_PAUSED))
            }
            "seek" => {
                let msec: u32 = arg
                    .parse()
                    .map_err(|_| MediaError::InvalidArgument(format!("seek to '{arg}'")))?;
                let duration = self.duration_ms();
                self.position_ms = if duration > 0 { msec.min(duration) } else { msec };
                Ok(NodeReply::with_event(EVENT_SEEKED))
            }
            "set_loop" => {
                let flag: i32 = arg
                    .parse()
                    .map_err(|_| MediaError::InvalidArgument(format!("loop '{arg}'")))?;
                self.looping = flag != 0;
                Ok(NodeReply::ok())
            }
            "get_playing" => Ok(NodeReply::with_response(
                if self.state == SoftState::Started { "1" } else { "0" },
            )),
            "get_position" => Ok(NodeReply::with_response(self.position_ms.to_string())),
            "get_duration" => Ok(NodeReply::with_response(self.duration_ms().to_string())),
            "set_property" => {
                let (key, value) = arg
                    .split_once('=')
                    .ok_or_else(|| MediaError::InvalidArgument(format!("property '{arg}'")))?;
                self.properties.insert(key.to_string(), value.to_string());
                Ok(NodeReply::ok())
            }
            "get_property" => {
                let value = self
                    .properties
                    .get(arg)
                    .ok_or_else(|| MediaError::NotFound(format!("property '{arg}'")))?;
                Ok(NodeReply::with_response(value.clone()))
            }
            other => Err(MediaError::Unsupported(format!("node cmd '{other}'"))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn node() -> SoftNode {
        SoftNode::new("Music", NodeKind::Player)
    }

    #[test]
    fn prepare_start_pause_stop_walks_the_state_machine() {
        let mut n = node();
        assert_eq!(
            n.command("prepare", "/music/a.mp3").unwrap().events,
            vec![(EVENT_PREPARED, 0)]
        );
        assert_eq!(n.command("start", "").unwrap().events, vec![(EVENT_STARTED, 0)]);
        assert_eq!(n.command("get_playing", "").unwrap().response, "1");
        assert_eq!(n.command("pause", "").unwrap().events, vec![(EVENT_PAUSED, 0)]);
        assert_eq!(n.command("start", "").unwrap().events, vec![(EVENT_STARTED, 0)]);
        assert_eq!(n.command("stop", "").unwrap().events, vec![(EVENT_STOPPED, 0)]);
        assert_eq!(n.command("get_playing", "").unwrap().response, "0");
    }

    #[test]
    fn start_without_prepare_fails() {
        let mut n = node();
        assert!(n.command("start", "").is_err());
    }

    #[test]
    fn seek_clamps_to_duration() {
        let mut n = node();
        n.command("set_property", "duration=5000").unwrap();
        n.command("prepare", "x").unwrap();
        let reply = n.command("seek", "9000").unwrap();
        assert_eq!(reply.events, vec![(EVENT_SEEKED, 0)]);
        assert_eq!(n.command("get_position", "").unwrap().response, "5000");
        assert_eq!(n.command("get_duration", "").unwrap().response, "5000");
    }

    #[test]
    fn properties_round_trip() {
        let mut n = node();
        n.command("set_property", "codec=pcm16").unwrap();
        assert_eq!(n.command("get_property", "codec").unwrap().response, "pcm16");
        assert!(n.command("get_property", "missing").is_err());
        assert!(n.command("set_property", "no-equals").is_err());
    }

    #[test]
    fn unknown_command_is_unsupported() {
        let mut n = node();
        assert!(matches!(
            n.command("transmogrify", ""),
            Err(MediaError::Unsupported(_))
        ));
    }
}
