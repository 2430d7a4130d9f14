//! Daemon configuration.
//!
//! Everything the daemon needs at startup: transport endpoints, the
//! connection budget, the focus resource, the DSP node roster and the
//! policy criterion set. All fields have deployment-ready defaults so a
//! bare `Config::default()` produces a runnable single-CPU daemon.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::graph::{NodeKind, NodeSpec};
use crate::policy::{CriterionKind, CriterionSpec};
use crate::transport::TransportConfig;

/// Built-in focus interaction matrix used when no resource file is given.
///
/// Streams: call audio beats everything, ring/alarm preempt media, prompts
/// duck music, music ducks music (two players share the output ducked).
pub const DEFAULT_FOCUS_MATRIX: &str = "\
# requester rows vs incumbent-top columns, cells are proactive:passive
Stream, SCO, Ring, Alarm, Notify, TTS, Music
SCO,    5:5, 0:2,  0:1,   0:1,    0:1, 0:2
Ring,   1:1, 5:5,  0:2,   0:1,    0:1, 0:2
Alarm,  1:1, 2:2,  5:5,   0:1,    0:1, 0:2
Notify, 3:3, 5:5,  4:4,   5:5,    4:4, 4:4
TTS,    1:1, 2:2,  2:2,   0:2,    0:0, 0:2
Music,  1:1, 2:2,  2:2,   0:2,    2:2, 4:4
";

/// Top-level daemon configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Endpoint naming and peer table.
    pub transport: TransportConfig,

    /// Connection table size; accepts beyond this are refused.
    pub max_connections: usize,

    /// Focus resource file. `None` falls back to the built-in matrix.
    pub focus_conf: Option<PathBuf>,

    /// Depth of the focus stack and size of its client-id free-list.
    pub focus_stack_depth: usize,

    /// Claimable DSP nodes.
    pub nodes: Vec<NodeSpec>,

    /// Policy criteria to create at startup.
    pub criteria: Vec<CriterionSpec>,

    /// Backing file for `persist.media.*` criteria. `None` keeps them in
    /// memory only.
    pub persist_path: Option<PathBuf>,

    /// Debounce window for persisted criterion writes.
    pub persist_delay_ms: u64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            transport: TransportConfig::default(),
            max_connections: 10,
            focus_conf: None,
            focus_stack_depth: 8,
            nodes: default_nodes(),
            criteria: default_criteria(),
            persist_path: None,
            persist_delay_ms: 1000,
        }
    }
}

impl Config {
    /// Validates the configuration values.
    pub fn validate(&self) -> Result<(), String> {
        if self.max_connections == 0 {
            return Err("max_connections must be >= 1".to_string());
        }
        if self.focus_stack_depth == 0 {
            return Err("focus_stack_depth must be >= 1".to_string());
        }
        if self.transport.local_cpu.is_empty() {
            return Err("transport.local_cpu must not be empty".to_string());
        }
        Ok(())
    }
}

fn default_nodes() -> Vec<NodeSpec> {
    vec![
        NodeSpec { name: "Music".into(), kind: NodeKind::Player },
        NodeSpec { name: "Media".into(), kind: NodeKind::Player },
        NodeSpec { name: "Notify".into(), kind: NodeKind::Player },
        NodeSpec { name: "TTS".into(), kind: NodeKind::Player },
        NodeSpec { name: "Capture".into(), kind: NodeKind::Recorder },
    ]
}

fn default_criteria() -> Vec<CriterionSpec> {
    vec![
        CriterionSpec {
            name: "AudioMode".into(),
            kind: CriterionKind::Exclusive,
            values: vec!["normal".into(), "phone".into(), "ringtone".into(), "voip".into()],
            initial: 0,
            min: None,
            max: None,
        },
        CriterionSpec {
            name: "MuteMode".into(),
            kind: CriterionKind::Exclusive,
            values: vec!["off".into(), "on".into()],
            initial: 0,
            min: None,
            max: None,
        },
        CriterionSpec {
            name: "ActiveStreams".into(),
            kind: CriterionKind::Inclusive,
            values: vec![
                "SCO".into(),
                "Ring".into(),
                "Alarm".into(),
                "Notify".into(),
                "TTS".into(),
                "Music".into(),
                "Media".into(),
                "Capture".into(),
            ],
            initial: 0,
            min: None,
            max: None,
        },
        CriterionSpec {
            name: "UsingDevices".into(),
            kind: CriterionKind::Inclusive,
            values: vec!["speaker".into(), "mic".into(), "a2dp".into(), "sco".into()],
            initial: 0,
            min: None,
            max: None,
        },
        CriterionSpec {
            name: "persist.media.Volume".into(),
            kind: CriterionKind::Exclusive,
            values: vec![],
            initial: 5,
            min: Some(0),
            max: Some(10),
        },
    ]
}

#[cfg(test)]
pub(crate) fn test_config(dir: &std::path::Path) -> Config {
    Config {
        transport: TransportConfig {
            local_cpu: "ap".into(),
            socket_dir: dir.to_path_buf(),
            rpc_port: -1,
            inet_port: -1,
            peers: Default::default(),
        },
        persist_path: None,
        ..Config::default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::focus::InteractionMatrix;

    #[test]
    fn default_config_validates() {
        Config::default().validate().unwrap();
    }

    #[test]
    fn builtin_matrix_parses_and_ducks_music_over_music() {
        let matrix = InteractionMatrix::parse(DEFAULT_FOCUS_MATRIX).unwrap();
        assert_eq!(matrix.len(), 6);
        let music = matrix.stream_level("Music").unwrap();
        let cell = matrix.cell(music, music);
        assert_eq!(cell.proactive, crate::defs::FocusSuggestion::PlayWithDuck);
        assert_eq!(cell.passive, crate::defs::FocusSuggestion::PlayWithDuck);
    }

    #[test]
    fn zero_budgets_are_rejected() {
        let mut cfg = Config::default();
        cfg.max_connections = 0;
        assert!(cfg.validate().is_err());

        let mut cfg = Config::default();
        cfg.focus_stack_depth = 0;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn config_round_trips_through_serde() {
        let cfg = Config::default();
        let text = serde_json::to_string(&cfg).unwrap();
        let back: Config = serde_json::from_str(&text).unwrap();
        assert_eq!(back.max_connections, cfg.max_connections);
        assert_eq!(back.nodes.len(), cfg.nodes.len());
    }
}
