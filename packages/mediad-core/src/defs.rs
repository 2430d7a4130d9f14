//! Wire-protocol constants shared by the daemon and every client.
//!
//! Numeric values are part of the on-wire contract between CPUs and must
//! not be renumbered.

/// Parcel header codes.
pub const PARCEL_SEND: u32 = 1;
pub const PARCEL_SEND_ACK: u32 = 2;
pub const PARCEL_REPLY: u32 = 3;
pub const PARCEL_CREATE_NOTIFY: u32 = 4;
pub const PARCEL_NOTIFY: u32 = 5;

/// Module ids carried as the leading `i32` of every request parcel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(i32)]
pub enum ModuleId {
    Graph = 1,
    Policy = 2,
    Player = 3,
    Recorder = 4,
    Session = 5,
    Focus = 6,
}

impl ModuleId {
    /// Decodes a wire module id.
    pub fn from_wire(id: i32) -> Option<Self> {
        match id {
            1 => Some(Self::Graph),
            2 => Some(Self::Policy),
            3 => Some(Self::Player),
            4 => Some(Self::Recorder),
            5 => Some(Self::Session),
            6 => Some(Self::Focus),
            _ => None,
        }
    }

    /// Short name used in log lines.
    pub fn name(&self) -> &'static str {
        match self {
            Self::Graph => "graph",
            Self::Policy => "policy",
            Self::Player => "player",
            Self::Recorder => "recorder",
            Self::Session => "session",
            Self::Focus => "focus",
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Event codes (notify channel)
// ─────────────────────────────────────────────────────────────────────────────

pub const EVENT_NOP: i32 = 0;

/* Stream status change, used by player & recorder. */

pub const EVENT_PREPARED: i32 = 1;
pub const EVENT_STARTED: i32 = 2;
pub const EVENT_PAUSED: i32 = 3;
pub const EVENT_STOPPED: i32 = 4;
/// Seeked is a transition notification, not a state.
pub const EVENT_SEEKED: i32 = 5;
pub const EVENT_COMPLETED: i32 = 6;

/* Control messages and their results, used by session. */

/// Most-active controllee changed (generated by the mediator).
pub const EVENT_CHANGED: i32 = 101;
/// Most-active controllee updated its metadata (generated by the mediator).
pub const EVENT_UPDATED: i32 = 102;
pub const EVENT_START: i32 = 103;
pub const EVENT_PAUSE: i32 = 104;
pub const EVENT_STOP: i32 = 105;
pub const EVENT_PREV_SONG: i32 = 106;
pub const EVENT_NEXT_SONG: i32 = 107;
pub const EVENT_INCREASE_VOLUME: i32 = 108;
pub const EVENT_DECREASE_VOLUME: i32 = 109;

/// Maps a session transport command to its control event code.
pub fn control_command_event(cmd: &str) -> Option<i32> {
    match cmd {
        "start" => Some(EVENT_START),
        "pause" => Some(EVENT_PAUSE),
        "stop" => Some(EVENT_STOP),
        "prev" => Some(EVENT_PREV_SONG),
        "next" => Some(EVENT_NEXT_SONG),
        "volumeup" => Some(EVENT_INCREASE_VOLUME),
        "volumedown" => Some(EVENT_DECREASE_VOLUME),
        _ => None,
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Focus suggestions
// ─────────────────────────────────────────────────────────────────────────────

/// Arbitration outcome suggested to a focus holder.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(i32)]
pub enum FocusSuggestion {
    Play = 0,
    Stop = 1,
    Pause = 2,
    PlayButSilent = 3,
    /// Play with lowered volume.
    PlayWithDuck = 4,
    /// Keep going, nothing should be done.
    PlayWithKeep = 5,
}

impl FocusSuggestion {
    /// Decodes a matrix cell or wire value.
    pub fn from_wire(value: i32) -> Option<Self> {
        match value {
            0 => Some(Self::Play),
            1 => Some(Self::Stop),
            2 => Some(Self::Pause),
            3 => Some(Self::PlayButSilent),
            4 => Some(Self::PlayWithDuck),
            5 => Some(Self::PlayWithKeep),
            _ => None,
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Metadata present-mask flags
// ─────────────────────────────────────────────────────────────────────────────

pub const METAFLAG_STATE: u32 = 0x1;
pub const METAFLAG_VOLUME: u32 = 0x2;
pub const METAFLAG_POSITION: u32 = 0x4;
pub const METAFLAG_DURATION: u32 = 0x8;
pub const METAFLAG_TITLE: u32 = 0x10;
pub const METAFLAG_ARTIST: u32 = 0x20;
pub const METAFLAG_ALBUM: u32 = 0x40;

// ─────────────────────────────────────────────────────────────────────────────
// Naming
// ─────────────────────────────────────────────────────────────────────────────

/// Name under which a daemon listens, local or cross-CPU.
pub fn control_socket_name(cpu: &str) -> String {
    format!("md:{cpu}")
}

/// Name prefix for per-proxy reverse listeners and buffer-mode sockets.
pub const CLIENT_SOCKET_PREFIX: &str = "md_";

/// Criterion names with this prefix survive daemon restarts.
pub const PERSIST_PREFIX: &str = "persist.media.";

/// Policy criterion holding the set of currently active stream types.
pub const ACTIVE_STREAMS_CRITERION: &str = "ActiveStreams";

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn module_id_round_trips() {
        for id in [1, 2, 3, 4, 5, 6] {
            let module = ModuleId::from_wire(id).unwrap();
            assert_eq!(module as i32, id);
        }
        assert!(ModuleId::from_wire(0).is_none());
        assert!(ModuleId::from_wire(7).is_none());
    }

    #[test]
    fn suggestion_round_trips() {
        for value in 0..=5 {
            let s = FocusSuggestion::from_wire(value).unwrap();
            assert_eq!(s as i32, value);
        }
        assert!(FocusSuggestion::from_wire(6).is_none());
        assert!(FocusSuggestion::from_wire(-1).is_none());
    }

    #[test]
    fn control_commands_map_to_events() {
        assert_eq!(control_command_event("next"), Some(EVENT_NEXT_SONG));
        assert_eq!(control_command_event("volumedown"), Some(EVENT_DECREASE_VOLUME));
        assert_eq!(control_command_event("query"), None);
    }

    #[test]
    fn socket_name_embeds_cpu() {
        assert_eq!(control_socket_name("ap"), "md:ap");
    }
}
