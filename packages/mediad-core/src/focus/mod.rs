//! Audio-focus arbitration.
//!
//! A configurable interaction matrix decides, for every new focus request,
//! whether it plays, plays ducked, plays silent, or is refused, and what the
//! holders already on the stack should do about it. The matrix is loaded
//! once at startup from a text resource:
//!
//! ```text
//! # comment
//! Stream, Ring, Music, Notify
//! Ring,   0:0, 1:2, 5:5
//! Music,  2:2, 4:4, 5:5
//! Notify, 1:1, 4:4, 5:5
//! ```
//!
//! The first data line names the stream types; each following row gives the
//! `proactive:passive` cell for that requester against every incumbent.
//! Whitespace is ignored; anything else outside alphanumerics, `,` and `:`
//! rejects the file. Cells are the numeric focus suggestions `0..=5`.

mod stack;

pub use stack::{FocusEntry, FocusStack, FocusState};

use std::path::Path;

use crate::defs::FocusSuggestion;
use crate::error::{MediaError, MediaResult};
use crate::events::{Notifier, NotifierRef};

/// Default depth of the focus stack and size of the client-id free-list.
pub const DEFAULT_STACK_DEPTH: usize = 8;

const ID_SHIFT: u32 = 16;
const HANDLE_TAG: u64 = 0xF;

/// Opaque focus grant handle.
///
/// Encodes the client id as `(id << 16) | 0xF`; ids at or above the stack
/// capacity form the "rejected" range that [`FocusArbiter::abandon`] refuses
/// with `NotFound`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FocusHandle(u64);

impl FocusHandle {
    fn encode(client_id: usize) -> Self {
        Self(((client_id as u64) << ID_SHIFT) | HANDLE_TAG)
    }

    /// Raw integer representation handed to foreign code.
    pub fn raw(&self) -> u64 {
        self.0
    }

    /// Client id embedded in the handle.
    pub fn client_id(&self) -> usize {
        (self.0 >> ID_SHIFT) as usize
    }
}

impl TryFrom<u64> for FocusHandle {
    type Error = MediaError;

    fn try_from(raw: u64) -> MediaResult<Self> {
        if raw & ((1 << ID_SHIFT) - 1) != HANDLE_TAG {
            return Err(MediaError::InvalidArgument("malformed focus handle".into()));
        }
        Ok(Self(raw))
    }
}

/// One matrix cell: what a new requester is told (`proactive`) and what an
/// incumbent is told when somebody enters above it (`passive`).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InteractionCell {
    pub proactive: FocusSuggestion,
    pub passive: FocusSuggestion,
}

/// Square stream-type interaction matrix.
#[derive(Debug, Clone)]
pub struct InteractionMatrix {
    streams: Vec<String>,
    cells: Vec<InteractionCell>,
}

impl InteractionMatrix {
    /// Parses the full text of a focus resource file. Fail-closed: any
    /// unknown token, adjacent or trailing delimiter, or short row rejects
    /// the whole file.
    pub fn parse(text: &str) -> MediaResult<Self> {
        let mut streams: Vec<String> = Vec::new();
        let mut cells: Vec<InteractionCell> = Vec::new();

        for raw_line in text.split('\n') {
            let line: String = raw_line.chars().filter(|c| !c.is_whitespace()).collect();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            validate_line(&line)?;

            let (label, rest) = line
                .split_once(',')
                .ok_or_else(|| invalid(format!("line without fields: '{line}'")))?;

            if label == "Stream" {
                if !streams.is_empty() {
                    return Err(invalid("duplicate Stream line".into()));
                }
                streams = rest.split(',').map(str::to_owned).collect();
                if streams.is_empty() {
                    return Err(invalid("empty stream list".into()));
                }
            } else {
                if streams.is_empty() {
                    return Err(invalid("matrix row before Stream line".into()));
                }
                let row: Vec<InteractionCell> = rest
                    .split(',')
                    .map(parse_cell)
                    .collect::<MediaResult<_>>()?;
                if row.len() != streams.len() {
                    return Err(invalid(format!(
                        "row '{label}' has {} cells, expected {}",
                        row.len(),
                        streams.len()
                    )));
                }
                cells.extend(row);
            }
        }

        if streams.is_empty() {
            return Err(invalid("no Stream line".into()));
        }
        if cells.len() != streams.len() * streams.len() {
            return Err(invalid(format!(
                "matrix has {} rows, expected {}",
                cells.len() / streams.len(),
                streams.len()
            )));
        }
        Ok(Self { streams, cells })
    }

    pub fn from_file(path: &Path) -> MediaResult<Self> {
        let text = std::fs::read_to_string(path)?;
        Self::parse(&text)
    }

    /// Number of stream types (matrix dimension).
    pub fn len(&self) -> usize {
        self.streams.len()
    }

    pub fn is_empty(&self) -> bool {
        self.streams.is_empty()
    }

    /// Focus level (row/column index) of a stream type name.
    pub fn stream_level(&self, name: &str) -> Option<usize> {
        self.streams.iter().position(|s| s == name)
    }

    pub fn stream_name(&self, level: usize) -> Option<&str> {
        self.streams.get(level).map(String::as_str)
    }

    /// Cell for a `requester` against an `incumbent`.
    pub fn cell(&self, requester: usize, incumbent: usize) -> &InteractionCell {
        &self.cells[requester * self.streams.len() + incumbent]
    }
}

fn invalid(msg: String) -> MediaError {
    MediaError::InvalidArgument(msg)
}

fn validate_line(line: &str) -> MediaResult<()> {
    let mut prev = '\0';
    for (i, cur) in line.chars().enumerate() {
        if !cur.is_ascii_alphanumeric() && cur != ',' && cur != ':' {
            return Err(invalid(format!("bad character '{cur}'")));
        }
        if (cur == ',' && prev == ',') || (cur == ':' && prev == ':') {
            return Err(invalid("adjacent delimiters".into()));
        }
        if i == line.len() - 1 && (cur == ',' || cur == ':') {
            return Err(invalid("trailing delimiter".into()));
        }
        prev = cur;
    }
    Ok(())
}

fn parse_cell(cell: &str) -> MediaResult<InteractionCell> {
    let (pro, pas) = cell
        .split_once(':')
        .ok_or_else(|| invalid(format!("cell '{cell}' lacks ':'")))?;
    Ok(InteractionCell {
        proactive: parse_suggestion(pro)?,
        passive: parse_suggestion(pas)?,
    })
}

fn parse_suggestion(token: &str) -> MediaResult<FocusSuggestion> {
    let value: i32 = token
        .parse()
        .map_err(|_| invalid(format!("cell value '{token}' is not a number")))?;
    FocusSuggestion::from_wire(value)
        .ok_or_else(|| invalid(format!("cell value {value} out of range")))
}

// ─────────────────────────────────────────────────────────────────────────────
// Arbiter
// ─────────────────────────────────────────────────────────────────────────────

/// Matrix-driven focus policy engine.
pub struct FocusArbiter {
    matrix: InteractionMatrix,
    stack: FocusStack,
}

impl FocusArbiter {
    pub fn new(matrix: InteractionMatrix, depth: usize) -> Self {
        Self { matrix, stack: FocusStack::new(depth) }
    }

    pub fn from_file(path: &Path, depth: usize) -> MediaResult<Self> {
        Ok(Self::new(InteractionMatrix::from_file(path)?, depth))
    }

    pub fn matrix(&self) -> &InteractionMatrix {
        &self.matrix
    }

    /// Requests focus for `stream_type`.
    ///
    /// Returns the suggestion for the requester and, when the request
    /// entered the stack, the grant handle. Entries whose owner died are
    /// harvested first.
    pub fn request(
        &mut self,
        stream_type: &str,
        owner: NotifierRef,
    ) -> MediaResult<(FocusSuggestion, Option<FocusHandle>)> {
        self.harvest();

        let level = self
            .matrix
            .stream_level(stream_type)
            .ok_or_else(|| invalid(format!("unknown stream type '{stream_type}'")))?;

        if self.stack.is_full() {
            return Err(MediaError::ResourceExhausted("focus stack"));
        }
        let client_id = self
            .stack
            .free_client_id()
            .ok_or(MediaError::ResourceExhausted("focus stack"))?;

        let top_level = match self.stack.top() {
            Some(top) => top.level,
            None => {
                self.stack.push_top(client_id, level, owner);
                return Ok((FocusSuggestion::Play, Some(FocusHandle::encode(client_id))));
            }
        };

        let suggestion = self.matrix.cell(level, top_level).proactive;
        match suggestion {
            FocusSuggestion::Play => {
                self.stack.push_top(client_id, level, owner);
                self.broadcast_passive();
                Ok((suggestion, Some(FocusHandle::encode(client_id))))
            }
            FocusSuggestion::PlayButSilent | FocusSuggestion::PlayWithDuck => {
                // Keep the under-zone ordered by ascending level, never
                // displacing the top.
                let levels: Vec<usize> = self.stack.iter().map(|e| e.level).collect();
                let mut index = 1;
                while index < levels.len() && levels[index] < level {
                    index += 1;
                }
                let passive = self.matrix.cell(level, levels[0]).passive;
                if let Some(top) = self.stack.top() {
                    top.owner.notify(passive as i32, 0, "");
                }
                self.stack.insert_under(index, client_id, level, owner);
                Ok((suggestion, Some(FocusHandle::encode(client_id))))
            }
            FocusSuggestion::Stop | FocusSuggestion::Pause | FocusSuggestion::PlayWithKeep => {
                Ok((suggestion, None))
            }
        }
    }

    /// Releases a focus grant.
    pub fn abandon(&mut self, handle: FocusHandle) -> MediaResult<()> {
        self.harvest();
        self.abandon_client(handle.client_id())
    }

    /// Releases by raw client id; used by the daemon when a connection dies.
    pub fn abandon_client(&mut self, client_id: usize) -> MediaResult<()> {
        if client_id >= self.stack.capacity() {
            return Err(MediaError::NotFound("focus client id out of range".into()));
        }
        let (_, was_top) = self
            .stack
            .remove_by_client(client_id)
            .ok_or_else(|| MediaError::NotFound("unknown focus client id".into()))?;

        if was_top {
            if let Some(new_top) = self.stack.promote_head() {
                new_top.owner.notify(FocusSuggestion::Play as i32, 0, "");
            }
            self.broadcast_passive();
        }
        Ok(())
    }

    /// Stream type currently holding the top of the stack.
    pub fn peek(&self) -> Option<&str> {
        let top = self.stack.top()?;
        self.matrix.stream_name(top.level)
    }

    /// Logs the stack contents.
    pub fn dump(&self) {
        log::info!("[Focus] stack size: {}", self.stack.len());
        for entry in self.stack.iter() {
            log::info!(
                "[Focus]   client {} level {} ({}) state {:?}",
                entry.client_id,
                entry.level,
                self.matrix.stream_name(entry.level).unwrap_or("?"),
                entry.state,
            );
        }
    }

    /// `(client_id, level, state)` triples in stack order, for inspection.
    pub fn snapshot(&self) -> Vec<(usize, usize, FocusState)> {
        self.stack
            .iter()
            .map(|e| (e.client_id, e.level, e.state))
            .collect()
    }

    /// Passive suggestion fan-out to every non-top entry, self suppressed.
    fn broadcast_passive(&self) {
        let top = match self.stack.top() {
            Some(top) => top,
            None => return,
        };
        for entry in self.stack.iter() {
            if entry.state == FocusState::Top {
                continue;
            }
            let passive = self.matrix.cell(top.level, entry.level).passive;
            entry.owner.notify(passive as i32, 0, "");
        }
    }

    fn harvest(&mut self) {
        let (removed, top_removed) = self.stack.harvest_dead();
        if removed.is_empty() {
            return;
        }
        log::debug!("[Focus] harvested {} dead entries", removed.len());
        if top_removed {
            if let Some(new_top) = self.stack.promote_head() {
                if new_top.owner.alive() {
                    new_top.owner.notify(FocusSuggestion::Play as i32, 0, "");
                }
            }
        }
    }
}
