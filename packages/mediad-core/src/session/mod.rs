//! Now-playing session mediation.
//!
//! Two independent populations meet here: *controllees* (media producers
//! that publish their playback state) and *controllers* (remote-control
//! surfaces that send transport commands and subscribe to state). The head
//! of the controllee list is the "most active" one: the sole source of
//! forward events to controllers and sole target of controller commands.
//!
//! ```text
//!  controllee list -> [music player] -> [bt player] -> ...
//!       backward: head broadcasts to all subscribed controllers.
//!  controller list -> [avrcp] -> [system music bar] -> ...
//!       forward: commands reach only the head controllee.
//! ```

mod metadata;

pub use metadata::Metadata;

use std::collections::VecDeque;

use crate::defs::{control_command_event, EVENT_CHANGED, EVENT_UPDATED, METAFLAG_STATE};
use crate::error::{MediaError, MediaResult};
use crate::events::{Notifier, NotifierRef};

struct Controller {
    id: u64,
    sink: NotifierRef,
    /// Whether the controller asked for events yet.
    wants_events: bool,
}

struct Controllee {
    id: u64,
    sink: NotifierRef,
    meta: Metadata,
}

/// Publish/subscribe mediator between controllers and controllees.
#[derive(Default)]
pub struct SessionMediator {
    controllers: Vec<Controller>,
    controllees: VecDeque<Controllee>,
    next_id: u64,
}

impl SessionMediator {
    pub fn new() -> Self {
        Self::default()
    }

    fn fresh_id(&mut self) -> u64 {
        self.next_id += 1;
        self.next_id
    }

    fn is_head(&self, id: u64) -> bool {
        self.controllees.front().map(|c| c.id) == Some(id)
    }

    /// Broadcast to every controller that subscribed for events.
    fn broadcast(&self, event: i32, result: i32, extra: &str) {
        for controller in &self.controllers {
            if controller.wants_events {
                controller.sink.notify(event, result, extra);
            }
        }
    }

    // ─────────────────────────────────────────────────────────────────────
    // Controllee side
    // ─────────────────────────────────────────────────────────────────────

    /// Registers a media producer with empty metadata.
    ///
    /// Controllers learn about it only if it became the head (the list was
    /// empty).
    pub fn register_controllee(&mut self, sink: NotifierRef) -> u64 {
        let id = self.fresh_id();
        self.controllees.push_back(Controllee { id, sink, meta: Metadata::new() });
        if self.is_head(id) {
            self.broadcast(EVENT_CHANGED, 0, "");
        }
        id
    }

    /// Merges a metadata diff into a controllee.
    ///
    /// The head broadcasts `UPDATED` with the diff mask; a non-head that
    /// reports itself playing is promoted to head and broadcasts `CHANGED`.
    pub fn update_controllee(&mut self, id: u64, diff: &Metadata) -> MediaResult<()> {
        let index = self.position_of(id)?;
        self.controllees[index].meta.merge(diff);

        if index == 0 {
            self.broadcast(EVENT_UPDATED, diff.flags as i32, "");
        } else if diff.flags & METAFLAG_STATE != 0 && diff.state > 0 {
            let controllee = self.controllees.remove(index).expect("index checked");
            self.controllees.push_front(controllee);
            self.broadcast(EVENT_CHANGED, diff.flags as i32, "");
        }
        Ok(())
    }

    /// Forwards a status notification from a controllee to the controllers.
    ///
    /// Only the most active controllee is heard.
    pub fn controllee_event(
        &mut self,
        id: u64,
        event: i32,
        result: i32,
        extra: &str,
    ) -> MediaResult<()> {
        self.position_of(id)?;
        if self.is_head(id) {
            self.broadcast(event, result, extra);
        }
        Ok(())
    }

    /// Removes a controllee; a departing head announces its successor.
    pub fn unregister_controllee(&mut self, id: u64) -> MediaResult<NotifierRef> {
        let index = self.position_of(id)?;
        let removed = self.controllees.remove(index).expect("index checked");
        if index == 0 {
            let flags = self.controllees.front().map(|c| c.meta.flags).unwrap_or(0);
            self.broadcast(EVENT_CHANGED, flags as i32, "");
        }
        Ok(removed.sink)
    }

    fn position_of(&self, id: u64) -> MediaResult<usize> {
        self.controllees
            .iter()
            .position(|c| c.id == id)
            .ok_or_else(|| MediaError::NotFound(format!("controllee {id}")))
    }

    // ─────────────────────────────────────────────────────────────────────
    // Controller side
    // ─────────────────────────────────────────────────────────────────────

    /// Adds a controller. It receives nothing until `set_event`.
    pub fn open_controller(&mut self, sink: NotifierRef) -> u64 {
        let id = self.fresh_id();
        self.controllers.push(Controller { id, sink, wants_events: false });
        id
    }

    /// Subscribes a controller to backward events.
    pub fn set_controller_event(&mut self, id: u64) -> MediaResult<()> {
        let controller = self
            .controllers
            .iter_mut()
            .find(|c| c.id == id)
            .ok_or_else(|| MediaError::NotFound(format!("controller {id}")))?;
        controller.wants_events = true;
        Ok(())
    }

    /// Forward control path: maps `cmd` to a control event and notifies the
    /// head controllee; `query` returns the head's serialized metadata.
    pub fn transact(&mut self, cmd: &str, arg: &str) -> MediaResult<String> {
        let head = self
            .controllees
            .front()
            .ok_or_else(|| MediaError::NotFound("no active controllee".into()))?;

        if cmd == "query" {
            return Ok(head.meta.serialize());
        }

        let event = control_command_event(cmd)
            .ok_or_else(|| MediaError::Unsupported(format!("session cmd '{cmd}'")))?;
        head.sink.notify(event, 0, arg);
        Ok(String::new())
    }

    /// Removes a controller. No broadcast.
    pub fn close_controller(&mut self, id: u64) -> MediaResult<NotifierRef> {
        let index = self
            .controllers
            .iter()
            .position(|c| c.id == id)
            .ok_or_else(|| MediaError::NotFound(format!("controller {id}")))?;
        Ok(self.controllers.remove(index).sink)
    }

    /// `(id, flags, state)` of controllees in activity order, for inspection.
    pub fn snapshot(&self) -> Vec<(u64, u32, i32)> {
        self.controllees
            .iter()
            .map(|c| (c.id, c.meta.flags, c.meta.state))
            .collect()
    }
}
