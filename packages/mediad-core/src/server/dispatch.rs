//! Request routing from parsed parcels to the service modules.
//!
//! The leading `i32` of every request names the module; the remaining
//! fields follow the per-module wire format. Handler errors become a
//! negated errno in the reply's `ret` field and never tear down the
//! daemon; malformed parcels surface as `Err` so the caller closes the
//! offending connection.

use std::sync::Arc;

use parking_lot::Mutex;

use crate::defs::{ModuleId, ACTIVE_STREAMS_CRITERION, PARCEL_REPLY};
use crate::error::{MediaError, MediaResult};
use crate::events::Notifier;
use crate::focus::FocusArbiter;
use crate::graph::{MediaGraph, NodeKind};
use crate::parcel::Parcel;
use crate::policy::PolicyEngine;
use crate::server::conn::{ConnData, Connection};
use crate::session::{Metadata, SessionMediator};

/// The daemon's service modules behind their locks.
pub(crate) struct Modules {
    pub focus: Mutex<FocusArbiter>,
    pub session: Mutex<SessionMediator>,
    pub graph: MediaGraph,
    pub policy: Mutex<PolicyEngine>,
}

/// Routes one request parcel; returns the reply when one is wanted.
pub(crate) async fn dispatch(
    modules: &Modules,
    conn: &Arc<Connection>,
    parcel: &mut Parcel,
    want_reply: bool,
) -> MediaResult<Option<Parcel>> {
    let module_id = parcel.read_i32()?;
    let outcome = match ModuleId::from_wire(module_id) {
        Some(ModuleId::Focus) => {
            let target = parcel.read_string()?;
            let cmd = parcel.read_string()?;
            let _resp_len = parcel.read_i32()?;
            focus_command(modules, conn, &target, &cmd)
        }
        Some(ModuleId::Session) => {
            let target = parcel.read_string()?;
            let cmd = parcel.read_string()?;
            let arg = parcel.read_string()?;
            let _resp_len = parcel.read_i32()?;
            session_command(modules, conn, &target, &cmd, &arg)
        }
        Some(module @ (ModuleId::Player | ModuleId::Recorder)) => {
            let target = parcel.read_string()?;
            let cmd = parcel.read_string()?;
            let arg = parcel.read_string()?;
            let _resp_len = parcel.read_i32()?;
            stream_command(modules, conn, module, &target, &cmd, &arg).await
        }
        Some(ModuleId::Graph) => {
            let target = parcel.read_string()?;
            let cmd = parcel.read_string()?;
            let arg = parcel.read_string()?;
            let _resp_len = parcel.read_i32()?;
            graph_command(modules, &target, &cmd, &arg)
        }
        Some(ModuleId::Policy) => {
            let name = parcel.read_string()?;
            let cmd = parcel.read_string()?;
            let value = parcel.read_string()?;
            let apply = parcel.read_i32()?;
            let _resp_len = parcel.read_i32()?;
            policy_command(modules, conn, &name, &cmd, &value, apply != 0)
        }
        None => Err(MediaError::Unsupported(format!("module {module_id}"))),
    };

    let (ret, response) = match outcome {
        Ok(reply) => reply,
        Err(err) => {
            log::debug!("[Server] conn {} handler error: {err}", conn.conn_id);
            (err.errno(), String::new())
        }
    };

    if !want_reply {
        return Ok(None);
    }
    let mut reply = Parcel::with_code(PARCEL_REPLY);
    reply.append_i32(ret);
    reply.append_str(&response);
    Ok(Some(reply))
}

type HandlerReply = MediaResult<(i32, String)>;

fn ok() -> HandlerReply {
    Ok((0, String::new()))
}

fn respond(response: String) -> HandlerReply {
    Ok((response.len() as i32, response))
}

// ─────────────────────────────────────────────────────────────────────────────
// Focus
// ─────────────────────────────────────────────────────────────────────────────

fn focus_command(
    modules: &Modules,
    conn: &Arc<Connection>,
    target: &str,
    cmd: &str,
) -> HandlerReply {
    match cmd {
        "request" => {
            let (suggestion, handle) =
                modules.focus.lock().request(target, conn.clone())?;
            if let Some(handle) = handle {
                conn.set_data(ConnData::Focus(handle.client_id()));
            }
            Ok((suggestion as i32, String::new()))
        }
        "abandon" => match conn.data() {
            ConnData::Focus(client_id) => {
                modules.focus.lock().abandon_client(client_id)?;
                conn.set_data(ConnData::None);
                conn.finalize();
                ok()
            }
            _ => Err(MediaError::NotFound("no focus grant on this connection".into())),
        },
        "peek" => {
            let focus = modules.focus.lock();
            match focus.peek() {
                Some(name) => respond(name.to_string()),
                None => Err(MediaError::NotFound("focus stack empty".into())),
            }
        }
        "dump" => {
            modules.focus.lock().dump();
            ok()
        }
        other => Err(MediaError::Unsupported(format!("focus cmd '{other}'"))),
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Session
// ─────────────────────────────────────────────────────────────────────────────

fn session_command(
    modules: &Modules,
    conn: &Arc<Connection>,
    target: &str,
    cmd: &str,
    arg: &str,
) -> HandlerReply {
    if cmd == "ping" {
        return ok();
    }

    if cmd == "register" {
        let id = modules.session.lock().register_controllee(conn.clone());
        conn.set_data(ConnData::SessionControllee(id));
        return ok();
    }

    if let ConnData::SessionControllee(id) = conn.data() {
        return match cmd {
            "unregister" => {
                let sink = modules.session.lock().unregister_controllee(id)?;
                sink.finalize();
                conn.set_data(ConnData::None);
                ok()
            }
            "event" => {
                let (event, result): (i32, i32) = arg
                    .split_once(':')
                    .and_then(|(e, r)| Some((e.parse().ok()?, r.parse().ok()?)))
                    .ok_or_else(|| {
                        MediaError::InvalidArgument(format!("bad event arg '{arg}'"))
                    })?;
                modules.session.lock().controllee_event(id, event, result, target)?;
                ok()
            }
            "update" => {
                let diff = Metadata::deserialize(arg)?;
                modules.session.lock().update_controllee(id, &diff)?;
                ok()
            }
            other => Err(MediaError::Unsupported(format!("controllee cmd '{other}'"))),
        };
    }

    if cmd == "open" {
        let id = modules.session.lock().open_controller(conn.clone());
        conn.set_data(ConnData::SessionController(id));
        return ok();
    }

    if let ConnData::SessionController(id) = conn.data() {
        return match cmd {
            "close" => {
                let sink = modules.session.lock().close_controller(id)?;
                sink.finalize();
                conn.set_data(ConnData::None);
                ok()
            }
            "set_event" => {
                modules.session.lock().set_controller_event(id)?;
                ok()
            }
            other => {
                let response = modules.session.lock().transact(other, arg)?;
                respond(response)
            }
        };
    }

    Err(MediaError::InvalidArgument(format!("session cmd '{cmd}' without role")))
}

// ─────────────────────────────────────────────────────────────────────────────
// Player / Recorder
// ─────────────────────────────────────────────────────────────────────────────

async fn stream_command(
    modules: &Modules,
    conn: &Arc<Connection>,
    module: ModuleId,
    target: &str,
    cmd: &str,
    arg: &str,
) -> HandlerReply {
    let kind = match module {
        ModuleId::Player => NodeKind::Player,
        _ => NodeKind::Recorder,
    };

    if cmd == "open" {
        let id = modules.graph.open(kind, arg)?;
        conn.set_data(match kind {
            NodeKind::Player => ConnData::Player(id),
            NodeKind::Recorder => ConnData::Recorder(id),
        });
        return ok();
    }

    let id = match (conn.data(), kind) {
        (ConnData::Player(id), NodeKind::Player) => id,
        (ConnData::Recorder(id), NodeKind::Recorder) => id,
        _ => return Err(MediaError::NotFound("no open stream on this connection".into())),
    };

    match cmd {
        "close" => {
            if let Ok(stream) = modules.graph.stream_type(id) {
                set_stream_active(modules, &stream, false);
            }
            modules.graph.close(id)?;
            conn.set_data(ConnData::None);
            conn.finalize();
            ok()
        }
        "set_event" => {
            modules.graph.set_event_sink(id, conn.clone())?;
            ok()
        }
        "prepare" => {
            if target.is_empty() {
                modules.graph.command(id, "prepare", arg)?;
            } else {
                // Buffer mode: target carries the client cpu, arg the
                // socket key to dial.
                modules.graph.prepare_buffered(id, target, arg).await?;
            }
            ok()
        }
        "start" => {
            modules.graph.command(id, "start", arg)?;
            if let Ok(stream) = modules.graph.stream_type(id) {
                set_stream_active(modules, &stream, true);
            }
            ok()
        }
        "stop" => {
            modules.graph.command(id, "stop", arg)?;
            if let Ok(stream) = modules.graph.stream_type(id) {
                set_stream_active(modules, &stream, false);
            }
            ok()
        }
        "set_volume" => {
            let volume: f32 = arg
                .parse()
                .map_err(|_| MediaError::InvalidArgument(format!("volume '{arg}'")))?;
            modules.graph.set_volume(id, volume)?;
            ok()
        }
        "get_volume" => respond(modules.graph.get_volume(id)?.to_string()),
        "take_picture" => {
            modules.graph.take_picture(id, arg)?;
            ok()
        }
        "close_socket" => {
            modules.graph.close_side_channel(id)?;
            ok()
        }
        "pause" | "reset" | "seek" | "set_loop" | "get_playing" | "get_position"
        | "get_duration" | "set_property" | "get_property" => {
            respond(modules.graph.command(id, cmd, arg)?)
        }
        other => Err(MediaError::Unsupported(format!("stream cmd '{other}'"))),
    }
}

/// Mirrors stream activity into the `ActiveStreams` policy criterion.
fn set_stream_active(modules: &Modules, stream: &str, active: bool) {
    let mut policy = modules.policy.lock();
    let result = if active {
        policy.include(ACTIVE_STREAMS_CRITERION, stream, true)
    } else {
        policy.exclude(ACTIVE_STREAMS_CRITERION, stream, true)
    };
    if let Err(err) = result {
        log::debug!("[Server] ActiveStreams {stream} ({active}): {err}");
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Graph
// ─────────────────────────────────────────────────────────────────────────────

fn graph_command(modules: &Modules, target: &str, cmd: &str, arg: &str) -> HandlerReply {
    match cmd {
        "dump" => {
            modules.graph.dump();
            ok()
        }
        _ => respond(modules.graph.graph_command(target, cmd, arg)?),
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Policy
// ─────────────────────────────────────────────────────────────────────────────

fn policy_command(
    modules: &Modules,
    conn: &Arc<Connection>,
    name: &str,
    cmd: &str,
    value: &str,
    apply: bool,
) -> HandlerReply {
    let mut policy = modules.policy.lock();
    match cmd {
        "ping" => ok(),
        "subscribe" => {
            policy.subscribe(name, conn.conn_id, conn.clone())?;
            conn.set_data(ConnData::PolicySubscriber);
            ok()
        }
        "unsubscribe" => {
            policy.unsubscribe(conn.conn_id);
            conn.set_data(ConnData::None);
            conn.finalize();
            ok()
        }
        "set_int" => {
            let parsed: i32 = value
                .parse()
                .map_err(|_| MediaError::InvalidArgument(format!("int '{value}'")))?;
            policy.set_int(name, parsed, apply)?;
            ok()
        }
        "get_int" => respond(policy.get_int(name)?.to_string()),
        "set_string" => {
            policy.set_string(name, value, apply)?;
            ok()
        }
        "get_string" => Ok((0, policy.get_string(name)?)),
        "include" => {
            policy.include(name, value, apply)?;
            ok()
        }
        "exclude" => {
            policy.exclude(name, value, apply)?;
            ok()
        }
        "contain" => {
            let contained = policy.contain(name, value)?;
            respond(if contained { "1".into() } else { "0".into() })
        }
        "increase" => {
            policy.increase(name, apply)?;
            ok()
        }
        "decrease" => {
            policy.decrease(name, apply)?;
            ok()
        }
        "dump" => {
            for line in policy.dump().lines() {
                log::info!("[Policy] {line}");
            }
            ok()
        }
        other => Err(MediaError::Unsupported(format!("policy cmd '{other}'"))),
    }
}

/// Detaches a closed connection's module state and closes its notify side.
pub(crate) fn harvest(modules: &Modules, conn: &Arc<Connection>) {
    conn.set_dead();
    match conn.data() {
        ConnData::Focus(client_id) => {
            let _ = modules.focus.lock().abandon_client(client_id);
        }
        ConnData::SessionControllee(id) => {
            let _ = modules.session.lock().unregister_controllee(id);
        }
        ConnData::SessionController(id) => {
            let _ = modules.session.lock().close_controller(id);
        }
        ConnData::Player(id) | ConnData::Recorder(id) => {
            if let Ok(stream) = modules.graph.stream_type(id) {
                set_stream_active(modules, &stream, false);
            }
            let _ = modules.graph.close(id);
        }
        ConnData::PolicySubscriber => {
            modules.policy.lock().unsubscribe(conn.conn_id);
        }
        ConnData::None => {}
    }
    conn.set_data(ConnData::None);
    conn.finalize();
}
