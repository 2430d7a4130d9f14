//! Client-side access to the daemon.
//!
//! Two transports: [`proxy::RpcProxy`], the event-loop-driven asynchronous
//! proxy with pending-write queueing and reverse-listener support, and
//! [`sync::SyncClient`], the older blocking API that serializes callers on
//! a per-connection mutex. The typed wrappers (focus, session, player,
//! recorder, policy) sit on top of either.

pub mod focus;
pub mod graph;
pub mod policy;
pub mod proxy;
pub mod session;
pub mod sync;

pub use focus::FocusClient;
pub use graph::{PlayerClient, RecorderClient};
pub use policy::PolicyClient;
pub use proxy::{ConnectEvents, ProxyControl, ReplyHook, RpcProxy};
pub use session::{ControlleeClient, SessionClient};
pub use sync::SyncClient;

use crate::defs::{ModuleId, PARCEL_REPLY, PARCEL_SEND_ACK};
use crate::error::{MediaError, MediaResult};
use crate::parcel::Parcel;

/// Default response buffer size advertised in requests.
pub(crate) const RESP_LEN: i32 = 512;

/// Builds a `target, cmd, arg` request for graph/player/recorder/session.
pub(crate) fn control_request(module: ModuleId, target: &str, cmd: &str, arg: &str) -> Parcel {
    let mut parcel = Parcel::with_code(PARCEL_SEND_ACK);
    parcel.append_i32(module as i32);
    parcel.append_str(target);
    parcel.append_str(cmd);
    parcel.append_str(arg);
    parcel.append_i32(RESP_LEN);
    parcel
}

/// Builds a focus request (`target, cmd`, no arg field).
pub(crate) fn focus_request(target: &str, cmd: &str) -> Parcel {
    let mut parcel = Parcel::with_code(PARCEL_SEND_ACK);
    parcel.append_i32(ModuleId::Focus as i32);
    parcel.append_str(target);
    parcel.append_str(cmd);
    parcel.append_i32(RESP_LEN);
    parcel
}

/// Builds a policy request (`name, cmd, value, apply`).
pub(crate) fn policy_request(name: &str, cmd: &str, value: &str, apply: bool) -> Parcel {
    let mut parcel = Parcel::with_code(PARCEL_SEND_ACK);
    parcel.append_i32(ModuleId::Policy as i32);
    parcel.append_str(name);
    parcel.append_str(cmd);
    parcel.append_str(value);
    parcel.append_i32(apply as i32);
    parcel.append_i32(RESP_LEN);
    parcel
}

/// Splits a reply into `(ret, response)`, mapping negative `ret` to the
/// matching error.
pub(crate) fn parse_reply(mut reply: Parcel) -> MediaResult<(i32, String)> {
    if reply.code() != PARCEL_REPLY {
        return Err(MediaError::InvalidArgument(format!(
            "unexpected reply code {}",
            reply.code()
        )));
    }
    let ret = reply.read_i32()?;
    let response = reply.read_string().unwrap_or_default();
    if ret < 0 {
        return Err(MediaError::from_errno(ret));
    }
    Ok((ret, response))
}

/// Reads an `(event, result, extra)` notification body.
pub(crate) fn parse_event(parcel: &mut Parcel) -> MediaResult<(i32, i32, String)> {
    let event = parcel.read_i32()?;
    let result = parcel.read_i32()?;
    let extra = parcel.read_string().unwrap_or_default();
    Ok((event, result, extra))
}
