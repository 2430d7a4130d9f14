//! mediad core - on-device media control plane.
//!
//! A single long-lived daemon brokers playback, capture, routing policy,
//! audio-focus arbitration and now-playing session control for client
//! processes on the same or remote CPUs. Clients never touch the audio
//! pipeline directly: they drive typed RPC handles over a framed socket
//! protocol and receive asynchronous events on a reverse channel the
//! daemon dials back to them.
//!
//! # Architecture
//!
//! - [`parcel`]: framed, typed, length-prefixed messages and their codec
//! - [`transport`]: endpoint naming and unix/tcp stream transports
//! - [`server`]: the daemon - connection table, dispatch, reverse notify
//! - [`focus`]: matrix-driven audio-focus arbitration stack
//! - [`session`]: controller/controllee mediation with most-active routing
//! - [`graph`]: player/recorder registry over claimable DSP nodes
//! - [`policy`]: criterion store with subscriptions and debounced persist
//! - [`client`]: async proxy, blocking client and typed wrappers
//! - [`config`]: daemon configuration
//! - [`error`]: unified error type with wire errno mapping
//!
//! # Seams
//!
//! Two traits keep external collaborators out of the core: the DSP graph
//! hides behind [`graph::AudioNode`], and persisted criterion storage
//! behind [`policy::KvStore`]. Event fan-out from every module goes through
//! [`events::Notifier`], which the daemon implements per connection.

#![warn(clippy::all)]

pub mod client;
pub mod config;
pub mod defs;
pub mod error;
pub mod events;
pub mod focus;
pub mod graph;
pub mod parcel;
pub mod policy;
pub mod server;
pub mod session;
pub mod transport;

// Re-export commonly used types at the crate root
pub use client::{
    ControlleeClient, FocusClient, PlayerClient, PolicyClient, RecorderClient, RpcProxy,
    SessionClient, SyncClient,
};
pub use config::Config;
pub use defs::{FocusSuggestion, ModuleId};
pub use error::{MediaError, MediaResult};
pub use events::{Notifier, NotifierRef};
pub use focus::{FocusArbiter, InteractionMatrix};
pub use graph::{AudioNode, MediaGraph, NodeKind, NodeSpec};
pub use parcel::{Parcel, ParcelCodec};
pub use policy::{CriterionKind, CriterionSpec, KvStore, PolicyEngine};
pub use server::Daemon;
pub use session::{Metadata, SessionMediator};
pub use transport::TransportConfig;
