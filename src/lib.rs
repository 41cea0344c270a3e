#![cfg_attr(test, deny(rust_2018_idioms))]

//! # brazier
//!
//! An embeddable HTTP/1.1 engine for resource-constrained servers and
//! clients.
//!
//! The engine accepts and issues HTTP requests, drives each request through
//! a pipeline of filters and a terminal connector, enforces per-connection
//! limits and timeouts, and reports errors uniformly to both peers and
//! application code.
//!
//! ## Shape
//!
//! - An [`Engine`] is the process-wide registry: active connections, the
//!   stage registry, default limits, the date cache, and the maintenance
//!   timer that aborts expired requests.
//! - A [`Conn`] is one connection: its transport, its RX/TX contexts, and
//!   the bidirectional queue pipeline packets travel through.
//! - A [`Stage`] is a pipeline element (handler, filter, or connector)
//!   with a fixed callback set; applications can register their own.
//! - A [`Route`] names the stages and policies for one matched request;
//!   routing itself is a collaborator behind the [`Router`] seam, as are
//!   the transport ([`Transport`]) and credential stores ([`AuthBackend`]).
//!
//! The engine performs no socket I/O of its own: the embedding application
//! hands each connection a non-blocking [`Transport`] and feeds received
//! bytes to [`Conn::input`].

#[doc(no_inline)]
pub use http::{header, HeaderMap, Method, StatusCode, Uri, Version};

pub use crate::auth::{AuthBackend, ConfigBackend};
pub use crate::conn::{Conn, Event, Fault, IoEvent, Rx, State, TimeoutReason, Tx};
pub use crate::engine::{ConnRef, Engine};
pub use crate::error::{Error, Result};
pub use crate::limits::Limits;
pub use crate::packet::{Packet, PacketKind};
pub use crate::queue::{Dir, QueueId};
pub use crate::route::{FixedRouter, Route, Router};
pub use crate::stage::{Stage, StageKind};
pub use crate::status::reason;
pub use crate::transport::Transport;

mod auth;
mod conn;
mod date;
mod engine;
mod error;
mod limits;
#[cfg(test)]
mod mock;
mod packet;
mod parse;
mod pipeline;
mod queue;
mod route;
pub mod stage;
pub mod status;
mod transport;
