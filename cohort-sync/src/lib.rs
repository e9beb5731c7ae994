// SPDX-License-Identifier: MIT OR Apache-2.0

//! Pairwise synchronization of cohort teams.
//!
//! [`connection`] holds the per-peer protocol state machine: mutual
//! authentication (optionally consuming an invitation), graph sync, session
//! key negotiation and live updates. [`actor`] drives one machine on a tokio
//! task; [`coordinator`] multiplexes many shares over one transport and
//! buffers traffic for connections that do not exist yet; [`store`]
//! persists shares between runs. Transports are out of scope: adapters move
//! [`Envelope`](message::Envelope)s, framed with [`codec`] when the
//! transport is a byte stream.
pub mod actor;
pub mod codec;
pub mod connection;
pub mod coordinator;
pub mod message;
pub mod store;

pub use actor::{Command, ConnectionHandle};
pub use codec::{CborCodec, CodecError};
pub use connection::{
    Connection, ConnectionError, ConnectionEvent, ConnectionLike, ConnectionState,
    DisconnectReason, TeamHandle,
};
pub use coordinator::{AnonymousConnection, Coordinator, Share, ShareEnvelope, ShareId};
pub use message::{Challenge, Envelope, ErrorKind, IdentityClaim, Message, PeerId};
pub use store::{ShareRecord, ShareStore, ShareStoreError};
