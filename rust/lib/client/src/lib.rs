//! Pulse collaborators.
//!
//! The client core never talks to a backend directly. It consumes the
//! traits in [`collab`]; this crate provides an in-process implementation
//! ([`MemoryBackend`]) and the hosted one ([`RestBackend`],
//! [`RealtimeSocket`], [`ChatCompletionGenerator`]).
//!
//! ```ignore
//! let backend = Arc::new(MemoryBackend::new());
//! let services = backend.clone().into_services();
//! let rows = services.data.select(&Query::table(table::POSTS).limit(20)).await?;
//! ```

pub mod collab;
pub mod generate;
pub mod memory;
pub mod query;
pub mod realtime;
pub mod rest;
pub mod row;
pub mod socket;

pub use collab::{
    AuthProvider, ChangeEvent, ChangeOp, ChannelFilter, DataStore, EventSink, ObjectStorage,
    Realtime, Services, Session, SessionEvent, SubscriptionGuard, TextGenerator,
};
pub use generate::ChatCompletionGenerator;
pub use memory::{MemoryBackend, Op};
pub use query::{Filter, Query};
pub use realtime::RealtimeHub;
pub use rest::RestBackend;
pub use row::{table, Row};
pub use socket::RealtimeSocket;
