//! Flux: published view state for the Pulse client.
//!
//! Page controllers own their collections; after every change they publish
//! an immutable snapshot into a [`StateStore`] under a well-known path. The
//! rendering layer only reads snapshots and subscribes to changes.
//!
//! # Path addressing
//!
//! - Session: `auth/session`, `app/page`
//! - Page slices: `feed/posts`, `stories/tray`, `shorts/reels`
//! - Keyed slices: `profile/{user_id}`, `chat/{user_id}/messages`
//!
//! # Pattern matching
//!
//! Subscriptions use MQTT-style wildcards, also used to route real-time
//! change events to channel subscriptions:
//! - `feed/posts` exact
//! - `profile/+` one level
//! - `chat/#` any depth (including `chat` itself)
//!
//! ```ignore
//! let store = Arc::new(StateStore::new());
//! let mut scope = SubscriptionScope::new(store.clone());
//! scope.subscribe("feed/#", |path, value| println!("{} changed", path));
//! store.set("feed/posts", posts);
//! drop(scope); // stops callbacks
//! ```

pub mod store;
pub mod trie;
pub mod value;

pub use store::{ChangeHandler, StateStore, SubscriptionScope};
pub use trie::Trie;
pub use value::{StateValue, SubscriptionId};
