//! # groupcast-core
//!
//! The fan-out core of the groupcast relay.
//!
//! Participants join named groups and receive every message any other
//! member sends. All shared state has exactly one owner:
//!
//! - **Registry** - one task owning the map of live groups
//! - **Group** - one task per group owning its membership map
//! - **Pump** - two tasks per participant, one per transport direction
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────┐ create/delete ┌─────────────┐  join/leave  ┌─────────────┐
//! │    Relay    │──────────────▶│  Registry   │─────────────▶│   Group     │
//! └─────────────┘               └─────────────┘              └─────────────┘
//!                                                    broadcast ▲     │ outbound
//!                                                              │     ▼ queues
//!                                                           ┌─────────────┐
//!                                                           │    Pump     │
//!                                                           └─────────────┘
//! ```
//!
//! Shutdown is driven by closing channels: deleting a group closes its
//! broadcast path, the group closes every member's outbound queue, and
//! each pump's send loop closes its socket.

mod error;
pub mod group;
pub mod id;
pub mod message;
pub mod pump;
pub mod registry;
pub mod relay;

pub use error::RelayError;
pub use group::GroupHandle;
pub use id::{validate_group_id, MemberKey, MemberTag};
pub use message::Envelope;
pub use pump::PumpTasks;
pub use registry::RegistryHandle;
pub use relay::{Joined, Relay, RelayConfig, RelayStats};
