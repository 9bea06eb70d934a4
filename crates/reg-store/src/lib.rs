//! # scscf-reg-store
//!
//! The registration store: per-AoR binding and subscription sets persisted
//! through a compare-and-swap key-value layer, with reg-event NOTIFY
//! generation when a record changes.
//!
//! All mutation follows the optimistic read-modify-write protocol: read the
//! record (with its CAS token), mutate, write back under the token, retry
//! on contention.  A configured backup store warms up an empty local record
//! before modification, which is how a geo-redundant pair recovers state.

pub mod aor;
pub mod error;
pub mod notify;
pub mod store;

pub use aor::{AoR, Binding, BindingEvent, ContactEvent, Subscription};
pub use error::{Result, StoreError};
pub use notify::ReginfoState;
pub use store::{
    CasOutcome, KvStore, MemoryKvStore, NoopTimerService, NotifySink, RegStore, SetOutcome,
    TimerService,
};
