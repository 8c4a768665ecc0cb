//! Throttling state, policies and the decision engine.

mod clock;
mod identifier;
mod policy;
mod record;
mod store;
mod sweeper;

pub use clock::{Clock, ManualClock, SystemClock};
pub use identifier::{fingerprint, parse_forwarded_list, Identifier, RequestMeta};
pub use policy::{Policy, PolicyCatalog, PolicyOverride, RouteClass, DEFAULT_MAX_PENALTY_LEVEL};
pub use record::{Decision, Record};
pub use store::{RecordStore, StoreStats, SweepReport};
pub use sweeper::{LastSweep, Sweeper, SweeperHandle};
