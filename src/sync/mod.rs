//! Client-side board state and optimistic writes.
//!
//! - [`state::BoardState`] reconciles change events into a per-project view
//! - [`pending::PendingWrites`] tracks fields with unconfirmed local edits
//! - [`bulk`] runs multi-item operations as independent per-item writes
//! - [`session::BoardSession`] ties the view to a store and a subscription

pub mod bulk;
pub mod pending;
pub mod remote;
pub mod session;
pub mod state;

pub use bulk::{bulk_delete, bulk_move};
pub use pending::{PendingToken, PendingWrites};
pub use remote::{BoardReader, BoardWriter};
pub use session::{BoardSession, event_sink};
pub use state::{ApplyOutcome, BoardState};
