//! Client session synchronization for the Casebook investigation console.
//!
//! [`ClientStore`] keeps one client's session (record, access, approvals,
//! history, flows, results, scheduled flows) in sync with the remote
//! case-management API by running cancellable polling loops, and exposes the
//! merged state plus change and error notifications.

pub mod config;
pub mod error;
pub mod history;
pub mod poll;
pub mod scope;
pub mod state;
pub mod store;
pub mod telemetry;

pub use config::{SyncConfig, DEFAULT_POLLING_INTERVAL};
pub use error::{PollSource, StoreError, SyncError};
pub use history::{merge_history, ClientHistoryEntry};
pub use state::{
    Field, FieldVersions, FlowResults, SessionState, StateUpdate, StoreEvent, FLOWS_PAGE_SIZE,
};
pub use store::{ClientStore, FlowLaunch, FlowResultsQuery};
