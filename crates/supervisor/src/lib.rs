//! Account lifecycle management: reconciliation between desired and
//! running state, session reconnect policy, and pipeline hot-swapping.

mod account;

pub mod backoff;
pub mod diff;
pub mod session;
pub mod supervisor;

pub use {
    backoff::{ReconnectDecision, ReconnectPolicy, ReconnectState},
    diff::AccountDiff,
    session::{ConnectError, SessionConnector, SessionControl, SessionEvent, SessionHandle},
    supervisor::{AccountSupervisor, SupervisorOptions},
};
