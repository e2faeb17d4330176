//! State Management Module
//!
//! Durable term/vote bookkeeping and cluster membership.

mod ledger;
mod membership;

pub use ledger::{HardState, Ledger, MemoryLedger, SqliteLedger};
pub use membership::{MemberInfo, Membership, NodeDescriptor, NodeId, NodeRole};
