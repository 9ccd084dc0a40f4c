//! Units of work for gitds.
//!
//! A unit of work is a scoped execution context bound to the connection's
//! staged index. The outermost unit commits once; nested units share its
//! index and leave the commit to it.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │          Database::exec / transaction / branch_and_merge    │
//! │      (runners: batch mode, commit, notify, merge back)      │
//! └─────────────────────────────────────────────────────────────┘
//!                              │
//!        ┌─────────────────────┼─────────────────────┐
//!        │                     │                     │
//!        ▼                     ▼                     ▼
//!  ┌─────────────┐       ┌─────────────┐       ┌─────────────┐
//!  │  UnitScope  │       │  Command /  │       │  Outcome /  │
//!  │  (frame)    │       │ Transaction │       │   Abort     │
//!  └─────────────┘       └─────────────┘       └─────────────┘
//! ```
//!
//! # Usage
//!
//! ```ignore
//! use gitds::db::Database;
//!
//! let db = Database::open("./store")?;
//!
//! // a Command always commits when it completes
//! db.exec(|cmd| cmd.add("widget/w1/color", "red\n"))?;
//!
//! // a Transaction can roll back
//! let committed = db.transaction(|tx| {
//!     tx.add("widget/w1/color", "blue\n")?;
//!     Err(tx.rollback("not today"))
//! })?;
//! assert!(!committed);
//! ```

mod context;
mod manager;
mod outcome;

pub(crate) use context::UnitFrame;
pub use context::{Command, Transaction};
pub use outcome::{Abort, BranchOutcome, Outcome};
