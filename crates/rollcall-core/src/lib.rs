//! rollcall-core: Face matching and attendance recording engine.
//!
//! Compares extractor-produced face descriptors against the enrolled registry
//! and records at most one attendance outcome per identity per calendar day.

pub mod ledger;
pub mod matcher;
pub mod notify;
pub mod registry;
pub mod report;
pub mod store;
pub mod types;

pub use ledger::{Ledger, LedgerError, MarkOutcome};
pub use matcher::{MatchError, Matcher, NearestMatcher};
pub use notify::{LogNotifier, Notifier, NotifyError};
pub use registry::{Registry, RegistryError};
pub use report::{AttendanceStats, RecordFilter, ReportRow, Reports};
pub use store::{
    AttendanceStore, DescriptorStore, IdentityDirectory, InsertOutcome, MemoryStore, StoreError,
};
pub use types::{
    AttendanceRecord, AttendanceStatus, Descriptor, EnrolledFace, Identity, MatchResult,
    MatchedIdentity, Role,
};
