pub mod bindings;
pub mod history;

pub use bindings::{BindOutcome, QueryBindings};
pub use history::{
    InMemoryQueryHistory, QueryHistory, QueryHistoryEntry, QueryHistoryImplementation,
};
