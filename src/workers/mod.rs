pub mod reconciliation;

pub use reconciliation::{CycleReport, ReconciliationWorker};
