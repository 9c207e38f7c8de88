pub mod atomic;
pub mod module_store;
pub mod plan_store;
pub mod tms;

pub use atomic::{write_atomic, write_json_atomic};
pub use module_store::{ModuleManifest, ModuleStore};
pub use plan_store::PlanStore;
pub use tms::TransactionLog;
