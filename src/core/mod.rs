pub mod actuator;
pub mod domain;
pub mod meminfo;
pub mod planner;
pub mod supervisor;
pub mod telemetry;

pub use actuator::Actuator;
pub use domain::{DomId, DomainState, DomainStatus, Registry, CONTROL_DOMAIN};
pub use meminfo::Meminfo;
pub use planner::{MemsetRequest, PlannerParams};
pub use supervisor::{IngestOutcome, SystemState, Thresholds};
pub use telemetry::Telemetry;
