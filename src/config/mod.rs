pub mod settings;

pub use settings::{
    Backend, BalancerSettings, HypervisorSettings, IngestSettings, LogFormat, LoggingSettings,
    PlannerSettings, ServerSettings, Settings,
};
