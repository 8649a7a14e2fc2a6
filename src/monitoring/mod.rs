pub mod notifier;
pub mod periodic;

pub use notifier::{Condition, LogNotifier, Notifier, RecordingNotifier};
pub use periodic::spawn_periodic_balance;
