pub mod config;
pub mod error;
pub mod telemetry;
pub mod types;

pub use config::OptimizerConfig;
pub use error::{OptimizerError, OptimizerResult};
pub use telemetry::{RecoveryKind, RecoverySnapshot, RecoveryTelemetry};
