use thiserror::Error;

#[derive(Error, Debug)]
pub enum AppError {
    #[error("Registry API error: {0}")]
    RegistryApi(String),

    #[error("Registry authentication failed (401)")]
    Unauthorized,

    #[error("Registry {0} not found")]
    RegistryNotFound(i64),

    #[error("Invalid {field} pattern: {source}")]
    InvalidPattern {
        field: &'static str,
        #[source]
        source: regex::Error,
    },

    #[error("Scanner {scanner} failed: {detail}")]
    Scan { scanner: String, detail: String },

    #[error("Scheduler is {0}, cannot start")]
    SchedulerState(String),
}
