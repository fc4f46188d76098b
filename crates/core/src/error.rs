use thiserror::Error;

#[derive(Error, Debug)]
pub enum JobError {
    #[error("schedule failed: {0}")]
    Schedule(String),

    #[error("job {job} panicked while starting: {message}")]
    Panicked { job: String, message: String },

    #[error("config error: {0}")]
    Config(String),

    #[error("config parse error: {0}")]
    ConfigParse(#[from] toml::de::Error),

    #[error("config I/O error: {0}")]
    ConfigIo(#[from] std::io::Error),
}
