use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file: {0}")]
    ReadFile(#[from] std::io::Error),
    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("validation error: {0}")]
    Validation(String),
    #[error("missing [{0}] section in config")]
    MissingSection(&'static str),
}

#[derive(Debug, Error)]
pub enum ConnectorError {
    #[error("{connector}: authentication failed: {message}")]
    Auth { connector: String, message: String },
    #[error("{connector}: HTTP request failed for {url}: {source}")]
    Http {
        connector: String,
        url: String,
        source: reqwest::Error,
    },
    #[error("{connector}: API returned {status}: {body}")]
    Api {
        connector: String,
        status: u16,
        body: String,
    },
    #[error("{connector}: failed to parse response: {message}")]
    Parse { connector: String, message: String },
    #[error("no source returned data for {url}")]
    AllSourcesFailed { url: String },
}

#[derive(Debug, Error)]
pub enum GenerationError {
    #[error("oracle request failed: {0}")]
    Request(String),
    #[error("oracle API returned {status}: {body}")]
    Api { status: u16, body: String },
    #[error("oracle returned no content")]
    EmptyResponse,
    #[error("oracle call failed after {attempts} attempts: {last_error}")]
    RetriesExhausted { attempts: u32, last_error: String },
    #[error("oracle output is not valid JSON: {0}")]
    InvalidJson(#[from] serde_json::Error),
    #[error("oracle output does not match the response shape: {0}")]
    Shape(String),
}

#[derive(Debug, Error)]
pub enum MailError {
    #[error("invalid mail address '{address}': {message}")]
    Address { address: String, message: String },
    #[error("failed to build message: {0}")]
    Build(String),
    #[error("SMTP delivery failed: {0}")]
    Send(String),
}
