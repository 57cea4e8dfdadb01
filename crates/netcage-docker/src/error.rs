use std::io;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum DockerError {
    #[error("docker socket {0} not found")]
    SocketNotFound(String),

    #[error("{0} is not a unix socket")]
    NotASocket(String),

    #[error("no write permission on {0}")]
    NoWritePermission(String),

    #[error("failed to get metadata of {0}")]
    FailedToGetMetadata(String),

    #[error("error converting {0:?} to a C string")]
    CStringConversion(#[from] std::ffi::NulError),

    #[error("error building request")]
    RequestBuilder(#[from] hyper::http::Error),

    #[error("request to the docker daemon failed")]
    Request(#[from] hyper_util::client::legacy::Error),

    #[error("error reading response body")]
    Body(#[from] hyper::Error),

    #[error("unexpected response (HTTP {status}): {message}")]
    UnexpectedResponse { status: u16, message: String },

    #[error("malformed response from the docker daemon")]
    Deserialize(#[from] serde_json::Error),

    #[error("container {0} is not running")]
    ContainerNotRunning(String),

    #[error("reading pidfile {path} failed")]
    Pidfile {
        #[source]
        source: io::Error,
        path: String,
    },

    #[error("pidfile {0} does not contain a PID")]
    MalformedPidfile(String),
}
