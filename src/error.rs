use derive_more::From;
use k8s_openapi::serde_json;
use tracing::error;

pub type Result<T> = core::result::Result<T, Error>;

#[derive(Debug, From)]
pub enum Error {
    #[from]
    Json(serde_json::Error),

    #[from]
    Kube(kube::Error),

    #[from]
    Infer(kube::config::InferConfigError),

    #[from]
    HttpHeader(hyper::http::Error),

    #[from]
    Io(std::io::Error),

    #[from]
    Redis(redis::RedisError),

    #[from]
    Bincode(bincode::Error),

    #[from]
    Http(reqwest::Error),

    /// Code/message envelope for RPC-style call sites
    #[from]
    Status(Status),

    /// Several independent failures, e.g. from a parallel fan-out
    Aggregate(Vec<Error>),

    /// Custom error message
    Custom(String),
}

impl Error {
    /// Collapse a list of errors: `None` when empty, the error itself when
    /// there is exactly one, `Aggregate` otherwise
    #[must_use]
    pub fn aggregate(mut errs: Vec<Self>) -> Option<Self> {
        match errs.len() {
            0 => None,
            1 => errs.pop(),
            _ => Some(Self::Aggregate(errs)),
        }
    }

    /// Status code of this error, if it carries one
    #[must_use]
    pub const fn code(&self) -> Option<Code> {
        match self {
            Self::Status(status) => Some(status.code),
            _ => None,
        }
    }
}

impl core::fmt::Display for Error {
    fn fmt(&self, fmt: &mut core::fmt::Formatter) -> core::result::Result<(), core::fmt::Error> {
        match self {
            Self::Status(status) => write!(fmt, "{status}"),
            Self::Aggregate(errs) => {
                let msgs: Vec<String> = errs.iter().map(ToString::to_string).collect();
                write!(fmt, "[{}]", msgs.join(", "))
            }
            Self::Custom(msg) => write!(fmt, "{msg}"),
            _ => write!(fmt, "{self:?}"),
        }
    }
}

impl std::error::Error for Error {}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Code {
    Internal,
    InvalidArgument,
    FailedPrecondition,
    NotFound,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Status {
    pub code: Code,
    pub message: String,
}

impl core::fmt::Display for Status {
    fn fmt(&self, fmt: &mut core::fmt::Formatter) -> core::result::Result<(), core::fmt::Error> {
        write!(fmt, "rpc error: code = {:?} desc = {}", self.code, self.message)
    }
}

/// Process-wide sink for errors that have nowhere to propagate to, e.g.
/// failures inside background workers. Logs, never panics.
pub fn handle_error(err: &Error) {
    error!("❌ {}", err);
}
