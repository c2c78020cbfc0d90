use std::fmt::Display;

use miette::Diagnostic;
use thiserror::Error;

pub use ixtest_core::poll::PollError;
pub use ixtest_core::{AdapterError, Cancelled, LedgerError, ServiceError};

/// The four stages every outgoing transaction goes through, in order
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PipelineStage {
    Plan,
    Authorize,
    Build,
    Broadcast,
}

impl PipelineStage {
    pub fn op(&self) -> &'static str {
        match self {
            Self::Plan => "plan",
            Self::Authorize => "authorize",
            Self::Build => "witness and build",
            Self::Broadcast => "broadcast",
        }
    }
}

impl Display for PipelineStage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.op())
    }
}

#[derive(Error, Debug, Diagnostic)]
pub enum Error {
    #[error("{op} for {target}: {source}")]
    Adapter {
        op: &'static str,
        target: String,
        #[source]
        source: AdapterError,
    },

    #[error("{op} for {target} exited with code {exit_code}: {stderr}")]
    Command {
        op: &'static str,
        target: String,
        exit_code: i64,
        stderr: String,
    },

    #[error("{what} not found for {target}")]
    NotFound { what: &'static str, target: String },

    #[error("{stage} rejected: {source}")]
    #[diagnostic(help("the pipeline was aborted; no later stage ran"))]
    RemoteRejection {
        stage: PipelineStage,
        #[source]
        source: ServiceError,
    },

    #[error("{op}: {source}")]
    Service {
        op: &'static str,
        #[source]
        source: ServiceError,
    },

    #[error("{0} has not been started")]
    #[diagnostic(help("call start() before issuing queries or transactions"))]
    NotStarted(String),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("ledger: {0}")]
    Ledger(#[from] LedgerError),

    #[error(transparent)]
    Poll(#[from] PollError),

    #[error(transparent)]
    Cancelled(#[from] Cancelled),
}

impl Error {
    pub fn adapter(op: &'static str, target: impl Display) -> impl FnOnce(AdapterError) -> Error {
        let target = target.to_string();
        move |source| Error::Adapter { op, target, source }
    }

    pub fn service(op: &'static str) -> impl FnOnce(ServiceError) -> Error {
        move |source| Error::Service { op, source }
    }

    pub fn not_found(what: &'static str, target: impl Display) -> Error {
        Error::NotFound {
            what,
            target: target.to_string(),
        }
    }

    pub fn config(text: impl Display) -> Error {
        Error::Config(text.to_string())
    }

    pub fn serialization(error: impl Display) -> Error {
        Error::Serialization(error.to_string())
    }

    pub fn is_not_found(&self) -> bool {
        matches!(
            self,
            Error::NotFound { .. } | Error::Poll(PollError::NotFound)
        )
    }
}
