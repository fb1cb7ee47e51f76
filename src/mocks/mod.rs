//! Mock HTTP servers driven by declarative config.

mod openapi;
mod static_mock;

pub use openapi::{
    OpenApiMock, OpenApiMockMode, ParamSpec, RecordingEntry, RecordingStore, RouteEntry, ValidationIssue,
};
pub use static_mock::{MockResponse, MockRoute, MockServer, MockServerHandle};

use thiserror::Error;

use crate::error::ErrorCode;

#[derive(Debug, Error)]
pub enum MockError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("invalid OpenAPI spec: {0}")]
    InvalidSpec(String),

    #[error("upstream request failed: {0}")]
    Upstream(#[from] reqwest::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl ErrorCode for MockError {
    fn code(&self) -> &'static str {
        match self {
            MockError::Io(_) => "UNKNOWN",
            MockError::InvalidSpec(_) => "CONFIG_ERROR",
            MockError::Upstream(_) => "UPSTREAM_FAILED",
            MockError::Serialization(_) => "UNKNOWN",
        }
    }
}

pub type Result<T> = std::result::Result<T, MockError>;
