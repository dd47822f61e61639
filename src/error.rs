use thiserror::Error;

/// The failures that are surfaced to the caller of a request. Everything else (decode failures,
///  responses for unknown ids, id collisions, lost connections) is handled inside the client and
///  only shows up in the logs.
#[derive(Debug, Error)]
pub enum RequestError {
    /// The request could not be encoded. Nothing was sent and nothing was registered.
    #[error("error encoding request: {0}")]
    Encode(#[source] anyhow::Error),

    #[error("sending request failed after {attempts} attempts: {source}")]
    WriteRetriesExhausted {
        attempts: usize,
        #[source]
        source: anyhow::Error,
    },

    #[error("client is closed")]
    Closed,
}
