pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("invalid configuration: {0}")]
    InvalidConfiguration(String),
    #[error("chunk {index} not found (total chunks: {total})")]
    ChunkOutOfRange { index: usize, total: usize },
    #[error("{what}: {source}")]
    UpstreamFetch {
        what: String,
        #[source]
        source: BoxError,
    },
    #[error("{what}: {source}")]
    PartialEnrichment {
        what: String,
        #[source]
        source: BoxError,
    },
    #[error("stale result discarded for {target}")]
    StaleResultDiscarded { target: String },
}

impl Error {
    pub(crate) fn upstream(what: impl Into<String>, err: anyhow::Error) -> Self {
        Error::UpstreamFetch {
            what: what.into(),
            source: err.into(),
        }
    }

    pub(crate) fn enrichment(what: impl Into<String>, err: anyhow::Error) -> Self {
        Error::PartialEnrichment {
            what: what.into(),
            source: err.into(),
        }
    }

    pub fn is_invalid_configuration(&self) -> bool {
        matches!(self, Error::InvalidConfiguration(_))
    }
}
