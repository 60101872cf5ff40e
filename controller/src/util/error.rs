#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("kubernetes API denied the request (RBAC misconfigured?): {source}")]
    Unauthorized {
        #[source]
        source: kube::Error,
    },

    #[error("watch history compacted, resource_version no longer valid")]
    HistoryCompacted,

    #[error("kubernetes reported error: {source}")]
    Kube {
        #[from]
        source: kube::Error,
    },

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("json error: {source}")]
    Json {
        #[from]
        source: serde_json::Error,
    },
}

pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// Classifies a raw `kube::Error` into the distinguished variants the
    /// watch loop and supervisor match on.
    pub fn from_kube(source: kube::Error) -> Error {
        if let kube::Error::Api(api_err) = &source {
            if api_err.code == 401 || api_err.code == 403 {
                return Error::Unauthorized { source };
            }
            if api_err.code == 410 {
                return Error::HistoryCompacted;
            }
        }
        Error::Kube { source }
    }

    pub fn is_conflict(&self) -> bool {
        matches!(self, Error::Kube { source: kube::Error::Api(e) } if e.code == 409)
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, Error::Kube { source: kube::Error::Api(e) } if e.code == 404)
    }
}
