use thiserror::Error;

#[derive(Debug, Error)]
pub enum DatabaseError {
    #[error(transparent)]
    Sled(#[from] sled::Error),
    #[error("malformed value under key `{0}`")]
    Corrupt(String),
    #[error("error serializing value: {0}")]
    Serialize(#[source] serde_json::Error),
    #[error("error deserializing value under key `{0}`: {1}")]
    Deserialize(String, #[source] serde_json::Error),
}
