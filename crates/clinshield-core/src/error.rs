use thiserror::Error;

#[derive(Error, Debug)]
pub enum AnonError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Parse error: {0}")]
    Parse(String),

    #[error("Invalid mechanism parameter: {0}")]
    Domain(String),

    #[error("Value pool exhausted")]
    EmptyPool,

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Metric error: {0}")]
    Metric(String),
}

pub type Result<T> = std::result::Result<T, AnonError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_conversions_and_messages() {
        let io: AnonError = std::io::Error::new(std::io::ErrorKind::NotFound, "gone").into();
        assert!(matches!(io, AnonError::Io(_)));

        let json: AnonError = serde_json::from_str::<serde_json::Value>("{").unwrap_err().into();
        assert!(matches!(json, AnonError::Serialization(_)));

        assert_eq!(AnonError::EmptyPool.to_string(), "Value pool exhausted");
        assert_eq!(
            AnonError::Domain("epsilon 0".to_string()).to_string(),
            "Invalid mechanism parameter: epsilon 0"
        );
    }
}
