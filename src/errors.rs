use std::error::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MirrorErrorType {
    NotFound,
    InvalidPath,
    InvalidRange,
    InvalidSettings,
    IOError,
    WatchError,
    InternalError,
}

impl From<MirrorErrorType> for warp::http::StatusCode {
    fn from(error_type: MirrorErrorType) -> Self {
        match error_type {
            MirrorErrorType::NotFound => warp::http::StatusCode::NOT_FOUND,
            MirrorErrorType::InvalidPath => warp::http::StatusCode::BAD_REQUEST,
            MirrorErrorType::InvalidRange => warp::http::StatusCode::RANGE_NOT_SATISFIABLE,
            _ => warp::http::StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

#[derive(Debug)]
pub struct MirrorError {
    pub error_type: MirrorErrorType,
    pub message: String,
}

impl warp::Reply for MirrorError {
    fn into_response(self) -> warp::reply::Response {
        warp::reply::with_status(warp::reply::json(&self.message), self.error_type.into())
            .into_response()
    }
}

impl MirrorError {
    pub fn new(error_type: MirrorErrorType, message: String) -> Self {
        Self {
            error_type,
            message,
        }
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(MirrorErrorType::NotFound, message.into())
    }
}

impl std::fmt::Display for MirrorError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:?}: {}", self.error_type, self.message)
    }
}

impl From<std::io::Error> for MirrorError {
    fn from(error: std::io::Error) -> Self {
        Self {
            error_type: MirrorErrorType::IOError,
            message: error.to_string(),
        }
    }
}

impl From<notify::Error> for MirrorError {
    fn from(error: notify::Error) -> Self {
        Self {
            error_type: MirrorErrorType::WatchError,
            message: error.to_string(),
        }
    }
}

impl From<serde_json::Error> for MirrorError {
    fn from(error: serde_json::Error) -> Self {
        Self {
            error_type: MirrorErrorType::InvalidSettings,
            message: error.to_string(),
        }
    }
}

impl From<tokio::task::JoinError> for MirrorError {
    fn from(error: tokio::task::JoinError) -> Self {
        Self {
            error_type: MirrorErrorType::InternalError,
            message: format!("Background task failed: {}", error),
        }
    }
}

impl Error for MirrorError {}

pub type Result<T> = std::result::Result<T, MirrorError>;

#[cfg(test)]
mod tests {
    use super::*;
    use warp::http::StatusCode;
    use warp::Reply;

    #[test]
    fn error_types_map_to_status_codes() {
        let status: StatusCode = MirrorErrorType::NotFound.into();
        assert_eq!(status, StatusCode::NOT_FOUND);
        let status: StatusCode = MirrorErrorType::InvalidRange.into();
        assert_eq!(status, StatusCode::RANGE_NOT_SATISFIABLE);
        let status: StatusCode = MirrorErrorType::WatchError.into();
        assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
    }

    #[test]
    fn io_errors_become_io_error_type() {
        let err: MirrorError =
            std::io::Error::new(std::io::ErrorKind::UnexpectedEof, "short read").into();
        assert_eq!(err.error_type, MirrorErrorType::IOError);
        assert!(err.to_string().contains("short read"));
    }

    #[test]
    fn reply_uses_error_status() {
        let response = MirrorError::not_found("nothing here").into_response();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }
}
