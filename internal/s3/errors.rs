use crate::storage::StorageError;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum S3Error {
    NoSuchBucket,
    NoSuchKey,
    BucketAlreadyExists,
    BucketNotEmpty,
    InvalidRequest,
    MalformedXML,
    InternalError,
}

impl S3Error {
    pub fn code(&self) -> &'static str {
        match self {
            S3Error::NoSuchBucket => "NoSuchBucket",
            S3Error::NoSuchKey => "NoSuchKey",
            S3Error::BucketAlreadyExists => "BucketAlreadyExists",
            S3Error::BucketNotEmpty => "BucketNotEmpty",
            S3Error::InvalidRequest => "InvalidRequest",
            S3Error::MalformedXML => "MalformedXML",
            S3Error::InternalError => "InternalError",
        }
    }

    pub fn message(&self) -> &'static str {
        match self {
            S3Error::NoSuchBucket => "The specified bucket does not exist",
            S3Error::NoSuchKey => "The specified key does not exist",
            S3Error::BucketAlreadyExists => "Bucket already exists",
            S3Error::BucketNotEmpty => "The bucket you tried to delete is not empty",
            S3Error::InvalidRequest => "Invalid Request",
            S3Error::MalformedXML => "The XML you provided was not well-formed",
            S3Error::InternalError => "Internal Error",
        }
    }

    pub fn status(&self) -> StatusCode {
        match self {
            S3Error::NoSuchBucket => StatusCode::NOT_FOUND,
            S3Error::NoSuchKey => StatusCode::NOT_FOUND,
            S3Error::BucketAlreadyExists => StatusCode::CONFLICT,
            S3Error::BucketNotEmpty => StatusCode::CONFLICT,
            S3Error::InvalidRequest => StatusCode::BAD_REQUEST,
            S3Error::MalformedXML => StatusCode::BAD_REQUEST,
            S3Error::InternalError => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl From<StorageError> for S3Error {
    fn from(err: StorageError) -> Self {
        match err {
            StorageError::BucketAlreadyExists => S3Error::BucketAlreadyExists,
            StorageError::NoSuchBucket => S3Error::NoSuchBucket,
            StorageError::BucketNotEmpty => S3Error::BucketNotEmpty,
            StorageError::NoSuchKey => S3Error::NoSuchKey,
            StorageError::InvalidBackend(_) | StorageError::Sandbox(_) | StorageError::Io(_) => {
                tracing::error!(error = %err, "storage failure collapsed to internal error");
                S3Error::InternalError
            }
        }
    }
}

/// Shapes an error into its wire form: taxonomy errors become the uniform
/// XML document, anything internal becomes a plain-text 500 so backend
/// details never leak.
pub fn s3_error(error: S3Error) -> Response {
    if error == S3Error::InternalError {
        return (error.status(), "Internal Server Error").into_response();
    }
    let body = format!(
        "<?xml version=\"1.0\" encoding=\"UTF-8\"?><Error><Code>{}</Code><Message>{}</Message></Error>",
        error.code(),
        error.message()
    );
    (error.status(), [("Content-Type", "application/xml")], body).into_response()
}
