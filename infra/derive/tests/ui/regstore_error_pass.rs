use regstore_derive::regstore_error;
use std::borrow::Cow;

#[regstore_error]
pub enum BlobError {
    #[error("Blob missing{}: {message}", format_context(.context))]
    Missing { message: Cow<'static, str>, context: Option<Cow<'static, str>> },

    #[error("I/O error{}: {source}", format_context(.context))]
    Io { source: std::io::Error, context: Option<Cow<'static, str>> },

    #[error("Internal error{}: {message}", format_context(.context))]
    Internal { message: Cow<'static, str>, context: Option<Cow<'static, str>> },
}

fn load() -> Result<Vec<u8>, BlobError> {
    std::fs::read("/nonexistent/blob").context("Loading blob")
}

fn main() {
    let err = load().unwrap_err();
    assert!(matches!(err, BlobError::Io { context: Some(_), .. }));

    let err: BlobError = "boom".into();
    assert_eq!(err.to_string(), "Internal error: boom");
}
