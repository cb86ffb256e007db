use std::{borrow::Cow, io, string};
use thiserror::Error;

pub type Result<T, E = Error> = std::result::Result<T, E>;

#[derive(Error, Debug)]
pub enum Error {
    #[error("Io error")]
    Io(#[from] io::Error),
    #[error("toml parsing error")]
    Toml(#[from] toml::de::Error),
    #[error("json error")]
    Json(#[from] serde_json::Error),
    #[error("http error")]
    Http(#[from] hyper::Error),
    #[error("malformed http response")]
    HttpResponse(#[from] hyper::http::Error),
    #[error("github request error")]
    Request(#[from] reqwest::Error),
    #[error("utf8 error")]
    Utf8(#[from] string::FromUtf8Error),
    #[error("task join error")]
    Join(#[from] tokio::task::JoinError),
    #[error("`{0}`")]
    Message(Cow<'static, str>),
}

impl From<&'static str> for Error {
    fn from(error: &'static str) -> Self {
        Error::Message(error.into())
    }
}

impl From<String> for Error {
    fn from(error: String) -> Self {
        Error::Message(error.into())
    }
}
