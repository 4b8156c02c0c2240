use std::fmt;

#[derive(Debug)]
pub enum Error {
    Io(std::io::Error),
    Corrupt(&'static str),
    UnsupportedFormat(u32),
    InvalidLabelSet,
    EmptyBatch,
    QueueFull,
    Cancelled,
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::Io(err) => write!(f, "io error: {err}"),
            Error::Corrupt(msg) => write!(f, "corrupt segment: {msg}"),
            Error::UnsupportedFormat(version) => write!(f, "unsupported format: v{version}"),
            Error::InvalidLabelSet => write!(f, "label set is empty or contains duplicate names"),
            Error::EmptyBatch => write!(f, "batch contains no records"),
            Error::QueueFull => write!(f, "queue full"),
            Error::Cancelled => write!(f, "operation cancelled"),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Error::Io(err) => Some(err),
            _ => None,
        }
    }
}

impl From<std::io::Error> for Error {
    fn from(value: std::io::Error) -> Self {
        Error::Io(value)
    }
}

pub type Result<T> = std::result::Result<T, Error>;
