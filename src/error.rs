use std::io;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug)]
pub enum Error {
    IoError(io::Error),
    Decode(&'static str, io::Error),
    ReadError(&'static str, io::Error),
    ChecksumMismatch,
    InvalidData(String),
    // Offload path
    InvalidArgument(String),
    InvalidState(String),
    ResourceExhaustion(&'static str, io::Error),
    ProgramLoad(String, io::Error),
    Corruption(String),
}

impl From<io::Error> for Error {
    fn from(err: io::Error) -> Self {
        Error::IoError(err)
    }
}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Error::IoError(err) => write!(f, "I/O error: {}", err),
            Error::Decode(field, err) => write!(f, "Failed to decode {}: {}", field, err),
            Error::ReadError(context, err) => write!(f, "Failed to read {}: {}", context, err),
            Error::ChecksumMismatch => write!(f, "Checksum mismatch"),
            Error::InvalidData(msg) => write!(f, "Invalid data: {}", msg),
            Error::InvalidArgument(msg) => write!(f, "Invalid argument: {}", msg),
            Error::InvalidState(msg) => write!(f, "Invalid state: {}", msg),
            Error::ResourceExhaustion(what, err) => {
                write!(f, "Failed to allocate {}: {}", what, err)
            }
            Error::ProgramLoad(path, err) => {
                write!(f, "Failed to load offload program {}: {}", path, err)
            }
            Error::Corruption(msg) => write!(f, "Corruption: {}", msg),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Error::IoError(err)
            | Error::Decode(_, err)
            | Error::ReadError(_, err)
            | Error::ResourceExhaustion(_, err)
            | Error::ProgramLoad(_, err) => Some(err),
            _ => None,
        }
    }
}
