use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Unknown criterion or archive method, unreadable config.
    Configuration,
    /// Malformed include/exclude glob.
    Pattern,
    Io,
    /// External archiver failed to launch or exited non-zero.
    Process,
    CorruptArchive,
    Cancelled,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ErrorKind::Configuration => "configuration error",
            ErrorKind::Pattern => "pattern error",
            ErrorKind::Io => "i/o error",
            ErrorKind::Process => "process error",
            ErrorKind::CorruptArchive => "corrupt archive",
            ErrorKind::Cancelled => "cancelled",
        };
        f.write_str(s)
    }
}

#[derive(Debug)]
pub struct Error {
    kind: ErrorKind,
    msg: String,
}

impl Error {
    pub fn new<M: Into<String>>(kind: ErrorKind, msg: M) -> Self {
        Self {
            kind,
            msg: msg.into(),
        }
    }

    /// General runtime failure; classified as I/O.
    pub fn msg<M: Into<String>>(msg: M) -> Self {
        Self::new(ErrorKind::Io, msg)
    }

    pub fn config<M: Into<String>>(msg: M) -> Self {
        Self::new(ErrorKind::Configuration, msg)
    }

    pub fn pattern<M: Into<String>>(msg: M) -> Self {
        Self::new(ErrorKind::Pattern, msg)
    }

    pub fn process<M: Into<String>>(msg: M) -> Self {
        Self::new(ErrorKind::Process, msg)
    }

    pub fn corrupt<M: Into<String>>(msg: M) -> Self {
        Self::new(ErrorKind::CorruptArchive, msg)
    }

    pub fn cancelled() -> Self {
        Self::new(ErrorKind::Cancelled, "cancelled")
    }

    pub fn kind(&self) -> ErrorKind {
        self.kind
    }

    pub fn message(&self) -> &str {
        &self.msg
    }

    pub fn is_cancelled(&self) -> bool {
        self.kind == ErrorKind::Cancelled
    }

    /// Re-tag as I/O, keeping cancellation intact.
    pub fn into_io(self) -> Self {
        if self.is_cancelled() {
            return self;
        }
        Self::new(ErrorKind::Io, format!("{}: {}", self.kind, self.msg))
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.msg)
    }
}

impl std::error::Error for Error {}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Self::msg(err.to_string())
    }
}

impl From<toml::de::Error> for Error {
    fn from(err: toml::de::Error) -> Self {
        Self::config(err.to_string())
    }
}

impl From<zip::result::ZipError> for Error {
    fn from(err: zip::result::ZipError) -> Self {
        use zip::result::ZipError;
        match err {
            ZipError::Io(e) => Self::from(e),
            ZipError::InvalidArchive(_) | ZipError::UnsupportedArchive(_) => {
                Self::corrupt(format!("unreadable zip archive: {err}"))
            }
            other => Self::msg(other.to_string()),
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;
