//! Closed error taxonomy for the replicated store.
//!
//! Every public operation returns a [`CResult`]. The taxonomy intentionally
//! stays flat (no nested `anyhow`/`Box<dyn Error>` chains) so that callers on
//! the wire can match on [`Error::kind_name`]'s stable mnemonics
//! (`UIOERROR`, `UNOTSYNC`, ...) directly.

use std::fmt;

/// A single error, tagged with the mnemonic its message corresponds to.
#[derive(Debug)]
pub enum Error {
    /// `UIOERROR` - device or format error.
    Io(String),
    /// `UNOENT` - missing file, key or record.
    NotFound(String),
    /// `UNOMEM` - buffer cache exhausted.
    NoMemory(String),
    /// `UBADTYPE` - operation not valid in the transaction's current mode.
    BadType(String),
    /// `UTWOENDS` - double commit/abort, or re-entrant freeze.
    TwoEnds(String),
    /// `USYNC` - quorum not yet reached, not sync site, or wrong freeze id.
    NotReady(String),
    /// `UNOTSYNC` - write attempted on a non-sync site.
    NotSyncSite,
    /// `UNOQUORUM` - quorum lost mid-operation.
    NoQuorum(String),
    /// `UDEADLOCK` - sync site received a remote write naming itself.
    Deadlock,
    /// `UBADLOCK` - lock state inconsistent with the requested operation.
    BadLock(String),
    /// `UBADHOST` - inconsistent server/cell configuration.
    BadHost(String),
    /// `UBADVERSION` - a version failed validation (epoch <= MILESTONE, in the future, or non-monotonic).
    BadVersion(String),
    /// `UDONE` - transaction already ended.
    Done,
    /// `UBADLOG` - log replay found a malformed or incomplete record.
    BadLog(String),
    /// `UINTERNAL` - an invariant the code relies on was broken.
    Internal(String),
    /// Generic value/formatting error, kept for parity with the encoding helpers.
    Value(String),
    /// Serialization/deserialization failure.
    Parse(String),
}

pub type CResult<T> = Result<T, Error>;

impl Error {
    /// The wire mnemonic this error corresponds to.
    pub fn kind_name(&self) -> &'static str {
        match self {
            Error::Io(_) => "UIOERROR",
            Error::NotFound(_) => "UNOENT",
            Error::NoMemory(_) => "UNOMEM",
            Error::BadType(_) => "UBADTYPE",
            Error::TwoEnds(_) => "UTWOENDS",
            Error::NotReady(_) => "USYNC",
            Error::NotSyncSite => "UNOTSYNC",
            Error::NoQuorum(_) => "UNOQUORUM",
            Error::Deadlock => "UDEADLOCK",
            Error::BadLock(_) => "UBADLOCK",
            Error::BadHost(_) => "UBADHOST",
            Error::BadVersion(_) => "UBADVERSION",
            Error::Done => "UDONE",
            Error::BadLog(_) => "UBADLOG",
            Error::Internal(_) => "UINTERNAL",
            Error::Value(_) => "UVALUE",
            Error::Parse(_) => "UPARSE",
        }
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::Io(msg) => write!(f, "{}: {}", self.kind_name(), msg),
            Error::NotFound(msg) => write!(f, "{}: {}", self.kind_name(), msg),
            Error::NoMemory(msg) => write!(f, "{}: {}", self.kind_name(), msg),
            Error::BadType(msg) => write!(f, "{}: {}", self.kind_name(), msg),
            Error::TwoEnds(msg) => write!(f, "{}: {}", self.kind_name(), msg),
            Error::NotReady(msg) => write!(f, "{}: {}", self.kind_name(), msg),
            Error::NotSyncSite => write!(f, "{}: not the sync site", self.kind_name()),
            Error::NoQuorum(msg) => write!(f, "{}: {}", self.kind_name(), msg),
            Error::Deadlock => write!(f, "{}: sync site addressed itself", self.kind_name()),
            Error::BadLock(msg) => write!(f, "{}: {}", self.kind_name(), msg),
            Error::BadHost(msg) => write!(f, "{}: {}", self.kind_name(), msg),
            Error::BadVersion(msg) => write!(f, "{}: {}", self.kind_name(), msg),
            Error::Done => write!(f, "{}: transaction already ended", self.kind_name()),
            Error::BadLog(msg) => write!(f, "{}: {}", self.kind_name(), msg),
            Error::Internal(msg) => write!(f, "{}: {}", self.kind_name(), msg),
            Error::Value(msg) => write!(f, "{}", msg),
            Error::Parse(msg) => write!(f, "{}", msg),
        }
    }
}

impl std::error::Error for Error {}

impl From<std::io::Error> for Error {
    fn from(e: std::io::Error) -> Self {
        match e.kind() {
            std::io::ErrorKind::NotFound => Error::NotFound(e.to_string()),
            _ => Error::Io(e.to_string()),
        }
    }
}

impl From<bincode::Error> for Error {
    fn from(e: bincode::Error) -> Self {
        Error::Parse(e.to_string())
    }
}

impl From<std::string::FromUtf8Error> for Error {
    fn from(e: std::string::FromUtf8Error) -> Self {
        Error::Parse(e.to_string())
    }
}
