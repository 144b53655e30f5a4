use thiserror::Error;

/// Failure categories for the simulation host. Each maps to the process
/// exit status the command-line tools report.
#[derive(Error, Debug)]
pub enum Error {
    #[error("unknown arguments: {0}")]
    UnknownArgs(String),

    #[error("{0}")]
    InvalidArgs(String),

    #[error("{0}")]
    Library(String),

    #[error("unable to open file \"{0}\"")]
    ParamFileNotFound(String),

    #[error("{0}")]
    InvalidParams(String),

    #[error("unable to save statistics: {0}")]
    StatsSave(String),

    #[error("{0}")]
    OutOfResources(String),
}

pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// Process exit status for this failure category.
    pub fn exit_code(&self) -> i32 {
        match self {
            Error::UnknownArgs(_) => -1,
            Error::InvalidArgs(_) => -2,
            Error::Library(_) => -3,
            Error::ParamFileNotFound(_) => -4,
            Error::InvalidParams(_) => -5,
            Error::StatsSave(_) => -6,
            Error::OutOfResources(_) => -8,
        }
    }
}

/// Print the error the way the simulators report failures and convert it
/// into the process exit status.
pub fn exit_with(e: Error) -> ! {
    eprintln!("Error: {}", e);
    std::process::exit(e.exit_code())
}
