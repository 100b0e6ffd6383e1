use std::error::Error;
use std::fmt::Display;
use std::sync::PoisonError;

#[macro_export]
macro_rules! swarmerr {
    ($($arg:tt)*) => {
        SwarmError::new(format!($($arg)*))
    };
}

#[derive(Debug)]
pub struct SwarmError {
    details: String,
}

impl SwarmError {
    /// Create a new SwarmError.
    pub fn new(details: String) -> SwarmError {
        SwarmError { details }
    }
}

impl Display for SwarmError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Swarm Error: {}", self.details)
    }
}

impl From<anyhow::Error> for SwarmError {
    fn from(value: anyhow::Error) -> Self {
        SwarmError::new(
            value
                .chain()
                .into_iter()
                .map(|err| err.to_string())
                .collect::<Vec<_>>()
                .join(": "),
        )
    }
}

macro_rules! make_errs {
    ($($err_type:ty),+) => {
        $(
            impl From<$err_type> for SwarmError {
                fn from(value: $err_type) -> Self {
                    SwarmError::new(value.to_string())
                }
            }
        )+
    };
}

make_errs!(std::io::Error, serde_json::Error, base64::DecodeError);

impl<T> From<PoisonError<T>> for SwarmError {
    fn from(value: PoisonError<T>) -> Self {
        SwarmError::new(value.to_string())
    }
}

impl Error for SwarmError {}
