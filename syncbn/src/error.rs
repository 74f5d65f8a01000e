use std::{
    error::Error,
    fmt::{self, Display},
};

/// The result type used in the entire synchronized batch norm module.
pub type Result<T> = std::result::Result<T, SyncBnErr>;

/// The synchronized batch norm module's error type.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncBnErr {
    ChannelMismatch {
        got: usize,
        expected: usize,
    },
    ShapeMismatch {
        a: &'static str,
        b: &'static str,
        got: usize,
        expected: usize,
    },
    MissingParameter {
        name: &'static str,
    },
    DegenerateBatch,
    MissingForwardContext,
    Disconnected,
}

impl Display for SyncBnErr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            SyncBnErr::ChannelMismatch { got, expected } => format!(
                "The input channel dimension doesn't match the layer, got {got} channels and expected {expected}"
            ),
            SyncBnErr::ShapeMismatch {
                a,
                b,
                got,
                expected,
            } => {
                format!(
                    "There's a size mismatch between {a} and {b}, got {got} and expected {expected}"
                )
            }
            SyncBnErr::MissingParameter { name } => {
                format!("The checkpoint state is missing the {name} parameter")
            }
            SyncBnErr::DegenerateBatch => {
                "The combined batch holds zero elements across every device".to_string()
            }
            SyncBnErr::MissingForwardContext => {
                "Backward was called with no cached forward statistics".to_string()
            }
            SyncBnErr::Disconnected => {
                "A rendezvous peer hung up before completing the round".to_string()
            }
        };

        write!(f, "{s}")
    }
}

impl Error for SyncBnErr {}
