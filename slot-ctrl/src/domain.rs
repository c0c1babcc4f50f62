use std::path::PathBuf;
use std::str::FromStr;

use derive_more::Display;
use serde::{Deserialize, Serialize};

pub type Result<T> = std::result::Result<T, Error>;

/// Error definition for library.
#[allow(missing_docs)]
#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("invalid slot `{0}`, only A or B are allowed")]
    InvalidSlot(String),
    #[error("invalid active-slot marker `{}`: `{value}`", path.display())]
    InvalidMarker { path: PathBuf, value: String },
    #[error("failed reading active-slot marker")]
    ReadMarker(#[source] std::io::Error),
    #[error("failed writing active-slot marker")]
    WriteMarker(#[source] std::io::Error),
    #[error("failed removing stale slot temporaries")]
    CleanupTmp(#[source] std::io::Error),
}

/// Representation of the slot.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Display, Serialize, Deserialize)]
pub enum Slot {
    #[display("A")]
    A,
    #[display("B")]
    B,
}

impl Slot {
    /// The slot a rebuild targets while `self` is being exported.
    pub fn opposite(self) -> Slot {
        match self {
            Slot::A => Slot::B,
            Slot::B => Slot::A,
        }
    }
}

impl FromStr for Slot {
    type Err = Error;

    fn from_str(value: &str) -> Result<Slot> {
        match value.trim() {
            "A" | "a" => Ok(Slot::A),
            "B" | "b" => Ok(Slot::B),
            other => Err(Error::InvalidSlot(other.to_owned())),
        }
    }
}
