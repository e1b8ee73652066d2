//! Image lifecycle state machine.
//!
//! Every image walks the same forward pipeline; the only backward edge is
//! any non-terminal state to `Failed`. States are stored as uppercase
//! strings in the catalog and converted at the persistence boundary only.

use thiserror::Error;

/// Lifecycle state of an image.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ImageState {
    /// Recorded; not yet started.
    New,
    /// Worker has committed to fetching.
    Downloading,
    /// Blob present and hash-verified.
    Downloaded,
    /// Worker has committed to extracting.
    Unpacking,
    /// Image root populated from the blob.
    Unpacked,
    /// Bookkeeping marker; no side effect.
    Stored,
    /// Worker has committed to mounting.
    Activating,
    /// Overlay mount live and usable.
    Active,
    /// Terminal error; no further transitions.
    Failed,
}

/// Returned when a persisted state string is not a known state.
#[derive(Debug, Error, PartialEq, Eq)]
#[error("unknown image state: {0}")]
pub struct UnknownState(pub String);

/// All states, in pipeline order (`Failed` last).
pub const ALL_STATES: [ImageState; 9] = [
    ImageState::New,
    ImageState::Downloading,
    ImageState::Downloaded,
    ImageState::Unpacking,
    ImageState::Unpacked,
    ImageState::Stored,
    ImageState::Activating,
    ImageState::Active,
    ImageState::Failed,
];

impl ImageState {
    /// Wire string stored in the catalog.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::New => "NEW",
            Self::Downloading => "DOWNLOADING",
            Self::Downloaded => "DOWNLOADED",
            Self::Unpacking => "UNPACKING",
            Self::Unpacked => "UNPACKED",
            Self::Stored => "STORED",
            Self::Activating => "ACTIVATING",
            Self::Active => "ACTIVE",
            Self::Failed => "FAILED",
        }
    }

    /// Parse a persisted state string. Unknown strings are rejected rather
    /// than mapped to a fallback state.
    pub fn parse(s: &str) -> Result<Self, UnknownState> {
        match s {
            "NEW" => Ok(Self::New),
            "DOWNLOADING" => Ok(Self::Downloading),
            "DOWNLOADED" => Ok(Self::Downloaded),
            "UNPACKING" => Ok(Self::Unpacking),
            "UNPACKED" => Ok(Self::Unpacked),
            "STORED" => Ok(Self::Stored),
            "ACTIVATING" => Ok(Self::Activating),
            "ACTIVE" => Ok(Self::Active),
            "FAILED" => Ok(Self::Failed),
            other => Err(UnknownState(other.to_string())),
        }
    }

    /// Whether no further transitions are possible from this state.
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Active | Self::Failed)
    }

    /// The next state along the forward pipeline. Terminal states return
    /// themselves. Never returns `Failed` for a non-terminal input; failing
    /// an image is an explicit decision by the worker, not a scheduled step.
    pub fn successor(self) -> Self {
        match self {
            Self::New => Self::Downloading,
            Self::Downloading => Self::Downloaded,
            Self::Downloaded => Self::Unpacking,
            Self::Unpacking => Self::Unpacked,
            Self::Unpacked => Self::Stored,
            Self::Stored => Self::Activating,
            Self::Activating => Self::Active,
            Self::Active => Self::Active,
            Self::Failed => Self::Failed,
        }
    }
}

impl std::fmt::Display for ImageState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Whether `from -> to` is a legal transition: the forward edge to the
/// immediate successor, or any non-terminal state to `Failed`.
pub fn can_transition(from: ImageState, to: ImageState) -> bool {
    if from.is_terminal() {
        return false;
    }
    to == ImageState::Failed || to == from.successor()
}
