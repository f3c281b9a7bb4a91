//! The seam between the engine and whatever it is watching.

use facet::Facet;
use lockwatch_types::{ThreadId, ThreadSnapshot};

/// What a provider can do besides taking snapshots.
#[derive(Facet, Debug, Clone, Copy, PartialEq, Eq)]
pub struct Capabilities {
    /// Whether `interrupt` can reach threads of the target at all.
    pub can_interrupt: bool,
    /// The target lives in another process and is observed remotely.
    pub remote: bool,
}

impl Capabilities {
    pub const LOCAL: Capabilities = Capabilities {
        can_interrupt: true,
        remote: false,
    };

    pub const REMOTE_READ_ONLY: Capabilities = Capabilities {
        can_interrupt: false,
        remote: true,
    };
}

/// Supplies thread snapshots of a target and, when supported, interrupts its threads.
pub trait IntrospectionProvider: Send + Sync + 'static {
    /// Point-in-time view of every thread in the target.
    ///
    /// An `Err` means no snapshot is available. It must never be reported as an
    /// empty thread list.
    fn snapshot(&self) -> Result<Vec<ThreadSnapshot>, ProviderError>;

    fn interrupt(&self, thread: ThreadId) -> Result<(), ControlError>;

    fn capabilities(&self) -> Capabilities;

    /// Short label for logs and notifications.
    fn describe(&self) -> String;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProviderError {
    /// The target terminated or the connection to it was lost.
    Unreachable(String),
}

impl core::fmt::Display for ProviderError {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            ProviderError::Unreachable(reason) => write!(f, "target unreachable: {reason}"),
        }
    }
}

impl std::error::Error for ProviderError {}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ControlError {
    /// The target refused to interrupt this thread.
    PermissionDenied,
    /// The thread no longer exists.
    NoSuchThread(ThreadId),
    /// The target cannot interrupt threads at all.
    Unsupported,
    Unreachable(String),
}

impl ControlError {
    /// Whether the failure applies to every thread, not just this one.
    pub fn is_global(&self) -> bool {
        matches!(self, ControlError::Unsupported | ControlError::Unreachable(_))
    }
}

impl core::fmt::Display for ControlError {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            ControlError::PermissionDenied => f.write_str("interrupt not permitted"),
            ControlError::NoSuchThread(id) => write!(f, "no such thread: {id}"),
            ControlError::Unsupported => f.write_str("thread control not supported by target"),
            ControlError::Unreachable(reason) => write!(f, "target unreachable: {reason}"),
        }
    }
}

impl std::error::Error for ControlError {}
