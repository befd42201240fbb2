//! Status helper enums mapping to SMALLINT lookup tables.
//!
//! Each enum variant's discriminant matches the seed data in the
//! corresponding lookup table (`queue_statuses`, `run_statuses`,
//! `run_kinds`). The string label is the seed `name` and the serde form.

use robotq_core::error::CoreError;

/// Status ID type matching SMALLINT in the database.
pub type StatusId = i16;

macro_rules! define_status_enum {
    (
        $(#[$meta:meta])*
        $name:ident {
            $( $(#[$vmeta:meta])* $variant:ident = $val:expr => $label:literal $(| $alias:literal)* ),+ $(,)?
        }
    ) => {
        $(#[$meta])*
        #[repr(i16)]
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
        pub enum $name {
            $( $(#[$vmeta])* #[serde(rename = $label $(, alias = $alias)*)] $variant = $val ),+
        }

        impl $name {
            /// Every variant, in seed order.
            pub const ALL: &'static [$name] = &[$($name::$variant),+];

            /// Return the database status ID.
            pub fn id(self) -> StatusId {
                self as StatusId
            }

            /// Map a database ID back to the variant.
            pub fn from_id(id: StatusId) -> Option<Self> {
                Self::ALL.iter().copied().find(|v| v.id() == id)
            }

            /// Seed-data name.
            pub fn as_str(self) -> &'static str {
                match self {
                    $( Self::$variant => $label ),+
                }
            }
        }

        impl From<$name> for StatusId {
            fn from(value: $name) -> Self {
                value as StatusId
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                f.write_str(self.as_str())
            }
        }

        impl std::str::FromStr for $name {
            type Err = CoreError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                match s.trim().to_ascii_lowercase().as_str() {
                    $( $label $(| $alias)* => Ok(Self::$variant), )+
                    other => Err(CoreError::Validation(format!(
                        "Unknown {} '{other}'",
                        stringify!($name),
                    ))),
                }
            }
        }
    };
}

define_status_enum! {
    /// Queue item lifecycle status.
    QueueStatus {
        Queued = 1 => "queued",
        Processing = 2 => "processing",
        Completed = 3 => "completed",
        Failed = 4 => "failed",
        Cancelled = 5 => "cancelled",
    }
}

define_status_enum! {
    /// Run record status. `passed` is accepted as an alias of `completed`.
    RunStatus {
        Pending = 1 => "pending",
        Running = 2 => "running",
        Completed = 3 => "completed" | "passed",
        Failed = 4 => "failed",
        Error = 5 => "error",
        Cancelled = 6 => "cancelled",
    }
}

define_status_enum! {
    /// How a run was requested.
    RunKind {
        AdHoc = 1 => "ad_hoc",
        Queued = 2 => "queued",
    }
}

impl QueueStatus {
    /// Queued and processing items count toward duplicate suppression.
    pub fn is_active(self) -> bool {
        matches!(self, Self::Queued | Self::Processing)
    }

    /// Statuses an item can be left in after its claim ends without deletion.
    pub fn is_finished(self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }
}

impl RunStatus {
    pub fn is_terminal(self) -> bool {
        !matches!(self, Self::Pending | Self::Running)
    }

    /// Whether the state machine permits `self -> next`.
    ///
    /// ```text
    /// pending -> running
    /// pending | running -> completed | failed | error | cancelled
    /// ```
    ///
    /// `pending` may jump straight to a terminal state when a run fails
    /// before the runner starts. Terminal states have no outgoing edges.
    pub fn can_transition_to(self, next: RunStatus) -> bool {
        match self {
            Self::Pending => next != Self::Pending,
            Self::Running => next.is_terminal(),
            _ => false,
        }
    }

    /// States from which the state machine permits a move to `next`.
    pub fn predecessors(next: RunStatus) -> Vec<RunStatus> {
        Self::ALL
            .iter()
            .copied()
            .filter(|s| s.can_transition_to(next))
            .collect()
    }
}
