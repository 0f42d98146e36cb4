//! Package status registry: the closed set of lifecycle states and the
//! legal transition graph between them.
//!
//! Every status change in the system goes through [`ensure_transition`] so
//! an un-enumerated status string can never bypass validation. The graph:
//!
//! - primary chain, strictly forward, one step at a time:
//!   `awaiting_schedule -> scheduled_for_pickup -> pending -> assigned ->
//!   pickedup -> in-transit -> delivered`
//! - cancel branch: from `pending`/`assigned` to `cancelled`; from
//!   `pickedup`/`in-transit` to `cancelled-awaiting-return`, then
//!   `cancelled-returned`
//! - reject branch: from `assigned` to `rejected`; from `pickedup`/
//!   `in-transit` to `rejected-awaiting-return`, then `rejected-returned`
//! - return sub-chain: `delivered -> return-requested -> return-in-transit
//!   -> return-pending -> return-completed`
//!
//! Requesting any edge not in the graph fails with `InvalidTransition`;
//! there is no silent no-op.

use serde::{Deserialize, Serialize};

use crate::error::{CoreError, CoreResult};

/// Closed enumeration of package lifecycle states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PackageStatus {
    #[serde(rename = "awaiting_schedule")]
    AwaitingSchedule,
    #[serde(rename = "scheduled_for_pickup")]
    ScheduledForPickup,
    #[serde(rename = "pending")]
    Pending,
    #[serde(rename = "assigned")]
    Assigned,
    #[serde(rename = "pickedup")]
    Pickedup,
    #[serde(rename = "in-transit")]
    InTransit,
    #[serde(rename = "delivered")]
    Delivered,
    #[serde(rename = "cancelled")]
    Cancelled,
    #[serde(rename = "cancelled-awaiting-return")]
    CancelledAwaitingReturn,
    #[serde(rename = "cancelled-returned")]
    CancelledReturned,
    #[serde(rename = "rejected")]
    Rejected,
    #[serde(rename = "rejected-awaiting-return")]
    RejectedAwaitingReturn,
    #[serde(rename = "rejected-returned")]
    RejectedReturned,
    #[serde(rename = "return-requested")]
    ReturnRequested,
    #[serde(rename = "return-in-transit")]
    ReturnInTransit,
    #[serde(rename = "return-pending")]
    ReturnPending,
    #[serde(rename = "return-completed")]
    ReturnCompleted,
}

use PackageStatus::*;

/// All states, in lifecycle order. The storage CHECK constraint mirrors this.
pub const ALL_STATUSES: &[PackageStatus] = &[
    AwaitingSchedule,
    ScheduledForPickup,
    Pending,
    Assigned,
    Pickedup,
    InTransit,
    Delivered,
    Cancelled,
    CancelledAwaitingReturn,
    CancelledReturned,
    Rejected,
    RejectedAwaitingReturn,
    RejectedReturned,
    ReturnRequested,
    ReturnInTransit,
    ReturnPending,
    ReturnCompleted,
];

impl PackageStatus {
    /// Wire/storage string for this status.
    pub fn as_str(self) -> &'static str {
        match self {
            AwaitingSchedule => "awaiting_schedule",
            ScheduledForPickup => "scheduled_for_pickup",
            Pending => "pending",
            Assigned => "assigned",
            Pickedup => "pickedup",
            InTransit => "in-transit",
            Delivered => "delivered",
            Cancelled => "cancelled",
            CancelledAwaitingReturn => "cancelled-awaiting-return",
            CancelledReturned => "cancelled-returned",
            Rejected => "rejected",
            RejectedAwaitingReturn => "rejected-awaiting-return",
            RejectedReturned => "rejected-returned",
            ReturnRequested => "return-requested",
            ReturnInTransit => "return-in-transit",
            ReturnPending => "return-pending",
            ReturnCompleted => "return-completed",
        }
    }

    /// Parse a wire/storage string. Unknown strings are a validation error,
    /// never a passthrough.
    pub fn parse(s: &str) -> CoreResult<Self> {
        ALL_STATUSES
            .iter()
            .copied()
            .find(|status| status.as_str() == s)
            .ok_or_else(|| CoreError::validation(format!("Unknown status: {s}")))
    }

    /// Legal next states from this state.
    pub fn allowed_next(self) -> &'static [PackageStatus] {
        match self {
            AwaitingSchedule => &[ScheduledForPickup],
            ScheduledForPickup => &[Pending],
            Pending => &[Assigned, Cancelled],
            Assigned => &[Pickedup, Cancelled, Rejected],
            Pickedup => &[InTransit, CancelledAwaitingReturn, RejectedAwaitingReturn],
            InTransit => &[Delivered, CancelledAwaitingReturn, RejectedAwaitingReturn],
            Delivered => &[ReturnRequested],
            Cancelled => &[],
            CancelledAwaitingReturn => &[CancelledReturned],
            CancelledReturned => &[],
            Rejected => &[],
            RejectedAwaitingReturn => &[RejectedReturned],
            RejectedReturned => &[],
            ReturnRequested => &[ReturnInTransit],
            ReturnInTransit => &[ReturnPending],
            ReturnPending => &[ReturnCompleted],
            ReturnCompleted => &[],
        }
    }

    /// Whether `next` is a legal edge from this state.
    pub fn can_transition(self, next: PackageStatus) -> bool {
        self.allowed_next().contains(&next)
    }

    /// No further transitions exist from this state.
    pub fn is_terminal(self) -> bool {
        self.allowed_next().is_empty()
    }

    /// States that count as "entering the cancel branch" for ledger hooks.
    pub fn is_cancel_entry(self) -> bool {
        matches!(self, Cancelled | CancelledAwaitingReturn)
    }

    /// States that count as "entering the reject branch" for ledger hooks.
    pub fn is_reject_entry(self) -> bool {
        matches!(self, Rejected | RejectedAwaitingReturn)
    }

    /// The package is out with a driver in the forward chain.
    pub fn is_active_assignment(self) -> bool {
        matches!(self, Assigned | Pickedup | InTransit)
    }
}

/// Validate an edge, producing the typed error the caller surfaces.
pub fn ensure_transition(from: PackageStatus, to: PackageStatus) -> CoreResult<()> {
    if from.can_transition(to) {
        Ok(())
    } else {
        Err(CoreError::InvalidTransition {
            from: from.as_str().to_string(),
            to: to.as_str().to_string(),
        })
    }
}

/// Resolve the cancel branch target.
///
/// A package that already left the shop (was picked up) must physically
/// come back, so it lands in `cancelled-awaiting-return`; otherwise it
/// terminates in `cancelled` immediately.
pub fn cancel_target(current: PackageStatus, had_pickup: bool) -> CoreResult<PackageStatus> {
    match current {
        Pending | Assigned | Pickedup | InTransit => Ok(if had_pickup {
            CancelledAwaitingReturn
        } else {
            Cancelled
        }),
        other => Err(CoreError::InvalidTransition {
            from: other.as_str().to_string(),
            to: "cancelled".to_string(),
        }),
    }
}

/// Resolve the reject branch target, mirroring [`cancel_target`].
pub fn reject_target(current: PackageStatus, had_pickup: bool) -> CoreResult<PackageStatus> {
    match current {
        Assigned | Pickedup | InTransit => Ok(if had_pickup {
            RejectedAwaitingReturn
        } else {
            Rejected
        }),
        other => Err(CoreError::InvalidTransition {
            from: other.as_str().to_string(),
            to: "rejected".to_string(),
        }),
    }
}

// ===========================================================================
// Tests
// ===========================================================================
