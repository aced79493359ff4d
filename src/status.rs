//! Harvest status state machine.
//!
//! ```text
//!            queue            claim              complete
//!   READY ─────────▶ QUEUED ─────────▶ BUSY ─────────────▶ READY
//!     ▲                │                │
//!     │  claim failed  │                │ fail
//!     └────────────────┘                ▼
//!     ▲                              OAI_ERROR ──queue (below threshold)──▶ QUEUED
//!     │  reset (admin)                  │
//!     └─────────────────────────────────┘
//!
//!   any ──disable──▶ DISABLED ──enable──▶ READY
//! ```
//!
//! The storage layer applies every transition as a compare-and-swap on
//! the status column, using [`Transition::sources`] as the allowed
//! "from" set, so the in-memory rules and the SQL guards cannot drift.

use std::fmt;
use std::str::FromStr;
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HarvestStatus {
    Ready,
    Queued,
    Busy,
    OaiError,
    Disabled,
}

impl HarvestStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            HarvestStatus::Ready => "READY",
            HarvestStatus::Queued => "QUEUED",
            HarvestStatus::Busy => "BUSY",
            HarvestStatus::OaiError => "OAI_ERROR",
            HarvestStatus::Disabled => "DISABLED",
        }
    }

    /// Apply a transition, rejecting edges the machine does not have.
    pub fn apply(self, transition: Transition) -> Result<HarvestStatus, InvalidTransition> {
        if transition.sources().contains(&self) {
            Ok(transition.target())
        } else {
            Err(InvalidTransition {
                from: self,
                transition,
            })
        }
    }
}

impl fmt::Display for HarvestStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for HarvestStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "READY" => Ok(HarvestStatus::Ready),
            "QUEUED" => Ok(HarvestStatus::Queued),
            "BUSY" => Ok(HarvestStatus::Busy),
            "OAI_ERROR" => Ok(HarvestStatus::OaiError),
            "DISABLED" => Ok(HarvestStatus::Disabled),
            other => Err(format!("unknown harvest status '{}'", other)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    /// Scheduler picked the collection for a free worker slot.
    Queue,
    /// A worker took exclusive ownership.
    Claim,
    /// Claiming hit a storage error; nothing was sent to the remote side.
    ClaimFailed,
    Complete,
    Fail,
    /// Shutdown or deadline while queued or running.
    Interrupt,
    Disable,
    Enable,
    /// Administrator clears an error hold.
    Reset,
}

const ALL: &[HarvestStatus] = &[
    HarvestStatus::Ready,
    HarvestStatus::Queued,
    HarvestStatus::Busy,
    HarvestStatus::OaiError,
    HarvestStatus::Disabled,
];

impl Transition {
    pub fn sources(&self) -> &'static [HarvestStatus] {
        match self {
            Transition::Queue => &[HarvestStatus::Ready, HarvestStatus::OaiError],
            Transition::Claim | Transition::ClaimFailed => &[HarvestStatus::Queued],
            Transition::Complete | Transition::Fail => &[HarvestStatus::Busy],
            Transition::Interrupt => &[HarvestStatus::Queued, HarvestStatus::Busy],
            Transition::Disable => ALL,
            Transition::Enable => &[HarvestStatus::Disabled],
            Transition::Reset => &[HarvestStatus::OaiError],
        }
    }

    pub fn target(&self) -> HarvestStatus {
        match self {
            Transition::Queue => HarvestStatus::Queued,
            Transition::Claim => HarvestStatus::Busy,
            Transition::Fail => HarvestStatus::OaiError,
            Transition::Disable => HarvestStatus::Disabled,
            Transition::ClaimFailed
            | Transition::Complete
            | Transition::Interrupt
            | Transition::Enable
            | Transition::Reset => HarvestStatus::Ready,
        }
    }
}

#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
#[error("no {transition:?} transition from {from}")]
pub struct InvalidTransition {
    pub from: HarvestStatus,
    pub transition: Transition,
}

/// Whether the scheduler may pick a collection on its next pass.
///
/// OAI_ERROR collections are retried until their consecutive failure
/// count reaches `threshold`; after that only an administrator can
/// release them.
pub fn is_schedulable(status: HarvestStatus, consecutive_failures: u32, threshold: u32) -> bool {
    match status {
        HarvestStatus::Ready => true,
        HarvestStatus::OaiError => consecutive_failures < threshold,
        _ => false,
    }
}
