//! Action state enumerations.
//!
//! Each sub-state-machine gets its own closed enum so a slot can never be
//! put into `syncing` and a replica can never be `prepared`. All three
//! share the on-disk strings: the idle state is the empty string, every
//! other state is its lowercase name. Unknown strings fail to decode.

use std::fmt;

use serde::{Deserialize, Serialize};

/// State of a slot migration action.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SlotActionState {
    #[default]
    #[serde(rename = "")]
    Nothing,
    #[serde(rename = "pending")]
    Pending,
    #[serde(rename = "preparing")]
    Preparing,
    #[serde(rename = "prepared")]
    Prepared,
    #[serde(rename = "migrating")]
    Migrating,
    #[serde(rename = "finished")]
    Finished,
}

impl SlotActionState {
    pub fn as_str(self) -> &'static str {
        match self {
            SlotActionState::Nothing => "",
            SlotActionState::Pending => "pending",
            SlotActionState::Preparing => "preparing",
            SlotActionState::Prepared => "prepared",
            SlotActionState::Migrating => "migrating",
            SlotActionState::Finished => "finished",
        }
    }

    /// True once the action has left `pending`, i.e. proxies have been
    /// told about it at least once.
    pub fn is_started(self) -> bool {
        !matches!(self, SlotActionState::Nothing | SlotActionState::Pending)
    }
}

/// State of a group's master promotion.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PromotingState {
    #[default]
    #[serde(rename = "")]
    Nothing,
    #[serde(rename = "preparing")]
    Preparing,
    #[serde(rename = "prepared")]
    Prepared,
    #[serde(rename = "finished")]
    Finished,
}

impl PromotingState {
    pub fn as_str(self) -> &'static str {
        match self {
            PromotingState::Nothing => "",
            PromotingState::Preparing => "preparing",
            PromotingState::Prepared => "prepared",
            PromotingState::Finished => "finished",
        }
    }
}

/// State of a replica's re-SLAVEOF action.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SyncActionState {
    #[default]
    #[serde(rename = "")]
    Nothing,
    #[serde(rename = "pending")]
    Pending,
    #[serde(rename = "syncing")]
    Syncing,
}

impl SyncActionState {
    pub fn as_str(self) -> &'static str {
        match self {
            SyncActionState::Nothing => "",
            SyncActionState::Pending => "pending",
            SyncActionState::Syncing => "syncing",
        }
    }
}

macro_rules! display_as_str {
    ($($ty:ty),*) => {$(
        impl fmt::Display for $ty {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                match self.as_str() {
                    "" => f.write_str("nothing"),
                    s => f.write_str(s),
                }
            }
        }
    )*};
}

display_as_str!(SlotActionState, PromotingState, SyncActionState);
