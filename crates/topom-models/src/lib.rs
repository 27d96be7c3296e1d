//! topom-models: the controller's persistent data model.
//!
//! Everything the controller stores in the coordinator lives here: slot
//! mappings, replica groups, proxies, the sentinel set and the leader
//! lock cell, together with the key layout under `/codis3/<product>` and
//! the coordinator [`Client`] abstraction.
//!
//! # Layout
//!
//! ```text
//! /codis3/<product>/topom                 leader lock cell
//! /codis3/<product>/slots/slot-0000       one per slot, 0..1023
//! /codis3/<product>/group/group-0001      one per replica group
//! /codis3/<product>/proxy/proxy-0001      one per proxy, by numeric id
//! /codis3/<product>/sentinel              sentinel set
//! ```

mod action;
pub mod client;
mod codec;
mod error;
mod group;
mod proxy;
mod sentinel;
mod slot;
mod store;
mod topom;

pub use action::{PromotingState, SlotActionState, SyncActionState};
pub use client::{new_client, Client, FsClient, MemoryClient, Signal};
pub use codec::{decode, encode};
pub use error::StoreError;
pub use group::{Group, GroupServer, Promoting, SyncAction, INVALID_GROUP_ID, MAX_GROUP_ID};
pub use proxy::Proxy;
pub use sentinel::Sentinel;
pub use slot::{Slot, SlotAction, SlotMapping, MAX_SLOT_NUM};
pub use store::{is_valid_product, Store, CODIS_DIR};
pub use topom::Topom;
