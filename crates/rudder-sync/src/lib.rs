//! # rudder-sync
//!
//! The sync engine for rudder: continuously reconciles a cluster's live API
//! objects toward the declared configuration of one sync target.
//!
//! The engine is composed of four tightly interacting parts:
//!
//! - the **applier** executes an ordered, dependency-aware queue of apply and
//!   prune tasks under inventory constraints,
//! - the **remediator** watches live objects of declared kinds and corrects
//!   drift back to the declared form,
//! - the **updater** serializes one reconcile cycle: pause remediator,
//!   declare, apply, rewatch, resume,
//! - the **events** publishers turn time and external signals into the
//!   ordered trigger stream the engine loop consumes.
//!
//! The declared-resource store, inventory, and cluster seams live in
//! [`rudder_core`].

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod applier;
pub mod engine;
pub mod events;
pub mod remediator;
pub mod updater;

pub use applier::{Applier, ApplyOptions, Destroyer, Event};
pub use engine::{EngineHandle, SourceCommit, SyncEngine};
pub use events::Trigger;
pub use remediator::Remediator;
pub use updater::{CommitCache, Updater};
