// SPDX-License-Identifier: PMPL-1.0-or-later
//! Weft Store
//!
//! The normalized record store and the machinery that feeds it:
//!
//! - **`Store` / `InMemoryStore`** — record source with an optimistic overlay,
//!   subscriptions, retention and availability checks.
//! - **`PublishQueue`** — stages real and optimistic changes and applies them
//!   to the store in one `run()`.
//! - **`Payload`** — normalized output of one response, including deferred
//!   placeholders and followups the executor resolves later.
//! - **`RecordSourceProxy`** — copy-on-write view that updaters and field
//!   handlers mutate.

pub mod checker;
pub mod disposable;
pub mod error;
pub mod handler;
pub mod payload;
pub mod proxy;
pub mod publish_queue;
pub mod reader;
pub mod store;

pub use checker::{Availability, CheckContext, CheckOptions, CheckOutcome, MissingFieldHandler};
pub use disposable::Disposable;
pub use error::StoreError;
pub use handler::{CopyFieldHandler, FieldHandler, HandlerProvider};
pub use payload::{
    ActorPayload, DeferPlaceholder, FieldPayload, FollowupPayload, IncrementalPlaceholder,
    ModuleImportPayload, Payload, StreamPlaceholder,
};
pub use proxy::{store_updater, RecordSourceProxy, StoreUpdater};
pub use publish_queue::{OptimisticUpdate, OptimisticUpdateKind, PublishQueue};
pub use reader::{read, Snapshot};
pub use store::{deliver_all, InMemoryStore, Notification, PendingDelivery, Store, SubscriptionCallback};
