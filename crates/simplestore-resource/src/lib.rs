//! SimpleStore resources
//!
//! Typed objects over the SimpleStore engine. Application code names an
//! entity type once (table, key fields, value type) and then works with
//! individual keys instead of raw bytes.
//!
//! # Architecture
//!
//! - Each resource type declares a [`Schema`]; the [`TableRegistry`] opens
//!   one engine table per schema on first use
//! - Keys are tuples of strings, stored as their parts joined by a space
//! - Values are bincode payloads in a versioned, checksummed envelope
//! - `alter` is a read-modify-write inside one transaction, so concurrent
//!   updates of the same key serialize on the engine's key lock
//! - [`Container`] and [`Tabular`] layer collection and row-set update rules
//!   on top of `alter`

pub mod codec;
pub mod container;
pub mod cursor;
pub mod environment;
pub mod error;
pub mod registry;
pub mod resource;
pub mod tabular;

pub use container::{Container, ContainerType};
pub use cursor::{Cursor, Positioning};
pub use environment::Environment;
pub use error::{ResourceError, ResourceResult};
pub use registry::{Schema, TableRegistry};
pub use resource::{RenameReport, Resource, ResourceType};
pub use tabular::{row, Cell, Row, RowSet, Rows, Tabular, TabularType};

pub use simplestore_core::{Config, StoreError, Transaction};
