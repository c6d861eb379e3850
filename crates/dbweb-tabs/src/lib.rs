//! dbweb-tabs: registry of contributed tabs and menu entries.
//! Items are filtered and ordered per render context, expanded through
//! generators, and carry lazily created per-tab state in a [`MetadataMap`].

pub mod container;
pub mod error;
pub mod metadata;

pub use container::{ContainerItem, DEFAULT_ORDER, TabOpenEvent, TabsContainer};
pub use error::ContainerError;
pub use metadata::MetadataMap;
