//! Object table
//!
//! Maps an object id to the managers holding a replica. Each `add`
//! replaces the stored entry and is published on its own; entries are
//! never merged.

use serde::{Deserialize, Serialize};

use super::{Table, TableEntry, TableKind};
use crate::id::ObjectId;

/// Replica locations of one object
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ObjectTableData {
    /// Manager locations, in the order the writer listed them
    pub managers: Vec<String>,
}

impl ObjectTableData {
    pub fn new<I, S>(managers: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            managers: managers.into_iter().map(Into::into).collect(),
        }
    }
}

impl TableEntry for ObjectTableData {
    type Id = ObjectId;
    const KIND: TableKind = TableKind::Object;
}

pub type ObjectTable = Table<ObjectTableData>;
