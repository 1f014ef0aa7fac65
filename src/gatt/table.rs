use std::fmt::Debug;

use crate::att::Prop;
use crate::uuid::Uuid;

use super::AccessFn;

/// Compiled, flattened attribute table for one service, in registration
/// order: the service entry, then each characteristic followed by its
/// descriptors.
///
/// The in-memory form carries its length; a [`TableEntry::End`] sentinel is
/// appended only as the last entry because the host boundary expects a
/// terminated table. Internal iteration never scans for the sentinel.
#[derive(Debug, Default)]
pub struct TableDef {
    entries: Vec<TableEntry>,
}

impl TableDef {
    #[inline]
    pub(super) fn new() -> Self {
        Self::default()
    }

    #[inline]
    pub(super) fn push(&mut self, e: TableEntry) {
        debug_assert!(!matches!(self.entries.last(), Some(TableEntry::End)));
        self.entries.push(e);
    }

    /// Appends the terminating sentinel.
    #[inline]
    pub(super) fn finish(&mut self) {
        self.entries.push(TableEntry::End);
    }

    /// Returns all entries, including the terminating sentinel.
    #[inline]
    #[must_use]
    pub fn entries(&self) -> &[TableEntry] {
        &self.entries
    }

    /// Returns the attribute entries, excluding the sentinel.
    #[inline]
    #[must_use]
    pub fn attrs(&self) -> &[TableEntry] {
        match self.entries.split_last() {
            Some((TableEntry::End, attrs)) => attrs,
            _ => &self.entries,
        }
    }

    /// Returns the number of attributes that will receive handles.
    #[inline]
    #[must_use]
    pub fn attr_count(&self) -> usize {
        self.attrs().len()
    }
}

impl PartialEq for TableDef {
    fn eq(&self, other: &Self) -> bool {
        self.entries == other.entries
    }
}

/// One entry of a compiled attribute table.
#[derive(Debug)]
#[non_exhaustive]
pub enum TableEntry {
    /// Service declaration.
    Service { uuid: Uuid },
    /// Characteristic declaration plus value attribute.
    Characteristic {
        uuid: Uuid,
        props: Prop,
        access: AccessFn,
    },
    /// Descriptor attribute.
    Descriptor {
        uuid: Uuid,
        props: Prop,
        access: AccessFn,
    },
    /// Terminating sentinel.
    End,
}

impl TableEntry {
    /// Returns the attribute type.
    #[inline]
    #[must_use]
    pub fn uuid(&self) -> Option<Uuid> {
        match *self {
            Self::Service { uuid }
            | Self::Characteristic { uuid, .. }
            | Self::Descriptor { uuid, .. } => Some(uuid),
            Self::End => None,
        }
    }

    /// Returns the access callback for characteristic and descriptor entries.
    #[inline]
    #[must_use]
    pub fn access(&self) -> Option<&AccessFn> {
        match self {
            Self::Characteristic { access, .. } | Self::Descriptor { access, .. } => Some(access),
            Self::Service { .. } | Self::End => None,
        }
    }
}

impl PartialEq for TableEntry {
    /// Entries compare by kind, UUID, and properties. Access callbacks are
    /// behavior, not identity, and are excluded so that two rebuilds of an
    /// unchanged tree compare equal.
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Self::Service { uuid: a }, Self::Service { uuid: b }) => a == b,
            (
                Self::Characteristic {
                    uuid: a,
                    props: ap,
                    ..
                },
                Self::Characteristic {
                    uuid: b,
                    props: bp,
                    ..
                },
            )
            | (
                Self::Descriptor {
                    uuid: a,
                    props: ap,
                    ..
                },
                Self::Descriptor {
                    uuid: b,
                    props: bp,
                    ..
                },
            ) => a == b && ap == bp,
            (Self::End, Self::End) => true,
            _ => false,
        }
    }
}
