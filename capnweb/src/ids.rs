//! The session identifier space.
//!
//! A session has one ID space for imports and one for exports. ID 0 is the
//! "main" capability. Positive IDs were allocated by the local side, negative
//! IDs by the remote side; an import on one side corresponds to an export of
//! the opposite sign on the other. Allocation is strictly sequential from 1
//! on each side and IDs are never reused within a session.

use std::fmt;

/// An entry in the import table: a capability the remote side provides.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ImportId(pub i64);

impl ImportId {
    /// The well-known "main" capability.
    pub const MAIN: Self = Self(0);

    pub fn is_main(self) -> bool {
        self.0 == 0
    }

    /// Was this ID allocated by the local side?
    pub fn is_local(self) -> bool {
        self.0 > 0
    }

    /// Was this ID allocated by the remote side?
    pub fn is_remote(self) -> bool {
        self.0 < 0
    }

    /// The corresponding export ID from the peer's perspective.
    pub fn to_export(self) -> ExportId {
        ExportId(-self.0)
    }
}

impl fmt::Display for ImportId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "import #{}", self.0)
    }
}

/// An entry in the export table: a capability the local side provides.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ExportId(pub i64);

impl ExportId {
    /// The well-known "main" capability.
    pub const MAIN: Self = Self(0);

    pub fn is_main(self) -> bool {
        self.0 == 0
    }

    pub fn is_local(self) -> bool {
        self.0 > 0
    }

    pub fn is_remote(self) -> bool {
        self.0 < 0
    }

    /// The corresponding import ID from the peer's perspective.
    pub fn to_import(self) -> ImportId {
        ImportId(-self.0)
    }
}

impl fmt::Display for ExportId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "export #{}", self.0)
    }
}

/// Sequential allocator for locally-chosen IDs.
///
/// Both counters start at 1; the sign convention encodes provenance, not
/// allocation order, so locally-allocated IDs are always positive. A session
/// owns exactly one allocator and drives it from a single task.
#[derive(Debug)]
pub struct IdAllocator {
    next_import: i64,
    next_export: i64,
}

impl IdAllocator {
    pub fn new() -> Self {
        Self {
            next_import: 1,
            next_export: 1,
        }
    }

    pub fn next_import(&mut self) -> ImportId {
        let id = ImportId(self.next_import);
        self.next_import += 1;
        id
    }

    pub fn next_export(&mut self) -> ExportId {
        let id = ExportId(self.next_export);
        self.next_export += 1;
        id
    }

    /// Marks a fixed export ID (such as the main capability, or an
    /// application-chosen slot) as taken so the allocator never collides
    /// with it.
    pub fn reserve_export(&mut self, id: ExportId) {
        if id.0 >= self.next_export {
            self.next_export = id.0 + 1;
        }
    }
}

impl Default for IdAllocator {
    fn default() -> Self {
        Self::new()
    }
}
