/// Identifies one dispatched save: the draft version it snapshotted and the
/// dispatch sequence it was issued under.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SaveStamp {
    pub version: u64,
    pub sequence: u64,
}

#[derive(Debug, Clone, Default)]
pub struct VersionGuard {
    version: u64,
    issued: u64,
}

impl VersionGuard {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn current(&self) -> u64 {
        self.version
    }

    pub fn bump(&mut self) -> u64 {
        self.version += 1;
        self.version
    }

    pub fn stamp(&mut self) -> SaveStamp {
        self.issued += 1;
        SaveStamp {
            version: self.version,
            sequence: self.issued,
        }
    }

    /// A completion is authoritative only if nothing was edited and nothing
    /// else was dispatched since it was stamped.
    pub fn is_authoritative(&self, stamp: SaveStamp) -> bool {
        stamp.version == self.version && stamp.sequence == self.issued
    }

    pub fn is_superseded(&self, stamp: SaveStamp) -> bool {
        stamp.version < self.version
    }
}
