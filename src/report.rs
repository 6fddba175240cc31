use serde::Serialize;

use crate::domain::{LinkEntry, LinkType};

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct TypeReport {
    pub entries: usize,
    pub with_size: usize,
    pub without_size: usize,
    pub total_bytes: u64,
    pub placed: usize,
    pub placed_bytes: u64,
}

impl TypeReport {
    fn add(&mut self, entry: &LinkEntry) {
        self.entries += 1;
        match entry.known_size() {
            Some(size) => {
                self.with_size += 1;
                self.total_bytes += size;
                if entry.placed {
                    self.placed_bytes += size;
                }
            }
            None => self.without_size += 1,
        }
        if entry.placed {
            self.placed += 1;
        }
    }

    fn merge(&mut self, other: &TypeReport) {
        self.entries += other.entries;
        self.with_size += other.with_size;
        self.without_size += other.without_size;
        self.total_bytes += other.total_bytes;
        self.placed += other.placed;
        self.placed_bytes += other.placed_bytes;
    }
}

/// Declared sizes of the catalog grouped by link type.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct LibraryReport {
    pub iso: TypeReport,
    pub xbla: TypeReport,
    pub total: TypeReport,
}

impl LibraryReport {
    pub fn from_entries(entries: &[LinkEntry]) -> Self {
        let mut report = Self::default();
        for entry in entries {
            report.for_type_mut(entry.link_type).add(entry);
        }
        report.total.merge(&report.iso);
        report.total.merge(&report.xbla);
        report
    }

    pub fn for_type(&self, link_type: LinkType) -> &TypeReport {
        match link_type {
            LinkType::Iso => &self.iso,
            LinkType::Xbla => &self.xbla,
        }
    }

    fn for_type_mut(&mut self, link_type: LinkType) -> &mut TypeReport {
        match link_type {
            LinkType::Iso => &mut self.iso,
            LinkType::Xbla => &mut self.xbla,
        }
    }
}

/// Binary-prefixed rendering used by the CLI, e.g. `14.65 GiB`.
pub fn format_bytes(bytes: u64) -> String {
    const UNITS: [&str; 5] = ["B", "KiB", "MiB", "GiB", "TiB"];
    let mut value = bytes as f64;
    let mut unit = 0;
    while value >= 1024.0 && unit < UNITS.len() - 1 {
        value /= 1024.0;
        unit += 1;
    }
    if unit == 0 {
        format!("{bytes} B")
    } else {
        format!("{value:.2} {}", UNITS[unit])
    }
}
