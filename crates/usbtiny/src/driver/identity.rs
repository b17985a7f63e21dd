//! Device identity filter
//!
//! Id tables are ordered lists of exact vendor/product pairs terminated by
//! [`DeviceIdentity::SENTINEL`]. The bus walks a driver's table up to the sentinel
//! when deciding whether to offer it a newly arrived device.

use common::DeviceIdentity;

pub const USBTINY_DEV_NAME: &str = "USBTinyISP";
pub const USBTINY_VENDOR_ID: u16 = 0x1781;
pub const USBTINY_PRODUCT_ID: u16 = 0x0C9F;

pub const USBTINY_IDENTITY: DeviceIdentity =
    DeviceIdentity::new(USBTINY_VENDOR_ID, USBTINY_PRODUCT_ID);

/// Identities claimed by the USBtinyISP driver
pub static USBTINY_ID_TABLE: [DeviceIdentity; 2] = [USBTINY_IDENTITY, DeviceIdentity::SENTINEL];

/// Iterate the live entries of a sentinel-terminated table
pub fn entries(table: &[DeviceIdentity]) -> impl Iterator<Item = &DeviceIdentity> {
    table.iter().take_while(|id| !id.is_sentinel())
}

/// Exact match of `identity` against a sentinel-terminated table
pub fn table_matches(table: &[DeviceIdentity], identity: &DeviceIdentity) -> bool {
    entries(table).any(|id| id == identity)
}

/// Id table fixed at driver load
///
/// Built from a static base table plus any configured extras, then never mutated.
#[derive(Debug, Clone)]
pub struct IdTable {
    entries: Box<[DeviceIdentity]>,
}

impl IdTable {
    pub fn new(base: &[DeviceIdentity], extra: &[DeviceIdentity]) -> Self {
        let mut ids: Vec<DeviceIdentity> = Vec::with_capacity(base.len() + extra.len() + 1);
        for id in entries(base).chain(extra.iter().filter(|id| !id.is_sentinel())) {
            if !ids.contains(id) {
                ids.push(*id);
            }
        }
        ids.push(DeviceIdentity::SENTINEL);

        Self {
            entries: ids.into_boxed_slice(),
        }
    }

    /// Sentinel-terminated view, as handed to the bus
    pub fn as_slice(&self) -> &[DeviceIdentity] {
        &self.entries
    }

    pub fn matches(&self, identity: &DeviceIdentity) -> bool {
        table_matches(&self.entries, identity)
    }

    pub fn len(&self) -> usize {
        self.entries.len() - 1
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for IdTable {
    fn default() -> Self {
        Self::new(&USBTINY_ID_TABLE, &[])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_static_table_matches_usbtiny() {
        assert!(table_matches(
            &USBTINY_ID_TABLE,
            &DeviceIdentity::new(0x1781, 0x0c9f)
        ));
        assert!(!table_matches(
            &USBTINY_ID_TABLE,
            &DeviceIdentity::new(0x1781, 0x0c9e)
        ));
        assert!(!table_matches(
            &USBTINY_ID_TABLE,
            &DeviceIdentity::new(0x1782, 0x0c9f)
        ));
    }

    #[test]
    fn test_sentinel_never_matches() {
        assert!(!table_matches(&USBTINY_ID_TABLE, &DeviceIdentity::SENTINEL));
    }

    #[test]
    fn test_entries_stop_at_sentinel() {
        let table = [
            DeviceIdentity::new(1, 1),
            DeviceIdentity::SENTINEL,
            DeviceIdentity::new(2, 2),
        ];
        assert_eq!(entries(&table).count(), 1);
        assert!(!table_matches(&table, &DeviceIdentity::new(2, 2)));
    }

    #[test]
    fn test_id_table_with_extras() {
        let extra = [
            DeviceIdentity::new(0x16c0, 0x05dc),
            USBTINY_IDENTITY,
            DeviceIdentity::SENTINEL,
        ];
        let table = IdTable::new(&USBTINY_ID_TABLE, &extra);

        assert_eq!(table.len(), 2);
        assert!(table.matches(&USBTINY_IDENTITY));
        assert!(table.matches(&DeviceIdentity::new(0x16c0, 0x05dc)));
        assert!(table.as_slice().last().unwrap().is_sentinel());
    }

    #[test]
    fn test_default_table() {
        let table = IdTable::default();
        assert_eq!(table.len(), 1);
        assert!(!table.is_empty());
        assert_eq!(table.as_slice(), &USBTINY_ID_TABLE[..]);
    }
}
