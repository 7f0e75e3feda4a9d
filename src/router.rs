//! Maps client keys onto tables.
//!
//! A client key of the form `table:name` selects the table `table` and stores `name` inside it.
//! Keys without a `:` live in the reserved default table. Neither half is ever empty after
//! routing: an empty table falls back to the default table, an empty local key becomes a
//! single zero byte.

use std::fmt;

use crate::engine::TableKind;

/// separator between the table and the local key
pub const SEPARATOR: u8 = b':';

/// the reserved name of the table used for keys without a table part
pub const DEFAULT_TABLE: &str = "__default";

const EXPIRE_BY_TIME: &str = "__expire";
const EXPIRE_INDEX: &str = "__expire.index";
const USER_SUFFIX: &str = ".db";

/// A table a worker can hold a handle to.
///
/// User tables are opened under `<name>.db`, the expiry stores under names without that suffix,
/// so no client key can ever address them.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Table {
    /// the table for keys without a table part
    Default,
    /// a table named by the client
    Named(Vec<u8>),
    /// expiry records ordered by expiry time
    ExpireByTime,
    /// the latest expiry record of each key
    ExpireIndex,
}

impl Table {
    /// the name the table is opened under in the storage engine
    pub fn physical_name(&self) -> Vec<u8> {
        match self {
            Table::Default => format!("{}{}", DEFAULT_TABLE, USER_SUFFIX).into_bytes(),
            Table::Named(name) => {
                let mut physical = name.clone();
                physical.extend_from_slice(USER_SUFFIX.as_bytes());
                physical
            }
            Table::ExpireByTime => EXPIRE_BY_TIME.as_bytes().to_vec(),
            Table::ExpireIndex => EXPIRE_INDEX.as_bytes().to_vec(),
        }
    }

    /// the physical layout the table is opened with
    pub fn kind(&self) -> TableKind {
        match self {
            Table::Default | Table::Named(_) => TableKind::Hash,
            Table::ExpireByTime | Table::ExpireIndex => TableKind::Ordered,
        }
    }
}

impl fmt::Display for Table {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", String::from_utf8_lossy(&self.physical_name()))
    }
}

/// the result of routing one client key
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Route {
    /// the table the key lives in
    pub table: Table,
    /// the key inside that table, never empty
    pub local_key: Vec<u8>,
}

impl Route {
    /// A fixed encoding of the stored key: the table name's length as a big-endian `u32`, the
    /// table name (`__default` for the default table), then the local key. Every client
    /// spelling of one stored key has the same identity.
    pub fn identity(&self) -> Vec<u8> {
        let table: &[u8] = match &self.table {
            Table::Named(name) => name,
            _ => DEFAULT_TABLE.as_bytes(),
        };
        let mut buf = Vec::with_capacity(4 + table.len() + self.local_key.len());
        buf.extend_from_slice(&(table.len() as u32).to_be_bytes());
        buf.extend_from_slice(table);
        buf.extend_from_slice(&self.local_key);
        buf
    }

    /// decodes an [`identity`](Route::identity), `None` if it is malformed
    pub fn from_identity(identity: &[u8]) -> Option<Route> {
        if identity.len() < 4 {
            return None;
        }
        let mut len = [0u8; 4];
        len.copy_from_slice(&identity[..4]);
        let len = u32::from_be_bytes(len) as usize;
        let rest = &identity[4..];
        if rest.len() <= len {
            return None;
        }
        let (table, local_key) = rest.split_at(len);
        let table = if table.is_empty() || table == DEFAULT_TABLE.as_bytes() {
            Table::Default
        } else {
            Table::Named(table.to_vec())
        };
        Some(Route {
            table,
            local_key: local_key.to_vec(),
        })
    }
}

/// splits a client `key` into its table and local key
pub fn split(key: &[u8]) -> Route {
    let (table, local) = match key.iter().position(|&b| b == SEPARATOR) {
        Some(pos) => (&key[..pos], &key[pos + 1..]),
        None => (&[][..], key),
    };

    let table = if table.is_empty() || table == DEFAULT_TABLE.as_bytes() {
        Table::Default
    } else {
        Table::Named(table.to_vec())
    };
    let local_key = if local.is_empty() { vec![0] } else { local.to_vec() };

    Route { table, local_key }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn key_without_separator_goes_to_default_table() {
        let route = split(b"plain");
        assert_eq!(route.table, Table::Default);
        assert_eq!(route.local_key, b"plain".to_vec());
    }

    #[test]
    fn table_and_name_are_split_on_first_separator() {
        let route = split(b"users:42:name");
        assert_eq!(route.table, Table::Named(b"users".to_vec()));
        assert_eq!(route.local_key, b"42:name".to_vec());
    }

    #[test]
    fn empty_table_falls_back_to_default() {
        let route = split(b":name");
        assert_eq!(route.table, Table::Default);
        assert_eq!(route.local_key, b"name".to_vec());
    }

    #[test]
    fn empty_local_key_becomes_zero_byte() {
        let route = split(b"users:");
        assert_eq!(route.table, Table::Named(b"users".to_vec()));
        assert_eq!(route.local_key, vec![0]);

        let route = split(b":");
        assert_eq!(route.table, Table::Default);
        assert_eq!(route.local_key, vec![0]);
    }

    #[test]
    fn explicit_default_table_is_the_default_table() {
        assert_eq!(split(b"__default:x"), split(b"x"));
    }

    #[test]
    fn expiry_stores_cannot_be_addressed_by_clients() {
        let reserved = [Table::ExpireByTime.physical_name(), Table::ExpireIndex.physical_name()];
        for key in [&b"__expire:k"[..], b"__expire.index:k", b"__expire"] {
            let physical = split(key).table.physical_name();
            assert!(!reserved.contains(&physical), "{:?}", String::from_utf8_lossy(key));
        }
    }

    #[test]
    fn every_spelling_of_a_key_has_one_identity() {
        assert_eq!(split(b"x").identity(), split(b":x").identity());
        assert_eq!(split(b"x").identity(), split(b"__default:x").identity());
        assert_eq!(split(b"t:").identity(), split(b"t:\0").identity());
        assert_ne!(split(b"t:x").identity(), split(b"x").identity());
        assert_ne!(split(b"ab:c").identity(), split(b"a:bc").identity());
    }

    #[test]
    fn identity_decodes_to_the_same_route() {
        for key in [&b"plain"[..], b"users:42:name", b"t:", b"__default:k"] {
            let route = split(key);
            assert_eq!(Route::from_identity(&route.identity()), Some(route));
        }
        assert_eq!(Route::from_identity(b"\0\0"), None);
        assert_eq!(Route::from_identity(b"\0\0\0\x05ab"), None);
    }

    #[test]
    fn user_tables_are_hash_and_expiry_stores_ordered() {
        assert_eq!(Table::Default.kind(), TableKind::Hash);
        assert_eq!(Table::Named(b"t".to_vec()).kind(), TableKind::Hash);
        assert_eq!(Table::ExpireByTime.kind(), TableKind::Ordered);
        assert_eq!(Table::ExpireIndex.kind(), TableKind::Ordered);
    }
}
