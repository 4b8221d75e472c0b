//! Per-table corrections applied after introspection.
//!
//! Some tables carry a sequence the name-matching query cannot find, have no
//! usable natural key, or hold columns that must not travel between servers.
//! The corrections live in one lookup table keyed by table name.

use crate::core::{Table, UniqueIndex, VIRTUAL_INDEX_NAME};

/// Correction for one table.
#[derive(Debug, Clone, Copy)]
pub struct TableFilter {
    /// Table the correction applies to.
    pub table: &'static str,

    /// Sequence backing the `id` primary key.
    pub pk_sequence: Option<&'static str>,

    /// Synthetic natural key that becomes the main unique index.
    pub virtual_index: Option<&'static [&'static str]>,

    /// Columns left out of generated statements.
    pub unexport_columns: &'static [&'static str],

    /// Existing unique indexes that get extra columns appended.
    pub extend_indexes: &'static [(&'static str, &'static str)],
}

const fn sequence(table: &'static str, seq: &'static str) -> TableFilter {
    TableFilter {
        table,
        pk_sequence: Some(seq),
        virtual_index: None,
        unexport_columns: &[],
        extend_indexes: &[],
    }
}

/// All table corrections.
pub const TABLE_FILTERS: &[TableFilter] = &[
    sequence("rhnchecksumtype", "rhn_checksum_id_seq"),
    sequence("rhnchecksum", "rhnChecksum_seq"),
    sequence("rhnpackagearch", "rhn_package_arch_id_seq"),
    sequence("rhnchannelarch", "rhn_channel_arch_id_seq"),
    sequence("rhnpackagename", "RHN_PKG_NAME_SEQ"),
    sequence("rhnpackagenevra", "rhn_pkgnevra_id_seq"),
    sequence("rhnpackagesource", "rhn_package_source_id_seq"),
    TableFilter {
        table: "rhnpackageevr",
        pk_sequence: Some("rhn_pkg_evr_seq"),
        virtual_index: None,
        unexport_columns: &["type"],
        extend_indexes: &[("rhn_pe_v_r_e_uq", "type"), ("rhn_pe_v_r_uq", "type")],
    },
    TableFilter {
        table: "rhnpackage",
        pk_sequence: Some("RHN_PACKAGE_ID_SEQ"),
        virtual_index: Some(&["name_id", "evr_id", "package_arch_id", "checksum_id", "org_id"]),
        unexport_columns: &[],
        extend_indexes: &[],
    },
    TableFilter {
        table: "rhnpackagechangelogdata",
        pk_sequence: Some("rhn_pkg_cld_id_seq"),
        virtual_index: Some(&["name", "text", "time"]),
        unexport_columns: &[],
        extend_indexes: &[],
    },
    sequence("rhnpackagechangelogrec", "rhn_pkg_cl_id_seq"),
    // The real unique indexes are expression indexes; conflicts are never updated anyway.
    TableFilter {
        table: "rhnpackagecapability",
        pk_sequence: Some("RHN_PKG_CAPABILITY_ID_SEQ"),
        virtual_index: Some(&["name", "version"]),
        unexport_columns: &[],
        extend_indexes: &[],
    },
];

/// Find the correction for a table.
pub fn filter_for(table: &str) -> Option<&'static TableFilter> {
    TABLE_FILTERS.iter().find(|f| f.table == table)
}

/// Apply the correction registered for this table, if any.
pub fn apply_table_filters(mut table: Table) -> Table {
    let Some(filter) = filter_for(&table.name) else {
        return table;
    };

    if let Some(seq) = filter.pk_sequence {
        table.pk_sequence = Some(seq.to_string());
    }

    for column in filter.unexport_columns {
        table.unexport_columns.insert(column.to_string());
    }

    for (index, column) in filter.extend_indexes {
        if let Some(idx) = table.unique_indexes.get_mut(*index) {
            if !idx.columns.iter().any(|c| c == column) {
                idx.columns.push(column.to_string());
            }
        }
    }

    if let Some(columns) = filter.virtual_index {
        table.unique_indexes.insert(
            VIRTUAL_INDEX_NAME.to_string(),
            UniqueIndex::new(VIRTUAL_INDEX_NAME, columns),
        );
        table.main_unique_index_name = Some(VIRTUAL_INDEX_NAME.to_string());
    }

    table
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sequence_filter() {
        let table = apply_table_filters(Table::new("rhnpackagename", &["id", "name"]));
        assert_eq!(table.pk_sequence.as_deref(), Some("RHN_PKG_NAME_SEQ"));
        assert!(!table.has_virtual_main_index());
    }

    #[test]
    fn test_virtual_index_becomes_main() {
        let mut table = Table::new("rhnpackage", &["id", "name_id", "evr_id"]);
        table
            .unique_indexes
            .insert("rhn_package_md5_uq".into(), UniqueIndex::new("rhn_package_md5_uq", &["md5sum"]));
        table.main_unique_index_name = Some("rhn_package_md5_uq".into());

        let table = apply_table_filters(table);
        assert!(table.has_virtual_main_index());
        assert_eq!(
            table.main_unique_columns(),
            &["name_id", "evr_id", "package_arch_id", "checksum_id", "org_id"]
        );
    }

    #[test]
    fn test_evr_unexports_type_and_extends_indexes() {
        let mut table = Table::new("rhnpackageevr", &["id", "epoch", "version", "release", "type"]);
        table.unique_indexes.insert(
            "rhn_pe_v_r_uq".into(),
            UniqueIndex::new("rhn_pe_v_r_uq", &["version", "release"]),
        );
        let table = apply_table_filters(table);
        assert!(table.is_unexported("type"));
        assert_eq!(
            table.unique_indexes["rhn_pe_v_r_uq"].columns,
            vec!["version", "release", "type"]
        );
        assert!(!table.unique_indexes.contains_key("rhn_pe_v_r_e_uq"));
    }

    #[test]
    fn test_unlisted_table_untouched() {
        let table = apply_table_filters(Table::new("rhnchannel", &["id", "label"]));
        assert!(table.pk_sequence.is_none());
        assert!(table.unexport_columns.is_empty());
    }
}
