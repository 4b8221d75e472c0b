//! Table sets, filters and subject queries for OS image and container metadata.

use std::fmt;

use chrono::NaiveDateTime;

use crate::core::{format_literal, quote_literal, Row, SqlValue, Table};
use crate::dump::ExportPlan;

/// Tables relevant for exporting image metadata.
///
/// Activation keys travel only as far as images reference them.
pub const IMAGE_TABLES: &[&str] = &[
    "suseimagestore",
    "suseimageprofile",
    "susekiwiprofile",
    "susedockerfileprofile",
    "rhnregtoken",
    "rhnactivationkey",
    "rhnchecksum",
    "suseimageinfo",
    "suseimageoverview",
    "suseimageinfochannel",
    "suseimageinfopackage",
    "suseimageinfoinstalledproduct",
    "susecveimagechannel",
    "suseimagecustomdatavalue",
    // Packages built into an image, such as its certificate rpm.
    "rhnpackageevr",
    "rhnpackagearch",
    "rhnpackagename",
    "susesaltpillar",
];

/// Container build tables, loaded on top of [`IMAGE_TABLES`].
pub const CONTAINER_TABLES: &[&str] = &["suseimagebuildhistory", "suseimagerepodigest"];

/// Image tables whose target rows are replaced by the exported set.
pub const IMAGE_TABLES_TO_CLEAN: &[&str] = &["suseimageinfochannel"];

/// Kind of image whose metadata is exported.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ImageKind {
    /// Kiwi built OS images kept in an `os_image` store.
    OsImage,
    /// Dockerfile built images kept in a `registry` store.
    Container,
}

impl ImageKind {
    /// Label of the store type holding this kind.
    pub fn store_type(self) -> &'static str {
        match self {
            ImageKind::OsImage => "os_image",
            ImageKind::Container => "registry",
        }
    }

    /// `suseimageprofile.image_type` of this kind.
    pub fn profile_type(self) -> &'static str {
        match self {
            ImageKind::OsImage => "kiwi",
            ImageKind::Container => "dockerfile",
        }
    }

    /// Table holding the profile details of this kind.
    pub fn profile_table(self) -> &'static str {
        match self {
            ImageKind::OsImage => "susekiwiprofile",
            ImageKind::Container => "susedockerfileprofile",
        }
    }

    /// `suseimageinfo.image_type` of this kind.
    pub fn image_type(self) -> &'static str {
        match self {
            ImageKind::OsImage => "kiwi",
            ImageKind::Container => "docker",
        }
    }

    /// Tables to load for this kind.
    pub fn tables(self) -> Vec<&'static str> {
        let mut tables = IMAGE_TABLES.to_vec();
        if self == ImageKind::Container {
            tables.extend_from_slice(CONTAINER_TABLES);
        }
        tables
    }
}

impl fmt::Display for ImageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ImageKind::OsImage => write!(f, "OS image"),
            ImageKind::Container => write!(f, "container"),
        }
    }
}

/// Restrict rows to the given organizations. An empty limit allows all.
pub fn org_condition(org_limit: &[i64]) -> Option<String> {
    if org_limit.is_empty() {
        return None;
    }
    let ids: Vec<String> = org_limit.iter().map(i64::to_string).collect();
    Some(format!("org_id in ({})", ids.join(", ")))
}

/// Row filter for the image stores of `kind`.
///
/// The store table is restricted to the kind's store type; every table with
/// an `org_id` column is restricted by the org limit.
pub fn store_filter(kind: ImageKind, org_limit: &[i64]) -> impl Fn(&Table) -> Option<String> + Sync {
    let org = org_condition(org_limit);
    move |table: &Table| {
        let mut conditions = Vec::new();
        if table.name == "suseimagestore" {
            conditions.push(format!(
                "store_type_id in (SELECT id FROM suseimagestoretype WHERE label = {})",
                quote_literal(kind.store_type())
            ));
        }
        if let Some(org) = org.as_ref().filter(|_| table.has_column("org_id")) {
            conditions.push(org.clone());
        }
        (!conditions.is_empty()).then(|| conditions.join(" and "))
    }
}

fn subject_conditions(
    base: String,
    org_limit: &[i64],
    since: Option<NaiveDateTime>,
) -> String {
    let mut conditions = vec![base];
    conditions.extend(org_condition(org_limit));
    if let Some(since) = since {
        conditions.push(format!(
            "modified >= {}",
            format_literal(&SqlValue::Timestamp(since))
        ));
    }
    conditions.join(" and ")
}

/// Profiles of `kind` to export, one row per `profile_id`.
pub fn profile_query(kind: ImageKind, org_limit: &[i64], since: Option<NaiveDateTime>) -> String {
    format!(
        "SELECT profile_id FROM suseimageprofile WHERE {}",
        subject_conditions(
            format!("image_type = {}", quote_literal(kind.profile_type())),
            org_limit,
            since
        )
    )
}

/// Images of `kind` to export, as whole rows.
pub fn image_query(kind: ImageKind, org_limit: &[i64], since: Option<NaiveDateTime>) -> String {
    format!(
        "SELECT * FROM suseimageinfo WHERE {}",
        subject_conditions(
            format!("image_type = {}", quote_literal(kind.image_type())),
            org_limit,
            since
        )
    )
}

/// Crawl seed for the image pillars.
pub fn pillar_filter(org_limit: &[i64], since: Option<NaiveDateTime>) -> String {
    subject_conditions("category = 'images'".to_string(), org_limit, since)
}

/// `WHERE` clause matching `row` of `table` by its natural key, or by its
/// primary key when it has none.
pub fn subject_scope(table: &Table, row: &Row) -> String {
    let columns = match table.main_unique_columns() {
        [] => table.pk_columns.as_slice(),
        columns => columns,
    };
    let conditions: Vec<String> = columns
        .iter()
        .map(|column| match row.value(column) {
            SqlValue::Null => format!("{}.{} is null", table.name, column),
            value => format!("{}.{} = {}", table.name, column, format_literal(&value)),
        })
        .collect();
    format!("WHERE {}", conditions.join(" and "))
}

/// Plan for one image, with its channel links replaced.
pub fn image_plan(scope: String, batch_size: usize) -> ExportPlan {
    ExportPlan::new()
        .with_clean_tables(IMAGE_TABLES_TO_CLEAN)
        .with_clean_where(scope)
        .with_batch_size(batch_size)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{int, make_row, make_table, text, with_main_index};
    use chrono::NaiveDate;

    #[test]
    fn test_kind_tables() {
        assert!(ImageKind::OsImage.tables().contains(&"suseimageinfochannel"));
        assert!(!ImageKind::OsImage.tables().contains(&"suseimagerepodigest"));
        assert!(ImageKind::Container.tables().contains(&"suseimagerepodigest"));
        for table in IMAGE_TABLES_TO_CLEAN {
            assert!(IMAGE_TABLES.contains(table));
        }
    }

    #[test]
    fn test_store_filter_scopes_store_type_and_orgs() {
        let filter = store_filter(ImageKind::Container, &[1, 4]);
        assert_eq!(
            filter(&make_table("suseimagestore", &["id", "label", "org_id", "store_type_id"])).as_deref(),
            Some(
                "store_type_id in (SELECT id FROM suseimagestoretype WHERE label = 'registry') \
                 and org_id in (1, 4)"
            )
        );
        assert_eq!(
            filter(&make_table("rhnregtoken", &["id", "org_id"])).as_deref(),
            Some("org_id in (1, 4)")
        );
        assert!(filter(&make_table("rhnchecksum", &["id", "checksum"])).is_none());

        let unlimited = store_filter(ImageKind::OsImage, &[]);
        assert!(unlimited(&make_table("rhnregtoken", &["id", "org_id"])).is_none());
    }

    #[test]
    fn test_subject_queries() {
        assert_eq!(
            profile_query(ImageKind::OsImage, &[], None),
            "SELECT profile_id FROM suseimageprofile WHERE image_type = 'kiwi'"
        );
        let since = NaiveDate::from_ymd_opt(2024, 3, 1)
            .and_then(|d| d.and_hms_opt(0, 0, 0));
        assert_eq!(
            image_query(ImageKind::Container, &[2], since),
            "SELECT * FROM suseimageinfo WHERE image_type = 'docker' and org_id in (2) \
             and modified >= '2024-03-01 00:00:00'"
        );
        assert_eq!(pillar_filter(&[], None), "category = 'images'");
    }

    #[test]
    fn test_subject_scope_uses_natural_key() {
        let info = with_main_index(
            make_table("suseimageinfo", &["id", "name", "version", "org_id"]),
            "suse_imginfo_nvo_uq",
            &["name", "version", "org_id"],
        );
        let row = make_row(&[
            ("id", int(7)),
            ("name", text("pxe")),
            ("version", text("1.0")),
            ("org_id", SqlValue::Null),
        ]);
        assert_eq!(
            subject_scope(&info, &row),
            "WHERE suseimageinfo.name = 'pxe' and suseimageinfo.version = '1.0' \
             and suseimageinfo.org_id is null"
        );

        let bare = make_table("suseimageinfo", &["id", "name"]);
        assert_eq!(subject_scope(&bare, &row), "WHERE suseimageinfo.id = 7");
    }
}
