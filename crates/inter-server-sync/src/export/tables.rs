//! Table sets and emission plans for each kind of export subject.

use crate::core::{quote_literal, Table};
use crate::dump::ExportPlan;

/// Tables relevant for exporting software channels.
pub const SOFTWARE_CHANNEL_TABLES: &[&str] = &[
    "rhnchannel",
    "rhnchannelcloned",
    "suseproductchannel",
    "rhnproductname",
    "rhnchannelproduct",
    "rhnreleasechannelmap",
    "rhndistchannelmap",
    "rhnchannelcomps",
    "rhnchannelfamilymembers",
    "rhnerrata",
    "rhnerratacloned",
    "rhnchannelerrata",
    "rhnpackagenevra",
    "rhnpackagename",
    "rhnpackagegroup",
    "rhnpackageevr",
    "rhnchecksum",
    "rhnpackage",
    "rhnchannelpackage",
    "rhnerratapackage",
    "rhnerratafile",
    "rhnerratafilechannel",
    "rhnerratafilepackage",
    "rhnerratafilepackagesource",
    "rhnpackagekeyassociation",
    "rhnerratabuglist",
    "rhncve",
    "rhnerratacve",
    "rhnerratakeyword",
    "rhnpackagecapability",
    "rhnpackagebreaks",
    "rhnpackagechangelogdata",
    "rhnpackagechangelogrec",
    "rhnpackageconflicts",
    "rhnpackageenhances",
    "rhnpackagefile",
    "rhnpackageobsoletes",
    "rhnpackagepredepends",
    "rhnpackageprovides",
    "rhnpackagerecommends",
    "rhnpackagerequires",
    "rhnsourcerpm",
    "rhnpackagesource",
    "rhnpackagesuggests",
    "rhnpackagesupplements",
    "susemddata",
    "susemdkeyword",
];

/// Product catalog tables, exported in full with any channel.
pub const PRODUCT_TABLES: &[&str] = &[
    "suseproducts",
    "suseproductextension",
    "suseproductsccrepository",
    "susesccrepository",
    "suseupgradepath",
    "rhnchannelfamily",
    "rhnpublicchannelfamily",
];

/// Tables relevant for exporting configuration channels.
pub const CONFIG_TABLES: &[&str] = &[
    "rhnconfigfile",
    "rhnconfigfilename",
    "rhnconfigrevision",
    "rhnconfigcontent",
    "rhnconfigchannel",
    "rhnconfigfilestate",
    "rhnregtokenconfigchannels",
    "rhnserverconfigchannel",
    "rhnsnapshotconfigchannel",
    "susestaterevisionconfigchannel",
    "rhnconfiginfo",
    "rhnconfigfilefailure",
    "rhnchecksum",
    "rhnchecksumtype",
    "web_contact",
];

/// Tables whose target rows are replaced by the exported set.
pub const TABLES_TO_CLEAN: &[&str] = &[
    "rhnreleasechannelmap",
    "rhndistchannelmap",
    "rhnchannelerrata",
    "rhnchannelpackage",
    "rhnerratapackage",
    "rhnerratafile",
    "rhnerratafilechannel",
    "rhnerratafilepackage",
    "rhnerratafilepackagesource",
    "rhnerratabuglist",
    "rhnerratacve",
    "rhnerratakeyword",
    "susemddata",
    "susemdkeyword",
    "suseproductchannel",
];

/// Tables whose rows are only inserted when their parents exist on the target.
pub const PARENT_GATED_TABLES: &[&str] = &["rhnchannelcloned", "rhnerratacloned", "suseproductchannel"];

/// Plan for one software channel.
pub fn channel_plan(label: &str, batch_size: usize) -> ExportPlan {
    ExportPlan::new()
        .with_clean_tables(TABLES_TO_CLEAN)
        .with_parent_gated(PARENT_GATED_TABLES)
        .with_clean_where(format!(
            "WHERE rhnchannel.id = (SELECT id FROM rhnchannel WHERE label = {})",
            quote_literal(label)
        ))
        .with_batch_size(batch_size)
}

/// Plan for one configuration channel, without its post-subtree hook.
pub fn config_plan(label: &str, batch_size: usize) -> ExportPlan {
    ExportPlan::new()
        .with_clean_tables(TABLES_TO_CLEAN)
        .with_parent_gated(PARENT_GATED_TABLES)
        .with_clean_where(format!(
            "WHERE rhnconfigchannel.id = (SELECT id FROM rhnconfigchannel WHERE label = {})",
            quote_literal(label)
        ))
        .with_batch_size(batch_size)
}

/// Plan for the product catalog.
pub fn product_plan(batch_size: usize) -> ExportPlan {
    ExportPlan::new()
        .with_parent_gated(PARENT_GATED_TABLES)
        .with_batch_size(batch_size)
        .with_export_unreached(true)
}

/// Only vendor rows of the product catalog are exported.
pub fn product_filter(table: &Table) -> Option<String> {
    table
        .has_column("org_id")
        .then(|| "org_id is null".to_string())
}

/// Crawl seed for a subject label.
pub fn label_filter(label: &str) -> String {
    format!("label = {}", quote_literal(label))
}

/// Statements refreshing the target's derived data for a channel.
pub fn cache_refresh_statements(label: &str) -> Vec<String> {
    let label = quote_literal(label);
    vec![
        format!(
            "UPDATE rhnchannel SET modified = current_timestamp WHERE label = {};",
            label
        ),
        format!(
            "SELECT rhn_channel.update_needed_cache((SELECT id FROM rhnchannel WHERE label = {}));",
            label
        ),
        format!(
            "SELECT rhn_channel.refresh_newest_package((SELECT id FROM rhnchannel WHERE label = {}), 'inter-server-sync');",
            label
        ),
        format!(
            "INSERT INTO rhnRepoRegenQueue (id, channel_label, client, reason, force, bypass_filters, \
             next_action, created, modified) VALUES (null, {}, 'inter server sync v2', 'channel sync', \
             'N', 'N', current_timestamp, current_timestamp, current_timestamp);",
            label
        ),
    ]
}
