//! Decisions on which schema edges a walk follows.
//!
//! Forward edges (foreign keys a table owns) are always needed for
//! reachability. Backward edges (rows pointing at the current one) are only
//! followed when they lead to rows that belong to the subject.

use crate::core::Table;

/// Incoming references that are always followed, as (owner, candidate).
pub const FORCED_NAVIGATIONS: &[(&str, &str)] = &[
    ("rhnchannelfamily", "rhnpublicchannelfamily"),
    ("rhnchannel", "susemddata"),
    ("rhnchannel", "suseproductchannel"),
    ("rhnchannel", "rhnreleasechannelmap"),
    ("rhnchannel", "rhndistchannelmap"),
    ("rhnchannel", "rhnerratafilechannel"),
    ("suseproducts", "suseproductextension"),
    ("suseproducts", "suseproductsccrepository"),
    ("rhnpackageevr", "rhnpackagenevra"),
    ("rhnerrata", "rhnerratafile"),
    ("rhnconfigchannel", "rhnconfigfile"),
    ("rhnconfigfile", "rhnconfigrevision"),
    ("suseimageinfo", "suseimagecustomdatavalue"),
    ("suseimageinfo", "susecveimagechannel"),
    ("suseimageinfo", "suseimagebuildhistory"),
    ("suseimagebuildhistory", "suseimagerepodigest"),
];

/// Forward edges skipped when ordering emission, as (owner, target).
///
/// `rhnconfigfile.latest_config_revision_id` points at a revision that itself
/// needs the file; the pointer is written afterwards by a post-subtree hook.
pub const ORDERING_BLOCKED_EDGES: &[(&str, &str)] = &[("rhnconfigfile", "rhnconfigrevision")];

fn in_path(path: &[String], table: &str) -> bool {
    path.iter().any(|p| p == table)
}

/// Check if a walk at `owner` should follow the rows of `candidate` that
/// reference it.
pub fn should_follow_back_reference(path: &[String], owner: &Table, candidate: &Table) -> bool {
    if in_path(path, &candidate.name) {
        return false;
    }

    if FORCED_NAVIGATIONS
        .iter()
        .any(|(o, c)| *o == owner.name && *c == candidate.name)
    {
        return true;
    }

    let not_shared = candidate.referenced_by.is_empty();
    let is_child = candidate.name.starts_with(&owner.name);
    let no_loop_back = candidate
        .references
        .iter()
        .filter(|r| r.table_name != owner.name)
        .all(|r| !in_path(path, &r.table_name));

    not_shared && is_child && no_loop_back
}

/// Check if emission ordering should descend from `owner` into `target`.
pub fn should_descend_forward_for_ordering(_path: &[String], owner: &str, target: &str) -> bool {
    !ORDERING_BLOCKED_EDGES
        .iter()
        .any(|(o, t)| *o == owner && *t == target)
}
