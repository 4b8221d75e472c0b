//! Post-subtree hooks used by configuration channel exports.

use async_trait::async_trait;
use tracing::debug;

use crate::core::{format_literal, Row, SqlValue, Table};
use crate::dump::{FkResolver, PostSubtreeHook};
use crate::error::Result;

/// Points each exported configuration file at its latest revision.
///
/// The file row is written before its revisions exist on the target, so the
/// pointer can only be set once the revisions are in.
#[derive(Debug, Default)]
pub struct ConfigFileRevisionHook;

#[async_trait]
impl PostSubtreeHook for ConfigFileRevisionHook {
    async fn after_subtree(
        &self,
        table: &Table,
        rows: &[Row],
        resolver: &mut FkResolver<'_>,
    ) -> Result<Vec<String>> {
        let mut statements = Vec::new();
        for row in rows {
            let latest = row.value("latest_config_revision_id");
            if latest.is_null() {
                continue;
            }

            let revisions = resolver
                .source()
                .query(
                    "SELECT revision FROM rhnconfigrevision WHERE id = $1",
                    &[latest.clone()],
                )
                .await?;
            let Some(revision) = revisions.first().map(|r| r.value("revision")) else {
                debug!("Revision {} not found, pointer left unset", format_literal(&latest));
                continue;
            };
            let Some(file) = resolver.natural_key_predicate(table, row).await? else {
                continue;
            };

            statements.push(latest_revision_update(&table.name, &file, &revision));
        }
        Ok(statements)
    }
}

fn latest_revision_update(table: &str, file: &str, revision: &SqlValue) -> String {
    format!(
        "UPDATE {table} SET latest_config_revision_id = (SELECT id FROM rhnconfigrevision \
         WHERE config_file_id = (SELECT id FROM {table} WHERE {file} limit 1) \
         AND revision = {revision} limit 1) WHERE {file};",
        table = table,
        file = file,
        revision = format_literal(revision),
    )
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::core::Schema;
    use crate::dump::{Crawler, Emitter, ExportPlan};
    use crate::testing::{int, make_table, text, with_main_index, with_reference, MemorySource};

    fn config_schema() -> (Schema, MemorySource) {
        let schema = Schema::from_tables(vec![
            with_main_index(
                make_table("rhnconfigchannel", &["id", "label"]),
                "rhn_confchan_label_uq",
                &["label"],
            ),
            with_main_index(
                make_table("rhnconfigfilename", &["id", "path"]),
                "rhn_cfname_path_uq",
                &["path"],
            ),
            with_reference(
                with_reference(
                    with_reference(
                        with_main_index(
                            make_table(
                                "rhnconfigfile",
                                &["id", "config_channel_id", "config_file_name_id", "latest_config_revision_id"],
                            ),
                            "rhn_cf_uq",
                            &["config_channel_id", "config_file_name_id"],
                        ),
                        "rhnconfigchannel",
                        &[("config_channel_id", "id")],
                    ),
                    "rhnconfigfilename",
                    &[("config_file_name_id", "id")],
                ),
                "rhnconfigrevision",
                &[("latest_config_revision_id", "id")],
            ),
            with_reference(
                with_main_index(
                    make_table("rhnconfigrevision", &["id", "config_file_id", "revision"]),
                    "rhn_confrevision_cfid_rev_uq",
                    &["config_file_id", "revision"],
                ),
                "rhnconfigfile",
                &[("config_file_id", "id")],
            ),
        ]);
        let source = MemorySource::new()
            .with_rows("rhnconfigchannel", &["id", "label"], vec![vec![int(1), text("web")]])
            .with_rows("rhnconfigfilename", &["id", "path"], vec![vec![int(20), text("/etc/motd")]])
            .with_rows(
                "rhnconfigfile",
                &["id", "config_channel_id", "config_file_name_id", "latest_config_revision_id"],
                vec![vec![int(10), int(1), int(20), int(31)]],
            )
            .with_rows(
                "rhnconfigrevision",
                &["id", "config_file_id", "revision"],
                vec![vec![int(30), int(10), int(1)], vec![int(31), int(10), int(2)]],
            );
        (schema, source)
    }

    #[tokio::test]
    async fn test_latest_revision_set_after_revisions() {
        let (schema, source) = config_schema();
        let export_set = Crawler::new(&source, &schema)
            .crawl("rhnconfigchannel", "label = 'web'")
            .await
            .unwrap();
        assert_eq!(export_set.keys("rhnconfigrevision").len(), 2);

        let plan = ExportPlan::new().with_hook("rhnconfigfile", Arc::new(ConfigFileRevisionHook));
        let mut out = Vec::new();
        Emitter::new(&source, &schema, &plan)
            .emit("rhnconfigchannel", &export_set, &mut out)
            .await
            .unwrap();
        let out = String::from_utf8(out).unwrap();

        let file = "config_channel_id = (SELECT id FROM rhnconfigchannel WHERE label = 'web' limit 1) \
                    and config_file_name_id = (SELECT id FROM rhnconfigfilename WHERE path = '/etc/motd' limit 1)";
        let update = format!(
            "UPDATE rhnconfigfile SET latest_config_revision_id = (SELECT id FROM rhnconfigrevision \
             WHERE config_file_id = (SELECT id FROM rhnconfigfile WHERE {file} limit 1) \
             AND revision = 2 limit 1) WHERE {file};",
            file = file
        );
        let update_at = out.find(&update).expect("update statement");
        let file_at = out.find("INSERT INTO rhnconfigfile ").expect("file insert");
        let revision_at = out.rfind("INSERT INTO rhnconfigrevision ").expect("revision insert");
        assert!(file_at < revision_at);
        assert!(revision_at < update_at);
    }

    #[tokio::test]
    async fn test_file_without_revision_pointer_is_skipped() {
        let (schema, source) = config_schema();
        let table = schema.get("rhnconfigfile").unwrap();
        let row: Row = [
            ("id", int(11)),
            ("config_channel_id", int(1)),
            ("config_file_name_id", int(20)),
            ("latest_config_revision_id", SqlValue::Null),
        ]
        .into_iter()
        .map(|(c, v)| crate::core::Field::new(c, v))
        .collect();

        let mut resolver = FkResolver::new(&source, &schema);
        let statements = ConfigFileRevisionHook
            .after_subtree(table, &[row], &mut resolver)
            .await
            .unwrap();
        assert!(statements.is_empty());
    }
}
