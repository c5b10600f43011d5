//! The locket schema, oldest first.
//!
//! Append new definitions at the end. Never edit or remove one that has
//! shipped: the ledger only knows names, and the checksum check exists to
//! catch exactly that mistake.
//!
//! Definitions before `006_rename_corner_to_locket` still speak of
//! "corners". Their guards also check for the renamed objects, so a
//! database that was renamed by hand (or whose ledger was lost) does not
//! grow a second, empty `corners` table.

use crate::migration::MigrationDefinition;
use crate::step::{Guard, Step};

/// Every definition, in the order they must run.
pub fn all() -> Vec<MigrationDefinition> {
    vec![
        create_extensions(),
        create_core_schema(),
        add_comments_and_likes(),
        add_milestones(),
        add_media_location(),
        rename_corner_to_locket(),
        add_invite_expiry(),
        add_bucket_list_completion(),
        add_media_processing(),
        add_activity_indexes(),
        backfill_locket_updated_at(),
    ]
}

fn create_extensions() -> MigrationDefinition {
    MigrationDefinition::new("001_create_extensions").step(Step::sql(
        "enable pgcrypto for gen_random_uuid()",
        "CREATE EXTENSION IF NOT EXISTS pgcrypto",
    ))
}

fn create_core_schema() -> MigrationDefinition {
    let no_corners = |table: &str, renamed: &str| {
        Guard::table_missing(table).and(Guard::table_missing(renamed))
    };

    MigrationDefinition::new("002_create_core_schema")
        .step(Step::when(
            Guard::type_missing("corner_role").and(Guard::type_missing("locket_role")),
            "create enum corner_role",
            "CREATE TYPE corner_role AS ENUM ('owner', 'member')",
        ))
        .step(Step::when(
            Guard::type_missing("corner_invite_status")
                .and(Guard::type_missing("locket_invite_status")),
            "create enum corner_invite_status",
            "CREATE TYPE corner_invite_status AS ENUM ('pending', 'accepted', 'declined', 'revoked')",
        ))
        .step(Step::sql(
            "create enum media_kind",
            "DO $$ BEGIN \
             IF NOT EXISTS (SELECT 1 FROM pg_type WHERE typname = 'media_kind') THEN \
             CREATE TYPE media_kind AS ENUM ('photo', 'video'); \
             END IF; \
             END $$",
        ))
        .step(Step::sql(
            "create table users",
            "CREATE TABLE IF NOT EXISTS users (\
             id UUID PRIMARY KEY DEFAULT gen_random_uuid(), \
             firebase_uid TEXT NOT NULL UNIQUE, \
             email TEXT, \
             display_name TEXT, \
             avatar_url TEXT, \
             created_at TIMESTAMPTZ NOT NULL DEFAULT NOW(), \
             updated_at TIMESTAMPTZ NOT NULL DEFAULT NOW())",
        ))
        .step(Step::when(
            no_corners("corners", "lockets"),
            "create table corners",
            "CREATE TABLE corners (\
             id UUID DEFAULT gen_random_uuid(), \
             name TEXT NOT NULL, \
             description TEXT, \
             cover_photo_key TEXT, \
             anniversary_date DATE, \
             created_by UUID, \
             created_at TIMESTAMPTZ NOT NULL DEFAULT NOW(), \
             updated_at TIMESTAMPTZ, \
             CONSTRAINT corners_pkey PRIMARY KEY (id), \
             CONSTRAINT corners_created_by_fkey FOREIGN KEY (created_by) \
             REFERENCES users (id) ON DELETE SET NULL)",
        ))
        .step(Step::when(
            no_corners("corner_members", "locket_members"),
            "create table corner_members",
            "CREATE TABLE corner_members (\
             id UUID DEFAULT gen_random_uuid(), \
             corner_id UUID NOT NULL, \
             user_id UUID NOT NULL, \
             role corner_role NOT NULL DEFAULT 'member', \
             nickname TEXT, \
             joined_at TIMESTAMPTZ NOT NULL DEFAULT NOW(), \
             CONSTRAINT corner_members_pkey PRIMARY KEY (id), \
             CONSTRAINT corner_members_corner_id_fkey FOREIGN KEY (corner_id) \
             REFERENCES corners (id) ON DELETE CASCADE, \
             CONSTRAINT corner_members_user_id_fkey FOREIGN KEY (user_id) \
             REFERENCES users (id) ON DELETE CASCADE, \
             CONSTRAINT corner_members_corner_id_user_id_key UNIQUE (corner_id, user_id))",
        ))
        .step(Step::when(
            no_corners("corner_invites", "locket_invites"),
            "create table corner_invites",
            "CREATE TABLE corner_invites (\
             id UUID DEFAULT gen_random_uuid(), \
             corner_id UUID NOT NULL, \
             invited_by UUID, \
             email TEXT NOT NULL, \
             invite_code TEXT NOT NULL, \
             status corner_invite_status NOT NULL DEFAULT 'pending', \
             created_at TIMESTAMPTZ NOT NULL DEFAULT NOW(), \
             responded_at TIMESTAMPTZ, \
             CONSTRAINT corner_invites_pkey PRIMARY KEY (id), \
             CONSTRAINT corner_invites_corner_id_fkey FOREIGN KEY (corner_id) \
             REFERENCES corners (id) ON DELETE CASCADE, \
             CONSTRAINT corner_invites_invited_by_fkey FOREIGN KEY (invited_by) \
             REFERENCES users (id) ON DELETE SET NULL, \
             CONSTRAINT corner_invites_invite_code_key UNIQUE (invite_code))",
        ))
        .step(Step::sql(
            "create table memory_groups",
            "CREATE TABLE IF NOT EXISTS memory_groups (\
             id UUID DEFAULT gen_random_uuid(), \
             corner_id UUID NOT NULL, \
             title TEXT NOT NULL, \
             description TEXT, \
             memory_date DATE NOT NULL DEFAULT CURRENT_DATE, \
             created_by UUID REFERENCES users (id) ON DELETE SET NULL, \
             created_at TIMESTAMPTZ NOT NULL DEFAULT NOW(), \
             updated_at TIMESTAMPTZ NOT NULL DEFAULT NOW(), \
             CONSTRAINT memory_groups_pkey PRIMARY KEY (id), \
             CONSTRAINT memory_groups_corner_id_fkey FOREIGN KEY (corner_id) \
             REFERENCES corners (id) ON DELETE CASCADE)",
        ))
        .step(Step::sql(
            "create table media_items",
            "CREATE TABLE IF NOT EXISTS media_items (\
             id UUID PRIMARY KEY DEFAULT gen_random_uuid(), \
             memory_group_id UUID NOT NULL REFERENCES memory_groups (id) ON DELETE CASCADE, \
             storage_key TEXT NOT NULL, \
             kind media_kind NOT NULL DEFAULT 'photo', \
             content_type TEXT, \
             width INTEGER, \
             height INTEGER, \
             duration_seconds NUMERIC(10, 3), \
             taken_at TIMESTAMPTZ, \
             sort_order INTEGER NOT NULL DEFAULT 0, \
             uploaded_by UUID REFERENCES users (id) ON DELETE SET NULL, \
             created_at TIMESTAMPTZ NOT NULL DEFAULT NOW())",
        ))
        .step(Step::sql(
            "create table bucket_list_items",
            "CREATE TABLE IF NOT EXISTS bucket_list_items (\
             id UUID DEFAULT gen_random_uuid(), \
             corner_id UUID NOT NULL, \
             title TEXT NOT NULL, \
             description TEXT, \
             category TEXT, \
             is_completed BOOLEAN NOT NULL DEFAULT FALSE, \
             completed_at TIMESTAMPTZ, \
             created_by UUID REFERENCES users (id) ON DELETE SET NULL, \
             created_at TIMESTAMPTZ NOT NULL DEFAULT NOW(), \
             CONSTRAINT bucket_list_items_pkey PRIMARY KEY (id), \
             CONSTRAINT bucket_list_items_corner_id_fkey FOREIGN KEY (corner_id) \
             REFERENCES corners (id) ON DELETE CASCADE)",
        ))
        .step(Step::sql(
            "create table sessions",
            "CREATE TABLE IF NOT EXISTS sessions (\
             id UUID PRIMARY KEY DEFAULT gen_random_uuid(), \
             user_id UUID NOT NULL REFERENCES users (id) ON DELETE CASCADE, \
             token_hash TEXT NOT NULL UNIQUE, \
             user_agent TEXT, \
             expires_at TIMESTAMPTZ NOT NULL, \
             created_at TIMESTAMPTZ NOT NULL DEFAULT NOW())",
        ))
        .steps(
            [
                ("idx_corner_members_user", "corner_members (user_id)", "idx_locket_members_user"),
                ("idx_corner_members_corner", "corner_members (corner_id)", "idx_locket_members_locket"),
                ("idx_corner_invites_email", "corner_invites (email)", "idx_locket_invites_email"),
                (
                    "idx_memory_groups_corner_date",
                    "memory_groups (corner_id, memory_date DESC)",
                    "idx_memory_groups_locket_date",
                ),
                ("idx_bucket_list_items_corner", "bucket_list_items (corner_id)", "idx_bucket_list_items_locket"),
            ]
            .into_iter()
            .map(|(index, target, renamed)| {
                Step::when(
                    Guard::index_missing(index).and(Guard::index_missing(renamed)),
                    format!("create index {}", index),
                    format!("CREATE INDEX IF NOT EXISTS {} ON {}", index, target),
                )
            }),
        )
        .step(Step::sql(
            "create index idx_media_items_group",
            "CREATE INDEX IF NOT EXISTS idx_media_items_group ON media_items (memory_group_id, sort_order)",
        ))
}

fn add_comments_and_likes() -> MigrationDefinition {
    MigrationDefinition::new("003_add_comments_and_likes")
        .step(Step::sql(
            "create table comments",
            "CREATE TABLE IF NOT EXISTS comments (\
             id UUID PRIMARY KEY DEFAULT gen_random_uuid(), \
             memory_group_id UUID NOT NULL REFERENCES memory_groups (id) ON DELETE CASCADE, \
             author_id UUID NOT NULL REFERENCES users (id) ON DELETE CASCADE, \
             body TEXT NOT NULL, \
             created_at TIMESTAMPTZ NOT NULL DEFAULT NOW(), \
             updated_at TIMESTAMPTZ NOT NULL DEFAULT NOW())",
        ))
        .step(Step::sql(
            "create table likes",
            "CREATE TABLE IF NOT EXISTS likes (\
             id UUID PRIMARY KEY DEFAULT gen_random_uuid(), \
             memory_group_id UUID NOT NULL REFERENCES memory_groups (id) ON DELETE CASCADE, \
             user_id UUID NOT NULL REFERENCES users (id) ON DELETE CASCADE, \
             created_at TIMESTAMPTZ NOT NULL DEFAULT NOW(), \
             CONSTRAINT likes_memory_group_id_user_id_key UNIQUE (memory_group_id, user_id))",
        ))
        .step(Step::sql(
            "index comments by memory",
            "CREATE INDEX IF NOT EXISTS idx_comments_memory_group ON comments (memory_group_id)",
        ))
}

fn add_milestones() -> MigrationDefinition {
    MigrationDefinition::new("004_add_milestones")
        .step(Step::add_column(
            "memory_groups",
            "is_milestone",
            "BOOLEAN NOT NULL DEFAULT FALSE",
        ))
        .step(Step::add_column("memory_groups", "milestone_type", "TEXT"))
        .step(Step::when(
            Guard::column_exists("memory_groups", "corner_id"),
            "index milestones per corner",
            "CREATE INDEX IF NOT EXISTS idx_memory_groups_milestones \
             ON memory_groups (corner_id, memory_date) WHERE is_milestone",
        ))
        .step(Step::when(
            Guard::column_exists("memory_groups", "locket_id"),
            "index milestones per locket",
            "CREATE INDEX IF NOT EXISTS idx_memory_groups_milestones \
             ON memory_groups (locket_id, memory_date) WHERE is_milestone",
        ))
}

fn add_media_location() -> MigrationDefinition {
    MigrationDefinition::new("005_add_media_location")
        .step(Step::add_column("media_items", "latitude", "DOUBLE PRECISION"))
        .step(Step::add_column("media_items", "longitude", "DOUBLE PRECISION"))
        .step(Step::add_column("media_items", "place_name", "TEXT"))
        .step(Step::add_column("memory_groups", "location_name", "TEXT"))
}

/// Tables, columns, constraints, indexes and enum types: every place the
/// legacy "corner" name leaked into the schema.
fn rename_corner_to_locket() -> MigrationDefinition {
    let types = [
        ("corner_role", "locket_role"),
        ("corner_invite_status", "locket_invite_status"),
    ];
    let tables = [
        ("corners", "lockets"),
        ("corner_members", "locket_members"),
        ("corner_invites", "locket_invites"),
    ];
    let columns = [
        "locket_members",
        "locket_invites",
        "memory_groups",
        "bucket_list_items",
    ];
    let constraints = [
        ("lockets", "corners_pkey", "lockets_pkey"),
        ("lockets", "corners_created_by_fkey", "lockets_created_by_fkey"),
        ("locket_members", "corner_members_pkey", "locket_members_pkey"),
        ("locket_members", "corner_members_corner_id_fkey", "locket_members_locket_id_fkey"),
        ("locket_members", "corner_members_user_id_fkey", "locket_members_user_id_fkey"),
        (
            "locket_members",
            "corner_members_corner_id_user_id_key",
            "locket_members_locket_id_user_id_key",
        ),
        ("locket_invites", "corner_invites_pkey", "locket_invites_pkey"),
        ("locket_invites", "corner_invites_corner_id_fkey", "locket_invites_locket_id_fkey"),
        ("locket_invites", "corner_invites_invited_by_fkey", "locket_invites_invited_by_fkey"),
        ("locket_invites", "corner_invites_invite_code_key", "locket_invites_invite_code_key"),
        ("memory_groups", "memory_groups_corner_id_fkey", "memory_groups_locket_id_fkey"),
        (
            "bucket_list_items",
            "bucket_list_items_corner_id_fkey",
            "bucket_list_items_locket_id_fkey",
        ),
    ];
    let indexes = [
        ("idx_corner_members_user", "idx_locket_members_user"),
        ("idx_corner_members_corner", "idx_locket_members_locket"),
        ("idx_corner_invites_email", "idx_locket_invites_email"),
        ("idx_memory_groups_corner_date", "idx_memory_groups_locket_date"),
        ("idx_bucket_list_items_corner", "idx_bucket_list_items_locket"),
    ];

    // Tables before columns before constraints: each later step names
    // objects by their already-renamed parents.
    MigrationDefinition::new("006_rename_corner_to_locket")
        .steps(types.iter().map(|(old, new)| Step::rename_type(old, new)))
        .steps(tables.iter().map(|(old, new)| Step::rename_table(old, new)))
        .steps(
            columns
                .iter()
                .map(|table| Step::rename_column(table, "corner_id", "locket_id")),
        )
        .steps(
            constraints
                .iter()
                .map(|(table, old, new)| Step::rename_constraint(table, old, new)),
        )
        .steps(indexes.iter().map(|(old, new)| Step::rename_index(old, new)))
}

fn add_invite_expiry() -> MigrationDefinition {
    MigrationDefinition::new("007_add_invite_expiry")
        .step(Step::add_column("locket_invites", "expires_at", "TIMESTAMPTZ"))
        .step(Step::sql(
            "add 'expired' invite status",
            "ALTER TYPE locket_invite_status ADD VALUE IF NOT EXISTS 'expired'",
        ))
        .step(Step::sql(
            "default expiry for open invites",
            "UPDATE locket_invites SET expires_at = created_at + INTERVAL '14 days' \
             WHERE expires_at IS NULL AND status = 'pending'",
        ))
}

fn add_bucket_list_completion() -> MigrationDefinition {
    MigrationDefinition::new("008_add_bucket_list_completion")
        .step(Step::add_column(
            "bucket_list_items",
            "completed_by",
            "UUID REFERENCES users (id) ON DELETE SET NULL",
        ))
        .step(Step::add_column(
            "bucket_list_items",
            "completion_memory_group_id",
            "UUID REFERENCES memory_groups (id) ON DELETE SET NULL",
        ))
        .step(Step::add_column("bucket_list_items", "target_date", "DATE"))
        .step(Step::sql(
            "keep is_completed and completed_at consistent",
            "UPDATE bucket_list_items SET completed_at = created_at \
             WHERE is_completed AND completed_at IS NULL",
        ))
}

fn add_media_processing() -> MigrationDefinition {
    MigrationDefinition::new("009_add_media_processing")
        .step(Step::when(
            Guard::type_missing("media_status"),
            "create enum media_status",
            "CREATE TYPE media_status AS ENUM ('pending', 'ready', 'failed')",
        ))
        .step(Step::add_column(
            "media_items",
            "processing_status",
            "media_status NOT NULL DEFAULT 'ready'",
        ))
        .step(Step::add_column("media_items", "thumbnail_key", "TEXT"))
        .step(Step::sql(
            "index unprocessed media",
            "CREATE INDEX IF NOT EXISTS idx_media_items_pending \
             ON media_items (created_at) WHERE processing_status = 'pending'",
        ))
}

fn add_activity_indexes() -> MigrationDefinition {
    MigrationDefinition::new("010_add_activity_indexes").steps([
        Step::sql(
            "comments by memory and time",
            "CREATE INDEX IF NOT EXISTS idx_comments_memory_group_created \
             ON comments (memory_group_id, created_at)",
        ),
        Step::sql(
            "likes by user",
            "CREATE INDEX IF NOT EXISTS idx_likes_user ON likes (user_id)",
        ),
        Step::sql(
            "sessions by user",
            "CREATE INDEX IF NOT EXISTS idx_sessions_user ON sessions (user_id)",
        ),
        Step::sql(
            "sessions by expiry",
            "CREATE INDEX IF NOT EXISTS idx_sessions_expires ON sessions (expires_at)",
        ),
    ])
}

fn backfill_locket_updated_at() -> MigrationDefinition {
    MigrationDefinition::new("011_backfill_locket_updated_at")
        .step(Step::sql(
            "backfill lockets.updated_at",
            "UPDATE lockets SET updated_at = created_at WHERE updated_at IS NULL",
        ))
        .step(Step::sql(
            "require lockets.updated_at",
            "DO $$ BEGIN \
             IF EXISTS (SELECT 1 FROM information_schema.columns \
             WHERE table_schema = current_schema() AND table_name = 'lockets' \
             AND column_name = 'updated_at' AND is_nullable = 'YES') THEN \
             ALTER TABLE lockets ALTER COLUMN updated_at SET DEFAULT NOW(); \
             ALTER TABLE lockets ALTER COLUMN updated_at SET NOT NULL; \
             END IF; \
             END $$",
        ))
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;

    use super::*;
    use crate::runner::check_unique;

    fn position(definitions: &[MigrationDefinition], name: &str) -> usize {
        definitions
            .iter()
            .position(|d| d.name == name)
            .unwrap_or_else(|| panic!("missing definition {name}"))
    }

    #[test]
    fn names_are_unique_and_numbered_in_order() {
        let definitions = all();
        check_unique(&definitions).unwrap();

        let prefixes: Vec<u32> = definitions
            .iter()
            .map(|d| d.name[..3].parse().unwrap())
            .collect();
        let expected: Vec<u32> = (1..=definitions.len() as u32).collect();
        assert_eq!(prefixes, expected);
    }

    #[test]
    fn every_definition_has_steps() {
        for definition in all() {
            assert!(!definition.steps.is_empty(), "{} has no steps", definition.name);
        }
    }

    #[test]
    fn checksums_are_distinct() {
        let checksums: HashSet<String> = all().iter().map(|d| d.checksum()).collect();
        assert_eq!(checksums.len(), all().len());
    }

    #[test]
    fn rename_runs_after_schema_and_before_locket_users() {
        let definitions = all();
        let rename = position(&definitions, "006_rename_corner_to_locket");
        assert!(position(&definitions, "002_create_core_schema") < rename);
        assert!(rename < position(&definitions, "007_add_invite_expiry"));
        assert!(rename < position(&definitions, "011_backfill_locket_updated_at"));
    }

    #[test]
    fn every_rename_is_guarded() {
        let definitions = all();
        let rename = &definitions[position(&definitions, "006_rename_corner_to_locket")];
        for step in &rename.steps {
            assert!(step.guard.is_some(), "unguarded rename step: {}", step.description);
            assert!(step.effect.contains("RENAME"), "{}", step.effect);
        }
    }

    #[test]
    fn rename_orders_tables_before_their_columns() {
        let definitions = all();
        let rename = &definitions[position(&definitions, "006_rename_corner_to_locket")];
        let step_index = |needle: &str| {
            rename
                .steps
                .iter()
                .position(|s| s.effect.contains(needle))
                .unwrap_or_else(|| panic!("no step for {needle}"))
        };

        let members_table = step_index("ALTER TABLE corner_members RENAME TO locket_members");
        let members_column = step_index("ALTER TABLE locket_members RENAME COLUMN corner_id");
        let members_fkey = step_index("RENAME CONSTRAINT corner_members_corner_id_fkey");
        assert!(members_table < members_column);
        assert!(members_column < members_fkey);
    }

    #[test]
    fn no_corner_objects_survive_the_rename() {
        let definitions = all();
        let rename = &definitions[position(&definitions, "006_rename_corner_to_locket")];
        for step in &rename.steps {
            let target = step.effect.rsplit(" TO ").next().unwrap();
            assert!(!target.contains("corner"), "rename target still says corner: {}", step.effect);
        }
    }

    #[test]
    fn milestone_index_is_built_under_either_column_name() {
        let definitions = all();
        let milestones = &definitions[position(&definitions, "004_add_milestones")];
        let index_steps: Vec<_> = milestones
            .steps
            .iter()
            .filter(|s| s.effect.contains("idx_memory_groups_milestones"))
            .collect();

        assert_eq!(index_steps.len(), 2);
        for (step, column) in index_steps.iter().zip(["corner_id", "locket_id"]) {
            assert_eq!(
                step.guard,
                Some(Guard::column_exists("memory_groups", column)),
                "{}",
                step.description
            );
            assert!(step.effect.contains(&format!("({}, memory_date)", column)));
        }
    }

    #[test]
    fn legacy_creates_are_skipped_once_renamed() {
        let definitions = all();
        let core = &definitions[position(&definitions, "002_create_core_schema")];
        let create_corners = core
            .steps
            .iter()
            .find(|s| s.effect.starts_with("CREATE TABLE corners ("))
            .unwrap();
        assert!(create_corners.guard.as_ref().unwrap().predicate().contains("'lockets'"));
    }
}
