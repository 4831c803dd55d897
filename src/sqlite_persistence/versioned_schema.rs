use anyhow::{bail, Result};
use rusqlite::{params, Connection};

pub const DEFAULT_TIMESTAMP: &str = "(cast(strftime('%s','now') as int))";

/// Offset added to the schema version before stamping `PRAGMA user_version`,
/// so a plain SQLite file (user_version 0) is distinguishable from one of
/// ours at schema version 0.
pub const BASE_DB_VERSION: usize = 99999;

#[macro_export]
macro_rules! sqlite_column {
    ($name:expr, $sql_type:expr $(, $field:ident = $value:expr)*) => {
        {
            // Allow unused_mut because the variable is only mutated when optional
            // field assignments are passed to the macro (e.g., `is_primary_key = true`)
            #[allow(unused_mut)]
            let mut column = Column {
                name: $name,
                sql_type: $sql_type,
                is_primary_key: false,
                non_null: false,
                is_unique: false,
                collate_nocase: false,
                default_value: None,
                foreign_key: None,
            };
            $(
                column.$field = $value;
            )*
            column
        }
    };
}

#[derive(Debug, PartialEq, Eq)]
pub enum SqlType {
    Text,
    Integer,
    Real,
    Blob,
}

#[allow(unused)]
pub enum ForeignKeyOnChange {
    NoAction,
    Restrict,
    SetNull,
    SetDefault,
    Cascade,
}

pub struct ForeignKey {
    pub foreign_table: &'static str,
    pub foreign_column: &'static str,
    pub on_delete: ForeignKeyOnChange,
}

pub struct Column {
    pub name: &'static str,
    pub sql_type: &'static SqlType,
    pub is_primary_key: bool,
    pub non_null: bool,
    pub is_unique: bool,
    /// Uniqueness and comparisons on this column ignore ASCII case.
    /// File paths are compared case-insensitively within a volume.
    pub collate_nocase: bool,
    pub default_value: Option<&'static str>,
    pub foreign_key: Option<&'static ForeignKey>,
}

pub struct Table {
    pub name: &'static str,
    pub columns: &'static [Column],
    pub indices: &'static [(&'static str, &'static str)],
    pub unique_constraints: &'static [&'static [&'static str]],
}

/// A read-optimized view created alongside the tables of a schema version.
pub struct View {
    pub name: &'static str,
    pub select_sql: &'static str,
}

impl Table {
    pub fn create(&self, conn: &Connection) -> Result<()> {
        let mut create_sql = format!("CREATE TABLE {} (", self.name);
        for (column_index, column) in self.columns.iter().enumerate() {
            if column_index > 0 {
                create_sql.push_str(", ");
            }
            create_sql.push_str(&format!(
                "{} {}",
                column.name,
                match column.sql_type {
                    SqlType::Text => "TEXT",
                    SqlType::Integer => "INTEGER",
                    SqlType::Real => "REAL",
                    SqlType::Blob => "BLOB",
                }
            ));
            if column.is_primary_key {
                create_sql.push_str(" PRIMARY KEY");
            }
            if column.non_null {
                create_sql.push_str(" NOT NULL");
            }
            if column.is_unique {
                create_sql.push_str(" UNIQUE");
            }
            if column.collate_nocase {
                create_sql.push_str(" COLLATE NOCASE");
            }
            if let Some(default_value) = column.default_value {
                create_sql.push_str(&format!(" DEFAULT {}", default_value));
            }
            if let Some(foreign_key) = column.foreign_key {
                create_sql.push_str(&format!(
                    " REFERENCES {}({}) ON DELETE {}",
                    foreign_key.foreign_table,
                    foreign_key.foreign_column,
                    match foreign_key.on_delete {
                        ForeignKeyOnChange::NoAction => "NO ACTION",
                        ForeignKeyOnChange::Restrict => "RESTRICT",
                        ForeignKeyOnChange::SetNull => "SET NULL",
                        ForeignKeyOnChange::SetDefault => "SET DEFAULT",
                        ForeignKeyOnChange::Cascade => "CASCADE",
                    }
                ));
            }
        }

        for unique_constraint in self.unique_constraints {
            create_sql.push_str(&format!(", UNIQUE ({})", unique_constraint.join(", ")));
        }
        create_sql.push_str(");");
        conn.execute(&create_sql, params![])?;

        for (index_name, column_name) in self.indices {
            conn.execute(
                &format!(
                    "CREATE INDEX {} ON {}({});",
                    index_name, self.name, column_name
                ),
                params![],
            )?;
        }
        Ok(())
    }
}

pub struct VersionedSchema {
    pub version: usize,
    pub tables: &'static [Table],
    pub views: &'static [View],
    pub migration: Option<fn(&Connection) -> Result<()>>,
}

impl VersionedSchema {
    pub fn create(&self, conn: &Connection) -> Result<()> {
        conn.execute("PRAGMA foreign_keys = ON;", params![])?;
        for table in self.tables {
            table.create(conn)?;
        }
        for view in self.views {
            conn.execute(
                &format!("CREATE VIEW {} AS {};", view.name, view.select_sql),
                params![],
            )?;
        }
        conn.execute(
            &format!("PRAGMA user_version = {}", BASE_DB_VERSION + self.version),
            [],
        )?;
        Ok(())
    }

    /// Lightweight open-time sanity check: every expected table and view must
    /// exist with the expected column names. Detects truncated or foreign
    /// files masquerading as one of ours; mismatches are treated as schema
    /// corruption by the caller (delete and recreate).
    pub fn validate(&self, conn: &Connection) -> Result<()> {
        for table in self.tables {
            let mut stmt = conn.prepare(&format!("PRAGMA table_info({});", table.name))?;
            let mut actual: Vec<String> = stmt
                .query_map(params![], |row| row.get::<_, String>(1))?
                .collect::<std::result::Result<_, _>>()?;
            let mut expected: Vec<&str> = table.columns.iter().map(|c| c.name).collect();
            // Migrated databases append columns via ALTER TABLE, so order
            // differs from a fresh creation. Compare as sets.
            actual.sort();
            expected.sort();
            if actual != expected {
                bail!(
                    "Table {} columns mismatch: found [{}], expected [{}]",
                    table.name,
                    actual.join(", "),
                    expected.join(", ")
                );
            }
        }
        for view in self.views {
            let exists: bool = conn
                .query_row(
                    "SELECT 1 FROM sqlite_master WHERE type='view' AND name=?1",
                    params![view.name],
                    |_| Ok(true),
                )
                .unwrap_or(false);
            if !exists {
                bail!("Missing view {}", view.name);
            }
        }
        Ok(())
    }
}

/// Drop every table, view and index so the latest schema can be recreated
/// in place. Used when a database is too old to migrate incrementally or
/// when a migration step fails.
pub fn drop_everything(conn: &Connection) -> Result<()> {
    conn.execute("PRAGMA foreign_keys = OFF;", params![])?;
    let objects: Vec<(String, String)> = {
        let mut stmt = conn.prepare(
            "SELECT type, name FROM sqlite_master \
             WHERE type IN ('table', 'view') AND name NOT LIKE 'sqlite_%'",
        )?;
        let rows = stmt.query_map([], |row| Ok((row.get(0)?, row.get(1)?)))?;
        rows.collect::<std::result::Result<_, _>>()?
    };
    // Views first so no table drop is blocked by a dependent view.
    for (object_type, name) in objects.iter().filter(|(t, _)| t == "view") {
        conn.execute(&format!("DROP {} IF EXISTS {};", object_type, name), [])?;
    }
    for (object_type, name) in objects.iter().filter(|(t, _)| t == "table") {
        conn.execute(&format!("DROP {} IF EXISTS {};", object_type, name), [])?;
    }
    conn.execute("PRAGMA user_version = 0;", params![])?;
    conn.execute("PRAGMA foreign_keys = ON;", params![])?;
    Ok(())
}
