//! Structural probes against the live catalog.
//!
//! There is no stored schema version; every migration step decides whether
//! it still has work to do by asking these. All probes are scoped to
//! `current_schema()`.

use postgres::GenericClient;

use crate::Result;

/// `relkind` of the named relation (`r` table, `p` partitioned, `v` view, ...).
pub fn relation_kind(c: &mut impl GenericClient, name: &str) -> Result<Option<String>> {
  let row = c.query_opt(
    "SELECT c.relkind::text
       FROM pg_catalog.pg_class c
       JOIN pg_catalog.pg_namespace n ON n.oid = c.relnamespace
      WHERE n.nspname = current_schema()
        AND c.relname = $1::text",
    &[&name],
  )?;
  Ok(row.map(|r| r.get(0)))
}

pub fn table_exists(c: &mut impl GenericClient, name: &str) -> Result<bool> {
  Ok(matches!(relation_kind(c, name)?.as_deref(), Some("r" | "p")))
}

pub fn view_exists(c: &mut impl GenericClient, name: &str) -> Result<bool> {
  Ok(relation_kind(c, name)?.as_deref() == Some("v"))
}

/// Underlying type name of a column (`text`, `jsonb`, `geometry`, ...), or
/// `None` if the column does not exist.
pub fn column_type(c: &mut impl GenericClient, table: &str, column: &str) -> Result<Option<String>> {
  let row = c.query_opt(
    "SELECT udt_name::text
       FROM information_schema.columns
      WHERE table_schema = current_schema()
        AND table_name = $1::text
        AND column_name = $2::text",
    &[&table, &column],
  )?;
  Ok(row.map(|r| r.get(0)))
}

pub fn index_exists(c: &mut impl GenericClient, name: &str) -> Result<bool> {
  let row = c.query_one(
    "SELECT EXISTS (
       SELECT 1 FROM pg_catalog.pg_indexes
        WHERE schemaname = current_schema() AND indexname = $1::text)",
    &[&name],
  )?;
  Ok(row.get(0))
}

/// Body of the named argument-less function as stored in `pg_proc.prosrc`.
pub fn function_source(c: &mut impl GenericClient, name: &str) -> Result<Option<String>> {
  let row = c.query_opt(
    "SELECT p.prosrc
       FROM pg_catalog.pg_proc p
       JOIN pg_catalog.pg_namespace n ON n.oid = p.pronamespace
      WHERE n.nspname = current_schema() AND p.proname = $1::text AND p.pronargs = 0",
    &[&name],
  )?;
  Ok(row.map(|r| r.get(0)))
}

pub fn trigger_exists(c: &mut impl GenericClient, table: &str, name: &str) -> Result<bool> {
  let row = c.query_one(
    "SELECT EXISTS (
       SELECT 1 FROM pg_catalog.pg_trigger
        WHERE tgname = $1::text AND tgrelid = to_regclass($2::text)::oid)",
    &[&name, &table],
  )?;
  Ok(row.get(0))
}

/// Only meaningful when the `timescaledb` extension is installed.
pub fn is_hypertable(c: &mut impl GenericClient, table: &str) -> Result<bool> {
  let row = c.query_one(
    "SELECT EXISTS (
       SELECT 1 FROM _timescaledb_catalog.hypertable
        WHERE schema_name = current_schema() AND table_name = $1::text)",
    &[&table],
  )?;
  Ok(row.get(0))
}

pub fn has_rows(c: &mut impl GenericClient, table: &str) -> Result<bool> {
  let row = c.query_one(&format!("SELECT EXISTS (SELECT 1 FROM {table})"), &[])?;
  Ok(row.get(0))
}

/// Quoted name of the table's primary key constraint.
pub fn primary_key_name(c: &mut impl GenericClient, table: &str) -> Result<Option<String>> {
  let row = c.query_opt(
    "SELECT quote_ident(conname::text)
       FROM pg_catalog.pg_constraint
      WHERE conrelid = to_regclass($1::text)::oid AND contype = 'p'",
    &[&table],
  )?;
  Ok(row.map(|r| r.get(0)))
}

/// Whether a unique index (a primary key counts) is keyed on `column` alone,
/// so that `ON CONFLICT (column)` can use it.
pub fn unique_index_on(c: &mut impl GenericClient, table: &str, column: &str) -> Result<bool> {
  let row = c.query_one(
    "SELECT EXISTS (
       SELECT 1
         FROM pg_catalog.pg_index x
         JOIN pg_catalog.pg_class t ON t.oid = x.indrelid
         JOIN pg_catalog.pg_namespace n ON n.oid = t.relnamespace
         JOIN pg_catalog.pg_attribute a ON a.attrelid = t.oid AND a.attnum = x.indkey[0]
        WHERE n.nspname = current_schema()
          AND t.relname = $1::text
          AND a.attname = $2::text
          AND x.indnatts = 1
          AND x.indexprs IS NULL
          AND x.indpred IS NULL
          AND x.indisunique)",
    &[&table, &column],
  )?;
  Ok(row.get(0))
}

/// Quoted names of the table's `EXCLUDE` constraints.
pub fn exclusion_constraints(c: &mut impl GenericClient, table: &str) -> Result<Vec<String>> {
  let rows = c.query(
    "SELECT quote_ident(conname::text)
       FROM pg_catalog.pg_constraint
      WHERE conrelid = to_regclass($1::text)::oid AND contype = 'x'
      ORDER BY 1",
    &[&table],
  )?;
  Ok(rows.iter().map(|r| r.get(0)).collect())
}

/// Nullability and default expression of a column, or `None` if the column
/// does not exist.
pub fn column_constraints(
  c: &mut impl GenericClient,
  table: &str,
  column: &str,
) -> Result<Option<(bool, Option<String>)>> {
  let row = c.query_opt(
    "SELECT is_nullable = 'YES', column_default::text
       FROM information_schema.columns
      WHERE table_schema = current_schema()
        AND table_name = $1::text
        AND column_name = $2::text",
    &[&table, &column],
  )?;
  Ok(row.map(|r| (r.get(0), r.get(1))))
}

/// Quoted names of plain, non-unique indexes covering `column` alone.
pub fn single_column_indexes(c: &mut impl GenericClient, table: &str, column: &str) -> Result<Vec<String>> {
  let rows = c.query(
    "SELECT quote_ident(i.relname::text)
       FROM pg_catalog.pg_index x
       JOIN pg_catalog.pg_class i ON i.oid = x.indexrelid
       JOIN pg_catalog.pg_class t ON t.oid = x.indrelid
       JOIN pg_catalog.pg_namespace n ON n.oid = t.relnamespace
       JOIN pg_catalog.pg_attribute a ON a.attrelid = t.oid AND a.attnum = x.indkey[0]
      WHERE n.nspname = current_schema()
        AND t.relname = $1::text
        AND a.attname = $2::text
        AND x.indnatts = 1
        AND x.indexprs IS NULL
        AND NOT x.indisunique
        AND NOT x.indisprimary
      ORDER BY 1",
    &[&table, &column],
  )?;
  Ok(rows.iter().map(|r| r.get(0)).collect())
}

/// Installed version (if any) of each named extension the server offers.
pub fn available_extensions(c: &mut impl GenericClient) -> Result<Vec<(String, Option<String>)>> {
  let rows = c.query(
    "SELECT name::text, installed_version::text
       FROM pg_catalog.pg_available_extensions
      WHERE name IN ('ltree', 'timescaledb', 'postgis')",
    &[],
  )?;
  Ok(rows.iter().map(|r| (r.get(0), r.get(1))).collect())
}
