use super::model::{ConflictRow, Lookups, ProductExportRow, ProductRow, PromotionCandidate};
use crate::model::{
    FailureKind, FailureSeverity, Job, JobKind, JobStatus, RowFailure, SourceId,
};
use anyhow::{anyhow, Context, Result};
use chrono::Utc;
use sqlx::{Row, SqlitePool};
use tracing::instrument;
use uuid::Uuid;

pub type Pool = SqlitePool;

pub async fn init_pool(database_url: &str) -> Result<Pool> {
    let normalized = prepare_sqlite_url(database_url);
    let pool = SqlitePool::connect(&normalized).await?;
    // Enable WAL and stricter durability.
    sqlx::query("PRAGMA journal_mode=WAL;")
        .execute(&pool)
        .await?;
    sqlx::query("PRAGMA synchronous=FULL;")
        .execute(&pool)
        .await?;
    Ok(pool)
}

/// If using a file-backed SQLite URL, expand a leading `~/` and ensure the
/// parent directory exists. Leaves in-memory URLs untouched.
fn prepare_sqlite_url(url: &str) -> String {
    if !url.starts_with("sqlite:") {
        return url.to_string();
    }
    if url.starts_with("sqlite::memory") {
        return url.to_string();
    }

    let rest = &url["sqlite:".len()..];
    let path_with_query = rest.strip_prefix("//").unwrap_or(rest);

    let (path_part, query_part) = match path_with_query.split_once('?') {
        Some((p, q)) => (p, Some(q)),
        None => (path_with_query, None),
    };

    if path_part.is_empty() {
        return url.to_string();
    }

    let expanded_path = if let Some(rest) = path_part.strip_prefix("~/") {
        if let Ok(home) = std::env::var("HOME") {
            format!("{}/{}", home.trim_end_matches('/'), rest)
        } else {
            path_part.to_string()
        }
    } else {
        path_part.to_string()
    };

    if let Some(parent) = std::path::Path::new(&expanded_path).parent() {
        if !parent.as_os_str().is_empty() {
            let _ = std::fs::create_dir_all(parent);
        }
    }

    let mut rebuilt = String::from("sqlite://");
    rebuilt.push_str(&expanded_path);
    if let Some(q) = query_part {
        rebuilt.push('?');
        rebuilt.push_str(q);
    }
    rebuilt
}

pub async fn run_migrations(pool: &Pool) -> Result<()> {
    sqlx::migrate!("./migrations").run(pool).await?;
    Ok(())
}

#[instrument(skip_all)]
pub async fn create_brand(pool: &Pool, name: &str) -> Result<i64> {
    let rec = sqlx::query("INSERT INTO brands (name) VALUES (?) RETURNING id")
        .bind(name)
        .fetch_one(pool)
        .await?;
    Ok(rec.get::<i64, _>("id"))
}

// ---------------------------------------------------------------------------
// Jobs
// ---------------------------------------------------------------------------

#[instrument(skip_all)]
pub async fn create_job(
    pool: &Pool,
    brand_id: i64,
    kind: JobKind,
    source_id: &SourceId,
) -> Result<Uuid> {
    let id = Uuid::new_v4();
    let now = Utc::now();
    sqlx::query(
        "INSERT INTO jobs (id, brand_id, kind, status, source_id, created_at, updated_at) \
         VALUES (?, ?, ?, ?, ?, ?, ?)",
    )
    .bind(id.to_string())
    .bind(brand_id)
    .bind(kind.as_str())
    .bind(JobStatus::Pending.as_str())
    .bind(source_id.encode())
    .bind(now)
    .bind(now)
    .execute(pool)
    .await?;
    Ok(id)
}

fn map_job(row: &sqlx::sqlite::SqliteRow) -> Result<Job> {
    let id_str: String = row.get("id");
    let kind_str: String = row.get("kind");
    let status_str: String = row.get("status");
    let source_str: String = row.get("source_id");
    Ok(Job {
        id: Uuid::parse_str(&id_str).context("malformed job id")?,
        brand_id: row.get("brand_id"),
        kind: JobKind::parse_kind(&kind_str)
            .ok_or_else(|| anyhow!("job {} has unknown kind {}", id_str, kind_str))?,
        status: JobStatus::parse_status(&status_str)
            .ok_or_else(|| anyhow!("job {} has unknown status {}", id_str, status_str))?,
        processed: row.get("processed"),
        total: row.get("total"),
        created: row.get("created_cnt"),
        updated: row.get("updated_cnt"),
        failed: row.get("failed_cnt"),
        message: row.get("message"),
        source_id: SourceId::parse_source(&source_str)
            .ok_or_else(|| anyhow!("job {} has unknown source {}", id_str, source_str))?,
        cancel_requested: row.get::<i64, _>("cancel_requested") != 0,
        created_at: row.get("created_at"),
        updated_at: row.get("updated_at"),
        archived_at: row.try_get("archived_at").ok(),
    })
}

#[instrument(skip_all)]
pub async fn fetch_job(pool: &Pool, job_id: Uuid) -> Result<Option<Job>> {
    let row = sqlx::query("SELECT * FROM jobs WHERE id = ?")
        .bind(job_id.to_string())
        .fetch_optional(pool)
        .await?;
    row.as_ref().map(map_job).transpose()
}

/// Brand-scoped fetch: a job belonging to a different brand is
/// indistinguishable from a missing one.
#[instrument(skip_all)]
pub async fn fetch_job_scoped(pool: &Pool, brand_id: i64, job_id: Uuid) -> Result<Option<Job>> {
    let row = sqlx::query("SELECT * FROM jobs WHERE id = ? AND brand_id = ?")
        .bind(job_id.to_string())
        .bind(brand_id)
        .fetch_optional(pool)
        .await?;
    row.as_ref().map(map_job).transpose()
}

/// Set status and message; stamps `archived_at` when entering a terminal
/// status. Terminal jobs are archived, never deleted.
#[instrument(skip_all)]
pub async fn set_job_status(
    pool: &Pool,
    job_id: Uuid,
    status: JobStatus,
    message: &str,
) -> Result<()> {
    let now = Utc::now();
    let archived_at = if status.is_terminal() { Some(now) } else { None };
    sqlx::query(
        "UPDATE jobs SET status = ?, message = ?, updated_at = ?, \
         archived_at = COALESCE(archived_at, ?) WHERE id = ?",
    )
    .bind(status.as_str())
    .bind(message)
    .bind(now)
    .bind(archived_at)
    .bind(job_id.to_string())
    .execute(pool)
    .await?;
    Ok(())
}

#[instrument(skip_all)]
pub async fn update_job_counters(
    pool: &Pool,
    job_id: Uuid,
    processed: i64,
    total: i64,
    created: i64,
    updated: i64,
    failed: i64,
) -> Result<()> {
    sqlx::query(
        "UPDATE jobs SET processed = ?, total = ?, created_cnt = ?, updated_cnt = ?, \
         failed_cnt = ?, updated_at = ? WHERE id = ?",
    )
    .bind(processed)
    .bind(total)
    .bind(created)
    .bind(updated)
    .bind(failed)
    .bind(Utc::now())
    .bind(job_id.to_string())
    .execute(pool)
    .await?;
    Ok(())
}

#[instrument(skip_all)]
pub async fn reset_job_counters(pool: &Pool, job_id: Uuid) -> Result<()> {
    sqlx::query(
        "UPDATE jobs SET processed = 0, created_cnt = 0, updated_cnt = 0, failed_cnt = 0, \
         updated_at = ? WHERE id = ?",
    )
    .bind(Utc::now())
    .bind(job_id.to_string())
    .execute(pool)
    .await?;
    Ok(())
}

/// Cooperative cancellation: sets the flag consulted between chunks.
/// Returns false if the job is already terminal (or missing).
#[instrument(skip_all)]
pub async fn request_cancel(pool: &Pool, job_id: Uuid) -> Result<bool> {
    let res = sqlx::query(
        "UPDATE jobs SET cancel_requested = 1, updated_at = ? \
         WHERE id = ? AND archived_at IS NULL",
    )
    .bind(Utc::now())
    .bind(job_id.to_string())
    .execute(pool)
    .await?;
    Ok(res.rows_affected() > 0)
}

#[instrument(skip_all)]
pub async fn cancel_requested(pool: &Pool, job_id: Uuid) -> Result<bool> {
    let flag: Option<i64> = sqlx::query_scalar("SELECT cancel_requested FROM jobs WHERE id = ?")
        .bind(job_id.to_string())
        .fetch_optional(pool)
        .await?;
    Ok(flag.unwrap_or(0) != 0)
}

#[instrument(skip_all)]
pub async fn append_failures(pool: &Pool, job_id: Uuid, failures: &[RowFailure]) -> Result<()> {
    if failures.is_empty() {
        return Ok(());
    }
    let mut tx = pool.begin().await?;
    for f in failures {
        sqlx::query(
            "INSERT INTO job_failures (job_id, row_index, column_name, kind, severity, message) \
             VALUES (?, ?, ?, ?, ?, ?)",
        )
        .bind(job_id.to_string())
        .bind(f.row_index)
        .bind(&f.column)
        .bind(f.kind.as_str())
        .bind(f.severity.as_str())
        .bind(&f.message)
        .execute(&mut *tx)
        .await?;
    }
    tx.commit().await?;
    Ok(())
}

#[instrument(skip_all)]
pub async fn clear_failures(pool: &Pool, job_id: Uuid) -> Result<()> {
    sqlx::query("DELETE FROM job_failures WHERE job_id = ?")
        .bind(job_id.to_string())
        .execute(pool)
        .await?;
    Ok(())
}

#[instrument(skip_all)]
pub async fn list_failures(pool: &Pool, job_id: Uuid) -> Result<Vec<RowFailure>> {
    let rows = sqlx::query(
        "SELECT row_index, column_name, kind, severity, message \
         FROM job_failures WHERE job_id = ? ORDER BY id ASC",
    )
    .bind(job_id.to_string())
    .fetch_all(pool)
    .await?;

    rows.into_iter()
        .map(|row| {
            let kind_str: String = row.get("kind");
            let severity_str: String = row.get("severity");
            Ok(RowFailure {
                row_index: row.get("row_index"),
                column: row.get("column_name"),
                kind: FailureKind::parse_kind(&kind_str)
                    .ok_or_else(|| anyhow!("unknown failure kind {}", kind_str))?,
                severity: FailureSeverity::parse_severity(&severity_str)
                    .ok_or_else(|| anyhow!("unknown failure severity {}", severity_str))?,
                message: row.get("message"),
            })
        })
        .collect()
}

/// Jobs a worker may pick up: non-archived, in a driveable status. The
/// orchestrator's in-memory running set keeps two workers off one job.
#[instrument(skip_all)]
pub async fn list_runnable_jobs(pool: &Pool) -> Result<Vec<Uuid>> {
    let rows = sqlx::query_scalar::<_, String>(
        "SELECT id FROM jobs \
         WHERE archived_at IS NULL AND status IN ('PENDING', 'VALIDATING', 'COMMITTING') \
         ORDER BY datetime(updated_at) ASC",
    )
    .fetch_all(pool)
    .await?;
    rows.into_iter()
        .map(|s| Uuid::parse_str(&s).context("malformed job id"))
        .collect()
}

#[instrument(skip_all)]
pub async fn list_jobs_for_brand(pool: &Pool, brand_id: i64, limit: i64) -> Result<Vec<Job>> {
    let rows = sqlx::query(
        "SELECT * FROM jobs WHERE brand_id = ? ORDER BY datetime(created_at) DESC LIMIT ?",
    )
    .bind(brand_id)
    .bind(limit)
    .fetch_all(pool)
    .await?;
    rows.iter().map(map_job).collect()
}

// ---------------------------------------------------------------------------
// Catalog: products and variants
// ---------------------------------------------------------------------------

fn map_product(row: &sqlx::sqlite::SqliteRow) -> Result<ProductRow> {
    let source_str: String = row.get("primary_source");
    Ok(ProductRow {
        id: row.get("id"),
        upid: row.get("upid"),
        name: row.get("name"),
        category: row.try_get("category").ok(),
        attrs: row.get("attrs"),
        primary_source: SourceId::parse_source(&source_str)
            .ok_or_else(|| anyhow!("product has unknown source {}", source_str))?,
        version: row.get("version"),
    })
}

#[instrument(skip_all)]
pub async fn find_product(pool: &Pool, brand_id: i64, upid: &str) -> Result<Option<ProductRow>> {
    let row = sqlx::query(
        "SELECT id, upid, name, category, attrs, primary_source, version \
         FROM products WHERE brand_id = ? AND upid = ?",
    )
    .bind(brand_id)
    .bind(upid)
    .fetch_optional(pool)
    .await?;
    row.as_ref().map(map_product).transpose()
}

#[instrument(skip_all)]
pub async fn insert_product(
    pool: &Pool,
    brand_id: i64,
    upid: &str,
    name: &str,
    category: Option<&str>,
    attrs_json: &str,
    primary_source: &SourceId,
) -> Result<i64> {
    let now = Utc::now();
    let rec = sqlx::query(
        "INSERT INTO products (brand_id, upid, name, category, attrs, primary_source, created_at, updated_at) \
         VALUES (?, ?, ?, ?, ?, ?, ?, ?) RETURNING id",
    )
    .bind(brand_id)
    .bind(upid)
    .bind(name)
    .bind(category)
    .bind(attrs_json)
    .bind(primary_source.encode())
    .bind(now)
    .bind(now)
    .fetch_one(pool)
    .await?;
    Ok(rec.get::<i64, _>("id"))
}

/// Optimistic update of the permitted product fields. Only `Some` fields
/// are written. Returns false when the version stamp no longer matches
/// (a concurrent writer got there first).
#[instrument(skip_all)]
pub async fn apply_product_update(
    pool: &Pool,
    product_id: i64,
    expected_version: i64,
    name: Option<&str>,
    category: Option<&str>,
    attrs_json: Option<&str>,
) -> Result<bool> {
    let res = sqlx::query(
        "UPDATE products SET \
         name = COALESCE(?, name), \
         category = COALESCE(?, category), \
         attrs = COALESCE(?, attrs), \
         version = version + 1, updated_at = ? \
         WHERE id = ? AND version = ?",
    )
    .bind(name)
    .bind(category)
    .bind(attrs_json)
    .bind(Utc::now())
    .bind(product_id)
    .bind(expected_version)
    .execute(pool)
    .await?;
    Ok(res.rows_affected() > 0)
}

/// Create-or-update a variant keyed by (brand, sku). An existing variant
/// keeps its current parent product; regrouping is promotion's job.
/// Returns (variant id, created).
#[instrument(skip_all)]
pub async fn upsert_variant(
    pool: &Pool,
    brand_id: i64,
    product_id: i64,
    sku: &str,
    color: Option<&str>,
    size: Option<&str>,
) -> Result<(i64, bool)> {
    let existing =
        sqlx::query_scalar::<_, i64>("SELECT id FROM variants WHERE brand_id = ? AND sku = ?")
            .bind(brand_id)
            .bind(sku)
            .fetch_optional(pool)
            .await?;
    if let Some(id) = existing {
        sqlx::query(
            "UPDATE variants SET color = COALESCE(?, color), size = COALESCE(?, size), \
             version = version + 1 WHERE id = ?",
        )
        .bind(color)
        .bind(size)
        .bind(id)
        .execute(pool)
        .await?;
        return Ok((id, false));
    }
    let rec = sqlx::query(
        "INSERT INTO variants (brand_id, product_id, sku, color, size) \
         VALUES (?, ?, ?, ?, ?) RETURNING id",
    )
    .bind(brand_id)
    .bind(product_id)
    .bind(sku)
    .bind(color)
    .bind(size)
    .fetch_one(pool)
    .await?;
    Ok((rec.get::<i64, _>("id"), true))
}

/// Record which external product a variant belongs to according to a
/// given source. Promotion re-parents variants from this evidence.
#[instrument(skip_all)]
pub async fn set_variant_source_key(
    pool: &Pool,
    variant_id: i64,
    source_id: &SourceId,
    external_product_key: &str,
) -> Result<()> {
    sqlx::query(
        "INSERT INTO variant_source_keys (variant_id, source_id, external_product_key) \
         VALUES (?, ?, ?) \
         ON CONFLICT (variant_id, source_id) DO UPDATE SET external_product_key = excluded.external_product_key",
    )
    .bind(variant_id)
    .bind(source_id.encode())
    .bind(external_product_key)
    .execute(pool)
    .await?;
    Ok(())
}

#[instrument(skip_all)]
pub async fn count_products(pool: &Pool, brand_id: i64) -> Result<i64> {
    let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM products WHERE brand_id = ?")
        .bind(brand_id)
        .fetch_one(pool)
        .await?;
    Ok(count)
}

#[instrument(skip_all)]
pub async fn list_products_page(
    pool: &Pool,
    brand_id: i64,
    offset: i64,
    limit: i64,
) -> Result<Vec<ProductExportRow>> {
    let rows = sqlx::query(
        "SELECT upid, name, category, attrs, primary_source FROM products \
         WHERE brand_id = ? ORDER BY id ASC LIMIT ? OFFSET ?",
    )
    .bind(brand_id)
    .bind(limit)
    .bind(offset)
    .fetch_all(pool)
    .await?;
    rows.into_iter()
        .map(|row| {
            let source_str: String = row.get("primary_source");
            Ok(ProductExportRow {
                upid: row.get("upid"),
                name: row.get("name"),
                category: row.try_get("category").ok(),
                attrs: row.get("attrs"),
                primary_source: SourceId::parse_source(&source_str)
                    .ok_or_else(|| anyhow!("product has unknown source {}", source_str))?,
            })
        })
        .collect()
}

// ---------------------------------------------------------------------------
// Field ownership
// ---------------------------------------------------------------------------

/// First step of a claim: take ownership of an unclaimed field. Returns
/// true when this source became the owner.
#[instrument(skip_all)]
pub async fn try_insert_owner(
    pool: &Pool,
    brand_id: i64,
    entity_type: &str,
    entity_id: i64,
    field_name: &str,
    source: &SourceId,
) -> Result<bool> {
    let res = sqlx::query(
        "INSERT INTO field_ownership (brand_id, entity_type, entity_id, field_name, owner, updated_at) \
         VALUES (?, ?, ?, ?, ?, ?) \
         ON CONFLICT (brand_id, entity_type, entity_id, field_name) DO NOTHING",
    )
    .bind(brand_id)
    .bind(entity_type)
    .bind(entity_id)
    .bind(field_name)
    .bind(source.encode())
    .bind(Utc::now())
    .execute(pool)
    .await?;
    Ok(res.rows_affected() > 0)
}

/// Second step: refresh an existing claim held by the same source.
#[instrument(skip_all)]
pub async fn try_refresh_owner(
    pool: &Pool,
    brand_id: i64,
    entity_type: &str,
    entity_id: i64,
    field_name: &str,
    source: &SourceId,
) -> Result<bool> {
    let res = sqlx::query(
        "UPDATE field_ownership SET updated_at = ? \
         WHERE brand_id = ? AND entity_type = ? AND entity_id = ? AND field_name = ? AND owner = ?",
    )
    .bind(Utc::now())
    .bind(brand_id)
    .bind(entity_type)
    .bind(entity_id)
    .bind(field_name)
    .bind(source.encode())
    .execute(pool)
    .await?;
    Ok(res.rows_affected() > 0)
}

/// Last step: a different source holds the field. Record the conflict
/// without touching owner or value, and report the current owner.
#[instrument(skip_all)]
pub async fn flag_conflict(
    pool: &Pool,
    brand_id: i64,
    entity_type: &str,
    entity_id: i64,
    field_name: &str,
    attempted: &SourceId,
) -> Result<SourceId> {
    sqlx::query(
        "UPDATE field_ownership SET conflict = 1, conflict_source = ?, updated_at = ? \
         WHERE brand_id = ? AND entity_type = ? AND entity_id = ? AND field_name = ? AND owner != ?",
    )
    .bind(attempted.encode())
    .bind(Utc::now())
    .bind(brand_id)
    .bind(entity_type)
    .bind(entity_id)
    .bind(field_name)
    .bind(attempted.encode())
    .execute(pool)
    .await?;

    let owner: String = sqlx::query_scalar(
        "SELECT owner FROM field_ownership \
         WHERE brand_id = ? AND entity_type = ? AND entity_id = ? AND field_name = ?",
    )
    .bind(brand_id)
    .bind(entity_type)
    .bind(entity_id)
    .bind(field_name)
    .fetch_one(pool)
    .await?;
    SourceId::parse_source(&owner).ok_or_else(|| anyhow!("unknown owner {}", owner))
}

#[instrument(skip_all)]
pub async fn set_field_owner(
    pool: &Pool,
    brand_id: i64,
    entity_type: &str,
    entity_id: i64,
    field_name: &str,
    owner: &SourceId,
) -> Result<bool> {
    let res = sqlx::query(
        "UPDATE field_ownership SET owner = ?, conflict = 0, conflict_source = NULL, updated_at = ? \
         WHERE brand_id = ? AND entity_type = ? AND entity_id = ? AND field_name = ?",
    )
    .bind(owner.encode())
    .bind(Utc::now())
    .bind(brand_id)
    .bind(entity_type)
    .bind(entity_id)
    .bind(field_name)
    .execute(pool)
    .await?;
    Ok(res.rows_affected() > 0)
}

#[instrument(skip_all)]
pub async fn list_conflicts(pool: &Pool, brand_id: i64) -> Result<Vec<ConflictRow>> {
    let rows = sqlx::query(
        "SELECT entity_type, entity_id, field_name, owner, conflict_source \
         FROM field_ownership WHERE brand_id = ? AND conflict = 1 \
         ORDER BY entity_type, entity_id, field_name",
    )
    .bind(brand_id)
    .fetch_all(pool)
    .await?;
    rows.into_iter()
        .map(|row| {
            let owner_str: String = row.get("owner");
            let conflict_str: Option<String> = row.try_get("conflict_source").ok();
            Ok(ConflictRow {
                entity_type: row.get("entity_type"),
                entity_id: row.get("entity_id"),
                field_name: row.get("field_name"),
                owner: SourceId::parse_source(&owner_str)
                    .ok_or_else(|| anyhow!("unknown owner {}", owner_str))?,
                conflict_source: conflict_str.and_then(|s| SourceId::parse_source(&s)),
            })
        })
        .collect()
}

/// Ownership rows live as long as the entity does.
#[instrument(skip_all)]
pub async fn release_entity(
    pool: &Pool,
    brand_id: i64,
    entity_type: &str,
    entity_id: i64,
) -> Result<()> {
    sqlx::query(
        "DELETE FROM field_ownership WHERE brand_id = ? AND entity_type = ? AND entity_id = ?",
    )
    .bind(brand_id)
    .bind(entity_type)
    .bind(entity_id)
    .execute(pool)
    .await?;
    Ok(())
}

// ---------------------------------------------------------------------------
// Promotion
// ---------------------------------------------------------------------------

/// Products the promotion loop still has to touch: primary source differs,
/// or some field (on the product or its variants) is owned by another
/// integration. Manual ownership never qualifies.
#[instrument(skip_all)]
pub async fn products_needing_promotion(
    pool: &Pool,
    brand_id: i64,
    new_primary: &SourceId,
) -> Result<Vec<PromotionCandidate>> {
    let encoded = new_primary.encode();
    let rows = sqlx::query(
        "SELECT p.id, p.upid FROM products p WHERE p.brand_id = ? AND ( \
             p.primary_source != ? \
             OR EXISTS ( \
                 SELECT 1 FROM field_ownership fo WHERE fo.brand_id = p.brand_id \
                 AND fo.owner LIKE 'integration:%' AND fo.owner != ? \
                 AND ((fo.entity_type = 'product' AND fo.entity_id = p.id) \
                      OR (fo.entity_type = 'variant' AND fo.entity_id IN \
                          (SELECT v.id FROM variants v WHERE v.product_id = p.id))) \
             ) \
         ) ORDER BY p.id ASC",
    )
    .bind(brand_id)
    .bind(&encoded)
    .bind(&encoded)
    .fetch_all(pool)
    .await?;
    Ok(rows
        .into_iter()
        .map(|row| PromotionCandidate {
            product_id: row.get("id"),
            upid: row.get("upid"),
        })
        .collect())
}

/// Reassign every integration-owned field on a product (and its variants)
/// to the new primary, clearing any conflicts those rows carried. Fields
/// owned manually stay untouched. Returns reassigned row count.
#[instrument(skip_all)]
pub async fn reassign_integration_ownership(
    pool: &Pool,
    brand_id: i64,
    product_id: i64,
    new_primary: &SourceId,
) -> Result<u64> {
    let encoded = new_primary.encode();
    let res = sqlx::query(
        "UPDATE field_ownership SET owner = ?, conflict = 0, conflict_source = NULL, updated_at = ? \
         WHERE brand_id = ? AND owner LIKE 'integration:%' AND owner != ? \
         AND ((entity_type = 'product' AND entity_id = ?) \
              OR (entity_type = 'variant' AND entity_id IN \
                  (SELECT id FROM variants WHERE product_id = ?)))",
    )
    .bind(&encoded)
    .bind(Utc::now())
    .bind(brand_id)
    .bind(&encoded)
    .bind(product_id)
    .bind(product_id)
    .execute(pool)
    .await?;
    Ok(res.rows_affected())
}

/// Re-parent variants that, according to the new primary's grouping
/// evidence, belong to this product. Returns regrouped variant count.
#[instrument(skip_all)]
pub async fn reparent_variants_by_source_key(
    pool: &Pool,
    brand_id: i64,
    product_id: i64,
    upid: &str,
    new_primary: &SourceId,
) -> Result<u64> {
    let res = sqlx::query(
        "UPDATE variants SET product_id = ?, version = version + 1 \
         WHERE brand_id = ? AND product_id != ? AND id IN ( \
             SELECT variant_id FROM variant_source_keys \
             WHERE source_id = ? AND external_product_key = ?)",
    )
    .bind(product_id)
    .bind(brand_id)
    .bind(product_id)
    .bind(new_primary.encode())
    .bind(upid)
    .execute(pool)
    .await?;
    Ok(res.rows_affected())
}

#[instrument(skip_all)]
pub async fn set_product_primary_source(
    pool: &Pool,
    product_id: i64,
    new_primary: &SourceId,
) -> Result<bool> {
    let res = sqlx::query(
        "UPDATE products SET primary_source = ?, version = version + 1, updated_at = ? \
         WHERE id = ? AND primary_source != ?",
    )
    .bind(new_primary.encode())
    .bind(Utc::now())
    .bind(product_id)
    .bind(new_primary.encode())
    .execute(pool)
    .await?;
    Ok(res.rows_affected() > 0)
}

// ---------------------------------------------------------------------------
// Reference lookups
// ---------------------------------------------------------------------------

#[instrument(skip_all)]
pub async fn load_lookups(pool: &Pool, brand_id: i64) -> Result<Lookups> {
    let mut lookups = Lookups::default();
    for (table, set) in [
        ("catalog_colors", &mut lookups.colors),
        ("catalog_sizes", &mut lookups.sizes),
        ("catalog_categories", &mut lookups.categories),
    ] {
        let names = sqlx::query_scalar::<_, String>(&format!(
            "SELECT name FROM {} WHERE brand_id = ?",
            table
        ))
        .bind(brand_id)
        .fetch_all(pool)
        .await?;
        set.extend(names);
    }
    Ok(lookups)
}

#[instrument(skip_all)]
pub async fn add_lookup(pool: &Pool, brand_id: i64, table: LookupTable, name: &str) -> Result<()> {
    sqlx::query(&format!(
        "INSERT OR IGNORE INTO {} (brand_id, name) VALUES (?, ?)",
        table.table_name()
    ))
    .bind(brand_id)
    .bind(name)
    .execute(pool)
    .await?;
    Ok(())
}

#[derive(Debug, Clone, Copy)]
pub enum LookupTable {
    Colors,
    Sizes,
    Categories,
}

impl LookupTable {
    fn table_name(&self) -> &'static str {
        match self {
            LookupTable::Colors => "catalog_colors",
            LookupTable::Sizes => "catalog_sizes",
            LookupTable::Categories => "catalog_categories",
        }
    }
}
