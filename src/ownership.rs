//! Field-ownership reconciliation.
//!
//! Per (brand, entity, field) exactly one source is authoritative at a
//! time. A write attempt from a different source never displaces the
//! owner or its value — it flags a conflict that stays queryable until a
//! human resolves it. Promotion bulk-reassigns integration ownership to a
//! new primary source, one entity at a time.

use crate::db::{self, Pool, PromotionCandidate};
use crate::model::SourceId;
use anyhow::Result;
use tracing::{debug, info, instrument};

pub const ENTITY_PRODUCT: &str = "product";
pub const ENTITY_VARIANT: &str = "variant";

/// Outcome of a field claim.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClaimOutcome {
    /// The acting source owns the field (fresh claim or refresh); the
    /// write may proceed.
    Granted,
    /// A different source owns the field. The write must be skipped; the
    /// conflict has been recorded.
    Conflict { current_owner: SourceId },
}

/// Decide whether `source` may write `field_name` on an entity.
///
/// Runs as a short compare-and-swap ladder so concurrent claims on the
/// same (entity, field) serialize: insert-if-absent, refresh-if-owner,
/// otherwise flag the conflict and report the standing owner. Each rung
/// is a single atomic statement.
#[instrument(skip(pool))]
pub async fn claim_field(
    pool: &Pool,
    brand_id: i64,
    entity_type: &str,
    entity_id: i64,
    field_name: &str,
    source: &SourceId,
) -> Result<ClaimOutcome> {
    if db::try_insert_owner(pool, brand_id, entity_type, entity_id, field_name, source).await? {
        return Ok(ClaimOutcome::Granted);
    }
    if db::try_refresh_owner(pool, brand_id, entity_type, entity_id, field_name, source).await? {
        return Ok(ClaimOutcome::Granted);
    }
    let current_owner =
        db::flag_conflict(pool, brand_id, entity_type, entity_id, field_name, source).await?;
    debug!(field = field_name, owner = %current_owner.encode(), "claim held back by conflict");
    Ok(ClaimOutcome::Conflict { current_owner })
}

/// Explicit, human-triggered resolution: the chosen source becomes the
/// owner and the conflict flag clears. The skipped value is not replayed;
/// the next sync cycle from the chosen source supplies it.
#[instrument(skip(pool))]
pub async fn resolve_conflict(
    pool: &Pool,
    brand_id: i64,
    entity_type: &str,
    entity_id: i64,
    field_name: &str,
    chosen: &SourceId,
) -> Result<bool> {
    db::set_field_owner(pool, brand_id, entity_type, entity_id, field_name, chosen).await
}

/// Promotion work plan: every product not yet matching the new primary's
/// structure. Re-running promotion on a fully promoted brand yields an
/// empty plan.
pub async fn promotion_plan(
    pool: &Pool,
    brand_id: i64,
    new_primary: &SourceId,
) -> Result<Vec<PromotionCandidate>> {
    db::products_needing_promotion(pool, brand_id, new_primary).await
}

/// Promote one product: re-parent variants according to the new primary's
/// grouping evidence, hand integration-owned fields to the new primary
/// (manual fields stay untouched), and stamp the new primary source.
/// Idempotent — promoting an already-promoted product changes nothing.
#[instrument(skip(pool, candidate))]
pub async fn promote_product(
    pool: &Pool,
    brand_id: i64,
    candidate: &PromotionCandidate,
    new_primary: &SourceId,
) -> Result<bool> {
    let regrouped = db::reparent_variants_by_source_key(
        pool,
        brand_id,
        candidate.product_id,
        &candidate.upid,
        new_primary,
    )
    .await?;
    let reassigned =
        db::reassign_integration_ownership(pool, brand_id, candidate.product_id, new_primary)
            .await?;
    let switched = db::set_product_primary_source(pool, candidate.product_id, new_primary).await?;

    let changed = regrouped > 0 || reassigned > 0 || switched;
    if changed {
        info!(
            product = candidate.product_id,
            regrouped, reassigned, "promoted product"
        );
    }
    Ok(changed)
}
