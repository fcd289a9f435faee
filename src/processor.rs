//! Per-row validation and commit.
//!
//! Validation is side-effect free and runs against the brand's catalog
//! lookups. Commit re-runs the same checks — catalog data may have moved
//! since the validation pass — and then applies a create-or-update, asking
//! the ownership reconciler about every written field. A field held by a
//! different source is skipped and noted; the rest of the row commits.

use crate::db::{self, Lookups, Pool, ProductExportRow};
use crate::model::{
    AttrValue, FailureKind, RawRow, RowFailure, RowOutcome, RowReport, SourceId,
};
use crate::ownership::{self, ClaimOutcome, ENTITY_PRODUCT, ENTITY_VARIANT};
use anyhow::{anyhow, Result};
use regex::Regex;
use std::collections::BTreeMap;
use std::sync::OnceLock;

pub const COL_UPID: &str = "upid";
pub const COL_SKU: &str = "sku";
pub const COL_NAME: &str = "product_name";
pub const COL_CATEGORY: &str = "category";
pub const COL_COLOR: &str = "color";
pub const COL_SIZE: &str = "size";
pub const COL_PRICE: &str = "price";
pub const COL_GROUP_KEY: &str = "external_product_key";

const KNOWN_COLUMNS: &[&str] = &[
    COL_UPID,
    COL_SKU,
    COL_NAME,
    COL_CATEGORY,
    COL_COLOR,
    COL_SIZE,
    COL_PRICE,
    COL_GROUP_KEY,
];

const MAX_NAME_LEN: usize = 200;
const MAX_ATTR_LEN: usize = 2000;
const PRODUCT_UPDATE_ATTEMPTS: u32 = 3;

fn key_pattern() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^[A-Za-z0-9][A-Za-z0-9_-]{0,63}$").expect("valid key pattern"))
}

fn field(row: &RawRow, name: &str) -> Option<String> {
    row.get(name)
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

/// The key that decides create-vs-update within a brand: `upid` when
/// present, `sku` otherwise. Rows with neither are invalid.
pub fn identifying_key(row: &RawRow) -> Option<String> {
    field(row, COL_UPID).or_else(|| field(row, COL_SKU))
}

/// Structural check on the first fetched rows: a source whose records
/// carry none of the identifying columns is malformed as a whole (wrong
/// header set), not a collection of row-level failures.
pub fn check_structure(rows: &[RawRow]) -> std::result::Result<(), String> {
    let Some(first) = rows.first() else {
        return Err("source yielded no rows".to_string());
    };
    let recognized = first.keys().any(|k| KNOWN_COLUMNS.contains(&k.as_str()));
    if !recognized {
        return Err(format!(
            "unrecognized header set: {}",
            first.keys().cloned().collect::<Vec<_>>().join(", ")
        ));
    }
    Ok(())
}

/// Schema-level validation of one row. No side effects.
pub fn validate_row(row: &RawRow, lookups: &Lookups, row_index: i64) -> RowReport {
    let mut failures = Vec::new();

    if field(row, COL_NAME).is_none() {
        failures.push(RowFailure::new(
            row_index,
            COL_NAME,
            FailureKind::MissingField,
            "product_name is required",
        ));
    } else if field(row, COL_NAME).map(|n| n.chars().count()).unwrap_or(0) > MAX_NAME_LEN {
        failures.push(RowFailure::new(
            row_index,
            COL_NAME,
            FailureKind::InvalidValue,
            format!("product_name exceeds {} characters", MAX_NAME_LEN),
        ));
    }

    match identifying_key(row) {
        None => failures.push(RowFailure::new(
            row_index,
            COL_UPID,
            FailureKind::MissingField,
            "either upid or sku is required",
        )),
        Some(key) => {
            if !key_pattern().is_match(&key) {
                failures.push(RowFailure::new(
                    row_index,
                    COL_UPID,
                    FailureKind::InvalidValue,
                    format!("malformed identifying key '{}'", key),
                ));
            }
        }
    }

    if let Some(sku) = field(row, COL_SKU) {
        if !key_pattern().is_match(&sku) {
            failures.push(RowFailure::new(
                row_index,
                COL_SKU,
                FailureKind::InvalidValue,
                format!("malformed sku '{}'", sku),
            ));
        }
    }

    // variant attributes only make sense on a variant row
    if field(row, COL_SKU).is_none()
        && (field(row, COL_COLOR).is_some() || field(row, COL_SIZE).is_some())
    {
        failures.push(RowFailure::new(
            row_index,
            COL_SKU,
            FailureKind::InvalidValue,
            "color/size require a sku",
        ));
    }

    if let Some(price) = field(row, COL_PRICE) {
        match price.parse::<f64>() {
            Ok(p) if p >= 0.0 => {}
            _ => failures.push(RowFailure::new(
                row_index,
                COL_PRICE,
                FailureKind::InvalidValue,
                format!("price '{}' is not a non-negative number", price),
            )),
        }
    }

    for (column, set) in [
        (COL_CATEGORY, &lookups.categories),
        (COL_COLOR, &lookups.colors),
        (COL_SIZE, &lookups.sizes),
    ] {
        if let Some(value) = field(row, column) {
            if !set.contains(&value) {
                failures.push(RowFailure::new(
                    row_index,
                    column,
                    FailureKind::UnknownReference,
                    format!("'{}' is not a known {}", value, column),
                ));
            }
        }
    }

    for (key, value) in row {
        if !KNOWN_COLUMNS.contains(&key.as_str()) && value.chars().count() > MAX_ATTR_LEN {
            failures.push(RowFailure::new(
                row_index,
                key,
                FailureKind::InvalidValue,
                format!("value exceeds {} characters", MAX_ATTR_LEN),
            ));
        }
    }

    let outcome = if failures.iter().any(|f| f.severity == crate::model::FailureSeverity::Error) {
        RowOutcome::Failed
    } else {
        RowOutcome::Skipped
    };
    RowReport {
        row_index,
        outcome,
        failures,
    }
}

/// Columns that are not part of the fixed schema become typed opaque
/// attributes. Value kinds are inferred at this boundary; anything that is
/// neither a flag nor a number stays text.
fn normalize_attrs(row: &RawRow) -> BTreeMap<String, AttrValue> {
    let mut attrs = BTreeMap::new();
    for (key, value) in row {
        if KNOWN_COLUMNS.contains(&key.as_str()) {
            continue;
        }
        let trimmed = value.trim();
        if trimmed.is_empty() {
            continue;
        }
        let typed = match trimmed {
            "true" => AttrValue::Flag(true),
            "false" => AttrValue::Flag(false),
            other => match other.parse::<f64>() {
                Ok(n) => AttrValue::Number(n),
                Err(_) => AttrValue::Text(other.to_string()),
            },
        };
        attrs.insert(key.clone(), typed);
    }
    // price is typed but part of the attribute bag, not a first-class column
    if let Some(price) = field(row, COL_PRICE) {
        if let Ok(p) = price.parse::<f64>() {
            attrs.insert(COL_PRICE.to_string(), AttrValue::Number(p));
        }
    }
    attrs
}

/// Validate and, if clean, apply one row against the catalog. Fields whose
/// ownership claim is refused are skipped individually and noted on the
/// report; the rest of the row still commits.
pub async fn commit_row(
    pool: &Pool,
    brand_id: i64,
    row: &RawRow,
    lookups: &Lookups,
    acting_source: &SourceId,
    row_index: i64,
) -> Result<RowReport> {
    let mut report = validate_row(row, lookups, row_index);
    if report.outcome == RowOutcome::Failed {
        return Ok(report);
    }

    let key = identifying_key(row).expect("validated row has a key");
    let name = field(row, COL_NAME).expect("validated row has a name");
    let category = field(row, COL_CATEGORY);
    let attrs = normalize_attrs(row);

    let existing = db::find_product(pool, brand_id, &key).await?;
    let (product_id, created) = match existing {
        None => {
            let attrs_json = serde_json::to_string(&attrs)?;
            let id = db::insert_product(
                pool,
                brand_id,
                &key,
                &name,
                category.as_deref(),
                &attrs_json,
                acting_source,
            )
            .await?;
            // fresh entity: register ownership for everything we wrote
            ownership::claim_field(pool, brand_id, ENTITY_PRODUCT, id, "name", acting_source)
                .await?;
            if category.is_some() {
                ownership::claim_field(pool, brand_id, ENTITY_PRODUCT, id, "category", acting_source)
                    .await?;
            }
            for attr_key in attrs.keys() {
                ownership::claim_field(pool, brand_id, ENTITY_PRODUCT, id, attr_key, acting_source)
                    .await?;
            }
            (id, true)
        }
        Some(product) => {
            let id = product.id;
            let mut granted_name = None;
            let mut granted_category = None;
            let mut granted_attrs: BTreeMap<String, AttrValue> = BTreeMap::new();

            match ownership::claim_field(pool, brand_id, ENTITY_PRODUCT, id, "name", acting_source)
                .await?
            {
                ClaimOutcome::Granted => granted_name = Some(name.clone()),
                ClaimOutcome::Conflict { current_owner } => {
                    report.failures.push(RowFailure::new(
                        row_index,
                        COL_NAME,
                        FailureKind::OwnershipConflict,
                        format!("field owned by {}", current_owner.encode()),
                    ));
                }
            }
            if let Some(cat) = &category {
                match ownership::claim_field(
                    pool,
                    brand_id,
                    ENTITY_PRODUCT,
                    id,
                    "category",
                    acting_source,
                )
                .await?
                {
                    ClaimOutcome::Granted => granted_category = Some(cat.clone()),
                    ClaimOutcome::Conflict { current_owner } => {
                        report.failures.push(RowFailure::new(
                            row_index,
                            COL_CATEGORY,
                            FailureKind::OwnershipConflict,
                            format!("field owned by {}", current_owner.encode()),
                        ));
                    }
                }
            }
            for (attr_key, value) in &attrs {
                match ownership::claim_field(
                    pool,
                    brand_id,
                    ENTITY_PRODUCT,
                    id,
                    attr_key,
                    acting_source,
                )
                .await?
                {
                    ClaimOutcome::Granted => {
                        granted_attrs.insert(attr_key.clone(), value.clone());
                    }
                    ClaimOutcome::Conflict { current_owner } => {
                        report.failures.push(RowFailure::new(
                            row_index,
                            attr_key,
                            FailureKind::OwnershipConflict,
                            format!("field owned by {}", current_owner.encode()),
                        ));
                    }
                }
            }

            if granted_name.is_some() || granted_category.is_some() || !granted_attrs.is_empty() {
                apply_update_with_cas(
                    pool,
                    brand_id,
                    &key,
                    granted_name.as_deref(),
                    granted_category.as_deref(),
                    &granted_attrs,
                )
                .await?;
            }
            (id, false)
        }
    };

    // variant row: upsert by sku under this product
    if let Some(sku) = field(row, COL_SKU) {
        let color = field(row, COL_COLOR);
        let size = field(row, COL_SIZE);
        let (variant_id, _) =
            db::upsert_variant(pool, brand_id, product_id, &sku, None, None).await?;

        let mut granted_color = None;
        let mut granted_size = None;
        for (column, value, slot) in [
            (COL_COLOR, &color, &mut granted_color),
            (COL_SIZE, &size, &mut granted_size),
        ] {
            if let Some(v) = value {
                match ownership::claim_field(
                    pool,
                    brand_id,
                    ENTITY_VARIANT,
                    variant_id,
                    column,
                    acting_source,
                )
                .await?
                {
                    ClaimOutcome::Granted => *slot = Some(v.clone()),
                    ClaimOutcome::Conflict { current_owner } => {
                        report.failures.push(RowFailure::new(
                            row_index,
                            column,
                            FailureKind::OwnershipConflict,
                            format!("field owned by {}", current_owner.encode()),
                        ));
                    }
                }
            }
        }
        if granted_color.is_some() || granted_size.is_some() {
            db::upsert_variant(
                pool,
                brand_id,
                product_id,
                &sku,
                granted_color.as_deref(),
                granted_size.as_deref(),
            )
            .await?;
        }

        // grouping evidence for a later promotion of this source
        if !acting_source.is_manual() {
            let group_key = field(row, COL_GROUP_KEY).unwrap_or_else(|| key.clone());
            db::set_variant_source_key(pool, variant_id, acting_source, &group_key).await?;
        }
    }

    report.outcome = if created {
        RowOutcome::Created
    } else {
        RowOutcome::Updated
    };
    Ok(report)
}

/// Optimistic update loop: re-read the version stamp and retry when a
/// concurrent writer moved it.
async fn apply_update_with_cas(
    pool: &Pool,
    brand_id: i64,
    upid: &str,
    name: Option<&str>,
    category: Option<&str>,
    granted_attrs: &BTreeMap<String, AttrValue>,
) -> Result<()> {
    for _ in 0..PRODUCT_UPDATE_ATTEMPTS {
        let Some(product) = db::find_product(pool, brand_id, upid).await? else {
            return Err(anyhow!("product {} disappeared mid-commit", upid));
        };
        let attrs_json = if granted_attrs.is_empty() {
            None
        } else {
            let mut merged: BTreeMap<String, AttrValue> =
                serde_json::from_str(&product.attrs).unwrap_or_default();
            merged.extend(granted_attrs.clone());
            Some(serde_json::to_string(&merged)?)
        };
        if db::apply_product_update(
            pool,
            product.id,
            product.version,
            name,
            category,
            attrs_json.as_deref(),
        )
        .await?
        {
            return Ok(());
        }
    }
    Err(anyhow!(
        "concurrent writers kept invalidating product {}",
        upid
    ))
}

/// Flatten a catalog product into the untyped export record shape.
pub fn product_to_row(product: &ProductExportRow) -> RawRow {
    let mut row = RawRow::new();
    row.insert(COL_UPID.to_string(), product.upid.clone());
    row.insert(COL_NAME.to_string(), product.name.clone());
    if let Some(cat) = &product.category {
        row.insert(COL_CATEGORY.to_string(), cat.clone());
    }
    row.insert("primary_source".to_string(), product.primary_source.encode());
    if let Ok(attrs) = serde_json::from_str::<BTreeMap<String, AttrValue>>(&product.attrs) {
        for (key, value) in attrs {
            let rendered = match value {
                AttrValue::Text(t) => t,
                AttrValue::Number(n) => n.to_string(),
                AttrValue::Flag(b) => b.to_string(),
            };
            row.insert(key, rendered);
        }
    }
    row
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::FailureSeverity;
    use sqlx::SqlitePool;

    fn lookups() -> Lookups {
        let mut l = Lookups::default();
        l.colors.insert("Black".into());
        l.sizes.insert("M".into());
        l.categories.insert("Tops".into());
        l
    }

    fn base_row() -> RawRow {
        let mut row = RawRow::new();
        row.insert(COL_UPID.into(), "UP-1".into());
        row.insert(COL_NAME.into(), "Classic Tee".into());
        row.insert(COL_CATEGORY.into(), "Tops".into());
        row
    }

    #[test]
    fn valid_row_passes() {
        let report = validate_row(&base_row(), &lookups(), 1);
        assert_eq!(report.outcome, RowOutcome::Skipped);
        assert!(report.failures.is_empty());
    }

    #[test]
    fn missing_name_fails() {
        let mut row = base_row();
        row.remove(COL_NAME);
        let report = validate_row(&row, &lookups(), 10);
        assert_eq!(report.outcome, RowOutcome::Failed);
        assert_eq!(report.failures[0].kind, FailureKind::MissingField);
        assert_eq!(report.failures[0].row_index, 10);
    }

    #[test]
    fn missing_key_fails() {
        let mut row = base_row();
        row.remove(COL_UPID);
        let report = validate_row(&row, &lookups(), 2);
        assert_eq!(report.outcome, RowOutcome::Failed);
        assert!(report
            .failures
            .iter()
            .any(|f| f.kind == FailureKind::MissingField && f.column == COL_UPID));
    }

    #[test]
    fn unmapped_reference_values_fail() {
        let mut row = base_row();
        row.insert(COL_CATEGORY.into(), "Swimwear".into());
        let report = validate_row(&row, &lookups(), 3);
        assert_eq!(report.outcome, RowOutcome::Failed);
        assert_eq!(report.failures[0].kind, FailureKind::UnknownReference);
    }

    #[test]
    fn variant_attributes_require_sku() {
        let mut row = base_row();
        row.insert(COL_COLOR.into(), "Black".into());
        let report = validate_row(&row, &lookups(), 4);
        assert_eq!(report.outcome, RowOutcome::Failed);
        assert!(report.failures.iter().any(|f| f.column == COL_SKU));
    }

    #[test]
    fn length_and_price_checks() {
        let mut row = base_row();
        row.insert(COL_NAME.into(), "x".repeat(MAX_NAME_LEN + 1));
        row.insert(COL_PRICE.into(), "-3".into());
        let report = validate_row(&row, &lookups(), 5);
        assert_eq!(
            report
                .failures
                .iter()
                .filter(|f| f.kind == FailureKind::InvalidValue)
                .count(),
            2
        );
    }

    #[test]
    fn wrong_headers_are_structural() {
        let mut row = RawRow::new();
        row.insert("spalte_a".into(), "x".into());
        assert!(check_structure(&[row]).is_err());
        assert!(check_structure(&[]).is_err());
        assert!(check_structure(&[base_row()]).is_ok());
    }

    async fn setup() -> (SqlitePool, i64) {
        let pool = SqlitePool::connect("sqlite::memory:").await.unwrap();
        sqlx::migrate!("./migrations").run(&pool).await.unwrap();
        let brand = db::create_brand(&pool, "acme").await.unwrap();
        for (table, name) in [
            (db::LookupTable::Colors, "Black"),
            (db::LookupTable::Sizes, "M"),
            (db::LookupTable::Categories, "Tops"),
        ] {
            db::add_lookup(&pool, brand, table, name).await.unwrap();
        }
        (pool, brand)
    }

    #[tokio::test]
    async fn commit_creates_then_updates() {
        let (pool, brand) = setup().await;
        let lookups = db::load_lookups(&pool, brand).await.unwrap();

        let report = commit_row(&pool, brand, &base_row(), &lookups, &SourceId::Manual, 1)
            .await
            .unwrap();
        assert_eq!(report.outcome, RowOutcome::Created);

        let mut row = base_row();
        row.insert(COL_NAME.into(), "Renamed Tee".into());
        let report = commit_row(&pool, brand, &row, &lookups, &SourceId::Manual, 2)
            .await
            .unwrap();
        assert_eq!(report.outcome, RowOutcome::Updated);

        let product = db::find_product(&pool, brand, "UP-1").await.unwrap().unwrap();
        assert_eq!(product.name, "Renamed Tee");
    }

    #[tokio::test]
    async fn conflicting_field_is_skipped_rest_commits() {
        let (pool, brand) = setup().await;
        let lookups = db::load_lookups(&pool, brand).await.unwrap();

        // manual entry owns the name
        commit_row(&pool, brand, &base_row(), &lookups, &SourceId::Manual, 1)
            .await
            .unwrap();

        // an integration sync tries to rewrite name and add material
        let sync = SourceId::Integration("shop-1".into());
        let mut row = base_row();
        row.remove(COL_CATEGORY);
        row.insert(COL_NAME.into(), "Sync Tee".into());
        row.insert("material".into(), "Cotton".into());
        let report = commit_row(&pool, brand, &row, &lookups, &sync, 2)
            .await
            .unwrap();

        // row committed, conflicting name skipped and noted
        assert_eq!(report.outcome, RowOutcome::Updated);
        let notes: Vec<_> = report
            .failures
            .iter()
            .filter(|f| f.kind == FailureKind::OwnershipConflict)
            .collect();
        assert_eq!(notes.len(), 1);
        assert_eq!(notes[0].severity, FailureSeverity::Note);
        assert!(!report.has_errors());

        let product = db::find_product(&pool, brand, "UP-1").await.unwrap().unwrap();
        assert_eq!(product.name, "Classic Tee");
        assert!(product.attrs.contains("Cotton"));
    }

    #[tokio::test]
    async fn invalid_row_commits_nothing() {
        let (pool, brand) = setup().await;
        let lookups = db::load_lookups(&pool, brand).await.unwrap();

        let mut row = base_row();
        row.remove(COL_NAME);
        let report = commit_row(&pool, brand, &row, &lookups, &SourceId::Manual, 7)
            .await
            .unwrap();
        assert_eq!(report.outcome, RowOutcome::Failed);
        assert!(db::find_product(&pool, brand, "UP-1").await.unwrap().is_none());
    }
}
