//! Database view models used by repositories.
//!
//! Keep these structs focused on the data returned by queries. Business
//! logic should live in higher layers.

use crate::model::SourceId;
use std::collections::HashSet;

/// Brand-scoped reference lists consulted during row validation.
#[derive(Debug, Clone, Default)]
pub struct Lookups {
    pub colors: HashSet<String>,
    pub sizes: HashSet<String>,
    pub categories: HashSet<String>,
}

/// Product slice used by the row processor and the promotion loop.
#[derive(Debug, Clone)]
pub struct ProductRow {
    pub id: i64,
    pub upid: String,
    pub name: String,
    pub category: Option<String>,
    pub attrs: String,
    pub primary_source: SourceId,
    pub version: i64,
}

/// Flattened product used by export jobs.
#[derive(Debug, Clone)]
pub struct ProductExportRow {
    pub upid: String,
    pub name: String,
    pub category: Option<String>,
    pub attrs: String,
    pub primary_source: SourceId,
}

/// Unresolved ownership conflict, queryable by the dashboard.
#[derive(Debug, Clone)]
pub struct ConflictRow {
    pub entity_type: String,
    pub entity_id: i64,
    pub field_name: String,
    pub owner: SourceId,
    pub conflict_source: Option<SourceId>,
}

/// Product the promotion loop still has to touch.
#[derive(Debug, Clone)]
pub struct PromotionCandidate {
    pub product_id: i64,
    pub upid: String,
}
