//! Brand-scoped facade consumed by the dashboard's API layer.
//!
//! Authentication happens upstream; this layer only sees an already
//! authenticated actor and enforces brand membership and scoping before
//! any job mutation. Every operation touches exactly one brand's data —
//! a job belonging to another brand reads as missing.

use crate::db;
use crate::error::{PipelineError, Result};
use crate::model::{JobSnapshot, SourceId};
use crate::orchestrator::{JobDetails, Orchestrator};
use crate::ownership;
use crate::source::{ExportSink, RowSource};
use std::sync::Arc;
use tokio::sync::broadcast;
use uuid::Uuid;

/// An authenticated principal acting for one brand.
#[derive(Debug, Clone)]
pub struct Actor {
    pub brand_id: i64,
    pub member: bool,
}

impl Actor {
    pub fn member_of(brand_id: i64) -> Self {
        Self {
            brand_id,
            member: true,
        }
    }
}

pub struct PipelineService {
    orchestrator: Arc<Orchestrator>,
}

impl PipelineService {
    pub fn new(orchestrator: Arc<Orchestrator>) -> Self {
        Self { orchestrator }
    }

    fn authorize(&self, actor: &Actor) -> Result<()> {
        if !actor.member {
            return Err(PipelineError::Unauthorized);
        }
        Ok(())
    }

    /// Confirm the job exists within the actor's brand before acting on it.
    async fn scoped(&self, actor: &Actor, job_id: Uuid) -> Result<()> {
        db::fetch_job_scoped(self.orchestrator.pool(), actor.brand_id, job_id)
            .await?
            .ok_or(PipelineError::NotFound)?;
        Ok(())
    }

    pub async fn submit_import_job(
        &self,
        actor: &Actor,
        acting_source: SourceId,
        source: Arc<dyn RowSource>,
    ) -> Result<Uuid> {
        self.authorize(actor)?;
        self.orchestrator
            .submit_import(actor.brand_id, acting_source, source)
            .await
    }

    pub async fn submit_export_job(
        &self,
        actor: &Actor,
        sink: Arc<dyn ExportSink>,
    ) -> Result<Uuid> {
        self.authorize(actor)?;
        self.orchestrator.submit_export(actor.brand_id, sink).await
    }

    pub async fn get_job_status(&self, actor: &Actor, job_id: Uuid) -> Result<JobDetails> {
        self.authorize(actor)?;
        self.orchestrator.status(actor.brand_id, job_id).await
    }

    pub async fn approve_job(&self, actor: &Actor, job_id: Uuid) -> Result<()> {
        self.authorize(actor)?;
        self.scoped(actor, job_id).await?;
        self.orchestrator.approve(job_id).await
    }

    pub async fn cancel_job(&self, actor: &Actor, job_id: Uuid) -> Result<()> {
        self.authorize(actor)?;
        self.scoped(actor, job_id).await?;
        self.orchestrator.cancel(job_id).await
    }

    pub async fn resolve_field_conflict(
        &self,
        actor: &Actor,
        entity_type: &str,
        entity_id: i64,
        field_name: &str,
        chosen: SourceId,
    ) -> Result<()> {
        self.authorize(actor)?;
        let resolved = ownership::resolve_conflict(
            self.orchestrator.pool(),
            actor.brand_id,
            entity_type,
            entity_id,
            field_name,
            &chosen,
        )
        .await?;
        if !resolved {
            return Err(PipelineError::NotFound);
        }
        Ok(())
    }

    pub async fn list_field_conflicts(&self, actor: &Actor) -> Result<Vec<db::ConflictRow>> {
        self.authorize(actor)?;
        Ok(db::list_conflicts(self.orchestrator.pool(), actor.brand_id).await?)
    }

    pub async fn promote_integration(
        &self,
        actor: &Actor,
        new_primary: SourceId,
    ) -> Result<Uuid> {
        self.authorize(actor)?;
        self.orchestrator
            .submit_promotion(actor.brand_id, new_primary)
            .await
    }

    /// Attach to the live status stream of one job. Snapshots have the
    /// same shape as `get_job_status`; the stream ends after a terminal
    /// snapshot is delivered.
    pub async fn watch_job(
        &self,
        actor: &Actor,
        job_id: Uuid,
    ) -> Result<(broadcast::Receiver<JobSnapshot>, usize)> {
        self.authorize(actor)?;
        self.scoped(actor, job_id).await?;
        Ok(self.orchestrator.progress().attach(job_id))
    }
}
