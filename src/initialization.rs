//! Brings local state up at startup.
//!
//! Only the default listing is required. Every enrolled project is brought
//! up independently, and a project that fails is reported instead of
//! stopping the others.

use std::sync::Arc;

use log::{info, warn};

use crate::context::SyncContext;
use crate::datamodel::{ActiveDoc, NonNullListing};
use crate::registry::DatabaseRegistry;
use crate::sync_error::Result;

#[derive(Debug)]
pub struct InitReport {
    pub listing: Arc<NonNullListing>,
    /// Active ids whose data and metadata stores are open.
    pub activated: Vec<String>,
    /// Active ids that could not be opened, with the reason.
    pub failed: Vec<(String, String)>,
}

pub async fn initialize(ctx: &SyncContext) -> Result<InitReport> {
    let listing = ctx.directory().resolve_default_listing().await?;
    ctx.registry().ensure_projects_db(&listing.id).await?;
    ctx.registry().ensure_people_db(&listing.id).await?;

    let mut report = InitReport {
        listing,
        activated: Vec::new(),
        failed: Vec::new(),
    };

    for active in ctx.active().list_active_projects().await? {
        match bring_up(ctx.registry(), &active).await {
            Ok(()) => report.activated.push(active.id),
            Err(e) => {
                warn!("Could not initialize project {}: {e}", active.id);
                report.failed.push((active.id, e.to_string()));
            }
        }
    }

    info!(
        "Initialized listing {}: {} projects ready, {} failed",
        report.listing.id,
        report.activated.len(),
        report.failed.len()
    );
    Ok(report)
}

async fn bring_up(registry: &DatabaseRegistry, active: &ActiveDoc) -> Result<()> {
    registry.ensure_project_db(&active.listing_id, &active.project_id).await?;
    registry.ensure_metadata_db(&active.listing_id, &active.project_id).await?;
    Ok(())
}
