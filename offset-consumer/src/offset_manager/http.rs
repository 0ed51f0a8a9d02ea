//! Admin endpoint to inspect or override the next offset of a partition.
//!
//! `GET /offset?topic=<topic>&partition=<partition>` answers with the next
//! offset. Adding `&offset=<offset>` marks that offset and fires the restart
//! signal so the running consumer restarts from it.

use std::sync::Arc;

use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::Router;
use serde::Deserialize;
use thiserror::Error;
use tracing::{error, info};

use super::OffsetManager;
use crate::error::DecodeError;
use crate::run::Fire;
use crate::types::{Offset, Partition, Topic};

#[derive(Clone)]
struct OffsetAdminState {
    manager: Arc<dyn OffsetManager>,
    restart: Arc<dyn Fire>,
}

#[derive(Debug, Deserialize)]
pub struct OffsetParams {
    topic: Option<String>,
    partition: Option<String>,
    offset: Option<String>,
}

#[derive(Error, Debug)]
pub enum OffsetAdminError {
    #[error("parameter topic missing")]
    MissingTopic,
    #[error("parameter partition missing")]
    MissingPartition,
    #[error("invalid parameter: {0}")]
    Invalid(#[from] DecodeError),
    #[error("offset manager failed: {0:#}")]
    Manager(anyhow::Error),
}

impl IntoResponse for OffsetAdminError {
    fn into_response(self) -> Response {
        let status = match &self {
            OffsetAdminError::MissingTopic
            | OffsetAdminError::MissingPartition
            | OffsetAdminError::Invalid(_) => StatusCode::BAD_REQUEST,
            OffsetAdminError::Manager(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };
        error!(error = ?self, status = %status, "offset admin request failed");
        (status, self.to_string()).into_response()
    }
}

pub fn router(manager: Arc<dyn OffsetManager>, restart: Arc<dyn Fire>) -> Router {
    Router::new()
        .route("/offset", get(offset))
        .with_state(OffsetAdminState { manager, restart })
}

async fn offset(
    State(state): State<OffsetAdminState>,
    Query(params): Query<OffsetParams>,
) -> Result<String, OffsetAdminError> {
    let topic = params
        .topic
        .filter(|t| !t.is_empty())
        .map(Topic::from)
        .ok_or(OffsetAdminError::MissingTopic)?;
    let partition: Partition = params
        .partition
        .filter(|p| !p.is_empty())
        .ok_or(OffsetAdminError::MissingPartition)?
        .parse()?;

    let Some(offset) = params.offset.filter(|o| !o.is_empty()) else {
        let next = state
            .manager
            .next_offset(&topic, partition)
            .await
            .map_err(OffsetAdminError::Manager)?;
        return Ok(format!("next offset is {next}"));
    };

    let offset: Offset = offset.parse()?;
    state
        .manager
        .mark_offset(&topic, partition, offset)
        .await
        .map_err(OffsetAdminError::Manager)?;
    info!(%topic, %partition, %offset, "offset set via admin endpoint, restarting consumer");
    state.restart.fire();
    Ok("set offset completed".to_string())
}
