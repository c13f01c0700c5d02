/*
 * SPDX-FileCopyrightText: 2025 Wavelens UG <info@wavelens.io>
 *
 * SPDX-License-Identifier: AGPL-3.0-only
 */

use crate::error::{WebError, WebResult};
use axum::Json;
use axum::extract::{Path, State};
use builder::broker::Broker;
use entity::{BuildRequestSnapshot, BuildSnapshot};
use kiln_core::input::validate_segment;
use kiln_core::types::BaseResponse;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// A build request or a single build, whichever the id names.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum BuildEntry {
    Request(BuildRequestSnapshot),
    Build(BuildSnapshot),
}

pub async fn get_builds(
    State(broker): State<Arc<Broker>>,
) -> WebResult<Json<BaseResponse<Vec<BuildRequestSnapshot>>>> {
    let requests = broker
        .requests()
        .iter()
        .map(|request| request.snapshot())
        .collect();

    Ok(Json(BaseResponse {
        error: false,
        message: requests,
    }))
}

pub async fn get_build(
    State(broker): State<Arc<Broker>>,
    Path(id): Path<String>,
) -> WebResult<Json<BaseResponse<BuildEntry>>> {
    validate_segment("build id", &id)?;

    let entry = if let Some(request) = broker.get_build_request(&id) {
        BuildEntry::Request(request.snapshot())
    } else if let Some(build) = broker.get_build(&id) {
        BuildEntry::Build(build.snapshot())
    } else {
        return Err(WebError::not_found("Build"));
    };

    Ok(Json(BaseResponse {
        error: false,
        message: entry,
    }))
}

pub async fn post_build_cancel(
    State(broker): State<Arc<Broker>>,
    Path(id): Path<String>,
) -> WebResult<Json<BaseResponse<String>>> {
    validate_segment("build id", &id)?;
    broker.cancel(&id).await?;

    Ok(Json(BaseResponse {
        error: false,
        message: format!("Cancelled {}", id),
    }))
}

pub async fn delete_build(
    State(broker): State<Arc<Broker>>,
    Path(id): Path<String>,
) -> WebResult<Json<BaseResponse<String>>> {
    validate_segment("build id", &id)?;
    broker.delete(&id).await?;

    Ok(Json(BaseResponse {
        error: false,
        message: format!("Deleted {}", id),
    }))
}

pub async fn post_build_rebuild(
    State(broker): State<Arc<Broker>>,
    Path(id): Path<String>,
) -> WebResult<Json<BaseResponse<String>>> {
    validate_segment("build id", &id)?;
    broker.rebuild(&id).await?;

    Ok(Json(BaseResponse {
        error: false,
        message: format!("Rebuilding {}", id),
    }))
}
