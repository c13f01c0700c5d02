/*
 * SPDX-FileCopyrightText: 2025 Wavelens UG <info@wavelens.io>
 *
 * SPDX-License-Identifier: AGPL-3.0-only
 */

use crate::error::WebResult;
use axum::Json;
use axum::extract::State;
use builder::broker::Broker;
use kiln_core::messages::AgentInfo;
use kiln_core::types::BaseResponse;
use std::sync::Arc;

pub async fn get_agents(
    State(broker): State<Arc<Broker>>,
) -> WebResult<Json<BaseResponse<Vec<AgentInfo>>>> {
    let res = BaseResponse {
        error: false,
        message: broker.agents(),
    };

    Ok(Json(res))
}
