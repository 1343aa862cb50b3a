/*
 * vSleuth mail log forensics
 * Copyright (C) 2022 viridIT SAS
 *
 * This program is free software: you can redistribute it and/or modify it under
 * the terms of the GNU General Public License as published by the Free Software
 * Foundation, either version 3 of the License, or any later version.
 *
 * This program is distributed in the hope that it will be useful, but WITHOUT
 * ANY WARRANTY; without even the implied warranty of MERCHANTABILITY or FITNESS
 * FOR A PARTICULAR PURPOSE.  See the GNU General Public License for more details.
 *
 * You should have received a copy of the GNU General Public License along with
 * this program. If not, see https://www.gnu.org/licenses/.
 *
*/
use crate::auth::Authenticator;
use axum::extract::{Query, State};
use axum::http::{header, HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use vsleuth_common::runner::Cancellation;
use vsleuth_common::{is_exact_address, TimeInterval};
use vsleuth_detective::{Detective, DetectiveError, MessagesPage, CSV_HEADER, RESULTS_PER_PAGE};
use vsleuth_store::metadata::{self, MetadataError};

/// Settings key the end-user policy is stored under.
pub const DETECTIVE_SETTINGS_KEY: &str = "detective";

/// The operator-controlled end-user policy.
#[derive(Debug, Clone, Copy, Default, serde::Serialize, serde::Deserialize)]
pub struct DetectiveSettings {
    /// when set, anonymous visitors may check their own messages.
    #[serde(default)]
    pub end_users_enabled: bool,
}

/// Everything the detective endpoints need.
pub struct DetectiveApiState {
    /// the query engine.
    pub detective: std::sync::Arc<dyn Detective>,
    /// the session layer seam.
    pub authenticator: std::sync::Arc<dyn Authenticator>,
    /// the settings store, for [`DETECTIVE_SETTINGS_KEY`].
    pub settings: metadata::Reader,
}

/// Mount the detective endpoints.
pub fn router(state: std::sync::Arc<DetectiveApiState>) -> axum::Router {
    axum::Router::new()
        .route(
            "/api/v0/checkMessageDeliveryStatus",
            axum::routing::get(check_message_delivery),
        )
        .route(
            "/api/v0/oldestAvailableTime",
            axum::routing::get(oldest_available_time),
        )
        .with_state(state)
}

const fn default_page() -> i64 {
    1
}

const fn default_status() -> i64 {
    vsleuth_detective::NO_STATUS
}

#[derive(Debug, serde::Deserialize)]
struct DetectiveParams {
    #[serde(default)]
    mail_from: String,
    #[serde(default)]
    mail_to: String,
    from: String,
    to: String,
    #[serde(default = "default_status")]
    status: i64,
    #[serde(default)]
    some_id: String,
    #[serde(default = "default_page")]
    page: i64,
    #[serde(default)]
    csv: bool,
}

/// The §"end-users" half of the authorization matrix: anonymous callers
/// are only served when the operator enabled it, and then only for their
/// own exact addresses or a non-empty queue/message id. CSV stays
/// operator-only.
async fn end_user_allowed(state: &DetectiveApiState, params: &DetectiveParams, csv: bool) -> bool {
    let settings: DetectiveSettings = match state
        .settings
        .retrieve_json(&Cancellation::none(), DETECTIVE_SETTINGS_KEY)
        .await
    {
        Ok(settings) => settings,
        Err(MetadataError::NoSuchKey) => DetectiveSettings::default(),
        Err(MetadataError::Other(e)) => {
            tracing::error!(error = %e, "cannot read the detective settings");
            return false;
        }
    };

    if !settings.end_users_enabled || csv {
        return false;
    }

    if !params.some_id.trim().is_empty() {
        return true;
    }

    is_exact_address(&params.mail_from) && is_exact_address(&params.mail_to)
}

fn csv_response(page: &MessagesPage) -> Response {
    let mut writer = csv::Writer::from_writer(Vec::new());

    let write = || -> anyhow::Result<Vec<u8>> {
        writer.write_record(CSV_HEADER)?;

        for record in page.export_csv() {
            writer.write_record(&record)?;
        }

        Ok(writer.into_inner()?)
    };

    match write() {
        Ok(body) => (
            StatusCode::OK,
            [(header::CONTENT_TYPE, "text/csv")],
            body,
        )
            .into_response(),
        Err(e) => {
            tracing::error!(error = %e, "cannot serialize the CSV export");
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        }
    }
}

async fn check_message_delivery(
    State(state): State<std::sync::Arc<DetectiveApiState>>,
    Query(params): Query<DetectiveParams>,
    headers: HeaderMap,
) -> Response {
    let authenticated = state.authenticator.authenticated_user(&headers).is_some();

    if !authenticated && !end_user_allowed(&state, &params, params.csv).await {
        return StatusCode::UNAUTHORIZED.into_response();
    }

    let Ok(interval) = TimeInterval::from_dates(&params.from, &params.to) else {
        return (
            StatusCode::UNPROCESSABLE_ENTITY,
            "invalid time interval".to_string(),
        )
            .into_response();
    };

    if params.page < 1 {
        return (StatusCode::UNPROCESSABLE_ENTITY, "invalid page".to_string()).into_response();
    }

    let page = state
        .detective
        .check_message_delivery(
            &Cancellation::none(),
            &params.mail_from,
            &params.mail_to,
            interval,
            params.status,
            params.some_id.trim(),
            params.page,
            RESULTS_PER_PAGE,
        )
        .await;

    match page {
        Ok(page) if params.csv => csv_response(&page),
        Ok(page) => axum::Json(page).into_response(),
        Err(e) => {
            tracing::error!(error = %e, "the delivery check failed");
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        }
    }
}

#[derive(serde::Serialize)]
struct OldestAvailableTime {
    #[serde(with = "time::serde::rfc3339::option")]
    time: Option<time::OffsetDateTime>,
}

async fn oldest_available_time(
    State(state): State<std::sync::Arc<DetectiveApiState>>,
    headers: HeaderMap,
) -> Response {
    let authenticated = state.authenticator.authenticated_user(&headers).is_some();

    if !authenticated {
        let settings: DetectiveSettings = match state
            .settings
            .retrieve_json(&Cancellation::none(), DETECTIVE_SETTINGS_KEY)
            .await
        {
            Ok(settings) => settings,
            Err(MetadataError::NoSuchKey) => DetectiveSettings::default(),
            Err(MetadataError::Other(e)) => {
                tracing::error!(error = %e, "cannot read the detective settings");
                return StatusCode::INTERNAL_SERVER_ERROR.into_response();
            }
        };

        if !settings.end_users_enabled {
            return StatusCode::UNAUTHORIZED.into_response();
        }
    }

    match state
        .detective
        .oldest_available_time(&Cancellation::none())
        .await
    {
        Ok(time) => axum::Json(OldestAvailableTime { time: Some(time) }).into_response(),
        // a fresh install simply has no data yet
        Err(DetectiveError::NoAvailableLogs) => {
            axum::Json(OldestAvailableTime { time: None }).into_response()
        }
        Err(DetectiveError::Other(e)) => {
            tracing::error!(error = %e, "cannot read the oldest available time");
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        }
    }
}
