//! The HTTP control surface.
//!
//! Every route is one entry in [`ROUTES`]. Requests are validated here, submitted to the command
//! queue, and the outcome is translated into a status code.

use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::response::{Html, IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use relay_protocol::{ChannelId, Command, RelayState, Switch};
use serde::{Deserialize, Serialize};
use tower_http::trace::TraceLayer;
use tracing::debug;

use std::sync::Arc;

use crate::Gateway;
use crate::error::{CommandError, ValidationError};
use crate::state::ChannelSnapshot;

const INDEX: &str = include_str!("../static/index.html");

/// The name of the threshold query parameter, in milliamps.
const THRESHOLD_PARAM: &str = "mA";

/// What a POST route does.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Endpoint {
    Relay(ChannelId, Switch),
    Threshold(ChannelId),
    Query(ChannelId),
}

const ROUTES: [(&str, Endpoint); 8] = [
    ("/relayone/on", Endpoint::Relay(ChannelId::One, Switch::On)),
    ("/relayone/off", Endpoint::Relay(ChannelId::One, Switch::Off)),
    ("/relaytwo/on", Endpoint::Relay(ChannelId::Two, Switch::On)),
    ("/relaytwo/off", Endpoint::Relay(ChannelId::Two, Switch::Off)),
    ("/threshone", Endpoint::Threshold(ChannelId::One)),
    ("/threshtwo", Endpoint::Threshold(ChannelId::Two)),
    ("/relayone/query", Endpoint::Query(ChannelId::One)),
    ("/relaytwo/query", Endpoint::Query(ChannelId::Two)),
];

#[derive(Debug, Default, Deserialize)]
struct Params {
    #[serde(rename = "mA")]
    threshold_ma: Option<String>,
}

#[derive(Debug, Serialize)]
struct StateResponse {
    channels: Vec<ChannelSnapshot>,
}

/// A failed request: a status code and a plain text reason.
#[derive(Debug)]
struct ApiError {
    status: StatusCode,
    message: String,
}

impl ApiError {
    fn new(status: StatusCode, message: impl Into<String>) -> Self {
        ApiError {
            status,
            message: message.into(),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (self.status, self.message).into_response()
    }
}

impl From<ValidationError> for ApiError {
    fn from(e: ValidationError) -> Self {
        ApiError::new(StatusCode::BAD_REQUEST, e.to_string())
    }
}

impl From<CommandError> for ApiError {
    fn from(e: CommandError) -> Self {
        let status = match e {
            CommandError::OverCurrentInterlock { .. } => StatusCode::CONFLICT,
            CommandError::Transport(_) | CommandError::ShuttingDown => {
                StatusCode::SERVICE_UNAVAILABLE
            }
        };

        ApiError::new(status, e.to_string())
    }
}

/// Builds the router for the control surface.
pub fn router(gateway: Arc<Gateway>) -> Router {
    let mut router = Router::new()
        .route("/", get(index))
        .route("/state", get(state));

    for (path, endpoint) in ROUTES {
        router = router.route(
            path,
            post(move |State(gateway): State<Arc<Gateway>>, Query(params): Query<Params>| {
                handle(gateway, endpoint, params)
            }),
        );
    }

    router.layer(TraceLayer::new_for_http()).with_state(gateway)
}

async fn index() -> Html<&'static str> {
    Html(INDEX)
}

async fn state(State(gateway): State<Arc<Gateway>>) -> Json<StateResponse> {
    Json(StateResponse {
        channels: gateway.snapshots(),
    })
}

async fn handle(gateway: Arc<Gateway>, endpoint: Endpoint, params: Params) -> Response {
    match serve(&gateway, endpoint, params).await {
        Ok(response) => response,
        Err(e) => {
            debug!(?endpoint, status = %e.status, message = %e.message, "request failed");
            e.into_response()
        }
    }
}

async fn serve(gateway: &Gateway, endpoint: Endpoint, params: Params) -> Result<Response, ApiError> {
    let command = match endpoint {
        Endpoint::Relay(channel, desired) => Command::SetRelay { channel, desired },
        Endpoint::Threshold(channel) => Command::SetThreshold {
            channel,
            threshold_ma: parse_threshold(params.threshold_ma.as_deref())?,
        },
        Endpoint::Query(channel) => Command::QueryState { channel },
    };

    let snapshot = gateway.queue().submit(command).await?;

    match endpoint {
        Endpoint::Relay(channel, Switch::On) if snapshot.state != RelayState::On => {
            Err(ApiError::new(
                StatusCode::CONFLICT,
                format!("channel {} did not switch on, reported {}", channel, snapshot.state),
            ))
        }
        Endpoint::Relay(..) | Endpoint::Threshold(_) => Ok("OK".into_response()),
        Endpoint::Query(_) => Ok(Json(snapshot).into_response()),
    }
}

/// Parses the threshold query parameter, which must be a positive integer that fits in `u32`.
fn parse_threshold(value: Option<&str>) -> Result<u32, ValidationError> {
    let value = value.ok_or(ValidationError::Missing(THRESHOLD_PARAM))?;

    match value.trim().parse::<u32>() {
        Ok(threshold) if threshold > 0 => Ok(threshold),
        _ => Err(ValidationError::NotPositive {
            name: THRESHOLD_PARAM,
            value: value.to_string(),
        }),
    }
}
