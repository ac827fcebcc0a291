// Switcheroo - JSON-RPC traffic switch
// Copyright (C) 2024 Zhuo Zhang and Wuqi Zhang
//
// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU Affero General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE. See the
// GNU Affero General Public License for more details.
//
// You should have received a copy of the GNU Affero General Public License
// along with this program. If not, see <https://www.gnu.org/licenses/>.

//! Router between sources and targets, and its HTTP surface.
//!
//! The backend owns the read-only config, the registry of live sessions and
//! the accept flag. Sources reach it through `GET /dial/{name}`, which is
//! upgraded to a WebSocket and attached as a new session.

use crate::{
    config::{Config, SourceConfig, TargetConfig},
    direction::Side,
    envelope::{Envelope, SessionId},
    error::{CloseCause, ConfigError, LookupKind, MultiError, RouteError},
    messenger::Messenger,
    remote::{Dialer, DEFAULT_IDLE_TIMEOUT},
    session::{Session, SessionSetup},
    ws::AxumMessenger,
};
use axum::{
    extract::{
        ws::{rejection::WebSocketUpgradeRejection, WebSocketUpgrade},
        Path, State,
    },
    http::{Method, StatusCode},
    response::{IntoResponse, Json, Response},
    routing::get,
    Router,
};
use dashmap::DashMap;
use eyre::WrapErr;
use serde_json::json;
use std::{
    sync::{
        atomic::{AtomicBool, AtomicU64, Ordering},
        Arc,
    },
    time::Duration,
};
use tower_http::{
    cors::{Any, CorsLayer},
    trace::TraceLayer,
};
use tracing::{debug, info, warn};

/// A configured source and the target it is switched to.
#[derive(Debug, Clone, Copy)]
pub struct Route<'a> {
    /// Source name
    pub source_name: &'a str,
    /// Source configuration
    pub source: &'a SourceConfig,
    /// Target name
    pub target_name: &'a str,
    /// Target configuration
    pub target: &'a TargetConfig,
}

/// Matches sources to targets and keeps track of live sessions.
pub struct Backend {
    config: Arc<Config>,
    dialer: Arc<dyn Dialer>,
    accepting: AtomicBool,
    sessions: Arc<DashMap<SessionId, Arc<Session>>>,
    next_id: AtomicU64,
    idle_timeout: Duration,
}

impl std::fmt::Debug for Backend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Backend")
            .field("accepting", &self.is_accepting())
            .field("sessions", &self.sessions.len())
            .finish_non_exhaustive()
    }
}

impl Backend {
    /// A backend that accepts connections
    pub fn new(config: Arc<Config>, dialer: Arc<dyn Dialer>) -> Self {
        Self {
            config,
            dialer,
            accepting: AtomicBool::new(true),
            sessions: Arc::new(DashMap::new()),
            next_id: AtomicU64::new(1),
            idle_timeout: DEFAULT_IDLE_TIMEOUT,
        }
    }

    /// Override the idle timeout of target links
    pub fn with_idle_timeout(mut self, idle_timeout: Duration) -> Self {
        self.idle_timeout = idle_timeout;
        self
    }

    /// The active config
    pub fn config(&self) -> &Arc<Config> {
        &self.config
    }

    /// Whether new connections are taken
    pub fn is_accepting(&self) -> bool {
        self.accepting.load(Ordering::SeqCst)
    }

    /// Refuse new connections from now on. Returns `false` if already refusing.
    pub fn stop_accepting(&self) -> bool {
        self.accepting.swap(false, Ordering::SeqCst)
    }

    /// Number of live sessions
    pub fn session_count(&self) -> usize {
        self.sessions.len()
    }

    /// Live session by id
    pub fn session(&self, id: SessionId) -> Option<Arc<Session>> {
        self.sessions.get(&id).map(|entry| entry.value().clone())
    }

    /// Look up a source and a target by name.
    pub fn resolve<'a>(
        &'a self,
        source: &'a str,
        target: &'a str,
    ) -> Result<Route<'a>, RouteError> {
        Ok(Route {
            source_name: source,
            source: self.config.source(source)?,
            target_name: target,
            target: self.config.target(target)?,
        })
    }

    /// Check a dial request can be taken before upgrading it.
    pub fn admit<'a>(&'a self, source: &'a str) -> Result<Route<'a>, RouteError> {
        if !self.is_accepting() {
            return Err(RouteError::NotAccepting);
        }
        if source.is_empty() {
            return Err(RouteError::MissingName);
        }
        self.config.source(source)?;
        let target = self.config.target_for(source).map_err(|e| RouteError::ConfigLookup {
            kind: LookupKind::Target,
            name: match e {
                ConfigError::UnknownTarget { target, .. } => target,
                _ => String::new(),
            },
        })?;
        self.resolve(source, target)
    }

    /// Open a session for `source` over `messenger`.
    ///
    /// The session is dropped from the registry once its source connection
    /// closes.
    pub fn attach(
        &self,
        source: &str,
        messenger: Arc<dyn Messenger>,
    ) -> Result<Arc<Session>, RouteError> {
        let route = self.admit(source)?;
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let setup = SessionSetup {
            id,
            source_name: route.source_name,
            source: route.source,
            target_name: route.target_name,
            target: route.target,
            dialer: self.dialer.clone(),
            idle_timeout: self.idle_timeout,
        };
        let session = Session::open(setup, messenger);
        self.sessions.insert(id, session.clone());

        // shutdown may have started while the session was opening
        if !self.is_accepting() {
            self.sessions.remove(&id);
            let session = session.clone();
            tokio::spawn(async move {
                if let Err(e) = session.close(CloseCause::Shutdown).await {
                    debug!(error = %e, "closing late session");
                }
            });
            return Err(RouteError::NotAccepting);
        }

        let sessions = self.sessions.clone();
        let watched = session.clone();
        tokio::spawn(async move {
            watched.closed().await;
            sessions.remove(&watched.id());
            if let Err(e) = watched.close(CloseCause::RemoteClosed).await {
                debug!(session = watched.id(), error = %e, "closing finished session");
            }
        });
        Ok(session)
    }

    /// Push `envelope` into the live session it belongs to, through the path
    /// of its origin side. Unknown names and closed sessions discard the
    /// envelope; the error is logged and returned.
    pub async fn route(
        &self,
        source: &str,
        target: &str,
        envelope: Envelope,
    ) -> Result<(), RouteError> {
        let result = self.route_inner(source, target, envelope).await;
        if let Err(e) = &result {
            warn!(source, target, error = %e, "discarding envelope");
        }
        result
    }

    async fn route_inner(
        &self,
        source: &str,
        target: &str,
        envelope: Envelope,
    ) -> Result<(), RouteError> {
        let route = self.resolve(source, target)?;
        let session = self
            .session(envelope.session)
            .filter(|s| {
                s.source_name() == route.source_name && s.target_name() == route.target_name
            })
            .ok_or(RouteError::SessionClosed(envelope.session))?;
        let to = match envelope.origin {
            Side::Source => route.target_name,
            Side::Target => route.source_name,
        };
        debug!(session = session.id(), from = %envelope.origin, to, "routing envelope");
        session.inject(envelope).await
    }

    /// Stop accepting and close every live session. Every failure is kept.
    pub async fn close(&self) -> Result<(), MultiError> {
        self.stop_accepting();
        let sessions: Vec<Arc<Session>> =
            self.sessions.iter().map(|entry| entry.value().clone()).collect();
        self.sessions.clear();
        info!(sessions = sessions.len(), "closing sessions");

        let results = futures::future::join_all(sessions.iter().map(|session| async move {
            session
                .close(CloseCause::Shutdown)
                .await
                .wrap_err_with(|| format!("failed to close session {}", session.id()))
        }))
        .await;

        let mut errors = MultiError::new();
        for error in results.into_iter().filter_map(Result::err) {
            errors.push(error);
        }
        errors.into_result()
    }

    /// HTTP surface: `GET /dial/{name}` and `GET /health`.
    pub fn router(self: &Arc<Self>) -> Router {
        Router::new()
            .route("/dial/{name}", get(dial))
            .route("/dial", get(dial_without_name))
            .route("/dial/", get(dial_without_name))
            .route("/health", get(health))
            .layer(
                CorsLayer::new()
                    .allow_methods([Method::GET])
                    .allow_headers(Any)
                    .allow_origin(Any),
            )
            .layer(TraceLayer::new_for_http())
            .with_state(self.clone())
    }
}

fn reject(error: &RouteError) -> Response {
    let status = match error {
        RouteError::NotAccepting => StatusCode::SERVICE_UNAVAILABLE,
        RouteError::MissingName => StatusCode::BAD_REQUEST,
        RouteError::ConfigLookup { .. } => StatusCode::NOT_FOUND,
        RouteError::SessionClosed(_) => StatusCode::GONE,
    };
    (status, error.to_string()).into_response()
}

async fn dial(
    State(backend): State<Arc<Backend>>,
    Path(name): Path<String>,
    upgrade: Result<WebSocketUpgrade, WebSocketUpgradeRejection>,
) -> Response {
    if let Err(e) = backend.admit(&name) {
        debug!(source = %name, error = %e, "rejecting dial");
        return reject(&e);
    }
    let upgrade = match upgrade {
        Ok(upgrade) => upgrade,
        Err(rejection) => return rejection.into_response(),
    };
    upgrade.on_upgrade(move |socket| async move {
        let messenger = Arc::new(AxumMessenger::new(socket, format!("source {name}")));
        if let Err(e) = backend.attach(&name, messenger.clone()) {
            warn!(source = %name, error = %e, "dropping upgraded connection");
            messenger.close_with_cause(CloseCause::Shutdown);
            if let Err(e) = messenger.close().await {
                debug!(error = %e, "closing rejected connection");
            }
        }
    })
}

async fn dial_without_name() -> Response {
    reject(&RouteError::MissingName)
}

async fn health(State(backend): State<Arc<Backend>>) -> Json<serde_json::Value> {
    Json(json!({
        "status": "ok",
        "accepting": backend.is_accepting(),
        "sessions": backend.session_count(),
    }))
}
