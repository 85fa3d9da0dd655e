use std::env;

use aliri_oidc::{OidcSettings, Scope};
use aliri_tower::{token_from, AuthenticationGate, JsonErrorHandler, RequireScopes};
use axum::{
    body::Body,
    extract::{Path, Request},
    http::StatusCode,
    routing::get,
    Router,
};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> color_eyre::Result<()> {
    color_eyre::install()?;
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("info,aliri_oidc=debug,aliri_tower=debug")),
        )
        .init();

    let mut settings = OidcSettings::new(env::var("AUTH0_ISSUER")?);
    settings.audiences.push(env::var("AUTH0_AUDIENCE")?);
    settings.timeout_secs = Some(5);

    let gate = AuthenticationGate::from_authenticator(&settings.authenticator()?)
        .with_error_handler(JsonErrorHandler::<Body>::new());

    let app = Router::new()
        .route("/widgets", get(list_widgets).post(create_widget))
        .route("/widgets/:id", get(get_widget))
        .route("/whoami", get(whoami))
        .layer(gate.layer());

    let listener = tokio::net::TcpListener::bind("127.0.0.1:8080").await?;
    tracing::info!(issuer = %settings.issuer, "listening on http://127.0.0.1:8080");
    axum::serve(listener, app).await?;

    Ok(())
}

fn require(scopes: impl IntoIterator<Item = Scope>, request: &Request) -> Result<(), StatusCode> {
    RequireScopes::new(scopes)
        .check(request.extensions())
        .map_err(|e| e.status_code())
}

async fn list_widgets(request: Request) -> Result<&'static str, StatusCode> {
    require([Scope::Read], &request)?;
    Ok("[]")
}

async fn get_widget(Path(id): Path<u64>, request: Request) -> Result<String, StatusCode> {
    require([Scope::Read], &request)?;
    Ok(format!("widget {id}"))
}

async fn create_widget(request: Request) -> Result<(StatusCode, &'static str), StatusCode> {
    require([Scope::Write], &request)?;
    Ok((StatusCode::CREATED, "created"))
}

async fn whoami(request: Request) -> Result<String, StatusCode> {
    let token = token_from(request.extensions()).ok_or(StatusCode::UNAUTHORIZED)?;

    Ok(format!(
        "subject: {}\npermissions: {}\n",
        token.subject().map(|s| s.as_str()).unwrap_or("<none>"),
        token.permissions(),
    ))
}
