use std::fmt::Display;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{Html, IntoResponse, Redirect, Response};
use axum::routing::get;
use axum::{Form, Json, Router};
use clap::Parser;
use minijinja::{context, Environment};
use prompt_board_api::{PromptBoardApi, SubmitOutcome};
use prompt_board_core::WriteStrategy;
use serde::{Deserialize, Serialize};
use tracing::{error, info};

const INDEX_TEMPLATE: &str = include_str!("../templates/index.html");
const ADD_TEMPLATE: &str = include_str!("../templates/add.html");

#[derive(Debug, Parser)]
#[command(name = "prompt-board-service")]
#[command(about = "Web board recording prompt/response pairs grouped by prompt")]
struct Args {
    #[arg(long, env = "PROMPT_BOARD_DB", default_value = "./prompt_board.sqlite3")]
    db: PathBuf,
    #[arg(long, env = "PROMPT_BOARD_BIND", default_value = "127.0.0.1:4020")]
    bind: SocketAddr,
    #[arg(long, env = "PROMPT_BOARD_TABLE", default_value = "prompt_responses")]
    table: String,
    #[arg(long, env = "PROMPT_BOARD_STRATEGY", value_enum, default_value = "atomic-append")]
    strategy: StrategyArg,
    /// Log filter when RUST_LOG is unset.
    #[arg(long, env = "PROMPT_BOARD_LOG", default_value = "info")]
    log: String,
}

#[derive(Debug, Clone, Copy, clap::ValueEnum)]
enum StrategyArg {
    IndexLookup,
    AtomicAppend,
    FlatInsert,
}

impl From<StrategyArg> for WriteStrategy {
    fn from(value: StrategyArg) -> Self {
        match value {
            StrategyArg::IndexLookup => Self::IndexLookup,
            StrategyArg::AtomicAppend => Self::AtomicAppend,
            StrategyArg::FlatInsert => Self::FlatInsert,
        }
    }
}

#[derive(Clone)]
struct ServiceState {
    api: PromptBoardApi,
    templates: Arc<Environment<'static>>,
}

/// Terse 500 for the read path; detail goes to the log, not the page.
#[derive(Debug, Clone, Copy)]
struct ServiceError;

impl IntoResponse for ServiceError {
    fn into_response(self) -> Response {
        (StatusCode::INTERNAL_SERVER_ERROR, "internal error").into_response()
    }
}

fn internal_error(op: &'static str, err: &dyn Display) -> ServiceError {
    error!(error = %err, "{op}");
    ServiceError
}

#[derive(Debug, Deserialize)]
struct SubmitForm {
    #[serde(default)]
    prompt: String,
    #[serde(default)]
    response: String,
}

#[derive(Debug, Clone, Serialize)]
struct HealthResponse {
    status: &'static str,
}

fn build_templates() -> Result<Environment<'static>> {
    let mut env = Environment::new();
    env.add_template("index.html", INDEX_TEMPLATE).context("failed to load index template")?;
    env.add_template("add.html", ADD_TEMPLATE).context("failed to load add template")?;
    Ok(env)
}

fn app(state: ServiceState) -> Router {
    Router::new()
        .route("/", get(board))
        .route("/add", get(add_form).post(add_entry))
        .route("/health", get(health))
        .with_state(state)
}

fn init_tracing(fallback: &str) {
    let env_filter = match tracing_subscriber::EnvFilter::try_from_default_env() {
        Ok(filter) => filter,
        Err(_) => match fallback.parse::<tracing_subscriber::EnvFilter>() {
            Ok(filter) => filter,
            Err(err) => {
                eprintln!("WARN: log filter '{fallback}' is not valid ({err}); using 'info'");
                tracing_subscriber::EnvFilter::new("info")
            }
        },
    };
    tracing_subscriber::fmt().with_env_filter(env_filter).init();
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    init_tracing(&args.log);

    let strategy = WriteStrategy::from(args.strategy);
    let api = PromptBoardApi::open(&args.db, &args.table, strategy)?;
    info!(
        db = %args.db.display(),
        table = %args.table,
        strategy = strategy.as_str(),
        "store ready"
    );

    let state = ServiceState { api, templates: Arc::new(build_templates()?) };
    let listener = tokio::net::TcpListener::bind(args.bind).await?;
    info!(bind = %args.bind, "prompt-board-service listening");
    axum::serve(listener, app(state)).await?;
    Ok(())
}

async fn board(State(state): State<ServiceState>) -> Result<Html<String>, ServiceError> {
    let groups = state.api.board().map_err(|err| internal_error("failed to load board", &err))?;
    let template = state
        .templates
        .get_template("index.html")
        .map_err(|err| internal_error("missing index template", &err))?;
    let body = template
        .render(context! { groups })
        .map_err(|err| internal_error("failed to render board", &err))?;
    Ok(Html(body))
}

async fn add_form(State(state): State<ServiceState>) -> Result<Html<String>, ServiceError> {
    let template = state
        .templates
        .get_template("add.html")
        .map_err(|err| internal_error("missing add template", &err))?;
    let body =
        template.render(context! {}).map_err(|err| internal_error("failed to render form", &err))?;
    Ok(Html(body))
}

/// The caller is redirected to the board no matter what happened to the
/// write; a store failure is logged and otherwise swallowed here.
async fn add_entry(State(state): State<ServiceState>, Form(form): Form<SubmitForm>) -> Redirect {
    match state.api.submit(&form.prompt, &form.response) {
        Ok(SubmitOutcome::Skipped) => info!("empty submission skipped"),
        Ok(outcome) => info!(?outcome, "submission recorded"),
        Err(err) => error!(error = %err, "failed to record submission"),
    }
    Redirect::to("/")
}

async fn health() -> Json<HealthResponse> {
    Json(HealthResponse { status: "ok" })
}
