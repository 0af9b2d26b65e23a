use std::{net::SocketAddr, sync::Arc};

use axum::{
    body::Bytes,
    extract::{DefaultBodyLimit, Multipart, Path, State},
    http::{header, HeaderMap, HeaderValue, StatusCode},
    response::IntoResponse,
    routing::{get, post},
    Form, Json, Router,
};
use serde::Deserialize;
use server_api::{
    analyze_text, chat, extract_pdf, get_graph, get_reports, reset, run_pipeline,
    AnalysisPipeline, ApiContext, MissingAnalysisPipeline,
};
use shared::{
    domain::{CountryCode, GraphCategory},
    error::{ApiError, ErrorCode},
    protocol::{
        ChatResponse, CountryReport, ExtractionResponse, ResetResponse, RunPipelineResponse,
    },
};
use storage::Storage;
use tower_http::limit::RequestBodyLimitLayer;
use tracing::{error, info, warn};

mod config;
mod upstream;

use config::{load_settings, normalize_database_url};
use upstream::UpstreamPipeline;

/// Pitch decks arrive as whole PDFs, so the default 2 MB axum body limit is
/// replaced with a larger cap applied to every route.
const MAX_UPLOAD_BYTES: usize = 20 * 1024 * 1024;

#[derive(Debug, Deserialize)]
struct SubmitTextForm {
    #[serde(default)]
    text: String,
}

#[derive(Debug, Deserialize)]
struct RunPipelineForm {
    #[serde(default)]
    idea: String,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt().with_env_filter("info").init();

    let settings = load_settings();
    let database_url = normalize_database_url(&settings.database_url);
    let storage = Storage::new(&database_url).await.map_err(|error| {
        error!(
            %database_url,
            %error,
            "failed to open SQLite database; verify parent directory exists and permissions are correct"
        );
        error
    })?;

    let pipeline: Arc<dyn AnalysisPipeline> = match settings.pipeline_upstream_url.as_deref() {
        Some(upstream_url) => Arc::new(UpstreamPipeline::new(upstream_url)),
        None => {
            warn!("pipeline_upstream_url is not configured; analysis routes will answer 502");
            Arc::new(MissingAnalysisPipeline)
        }
    };

    let api = ApiContext {
        storage,
        pipeline,
        shortlist_size: settings.shortlist_size,
    };
    let app = build_router(api);

    let addr: SocketAddr = settings.bind_addr.parse()?;
    info!(%addr, "server listening");
    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;
    Ok(())
}

fn build_router(api: ApiContext) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/upload_pdf", post(http_upload_pdf))
        .route("/submit_text", post(http_submit_text))
        .route("/run_pipeline", post(http_run_pipeline))
        .route("/get_reports", get(http_get_reports))
        .route("/get_graph/:country_code/:category", get(http_get_graph))
        .route("/chat", post(http_chat))
        .route("/reset", post(http_reset))
        .layer(DefaultBodyLimit::disable())
        .layer(RequestBodyLimitLayer::new(MAX_UPLOAD_BYTES))
        .with_state(api)
}

fn api_error(err: ApiError) -> (StatusCode, Json<ApiError>) {
    let status = match err.code {
        ErrorCode::Validation => StatusCode::BAD_REQUEST,
        ErrorCode::NotFound => StatusCode::NOT_FOUND,
        ErrorCode::Upstream => StatusCode::BAD_GATEWAY,
        ErrorCode::Internal => StatusCode::INTERNAL_SERVER_ERROR,
    };
    (status, Json(err))
}

async fn healthz() -> &'static str {
    "ok"
}

async fn http_upload_pdf(
    State(api): State<ApiContext>,
    mut multipart: Multipart,
) -> Result<Json<ExtractionResponse>, (StatusCode, Json<ApiError>)> {
    let mut upload: Option<(String, Bytes)> = None;
    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| api_error(ApiError::new(ErrorCode::Validation, e.to_string())))?
    {
        if field.name() != Some("file") {
            continue;
        }
        let filename = field.file_name().unwrap_or_default().to_string();
        let bytes = field
            .bytes()
            .await
            .map_err(|e| api_error(ApiError::new(ErrorCode::Validation, e.to_string())))?;
        upload = Some((filename, bytes));
    }

    let Some((filename, pdf_bytes)) = upload else {
        return Err(api_error(ApiError::new(
            ErrorCode::Validation,
            "no file uploaded",
        )));
    };

    let extraction = extract_pdf(&api, &filename, &pdf_bytes)
        .await
        .map_err(api_error)?;
    Ok(Json(extraction))
}

async fn http_submit_text(
    State(api): State<ApiContext>,
    Form(form): Form<SubmitTextForm>,
) -> Result<Json<ExtractionResponse>, (StatusCode, Json<ApiError>)> {
    let extraction = analyze_text(&api, &form.text).await.map_err(api_error)?;
    Ok(Json(extraction))
}

async fn http_run_pipeline(
    State(api): State<ApiContext>,
    Form(form): Form<RunPipelineForm>,
) -> Result<Json<RunPipelineResponse>, (StatusCode, Json<ApiError>)> {
    let outcome = run_pipeline(&api, &form.idea).await.map_err(api_error)?;
    Ok(Json(outcome))
}

async fn http_get_reports(
    State(api): State<ApiContext>,
) -> Result<Json<Vec<CountryReport>>, (StatusCode, Json<ApiError>)> {
    let reports = get_reports(&api).await.map_err(api_error)?;
    Ok(Json(reports))
}

async fn http_get_graph(
    State(api): State<ApiContext>,
    Path((country_code, category)): Path<(String, String)>,
) -> Result<impl IntoResponse, (StatusCode, Json<ApiError>)> {
    let Some(category) = GraphCategory::parse(&category) else {
        return Err(api_error(ApiError::new(
            ErrorCode::NotFound,
            "graph not found",
        )));
    };

    let graph = get_graph(&api, &CountryCode::from(country_code.as_str()), category)
        .await
        .map_err(api_error)?;

    let mut headers = HeaderMap::new();
    headers.insert(header::CONTENT_TYPE, HeaderValue::from_static("image/png"));
    Ok((StatusCode::OK, headers, graph.png))
}

/// The chat form carries one `top_countries` pair per shortlisted country, so
/// the body is walked manually instead of going through `Form`.
async fn http_chat(
    State(api): State<ApiContext>,
    body: String,
) -> Result<Json<ChatResponse>, (StatusCode, Json<ApiError>)> {
    let mut question = String::new();
    let mut top_countries = Vec::new();
    for (key, value) in url::form_urlencoded::parse(body.as_bytes()) {
        match key.as_ref() {
            "question" => question = value.into_owned(),
            "top_countries" => top_countries.push(CountryCode::from(value.as_ref())),
            _ => {}
        }
    }

    let answer = chat(&api, &question, &top_countries)
        .await
        .map_err(api_error)?;
    Ok(Json(answer))
}

async fn http_reset(
    State(api): State<ApiContext>,
) -> Result<Json<ResetResponse>, (StatusCode, Json<ApiError>)> {
    let outcome = reset(&api).await.map_err(api_error)?;
    Ok(Json(outcome))
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::{body::Body, http::Request};
    use shared::protocol::EntryConsiderations;
    use tower::ServiceExt;

    #[derive(Default)]
    struct TestPipeline;

    #[async_trait::async_trait]
    impl AnalysisPipeline for TestPipeline {
        async fn extract_pdf_text(&self, _pdf_bytes: &[u8]) -> anyhow::Result<String> {
            Ok("an agritech marketplace for smallholder farms".to_string())
        }

        async fn detect_sectors(&self, _idea: &str) -> anyhow::Result<Vec<String>> {
            Ok(vec!["agritech".to_string(), "logistics".to_string()])
        }

        async fn rank_countries(
            &self,
            _idea: &str,
            top_n: usize,
        ) -> anyhow::Result<Vec<CountryCode>> {
            Ok(["KEN", "VNM", "COL"]
                .into_iter()
                .take(top_n)
                .map(CountryCode::from)
                .collect())
        }

        async fn generate_report(
            &self,
            country_code: &CountryCode,
            sectors: &[String],
            idea: &str,
        ) -> anyhow::Result<CountryReport> {
            Ok(CountryReport {
                country_code: country_code.clone(),
                matched_sectors: sectors.to_vec(),
                startup_desc: idea.to_string(),
                executive_summary: format!("summary for {country_code}"),
                business_environment: Vec::new(),
                infrastructure_and_digital: Vec::new(),
                economic_and_trade_outlook: Vec::new(),
                regulatory_and_risk: Vec::new(),
                entry_considerations: EntryConsiderations::default(),
            })
        }

        async fn render_graphs(
            &self,
            _country_code: &CountryCode,
        ) -> anyhow::Result<Vec<server_api::RenderedGraph>> {
            Ok(GraphCategory::ALL
                .into_iter()
                .map(|category| server_api::RenderedGraph {
                    category,
                    title: category.title().to_string(),
                    png: vec![0x89, 0x50, 0x4e, 0x47],
                })
                .collect())
        }

        async fn answer_question(
            &self,
            question: &str,
            top_countries: &[CountryCode],
        ) -> anyhow::Result<String> {
            Ok(format!(
                "{question} considered across {} countries",
                top_countries.len()
            ))
        }
    }

    async fn test_app() -> Router {
        test_app_with(Arc::new(TestPipeline)).await
    }

    async fn test_app_with(pipeline: Arc<dyn AnalysisPipeline>) -> Router {
        let storage = Storage::new("sqlite::memory:").await.expect("db");
        build_router(ApiContext {
            storage,
            pipeline,
            shortlist_size: 5,
        })
    }

    fn form_request(uri: &str, body: &str) -> Request<Body> {
        Request::post(uri)
            .header(header::CONTENT_TYPE, "application/x-www-form-urlencoded")
            .body(Body::from(body.to_string()))
            .expect("request")
    }

    fn pdf_upload_request(filename: &str) -> Request<Body> {
        let boundary = "test-boundary";
        let body = format!(
            "--{boundary}\r\n\
             Content-Disposition: form-data; name=\"file\"; filename=\"{filename}\"\r\n\
             Content-Type: application/pdf\r\n\r\n\
             %PDF-1.4 stub\r\n\
             --{boundary}--\r\n"
        );
        Request::post("/upload_pdf")
            .header(
                header::CONTENT_TYPE,
                format!("multipart/form-data; boundary={boundary}"),
            )
            .body(Body::from(body))
            .expect("request")
    }

    async fn response_json(response: axum::response::Response) -> serde_json::Value {
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .expect("body");
        serde_json::from_slice(&bytes).expect("json body")
    }

    #[tokio::test]
    async fn healthz_responds_ok() {
        let app = test_app().await;
        let response = app
            .oneshot(
                Request::get("/healthz")
                    .body(Body::empty())
                    .expect("request"),
            )
            .await
            .expect("response");
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn upload_pdf_extracts_text_and_sectors() {
        let app = test_app().await;
        let response = app
            .oneshot(pdf_upload_request("pitch_deck.pdf"))
            .await
            .expect("response");
        assert_eq!(response.status(), StatusCode::OK);

        let body = response_json(response).await;
        assert_eq!(body["text"], "an agritech marketplace for smallholder farms");
        assert_eq!(body["sectors"][0], "agritech");
        assert_eq!(body["session_id"].as_str().expect("session id").len(), 12);
    }

    #[tokio::test]
    async fn upload_pdf_rejects_non_pdf_filename() {
        let app = test_app().await;
        let response = app
            .oneshot(pdf_upload_request("notes.txt"))
            .await
            .expect("response");
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn upload_pdf_without_file_part_is_rejected() {
        let app = test_app().await;
        let boundary = "test-boundary";
        let body = format!(
            "--{boundary}\r\n\
             Content-Disposition: form-data; name=\"other\"\r\n\r\n\
             hello\r\n\
             --{boundary}--\r\n"
        );
        let request = Request::post("/upload_pdf")
            .header(
                header::CONTENT_TYPE,
                format!("multipart/form-data; boundary={boundary}"),
            )
            .body(Body::from(body))
            .expect("request");
        let response = app.oneshot(request).await.expect("response");
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn submit_text_requires_nonblank_text() {
        let app = test_app().await;
        let response = app
            .oneshot(form_request("/submit_text", "text="))
            .await
            .expect("response");
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn submit_text_returns_detected_sectors() {
        let app = test_app().await;
        let response = app
            .oneshot(form_request("/submit_text", "text=farm+produce+delivery"))
            .await
            .expect("response");
        assert_eq!(response.status(), StatusCode::OK);

        let body = response_json(response).await;
        assert_eq!(body["text"], "farm produce delivery");
        assert_eq!(
            body["sectors"],
            serde_json::json!(["agritech", "logistics"])
        );
    }

    #[tokio::test]
    async fn run_pipeline_then_get_reports_returns_rank_order() {
        let app = test_app().await;
        let response = app
            .clone()
            .oneshot(form_request("/run_pipeline", "idea=farm+produce+delivery"))
            .await
            .expect("response");
        assert_eq!(response.status(), StatusCode::OK);
        let body = response_json(response).await;
        assert_eq!(
            body["top_countries"],
            serde_json::json!(["KEN", "VNM", "COL"])
        );

        let response = app
            .oneshot(
                Request::get("/get_reports")
                    .body(Body::empty())
                    .expect("request"),
            )
            .await
            .expect("response");
        assert_eq!(response.status(), StatusCode::OK);
        let reports = response_json(response).await;
        let codes: Vec<&str> = reports
            .as_array()
            .expect("array body")
            .iter()
            .map(|report| report["country_code"].as_str().expect("code"))
            .collect();
        assert_eq!(codes, vec!["KEN", "VNM", "COL"]);
    }

    #[tokio::test]
    async fn get_graph_serves_png_and_unknown_category_is_404() {
        let app = test_app().await;
        app.clone()
            .oneshot(form_request("/run_pipeline", "idea=farm+produce+delivery"))
            .await
            .expect("pipeline response");

        let response = app
            .clone()
            .oneshot(
                Request::get("/get_graph/KEN/ease_of_doing_business")
                    .body(Body::empty())
                    .expect("request"),
            )
            .await
            .expect("response");
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(
            response
                .headers()
                .get(header::CONTENT_TYPE)
                .expect("header"),
            "image/png"
        );

        let response = app
            .clone()
            .oneshot(
                Request::get("/get_graph/KEN/unknown_category")
                    .body(Body::empty())
                    .expect("request"),
            )
            .await
            .expect("response");
        assert_eq!(response.status(), StatusCode::NOT_FOUND);

        let response = app
            .oneshot(
                Request::get("/get_graph/ZZZ/ease_of_doing_business")
                    .body(Body::empty())
                    .expect("request"),
            )
            .await
            .expect("response");
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn chat_forwards_repeated_top_countries() {
        let app = test_app().await;
        let response = app
            .oneshot(form_request(
                "/chat",
                "question=How+hard+is+market+entry%3F&top_countries=KEN&top_countries=VNM",
            ))
            .await
            .expect("response");
        assert_eq!(response.status(), StatusCode::OK);

        let body = response_json(response).await;
        assert_eq!(
            body["response"],
            "How hard is market entry? considered across 2 countries"
        );
    }

    #[tokio::test]
    async fn chat_requires_question() {
        let app = test_app().await;
        let response = app
            .oneshot(form_request("/chat", "top_countries=KEN"))
            .await
            .expect("response");
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn reset_clears_reports_but_keeps_graphs() {
        let app = test_app().await;
        app.clone()
            .oneshot(form_request("/run_pipeline", "idea=farm+produce+delivery"))
            .await
            .expect("pipeline response");

        let response = app
            .clone()
            .oneshot(Request::post("/reset").body(Body::empty()).expect("request"))
            .await
            .expect("response");
        assert_eq!(response.status(), StatusCode::OK);
        let body = response_json(response).await;
        assert_eq!(body["status"], "reset");
        assert_eq!(body["deleted_count"], 3);

        let response = app
            .clone()
            .oneshot(
                Request::get("/get_reports")
                    .body(Body::empty())
                    .expect("request"),
            )
            .await
            .expect("response");
        let reports = response_json(response).await;
        assert_eq!(reports, serde_json::json!([]));

        let response = app
            .oneshot(
                Request::get("/get_graph/KEN/trade_profile")
                    .body(Body::empty())
                    .expect("request"),
            )
            .await
            .expect("response");
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn missing_pipeline_answers_bad_gateway() {
        let app = test_app_with(Arc::new(MissingAnalysisPipeline)).await;
        let response = app
            .oneshot(form_request("/run_pipeline", "idea=farm+produce+delivery"))
            .await
            .expect("response");
        assert_eq!(response.status(), StatusCode::BAD_GATEWAY);
    }
}
