use std::sync::Arc;

use anyhow::anyhow;
use async_trait::async_trait;
use sha2::{Digest, Sha256};
use shared::{
    domain::{CountryCode, GraphCategory, SessionId},
    error::{ApiError, ErrorCode},
    protocol::{
        ChatResponse, CountryReport, ExtractionResponse, ResetResponse, RunPipelineResponse,
    },
};
use storage::{Storage, StoredGraph};
use tracing::info;

#[derive(Clone)]
pub struct ApiContext {
    pub storage: Storage,
    pub pipeline: Arc<dyn AnalysisPipeline>,
    pub shortlist_size: usize,
}

/// Rendered chart for one indicator category, ready to cache.
#[derive(Debug, Clone)]
pub struct RenderedGraph {
    pub category: GraphCategory,
    pub title: String,
    pub png: Vec<u8>,
}

/// Boundary to the analysis backend. Everything that needs a model or a data
/// source lives behind this trait; the HTTP layer only orchestrates caching.
#[async_trait]
pub trait AnalysisPipeline: Send + Sync {
    async fn extract_pdf_text(&self, pdf_bytes: &[u8]) -> anyhow::Result<String>;
    async fn detect_sectors(&self, idea: &str) -> anyhow::Result<Vec<String>>;
    async fn rank_countries(&self, idea: &str, top_n: usize) -> anyhow::Result<Vec<CountryCode>>;
    async fn generate_report(
        &self,
        country_code: &CountryCode,
        sectors: &[String],
        idea: &str,
    ) -> anyhow::Result<CountryReport>;
    async fn render_graphs(&self, country_code: &CountryCode)
        -> anyhow::Result<Vec<RenderedGraph>>;
    async fn answer_question(
        &self,
        question: &str,
        top_countries: &[CountryCode],
    ) -> anyhow::Result<String>;
}

/// Stands in when no analysis backend is configured; every call fails with
/// the same explanation instead of panicking deep inside a request handler.
pub struct MissingAnalysisPipeline;

#[async_trait]
impl AnalysisPipeline for MissingAnalysisPipeline {
    async fn extract_pdf_text(&self, _pdf_bytes: &[u8]) -> anyhow::Result<String> {
        Err(missing_backend())
    }

    async fn detect_sectors(&self, _idea: &str) -> anyhow::Result<Vec<String>> {
        Err(missing_backend())
    }

    async fn rank_countries(
        &self,
        _idea: &str,
        _top_n: usize,
    ) -> anyhow::Result<Vec<CountryCode>> {
        Err(missing_backend())
    }

    async fn generate_report(
        &self,
        _country_code: &CountryCode,
        _sectors: &[String],
        _idea: &str,
    ) -> anyhow::Result<CountryReport> {
        Err(missing_backend())
    }

    async fn render_graphs(
        &self,
        _country_code: &CountryCode,
    ) -> anyhow::Result<Vec<RenderedGraph>> {
        Err(missing_backend())
    }

    async fn answer_question(
        &self,
        _question: &str,
        _top_countries: &[CountryCode],
    ) -> anyhow::Result<String> {
        Err(missing_backend())
    }
}

fn missing_backend() -> anyhow::Error {
    anyhow!("analysis pipeline backend is not configured; set pipeline_upstream_url")
}

pub async fn extract_pdf(
    ctx: &ApiContext,
    filename: &str,
    pdf_bytes: &[u8],
) -> Result<ExtractionResponse, ApiError> {
    if !is_pdf_filename(filename) {
        return Err(ApiError::new(
            ErrorCode::Validation,
            "invalid or missing PDF file",
        ));
    }

    let text = ctx
        .pipeline
        .extract_pdf_text(pdf_bytes)
        .await
        .map_err(upstream)?;
    let sectors = ctx.pipeline.detect_sectors(&text).await.map_err(upstream)?;
    let session_id = session_id_for_idea(&text);
    Ok(ExtractionResponse {
        text,
        sectors,
        session_id,
    })
}

pub async fn analyze_text(ctx: &ApiContext, text: &str) -> Result<ExtractionResponse, ApiError> {
    let idea = text.trim();
    if idea.is_empty() {
        return Err(ApiError::new(
            ErrorCode::Validation,
            "business idea text is required",
        ));
    }

    let sectors = ctx.pipeline.detect_sectors(idea).await.map_err(upstream)?;
    Ok(ExtractionResponse {
        text: idea.to_string(),
        sectors,
        session_id: session_id_for_idea(idea),
    })
}

pub async fn run_pipeline(ctx: &ApiContext, idea: &str) -> Result<RunPipelineResponse, ApiError> {
    let idea = idea.trim();
    if idea.is_empty() {
        return Err(ApiError::new(
            ErrorCode::Validation,
            "business idea is required",
        ));
    }

    let sectors = ctx.pipeline.detect_sectors(idea).await.map_err(upstream)?;
    let top_countries = ctx
        .pipeline
        .rank_countries(idea, ctx.shortlist_size)
        .await
        .map_err(upstream)?;

    for (position, country_code) in top_countries.iter().enumerate() {
        let rank = position as i64 + 1;
        ensure_report_cached(ctx, country_code, rank, &sectors, idea).await?;
        ensure_graphs_cached(ctx, country_code).await?;
    }

    Ok(RunPipelineResponse { top_countries })
}

async fn ensure_report_cached(
    ctx: &ApiContext,
    country_code: &CountryCode,
    rank: i64,
    sectors: &[String],
    idea: &str,
) -> Result<(), ApiError> {
    if let Some(stored) = ctx
        .storage
        .report_for_country(country_code)
        .await
        .map_err(internal)?
    {
        let covers_sectors = sectors
            .iter()
            .all(|sector| stored.report.matched_sectors.contains(sector));
        if covers_sectors {
            info!(country = %country_code, rank, "report already cached, moving to new rank");
            ctx.storage
                .update_report_rank(country_code, rank)
                .await
                .map_err(internal)?;
            return Ok(());
        }
    }

    let report = ctx
        .pipeline
        .generate_report(country_code, sectors, idea)
        .await
        .map_err(upstream)?;
    ctx.storage
        .upsert_report(rank, &report)
        .await
        .map_err(internal)?;
    info!(country = %country_code, rank, "report generated and cached");
    Ok(())
}

async fn ensure_graphs_cached(
    ctx: &ApiContext,
    country_code: &CountryCode,
) -> Result<(), ApiError> {
    let cached = ctx
        .storage
        .graph_count_for_country(country_code)
        .await
        .map_err(internal)?;
    if cached >= GraphCategory::ALL.len() as i64 {
        return Ok(());
    }

    let graphs = ctx
        .pipeline
        .render_graphs(country_code)
        .await
        .map_err(upstream)?;
    for graph in &graphs {
        ctx.storage
            .upsert_graph(country_code, graph.category, &graph.title, &graph.png)
            .await
            .map_err(internal)?;
    }
    info!(country = %country_code, graphs = graphs.len(), "graphs rendered and cached");
    Ok(())
}

pub async fn get_reports(ctx: &ApiContext) -> Result<Vec<CountryReport>, ApiError> {
    let stored = ctx.storage.list_reports_by_rank().await.map_err(internal)?;
    Ok(stored.into_iter().map(|record| record.report).collect())
}

pub async fn get_graph(
    ctx: &ApiContext,
    country_code: &CountryCode,
    category: GraphCategory,
) -> Result<StoredGraph, ApiError> {
    ctx.storage
        .load_graph(country_code, category)
        .await
        .map_err(internal)?
        .ok_or_else(|| ApiError::new(ErrorCode::NotFound, "graph not found"))
}

pub async fn chat(
    ctx: &ApiContext,
    question: &str,
    top_countries: &[CountryCode],
) -> Result<ChatResponse, ApiError> {
    if question.trim().is_empty() {
        return Err(ApiError::new(ErrorCode::Validation, "question required"));
    }

    let response = ctx
        .pipeline
        .answer_question(question, top_countries)
        .await
        .map_err(upstream)?;
    Ok(ChatResponse { response })
}

pub async fn reset(ctx: &ApiContext) -> Result<ResetResponse, ApiError> {
    let deleted_count = ctx.storage.delete_all_reports().await.map_err(internal)?;
    info!(deleted_count, "report cache cleared");
    Ok(ResetResponse {
        status: "reset".to_string(),
        deleted_count,
    })
}

/// Content-derived session id: first 12 hex characters of the SHA-256 of the
/// idea text, so resubmitting the same idea lands in the same session.
pub fn session_id_for_idea(idea: &str) -> SessionId {
    let digest = Sha256::digest(idea.as_bytes());
    let mut hex = String::with_capacity(12);
    for byte in &digest[..6] {
        hex.push_str(&format!("{byte:02x}"));
    }
    SessionId(hex)
}

fn is_pdf_filename(filename: &str) -> bool {
    filename
        .rsplit_once('.')
        .map(|(_, extension)| extension.eq_ignore_ascii_case("pdf"))
        .unwrap_or(false)
}

fn internal(err: anyhow::Error) -> ApiError {
    ApiError::new(ErrorCode::Internal, err.to_string())
}

fn upstream(err: anyhow::Error) -> ApiError {
    ApiError::new(ErrorCode::Upstream, err.to_string())
}
