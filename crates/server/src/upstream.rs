use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use server_api::{AnalysisPipeline, RenderedGraph};
use shared::{
    domain::{CountryCode, GraphCategory},
    protocol::CountryReport,
};

/// Forwards every analysis concern to the configured model service: one
/// endpoint per concern, graphs fetched as raw PNGs with one request per
/// indicator category.
pub struct UpstreamPipeline {
    http: Client,
    base_url: String,
}

#[derive(Debug, Serialize)]
struct IdeaRequest<'a> {
    idea: &'a str,
}

#[derive(Debug, Deserialize)]
struct ExtractTextResponse {
    text: String,
}

#[derive(Debug, Deserialize)]
struct SectorsResponse {
    sectors: Vec<String>,
}

#[derive(Debug, Serialize)]
struct ShortlistRequest<'a> {
    idea: &'a str,
    top_n: usize,
}

#[derive(Debug, Deserialize)]
struct ShortlistResponse {
    top_countries: Vec<CountryCode>,
}

#[derive(Debug, Serialize)]
struct ReportRequest<'a> {
    country_code: &'a CountryCode,
    sectors: &'a [String],
    idea: &'a str,
}

#[derive(Debug, Serialize)]
struct AnswerRequest<'a> {
    question: &'a str,
    top_countries: &'a [CountryCode],
}

#[derive(Debug, Deserialize)]
struct AnswerResponse {
    response: String,
}

impl UpstreamPipeline {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            http: Client::new(),
            base_url: base_url.into(),
        }
    }
}

#[async_trait]
impl AnalysisPipeline for UpstreamPipeline {
    async fn extract_pdf_text(&self, pdf_bytes: &[u8]) -> anyhow::Result<String> {
        let body: ExtractTextResponse = self
            .http
            .post(format!("{}/extract", self.base_url))
            .header(reqwest::header::CONTENT_TYPE, "application/pdf")
            .body(pdf_bytes.to_vec())
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;
        Ok(body.text)
    }

    async fn detect_sectors(&self, idea: &str) -> anyhow::Result<Vec<String>> {
        let body: SectorsResponse = self
            .http
            .post(format!("{}/sectors", self.base_url))
            .json(&IdeaRequest { idea })
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;
        Ok(body.sectors)
    }

    async fn rank_countries(&self, idea: &str, top_n: usize) -> anyhow::Result<Vec<CountryCode>> {
        let body: ShortlistResponse = self
            .http
            .post(format!("{}/shortlist", self.base_url))
            .json(&ShortlistRequest { idea, top_n })
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;
        Ok(body.top_countries)
    }

    async fn generate_report(
        &self,
        country_code: &CountryCode,
        sectors: &[String],
        idea: &str,
    ) -> anyhow::Result<CountryReport> {
        let report = self
            .http
            .post(format!("{}/report", self.base_url))
            .json(&ReportRequest {
                country_code,
                sectors,
                idea,
            })
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;
        Ok(report)
    }

    async fn render_graphs(
        &self,
        country_code: &CountryCode,
    ) -> anyhow::Result<Vec<RenderedGraph>> {
        let mut graphs = Vec::with_capacity(GraphCategory::ALL.len());
        for category in GraphCategory::ALL {
            let png = self
                .http
                .get(format!(
                    "{}/graphs/{}/{}",
                    self.base_url,
                    country_code,
                    category.as_str()
                ))
                .send()
                .await?
                .error_for_status()?
                .bytes()
                .await?;
            graphs.push(RenderedGraph {
                category,
                title: category.title().to_string(),
                png: png.to_vec(),
            });
        }
        Ok(graphs)
    }

    async fn answer_question(
        &self,
        question: &str,
        top_countries: &[CountryCode],
    ) -> anyhow::Result<String> {
        let body: AnswerResponse = self
            .http
            .post(format!("{}/answer", self.base_url))
            .json(&AnswerRequest {
                question,
                top_countries,
            })
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;
        Ok(body.response)
    }
}
