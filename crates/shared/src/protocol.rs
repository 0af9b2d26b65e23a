use serde::{Deserialize, Serialize};

use crate::domain::{CountryCode, SessionId};

/// Response for both idea-extraction endpoints: PDF upload and raw text.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExtractionResponse {
    pub text: String,
    pub sectors: Vec<String>,
    pub session_id: SessionId,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunPipelineResponse {
    pub top_countries: Vec<CountryCode>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatResponse {
    pub response: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResetResponse {
    pub status: String,
    pub deleted_count: u64,
}

/// One generated country report. Every section is optional on the wire;
/// older documents in the cache may predate newer fields.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CountryReport {
    pub country_code: CountryCode,
    #[serde(default)]
    pub matched_sectors: Vec<String>,
    #[serde(default)]
    pub startup_desc: String,
    #[serde(default)]
    pub executive_summary: String,
    #[serde(default)]
    pub business_environment: Vec<String>,
    #[serde(default)]
    pub infrastructure_and_digital: Vec<String>,
    #[serde(default)]
    pub economic_and_trade_outlook: Vec<String>,
    #[serde(default)]
    pub regulatory_and_risk: Vec<String>,
    #[serde(default)]
    pub entry_considerations: EntryConsiderations,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EntryConsiderations {
    #[serde(default)]
    pub market_opportunity_signals: Vec<String>,
    #[serde(default)]
    pub go_to_market_advice: Vec<String>,
}
