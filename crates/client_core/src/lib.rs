use std::{collections::HashMap, sync::Arc, time::Duration};

use anyhow::{Context, Result};
use async_trait::async_trait;
use reqwest::Client;
use shared::{
    domain::{CountryCode, StateScope},
    protocol::{ChatResponse, CountryReport, ExtractionResponse, RunPipelineResponse},
};
use thiserror::Error;
use tokio::{
    sync::{broadcast, Mutex},
    task::JoinHandle,
};
use tracing::{info, warn};

mod state_store;
pub use state_store::DurableStateStore;

const TOP_COUNTRIES_KEY: &str = "topCountries";
const DETECTED_SECTORS_KEY: &str = "detectedSectors";
const ACTIVE_REPORTS_KEY: &str = "hasActiveReports";
const NAVIGATING_TO_REPORT_KEY: &str = "navigatingToReport";
const BACK_FROM_REPORT_KEY: &str = "backFromReport";
const THEME_KEY: &str = "theme";
// Single-use navigation flags store the literal "1"; the active-reports
// marker stores the literal "true".
const ACTIVE_REPORTS_VALUE: &str = "true";
const FLAG_VALUE: &str = "1";

/// How long a submitted report session may sit untouched before the server
/// cache is cleared on the user's behalf.
pub const DEFAULT_REPORT_EXPIRY: Duration = Duration::from_secs(15 * 60);

/// Key/value port over the two client state scopes: `Session` values live for
/// one working session, `Persistent` values survive it.
#[async_trait]
pub trait StateStore: Send + Sync {
    async fn get(&self, scope: StateScope, key: &str) -> Result<Option<String>>;
    async fn set(&self, scope: StateScope, key: &str, value: &str) -> Result<()>;
    async fn remove(&self, scope: StateScope, key: &str) -> Result<()>;
    /// Get-and-clear, for flags that must only be honored once.
    async fn take(&self, scope: StateScope, key: &str) -> Result<Option<String>>;
}

#[derive(Default)]
pub struct MemoryStateStore {
    values: Mutex<HashMap<(StateScope, String), String>>,
}

#[async_trait]
impl StateStore for MemoryStateStore {
    async fn get(&self, scope: StateScope, key: &str) -> Result<Option<String>> {
        Ok(self
            .values
            .lock()
            .await
            .get(&(scope, key.to_string()))
            .cloned())
    }

    async fn set(&self, scope: StateScope, key: &str, value: &str) -> Result<()> {
        self.values
            .lock()
            .await
            .insert((scope, key.to_string()), value.to_string());
        Ok(())
    }

    async fn remove(&self, scope: StateScope, key: &str) -> Result<()> {
        self.values.lock().await.remove(&(scope, key.to_string()));
        Ok(())
    }

    async fn take(&self, scope: StateScope, key: &str) -> Result<Option<String>> {
        Ok(self.values.lock().await.remove(&(scope, key.to_string())))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkflowPhase {
    Idle,
    Submitting,
    ReportsReady,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Theme {
    Light,
    Dark,
}

impl Theme {
    pub fn as_str(&self) -> &'static str {
        match self {
            Theme::Light => "light",
            Theme::Dark => "dark",
        }
    }

    fn from_stored(raw: &str) -> Theme {
        if raw == "dark" {
            Theme::Dark
        } else {
            Theme::Light
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChatRole {
    User,
    Assistant,
    System,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ChatMessage {
    pub role: ChatRole,
    pub text: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ReportCard {
    pub rank: usize,
    pub country_code: CountryCode,
    pub country_name: String,
    pub detail_url: String,
}

#[derive(Debug, Clone)]
pub struct PdfUpload {
    pub filename: String,
    pub bytes: Vec<u8>,
}

#[derive(Debug, Clone)]
pub enum SessionCommand {
    Load,
    Submit {
        idea_text: String,
        pdf: Option<PdfUpload>,
    },
    FetchReports,
    Reset,
    Chat {
        question: String,
    },
    OpenReport {
        country_code: CountryCode,
    },
    ReturnFromReport,
    HandleUnload {
        page_persisted: bool,
    },
    ToggleTheme,
}

/// View mutations in the order a rendering layer should apply them.
#[derive(Debug, Clone)]
pub enum SessionEvent {
    IdeaFormShown,
    IdeaFormHidden,
    LoadingStarted,
    LoadingCleared,
    ResetControlShown,
    ResetControlHidden,
    IdeaTextReplaced(String),
    IdeaTextCleared,
    TopCountryDisplay(String),
    SectorDisplay(String),
    ReportsRendered(Vec<ReportCard>),
    ReportsCleared,
    TranscriptAppended(ChatMessage),
    TranscriptCleared,
    Alert(String),
    ThemeChanged(Theme),
    SessionExpired,
}

#[derive(Debug, Error)]
pub enum WorkflowError {
    #[error("a submission is already in flight")]
    SubmissionInFlight,
    #[error("pdf extraction failed: {0}")]
    Extraction(String),
    #[error("idea analysis failed: {0}")]
    Analysis(String),
    #[error("country ranking failed: {0}")]
    Ranking(String),
    #[error("report fetch failed: {0}")]
    ReportFetch(String),
    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

pub struct SessionController {
    http: Client,
    server_url: String,
    state_store: Arc<dyn StateStore>,
    inner: Mutex<ControllerState>,
    expiry_task: Mutex<Option<JoinHandle<()>>>,
    expiry_delay: Duration,
    events: broadcast::Sender<SessionEvent>,
}

struct ControllerState {
    phase: WorkflowPhase,
    top_countries: Vec<CountryCode>,
    detected_sectors: Vec<String>,
    transcript: Vec<ChatMessage>,
}

impl SessionController {
    pub fn new(server_url: impl Into<String>) -> Arc<Self> {
        Self::with_state_store(server_url, Arc::new(MemoryStateStore::default()))
    }

    pub fn with_state_store(
        server_url: impl Into<String>,
        state_store: Arc<dyn StateStore>,
    ) -> Arc<Self> {
        Self::with_settings(server_url, state_store, DEFAULT_REPORT_EXPIRY)
    }

    pub fn with_settings(
        server_url: impl Into<String>,
        state_store: Arc<dyn StateStore>,
        expiry_delay: Duration,
    ) -> Arc<Self> {
        let (events, _) = broadcast::channel(256);
        Arc::new(Self {
            http: Client::new(),
            server_url: server_url.into(),
            state_store,
            inner: Mutex::new(ControllerState {
                phase: WorkflowPhase::Idle,
                top_countries: Vec::new(),
                detected_sectors: Vec::new(),
                transcript: Vec::new(),
            }),
            expiry_task: Mutex::new(None),
            expiry_delay,
            events,
        })
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<SessionEvent> {
        self.events.subscribe()
    }

    pub async fn phase(&self) -> WorkflowPhase {
        self.inner.lock().await.phase
    }

    pub async fn top_countries(&self) -> Vec<CountryCode> {
        self.inner.lock().await.top_countries.clone()
    }

    pub async fn detected_sectors(&self) -> Vec<String> {
        self.inner.lock().await.detected_sectors.clone()
    }

    pub async fn transcript(&self) -> Vec<ChatMessage> {
        self.inner.lock().await.transcript.clone()
    }

    pub async fn handle(&self, command: SessionCommand) -> Result<(), WorkflowError> {
        match command {
            SessionCommand::Load => self.load().await,
            SessionCommand::Submit { idea_text, pdf } => self.submit(&idea_text, pdf).await,
            SessionCommand::FetchReports => self.fetch_and_render_reports().await,
            SessionCommand::Reset => self.reset().await,
            SessionCommand::Chat { question } => self.chat(&question).await,
            SessionCommand::OpenReport { country_code } => {
                self.open_report(&country_code).await.map(|_| ())
            }
            SessionCommand::ReturnFromReport => self.return_from_report().await,
            SessionCommand::HandleUnload { page_persisted } => {
                self.handle_unload(page_persisted).await
            }
            SessionCommand::ToggleTheme => self.toggle_theme().await.map(|_| ()),
        }
    }

    /// Page-load analog: consumes navigation flags, restores the persisted
    /// shortlist into memory and, after an in-app return, re-renders reports.
    pub async fn load(&self) -> Result<(), WorkflowError> {
        self.state_store
            .take(StateScope::Session, NAVIGATING_TO_REPORT_KEY)
            .await?;

        if let Some(raw) = self
            .state_store
            .get(StateScope::Persistent, THEME_KEY)
            .await?
        {
            if Theme::from_stored(&raw) == Theme::Dark {
                self.emit(SessionEvent::ThemeChanged(Theme::Dark));
            }
        }

        if let Some(raw) = self
            .state_store
            .get(StateScope::Session, TOP_COUNTRIES_KEY)
            .await?
        {
            let top_countries: Vec<CountryCode> =
                serde_json::from_str(&raw).context("persisted top countries are not valid JSON")?;
            let detected_sectors: Vec<String> = match self
                .state_store
                .get(StateScope::Session, DETECTED_SECTORS_KEY)
                .await?
            {
                Some(raw) => serde_json::from_str(&raw)
                    .context("persisted detected sectors are not valid JSON")?,
                None => Vec::new(),
            };

            info!(
                countries = top_countries.len(),
                "restored shortlist from session state"
            );
            self.emit(SessionEvent::TopCountryDisplay(top_country_display(
                &top_countries,
            )));
            self.emit(SessionEvent::SectorDisplay(join_sectors(&detected_sectors)));

            let mut inner = self.inner.lock().await;
            inner.top_countries = top_countries;
            inner.detected_sectors = detected_sectors;
        }

        if self
            .state_store
            .take(StateScope::Session, BACK_FROM_REPORT_KEY)
            .await?
            .is_some()
        {
            self.emit(SessionEvent::IdeaFormHidden);
            self.emit(SessionEvent::ResetControlShown);
            self.fetch_and_render_reports().await?;
        }

        Ok(())
    }

    /// Runs the whole submission workflow: optional PDF extraction, idea
    /// analysis, country ranking, then report rendering. Rejects a second
    /// submission while one is in flight.
    pub async fn submit(
        &self,
        idea_text: &str,
        pdf: Option<PdfUpload>,
    ) -> Result<(), WorkflowError> {
        {
            let mut inner = self.inner.lock().await;
            if inner.phase == WorkflowPhase::Submitting {
                return Err(WorkflowError::SubmissionInFlight);
            }
            inner.phase = WorkflowPhase::Submitting;
        }

        self.emit(SessionEvent::IdeaFormHidden);
        self.emit(SessionEvent::LoadingStarted);

        let outcome = self.run_submission(idea_text, pdf).await;
        if let Err(err) = &outcome {
            // Report-fetch failures already rolled the view back; the idea
            // form stays hidden in that case.
            if !matches!(err, WorkflowError::ReportFetch(_)) {
                warn!(%err, "submission failed");
                self.emit(SessionEvent::Alert(alert_message(err)));
                self.emit(SessionEvent::LoadingCleared);
                self.emit(SessionEvent::IdeaFormShown);
                self.inner.lock().await.phase = WorkflowPhase::Idle;
            }
        }
        outcome
    }

    async fn run_submission(
        &self,
        idea_text: &str,
        pdf: Option<PdfUpload>,
    ) -> Result<(), WorkflowError> {
        self.state_store
            .set(StateScope::Session, ACTIVE_REPORTS_KEY, ACTIVE_REPORTS_VALUE)
            .await?;
        self.arm_expiry().await;

        let mut idea = idea_text.to_string();
        let mut sectors: Vec<String> = Vec::new();

        if let Some(pdf) = pdf {
            let extraction = self
                .upload_pdf(pdf)
                .await
                .map_err(|err| WorkflowError::Extraction(err.to_string()))?;
            idea = extraction.text;
            sectors = extraction.sectors;
            self.emit(SessionEvent::IdeaTextReplaced(idea.clone()));
        }

        // The text route always runs; its sectors only count when extraction
        // produced none.
        let analysis = self
            .analyze_text(&idea)
            .await
            .map_err(|err| WorkflowError::Analysis(err.to_string()))?;
        if sectors.is_empty() {
            sectors = analysis.sectors;
        }

        self.inner.lock().await.detected_sectors = sectors.clone();
        self.emit(SessionEvent::SectorDisplay(join_sectors(&sectors)));

        let pipeline = self
            .run_pipeline(&idea)
            .await
            .map_err(|err| WorkflowError::Ranking(err.to_string()))?;
        self.inner.lock().await.top_countries = pipeline.top_countries;

        self.fetch_and_render_reports().await
    }

    /// Fetches the cached report list and turns it into ordered cards. On
    /// success the shortlist and sectors are persisted together; on any
    /// failure (error status, malformed body, empty list) the phase rolls
    /// back to Idle and the reset control stays hidden.
    pub async fn fetch_and_render_reports(&self) -> Result<(), WorkflowError> {
        let reports = match self.try_fetch_reports().await {
            Ok(reports) if !reports.is_empty() => reports,
            Ok(_) => return self.fail_report_fetch("report list came back empty").await,
            Err(error) => return self.fail_report_fetch(&error.to_string()).await,
        };

        let cards: Vec<ReportCard> = reports
            .iter()
            .enumerate()
            .map(|(index, report)| ReportCard {
                rank: index + 1,
                country_code: report.country_code.clone(),
                country_name: report.country_code.display_name().to_string(),
                detail_url: format!("report.html?country={}", report.country_code),
            })
            .collect();
        let top_countries: Vec<CountryCode> = reports
            .iter()
            .map(|report| report.country_code.clone())
            .collect();

        let detected_sectors = {
            let mut inner = self.inner.lock().await;
            inner.phase = WorkflowPhase::ReportsReady;
            inner.top_countries = top_countries.clone();
            inner.detected_sectors.clone()
        };

        let top_json =
            serde_json::to_string(&top_countries).context("failed to serialize top countries")?;
        let sectors_json = serde_json::to_string(&detected_sectors)
            .context("failed to serialize detected sectors")?;
        self.state_store
            .set(StateScope::Session, TOP_COUNTRIES_KEY, &top_json)
            .await?;
        self.state_store
            .set(StateScope::Session, DETECTED_SECTORS_KEY, &sectors_json)
            .await?;

        self.emit(SessionEvent::ReportsRendered(cards));
        self.emit(SessionEvent::LoadingCleared);
        self.emit(SessionEvent::ResetControlShown);
        self.emit(SessionEvent::TopCountryDisplay(top_country_display(
            &top_countries,
        )));
        Ok(())
    }

    async fn fail_report_fetch(&self, reason: &str) -> Result<(), WorkflowError> {
        warn!(reason, "report fetch failed");
        self.emit(SessionEvent::Alert(
            "Failed to load reports. Please try again.".to_string(),
        ));
        self.emit(SessionEvent::LoadingCleared);
        self.inner.lock().await.phase = WorkflowPhase::Idle;
        Err(WorkflowError::ReportFetch(reason.to_string()))
    }

    /// Clears the server report cache (best effort), every session-scoped
    /// key, and all in-memory workflow state.
    pub async fn reset(&self) -> Result<(), WorkflowError> {
        self.cancel_expiry().await;
        post_reset_best_effort(&self.http, &self.server_url).await;

        for key in [
            TOP_COUNTRIES_KEY,
            DETECTED_SECTORS_KEY,
            ACTIVE_REPORTS_KEY,
            NAVIGATING_TO_REPORT_KEY,
            BACK_FROM_REPORT_KEY,
        ] {
            self.state_store.remove(StateScope::Session, key).await?;
        }

        {
            let mut inner = self.inner.lock().await;
            inner.phase = WorkflowPhase::Idle;
            inner.top_countries.clear();
            inner.detected_sectors.clear();
            inner.transcript.clear();
        }

        info!("session reset");
        self.emit(SessionEvent::ReportsCleared);
        self.emit(SessionEvent::TranscriptCleared);
        self.emit(SessionEvent::IdeaTextCleared);
        self.emit(SessionEvent::IdeaFormShown);
        self.emit(SessionEvent::ResetControlHidden);
        self.emit(SessionEvent::TopCountryDisplay("N/A".to_string()));
        self.emit(SessionEvent::SectorDisplay("None".to_string()));
        Ok(())
    }

    /// Tab-close analog. An in-app navigation flag means the session is being
    /// handed to the report view, so nothing is torn down and the flag stays
    /// set for the next load. A page going into the back/forward cache keeps
    /// its session too.
    pub async fn handle_unload(&self, page_persisted: bool) -> Result<(), WorkflowError> {
        if self
            .state_store
            .get(StateScope::Session, NAVIGATING_TO_REPORT_KEY)
            .await?
            .is_some()
        {
            return Ok(());
        }
        if page_persisted {
            return Ok(());
        }

        post_reset_best_effort(&self.http, &self.server_url).await;
        for key in [ACTIVE_REPORTS_KEY, TOP_COUNTRIES_KEY, DETECTED_SECTORS_KEY] {
            self.state_store.remove(StateScope::Session, key).await?;
        }
        Ok(())
    }

    /// Marks the jump to a report detail view and returns its address. The
    /// flag keeps the unload handler from treating the navigation as a
    /// departure.
    pub async fn open_report(
        &self,
        country_code: &CountryCode,
    ) -> Result<String, WorkflowError> {
        self.state_store
            .set(StateScope::Session, NAVIGATING_TO_REPORT_KEY, FLAG_VALUE)
            .await?;
        Ok(format!("report.html?country={country_code}"))
    }

    /// Called from the report detail view when the user heads back, so the
    /// next load re-renders the report list instead of the idea form.
    pub async fn return_from_report(&self) -> Result<(), WorkflowError> {
        self.state_store
            .set(StateScope::Session, BACK_FROM_REPORT_KEY, FLAG_VALUE)
            .await?;
        Ok(())
    }

    /// Sends a question about the current shortlist. A failed request turns
    /// into a system line in the transcript rather than an error; blank input
    /// is ignored.
    pub async fn chat(&self, question: &str) -> Result<(), WorkflowError> {
        let question = question.trim();
        if question.is_empty() {
            return Ok(());
        }

        let user_message = ChatMessage {
            role: ChatRole::User,
            text: question.to_string(),
        };
        let top_countries = {
            let mut inner = self.inner.lock().await;
            inner.transcript.push(user_message.clone());
            inner.top_countries.clone()
        };
        self.emit(SessionEvent::TranscriptAppended(user_message));

        let mut form: Vec<(&str, String)> = vec![("question", question.to_string())];
        for code in &top_countries {
            form.push(("top_countries", code.as_str().to_string()));
        }

        let reply = match self.send_chat(&form).await {
            Ok(body) => ChatMessage {
                role: ChatRole::Assistant,
                text: body.response,
            },
            Err(error) => {
                warn!(%error, "chat request failed");
                ChatMessage {
                    role: ChatRole::System,
                    text: "The assistant could not answer. Please try again.".to_string(),
                }
            }
        };

        self.inner.lock().await.transcript.push(reply.clone());
        self.emit(SessionEvent::TranscriptAppended(reply));
        Ok(())
    }

    pub async fn toggle_theme(&self) -> Result<Theme, WorkflowError> {
        let current = self
            .state_store
            .get(StateScope::Persistent, THEME_KEY)
            .await?
            .map(|raw| Theme::from_stored(&raw))
            .unwrap_or(Theme::Light);
        let next = match current {
            Theme::Light => Theme::Dark,
            Theme::Dark => Theme::Light,
        };
        self.state_store
            .set(StateScope::Persistent, THEME_KEY, next.as_str())
            .await?;
        self.emit(SessionEvent::ThemeChanged(next));
        Ok(next)
    }

    /// Arms (or re-arms) the expiry task. When it fires with the
    /// active-reports marker still set, the server cache is cleared and only
    /// that marker is dropped; the rest of the session state stays.
    async fn arm_expiry(&self) {
        let http = self.http.clone();
        let server_url = self.server_url.clone();
        let state_store = Arc::clone(&self.state_store);
        let events = self.events.clone();
        let delay = self.expiry_delay;

        let task = tokio::spawn(async move {
            tokio::time::sleep(delay).await;

            let has_active = matches!(
                state_store.get(StateScope::Session, ACTIVE_REPORTS_KEY).await,
                Ok(Some(value)) if value == ACTIVE_REPORTS_VALUE
            );
            if !has_active {
                return;
            }

            info!("report session expired; clearing server cache");
            post_reset_best_effort(&http, &server_url).await;
            if let Err(error) = state_store
                .remove(StateScope::Session, ACTIVE_REPORTS_KEY)
                .await
            {
                warn!(%error, "failed to clear active-reports marker after expiry");
            }
            let _ = events.send(SessionEvent::SessionExpired);
        });

        let previous = self.expiry_task.lock().await.replace(task);
        if let Some(previous) = previous {
            previous.abort();
        }
    }

    async fn cancel_expiry(&self) {
        if let Some(task) = self.expiry_task.lock().await.take() {
            task.abort();
        }
    }

    fn emit(&self, event: SessionEvent) {
        let _ = self.events.send(event);
    }

    async fn upload_pdf(&self, pdf: PdfUpload) -> Result<ExtractionResponse> {
        let part = reqwest::multipart::Part::bytes(pdf.bytes)
            .file_name(pdf.filename)
            .mime_str("application/pdf")?;
        let form = reqwest::multipart::Form::new().part("file", part);

        let extraction = self
            .http
            .post(format!("{}/upload_pdf", self.server_url))
            .multipart(form)
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;
        Ok(extraction)
    }

    async fn analyze_text(&self, idea: &str) -> Result<ExtractionResponse> {
        let analysis = self
            .http
            .post(format!("{}/submit_text", self.server_url))
            .form(&[("text", idea)])
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;
        Ok(analysis)
    }

    async fn run_pipeline(&self, idea: &str) -> Result<RunPipelineResponse> {
        let outcome = self
            .http
            .post(format!("{}/run_pipeline", self.server_url))
            .form(&[("idea", idea)])
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;
        Ok(outcome)
    }

    async fn try_fetch_reports(&self) -> Result<Vec<CountryReport>> {
        let reports = self
            .http
            .get(format!("{}/get_reports", self.server_url))
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;
        Ok(reports)
    }

    async fn send_chat(&self, form: &[(&str, String)]) -> Result<ChatResponse> {
        let body = self
            .http
            .post(format!("{}/chat", self.server_url))
            .form(form)
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;
        Ok(body)
    }
}

async fn post_reset_best_effort(http: &Client, server_url: &str) {
    match http.post(format!("{server_url}/reset")).send().await {
        Ok(response) if !response.status().is_success() => {
            warn!(status = %response.status(), "reset request was rejected");
        }
        Ok(_) => {}
        Err(error) => warn!(%error, "reset request failed"),
    }
}

fn alert_message(err: &WorkflowError) -> String {
    match err {
        WorkflowError::Extraction(_) => {
            "Could not read the uploaded PDF. Please try again.".to_string()
        }
        WorkflowError::Ranking(_) => {
            "Something went wrong while generating the country shortlist. Please try again."
                .to_string()
        }
        _ => "Something went wrong while analyzing the idea. Please try again.".to_string(),
    }
}

fn join_sectors(sectors: &[String]) -> String {
    if sectors.is_empty() {
        "None".to_string()
    } else {
        sectors.join(", ")
    }
}

fn top_country_display(top_countries: &[CountryCode]) -> String {
    top_countries
        .first()
        .map(|code| code.display_name().to_string())
        .unwrap_or_else(|| "N/A".to_string())
}

#[cfg(test)]
#[path = "tests/lib_tests.rs"]
mod tests;
