use std::{path::PathBuf, sync::Arc};

use anyhow::Result;
use clap::{Parser, Subcommand};
use client_core::{
    ChatRole, DurableStateStore, PdfUpload, SessionCommand, SessionController, SessionEvent,
};
use shared::domain::CountryCode;

#[derive(Parser, Debug)]
struct Cli {
    #[arg(long, default_value = "http://127.0.0.1:8000")]
    server_url: String,
    #[arg(long, default_value = "sqlite://./data/client_state.db")]
    state_db: String,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Analyze an idea, rank candidate markets and render report cards.
    Submit {
        #[arg(long)]
        idea: Option<String>,
        /// Pitch deck to extract the idea from instead of typing it.
        #[arg(long)]
        pdf: Option<PathBuf>,
    },
    /// Re-render the cached report list.
    Reports,
    /// Ask a question about the shortlisted countries.
    Chat { question: String },
    /// Jump to one country's report page.
    Open { country_code: String },
    /// Mark a return from the report page, so the next load re-renders reports.
    Back,
    /// Clear server-side reports and all session state.
    Reset,
    /// Simulate closing the tab.
    Close,
    /// Flip between light and dark themes.
    Theme,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt().init();
    let cli = Cli::parse();

    let state_store = DurableStateStore::initialize(&cli.state_db).await?;
    let controller = SessionController::with_state_store(cli.server_url, state_store.clone());
    let mut events = controller.subscribe_events();

    let outcome = run_command(&controller, &state_store, cli.command).await;

    // View events are printed even when the command itself failed, the same
    // way a page keeps its alerts visible.
    while let Ok(event) = events.try_recv() {
        print_event(event);
    }
    outcome
}

async fn run_command(
    controller: &Arc<SessionController>,
    state_store: &Arc<DurableStateStore>,
    command: Command,
) -> Result<()> {
    // Every invocation starts like a fresh page load.
    controller.load().await?;

    match command {
        Command::Submit { idea, pdf } => {
            let pdf = match pdf {
                Some(path) => Some(PdfUpload {
                    filename: path
                        .file_name()
                        .and_then(|name| name.to_str())
                        .unwrap_or("upload.pdf")
                        .to_string(),
                    bytes: std::fs::read(&path)?,
                }),
                None => None,
            };
            controller
                .handle(SessionCommand::Submit {
                    idea_text: idea.unwrap_or_default(),
                    pdf,
                })
                .await?;
        }
        Command::Reports => controller.handle(SessionCommand::FetchReports).await?,
        Command::Chat { question } => controller.handle(SessionCommand::Chat { question }).await?,
        Command::Open { country_code } => {
            let url = controller
                .open_report(&CountryCode::from(country_code.as_str()))
                .await?;
            println!("navigate to {url}");
        }
        Command::Back => controller.handle(SessionCommand::ReturnFromReport).await?,
        Command::Reset => controller.handle(SessionCommand::Reset).await?,
        Command::Close => {
            controller
                .handle(SessionCommand::HandleUnload {
                    page_persisted: false,
                })
                .await?;
            let cleared = state_store.end_session().await?;
            println!("session closed; {cleared} stored values dropped");
        }
        Command::Theme => controller.handle(SessionCommand::ToggleTheme).await?,
    }
    Ok(())
}

fn print_event(event: SessionEvent) {
    match event {
        SessionEvent::IdeaFormShown => println!("view: idea form shown"),
        SessionEvent::IdeaFormHidden => println!("view: idea form hidden"),
        SessionEvent::LoadingStarted => println!("view: loading..."),
        SessionEvent::LoadingCleared => println!("view: loading cleared"),
        SessionEvent::ResetControlShown => println!("view: reset control shown"),
        SessionEvent::ResetControlHidden => println!("view: reset control hidden"),
        SessionEvent::IdeaTextReplaced(text) => println!("idea text: {text}"),
        SessionEvent::IdeaTextCleared => println!("idea text cleared"),
        SessionEvent::TopCountryDisplay(name) => println!("top country: {name}"),
        SessionEvent::SectorDisplay(sectors) => println!("sectors: {sectors}"),
        SessionEvent::ReportsRendered(cards) => {
            for card in cards {
                println!(
                    "report #{} {} ({}) -> {}",
                    card.rank, card.country_name, card.country_code, card.detail_url
                );
            }
        }
        SessionEvent::ReportsCleared => println!("reports cleared"),
        SessionEvent::TranscriptAppended(message) => {
            println!("{}: {}", role_label(message.role), message.text)
        }
        SessionEvent::TranscriptCleared => println!("chat cleared"),
        SessionEvent::Alert(text) => println!("alert: {text}"),
        SessionEvent::ThemeChanged(theme) => println!("theme: {}", theme.as_str()),
        SessionEvent::SessionExpired => println!("session expired; server cache cleared"),
    }
}

fn role_label(role: ChatRole) -> &'static str {
    match role {
        ChatRole::User => "you",
        ChatRole::Assistant => "assistant",
        ChatRole::System => "system",
    }
}
