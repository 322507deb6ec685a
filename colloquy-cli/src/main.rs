//! Colloquy terminal host.
//!
//! Runs one live voice session against the configured endpoint: microphone in,
//! agent speech out, transcripts and citations on stdout. Ctrl-C stops the
//! session cleanly. Logs go to stderr so the transcript stream stays readable.

mod settings;

use std::io::Write;
use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use tokio::sync::broadcast::error::RecvError;
use tracing::debug;
use tracing_subscriber::EnvFilter;

use colloquy_core::{
    CredentialSelector, LiveSession, SessionPhase, TranscriptEvent, WsConnector,
};
use settings::{default_settings_path, load_settings, API_KEY_ENV};

/// Selector for a terminal host: there is no picker to open, so remediation
/// is instructions on stderr.
struct TerminalSelector;

#[async_trait]
impl CredentialSelector for TerminalSelector {
    fn has_credential(&self) -> bool {
        std::env::var(API_KEY_ENV)
            .map(|v| !v.trim().is_empty())
            .unwrap_or(false)
    }

    async fn select_credential(&self) -> colloquy_core::error::Result<()> {
        eprintln!();
        eprintln!("A valid API key is required for the live session.");
        eprintln!("Set {API_KEY_ENV} (or add \"apiKey\" to your settings file) and run again.");
        Ok(())
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let settings_path = default_settings_path();
    let settings = load_settings(&settings_path);
    debug!(path = %settings_path.display(), "settings loaded");

    // Credential preflight: remediate before dialing, not after. The env
    // var is already folded into the settings, so a missing key here means
    // the selector has nothing either.
    let selector = Arc::new(TerminalSelector);
    let Some(api_key) = settings.api_key.clone() else {
        selector.select_credential().await.ok();
        std::process::exit(1);
    };

    let connector = match settings.endpoint.as_deref() {
        Some(endpoint) => WsConnector::with_endpoint(api_key, endpoint),
        None => WsConnector::new(api_key),
    };

    let session = Arc::new(LiveSession::new(
        settings.session_config(),
        Arc::new(connector),
        selector,
    ));

    let printer = tokio::spawn(print_events(Arc::clone(&session)));

    eprintln!("Connecting… (Ctrl-C to stop)");
    if let Err(e) = session.start().await {
        // The printer already surfaced the user-facing message.
        debug!("session start failed: {e}");
        printer.await.ok();
        std::process::exit(1);
    }

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            eprintln!();
            eprintln!("Stopping…");
            session.stop().await.ok();
        }
        _ = wait_for_terminal_state(Arc::clone(&session)) => {}
    }

    printer.await.ok();

    let uplink = session.uplink_snapshot();
    debug!(
        sent = uplink.chunks_sent,
        dropped = uplink.chunks_dropped,
        "uplink totals"
    );
    Ok(())
}

async fn wait_for_terminal_state(session: Arc<LiveSession>) {
    let mut state_rx = session.subscribe_state();
    loop {
        match state_rx.recv().await {
            Ok(event) if matches!(event.phase, SessionPhase::Error | SessionPhase::Closed) => {
                return;
            }
            Ok(_) => {}
            Err(RecvError::Lagged(_)) => {}
            Err(RecvError::Closed) => return,
        }
    }
}

/// Render state changes, transcripts, and citations as they stream in.
async fn print_events(session: Arc<LiveSession>) {
    let mut state_rx = session.subscribe_state();
    let mut transcript_rx = session.subscribe_transcript();

    let mut printed = Printed::default();

    loop {
        tokio::select! {
            event = state_rx.recv() => match event {
                Ok(event) => {
                    match event.phase {
                        SessionPhase::Active => eprintln!("Connected — start talking."),
                        SessionPhase::Error => {
                            printed.flush_line();
                            eprintln!("{}", event.detail.unwrap_or_else(|| "Session error.".into()));
                        }
                        SessionPhase::Closed => {
                            printed.flush_line();
                            eprintln!("Session closed.");
                        }
                        _ => {}
                    }
                    if matches!(event.phase, SessionPhase::Error | SessionPhase::Closed) {
                        return;
                    }
                }
                Err(RecvError::Lagged(skipped)) => debug!("state stream lagged by {skipped}"),
                Err(RecvError::Closed) => return,
            },

            event = transcript_rx.recv() => match event {
                Ok(event) => printed.render(&event),
                Err(RecvError::Lagged(skipped)) => debug!("transcript stream lagged by {skipped}"),
                Err(RecvError::Closed) => return,
            },
        }
    }
}

/// Tracks what is already on screen so snapshots print as deltas.
#[derive(Default)]
struct Printed {
    user: String,
    agent_chars: usize,
    citations: usize,
    searching: bool,
    mid_line: bool,
}

impl Printed {
    fn render(&mut self, event: &TranscriptEvent) {
        if event.user_utterance != self.user && !event.user_utterance.is_empty() {
            self.flush_line();
            println!("you: {}", event.user_utterance);
            self.user = event.user_utterance.clone();
        }

        if event.searching && !self.searching {
            self.flush_line();
            println!("[searching the web…]");
        }
        self.searching = event.searching;

        // Agent text accumulates for the whole session; print the new tail.
        let agent = &event.agent_utterance;
        if agent.len() > self.agent_chars {
            if !self.mid_line {
                print!("agent: ");
            }
            print!("{}", &agent[self.agent_chars..]);
            std::io::stdout().flush().ok();
            self.agent_chars = agent.len();
            self.mid_line = true;
        }

        if event.citations.len() < self.citations {
            // Cleared by a new user turn.
            self.citations = 0;
        }
        for citation in &event.citations[self.citations..] {
            self.flush_line();
            match &citation.title {
                Some(title) => println!("  source: {title} <{}>", citation.uri),
                None => println!("  source: <{}>", citation.uri),
            }
        }
        self.citations = event.citations.len();
    }

    fn flush_line(&mut self) {
        if self.mid_line {
            println!();
            self.mid_line = false;
        }
    }
}
