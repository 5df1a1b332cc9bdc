use std::sync::Arc;

use anyhow::Result;
use chrono::{DateTime, Utc};
use grouplog_core::{
    emit_result, HandleMode, IngestRequest, Ingestor, ProgressSink, ProgressUpdate, RunOutcome,
    RunSummary, Stage, StdoutProgress,
};
use indicatif::ProgressBar;
use serde_json::json;
use tokio_util::sync::CancellationToken;

use crate::commands::App;
use crate::paths;
use crate::ui;

pub struct IngestArgs {
    pub conversation: String,
    pub account: String,
    pub since: Option<DateTime<Utc>>,
    pub until: Option<DateTime<Utc>>,
    pub full: bool,
    pub no_reactions: bool,
    pub no_media: bool,
    pub primary: bool,
    pub json: bool,
}

fn bar_sink(bar: ProgressBar) -> impl ProgressSink {
    move |update: &ProgressUpdate| {
        if let Some(total) = update.estimated_total {
            bar.set_length(total);
        }
        bar.set_position(update.processed + update.skipped + update.errored);
        let stage = match update.stage {
            Stage::Resolving => "resolving",
            Stage::Counting => "counting",
            Stage::Fetching => "fetching",
            Stage::Reactions => "reactions",
            Stage::Attachments => "attachments",
            Stage::Finished => "done",
        };
        bar.set_message(stage.to_string());
    }
}

pub async fn run(args: IngestArgs) -> Result<()> {
    let app = App::open().await?;
    let media_root = app.settings.media_root(&app.paths);

    let request = IngestRequest {
        since: args.since,
        until: args.until,
        full_rescan: args.full,
        reactions: args.no_reactions.then_some(false),
        attachments: args.no_media.then_some(false),
        handle_mode: if args.primary {
            HandleMode::Primary
        } else {
            HandleMode::Ephemeral
        },
        ..IngestRequest::new(&args.account, &args.conversation)
    };

    let cancel = CancellationToken::new();
    let on_signal = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("interrupt received, stopping after the current item");
            on_signal.cancel();
        }
    });

    let bar = (!args.json).then(|| ui::progress_bar("resolving"));
    let sink: Arc<dyn ProgressSink> = match &bar {
        Some(bar) => Arc::new(bar_sink(bar.clone())),
        None => Arc::new(StdoutProgress),
    };

    let ingestor = Ingestor::new(
        app.sessions.clone(),
        app.store.clone(),
        app.settings.clone(),
        media_root.clone(),
    )
    .with_progress(sink);
    let result = ingestor.ingest(&request, cancel).await;
    if let Some(bar) = &bar {
        bar.finish_and_clear();
    }

    let summary = match result {
        Ok(summary) => summary,
        Err(e) => {
            let partial = e.partial_summary();
            if args.json {
                emit_result(
                    "ingest",
                    "failed",
                    json!({ "error": e.root_cause().to_string(), "summary": partial }),
                );
            } else {
                ui::error(&e.root_cause().to_string());
                if let Some(summary) = partial {
                    print_counts(summary, &media_root);
                }
            }
            return Err(e.into());
        }
    };

    if args.json {
        emit_result("ingest", summary.outcome.as_str(), serde_json::to_value(&summary)?);
    } else {
        print_summary(&summary, &media_root);
    }
    Ok(())
}

fn print_summary(summary: &RunSummary, media_root: &std::path::Path) {
    let title = summary
        .conversation_title
        .clone()
        .unwrap_or_else(|| "conversation".to_string());
    let elapsed = (summary.finished_at - summary.started_at).num_seconds();

    match summary.outcome {
        RunOutcome::Completed => ui::success(&format!("{} ingested in {}s", title, elapsed)),
        RunOutcome::Cancelled => ui::warn(&format!("{} cancelled; rerun to continue", title)),
        RunOutcome::BudgetExhausted => {
            ui::warn(&format!("{} hit the run time limit; rerun to continue", title))
        }
        RunOutcome::Interrupted => {
            ui::warn(&format!("{} interrupted by a platform error; rerun to continue", title))
        }
        RunOutcome::Failed => ui::error(&format!("{} failed", title)),
    }
    print_counts(summary, media_root);
}

fn print_counts(summary: &RunSummary, media_root: &std::path::Path) {
    let counts = summary.counts;
    ui::info(&format!(
        "{} new, {} already stored, {} errors",
        counts.processed, counts.skipped, counts.errored
    ));
    if summary.reactions_stored > 0 {
        ui::info(&format!("{} reactions", summary.reactions_stored));
    }
    if summary.attachments_saved > 0 {
        ui::info(&format!(
            "{} attachments under {}",
            summary.attachments_saved,
            paths::display(media_root)
        ));
    }
    if let Some(position) = summary.last_fetch_position {
        ui::info(&ui::dim(&format!("up to {}", position.format("%Y-%m-%d %H:%M UTC"))));
    }
}
