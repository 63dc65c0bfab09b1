use affinity::AffinityError;
use affinity::cli::{Cli, Command};
use affinity::commands;
use affinity::config::load_config;
use affinity::db::default_db_path;
use affinity::engine::Engine;
use affinity::extract::SidecarExtractor;
use affinity::metrics::{self, Event};
use affinity::model::LogisticTrainer;
use clap::Parser;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Instant;

fn run() -> Result<(), AffinityError> {
    let cli = Cli::parse();
    let start = Instant::now();
    let db_path = cli.db.unwrap_or_else(default_db_path);
    let config = load_config()?;
    let metrics_config = config.metrics.clone();

    let extractor = Arc::new(SidecarExtractor);
    let engine = Engine::open(
        &db_path,
        config,
        extractor.clone(),
        extractor.clone(),
        Arc::new(LogisticTrainer),
    )?;

    let mut events: Vec<Event> = Vec::new();
    let result = match &cli.command {
        Command::Prefs(cmd) => commands::handle_prefs(&engine, cmd),
        Command::Reference(cmd) => commands::handle_reference(&engine, extractor.as_ref(), cmd),
        Command::Classify(args) => commands::handle_classify(&engine, args, &mut events),
        Command::Feedback(args) => commands::handle_feedback(&engine, args, &mut events),
        Command::Unfeedback(args) => commands::handle_unfeedback(&engine, args.id),
        Command::Delete(args) => commands::handle_delete(&engine, args.id),
        Command::History(args) => commands::handle_history(&engine, args),
        Command::Stats(args) => commands::handle_stats(&engine, args),
        Command::Train(args) => commands::handle_train(&engine, args.pref, &mut events),
        Command::Cancel(args) => commands::handle_cancel(&engine, args.id),
        Command::Jobs(args) => commands::handle_jobs(&engine, args),
        Command::Versions(args) => commands::handle_versions(&engine, args.pref),
        Command::Activate(args) => commands::handle_activate(&engine, args.id),
    };

    metrics::record_command(&metrics_config, cli.command.name(), &events, start);
    result
}

fn main() -> ExitCode {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("warn")).init();

    match run() {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("affinity: {e}");
            ExitCode::from(1)
        }
    }
}
