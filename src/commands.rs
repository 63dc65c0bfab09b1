//! CLI command handlers. Summaries go to stderr as `affinity: ...` lines,
//! ids and JSON to stdout.

use crate::AffinityError;
use crate::cli::{
    ClassifyArgs, FeedbackArgs, HistoryArgs, ImportArgs, PrefFilterArgs, PrefsCommand,
    ReferenceAddArgs, ReferenceCommand,
};
use crate::engine::{CandidateInput, Engine};
use crate::extract::FeatureExtractor;
use crate::ledger::{self, Feedback, HistoryFilter};
use crate::metrics::Event;
use crate::preferences::{self, Polarity, PreferenceDoc};
use crate::training::{self, JobStatus};
use serde::Serialize;
use std::path::Path;

fn print_json<T: Serialize>(value: &T) -> Result<(), AffinityError> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

fn read_doc(path: &Path) -> Result<PreferenceDoc, AffinityError> {
    let content = std::fs::read_to_string(path)?;
    let is_json = path.extension().is_some_and(|e| e == "json");
    if is_json {
        Ok(serde_json::from_str(&content)?)
    } else {
        toml::from_str(&content)
            .map_err(|e| AffinityError::Invalid(format!("{}: {e}", path.display())))
    }
}

fn handle_import(engine: &Engine, args: &ImportArgs) -> Result<(), AffinityError> {
    let doc = read_doc(&args.file)?;
    match args.replace {
        Some(id) => {
            engine.with_conn(|c| preferences::replace_preference(c, id, &doc))?;
            eprintln!("affinity: replaced preference {id} ({})", doc.name);
            println!("{id}");
        }
        None => {
            let id = engine.with_conn(|c| preferences::create_preference(c, &doc))?;
            eprintln!("affinity: created preference {id} ({})", doc.name);
            println!("{id}");
        }
    }
    Ok(())
}

pub fn handle_prefs(engine: &Engine, cmd: &PrefsCommand) -> Result<(), AffinityError> {
    match cmd {
        PrefsCommand::Import(args) => handle_import(engine, args),
        PrefsCommand::Show(args) => {
            let prefs = engine.with_conn(|c| preferences::load_preference(c, args.id))?;
            print_json(&prefs)
        }
        PrefsCommand::List => {
            let all = engine.with_conn(preferences::list_preferences)?;
            if all.is_empty() {
                eprintln!("affinity: no preferences");
            }
            for p in all {
                println!("{}\t{}\t{} references", p.id, p.name, p.references);
            }
            Ok(())
        }
    }
}

pub fn handle_reference(
    engine: &Engine,
    extractor: &dyn FeatureExtractor,
    cmd: &ReferenceCommand,
) -> Result<(), AffinityError> {
    match cmd {
        ReferenceCommand::Add(args) => handle_reference_add(engine, extractor, args),
        ReferenceCommand::Remove(args) => {
            engine.with_conn(|c| preferences::remove_reference(c, args.id))?;
            eprintln!("affinity: removed reference {}", args.id);
            Ok(())
        }
        ReferenceCommand::List(args) => {
            let refs = engine.with_conn(|c| preferences::list_references(c, args.pref))?;
            for r in refs {
                println!(
                    "{}\t{}\t{}\t{}\t{} dims",
                    r.id,
                    r.polarity.as_str(),
                    r.category,
                    r.label.as_deref().unwrap_or("-"),
                    r.vector.len()
                );
            }
            Ok(())
        }
    }
}

fn handle_reference_add(
    engine: &Engine,
    extractor: &dyn FeatureExtractor,
    args: &ReferenceAddArgs,
) -> Result<(), AffinityError> {
    let vector: Vec<f32> = match (&args.image, &args.vector) {
        (Some(image), _) => extractor.image_vector(image)?,
        (None, Some(raw)) => serde_json::from_str(raw)?,
        (None, None) => {
            return Err(AffinityError::Invalid(
                "reference needs --image or --vector".into(),
            ));
        }
    };
    let polarity = if args.negative {
        Polarity::Negative
    } else {
        Polarity::Positive
    };
    let label = args
        .label
        .clone()
        .or_else(|| args.image.as_ref().map(|p| p.display().to_string()));

    let id = engine.with_conn(|c| {
        preferences::add_reference(
            c,
            args.pref,
            polarity,
            &vector,
            label.as_deref(),
            args.category.as_deref(),
        )
    })?;
    eprintln!(
        "affinity: added {} reference {id} to preference {}",
        polarity.as_str(),
        args.pref
    );
    println!("{id}");
    Ok(())
}

pub fn handle_classify(
    engine: &Engine,
    args: &ClassifyArgs,
    events: &mut Vec<Event>,
) -> Result<(), AffinityError> {
    let artifact = args
        .artifact
        .clone()
        .or_else(|| args.images.first().map(|p| p.display().to_string()))
        .unwrap_or_else(|| "-".into());
    let input = CandidateInput {
        artifact,
        images: args.images.clone(),
        bio: args.bio.clone(),
        name: args.name.clone(),
        age: args.age,
    };

    let result = engine.classify_input(&input, args.pref)?;
    events.push(Event::Classified {
        matched: result.is_match,
    });
    eprintln!(
        "affinity: result {} {} ({:.2})",
        result.id,
        result.recommendation.as_str(),
        result.confidence
    );
    print_json(&result)
}

pub fn handle_feedback(
    engine: &Engine,
    args: &FeedbackArgs,
    events: &mut Vec<Event>,
) -> Result<(), AffinityError> {
    let label = Feedback::parse(&args.label)?;
    let result = engine.submit_feedback(args.id, label)?;
    events.push(Event::Feedback {
        label: label.as_str(),
    });
    eprintln!("affinity: result {} labeled {}", result.id, label.as_str());
    Ok(())
}

pub fn handle_unfeedback(engine: &Engine, id: i64) -> Result<(), AffinityError> {
    engine.remove_feedback(id)?;
    eprintln!("affinity: cleared feedback on result {id}");
    Ok(())
}

pub fn handle_delete(engine: &Engine, id: i64) -> Result<(), AffinityError> {
    engine.delete_result(id)?;
    eprintln!("affinity: deleted result {id}");
    Ok(())
}

pub fn handle_history(engine: &Engine, args: &HistoryArgs) -> Result<(), AffinityError> {
    let filter = HistoryFilter {
        preference_id: args.pref,
        matches_only: args.matches,
        labeled_only: args.labeled,
        limit: args.limit,
        offset: args.offset,
    };
    let rows = engine.with_conn(|c| ledger::history(c, &filter))?;
    if rows.is_empty() {
        eprintln!("affinity: no results");
    }
    for r in rows {
        println!(
            "{}\t{}\t{:.2}\t{}\t{}\t{}",
            r.id,
            r.preference_id,
            r.confidence,
            r.recommendation.as_str(),
            r.feedback.map(Feedback::as_str).unwrap_or("-"),
            r.artifact
        );
    }
    Ok(())
}

pub fn handle_stats(engine: &Engine, args: &PrefFilterArgs) -> Result<(), AffinityError> {
    let s = engine.with_conn(|c| ledger::stats(c, args.pref))?;
    eprintln!(
        "affinity: {} results, {} matches ({:.0}%), avg confidence {:.2}",
        s.total,
        s.matches,
        s.match_rate * 100.0,
        s.average_confidence
    );
    eprintln!(
        "affinity: feedback {} (like {}, dislike {}, super_like {})",
        s.labeled, s.likes, s.dislikes, s.super_likes
    );
    print_json(&s)
}

/// Runs the job in the foreground. `affinity cancel <job>` from another
/// shell stops it at the next progress check.
pub fn handle_train(
    engine: &Engine,
    pref: i64,
    events: &mut Vec<Event>,
) -> Result<(), AffinityError> {
    let job = engine.train_blocking(pref)?;
    events.push(Event::TrainingJob {
        status: job.status.as_str(),
    });
    match job.status {
        JobStatus::Completed => {
            let version = job.model_version_id.unwrap_or_default();
            eprintln!(
                "affinity: job {} completed, version {version} ready (run `affinity activate {version}`)",
                job.id
            );
            println!("{version}");
            Ok(())
        }
        JobStatus::Cancelled => {
            eprintln!("affinity: job {} cancelled", job.id);
            Ok(())
        }
        _ => Err(AffinityError::TrainingFailed(
            job.error.unwrap_or_else(|| format!("job {} ended {}", job.id, job.status.as_str())),
        )),
    }
}

pub fn handle_cancel(engine: &Engine, id: i64) -> Result<(), AffinityError> {
    let job = engine.cancel_training(id)?;
    eprintln!("affinity: job {} {}", job.id, job.status.as_str());
    Ok(())
}

pub fn handle_jobs(engine: &Engine, args: &PrefFilterArgs) -> Result<(), AffinityError> {
    let jobs = engine.with_conn(|c| training::list_jobs(c, args.pref))?;
    if jobs.is_empty() {
        eprintln!("affinity: no training jobs");
    }
    for j in jobs {
        println!(
            "{}\t{}\t{}\t{}/{}\t{}",
            j.id,
            j.preference_id,
            j.status.as_str(),
            j.processed_samples,
            j.total_samples,
            j.error.as_deref().unwrap_or("")
        );
    }
    Ok(())
}

pub fn handle_versions(engine: &Engine, pref: i64) -> Result<(), AffinityError> {
    for v in engine.list_versions(pref)? {
        let accuracy = v
            .validation_accuracy
            .map(|a| format!("{a:.3}"))
            .unwrap_or_else(|| "-".into());
        println!(
            "{}\tv{}\t{}\t{}\tpredictions={}\tlikes={}\tdislikes={}\tsuper_likes={}\tval_acc={}{}",
            v.id,
            v.version_number,
            v.family,
            v.status.as_str(),
            v.total_predictions,
            v.likes,
            v.dislikes,
            v.super_likes,
            accuracy,
            v.failure_reason
                .as_deref()
                .map(|r| format!("\t{r}"))
                .unwrap_or_default()
        );
    }
    Ok(())
}

pub fn handle_activate(engine: &Engine, id: i64) -> Result<(), AffinityError> {
    let v = engine.activate_version(id)?;
    eprintln!(
        "affinity: version {} (v{}) active for preference {}",
        v.id, v.version_number, v.preference_id
    );
    Ok(())
}
