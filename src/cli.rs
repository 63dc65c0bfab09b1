use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser)]
#[command(
    name = "affinity",
    version,
    about = "Preference-learning compatibility scorer"
)]
pub struct Cli {
    /// Database path
    #[arg(long, env = "AFFINITY_DB", global = true)]
    pub db: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand)]
pub enum Command {
    /// Manage preference configurations
    #[command(subcommand)]
    Prefs(PrefsCommand),
    /// Manage reference images of a preference
    #[command(subcommand)]
    Reference(ReferenceCommand),
    /// Score a candidate and record the result
    Classify(ClassifyArgs),
    /// Attach feedback (like, dislike, super_like) to a result
    Feedback(FeedbackArgs),
    /// Clear feedback from a result
    Unfeedback(ResultArgs),
    /// Delete a result
    Delete(ResultArgs),
    /// List recent results
    History(HistoryArgs),
    /// Show ledger totals
    Stats(PrefFilterArgs),
    /// Train a new model version from feedback (does not activate it)
    Train(TrainArgs),
    /// Cancel a pending or running training job
    Cancel(JobArgs),
    /// List training jobs
    Jobs(PrefFilterArgs),
    /// List model versions of a preference
    Versions(PrefArgs),
    /// Make a ready or retired version the active one
    Activate(VersionArgs),
}

#[derive(Subcommand)]
pub enum PrefsCommand {
    /// Create (or with --replace, overwrite) a preference from a TOML/JSON file
    Import(ImportArgs),
    /// Print a preference as JSON
    Show(IdArgs),
    /// List preferences
    List,
}

#[derive(Subcommand)]
pub enum ReferenceCommand {
    /// Add a reference vector from an image sidecar or inline JSON
    Add(ReferenceAddArgs),
    /// Remove a reference by id
    Remove(IdArgs),
    /// List references of a preference
    List(PrefArgs),
}

#[derive(Args)]
pub struct ImportArgs {
    /// Preference document (.toml or .json)
    pub file: PathBuf,

    /// Replace the preference with this id instead of creating one
    #[arg(long)]
    pub replace: Option<i64>,
}

#[derive(Args)]
pub struct IdArgs {
    pub id: i64,
}

#[derive(Args)]
pub struct PrefArgs {
    /// Preference id
    #[arg(long)]
    pub pref: i64,
}

#[derive(Args)]
pub struct PrefFilterArgs {
    /// Restrict to one preference
    #[arg(long)]
    pub pref: Option<i64>,
}

#[derive(Args)]
pub struct ReferenceAddArgs {
    #[arg(long)]
    pub pref: i64,

    /// Image whose `.vec.json` sidecar holds the vector
    #[arg(long, conflicts_with = "vector")]
    pub image: Option<PathBuf>,

    /// Vector as a JSON array
    #[arg(long, required_unless_present = "image")]
    pub vector: Option<String>,

    /// Store as a negative ("not my type") reference
    #[arg(long)]
    pub negative: bool,

    #[arg(long)]
    pub label: Option<String>,

    #[arg(long)]
    pub category: Option<String>,
}

#[derive(Args)]
pub struct ClassifyArgs {
    #[arg(long)]
    pub pref: i64,

    /// Candidate images; signals are read from their sidecars
    pub images: Vec<PathBuf>,

    /// Bio text (default: OCR text of the first image)
    #[arg(long)]
    pub bio: Option<String>,

    #[arg(long)]
    pub name: Option<String>,

    #[arg(long)]
    pub age: Option<u32>,

    /// Artifact reference stored with the result (default: first image path)
    #[arg(long)]
    pub artifact: Option<String>,
}

#[derive(Args)]
pub struct FeedbackArgs {
    /// Result id
    pub id: i64,

    /// like, dislike or super_like
    pub label: String,
}

#[derive(Args)]
pub struct ResultArgs {
    /// Result id
    pub id: i64,
}

#[derive(Args)]
pub struct HistoryArgs {
    #[arg(long)]
    pub pref: Option<i64>,

    /// Only matches
    #[arg(long)]
    pub matches: bool,

    /// Only results with feedback
    #[arg(long)]
    pub labeled: bool,

    /// Max rows (capped at 100)
    #[arg(long, default_value = "20")]
    pub limit: i64,

    #[arg(long, default_value = "0")]
    pub offset: i64,
}

#[derive(Args)]
pub struct TrainArgs {
    #[arg(long)]
    pub pref: i64,
}

#[derive(Args)]
pub struct JobArgs {
    /// Training job id
    pub id: i64,
}

#[derive(Args)]
pub struct VersionArgs {
    /// Model version id
    pub id: i64,
}

impl Command {
    /// Metric label for the command.
    pub fn name(&self) -> &'static str {
        match self {
            Command::Prefs(_) => "prefs",
            Command::Reference(_) => "reference",
            Command::Classify(_) => "classify",
            Command::Feedback(_) => "feedback",
            Command::Unfeedback(_) => "unfeedback",
            Command::Delete(_) => "delete",
            Command::History(_) => "history",
            Command::Stats(_) => "stats",
            Command::Train(_) => "train",
            Command::Cancel(_) => "cancel",
            Command::Jobs(_) => "jobs",
            Command::Versions(_) => "versions",
            Command::Activate(_) => "activate",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cli_is_well_formed() {
        use clap::CommandFactory;
        Cli::command().debug_assert();
    }

    #[test]
    fn parses_classify_with_images() {
        let cli = Cli::try_parse_from([
            "affinity", "classify", "--pref", "1", "a.jpg", "b.jpg", "--age", "30",
        ])
        .unwrap();
        let Command::Classify(args) = cli.command else {
            panic!("expected classify");
        };
        assert_eq!(args.images.len(), 2);
        assert_eq!(args.age, Some(30));
    }

    #[test]
    fn reference_add_needs_a_source() {
        assert!(
            Cli::try_parse_from(["affinity", "reference", "add", "--pref", "1"]).is_err()
        );
        assert!(
            Cli::try_parse_from([
                "affinity", "reference", "add", "--pref", "1", "--vector", "[1,0]"
            ])
            .is_ok()
        );
    }
}
