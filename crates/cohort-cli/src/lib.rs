//! Command surface for the cohort segmentation engine.
//!
//! Every engine operation is reachable from a subcommand; results print as
//! JSON on stdout. [`run_cli`] is the full parsed entrypoint used by the
//! `cohort` binary and by the integration tests.

use std::fs;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use cohort_core::{
    now_utc, EditMemberships, HistoryQuery, HistoryService, MembershipStore, NewSegment, NewUser,
    SegmentAssignment, SegmentService, UserService,
};
use cohort_store_sqlite::SqliteStore;
use serde::Serialize;
use serde_json::json;

#[derive(Debug, Parser)]
#[command(name = "cohort")]
#[command(about = "User segmentation engine CLI")]
pub struct Cli {
    #[arg(long, default_value = "./cohort.sqlite3")]
    db: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    User {
        #[command(subcommand)]
        command: UserCommand,
    },
    Segment {
        #[command(subcommand)]
        command: SegmentCommand,
    },
    Membership {
        #[command(subcommand)]
        command: MembershipCommand,
    },
    History {
        #[command(subcommand)]
        command: HistoryCommand,
    },
}

#[derive(Debug, Subcommand)]
pub enum UserCommand {
    Create(UserCreateArgs),
    Show(UserIdArgs),
    Edit(UserEditArgs),
    Delete(UserIdArgs),
}

#[derive(Debug, Args)]
pub struct UserCreateArgs {
    #[arg(long)]
    username: String,
    #[arg(long)]
    first_name: String,
    #[arg(long)]
    last_name: String,
}

#[derive(Debug, Args)]
pub struct UserIdArgs {
    #[arg(long)]
    id: u64,
}

#[derive(Debug, Args)]
pub struct UserEditArgs {
    #[arg(long)]
    id: u64,
    #[arg(long)]
    username: String,
    #[arg(long)]
    first_name: String,
    #[arg(long)]
    last_name: String,
}

#[derive(Debug, Subcommand)]
pub enum SegmentCommand {
    Create(SegmentCreateArgs),
    Show(SegmentSlugArgs),
    Delete(SegmentSlugArgs),
}

#[derive(Debug, Args)]
pub struct SegmentCreateArgs {
    #[arg(long)]
    slug: String,
    /// Auto-enroll this percentage of the current user population.
    #[arg(long)]
    percent: Option<u8>,
}

#[derive(Debug, Args)]
pub struct SegmentSlugArgs {
    #[arg(long)]
    slug: String,
}

#[derive(Debug, Subcommand)]
pub enum MembershipCommand {
    List(MembershipListArgs),
    Edit(MembershipEditArgs),
    /// Run one expiration purge pass and print the removed count.
    Sweep,
}

#[derive(Debug, Args)]
pub struct MembershipListArgs {
    #[arg(long)]
    user_id: u64,
}

#[derive(Debug, Args)]
pub struct MembershipEditArgs {
    #[arg(long)]
    user_id: u64,
    /// Segment to add, as `slug` or `slug=YYYY-MM-DD HH:MM`.
    #[arg(long = "add")]
    add: Vec<String>,
    /// Segment slug to remove.
    #[arg(long = "remove")]
    remove: Vec<String>,
}

#[derive(Debug, Subcommand)]
pub enum HistoryCommand {
    Export(HistoryExportArgs),
}

#[derive(Debug, Args)]
pub struct HistoryExportArgs {
    #[arg(long)]
    year: i32,
    #[arg(long)]
    month: u8,
    /// Directory the CSV file is written into.
    #[arg(long, default_value = ".")]
    output: PathBuf,
}

fn parse_assignment(value: &str) -> SegmentAssignment {
    match value.split_once('=') {
        Some((slug, until)) => SegmentAssignment {
            segment_slug: slug.to_string(),
            until: Some(until.to_string()),
        },
        None => SegmentAssignment {
            segment_slug: value.to_string(),
            until: None,
        },
    }
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

pub fn run_cli(cli: Cli) -> Result<()> {
    let store = Arc::new(SqliteStore::open(&cli.db)?);
    store.migrate()?;

    let users = UserService::new(Arc::clone(&store));
    let segments = SegmentService::new(Arc::clone(&store), Arc::clone(&store));
    let history = HistoryService::new(Arc::clone(&store));

    match cli.command {
        Command::User { command } => match command {
            UserCommand::Create(args) => {
                let user = users.create_user(&NewUser {
                    username: args.username,
                    first_name: args.first_name,
                    last_name: args.last_name,
                })?;
                print_json(&json!({ "user": user }))
            }
            UserCommand::Show(args) => {
                let user = users.user_by_id(args.id)?;
                print_json(&json!({ "user": user }))
            }
            UserCommand::Edit(args) => {
                let user = users.edit_user(
                    args.id,
                    &NewUser {
                        username: args.username,
                        first_name: args.first_name,
                        last_name: args.last_name,
                    },
                )?;
                print_json(&json!({ "user": user }))
            }
            UserCommand::Delete(args) => {
                users.delete_user(args.id)?;
                print_json(&json!({ "deleted": args.id }))
            }
        },
        Command::Segment { command } => match command {
            SegmentCommand::Create(args) => {
                let segment = segments.create_segment(&NewSegment {
                    slug: args.slug,
                    percent: args.percent,
                })?;
                print_json(&json!({ "segment": segment }))
            }
            SegmentCommand::Show(args) => {
                let segment = segments.segment_by_slug(&args.slug)?;
                print_json(&json!({ "segment": segment }))
            }
            SegmentCommand::Delete(args) => {
                segments.delete_segment(&args.slug)?;
                print_json(&json!({ "deleted": args.slug }))
            }
        },
        Command::Membership { command } => match command {
            MembershipCommand::List(args) => {
                let listed = segments.user_segments(args.user_id)?;
                let count = listed.len();
                print_json(&json!({ "segments": listed, "count": count }))
            }
            MembershipCommand::Edit(args) => {
                let form = EditMemberships {
                    segments_to_add: args.add.iter().map(|s| parse_assignment(s)).collect(),
                    segments_to_remove: args.remove,
                };
                form.validate()?;
                let listed = segments.edit_user_segments(args.user_id, &form)?;
                let count = listed.len();
                print_json(&json!({ "segments": listed, "count": count }))
            }
            MembershipCommand::Sweep => {
                let removed = store.purge_expired(now_utc())?;
                print_json(&json!({ "removed": removed }))
            }
        },
        Command::History { command } => match command {
            HistoryCommand::Export(args) => {
                let export = history.month_csv(&HistoryQuery {
                    year: args.year,
                    month: args.month,
                })?;
                let path = args.output.join(&export.file_name);
                fs::write(&path, &export.csv)
                    .with_context(|| format!("write {}", path.display()))?;
                print_json(&json!({ "file": path }))
            }
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn must<T, E: std::fmt::Display>(result: Result<T, E>) -> T {
        match result {
            Ok(value) => value,
            Err(err) => panic!("test failure: {err}"),
        }
    }

    #[test]
    fn assignment_without_until_is_permanent() {
        let assignment = parse_assignment("beta");
        assert_eq!(assignment.segment_slug, "beta");
        assert_eq!(assignment.until, None);
    }

    #[test]
    fn assignment_with_until_splits_on_first_equals() {
        let assignment = parse_assignment("beta=2023-06-01 15:00");
        assert_eq!(assignment.segment_slug, "beta");
        assert_eq!(assignment.until.as_deref(), Some("2023-06-01 15:00"));
    }

    #[test]
    fn membership_edit_parses_repeated_flags() {
        let cli = must(Cli::try_parse_from([
            "cohort",
            "membership",
            "edit",
            "--user-id",
            "1",
            "--add",
            "beta=2023-06-01 15:00",
            "--add",
            "gamma",
            "--remove",
            "alpha",
        ]));

        match cli.command {
            Command::Membership { command: MembershipCommand::Edit(args) } => {
                assert_eq!(args.user_id, 1);
                assert_eq!(args.add, ["beta=2023-06-01 15:00", "gamma"]);
                assert_eq!(args.remove, ["alpha"]);
            }
            other => panic!("unexpected command: {other:?}"),
        }
    }

    #[test]
    fn segment_create_accepts_optional_percent() {
        let cli = must(Cli::try_parse_from([
            "cohort", "segment", "create", "--slug", "beta", "--percent", "50",
        ]));

        match cli.command {
            Command::Segment { command: SegmentCommand::Create(args) } => {
                assert_eq!(args.slug, "beta");
                assert_eq!(args.percent, Some(50));
            }
            other => panic!("unexpected command: {other:?}"),
        }
    }
}
