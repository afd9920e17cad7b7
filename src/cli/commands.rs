use std::fmt::Write as _;
use std::io::{self, BufRead, Write};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use anyhow::{bail, Context, Result};
use clap::Args;
use crossbeam_channel::{unbounded, Receiver, RecvTimeoutError};
use time::{format_description::well_known::Rfc3339, OffsetDateTime};

use crate::config::AppConfig;
use crate::journaling::{
    AuthSession, Draft, DraftError, DraftEvent, DraftSession, EntryGateway, EntryId, OwnerRef,
    SaveStatus, StaticSession, Visibility,
};
use crate::storage::{self, memory::MemoryGateway, EntryRecord};

const FLUSH_TIMEOUT: Duration = Duration::from_secs(10);
const SNIPPET_LINES: usize = 3;
const SNIPPET_CHARS: usize = 80;

#[derive(Args, Debug, Clone)]
pub struct WriteArgs {
    /// Continue editing an existing entry
    #[arg(long)]
    pub id: Option<EntryId>,
    /// Share the entry with your partner
    #[arg(long, conflicts_with = "private")]
    pub shared: bool,
    /// Keep the entry to yourself
    #[arg(long)]
    pub private: bool,
    /// Keep the entry in memory only; nothing is written to disk
    #[arg(long, conflicts_with = "id")]
    pub ephemeral: bool,
}

impl WriteArgs {
    fn visibility(&self) -> Option<Visibility> {
        match (self.shared, self.private) {
            (true, _) => Some(Visibility::Shared),
            (_, true) => Some(Visibility::Private),
            _ => None,
        }
    }
}

#[derive(Args, Debug, Clone)]
pub struct ListArgs {
    /// Limit the number of entries printed
    #[arg(long, default_value_t = 20)]
    pub limit: usize,
    /// Print entries as JSON
    #[arg(long)]
    pub json: bool,
}

#[derive(Args, Debug, Clone)]
pub struct ShowArgs {
    /// Entry identifier
    pub id: EntryId,
    /// Print the entry as JSON
    #[arg(long)]
    pub json: bool,
}

#[derive(Args, Debug, Clone)]
pub struct DeleteArgs {
    /// Entry identifier
    pub id: EntryId,
}

pub fn write_entry(config: &AppConfig, owner: Option<OwnerRef>, args: WriteArgs) -> Result<()> {
    if atty::is(atty::Stream::Stdin) {
        eprintln!("Start typing. /save, /private, /shared and /delete are commands; Ctrl-D finishes.");
    }
    let auth = owner
        .map(StaticSession::signed_in)
        .unwrap_or_else(StaticSession::signed_out);
    let lines = spawn_line_reader();
    let stdout = io::stdout();
    let mut out = stdout.lock();

    let draft = if args.ephemeral {
        let draft = new_draft(config, args.visibility());
        run_write(config, draft, Arc::new(MemoryGateway::new()), auth, lines, &mut out)?
    } else {
        let storage = storage::init(&config.storage)?;
        let draft = match args.id {
            Some(id) => {
                let record = storage
                    .fetch_entry(id)?
                    .with_context(|| format!("entry {id} not found"))?;
                let mut draft =
                    Draft::hydrate(&config.drafts, record.id, record.content, record.visibility);
                if let Some(visibility) = args.visibility() {
                    draft.set_visibility(visibility, Instant::now())?;
                }
                draft
            }
            None => new_draft(config, args.visibility()),
        };
        run_write(config, draft, Arc::new(storage), auth, lines, &mut out)?
    };

    print_summary(&draft, &mut out)?;
    Ok(())
}

fn new_draft(config: &AppConfig, visibility: Option<Visibility>) -> Draft {
    let mut drafts = config.drafts.clone();
    if let Some(visibility) = visibility {
        drafts.default_visibility = visibility;
    }
    Draft::new(&drafts)
}

fn spawn_line_reader() -> Receiver<String> {
    let (tx, rx) = unbounded();
    thread::spawn(move || {
        for line in io::stdin().lock().lines() {
            match line {
                Ok(line) => {
                    if tx.send(line).is_err() {
                        break;
                    }
                }
                Err(err) => {
                    tracing::warn!(?err, "stopped reading stdin");
                    break;
                }
            }
        }
    });
    rx
}

/// Drives one draft from a stream of input lines until the stream closes or
/// the entry is deleted, then flushes and ends the session.
fn run_write<G, A>(
    config: &AppConfig,
    draft: Draft,
    gateway: Arc<G>,
    auth: A,
    lines: Receiver<String>,
    out: &mut impl Write,
) -> Result<Draft>
where
    G: EntryGateway + 'static,
    A: AuthSession,
{
    let mut session =
        DraftSession::new(draft, gateway, auth).context("starting the gateway worker")?;
    let events = session.subscribe();
    let poll = config.drafts.poll_interval();
    let mut deleted = false;

    loop {
        match lines.recv_timeout(poll) {
            Ok(line) => {
                if let Err(err) = apply_line(&mut session, &line) {
                    writeln!(out, "! {err}")?;
                }
            }
            Err(RecvTimeoutError::Timeout) => {}
            Err(RecvTimeoutError::Disconnected) => break,
        }
        session.pump(Instant::now());
        if report_events(&events, out)? {
            deleted = true;
            break;
        }
    }

    if !deleted {
        if !session.flush(FLUSH_TIMEOUT) {
            tracing::warn!(
                in_flight = session.in_flight(),
                "gave up waiting for the final save"
            );
        }
        report_events(&events, out)?;
    }
    Ok(session.end())
}

fn apply_line<A>(session: &mut DraftSession<A>, line: &str) -> Result<(), DraftError>
where
    A: AuthSession,
{
    match line.trim() {
        "/save" => {
            session.save_now();
            Ok(())
        }
        "/private" => session.set_visibility(Visibility::Private),
        "/shared" => session.set_visibility(Visibility::Shared),
        "/delete" => session.request_delete(),
        _ => {
            let current = session.draft().content();
            let next = if current.is_empty() {
                line.to_string()
            } else {
                format!("{current}\n{line}")
            };
            session.set_content(next)
        }
    }
}

/// Prints pending events; returns whether the entry was deleted.
fn report_events(events: &Receiver<DraftEvent>, out: &mut impl Write) -> Result<bool> {
    let mut deleted = false;
    for event in events.try_iter() {
        if let Some(line) = format_event(&event) {
            writeln!(out, "{line}")?;
        }
        deleted |= matches!(event, DraftEvent::Deleted(_));
    }
    Ok(deleted)
}

fn format_event(event: &DraftEvent) -> Option<String> {
    match event {
        DraftEvent::StatusChanged(SaveStatus::Saving) => Some("saving...".to_string()),
        DraftEvent::StatusChanged(SaveStatus::Saved { at }) => {
            Some(format!("saved at {}", format_datetime(*at)))
        }
        DraftEvent::StatusChanged(SaveStatus::Errored { error }) => {
            Some(format!("save failed: {error}"))
        }
        DraftEvent::StatusChanged(_) => None,
        DraftEvent::IdentityBound(id) => Some(format!("created entry {id}")),
        DraftEvent::Deleted(id) => Some(format!("deleted entry {id}")),
        DraftEvent::DeleteFailed { id, error } => Some(format!("could not delete {id}: {error}")),
    }
}

fn print_summary(draft: &Draft, out: &mut impl Write) -> Result<()> {
    if draft.is_deleted() {
        return Ok(());
    }
    match draft.identity() {
        Some(id) => writeln!(
            out,
            "entry {id}: {} words, {} chars ({})",
            draft.word_count(),
            draft.char_count(),
            draft.status().label()
        )?,
        None => writeln!(out, "nothing saved ({})", draft.status().label())?,
    }
    Ok(())
}

pub fn list_entries(config: &AppConfig, owner: Option<OwnerRef>, args: ListArgs) -> Result<()> {
    let Some(owner) = owner else {
        bail!("no owner configured; pass --owner or set account.owner in the config");
    };
    let storage = storage::init(&config.storage)?;
    let records = storage
        .list_entries(&owner, args.limit)
        .context("listing entries")?;
    if args.json {
        println!(
            "{}",
            serde_json::to_string_pretty(&records).context("serialising entries")?
        );
    } else {
        print!("{}", format_entry_list(&records));
    }
    Ok(())
}

pub fn show_entry(config: &AppConfig, args: ShowArgs) -> Result<()> {
    let storage = storage::init(&config.storage)?;
    let Some(record) = storage.fetch_entry(args.id)? else {
        bail!("entry {} not found", args.id);
    };
    if args.json {
        println!(
            "{}",
            serde_json::to_string_pretty(&record).context("serialising entry")?
        );
    } else {
        print!("{}", format_entry(&record));
    }
    Ok(())
}

pub fn delete_entry(config: &AppConfig, args: DeleteArgs) -> Result<()> {
    let storage = storage::init(&config.storage)?;
    let Some(record) = storage.fetch_entry(args.id)? else {
        bail!("entry {} not found", args.id);
    };
    let draft = Draft::hydrate(&config.drafts, record.id, record.content, record.visibility);
    let mut session = DraftSession::new(draft, Arc::new(storage), StaticSession::signed_out())
        .context("starting the gateway worker")?;
    session.request_delete()?;
    if !session.settle(FLUSH_TIMEOUT) {
        bail!("timed out deleting entry {}", args.id);
    }
    let draft = session.end();
    if !draft.is_deleted() {
        match draft.status() {
            SaveStatus::Errored { error } => bail!("could not delete entry {}: {error}", args.id),
            _ => bail!("could not delete entry {}", args.id),
        }
    }
    println!("Deleted entry {}", args.id);
    Ok(())
}

fn format_entry_list(records: &[EntryRecord]) -> String {
    if records.is_empty() {
        return "No entries yet.\n".to_string();
    }
    let mut out = String::new();
    for (idx, record) in records.iter().enumerate() {
        if idx > 0 {
            out.push('\n');
        }
        let _ = writeln!(
            &mut out,
            "{}  {}  {}",
            record.id,
            format_timestamp(record.created_at),
            record.visibility
        );
        let _ = writeln!(
            &mut out,
            "    {} words, {} chars",
            record.word_count, record.character_count
        );
        if let Some(snippet) = build_snippet(&record.content) {
            let _ = writeln!(&mut out, "    {snippet}");
        }
    }
    out
}

fn format_entry(record: &EntryRecord) -> String {
    let mut out = String::new();
    let _ = writeln!(&mut out, "{}  [{}]", record.id, record.visibility);
    let _ = writeln!(&mut out, "created {}", format_timestamp(record.created_at));
    let _ = writeln!(&mut out, "updated {}", format_timestamp(record.updated_at));
    let _ = writeln!(
        &mut out,
        "{} words, {} chars",
        record.word_count, record.character_count
    );
    out.push('\n');
    out.push_str(&record.content);
    if !record.content.ends_with('\n') {
        out.push('\n');
    }
    out
}

fn build_snippet(content: &str) -> Option<String> {
    let segments = content
        .lines()
        .take(SNIPPET_LINES)
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .collect::<Vec<_>>();
    if segments.is_empty() {
        None
    } else {
        Some(segments.join(" ").chars().take(SNIPPET_CHARS).collect())
    }
}

fn format_timestamp(epoch: i64) -> String {
    OffsetDateTime::from_unix_timestamp(epoch)
        .map(format_datetime)
        .unwrap_or_else(|_| epoch.to_string())
}

fn format_datetime(at: OffsetDateTime) -> String {
    at.format(&Rfc3339)
        .unwrap_or_else(|_| at.unix_timestamp().to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::StorageOptions;
    use crate::journaling::GatewayError;
    use crate::storage::memory::GatewayCall;
    use crossbeam_channel::Sender;
    use tempfile::TempDir;
    use uuid::Uuid;

    type TestResult<T = ()> = Result<T>;

    fn quiet_config() -> AppConfig {
        let mut config = AppConfig::default();
        config.drafts.debounce_ms = 60_000;
        config.drafts.poll_interval_ms = 5;
        config
    }

    fn closed_input(lines: &[&str]) -> Receiver<String> {
        let (tx, rx): (Sender<String>, Receiver<String>) = unbounded();
        for line in lines {
            tx.send(line.to_string()).expect("receiver alive");
        }
        rx
    }

    fn signed_in() -> StaticSession {
        StaticSession::signed_in(OwnerRef::new("owner-1"))
    }

    fn parse_write(args: &[&str]) -> std::result::Result<WriteArgs, clap::Error> {
        use clap::Parser;

        let cli = crate::cli::Cli::try_parse_from(["diary", "write"].iter().chain(args))?;
        match cli.command {
            crate::cli::Commands::Write(args) => Ok(args),
            other => panic!("expected write, got {other:?}"),
        }
    }

    #[test]
    fn write_visibility_flags() -> TestResult {
        assert_eq!(parse_write(&[])?.visibility(), None);
        assert_eq!(parse_write(&["--private"])?.visibility(), Some(Visibility::Private));
        assert_eq!(parse_write(&["--shared"])?.visibility(), Some(Visibility::Shared));
        assert!(parse_write(&["--shared", "--private"]).is_err());
        assert!(parse_write(&["--ephemeral", "--private"])?.ephemeral);
        Ok(())
    }

    #[test]
    fn cli_write_flushes_once_at_end_of_input() -> TestResult {
        let config = quiet_config();
        let gateway = Arc::new(MemoryGateway::new());
        let mut out = Vec::new();

        let draft = run_write(
            &config,
            Draft::new(&config.drafts),
            Arc::clone(&gateway),
            signed_in(),
            closed_input(&["Hello", "world"]),
            &mut out,
        )?;

        let id = draft.identity().expect("entry created");
        assert_eq!(
            gateway.calls(),
            vec![GatewayCall::Create {
                content: "Hello\nworld".into()
            }]
        );
        assert_eq!(draft.word_count(), 2);
        assert_eq!(draft.char_count(), 11);
        assert!(draft.is_closed());

        let printed = String::from_utf8(out)?;
        assert!(printed.contains(&format!("created entry {id}")));
        assert!(printed.contains("saved at "));
        Ok(())
    }

    #[test]
    fn cli_write_reports_errors_without_aborting() -> TestResult {
        let config = quiet_config();
        let gateway = Arc::new(MemoryGateway::new());
        gateway.fail_next(GatewayError::Backend("disk full".into()));
        let mut out = Vec::new();

        let draft = run_write(
            &config,
            Draft::new(&config.drafts),
            Arc::clone(&gateway),
            signed_in(),
            closed_input(&["/delete", "some text"]),
            &mut out,
        )?;

        let printed = String::from_utf8(out)?;
        assert!(printed.contains("! draft has not been saved yet"));
        assert!(printed.contains("save failed: backend failure: disk full"));
        assert_eq!(draft.identity(), None);
        assert!(gateway.is_empty());
        Ok(())
    }

    #[test]
    fn cli_write_delete_skips_pending_update() -> TestResult {
        let config = quiet_config();
        let gateway = Arc::new(MemoryGateway::new());
        let id = gateway.seed(OwnerRef::new("owner-1"), "old words", Visibility::Shared);
        let draft = Draft::hydrate(&config.drafts, id, "old words", Visibility::Shared);
        let mut out = Vec::new();

        let draft = run_write(
            &config,
            draft,
            Arc::clone(&gateway),
            signed_in(),
            closed_input(&["more words", "/private", "/delete"]),
            &mut out,
        )?;

        assert!(draft.is_deleted());
        assert_eq!(gateway.calls(), vec![GatewayCall::Delete(id)]);
        assert!(String::from_utf8(out)?.contains(&format!("deleted entry {id}")));
        Ok(())
    }

    #[test]
    fn cli_delete_removes_stored_entry() -> TestResult {
        let temp = TempDir::new().context("creating temp dir")?;
        let mut config = quiet_config();
        config.storage = StorageOptions {
            database_path: temp.path().join("diary.db"),
            ..StorageOptions::default()
        };
        let storage = storage::init(&config.storage)?;
        let fields = crate::journaling::EntryFields {
            content: "to be removed".into(),
            visibility: Visibility::Private,
            stats: crate::journaling::DerivedStats::from_content("to be removed"),
        };
        let id = storage.create(&fields, &OwnerRef::new("owner-1"))?;

        delete_entry(&config, DeleteArgs { id })?;
        assert!(storage.fetch_entry(id)?.is_none());

        let err = delete_entry(&config, DeleteArgs { id }).unwrap_err();
        assert!(err.to_string().contains("not found"));
        Ok(())
    }

    #[test]
    fn entry_list_formatting() {
        let records = vec![
            EntryRecord {
                id: EntryId::from_uuid(Uuid::from_u128(2)),
                owner_id: OwnerRef::new("owner-1"),
                content: "Rain again.\n\nTea and a long walk.".into(),
                visibility: Visibility::Private,
                word_count: 7,
                character_count: 33,
                created_at: 1_709_281_800,
                updated_at: 1_709_281_800,
            },
            EntryRecord {
                id: EntryId::from_uuid(Uuid::from_u128(1)),
                owner_id: OwnerRef::new("owner-1"),
                content: "First entry".into(),
                visibility: Visibility::Shared,
                word_count: 2,
                character_count: 11,
                created_at: 1_709_154_300,
                updated_at: 1_709_154_300,
            },
        ];

        insta::assert_snapshot!(format_entry_list(&records), @r"
        00000000-0000-0000-0000-000000000002  2024-03-01T08:30:00Z  private
            7 words, 33 chars
            Rain again. Tea and a long walk.

        00000000-0000-0000-0000-000000000001  2024-02-28T21:05:00Z  shared
            2 words, 11 chars
            First entry
        ");
        assert_eq!(format_entry_list(&[]), "No entries yet.\n");
    }

    #[test]
    fn snippet_skips_blank_lines_and_truncates() {
        assert_eq!(build_snippet("  \n\n"), None);
        let long = "x".repeat(200);
        assert_eq!(build_snippet(&long).map(|s| s.chars().count()), Some(80));
    }
}
