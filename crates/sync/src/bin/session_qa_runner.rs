use std::env;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use snafu::{OptionExt, ResultExt, Snafu, ensure};

use notebook_backend::{
    AttachmentStore, BackendCommand, CommandError, MemoryBackend, NotebookBackend, NotebookId,
    NotebookStore, PickedFile, ProcessingStatus,
};
use notebook_sync::{
    CatalogController, LineOrigin, SessionContext, SessionError, SessionHandle, SessionSnapshot,
    SettingsStore, Severity, SubmitOutcome, SubmitRejection, SyncSettings, ToastQueue, mount,
};

#[derive(Debug, Clone)]
struct RunnerArgs {
    scenario: Scenario,
    settings_path: Option<PathBuf>,
}

#[derive(Debug, Clone, Copy)]
enum Scenario {
    CatalogRoundtrip,
    UploadProcessingError,
    ChatExchange,
    SubmitGate,
    StaleReload,
    UnmountReleases,
    All,
}

impl Scenario {
    const EACH: [Self; 6] = [
        Self::CatalogRoundtrip,
        Self::UploadProcessingError,
        Self::ChatExchange,
        Self::SubmitGate,
        Self::StaleReload,
        Self::UnmountReleases,
    ];

    fn parse(raw: &str) -> Option<Self> {
        match raw {
            "catalog_roundtrip" => Some(Self::CatalogRoundtrip),
            "upload_processing_error" => Some(Self::UploadProcessingError),
            "chat_exchange" => Some(Self::ChatExchange),
            "submit_gate" => Some(Self::SubmitGate),
            "stale_reload" => Some(Self::StaleReload),
            "unmount_releases" => Some(Self::UnmountReleases),
            "all" => Some(Self::All),
            _ => None,
        }
    }

    fn name(&self) -> &'static str {
        match self {
            Self::CatalogRoundtrip => "catalog_roundtrip",
            Self::UploadProcessingError => "upload_processing_error",
            Self::ChatExchange => "chat_exchange",
            Self::SubmitGate => "submit_gate",
            Self::StaleReload => "stale_reload",
            Self::UnmountReleases => "unmount_releases",
            Self::All => "all",
        }
    }
}

#[derive(Debug, Snafu)]
enum RunnerError {
    #[snafu(display("missing required --scenario argument"))]
    MissingScenario { stage: &'static str },
    #[snafu(display("missing value for argument '{arg}'"))]
    MissingArgumentValue {
        stage: &'static str,
        arg: &'static str,
    },
    #[snafu(display("unknown scenario '{raw}'"))]
    UnknownScenario { stage: &'static str, raw: String },
    #[snafu(display("unknown argument '{raw}'"))]
    UnknownArgument { stage: &'static str, raw: String },
    #[snafu(display("backend command failed: {source}"))]
    Backend {
        stage: &'static str,
        source: CommandError,
    },
    #[snafu(display("session failed: {source}"))]
    Session {
        stage: &'static str,
        source: SessionError,
    },
    #[snafu(display("scenario '{scenario}' failed: {reason}"))]
    ScenarioFailed {
        stage: &'static str,
        scenario: &'static str,
        reason: String,
    },
}

type RunnerResult<T> = Result<T, RunnerError>;

#[tokio::main(flavor = "current_thread")]
async fn main() {
    tracing_subscriber::fmt::init();

    if let Err(error) = run().await {
        println!("runner_ok=false");
        eprintln!("runner_error={error}");
        std::process::exit(1);
    }
}

async fn run() -> RunnerResult<()> {
    let args = parse_args(env::args().skip(1))?;
    println!("scenario={}", args.scenario.name());

    let settings = match args.settings_path {
        Some(path) => {
            println!("settings_path={}", path.display());
            SettingsStore::new(path).settings()
        }
        None => Arc::new(SyncSettings::default()),
    };

    match args.scenario {
        Scenario::All => {
            for scenario in Scenario::EACH {
                println!("running={}", scenario.name());
                run_scenario(scenario, &settings).await?;
            }
            println!("all_passed=true");
        }
        scenario => run_scenario(scenario, &settings).await?,
    }
    println!("runner_ok=true");
    Ok(())
}

async fn run_scenario(scenario: Scenario, settings: &Arc<SyncSettings>) -> RunnerResult<()> {
    let harness = Harness::new(Arc::clone(settings)).await?;
    match scenario {
        Scenario::CatalogRoundtrip => run_catalog_roundtrip(&harness).await,
        Scenario::UploadProcessingError => run_upload_processing_error(&harness).await,
        Scenario::ChatExchange => run_chat_exchange(&harness).await,
        Scenario::SubmitGate => run_submit_gate(&harness).await,
        Scenario::StaleReload => run_stale_reload(&harness).await,
        Scenario::UnmountReleases => run_unmount_releases(&harness).await,
        Scenario::All => Ok(()),
    }
}

fn parse_args(args: impl IntoIterator<Item = String>) -> RunnerResult<RunnerArgs> {
    let mut scenario = None;
    let mut settings_path = None;
    let mut pending = args.into_iter();

    while let Some(argument) = pending.next() {
        match argument.as_str() {
            "--scenario" => {
                let value = pending.next().context(MissingArgumentValueSnafu {
                    stage: "parse-args-scenario-value",
                    arg: "--scenario",
                })?;
                let parsed = Scenario::parse(&value).context(UnknownScenarioSnafu {
                    stage: "parse-args-scenario",
                    raw: value,
                })?;
                scenario = Some(parsed);
            }
            "--settings" => {
                let value = pending.next().context(MissingArgumentValueSnafu {
                    stage: "parse-args-settings-value",
                    arg: "--settings",
                })?;
                settings_path = Some(PathBuf::from(value));
            }
            _ => {
                return UnknownArgumentSnafu {
                    stage: "parse-args",
                    raw: argument,
                }
                .fail();
            }
        }
    }

    Ok(RunnerArgs {
        scenario: scenario.context(MissingScenarioSnafu {
            stage: "parse-args-required-scenario",
        })?,
        settings_path,
    })
}

struct Harness {
    backend: Arc<MemoryBackend>,
    toasts: ToastQueue,
    settings: Arc<SyncSettings>,
    notebook_id: NotebookId,
}

impl Harness {
    async fn new(settings: Arc<SyncSettings>) -> RunnerResult<Self> {
        let backend = Arc::new(MemoryBackend::new());
        let notebook = backend
            .create_notebook("QA Notebook".to_string())
            .await
            .context(BackendSnafu {
                stage: "harness-create-notebook",
            })?;
        Ok(Self {
            backend,
            toasts: ToastQueue::new(settings.toast_duration()),
            settings,
            notebook_id: notebook.id,
        })
    }

    fn context(&self) -> SessionContext {
        SessionContext::new(
            Arc::clone(&self.backend) as Arc<dyn NotebookBackend>,
            Arc::new(self.backend.events().clone()),
            self.toasts.clone(),
        )
        .with_settings(Arc::clone(&self.settings))
    }

    async fn mount(&self) -> RunnerResult<SessionHandle> {
        let session = mount(self.notebook_id, self.context()).context(SessionSnafu {
            stage: "harness-mount",
        })?;
        session
            .wait_for(|snapshot| snapshot.transcript.loaded && snapshot.attachments.items.is_some())
            .await
            .context(SessionSnafu {
                stage: "harness-initial-load",
            })?;
        Ok(session)
    }

    fn toasts_with(&self, severity: Severity) -> Vec<String> {
        self.toasts
            .snapshot()
            .iter()
            .filter(|toast| toast.severity == severity)
            .map(|toast| toast.message.clone())
            .collect()
    }
}

async fn wait(
    session: &SessionHandle,
    stage: &'static str,
    predicate: impl FnMut(&SessionSnapshot) -> bool,
) -> RunnerResult<Arc<SessionSnapshot>> {
    session
        .wait_for(predicate)
        .await
        .context(SessionSnafu { stage })
}

async fn run_catalog_roundtrip(harness: &Harness) -> RunnerResult<()> {
    let scenario = Scenario::CatalogRoundtrip.name();
    let catalog = CatalogController::new(
        Arc::clone(&harness.backend) as Arc<dyn NotebookBackend>,
        harness.toasts.clone(),
        Arc::clone(&harness.settings),
    );

    let created = catalog
        .create("Physics")
        .await
        .context(ScenarioFailedSnafu {
            stage: "catalog-create",
            scenario,
            reason: "create returned no notebook",
        })?;
    let listed = catalog.view().notebooks.unwrap_or_default();
    let listed_ok = listed
        .iter()
        .any(|notebook| notebook.id == created.id && notebook.created_at > 0);
    println!("created_listed={listed_ok}");

    let deleted = catalog.delete(created.id).await;
    let remaining = catalog.view().notebooks.unwrap_or_default();
    let excluded = remaining.iter().all(|notebook| notebook.id != created.id);
    let success_toasts = harness.toasts_with(Severity::Success);
    println!("deleted={deleted}");
    println!("excluded_after_delete={excluded}");
    println!("success_toasts={}", success_toasts.join("|"));

    ensure!(
        listed_ok && deleted && excluded,
        ScenarioFailedSnafu {
            stage: "catalog-verify",
            scenario,
            reason: "notebook was not listed and then excluded",
        }
    );
    Ok(())
}

async fn run_upload_processing_error(harness: &Harness) -> RunnerResult<()> {
    let scenario = Scenario::UploadProcessingError.name();
    let session = harness.mount().await?;

    harness
        .backend
        .queue_pick(Some(PickedFile::new("/tmp/notes.pdf", 2_048)));
    session.upload().await.context(SessionSnafu {
        stage: "upload-dispatch",
    })?;
    let listed = wait(&session, "upload-listed", |snapshot| {
        snapshot
            .attachments
            .items
            .as_deref()
            .is_some_and(|items| !items.is_empty())
    })
    .await?;
    let attachment = listed
        .attachments
        .items
        .as_deref()
        .and_then(|items| items.first())
        .cloned()
        .context(ScenarioFailedSnafu {
            stage: "upload-find",
            scenario,
            reason: "uploaded attachment missing",
        })?;

    harness
        .backend
        .finish_ingestion(attachment.id, Err("corrupt file".to_string()))
        .context(BackendSnafu {
            stage: "upload-finish-ingestion",
        })?;
    let shown = wait(&session, "upload-error-status", |snapshot| {
        snapshot
            .attachments
            .find(attachment.id)
            .is_some_and(|item| item.status == ProcessingStatus::Error)
    })
    .await?;

    let errors = harness.toasts_with(Severity::Error);
    println!(
        "status={:?}",
        shown.attachments.find(attachment.id).map(|item| item.status)
    );
    println!("error_toasts={}", errors.join("|"));
    session.unmount().await;

    ensure!(
        errors.len() == 1 && errors[0].contains("corrupt file"),
        ScenarioFailedSnafu {
            stage: "upload-verify",
            scenario,
            reason: format!("expected one processing error toast, saw {errors:?}"),
        }
    );
    Ok(())
}

async fn run_chat_exchange(harness: &Harness) -> RunnerResult<()> {
    let scenario = Scenario::ChatExchange.name();
    let session = harness.mount().await?;
    let held = harness.backend.hold(BackendCommand::SendMessage);

    let outcome = session
        .submit("Summarize chapter 1")
        .await
        .context(SessionSnafu {
            stage: "chat-submit",
        })?;
    let pending = session.snapshot();
    let optimistic_shown = pending.transcript.thinking
        && pending
            .transcript
            .lines
            .last()
            .is_some_and(|line| line.origin == LineOrigin::Optimistic);
    println!("submit_outcome={outcome:?}");
    println!("optimistic_shown={optimistic_shown}");

    held.release();
    let settled = wait(&session, "chat-settled", |snapshot| {
        !snapshot.transcript.thinking && snapshot.transcript.lines.len() == 2
    })
    .await?;
    let leftovers = settled
        .transcript
        .lines
        .iter()
        .filter(|line| line.origin == LineOrigin::Optimistic)
        .count();
    println!("persisted_lines={}", settled.transcript.lines.len());
    println!("optimistic_leftovers={leftovers}");
    session.unmount().await;

    ensure!(
        outcome == SubmitOutcome::Accepted && optimistic_shown && leftovers == 0,
        ScenarioFailedSnafu {
            stage: "chat-verify",
            scenario,
            reason: "optimistic turn lifecycle did not hold",
        }
    );
    Ok(())
}

async fn run_submit_gate(harness: &Harness) -> RunnerResult<()> {
    let scenario = Scenario::SubmitGate.name();
    let session = harness.mount().await?;
    let held = harness.backend.hold(BackendCommand::SendMessage);

    session.submit("first").await.context(SessionSnafu {
        stage: "gate-first-submit",
    })?;
    let second = session.submit("second").await.context(SessionSnafu {
        stage: "gate-second-submit",
    })?;
    let calls = harness.backend.call_count(BackendCommand::SendMessage);
    println!("second_outcome={second:?}");
    println!("send_message_calls={calls}");

    drop(held);
    wait(&session, "gate-settled", |snapshot| !snapshot.transcript.thinking).await?;
    session.unmount().await;

    ensure!(
        second == SubmitOutcome::Rejected(SubmitRejection::Thinking) && calls == 1,
        ScenarioFailedSnafu {
            stage: "gate-verify",
            scenario,
            reason: "second submit was not rejected while thinking",
        }
    );
    Ok(())
}

async fn run_stale_reload(harness: &Harness) -> RunnerResult<()> {
    let scenario = Scenario::StaleReload.name();
    let held = harness.backend.hold(BackendCommand::Attachments);
    let session = mount(harness.notebook_id, harness.context()).context(SessionSnafu {
        stage: "stale-mount",
    })?;

    session.reload().await.context(SessionSnafu {
        stage: "stale-reload",
    })?;
    wait(&session, "stale-newest-applied", |snapshot| {
        snapshot.attachments.items.is_some() && !snapshot.attachments.loading
    })
    .await?;

    harness
        .backend
        .queue_pick(Some(PickedFile::new("/tmp/late.txt", 12)));
    harness
        .backend
        .upload_file(harness.notebook_id)
        .await
        .context(BackendSnafu {
            stage: "stale-upload",
        })?;
    held.release();
    // No snapshot change is expected, so give the released fetch time to land.
    tokio::time::sleep(Duration::from_millis(50)).await;

    let listed = session
        .snapshot()
        .attachments
        .items
        .as_deref()
        .map_or(0, <[_]>::len);
    println!("listed_after_stale={listed}");
    session.unmount().await;

    ensure!(
        listed == 0,
        ScenarioFailedSnafu {
            stage: "stale-verify",
            scenario,
            reason: "superseded fetch replaced the newer list",
        }
    );
    Ok(())
}

async fn run_unmount_releases(harness: &Harness) -> RunnerResult<()> {
    let scenario = Scenario::UnmountReleases.name();
    let session = harness.mount().await?;
    let during = harness.backend.events().listener_count();
    session.unmount().await;
    let after = harness.backend.events().listener_count();
    println!("listeners_mounted={during}");
    println!("listeners_unmounted={after}");

    ensure!(
        during == 3 && after == 0,
        ScenarioFailedSnafu {
            stage: "unmount-verify",
            scenario,
            reason: format!("expected 3 then 0 listeners, saw {during} then {after}"),
        }
    );
    Ok(())
}
