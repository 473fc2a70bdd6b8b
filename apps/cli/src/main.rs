use std::{path::PathBuf, sync::Arc};

use anyhow::{bail, Context, Result};
use chrono::Utc;
use clap::{Parser, Subcommand, ValueEnum};
use gateway::{catalog, AuthGateway, FileSessionStore, QuestionFilter, SupabaseGateway};
use session::{ActionOutcome, Navigation, RouteDecision, RouteGate, SessionController};
use shared::{
    domain::{Identity, QuestionId, Year},
    protocol::{NewProgress, NewQuizAttempt, ProgressPatch},
};
use tokio::sync::broadcast;
use tracing::{debug, info};
use tracing_subscriber::EnvFilter;
use url::Url;

mod config;

use config::{load_settings, prepare_session_file};

#[derive(Parser, Debug)]
#[command(name = "pipefit", about = "Steamfitter/pipefitter exam prep from the terminal")]
struct Args {
    /// Config file to read instead of ./pipefit.toml
    #[arg(long, global = true)]
    config: Option<PathBuf>,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Show the resolved session state
    Status,
    /// Run the route gate for a page
    Open {
        #[arg(value_enum)]
        page: Page,
    },
    SignIn {
        #[arg(long)]
        email: String,
        #[arg(long)]
        password: String,
    },
    SignUp {
        #[arg(long)]
        email: String,
        #[arg(long)]
        password: String,
        #[arg(long)]
        full_name: String,
    },
    /// Print the Google consent URL
    Google,
    /// Finish a Google sign-in from the URL the browser was redirected to
    CompleteOauth { redirect_url: Url },
    Whoami,
    SetYear { year: Year },
    Questions {
        #[arg(long)]
        year: Option<Year>,
        #[arg(long)]
        section: Option<String>,
        #[arg(long)]
        search: Option<String>,
    },
    Guides {
        #[arg(long)]
        year: Year,
        #[arg(long)]
        section: Option<String>,
        #[arg(long)]
        search: Option<String>,
    },
    Progress,
    Bookmark {
        question_id: i64,
        #[arg(long)]
        remove: bool,
    },
    Attempts,
    RecordAttempt {
        #[arg(long, default_value = "practice")]
        mode: String,
        #[arg(long)]
        year: Option<Year>,
        #[arg(long)]
        section: Option<String>,
        #[arg(long)]
        score: u32,
        #[arg(long)]
        total: u32,
    },
    Logout,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum Page {
    Login,
    Dashboard,
    Practice,
    StudyGuides,
    Progress,
    Profile,
}

impl Page {
    fn is_public(self) -> bool {
        matches!(self, Page::Login)
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")),
        )
        .init();
    let args = Args::parse();

    let settings = load_settings(args.config.as_deref());
    let session_file = prepare_session_file(&settings.session_file)?;
    let store = Arc::new(FileSessionStore::new(session_file));
    info!(session_file = %store.path().display(), "using session file");
    let gateway = SupabaseGateway::new(settings.gateway_config()?, store)
        .context("failed to build backend gateway")?;
    info!(backend = %gateway.config().base_url, "gateway ready");

    let controller = SessionController::new(gateway.clone(), settings.oauth_redirect_url.clone());
    let navigation = controller.subscribe_navigation();
    controller.start().await;
    let settled = controller.settled().await;
    debug!(phase = ?settled.phase(), "session resolved");

    let result = run(args.command, &gateway, &controller, navigation).await;
    controller.shutdown();
    result
}

async fn run(
    command: Command,
    gateway: &Arc<SupabaseGateway>,
    controller: &SessionController,
    mut navigation: broadcast::Receiver<Navigation>,
) -> Result<()> {
    match command {
        Command::Status => {
            let state = controller.snapshot();
            println!("phase: {:?}", state.phase());
            match &state.user {
                Some(user) => print_identity(user),
                None => println!("user: none"),
            }
            if let Some(err) = &state.auth_error {
                println!("auth error ({:?}): {}", err.kind, err.message);
            }
            let stored = if gateway.has_session().await { "yes" } else { "no" };
            println!("stored session: {stored}");
        }
        Command::Open { page } => {
            if page.is_public() {
                println!("rendering {page:?}");
                return Ok(());
            }
            let mut gate = RouteGate::new();
            match gate.evaluate(controller) {
                RouteDecision::Loading => println!("still loading"),
                RouteDecision::NotRegistered => {
                    println!("this account is not registered for pipefit; contact an admin")
                }
                RouteDecision::RedirectToLogin => {
                    let target = match navigation.try_recv() {
                        Ok(Navigation::Login) => "login",
                        _ => "home",
                    };
                    println!("not signed in; redirecting to {target} (run `pipefit sign-in`)");
                }
                RouteDecision::Render => println!("rendering {page:?}"),
            }
        }
        Command::SignIn { email, password } => {
            report(controller.sign_in(&email, &password).await)?;
            if let Some(user) = controller.snapshot().user {
                print_identity(&user);
            }
        }
        Command::SignUp {
            email,
            password,
            full_name,
        } => report(controller.sign_up(&email, &password, &full_name).await)?,
        Command::Google => {
            report(controller.sign_in_with_google().await)?;
            if let Ok(Navigation::External(url)) = navigation.try_recv() {
                println!("open this URL in a browser, then run `pipefit complete-oauth <redirect-url>`:");
                println!("{url}");
            }
        }
        Command::CompleteOauth { redirect_url } => {
            gateway
                .set_session_from_redirect(&redirect_url)
                .await
                .context("failed to complete google sign in")?;
            let identity = gateway
                .me()
                .await
                .context("sign in completed but the user could not be loaded")?;
            print_identity(&identity);
        }
        Command::Whoami => match controller.snapshot().user {
            Some(user) => print_identity(&user),
            None => println!("not signed in"),
        },
        Command::SetYear { year } => {
            require_user(controller)?;
            let identity = controller
                .update_selected_year(year)
                .await
                .context("failed to update selected year")?;
            print_identity(&identity);
        }
        Command::Questions {
            year,
            section,
            search,
        } => {
            let questions = gateway
                .filter_questions(&QuestionFilter { year, section })
                .await
                .context("failed to load questions")?;
            let shown: Vec<_> = match &search {
                Some(term) => catalog::search_questions(&questions, term),
                None => questions.iter().collect(),
            };
            for question in &shown {
                println!(
                    "#{} [year {} / {}] {}",
                    question.id, question.year, question.section, question.question
                );
            }
            println!("{} question(s)", shown.len());
        }
        Command::Guides {
            year,
            section,
            search,
        } => {
            let guides = gateway
                .study_guides_by_year(year)
                .await
                .context("failed to load study guides")?;
            if let (Some(section), None) = (&section, &search) {
                let guide = gateway
                    .study_guide(year, section)
                    .await
                    .context("failed to load study guide")?;
                match guide {
                    Some(guide) => println!("{}\n\n{}", guide.title, guide.content),
                    None => println!("no guide for year {year} / {section}"),
                }
                return Ok(());
            }
            let shown = catalog::search_guides(
                &guides,
                section.as_deref(),
                search.as_deref().unwrap_or_default(),
            );
            println!("sections: {}", catalog::sections_of(&guides).join(", "));
            for guide in shown {
                println!("[{}] {}", guide.section, guide.title);
            }
        }
        Command::Progress => {
            let user = require_user(controller)?;
            let rows = gateway
                .filter_progress(&user.email)
                .await
                .context("failed to load progress")?;
            match rows.first() {
                Some(progress) => println!(
                    "answered {} question(s) across {} quiz(zes); {} bookmarked, {} weak",
                    progress.total_questions_answered,
                    progress.quizzes_completed,
                    progress.bookmarked_questions.len(),
                    progress.weak_questions.len()
                ),
                None => println!("no progress recorded yet"),
            }
        }
        Command::Bookmark {
            question_id,
            remove,
        } => {
            let user = require_user(controller)?;
            let existing = gateway
                .filter_progress(&user.email)
                .await
                .context("failed to load progress")?
                .into_iter()
                .next();
            let progress = match existing {
                Some(progress) => progress,
                None => gateway
                    .create_progress(&NewProgress::default())
                    .await
                    .context("failed to create progress")?,
            };
            let question_id = QuestionId(question_id);
            if progress.is_bookmarked(question_id) != remove {
                println!("question #{question_id} already in that state");
                return Ok(());
            }
            let updated = gateway
                .toggle_bookmark(&progress, question_id, !remove)
                .await
                .context("failed to update bookmarks")?;
            println!(
                "bookmarks: {}",
                updated
                    .bookmarked_questions
                    .iter()
                    .map(ToString::to_string)
                    .collect::<Vec<_>>()
                    .join(", ")
            );
        }
        Command::Attempts => {
            let user = require_user(controller)?;
            let attempts = gateway
                .filter_attempts(user.id)
                .await
                .context("failed to load quiz attempts")?;
            for attempt in &attempts {
                println!(
                    "{} {} {}/{}",
                    attempt.completed_at.format("%Y-%m-%d %H:%M"),
                    attempt.mode,
                    attempt.score,
                    attempt.total_questions
                );
            }
            println!("{} attempt(s)", attempts.len());
        }
        Command::RecordAttempt {
            mode,
            year,
            section,
            score,
            total,
        } => {
            let user = require_user(controller)?;
            if score > total {
                bail!("score {score} exceeds total {total}");
            }
            let attempt = gateway
                .create_attempt(&NewQuizAttempt {
                    mode,
                    year,
                    section,
                    score,
                    total_questions: total,
                    completed_at: Utc::now(),
                })
                .await
                .context("failed to record quiz attempt")?;

            let progress = gateway
                .filter_progress(&user.email)
                .await
                .context("failed to load progress")?
                .into_iter()
                .next();
            match progress {
                Some(progress) => {
                    gateway
                        .update_progress(
                            progress.id,
                            &ProgressPatch {
                                total_questions_answered: Some(
                                    progress.total_questions_answered + total,
                                ),
                                quizzes_completed: Some(progress.quizzes_completed + 1),
                                ..ProgressPatch::default()
                            },
                        )
                        .await
                        .context("failed to update progress")?;
                }
                None => {
                    gateway
                        .create_progress(&NewProgress {
                            total_questions_answered: total,
                            quizzes_completed: 1,
                            ..NewProgress::default()
                        })
                        .await
                        .context("failed to create progress")?;
                }
            }
            println!("recorded attempt #{} ({score}/{total})", attempt.id);
        }
        Command::Logout => {
            controller
                .logout(true)
                .await
                .context("logout task failed")?;
            if let Ok(Navigation::Reload) = navigation.try_recv() {
                println!("signed out");
            }
        }
    }
    Ok(())
}

fn report(outcome: ActionOutcome) -> Result<()> {
    if !outcome.success {
        bail!(outcome
            .message
            .unwrap_or_else(|| "action failed".to_string()));
    }
    if let Some(message) = outcome.message {
        println!("{message}");
    }
    Ok(())
}

fn require_user(controller: &SessionController) -> Result<Identity> {
    match controller.snapshot().user {
        Some(user) if controller.is_authenticated() => Ok(user),
        _ => bail!("not signed in; run `pipefit sign-in` first"),
    }
}

fn print_identity(user: &Identity) {
    println!("{} <{}>", user.full_name, user.email);
    println!("  id: {}", user.id);
    println!("  role: {:?}", user.role);
    match user.selected_year {
        Some(year) => println!("  year: {year}"),
        None => println!("  year: not selected"),
    }
}
