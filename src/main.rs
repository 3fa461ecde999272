use anyhow::Result;
use chrono::{Local, NaiveDateTime, TimeZone, Utc};
use clap::{Parser, Subcommand};
use std::io::{self, Write};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time;

mod config;
mod crypto;
mod db;
mod keys;
mod logger;
mod notes;
mod session;
mod state;
mod store;
mod sync;

use crate::crypto::CryptoError;
use crate::notes::NotesSync;
use crate::session::{AuthPhase, Session, SyncEvent};
use crate::state::ReminderFire;
use crate::store::{AuthProvider, DocumentStore, HttpAuth, HttpStore};
use crate::sync::{StateSync, SyncError};

#[derive(Parser)]
#[command(version = config::APP_VERSION, about, long_about = None)]
struct Args {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Sign in and unlock encrypted sync
    Login {
        email: String,
        /// Read from the terminal when omitted
        #[arg(long)]
        password: Option<String>,
        /// Do not remember this device (passphrase required every launch)
        #[arg(long)]
        forget_device: bool,
    },
    /// Create an account and set up encryption
    Signup {
        email: String,
        #[arg(long)]
        password: Option<String>,
    },
    /// Sign out and drop local session material
    Logout,
    /// Show session and fast status
    Status,
    /// Start a fast
    Start {
        /// Fast type id (16_8, 18_6, 20_4, 24, 36); defaults to your usual
        fast_type: Option<String>,
    },
    /// End the running fast now
    End {
        /// Log the fast at its planned end instead of now
        #[arg(long)]
        at_goal: bool,
    },
    /// Move the start time of the running fast
    EditStart {
        /// Local time, "YYYY-MM-DD HH:MM"
        time: String,
    },
    /// Show fast history grouped by day
    History,
    /// Print history and settings as JSON
    Export,
    /// Manage notes
    #[command(subcommand)]
    Note(NoteCommands),
    /// Show or change local settings
    Config {
        /// Work from the local cache only, skip the network
        #[arg(long)]
        offline: Option<bool>,
        /// Keep the wrapped key on this device between launches
        #[arg(long)]
        remember_device: Option<bool>,
    },
    /// Follow remote changes and fire reminders until interrupted
    Watch,
}

#[derive(Subcommand)]
enum NoteCommands {
    Add { text: String },
    List,
    Edit { id: String, text: String },
    Rm { id: String },
}

/// Everything a signed-in command needs, wired together once.
struct App {
    session: Session,
    auth: HttpAuth,
    cache: db::Cache,
    state_sync: StateSync,
    notes_sync: NotesSync,
    events_rx: mpsc::UnboundedReceiver<SyncEvent>,
    remember_device: bool,
    offline_mode: bool,
}

impl App {
    fn new() -> Result<Self> {
        let app_config = config::load_config();
        let cache = db::Cache::new()?;
        let session = Session::new();
        let store: Arc<dyn DocumentStore> = Arc::new(HttpStore::new());
        let (events_tx, events_rx) = mpsc::unbounded_channel();

        let state_sync = StateSync::new(
            store.clone(),
            cache.clone(),
            session.clone(),
            events_tx.clone(),
            config::get_device_key_path(),
        );
        let notes_sync = NotesSync::new(store, cache.clone(), session.clone(), events_tx);

        Ok(Self {
            session,
            auth: HttpAuth::new(),
            cache,
            state_sync,
            notes_sync,
            events_rx,
            remember_device: app_config.general.remember_device,
            offline_mode: app_config.general.offline_mode,
        })
    }

    /// Resume the session from stored tokens and the wrapped device key.
    /// Fails with a hint to `login` when either is missing.
    async fn resume(&self) -> Result<()> {
        let user = self
            .auth
            .current_user()
            .ok_or_else(|| anyhow::anyhow!("Not signed in. Run `fastrack login <email>` first."))?;
        let uid = user.id.clone();
        self.session.begin_credentials(user);

        match self.state_sync.load(&uid, None, false).await {
            Ok(()) => {
                if let Err(e) = self.notes_sync.refresh().await {
                    logger::log(&format!("notes refresh failed: {}", e));
                }
                Ok(())
            }
            Err(SyncError::Crypto(CryptoError::MissingKey)) => {
                let password = prompt_secret("Passphrase: ")?;
                self.unlock(&uid, &password).await
            }
            Err(SyncError::Crypto(CryptoError::DecryptFailed)) => {
                eprintln!("Stored key no longer decrypts your data.");
                let password = prompt_secret("Passphrase: ")?;
                self.unlock(&uid, &password).await
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn unlock(&self, uid: &str, password: &str) -> Result<()> {
        self.state_sync
            .load(uid, Some(password), self.remember_device)
            .await?;
        if let Err(e) = self.notes_sync.refresh().await {
            logger::log(&format!("notes refresh failed: {}", e));
        }
        Ok(())
    }
}

fn prompt_secret(label: &str) -> Result<String> {
    print!("{}", label);
    io::stdout().flush()?;
    let mut line = String::new();
    io::stdin().read_line(&mut line)?;
    Ok(line.trim_end_matches(['\r', '\n']).to_string())
}

fn now_ms() -> i64 {
    Utc::now().timestamp_millis()
}

fn parse_local_time(input: &str) -> Result<i64> {
    let naive = NaiveDateTime::parse_from_str(input, "%Y-%m-%d %H:%M")
        .or_else(|_| NaiveDateTime::parse_from_str(input, "%Y-%m-%dT%H:%M"))?;
    let local = Local
        .from_local_datetime(&naive)
        .single()
        .ok_or_else(|| anyhow::anyhow!("Ambiguous local time: {}", input))?;
    Ok(local.timestamp_millis())
}

fn format_hours(ms: i64) -> String {
    format!("{:.1}h", ms as f64 / 3_600_000.0)
}

async fn handle_login(
    app: &App,
    email: &str,
    password: Option<String>,
    forget_device: bool,
) -> Result<()> {
    let password = match password {
        Some(p) => p,
        None => prompt_secret("Password: ")?,
    };

    let user = app
        .auth
        .sign_in(email, &password)
        .await
        .map_err(|e| anyhow::anyhow!("Sign-in failed: {}", e))?;
    println!("Signed in as {}", user.email);
    if !user.email_verified {
        println!("Note: your email address is not verified yet.");
    }

    let uid = user.id.clone();
    app.session.begin_credentials(user);

    let remember = app.remember_device && !forget_device;
    app.state_sync
        .load(&uid, Some(password.as_str()), remember)
        .await?;
    if forget_device {
        // An older wrapped key may still be parked locally
        let _ = keys::forget_device(&app.cache, &uid).await;
    }

    let state = app.state_sync.state();
    println!(
        "Synced. {} past fast{} on record.",
        state.history.len(),
        if state.history.len() == 1 { "" } else { "s" }
    );
    Ok(())
}

async fn handle_signup(app: &App, email: &str, password: Option<String>) -> Result<()> {
    let password = match password {
        Some(p) => p,
        None => {
            let p1 = prompt_secret("Password: ")?;
            let p2 = prompt_secret("Confirm password: ")?;
            if p1 != p2 {
                return Err(anyhow::anyhow!("Passwords do not match"));
            }
            p1
        }
    };

    let user = app
        .auth
        .sign_up(email, &password)
        .await
        .map_err(|e| anyhow::anyhow!("Sign-up failed: {}", e))?;
    println!("Account created for {}", user.email);

    let uid = user.id.clone();
    app.session.begin_credentials(user);
    app.state_sync
        .load(&uid, Some(password.as_str()), app.remember_device)
        .await?;
    println!("Encryption is set up. Your data never leaves this device unencrypted.");
    Ok(())
}

async fn handle_logout(app: &App) -> Result<()> {
    if let Some(uid) = app.session.uid().or_else(|| {
        app.auth.current_user().map(|u| u.id)
    }) {
        let _ = keys::forget_device(&app.cache, &uid).await;
        let _ = app.cache.clear_user(&uid).await;
    }
    app.auth
        .sign_out()
        .await
        .map_err(|e| anyhow::anyhow!("Sign-out failed: {}", e))?;
    app.session.sign_out();
    println!("Signed out.");
    Ok(())
}

fn print_status(app: &App) {
    match app.session.user() {
        Some(user) => println!("Signed in as {}", user.email),
        None => {
            println!("Not signed in.");
            return;
        }
    }
    if app.session.phase() != AuthPhase::Unlocked {
        println!("Encrypted data is locked.");
        return;
    }

    let state = app.state_sync.state();
    match &state.active_fast {
        Some(af) => {
            let now = now_ms();
            let label = state::fast_type(&af.type_id)
                .map(|t| t.label)
                .unwrap_or(af.type_id.as_str());
            println!(
                "Fasting ({}): {} elapsed, {} remaining",
                label,
                format_hours(af.elapsed_ms(now)),
                format_hours((af.end_timestamp - now).max(0)),
            );
        }
        None => println!("No fast running."),
    }
    println!(
        "{} completed fast{} in history.",
        state.history.len(),
        if state.history.len() == 1 { "" } else { "s" }
    );
}

async fn handle_start(app: &App, fast_type: Option<String>) -> Result<()> {
    let type_id = fast_type.unwrap_or_else(|| app.state_sync.state().settings.default_fast_type_id.clone());
    let now = now_ms();
    app.state_sync
        .mutate(|s| s.start_fast(&type_id, now).map(|af| af.end_timestamp))
        .await?
        .map(|end| {
            let label = state::fast_type(&type_id).map(|t| t.label).unwrap_or(&type_id);
            println!(
                "Started a {} fast. Goal: {}",
                label,
                Local
                    .timestamp_millis_opt(end)
                    .single()
                    .map(|dt| dt.format("%Y-%m-%d %H:%M").to_string())
                    .unwrap_or_default()
            );
        })?;
    Ok(())
}

async fn handle_end(app: &App, at_goal: bool) -> Result<()> {
    let entry = app
        .state_sync
        .mutate(|s| s.finish_fast(!at_goal, now_ms()))
        .await?;
    match entry {
        Some(e) => println!("Logged {} ({}h).", e.id, e.duration_hours),
        None => println!("No fast running."),
    }
    Ok(())
}

async fn handle_edit_start(app: &App, time: &str) -> Result<()> {
    let new_start = parse_local_time(time)?;
    app.state_sync
        .mutate(|s| s.edit_start_time(new_start))
        .await??;
    println!("Start time moved.");
    Ok(())
}

fn print_history(app: &App) {
    let state = app.state_sync.state();
    if state.history.is_empty() {
        println!("No fasts recorded yet.");
        return;
    }
    for (day, summary) in state::day_fast_map(&state.history).iter().rev() {
        println!("{}  {:.1}h total", day, summary.total_hours);
        for e in &summary.entries {
            let label = state::fast_type(&e.type_id)
                .map(|t| t.label)
                .unwrap_or(e.type_id.as_str());
            println!("  {}  {}h  {}", label, e.duration_hours, e.id);
        }
    }
    if !state.milestone_tally.is_empty() {
        let total: u32 = state.milestone_tally.values().sum();
        println!("Completed goals: {}", total);
    }
}

fn print_export(app: &App) -> Result<()> {
    let state = app.state_sync.state();
    let export = serde_json::json!({
        "settings": state.settings,
        "history": state.history,
        "milestoneTally": state.milestone_tally,
    });
    println!("{}", serde_json::to_string_pretty(&export)?);
    Ok(())
}

async fn handle_note(app: &App, cmd: NoteCommands) -> Result<()> {
    match cmd {
        NoteCommands::Add { text } => {
            let note = app
                .notes_sync
                .create(&text, &app.state_sync.state(), now_ms())
                .await?;
            if note.fast_context.was_active {
                println!(
                    "Noted ({} into the fast).",
                    format_hours(note.fast_context.elapsed_ms_at_note.unwrap_or(0))
                );
            } else {
                println!("Noted.");
            }
        }
        NoteCommands::List => {
            let notes = app.notes_sync.notes();
            if notes.is_empty() {
                println!("No notes.");
            }
            for n in notes {
                let context = if n.fast_context.was_active {
                    format!(
                        " [fasting, {}]",
                        format_hours(n.fast_context.elapsed_ms_at_note.unwrap_or(0))
                    )
                } else {
                    String::new()
                };
                println!("{}  {}{}\n  {}", n.date_key, n.id, context, n.text);
            }
        }
        NoteCommands::Edit { id, text } => {
            app.notes_sync.update(&id, &text).await?;
            println!("Updated.");
        }
        NoteCommands::Rm { id } => {
            app.notes_sync.delete(&id).await?;
            println!("Deleted.");
        }
    }
    Ok(())
}

fn handle_config(offline: Option<bool>, remember_device: Option<bool>) -> Result<()> {
    let mut app_config = config::load_config();
    if let Some(offline) = offline {
        app_config.general.offline_mode = offline;
    }
    if let Some(remember) = remember_device {
        app_config.general.remember_device = remember;
    }
    if offline.is_some() || remember_device.is_some() {
        config::save_config(&app_config)?;
    }
    println!("offline_mode = {}", app_config.general.offline_mode);
    println!("remember_device = {}", app_config.general.remember_device);
    Ok(())
}

/// Foreground loop: live subscriptions plus the reminder tick. Runs until
/// Ctrl-C; a re-auth demand from either feed prompts inline.
async fn handle_watch(app: &mut App) -> Result<()> {
    enum Pulse {
        Event(SyncEvent),
        ReminderTick,
        Quit,
    }

    let _state_listener = if app.offline_mode {
        None
    } else {
        app.state_sync.spawn_listener()
    };
    let _notes_listener = if app.offline_mode {
        None
    } else {
        app.notes_sync.spawn_listener()
    };
    let mut reminder_interval = time::interval(Duration::from_secs(30));
    println!("Watching for changes. Ctrl-C to stop.");

    loop {
        let pulse = tokio::select! {
            event = app.events_rx.recv() => match event {
                Some(e) => Pulse::Event(e),
                None => Pulse::Quit,
            },
            _ = reminder_interval.tick() => Pulse::ReminderTick,
            _ = tokio::signal::ctrl_c() => Pulse::Quit,
        };

        match pulse {
            Pulse::Event(SyncEvent::StateUpdated) => {
                println!("State updated from another device.");
                print_status(app);
            }
            Pulse::Event(SyncEvent::NotesUpdated) => {
                println!("Notes updated ({} total).", app.notes_sync.notes().len());
            }
            Pulse::Event(SyncEvent::ReauthRequired(reason)) => {
                println!("Re-authentication required: {}", reason);
                let uid = match app.session.uid() {
                    Some(uid) => uid,
                    None => break,
                };
                let password = prompt_secret("Passphrase: ")?;
                match app.unlock(&uid, &password).await {
                    Ok(()) => println!("Unlocked."),
                    Err(e) => println!("Unlock failed: {}", e),
                }
            }
            Pulse::Event(SyncEvent::RemoteWriteFailed { path }) => {
                println!(
                    "Warning: a change could not be uploaded ({}). It is safe locally and will sync later.",
                    path
                );
            }
            Pulse::Event(SyncEvent::PayloadInvalid { path }) => {
                println!(
                    "Warning: corrupted data at {}. Re-entering your passphrase will not fix this.",
                    path
                );
            }
            Pulse::ReminderTick => {
                let now = now_ms();
                let before = app.state_sync.state();
                let mut probe = before.clone();
                let fire = probe.tick_reminders(now);
                if probe != before {
                    app.state_sync
                        .mutate(|s| {
                            s.tick_reminders(now);
                        })
                        .await?;
                }
                match fire {
                    Some(ReminderFire::GoalReached) => {
                        println!("Goal reached! Your fast hit its planned duration.")
                    }
                    Some(ReminderFire::ExtraHour) => {
                        println!("Still fasting, one more hour past your goal.")
                    }
                    None => {}
                }
            }
            Pulse::Quit => {
                println!();
                break;
            }
        }
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    logger::init();
    let args = Args::parse();
    let mut app = App::new()?;

    match args.command {
        Commands::Login {
            email,
            password,
            forget_device,
        } => handle_login(&app, &email, password, forget_device).await,
        Commands::Signup { email, password } => handle_signup(&app, &email, password).await,
        Commands::Logout => handle_logout(&app).await,
        Commands::Status => {
            if app.auth.current_user().is_some() {
                app.resume().await?;
            }
            print_status(&app);
            Ok(())
        }
        Commands::Start { fast_type } => {
            app.resume().await?;
            handle_start(&app, fast_type).await
        }
        Commands::End { at_goal } => {
            app.resume().await?;
            handle_end(&app, at_goal).await
        }
        Commands::EditStart { time } => {
            app.resume().await?;
            handle_edit_start(&app, &time).await
        }
        Commands::History => {
            app.resume().await?;
            print_history(&app);
            Ok(())
        }
        Commands::Export => {
            app.resume().await?;
            print_export(&app)
        }
        Commands::Note(cmd) => {
            app.resume().await?;
            handle_note(&app, cmd).await
        }
        Commands::Config {
            offline,
            remember_device,
        } => handle_config(offline, remember_device),
        Commands::Watch => {
            app.resume().await?;
            handle_watch(&mut app).await
        }
    }
}
