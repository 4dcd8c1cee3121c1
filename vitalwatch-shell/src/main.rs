use anyhow::Result;
use colored::Colorize;
use rustyline::highlight::Highlighter;
use rustyline::Editor;
use rustyline_derive::{Completer, Helper, Hinter, Validator};
use serde::Deserialize;
use std::borrow::Cow;
use std::collections::HashMap;
use std::env;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::info;
use vitalwatch::prelude::*;
use vitalwatch::{ENGINE_NAME, VERSION as LIB_VERSION};

const SHELL_VERSION: &str = env!("CARGO_PKG_VERSION");

/// A custom helper struct for rustyline that enables syntax highlighting.
#[derive(Completer, Helper, Hinter, Validator)]
struct MyHighlighter;

impl Highlighter for MyHighlighter {
    fn highlight<'l>(&self, line: &'l str, _pos: usize) -> Cow<'l, str> {
        if let Some((command, rest)) = line.split_once(' ') {
            let colored_command = command.cyan().bold();
            let colored_rest = rest.cyan();
            Cow::Owned(format!("{} {}", colored_command, colored_rest))
        } else {
            Cow::Owned(line.cyan().bold().to_string())
        }
    }
    fn highlight_char(&self, _line: &str, _pos: usize, _forced: bool) -> bool {
        true
    }
}

/// Prints the embedded banner unless the session asked for quiet.
fn print_banner() {
    if env::var("VITALWATCH_SHELL_QUIET").is_ok() {
        return;
    }
    const LOGO_TEXT: &str = include_str!("../logo.log");
    println!("{}", LOGO_TEXT.red());

    let version_string = format!(
        "          Shell   v{:<8} Library   v{:<8}",
        SHELL_VERSION, LIB_VERSION
    );

    println!(
        "{}",
        "---------------------------------------------------------------".dimmed()
    );
    println!("{}", version_string);
    println!(
        "{}",
        "\n    Alerts in this console use the log-only transport; nothing\n    leaves this machine.\n"
            .dimmed()
    );
    println!(
        "{}",
        "---------------------------------------------------------------".dimmed()
    );
}

/// Who the shell operates as and who gets alerted. Loaded from
/// `vitalshell.toml` or `VITALSHELL_*` environment variables.
#[derive(Debug, Deserialize)]
struct ShellProfile {
    #[serde(default = "default_user")]
    user: String,
    #[serde(default)]
    contacts: Vec<ContactSeed>,
}

#[derive(Debug, Deserialize)]
struct ContactSeed {
    id: u32,
    name: String,
    #[serde(default)]
    phone: Option<String>,
    #[serde(default = "default_seed_priority")]
    priority: u8,
}

// --- Default value functions for serde ---

fn default_user() -> String {
    "demo".to_string()
}

fn default_seed_priority() -> u8 {
    1
}

impl Default for ShellProfile {
    fn default() -> Self {
        Self {
            user: default_user(),
            contacts: vec![
                ContactSeed {
                    id: 1,
                    name: "Dana".to_string(),
                    phone: Some("+1-555-0101".to_string()),
                    priority: 1,
                },
                ContactSeed {
                    id: 2,
                    name: "Lee".to_string(),
                    phone: None,
                    priority: 2,
                },
            ],
        }
    }
}

fn load_profile() -> ShellProfile {
    let loaded = config::Config::builder()
        .add_source(config::File::with_name("vitalshell").required(false))
        .add_source(config::Environment::with_prefix("VITALSHELL").separator("__"))
        .build()
        .and_then(|settings| settings.try_deserialize());
    match loaded {
        Ok(profile) => profile,
        Err(err) => {
            eprintln!("Could not load a shell profile ({err}); using the built-in demo profile.");
            ShellProfile::default()
        }
    }
}

/// Spawns tasks that mirror the engine's event streams onto the console.
fn spawn_event_listeners(engine: &EscalationEngine, is_watching: Arc<AtomicBool>) {
    // Episode listener; raw ticks are gated by the shared `watch` flag.
    let mut episode_rx = engine.subscribe_episode_events();
    tokio::spawn(async move {
        while let Ok(event) = episode_rx.recv().await {
            match &event {
                EpisodeEvent::CountdownTicked { episode } => {
                    if is_watching.load(Ordering::Relaxed) && episode.seconds_remaining % 5 == 0 {
                        println!(
                            "\n<-- [COUNTDOWN] {} remaining\n>> ",
                            episode.format_remaining()
                        );
                    }
                }
                other => {
                    let episode = other.episode();
                    println!(
                        "\n<-- [EPISODE] {} => {}\n>> ",
                        episode.user_id,
                        paint_state(episode.state)
                    );
                }
            }
        }
    });

    let mut alert_rx = engine.subscribe_alert_events();
    tokio::spawn(async move {
        while let Ok(event) = alert_rx.recv().await {
            println!("\n<-- [ALERT] {:?}\n>> ", event);
        }
    });
}

fn paint_state(state: EpisodeState) -> colored::ColoredString {
    let label = state.to_string();
    match state {
        EpisodeState::Armed => label.yellow(),
        EpisodeState::Cancelled => label.green(),
        EpisodeState::Notifying => label.cyan(),
        EpisodeState::Escalated => label.red().bold(),
        EpisodeState::Resolved => label.blue(),
    }
}

fn parse_trigger(arg: &str) -> Option<TriggerKind> {
    match arg {
        "panic" => Some(TriggerKind::PanicButton),
        "auto" => Some(TriggerKind::AutoDetected),
        "manual" => Some(TriggerKind::Manual),
        _ => None,
    }
}

/// Resolves an optional `#N` argument to a session handle, falling back to
/// the most recently triggered episode.
fn episode_for_arg(
    arg: Option<&str>,
    episodes: &HashMap<usize, EpisodeId>,
    next_handle: usize,
) -> Result<(usize, EpisodeId), String> {
    match arg {
        Some(handle_str) => match handle_str.trim_start_matches('#').parse::<usize>() {
            Ok(handle) => episodes
                .get(&handle)
                .map(|id| (handle, *id))
                .ok_or_else(|| format!("no episode with handle #{handle}. Use 'history'.")),
            Err(_) => Err(format!("'{handle_str}' is not a valid handle number.")),
        },
        None => {
            let latest = next_handle.checked_sub(1);
            latest
                .and_then(|handle| episodes.get(&handle).map(|id| (handle, *id)))
                .ok_or_else(|| "no episode triggered yet. Use 'trigger' first.".to_string())
        }
    }
}

fn print_episode(handle: Option<usize>, episode: &EmergencyEpisode) {
    let handle_label = match handle {
        Some(handle) => format!("#{handle}"),
        None => "#-".to_string(),
    };
    println!(
        "  {} {} ({} remaining, {} / {}, triggered {})",
        handle_label,
        paint_state(episode.state),
        episode.format_remaining(),
        episode.trigger,
        episode.severity,
        episode.created_at.with_timezone(&chrono::Local).format("%H:%M:%S"),
    );
    if episode.dispatch_failed {
        println!("       {}", "delivery failed; follow up out of band".red());
    } else if !episode.contacts_notified.is_empty() {
        println!("       notified {} contact(s)", episode.contacts_notified.len());
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    print_banner();

    tracing_subscriber::fmt()
        .with_max_level(tracing::Level::INFO)
        .with_target(false)
        .init();

    let config = match VitalWatchConfig::load() {
        Ok(config) => config,
        Err(err) => {
            eprintln!("Could not load vitalwatch.toml ({err}); using defaults.");
            VitalWatchConfig::default()
        }
    };
    let engine = EscalationEngine::new(config, Arc::new(LogDispatcher));

    let profile = load_profile();
    let user = UserId(profile.user.clone());
    let contacts: Vec<EmergencyContact> = profile
        .contacts
        .iter()
        .map(|seed| EmergencyContact {
            phone: seed.phone.clone(),
            priority: seed.priority,
            ..EmergencyContact::new(ContactId(seed.id), seed.name.clone())
        })
        .collect();
    engine.set_contacts(user.clone(), contacts).await;
    info!(
        "Operating as '{}' with {} emergency contact(s).",
        user,
        profile.contacts.len()
    );

    // Create the shared flag for the countdown feed.
    let is_watching = Arc::new(AtomicBool::new(false));
    spawn_event_listeners(&engine, is_watching.clone());

    // The shell's state management variables.
    let mut episodes: HashMap<usize, EpisodeId> = HashMap::new();
    let mut next_handle: usize = 0;

    let mut rl = Editor::new()?;
    let helper = MyHighlighter {};
    rl.set_helper(Some(helper));

    println!(
        "{} is running. Type 'help' for commands or 'exit' to quit.",
        ENGINE_NAME.cyan()
    );

    loop {
        let prompt = format!("{}", ">> ".cyan().bold());
        let readline = rl.readline(&prompt);
        match readline {
            Ok(line) => {
                rl.add_history_entry(line.as_str())?;
                let args = line.trim().split_whitespace().collect::<Vec<_>>();

                if let Some(command) = args.first() {
                    match *command {
                        "trigger" => {
                            let mut countdown_secs = None;
                            let mut trigger = TriggerKind::PanicButton;
                            let mut bad_arg = None;
                            for arg in &args[1..] {
                                if let Ok(secs) = arg.parse::<u32>() {
                                    countdown_secs = Some(secs);
                                } else {
                                    match parse_trigger(arg) {
                                        Some(kind) => trigger = kind,
                                        None => bad_arg = Some(*arg),
                                    }
                                }
                            }
                            if let Some(arg) = bad_arg {
                                println!("Error: unknown argument '{}'.", arg);
                                println!("Usage: trigger [SECONDS] [panic|auto|manual]");
                            } else {
                                let options = EpisodeOptions {
                                    countdown_secs,
                                    ..Default::default()
                                };
                                match engine.start_episode(user.clone(), trigger, options).await {
                                    Ok(episode) => {
                                        let handle = next_handle;
                                        episodes.insert(handle, episode.id);
                                        next_handle += 1;
                                        println!(
                                            "--> Armed episode #{} with {} on the clock. 'cancel' stands it down.",
                                            handle,
                                            episode.format_remaining()
                                        );
                                    }
                                    Err(err) => println!("Error: {}", err),
                                }
                            }
                        }
                        "cancel" => {
                            match episode_for_arg(args.get(1).copied(), &episodes, next_handle) {
                                Ok((handle, id)) => match engine.cancel(id).await {
                                    Ok(episode) => println!(
                                        "--> Episode #{} cancelled with {} still on the clock.",
                                        handle,
                                        episode.format_remaining()
                                    ),
                                    Err(err) => println!("Error: {}", err),
                                },
                                Err(msg) => println!("Error: {}", msg),
                            }
                        }
                        "send" => {
                            match episode_for_arg(args.get(1).copied(), &episodes, next_handle) {
                                Ok((handle, id)) => match engine.send_now(id).await {
                                    Ok(episode) => {
                                        if episode.dispatch_failed {
                                            println!(
                                                "--> Episode #{} escalated, but no contact could be reached.",
                                                handle
                                            );
                                        } else {
                                            println!(
                                                "--> Episode #{} escalated; notified {} contact(s).",
                                                handle,
                                                episode.contacts_notified.len()
                                            );
                                        }
                                    }
                                    Err(err) => println!("Error: {}", err),
                                },
                                Err(msg) => println!("Error: {}", msg),
                            }
                        }
                        "resolve" => {
                            match episode_for_arg(args.get(1).copied(), &episodes, next_handle) {
                                Ok((handle, id)) => match engine.resolve(id).await {
                                    Ok(_) => println!("--> Episode #{} resolved.", handle),
                                    Err(err) => println!("Error: {}", err),
                                },
                                Err(msg) => println!("Error: {}", msg),
                            }
                        }
                        "status" => {
                            match episode_for_arg(args.get(1).copied(), &episodes, next_handle) {
                                Ok((handle, id)) => match engine.episode(id).await {
                                    Some(episode) => print_episode(Some(handle), &episode),
                                    None => println!("Error: episode #{} is gone.", handle),
                                },
                                Err(msg) => println!("Error: {}", msg),
                            }
                        }
                        "history" => {
                            let history = engine.history(&user).await;
                            if history.is_empty() {
                                println!("No episodes yet. Use 'trigger' to arm one.");
                            } else {
                                println!("Episodes for {} (newest first):", user);
                                for episode in &history {
                                    let handle = episodes
                                        .iter()
                                        .find(|(_, id)| **id == episode.id)
                                        .map(|(handle, _)| *handle);
                                    print_episode(handle, episode);
                                }
                            }
                        }
                        "contacts" => {
                            let contacts = engine.contacts_for(&user).await;
                            if contacts.is_empty() {
                                println!(
                                    "No contacts registered. Add [[contacts]] entries to vitalshell.toml."
                                );
                            } else {
                                println!("Emergency contacts for {}:", user);
                                for contact in &contacts {
                                    println!(
                                        "  [p{}] {:<12} {}{}",
                                        contact.priority,
                                        contact.name,
                                        contact.phone.as_deref().unwrap_or("(no phone)"),
                                        if contact.active { "" } else { "  (inactive)" }
                                    );
                                }
                            }
                        }
                        "watch" => match args.get(1) {
                            Some(&"on") => {
                                is_watching.store(true, Ordering::Relaxed);
                                println!("--> Started streaming countdown ticks.");
                            }
                            Some(&"off") => {
                                is_watching.store(false, Ordering::Relaxed);
                                println!("--> Stopped streaming countdown ticks.");
                            }
                            _ => println!("Usage: watch on|off"),
                        },
                        "help" => {
                            println!("Available commands:");
                            println!("  trigger [S] [panic|auto|manual] - Arms an episode with an S-second countdown.");
                            println!("  cancel [H]                      - Stands down an armed episode.");
                            println!("  send [H]                        - Skips the countdown; notifies contacts now.");
                            println!("  resolve [H]                     - Acknowledges an escalated episode.");
                            println!("  status [H]                      - Shows an episode (latest when H is omitted).");
                            println!("  history                         - Lists every episode for this profile.");
                            println!("  contacts                        - Shows who gets alerted.");
                            println!("  watch on|off                    - Streams countdown ticks to the console.");
                            println!("  exit                            - Quits the shell.");
                        }
                        "exit" => break,
                        _ => println!("Unknown command: '{}'. Type 'help'.", line),
                    }
                }
            }
            Err(_) => {
                println!("Exiting vitalshell...");
                break;
            }
        }
    }

    engine.shutdown().await;
    println!("{} standing down.", ENGINE_NAME.cyan());
    Ok(())
}
