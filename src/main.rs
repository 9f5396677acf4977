//! oswizard - Main entry point
//!
//! Wires the engine together and drives it from a line-based prompt. The
//! real installer fronts this engine with a GUI; the binary stands in for
//! that event loop so the whole flow can be exercised end to end.

use anyhow::Result;
use std::io::BufRead;
use std::str::FromStr;
use std::sync::mpsc::{channel, Sender};
use std::sync::{Arc, Mutex};
use std::thread;
use tracing::{debug, info, warn};

use oswizard::cli::Cli;
use oswizard::config_file::{self, Loaded, RunMode};
use oswizard::navigation::Navigation;
use oswizard::pages::Page;
use oswizard::preload::{self, PreloadPool};
use oswizard::process_guard::{self, ProcessGuard};
use oswizard::scripting::InstallationPipeline;
use oswizard::store::{Dispatch, Key, Store, Value};
use oswizard::terminal::TerminalSink;

enum Event {
    /// A `displayed-page` request is pending in the store.
    Navigate,
    /// A user-facing notification was published.
    Notify(String),
    /// A line of input from the prompt.
    Input(String),
    Quit,
}

fn init_tracing() {
    use tracing_subscriber::EnvFilter;

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_writer(std::io::stderr)
        .init();
}

fn main() -> Result<()> {
    init_tracing();
    info!("oswizard starting up");

    // reaps running stage scripts on SIGINT/SIGTERM/SIGHUP
    if let Err(e) = process_guard::init_signal_handlers() {
        warn!("Failed to initialize signal handlers: {e}");
        // continue anyway, cleanup still works via Drop
    }
    let _guard = ProcessGuard::new();

    let cli = Cli::parse_args();
    let requested = RunMode::from_flags(cli.demo_mode, cli.test_mode);

    let store = Arc::new(Store::new());
    let Loaded { config, run_mode } = config_file::load(&cli.config, requested);
    let config = Arc::new(config);
    store.mark_initialized();
    store.set(Key::Version, Value::Str(env!("CARGO_PKG_VERSION").into()));
    if run_mode.is_demo() {
        info!("Running in demo mode, the system will not be altered");
    }

    let terminal = Arc::new(TerminalSink::new());
    let pipeline = InstallationPipeline::new(
        Arc::clone(&store),
        config.scripts.clone(),
        run_mode,
        Arc::clone(&terminal),
    );
    let navigation = Arc::new(Navigation::new(
        Arc::clone(&store),
        Arc::clone(&config),
        Arc::clone(&pipeline),
    ));

    let (events, inbox) = channel::<Event>();

    // store callbacks only enqueue; navigation runs on this loop
    let owner = store.new_owner();
    let navigate_events = Mutex::new(events.clone());
    store.subscribe(Key::DisplayedPage, owner, Dispatch::Deferred, move |_| {
        let _ = navigate_events.lock().expect("event sender lock").send(Event::Navigate);
    });
    let notify_events = Mutex::new(events.clone());
    store.subscribe(Key::SendNotification, owner, Dispatch::Deferred, move |value| {
        if let Value::Str(text) = value {
            let _ = notify_events
                .lock()
                .expect("event sender lock")
                .send(Event::Notify(text.clone()));
        }
    });

    // background preloads
    let preloads = PreloadPool::new(2);
    if config.internet.connection_required {
        let store = Arc::clone(&store);
        let checker_url = config.internet.checker_url.clone();
        preloads.submit(move || preload::probe_connectivity(&store, &checker_url));
    }

    // window close / Ctrl+C cancels the pipeline but rolls nothing back
    let cancel = pipeline.cancel_token();
    let quit_events = Mutex::new(events.clone());
    ctrlc::set_handler(move || {
        cancel.cancel();
        let _ = quit_events.lock().expect("event sender lock").send(Event::Quit);
    })?;

    spawn_prompt_reader(events);

    println!(
        "{} installer - type 'help' for commands",
        config.distribution_name
    );
    show_page(&navigation);

    while let Ok(event) = inbox.recv() {
        match event {
            Event::Navigate => {
                navigation.handle_request();
                show_page(&navigation);
                if navigation.current_page() == Page::Failed {
                    println!(
                        "the disk may be in an undefined state; search for help: {}",
                        config
                            .failure_help_url
                            .for_distribution(&config.distribution_name.to_string())
                    );
                }
            }
            Event::Notify(text) => println!("** {text} **"),
            Event::Input(line) => {
                if !handle_command(line.trim(), &navigation, &terminal) {
                    break;
                }
            }
            Event::Quit => break,
        }
    }

    info!("oswizard shutting down");
    Ok(())
}

/// Forward prompt lines to the event loop from a dedicated thread.
fn spawn_prompt_reader(events: Sender<Event>) {
    thread::Builder::new()
        .name("prompt-reader".into())
        .spawn(move || {
            let stdin = std::io::stdin();
            for line in stdin.lock().lines() {
                let message = match line {
                    Ok(line) => Event::Input(line),
                    Err(_) => Event::Quit,
                };
                if events.send(message).is_err() {
                    return;
                }
            }
            let _ = events.send(Event::Quit);
        })
        .expect("failed to spawn prompt reader");
}

/// Returns false when the loop should exit.
fn handle_command(command: &str, navigation: &Navigation, terminal: &TerminalSink) -> bool {
    match command.split_once(' ').map_or((command, ""), |(c, a)| (c, a)) {
        ("" | "next", _) => {
            navigation.advance(Some(navigation.current_page()));
            show_page(navigation);
        }
        ("back", _) => {
            navigation.go_backward();
            show_page(navigation);
        }
        ("goto", name) => match Page::from_str(name) {
            Ok(page) => match navigation.navigate_to_page(page) {
                Ok(()) => show_page(navigation),
                Err(e) => println!("{e}"),
            },
            Err(_) => println!("unknown page \"{name}\""),
        },
        ("pages", _) => {
            let available = navigation.available_pages();
            println!(
                "{}",
                available
                    .iter()
                    .map(Page::to_string)
                    .collect::<Vec<_>>()
                    .join(" -> ")
            );
        }
        ("console", _) => print!("{}", terminal.screen_contents()),
        ("quit" | "exit", _) => return false,
        ("help", _) => {
            println!("commands: next (or empty), back, goto <page>, pages, console, quit");
        }
        (other, _) => {
            debug!("Ignoring unknown command \"{other}\"");
            println!("unknown command \"{other}\", try 'help'");
        }
    }
    true
}

fn show_page(navigation: &Navigation) {
    println!("[{}]", navigation.current_page());
}
