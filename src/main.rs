use anyhow::{anyhow, Context, Result};
use clap::{Parser, Subcommand};
use log::{debug, error, info, warn, LevelFilter};
use std::io;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

mod ui;
mod utils;

use crate::ui::{ChatUI, UiAction};
use autosync::config::ClientConfig;
use autosync::display::{file_icon, format_file_size, format_time, sender_label};
use autosync::error::ClientError;
use autosync::sync::download::{download, DownloadProgress};
use autosync::sync::{
    parse_server_url, stream_url, ChatApi, ConnectionManager, Dispatcher, HttpApi, IdentityResolver, OriginClassifier,
    Reconciler, SendOutcome, SyncUpdate, UploadReceipt, WsConnector,
};

/// Command line arguments for AutoSync
#[derive(Parser, Debug)]
#[command(
    author,
    version,
    about = "AutoSync: a terminal client for a shared LAN chat and file drop.",
    long_about = "AutoSync keeps a live view of a shared message log, reconnecting on its own when the \
    server goes away. Run without a subcommand to open the chat view."
)]
struct Args {
    /// Server base URL, e.g. http://192.168.1.20:8081
    #[arg(long, env = "AUTOSYNC_SERVER", value_name = "URL")]
    server: Option<String>,

    /// Where downloaded files are saved
    #[arg(long, value_name = "DIR")]
    download_dir: Option<PathBuf>,

    /// Log file for the chat view
    #[arg(long, value_name = "PATH")]
    log_file: Option<String>,

    /// Store the effective settings as the new defaults
    #[arg(long)]
    remember: bool,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Open the live chat view (default)
    Chat,
    /// Send one text message
    Send {
        #[arg(required = true)]
        text: Vec<String>,
    },
    /// Upload one or more files
    Upload {
        #[arg(required = true)]
        paths: Vec<PathBuf>,
    },
    /// Download a file by its token
    Download {
        token: String,
        /// Name to save as; defaults to the token
        name: Option<String>,
    },
    /// Show server status
    Status,
    /// Print the message log
    History,
    /// Show this machine's address as seen by the server
    Whoami,
}

/// Completions reported back to the UI loop by background tasks
enum ActionResult {
    Sent {
        text: String,
        result: Result<SendOutcome, ClientError>,
    },
    Uploaded(Vec<(PathBuf, Result<UploadReceipt, ClientError>)>),
    DownloadProgress(DownloadProgress),
    Downloaded(Result<PathBuf, ClientError>),
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let stored = ClientConfig::load().unwrap_or_else(|e| {
        eprintln!("Warning: {}; using default settings", e);
        ClientConfig::default()
    });
    let mut config = stored.with_overrides(args.server.as_deref(), args.log_file.as_deref());
    if let Some(dir) = args.download_dir {
        config.download_dir = Some(dir);
    }

    if args.remember {
        config.save().context("Failed to save settings")?;
    }

    match args.command.unwrap_or(Command::Chat) {
        Command::Chat => run_chat(config).await,
        command => {
            env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("warn")).init();
            run_command(command, &config).await
        }
    }
}

async fn run_chat(config: ClientConfig) -> Result<()> {
    utils::setup_logging(Some(config.log_file()), LevelFilter::Debug)?;
    info!("AutoSync chat client starting up");
    info!("System information: {} {}", std::env::consts::OS, std::env::consts::ARCH);
    info!("Logging to file: {}", config.log_file());

    let base = parse_server_url(&config.server)?;
    let stream = stream_url(&base)?;
    let api: Arc<dyn ChatApi> = Arc::new(HttpApi::new(base.clone())?);

    println!("Connecting to {}... please wait...", base);
    // Resolved once, before the first snapshot can arrive
    let identity = IdentityResolver::resolve(api.as_ref()).await;

    let (manager, updates) = ConnectionManager::new(
        stream.as_str(),
        WsConnector,
        Duration::from_millis(config.reconnect_interval_ms),
    );
    let manager_task = tokio::spawn(manager.run());

    let mut terminal = ui::setup_terminal()?;
    let mut chat_ui = ChatUI::new(base.as_str());
    let reconciler = Reconciler::new(identity);

    let result = run_main_loop(&mut chat_ui, &mut terminal, api, reconciler, updates, &config).await;

    manager_task.abort();
    ui::restore_terminal(terminal)?;
    if let Err(e) = &result {
        error!("Chat view exited with error: {}", e);
    }
    info!("AutoSync shutting down");
    result
}

/// Run the main event loop
async fn run_main_loop(
    chat_ui: &mut ChatUI,
    terminal: &mut ui::Terminal<ui::CrosstermBackend<io::Stdout>>,
    api: Arc<dyn ChatApi>,
    mut reconciler: Reconciler,
    mut updates: mpsc::UnboundedReceiver<SyncUpdate>,
    config: &ClientConfig,
) -> Result<()> {
    let dispatcher = Dispatcher::new(api.clone());
    let (action_tx, mut action_rx) = mpsc::unbounded_channel::<ActionResult>();

    loop {
        terminal.draw(|f| chat_ui.draw(f))?;

        chat_ui.clean_notifications(5);

        match chat_ui.handle_input()? {
            Some(UiAction::Quit) => break,
            Some(UiAction::Send(text)) => {
                let dispatcher = dispatcher.clone();
                let tx = action_tx.clone();
                tokio::spawn(async move {
                    let result = dispatcher.send_text(&text).await;
                    let _ = tx.send(ActionResult::Sent { text, result });
                });
            }
            Some(UiAction::Upload(paths)) => {
                chat_ui.notify(format!("Uploading {} file(s)...", paths.len()));
                let dispatcher = dispatcher.clone();
                let tx = action_tx.clone();
                tokio::spawn(async move {
                    let results = dispatcher.upload_files(paths).await;
                    let _ = tx.send(ActionResult::Uploaded(results));
                });
            }
            Some(UiAction::Download(position)) => start_download(chat_ui, position, &api, config, &action_tx),
            None => {}
        }

        while let Ok(update) = updates.try_recv() {
            match update {
                SyncUpdate::State(state) => chat_ui.set_connection_state(state),
                SyncUpdate::Stream(event) => {
                    reconciler.apply(chat_ui, event);
                }
                // Stream faults only reach the log; the manager reconnects by itself
                SyncUpdate::Fault(e) => debug!("Contained stream fault: {}", e),
            }
        }

        while let Ok(result) = action_rx.try_recv() {
            handle_action_result(chat_ui, result);
        }

        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    Ok(())
}

fn start_download(
    chat_ui: &mut ChatUI,
    position: usize,
    api: &Arc<dyn ChatApi>,
    config: &ClientConfig,
    action_tx: &mpsc::UnboundedSender<ActionResult>,
) {
    if chat_ui.is_downloading() {
        chat_ui.notify_error("A download is already running");
        return;
    }

    let entry = chat_ui.log().by_position(position);
    let (token, name) = match entry.and_then(|e| e.message.file_reference().map(|f| (f, &e.message.content))) {
        Some((file, name)) => (file.token.clone(), name.clone()),
        None => {
            chat_ui.notify_error(format!("#{} is not a file", position));
            return;
        }
    };

    chat_ui.start_download(&name);
    let api = api.clone();
    let dest = config.download_dir();
    let tx = action_tx.clone();
    tokio::spawn(async move {
        let progress_tx = tx.clone();
        let result = download(api.as_ref(), &token, &name, &dest, move |progress| {
            let _ = progress_tx.send(ActionResult::DownloadProgress(progress));
        })
        .await;
        let _ = tx.send(ActionResult::Downloaded(result));
    });
}

fn handle_action_result(chat_ui: &mut ChatUI, result: ActionResult) {
    match result {
        ActionResult::Sent { text, result } => match result {
            Ok(SendOutcome::Sent { .. }) => chat_ui.clear_input_if(&text),
            Ok(SendOutcome::Empty) => {}
            Err(e) => chat_ui.notify_error(e.to_string()),
        },
        ActionResult::Uploaded(results) => {
            let failures: Vec<String> = results
                .iter()
                .filter_map(|(_, r)| r.as_ref().err().map(|e| e.to_string()))
                .collect();
            if failures.is_empty() {
                chat_ui.notify(format!("Uploaded {} file(s)", results.len()));
            } else {
                chat_ui.notify_error(failures.join("; "));
            }
        }
        ActionResult::DownloadProgress(progress) => chat_ui.update_download(progress),
        ActionResult::Downloaded(result) => {
            chat_ui.finish_download();
            match result {
                Ok(path) => chat_ui.notify(format!("Saved to {}", path.display())),
                Err(e) => chat_ui.notify_error(e.to_string()),
            }
        }
    }
}

/// One-shot commands print to stdout and exit
async fn run_command(command: Command, config: &ClientConfig) -> Result<()> {
    let base = parse_server_url(&config.server)?;
    let api: Arc<dyn ChatApi> = Arc::new(HttpApi::new(base)?);
    let dispatcher = Dispatcher::new(api.clone());

    match command {
        Command::Chat => return Err(anyhow!("the chat view is not a one-shot command")),
        Command::Send { text } => match dispatcher.send_text(&text.join(" ")).await? {
            SendOutcome::Sent { message_id } => {
                println!("Sent{}", message_id.map(|id| format!(" (id {})", id)).unwrap_or_default())
            }
            SendOutcome::Empty => println!("Nothing to send"),
        },
        Command::Upload { paths } => {
            let total = paths.len();
            let mut failed = 0;
            for (path, result) in dispatcher.upload_files(paths).await {
                match result {
                    Ok(receipt) => println!(
                        "{} uploaded{}",
                        receipt.file_name,
                        receipt.stored_as.map(|s| format!(" as {}", s)).unwrap_or_default()
                    ),
                    Err(e) => {
                        failed += 1;
                        eprintln!("{}: {}", path.display(), e);
                    }
                }
            }
            if failed > 0 {
                return Err(anyhow!("{} of {} uploads failed", failed, total));
            }
        }
        Command::Download { token, name } => {
            let name = name.unwrap_or_else(|| token.clone());
            let dest = config.download_dir();
            let path = download(api.as_ref(), &token, &name, &dest, |progress| {
                if let Some(fraction) = progress.fraction() {
                    debug!("{}: {:.0}%", token, fraction * 100.0);
                }
            })
            .await?;
            println!("Saved to {}", path.display());
        }
        Command::Status => {
            let status = api.status().await.context("Status request failed")?;
            println!("Status: {}", status.status);
            if let Some(message) = status.message {
                println!("{}", message);
            }
            if let Some(total) = status.total_messages {
                println!("Messages: {}", total);
            }
            if let Some(resources) = status.resources_loaded {
                println!("Resources loaded: {}", resources);
            }
            if let Some(dir) = status.temp_dir {
                println!("Storage: {}", dir);
            }
        }
        Command::History => {
            let identity = IdentityResolver::resolve(api.as_ref()).await;
            let history = api.messages().await.context("History request failed")?;
            if history.messages.is_empty() {
                warn!("Server returned an empty history");
            }
            for message in &history.messages {
                let sender = sender_label(identity.classify(message), &message.sender_endpoint);
                let body = match message.file_reference() {
                    Some(file) => format!(
                        "{} {} ({}) [{}]",
                        file_icon(&message.content),
                        message.content,
                        format_file_size(file.size),
                        file.token
                    ),
                    None => message.content.clone(),
                };
                println!("[{}] {}: {}", format_time(&message.timestamp), sender, body);
            }
        }
        Command::Whoami => {
            let me = api.my_ip().await.context("Address lookup failed")?;
            println!("{}", me.ip);
        }
    }

    Ok(())
}
