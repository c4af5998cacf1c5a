use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand};
use tokio::sync::mpsc;
use tracing_subscriber::EnvFilter;

use parley_voice::audio::{AudioSink, AudioSource, CpalSink, CpalSource, SAMPLE_RATE};
use parley_voice::{
    Collaborators, Config, ConnectionState, HttpReasoningGateway, KnowledgeStore, RelayClient,
    Session, SessionEvent, SharedKnowledge, WsConnector,
};

/// Parley - realtime voice assistant client
#[derive(Parser)]
#[command(name = "parley", version, about)]
struct Cli {
    /// Relay endpoint that mints realtime connection URLs
    #[arg(long, env = "PARLEY_RELAY_URL")]
    relay_url: Option<String>,

    /// Reasoning gateway endpoint for delegated queries
    #[arg(long, env = "PARLEY_REASONING_URL")]
    reasoning_url: Option<String>,

    /// Knowledge store file; pass an empty value to disable
    #[arg(long, env = "PARLEY_KNOWLEDGE_PATH")]
    knowledge: Option<String>,

    /// Increase verbosity (-v, -vv, -vvv)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
enum Command {
    /// Test microphone input
    TestMic {
        /// Duration in seconds
        #[arg(short, long, default_value = "5")]
        duration: u64,
    },
    /// Test speaker output
    TestSpeaker,
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    // Set up logging based on verbosity
    let filter = match cli.verbose {
        0 => "info,parley_voice=info",
        1 => "info,parley_voice=debug",
        2 => "debug",
        _ => "trace",
    };

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::new(filter))
        .init();

    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            tracing::error!("fatal: {e}");
            ExitCode::FAILURE
        }
    }
}

async fn run(cli: Cli) -> anyhow::Result<()> {
    if let Some(cmd) = cli.command {
        return match cmd {
            Command::TestMic { duration } => test_mic(duration).await,
            Command::TestSpeaker => test_speaker().await,
        };
    }

    let mut config = Config::from_env();
    if let Some(url) = cli.relay_url {
        config.relay_url = url;
    }
    if let Some(url) = cli.reasoning_url {
        config.reasoning_url = url;
    }
    if let Some(path) = cli.knowledge {
        config.knowledge_path = if path.is_empty() {
            None
        } else {
            Some(path.into())
        };
    }

    tracing::info!(
        relay = %config.relay_url,
        reasoning = %config.reasoning_url,
        "starting parley"
    );

    let context = match &config.knowledge_path {
        Some(path) => {
            let store = KnowledgeStore::open(path)?;
            tracing::info!(path = %path.display(), facts = store.len(), "knowledge store loaded");
            Some(Arc::new(SharedKnowledge::new(store)) as Arc<dyn parley_voice::ContextProvider>)
        }
        None => None,
    };

    let collaborators = Collaborators {
        credentials: Arc::new(RelayClient::new(config.relay_url.clone())),
        connector: Arc::new(WsConnector),
        gateway: Arc::new(HttpReasoningGateway::new(config.reasoning_url.clone())),
        context,
        source: Box::new(CpalSource::new()),
        sink: Arc::new(CpalSink::new()?),
    };

    let mut session = Session::new(config, collaborators);
    let handle = session.handle();

    // Print the conversation as it happens.
    let mut events = session.subscribe();
    tokio::spawn(async move {
        while let Ok(event) = events.recv().await {
            match event {
                SessionEvent::TranscriptAppended(line) => println!("{line}"),
                SessionEvent::StateChanged(state) => {
                    if matches!(state, ConnectionState::Error) {
                        eprintln!("! session error, see log");
                    }
                    tracing::info!(state = %state, "session");
                }
                SessionEvent::SessionError(msg) => tracing::warn!(error = %msg, "session"),
                _ => {}
            }
        }
    });

    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("shutting down");
            handle.disconnect().await;
        }
    });

    session.connect().await;
    if session.state() == ConnectionState::Error {
        anyhow::bail!(
            "could not connect: {}",
            session.error().unwrap_or("unknown error")
        );
    }

    println!("Connected. Start talking; press Ctrl-C to quit.");
    session.run().await;
    Ok(())
}

async fn test_mic(duration: u64) -> anyhow::Result<()> {
    println!("Testing microphone for {duration} seconds...");
    println!("Speak into your microphone!\n");

    let mut source = CpalSource::new();
    let (tx, mut rx) = mpsc::channel(64);
    source.start(tx)?;
    println!("Sample rate: {SAMPLE_RATE} Hz");
    println!("---");

    let deadline = tokio::time::Instant::now() + Duration::from_secs(duration);
    let mut peak = 0.0f32;
    let mut ticker = tokio::time::interval(Duration::from_millis(200));
    while tokio::time::Instant::now() < deadline {
        tokio::select! {
            Some(frame) = rx.recv() => {
                peak = peak.max(frame.volume);
            }
            _ = ticker.tick() => {
                #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
                let meter_len = ((peak * 100.0).min(50.0)) as usize;
                let meter: String = "█".repeat(meter_len) + &" ".repeat(50 - meter_len);
                println!("RMS: {peak:.4} | [{meter}]");
                peak = 0.0;
            }
        }
    }
    source.stop();

    println!("\n---");
    println!("If you saw movement in the meter, your mic is working!");
    println!("If RMS stayed near 0, check that your mic is plugged in and");
    println!("selected as the default input device.");
    Ok(())
}

async fn test_speaker() -> anyhow::Result<()> {
    println!("Testing speaker output...");
    println!("You should hear a 440Hz tone for 2 seconds\n");

    let sink = CpalSink::new()?;

    // 2 seconds of 440Hz sine at 30% volume
    let frequency = 440.0_f32;
    let num_samples = (SAMPLE_RATE * 2) as usize;
    #[allow(clippy::cast_precision_loss, clippy::cast_possible_truncation)]
    let samples: Vec<i16> = (0..num_samples)
        .map(|i| {
            let t = i as f32 / SAMPLE_RATE as f32;
            let s = (2.0 * std::f32::consts::PI * frequency * t).sin() * 0.3;
            (s * 32767.0) as i16
        })
        .collect();

    sink.enqueue(&samples);
    tokio::time::sleep(Duration::from_millis(2_300)).await;
    drop(sink);

    println!("If you heard a tone, your speaker is working!");
    Ok(())
}
